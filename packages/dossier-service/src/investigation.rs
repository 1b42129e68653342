use std::{collections::HashMap, sync::Arc};

use time::OffsetDateTime;
use tokio::{
	sync::Semaphore,
	task::{Id, JoinSet},
};

use dossier_config::Planner;
use dossier_domain::MutationOutcome;
use dossier_storage::{
	ErrorKind, EvidenceRecord, ExecutionHistory, HistoryEntry, Outcome, ProfileStore,
};

use crate::{
	Lookup, LookupContext, Result,
	planner::{self, Suggestion},
	runner::{AttemptReport, AttemptResult, CancelToken, ModuleRunner},
};

/// A planned module run.
#[derive(Clone)]
pub struct Task {
	pub suggestion: Suggestion,
	pub lookup: Arc<dyn Lookup>,
	pub ctx: Arc<LookupContext>,
}

/// Runs batches of lookups against one profile and commits their results.
pub struct Investigation {
	store: Arc<ProfileStore>,
	history: Arc<ExecutionHistory>,
	runner: Arc<ModuleRunner>,
	planner: Planner,
	max_concurrency: usize,
}
impl Investigation {
	pub fn new(
		store: Arc<ProfileStore>,
		history: Arc<ExecutionHistory>,
		runner: Arc<ModuleRunner>,
		planner: Planner,
		max_concurrency: usize,
	) -> Self {
		Self { store, history, runner, planner, max_concurrency: max_concurrency.max(1) }
	}

	pub fn store(&self) -> &Arc<ProfileStore> {
		&self.store
	}

	pub fn history(&self) -> &Arc<ExecutionHistory> {
		&self.history
	}

	pub fn runner(&self) -> &Arc<ModuleRunner> {
		&self.runner
	}

	/// Runs every task with bounded concurrency against one profile snapshot and commits each
	/// result as it completes. Returns the appended history entries in completion order.
	///
	/// Only a frozen or corrupted profile is an error; module failures become history entries.
	pub async fn execute_batch(
		&self,
		tasks: Vec<Task>,
		cancel: &CancelToken,
	) -> Result<Vec<HistoryEntry>> {
		let snapshot = self.store.snapshot();
		let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
		let mut pending: HashMap<Id, Task> = HashMap::new();
		let mut set = JoinSet::new();
		let mut committed = Vec::with_capacity(tasks.len());

		for task in tasks {
			let runner = Arc::clone(&self.runner);
			let lookup = Arc::clone(&task.lookup);
			let ctx = Arc::clone(&task.ctx);
			let profile = Arc::clone(&snapshot);
			let cancel = cancel.clone();
			let semaphore = Arc::clone(&semaphore);
			let handle = set.spawn(async move {
				let _permit = semaphore.acquire_owned().await;

				runner.run(lookup, profile, ctx, cancel).await
			});

			pending.insert(handle.id(), task);
		}

		while let Some(joined) = set.join_next_with_id().await {
			let (id, report) = match joined {
				Ok((id, report)) => (id, report),
				Err(err) => {
					let id = err.id();
					let Some(task) = pending.get(&id) else { continue };
					let descriptor = task.lookup.descriptor();

					self.runner.record_crash(&descriptor.name, &descriptor.rate_class);

					let report = AttemptReport {
						module: task.suggestion.module.clone(),
						attempts: 1,
						result: AttemptResult::Failed {
							kind: ErrorKind::Exception,
							message: format!("lookup task failed: {err}"),
						},
					};

					(id, report)
				},
			};
			let Some(task) = pending.remove(&id) else { continue };

			committed.push(self.commit(&task, report, OffsetDateTime::now_utc())?);
		}

		Ok(committed)
	}

	/// Records one finished run: patch to the store, raw payload to the ledger, entry to history.
	pub fn commit(
		&self,
		task: &Task,
		report: AttemptReport,
		now: OffsetDateTime,
	) -> Result<HistoryEntry> {
		let descriptor = task.lookup.descriptor();
		let gap_score_before = self.overall_gap(now);
		let (outcome, error_kind, diagnostics) = match report.result {
			AttemptResult::Completed(result) => {
				let failed = result.status == Outcome::Failure;
				let mut diagnostics = result.diagnostics;
				let rejection = if failed {
					tracing::warn!(
						module = %descriptor.name,
						"Lookup reported failure; patch discarded."
					);

					Vec::new()
				} else {
					let mutation = self.store.apply_patch(
						&descriptor.name,
						&result.schema_patch,
						Some(descriptor.declared_output_sections.as_slice()),
						false,
						now,
					)?;

					match mutation {
						MutationOutcome::Applied { fields_changed } => {
							tracing::info!(
								module = %descriptor.name,
								fields_changed = fields_changed.len(),
								"Patch applied."
							);

							Vec::new()
						},
						MutationOutcome::Rejected { violations } => {
							tracing::warn!(
								module = %descriptor.name,
								violations = violations.len(),
								"Patch rejected."
							);

							diagnostics.extend(violations.iter().map(ToString::to_string));

							violations
						},
					}
				};
				let rejected = !rejection.is_empty();
				// A failed outcome keeps its raw payload but makes no claims about the subject.
				let record = if failed {
					EvidenceRecord {
						source: descriptor.name.clone(),
						identifier: result.raw.identifier,
						kind: result.raw.kind,
						payload: result.raw.payload,
						..EvidenceRecord::default()
					}
				} else {
					EvidenceRecord {
						source: descriptor.name.clone(),
						identifier: result.raw.identifier,
						kind: result.raw.kind,
						payload: result.raw.payload,
						identifiers: result.identifiers,
						correlations: result.correlations,
						signals: result.signals,
						rejection,
					}
				};
				let receipt = self.store.record_evidence(record, now)?;

				diagnostics.extend(receipt.dropped.iter().map(ToString::to_string));

				if failed {
					(Outcome::Failure, Some(ErrorKind::Exception), diagnostics)
				} else if rejected {
					(Outcome::Partial, Some(ErrorKind::ValidationError), diagnostics)
				} else {
					(result.status, None, diagnostics)
				}
			},
			AttemptResult::Failed { kind, message } => {
				tracing::warn!(
					module = %descriptor.name,
					error_kind = kind.as_str(),
					%message,
					"Lookup failed."
				);

				(Outcome::Failure, Some(kind), vec![message])
			},
		};
		let gap_score_after = self.overall_gap(now);
		let mut entry = HistoryEntry {
			seq: 0,
			module_name: descriptor.name.clone(),
			pivot: task.suggestion.pivot.clone(),
			pivot_hash: task.suggestion.pivot_hash.clone(),
			timestamp: now,
			outcome,
			error_kind,
			attempts: report.attempts,
			diagnostics,
			gap_score_before,
			gap_score_after,
		};

		entry.seq = self.history.append(entry.clone());

		Ok(entry)
	}

	fn overall_gap(&self, now: OffsetDateTime) -> f64 {
		planner::analyze_gaps(&self.store.snapshot(), &self.planner, now).overall
	}
}
