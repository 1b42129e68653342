//! Investigation state machine: plan, execute a batch, rescore, repeat.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use dossier_config::Config;
use dossier_domain::{Identifier, Scores, schema, scoring};
use dossier_storage::{
	ErrorKind, ExecutionHistory, HistoryEntry, InvestigationSnapshot, ProfileStore,
};

use crate::{
	Error, LookupContext, Registry, Result,
	investigation::{Investigation, Task},
	planner::{self, PlanContext},
	runner::{CancelToken, ModuleRunner},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
	Init,
	Planning,
	Executing,
	Scoring,
	Done,
	Halted,
}
impl EngineState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Init => "init",
			Self::Planning => "planning",
			Self::Executing => "executing",
			Self::Scoring => "scoring",
			Self::Done => "done",
			Self::Halted => "halted",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "message")]
pub enum StopReason {
	GapThreshold,
	BudgetExhausted,
	NoSuggestions,
	Cancelled,
	PlannerInvariant(String),
	Corrupt(String),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
	pub state: EngineState,
	pub reason: StopReason,
	/// Module runs recorded in history, including those restored from a snapshot.
	pub runs: usize,
	pub gap: f64,
	pub scores: Scores,
}

pub struct Engine {
	cfg: Config,
	registry: Registry,
	investigation: Investigation,
	contexts: BTreeMap<String, Arc<LookupContext>>,
	cancel: CancelToken,
	state: EngineState,
}
impl Engine {
	/// Fails when a weight table names an unknown section or field, or when the profile is
	/// already frozen.
	pub fn new(
		cfg: Config,
		registry: Registry,
		store: Arc<ProfileStore>,
		history: Arc<ExecutionHistory>,
	) -> Result<Self> {
		for (label, section_weights, field_weights) in [
			("planner", &cfg.planner.section_weights, &cfg.planner.field_weights),
			("scoring", &cfg.scoring.section_weights, &cfg.scoring.field_weights),
		] {
			schema::check_weight_keys(label, section_weights, field_weights)
				.map_err(|message| Error::Config { message })?;
		}

		if store.is_frozen() {
			return Err(Error::Finished);
		}

		let contexts = registry
			.names()
			.map(|name| {
				let ctx = LookupContext {
					credentials: cfg.credentials.clone(),
					settings: cfg.modules.get(name).cloned().unwrap_or_default(),
				};

				(name.to_string(), Arc::new(ctx))
			})
			.collect();
		let runner = Arc::new(ModuleRunner::new(cfg.runner.clone()));
		let investigation = Investigation::new(
			store,
			history,
			runner,
			cfg.planner.clone(),
			cfg.engine.max_concurrency as usize,
		);

		Ok(Self {
			cfg,
			registry,
			investigation,
			contexts,
			cancel: CancelToken::new(),
			state: EngineState::Init,
		})
	}

	/// Starts a new investigation for a fresh subject.
	pub fn from_seeds(
		cfg: Config,
		registry: Registry,
		seeds: &[Identifier],
		now: OffsetDateTime,
	) -> Result<Self> {
		let store = ProfileStore::initialize(Uuid::new_v4(), seeds, &cfg.service.tool_name, now)?;

		Self::new(cfg, registry, Arc::new(store), Arc::new(ExecutionHistory::new()))
	}

	/// Continues a halted investigation from its persisted state.
	pub fn resume(
		cfg: Config,
		registry: Registry,
		snapshot: InvestigationSnapshot,
	) -> Result<Self> {
		let (store, history) = snapshot.restore()?;

		Self::new(cfg, registry, Arc::new(store), Arc::new(history))
	}

	pub fn state(&self) -> EngineState {
		self.state
	}

	pub fn cancel_token(&self) -> CancelToken {
		self.cancel.clone()
	}

	pub fn store(&self) -> &Arc<ProfileStore> {
		self.investigation.store()
	}

	pub fn history(&self) -> &Arc<ExecutionHistory> {
		self.investigation.history()
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	pub fn snapshot(&self) -> InvestigationSnapshot {
		InvestigationSnapshot::capture(self.store(), self.history())
	}

	/// Drives the investigation until it finishes or halts.
	///
	/// Module failures never surface here; they are recorded in history. A halted run returns
	/// `Ok` with [`EngineState::Halted`] and can be resumed from [`Engine::snapshot`].
	pub async fn run(&mut self) -> Result<RunSummary> {
		if self.state == EngineState::Done || self.store().is_frozen() {
			return Err(Error::Finished);
		}

		tracing::info!(
			subject_id = %self.store().snapshot().subject_id(),
			modules = self.registry.len(),
			resumed_runs = self.history().len(),
			"Investigation started."
		);

		self.transition(EngineState::Planning);

		loop {
			if self.cancel.is_cancelled() {
				return Ok(self.halt(StopReason::Cancelled));
			}

			let now = OffsetDateTime::now_utc();
			let profile = self.store().snapshot();
			let gap = planner::analyze_gaps(&profile, &self.cfg.planner, now).overall;

			if gap < self.cfg.engine.stop_gap_threshold {
				return self.finish(StopReason::GapThreshold);
			}

			let runs = self.history().len();
			let budget = self.cfg.engine.module_budget as usize;

			if runs >= budget {
				return self.finish(StopReason::BudgetExhausted);
			}

			let mut ctx = PlanContext::new(now);

			ctx.quarantined = self.investigation.runner().quarantined();

			let history = self.history().snapshot();
			let take = (self.cfg.engine.batch_size as usize).min(budget - runs);
			let suggestions = match planner::plan_batch(
				&profile,
				&history,
				&self.registry,
				&self.cfg.planner,
				&ctx,
				take,
			) {
				Ok(suggestions) => suggestions,
				Err(err) => {
					tracing::error!(error = %err, "Planner invariant violated.");

					return Ok(self.halt(StopReason::PlannerInvariant(err.to_string())));
				},
			};

			if suggestions.is_empty() {
				return self.finish(StopReason::NoSuggestions);
			}

			let tasks: Vec<Task> = suggestions
				.into_iter()
				.filter_map(|suggestion| {
					let lookup = Arc::clone(self.registry.get(&suggestion.module)?);
					let ctx = Arc::clone(self.contexts.get(&suggestion.module)?);

					Some(Task { suggestion, lookup, ctx })
				})
				.collect();

			let batch: Vec<&str> =
				tasks.iter().map(|task| task.suggestion.module.as_str()).collect();

			tracing::info!(gap, ?batch, "Executing batch.");

			self.transition(EngineState::Executing);

			let entries = match self.investigation.execute_batch(tasks, &self.cancel).await {
				Ok(entries) => entries,
				Err(err) => return Ok(self.halt(StopReason::Corrupt(err.to_string()))),
			};

			self.transition(EngineState::Scoring);

			if let Err(err) = self.rescore(OffsetDateTime::now_utc()) {
				return Ok(self.halt(StopReason::Corrupt(err.to_string())));
			}

			if all_short_circuited(&entries) {
				self.wait_for_breaker().await;
			}

			self.transition(EngineState::Planning);
		}
	}

	fn transition(&mut self, next: EngineState) {
		tracing::debug!(from = self.state.as_str(), to = next.as_str(), "Engine state changed.");

		self.state = next;
	}

	fn rescore(&self, now: OffsetDateTime) -> Result<Scores> {
		let scores = scoring::score(&self.store().snapshot(), &self.cfg.scoring, now);

		self.store().set_scores(scores, now)?;

		Ok(scores)
	}

	fn finish(&mut self, reason: StopReason) -> Result<RunSummary> {
		let now = OffsetDateTime::now_utc();

		if self.state != EngineState::Scoring {
			self.transition(EngineState::Scoring);
		}

		let scores = match self.rescore(now) {
			Ok(scores) => scores,
			Err(err) => return Ok(self.halt(StopReason::Corrupt(err.to_string()))),
		};

		self.store().freeze()?;
		self.transition(EngineState::Done);

		let summary = self.summary(reason, scores, now);

		tracing::info!(
			reason = ?summary.reason,
			runs = summary.runs,
			gap = summary.gap,
			completeness = scores.completeness,
			risk = scores.risk,
			"Investigation finished."
		);

		Ok(summary)
	}

	fn halt(&mut self, reason: StopReason) -> RunSummary {
		let now = OffsetDateTime::now_utc();
		let scores = self.store().snapshot().enrichment().scores();

		self.transition(EngineState::Halted);

		let summary = self.summary(reason, scores, now);

		tracing::warn!(reason = ?summary.reason, runs = summary.runs, "Investigation halted.");

		summary
	}

	fn summary(&self, reason: StopReason, scores: Scores, now: OffsetDateTime) -> RunSummary {
		let gap = planner::analyze_gaps(&self.store().snapshot(), &self.cfg.planner, now).overall;

		RunSummary { state: self.state, reason, runs: self.history().len(), gap, scores }
	}

	/// Sleeps until the earliest open breaker closes, unless cancelled first.
	async fn wait_for_breaker(&self) {
		let Some(reset) = self.investigation.runner().next_breaker_reset() else { return };

		tracing::info!("Every lookup in the batch short-circuited; waiting for a breaker reset.");

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => {},
			_ = tokio::time::sleep_until(reset) => {},
		}
	}
}

fn all_short_circuited(entries: &[HistoryEntry]) -> bool {
	!entries.is_empty()
		&& entries.iter().all(|entry| entry.error_kind == Some(ErrorKind::CircuitOpen))
}
