use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use dossier_domain::{
	Correlation, Identifier, MutationOutcome, Profile, SchemaPatch, Scores, Section, Signals,
	Violation, enrichment::ERROR_KEY,
};

use crate::{Error, Result};

/// One completed attempt's unstructured output, bound for the evidence ledger.
#[derive(Clone, Debug, Default)]
pub struct EvidenceRecord {
	pub source: String,
	pub identifier: String,
	pub kind: String,
	pub payload: Map<String, Value>,
	pub identifiers: Vec<Identifier>,
	pub correlations: Vec<Correlation>,
	pub signals: Signals,
	/// Violations of the structured patch that accompanied this payload, if it was rejected.
	pub rejection: Vec<Violation>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvidenceReceipt {
	pub seq: u64,
	pub new_identifiers: Vec<Identifier>,
	/// Correlations or signals the ledger refused. The raw payload is kept regardless.
	pub dropped: Vec<Violation>,
}

/// Single-writer owner of one subject's profile.
///
/// Readers take an `Arc` snapshot; a writer that finds snapshots outstanding clones the profile
/// before mutating, so readers never observe a partial merge and never wait on the merge lock
/// longer than one pointer copy.
#[derive(Debug)]
pub struct ProfileStore {
	profile: Mutex<Arc<Profile>>,
}
impl ProfileStore {
	pub fn new(profile: Profile) -> Result<Self> {
		let violations = profile.validate();

		if !violations.is_empty() {
			return Err(Error::Corrupt { violations });
		}

		Ok(Self { profile: Mutex::new(Arc::new(profile)) })
	}

	pub fn initialize(
		subject_id: Uuid,
		seeds: &[Identifier],
		tool: &str,
		now: OffsetDateTime,
	) -> Result<Self> {
		let mut profile = Profile::initialize(subject_id, seeds, now)
			.map_err(|violations| Error::Corrupt { violations })?;

		profile.enrichment_mut().set_metadata(tool, now);

		Self::new(profile)
	}

	pub fn snapshot(&self) -> Arc<Profile> {
		Arc::clone(&self.lock())
	}

	pub fn is_frozen(&self) -> bool {
		self.lock().is_frozen()
	}

	/// Single-section form of [`ProfileStore::apply_patch`].
	pub fn propose_mutation(
		&self,
		module: &str,
		section: Section,
		patch: Map<String, Value>,
		declared: Option<&[Section]>,
		force: bool,
		now: OffsetDateTime,
	) -> Result<MutationOutcome> {
		let mut schema_patch = SchemaPatch::new();

		for (field, value) in patch {
			schema_patch.insert(section, &field, value);
		}

		self.apply_patch(module, &schema_patch, declared, force, now)
	}

	/// Applies a multi-section patch atomically. Rejections leave the profile untouched and are
	/// returned as a value; only a frozen or corrupted profile is an error.
	pub fn apply_patch(
		&self,
		module: &str,
		patch: &SchemaPatch,
		declared: Option<&[Section]>,
		force: bool,
		now: OffsetDateTime,
	) -> Result<MutationOutcome> {
		let mut guard = self.lock();

		ensure_mutable(&guard)?;

		let violations = guard.check_patch(patch, declared, force);

		if !violations.is_empty() {
			return Ok(MutationOutcome::Rejected { violations });
		}

		Ok(Arc::make_mut(&mut guard).apply_patch(module, patch, declared, force, now))
	}

	/// Appends the payload to the ledger and merges identifiers, correlations, signals and the
	/// source label. Rejected patches annotate the payload with an `error` object.
	pub fn record_evidence(
		&self,
		mut record: EvidenceRecord,
		now: OffsetDateTime,
	) -> Result<EvidenceReceipt> {
		if !record.rejection.is_empty() {
			annotate_rejection(&mut record.payload, &record.rejection);
		}

		let mut guard = self.lock();

		ensure_mutable(&guard)?;

		let ledger = Arc::make_mut(&mut guard).enrichment_mut();
		let seq = ledger.append_raw(
			&record.identifier,
			&record.kind,
			record.payload,
			&record.source,
			now,
		);
		let mut dropped = Vec::new();
		let mut new_identifiers = Vec::new();

		ledger.record_source(&record.source);

		for identifier in record.identifiers {
			if ledger.record_identifier(identifier.clone()) {
				new_identifiers.push(identifier);
			}
		}
		for correlation in record.correlations {
			if let Err(violation) = ledger.record_correlation(correlation) {
				dropped.push(violation);
			}
		}
		if let Err(violation) = ledger.merge_signals(&record.signals) {
			dropped.push(violation);
		}

		Ok(EvidenceReceipt { seq, new_identifiers, dropped })
	}

	pub fn append_correction(
		&self,
		supersedes: u64,
		payload: Map<String, Value>,
		source: &str,
		now: OffsetDateTime,
	) -> Result<u64> {
		let mut guard = self.lock();

		ensure_mutable(&guard)?;

		Arc::make_mut(&mut guard)
			.enrichment_mut()
			.append_correction(supersedes, payload, source, now)
			.map_err(Error::InvalidEvidence)
	}

	pub fn set_scores(&self, scores: Scores, now: OffsetDateTime) -> Result<()> {
		let mut guard = self.lock();

		ensure_mutable(&guard)?;

		let profile = Arc::make_mut(&mut guard);
		let tool = profile.enrichment().metadata().tool.clone();

		profile.enrichment_mut().set_scores(scores);
		profile.enrichment_mut().set_metadata(&tool, now);

		Ok(())
	}

	/// Marks the profile read-only. Idempotent.
	pub fn freeze(&self) -> Result<()> {
		let mut guard = self.lock();

		if guard.is_frozen() {
			return Ok(());
		}

		Arc::make_mut(&mut guard).freeze();

		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		let violations = self.lock().validate();

		if violations.is_empty() { Ok(()) } else { Err(Error::Corrupt { violations }) }
	}

	fn lock(&self) -> MutexGuard<'_, Arc<Profile>> {
		self.profile.lock().unwrap_or_else(|err| err.into_inner())
	}
}

fn ensure_mutable(profile: &Profile) -> Result<()> {
	if profile.is_frozen() {
		return Err(Error::Frozen { subject_id: profile.subject_id() });
	}

	Ok(())
}

fn annotate_rejection(payload: &mut Map<String, Value>, violations: &[Violation]) {
	let fields: Vec<String> = violations.iter().map(Violation::path).collect();
	let details: Vec<Value> = violations
		.iter()
		.map(|violation| {
			json!({
				"path": violation.path(),
				"code": violation.code.as_str(),
				"message": violation.message,
			})
		})
		.collect();

	payload.insert(
		ERROR_KEY.to_string(),
		json!({ "reason": "schema_violation", "fields": fields, "violations": details }),
	);
}
