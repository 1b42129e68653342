use std::{env, sync::Arc, thread};

use serde_json::{Map, Value, json};
use time::{Duration, OffsetDateTime, macros::datetime};
use uuid::Uuid;

use dossier_domain::{
	Correlation, Identifier, IdentifierKind, MutationOutcome, SchemaPatch, Section,
	ViolationCode,
};
use dossier_storage::{
	Error, EvidenceRecord, ExecutionHistory, HistoryEntry, InvestigationSnapshot, Outcome,
	ProfileStore,
};

const START: OffsetDateTime = datetime!(2026-04-01 12:00 UTC);

fn store() -> ProfileStore {
	ProfileStore::initialize(
		Uuid::from_u128(42),
		&[Identifier::new(IdentifierKind::Name, "Jane Doe")],
		"dossier-test",
		START,
	)
	.expect("Failed to initialize profile store.")
}

fn object(value: Value) -> Map<String, Value> {
	value.as_object().cloned().expect("Payload must be an object.")
}

fn history_entry(module: &str, outcome: Outcome) -> HistoryEntry {
	HistoryEntry {
		seq: 0,
		module_name: module.to_string(),
		pivot: "name:jane doe".to_string(),
		pivot_hash: "deadbeef".to_string(),
		timestamp: START,
		outcome,
		error_kind: None,
		attempts: 1,
		diagnostics: vec!["ok".to_string()],
		gap_score_before: 0.9,
		gap_score_after: 0.85,
	}
}

#[test]
fn rejected_patch_keeps_profile_and_annotates_evidence() {
	let store = store();
	let before = store.snapshot();
	let patch = object(json!({ "domains_whois": [{ "registrar": "Example Registrar" }] }));
	let outcome = store
		.propose_mutation("whois", Section::Digital, patch, Some(&[Section::Digital]), false, START)
		.expect("Mutation must be evaluated.");
	let MutationOutcome::Rejected { violations } = outcome else {
		panic!("Expected the patch to be rejected.");
	};

	assert_eq!(violations[0].code, ViolationCode::UnknownField);
	assert_eq!(violations[0].path(), "digital.domains_whois");
	assert_eq!(store.snapshot().section(Section::Digital), before.section(Section::Digital));

	let receipt = store
		.record_evidence(
			EvidenceRecord {
				source: "whois".to_string(),
				identifier: "example.com".to_string(),
				kind: "whois".to_string(),
				payload: object(json!({ "registrar": "Example Registrar" })),
				rejection: violations,
				..EvidenceRecord::default()
			},
			START,
		)
		.expect("Evidence must be recorded.");
	let profile = store.snapshot();
	let entry = &profile.enrichment().raw_results()[0];

	assert_eq!(receipt.seq, 1);
	assert_eq!(entry.kind, "whois");
	assert_eq!(entry.payload["error"]["fields"], json!(["digital.domains_whois"]));
	assert_eq!(entry.payload["registrar"], json!("Example Registrar"));
	assert_eq!(profile.enrichment().sources(), ["whois".to_string()]);
}

#[test]
fn snapshots_are_isolated_from_later_writes() {
	let store = store();
	let early = store.snapshot();
	let patch = SchemaPatch::new().set(Section::Geo, "cities", json!(["Hobart"]));

	store.apply_patch("geo", &patch, None, false, START).expect("Patch must apply.");

	assert!(early.section(Section::Geo).is_some_and(Map::is_empty));
	assert_eq!(
		store.snapshot().section(Section::Geo).map(|geo| geo["cities"].clone()),
		Some(json!(["Hobart"]))
	);
}

#[test]
fn concurrent_writers_merge_one_at_a_time() {
	let store = Arc::new(store());

	thread::scope(|scope| {
		for idx in 0..8 {
			let store = Arc::clone(&store);

			scope.spawn(move || {
				let patch = SchemaPatch::new()
					.set(Section::Contact, "usernames", json!([format!("jdoe{idx}")]))
					.set(Section::Digital, "exposed_ports", json!([8000 + idx]));

				store
					.apply_patch(&format!("m{idx}"), &patch, None, false, START)
					.expect("Patch must apply.");
			});
		}
	});

	let profile = store.snapshot();
	let usernames = profile
		.section(Section::Contact)
		.and_then(|contact| contact["usernames"].as_array().cloned());

	assert_eq!(usernames.map(|items| items.len()), Some(8));
	assert_eq!(profile.audit().len(), 9);
	assert!(store.validate().is_ok());
}

#[test]
fn ledger_only_grows_between_snapshots() {
	let store = store();
	let record = |payload: Value| EvidenceRecord {
		source: "crtsh".to_string(),
		identifier: "example.com".to_string(),
		kind: "certificate_transparency".to_string(),
		payload: object(payload),
		correlations: vec![Correlation {
			identifier: "example.com".to_string(),
			source: "crtsh".to_string(),
			field: "digital.domains".to_string(),
			confidence: 1.5,
		}],
		..EvidenceRecord::default()
	};

	let receipt = store.record_evidence(record(json!({ "hosts": 3 })), START).expect("record");

	assert_eq!(receipt.dropped.len(), 1);

	let first = store.snapshot();

	store.record_evidence(record(json!({ "hosts": 5 })), START).expect("record");
	store
		.append_correction(receipt.seq, object(json!({ "hosts": 4 })), "crtsh", START)
		.expect("correction");

	let second = store.snapshot();
	let (old, new) = (first.enrichment().raw_results(), second.enrichment().raw_results());

	assert_eq!(new.len(), 3);
	assert_eq!(&new[..old.len()], old);
	assert_eq!(new[2].supersedes(), Some(receipt.seq));
	assert!(second.enrichment().correlations().is_empty());
}

#[test]
fn frozen_profile_rejects_every_write() {
	let store = store();

	store.freeze().expect("freeze");

	let patch = SchemaPatch::new().set(Section::Geo, "cities", json!(["Perth"]));
	let err = store.apply_patch("geo", &patch, None, false, START).expect_err("frozen");

	assert!(matches!(err, Error::Frozen { .. }));
	assert!(matches!(
		store.record_evidence(EvidenceRecord::default(), START),
		Err(Error::Frozen { .. })
	));
	assert!(store.freeze().is_ok());
}

#[test]
fn snapshot_export_is_deterministic_and_round_trips() {
	let store = store();
	let history = ExecutionHistory::new();
	let patch = SchemaPatch::new()
		.set(Section::Business, "company_names", json!(["Acme Pty Ltd"]))
		.set(Section::Risk, "exposure_score", json!(0.1 + 0.2));

	store.apply_patch("abn", &patch, None, false, START + Duration::seconds(5)).expect("apply");
	store
		.record_evidence(
			EvidenceRecord {
				source: "abn".to_string(),
				identifier: "Acme Pty Ltd".to_string(),
				kind: "abn".to_string(),
				payload: object(json!({ "z": 1, "a": { "y": [3, 2, 1], "b": null } })),
				..EvidenceRecord::default()
			},
			START,
		)
		.expect("record");
	history.append(history_entry("abn", Outcome::Success));
	history.append(history_entry("crtsh", Outcome::Failure));

	let snapshot = InvestigationSnapshot::capture(&store, &history);
	let first = snapshot.to_canonical_bytes().expect("export");
	let second =
		InvestigationSnapshot::capture(&store, &history).to_canonical_bytes().expect("export");
	let decoded = InvestigationSnapshot::from_bytes(&first).expect("import");

	assert_eq!(first, second);
	assert_eq!(decoded, snapshot);
	assert_eq!(decoded.to_canonical_bytes().expect("re-export"), first);

	let path = env::temp_dir().join(format!("dossier_snapshot_test_{}.json", std::process::id()));

	snapshot.write(&path).expect("write");

	let (restored, restored_history) =
		InvestigationSnapshot::read(&path).expect("read").restore().expect("restore");

	std::fs::remove_file(&path).expect("cleanup");

	assert_eq!(*restored.snapshot(), snapshot.profile);
	assert_eq!(restored_history.len(), 2);
}

#[test]
fn unknown_snapshot_format_is_refused() {
	let mut value = serde_json::to_value(InvestigationSnapshot::new(
		(*store().snapshot()).clone(),
		Vec::new(),
	))
	.expect("to value");

	value["format"] = json!("dossier.snapshot.v0");

	let bytes = serde_json::to_vec(&value).expect("bytes");

	assert!(matches!(
		InvestigationSnapshot::from_bytes(&bytes),
		Err(Error::UnsupportedFormat { .. })
	));
}
