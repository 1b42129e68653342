use std::path::PathBuf;

use uuid::Uuid;

use dossier_domain::Violation;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Profile {subject_id} is frozen and rejects mutations.")]
	Frozen { subject_id: Uuid },
	#[error("Profile failed validation: {}", summarize(violations))]
	Corrupt { violations: Vec<Violation> },
	#[error("Invalid evidence: {0}")]
	InvalidEvidence(Violation),
	#[error("History sequence {found} does not follow {previous}.")]
	HistoryOrder { previous: u64, found: u64 },
	#[error("Unsupported snapshot format {found:?}; expected {expected:?}.")]
	UnsupportedFormat { found: String, expected: &'static str },
	#[error("Failed to access snapshot at {path:?}.")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

fn summarize(violations: &[Violation]) -> String {
	violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
