use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
	Success,
	Partial,
	Failure,
}
impl Outcome {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Success => "success",
			Self::Partial => "partial",
			Self::Failure => "failure",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Timeout,
	HttpError,
	ValidationError,
	Exception,
	CircuitOpen,
	Cancelled,
}
impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Timeout => "timeout",
			Self::HttpError => "http_error",
			Self::ValidationError => "validation_error",
			Self::Exception => "exception",
			Self::CircuitOpen => "circuit_open",
			Self::Cancelled => "cancelled",
		}
	}

	/// Short-circuited and cancelled attempts never produced a result from the source.
	pub fn reached_source(self) -> bool {
		!matches!(self, Self::CircuitOpen | Self::Cancelled)
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
	/// Assigned on append; the value passed in is ignored.
	pub seq: u64,
	pub module_name: String,
	pub pivot: String,
	pub pivot_hash: String,
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
	pub outcome: Outcome,
	pub error_kind: Option<ErrorKind>,
	pub attempts: u32,
	pub diagnostics: Vec<String>,
	pub gap_score_before: f64,
	pub gap_score_after: f64,
}
impl HistoryEntry {
	/// Whether this entry blocks rescheduling the same module for the same input hash.
	pub fn counts_for_dedup(&self) -> bool {
		self.error_kind.is_none_or(ErrorKind::reached_source)
	}

	pub fn is_failure(&self) -> bool {
		self.outcome == Outcome::Failure
	}
}

/// Attempt log in completion order.
#[derive(Debug, Default)]
pub struct ExecutionHistory {
	entries: Mutex<Vec<HistoryEntry>>,
}
impl ExecutionHistory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Restores a persisted log. Sequence numbers must be strictly increasing.
	pub fn from_entries(entries: Vec<HistoryEntry>) -> Result<Self> {
		let mut previous = 0;

		for entry in &entries {
			if entry.seq <= previous {
				return Err(Error::HistoryOrder { previous, found: entry.seq });
			}

			previous = entry.seq;
		}

		Ok(Self { entries: Mutex::new(entries) })
	}

	pub fn append(&self, mut entry: HistoryEntry) -> u64 {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		entry.seq = entries.last().map_or(1, |last| last.seq + 1);

		let seq = entry.seq;

		entries.push(entry);

		seq
	}

	pub fn snapshot(&self) -> Vec<HistoryEntry> {
		self.entries.lock().unwrap_or_else(|err| err.into_inner()).clone()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn entries_for(&self, module_name: &str) -> Vec<HistoryEntry> {
		self.entries
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.iter()
			.filter(|entry| entry.module_name == module_name)
			.cloned()
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::*;

	fn entry(module: &str, error_kind: Option<ErrorKind>) -> HistoryEntry {
		HistoryEntry {
			seq: 0,
			module_name: module.to_string(),
			pivot: "name:jane doe".to_string(),
			pivot_hash: "h".to_string(),
			timestamp: datetime!(2026-01-01 00:00 UTC),
			outcome: if error_kind.is_some() { Outcome::Failure } else { Outcome::Success },
			error_kind,
			attempts: 1,
			diagnostics: Vec::new(),
			gap_score_before: 0.5,
			gap_score_after: 0.5,
		}
	}

	#[test]
	fn append_assigns_increasing_sequence_numbers() {
		let history = ExecutionHistory::new();

		assert_eq!(history.append(entry("a", None)), 1);
		assert_eq!(history.append(entry("b", Some(ErrorKind::Timeout))), 2);
		assert_eq!(history.entries_for("b")[0].seq, 2);
	}

	#[test]
	fn only_attempts_that_reached_the_source_dedup() {
		assert!(entry("a", None).counts_for_dedup());
		assert!(entry("a", Some(ErrorKind::HttpError)).counts_for_dedup());
		assert!(!entry("a", Some(ErrorKind::CircuitOpen)).counts_for_dedup());
		assert!(!entry("a", Some(ErrorKind::Cancelled)).counts_for_dedup());
	}

	#[test]
	fn restore_rejects_out_of_order_entries() {
		let mut first = entry("a", None);
		let mut second = entry("b", None);

		first.seq = 2;
		second.seq = 2;

		assert!(ExecutionHistory::from_entries(vec![first, second]).is_err());
	}
}
