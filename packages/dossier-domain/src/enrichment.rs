use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
	normalize,
	schema::{Section, Violation, ViolationCode},
};

pub const SUPERSEDES_KEY: &str = "supersedes";
pub const ERROR_KEY: &str = "error";

#[derive(
	Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
	Name,
	Email,
	Domain,
	Phone,
	Username,
	Ip,
	Company,
}
impl IdentifierKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Name => "name",
			Self::Email => "email",
			Self::Domain => "domain",
			Self::Phone => "phone",
			Self::Username => "username",
			Self::Ip => "ip",
			Self::Company => "company",
		}
	}
}

/// A pivot value. Construct through [`Identifier::new`] so the value is normalized for its kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
	pub kind: IdentifierKind,
	pub value: String,
}
impl Identifier {
	pub fn new(kind: IdentifierKind, value: &str) -> Self {
		let value = match kind {
			IdentifierKind::Name | IdentifierKind::Company => normalize::normalize_text(value),
			IdentifierKind::Email | IdentifierKind::Username | IdentifierKind::Ip =>
				normalize::normalize_text(value).to_lowercase(),
			IdentifierKind::Domain => normalize::normalize_hostname(value),
			IdentifierKind::Phone => normalize::normalize_phone(value),
		};

		Self { kind, value }
	}
}
impl fmt::Display for Identifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.kind.as_str(), self.value)
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
	pub accounts: Vec<Value>,
	pub locations: Vec<Value>,
	pub associations: Vec<Value>,
}
impl Signals {
	pub fn is_empty(&self) -> bool {
		self.accounts.is_empty() && self.locations.is_empty() && self.associations.is_empty()
	}

	fn lists(&self) -> [(&'static str, &Vec<Value>); 3] {
		[
			("accounts", &self.accounts),
			("locations", &self.locations),
			("associations", &self.associations),
		]
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
	pub identifier: String,
	pub source: String,
	pub field: String,
	pub confidence: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
	pub completeness: f64,
	pub freshness: f64,
	pub risk: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentMetadata {
	pub tool: String,
	#[serde(with = "time::serde::rfc3339::option")]
	pub queried_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
	pub seq: u64,
	pub identifier: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub payload: Map<String, Value>,
	pub source: String,
	#[serde(with = "time::serde::rfc3339")]
	pub recorded_at: OffsetDateTime,
}
impl RawResult {
	pub fn supersedes(&self) -> Option<u64> {
		self.payload.get(SUPERSEDES_KEY).and_then(Value::as_u64)
	}

	pub fn is_rejected(&self) -> bool {
		self.payload.contains_key(ERROR_KEY)
	}
}

/// The evidence ledger. Everything except `scores` and `metadata` is append-only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
	identifiers: Vec<Identifier>,
	sources: Vec<String>,
	signals: Signals,
	correlations: Vec<Correlation>,
	scores: Scores,
	metadata: EnrichmentMetadata,
	raw_results: Vec<RawResult>,
}
impl Enrichment {
	pub fn identifiers(&self) -> &[Identifier] {
		&self.identifiers
	}

	pub fn sources(&self) -> &[String] {
		&self.sources
	}

	pub fn signals(&self) -> &Signals {
		&self.signals
	}

	pub fn correlations(&self) -> &[Correlation] {
		&self.correlations
	}

	pub fn scores(&self) -> Scores {
		self.scores
	}

	pub fn metadata(&self) -> &EnrichmentMetadata {
		&self.metadata
	}

	pub fn raw_results(&self) -> &[RawResult] {
		&self.raw_results
	}

	pub fn raw_by_identifier<'a>(
		&'a self,
		identifier: &'a str,
	) -> impl Iterator<Item = &'a RawResult> + 'a {
		self.raw_results.iter().filter(move |entry| entry.identifier == identifier)
	}

	pub fn raw_by_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a RawResult> + 'a {
		self.raw_results.iter().filter(move |entry| entry.kind == kind)
	}

	pub fn correlations_for<'a>(
		&'a self,
		identifier: &'a str,
	) -> impl Iterator<Item = &'a Correlation> + 'a {
		self.correlations.iter().filter(move |edge| edge.identifier == identifier)
	}

	/// Returns `true` when the identifier was not seen before.
	pub fn record_identifier(&mut self, identifier: Identifier) -> bool {
		if identifier.value.is_empty() || self.identifiers.contains(&identifier) {
			return false;
		}

		self.identifiers.push(identifier);

		true
	}

	pub fn record_source(&mut self, source: &str) -> bool {
		let source = source.trim();

		if source.is_empty() || self.sources.iter().any(|known| known == source) {
			return false;
		}

		self.sources.push(source.to_string());

		true
	}

	/// Merges signal objects, skipping ones already present. Nothing is merged if any item is
	/// not a JSON object.
	pub fn merge_signals(&mut self, incoming: &Signals) -> Result<usize, Violation> {
		for (name, items) in incoming.lists() {
			if items.iter().any(|item| !item.is_object()) {
				return Err(invalid(format!("signals.{name} items must be JSON objects.")));
			}
		}

		let mut added = 0;

		for (target, items) in [
			(&mut self.signals.accounts, &incoming.accounts),
			(&mut self.signals.locations, &incoming.locations),
			(&mut self.signals.associations, &incoming.associations),
		] {
			for item in items {
				let key = normalize::canonical_json(item);

				if !target.iter().any(|known| normalize::canonical_json(known) == key) {
					target.push(item.clone());

					added += 1;
				}
			}
		}

		Ok(added)
	}

	/// Edges are unique per `(identifier, source, field)`; the first confidence recorded wins.
	pub fn record_correlation(&mut self, correlation: Correlation) -> Result<bool, Violation> {
		check_confidence(correlation.confidence)?;

		if self.correlations.iter().any(|edge| {
			edge.identifier == correlation.identifier
				&& edge.source == correlation.source
				&& edge.field == correlation.field
		}) {
			return Ok(false);
		}

		self.correlations.push(correlation);

		Ok(true)
	}

	/// Appends a raw result and returns its sequence number.
	pub fn append_raw(
		&mut self,
		identifier: &str,
		kind: &str,
		payload: Map<String, Value>,
		source: &str,
		recorded_at: OffsetDateTime,
	) -> u64 {
		let seq = self.raw_results.last().map_or(1, |entry| entry.seq + 1);

		self.raw_results.push(RawResult {
			seq,
			identifier: identifier.to_string(),
			kind: kind.to_string(),
			payload,
			source: source.to_string(),
			recorded_at,
		});

		seq
	}

	/// Appends a correction for an earlier entry. The superseded entry stays untouched.
	pub fn append_correction(
		&mut self,
		supersedes: u64,
		mut payload: Map<String, Value>,
		source: &str,
		recorded_at: OffsetDateTime,
	) -> Result<u64, Violation> {
		let Some(original) = self.raw_results.iter().find(|entry| entry.seq == supersedes) else {
			return Err(invalid(format!("raw_results has no entry with seq {supersedes}.")));
		};
		let identifier = original.identifier.clone();
		let kind = original.kind.clone();

		payload.insert(SUPERSEDES_KEY.to_string(), Value::from(supersedes));

		Ok(self.append_raw(&identifier, &kind, payload, source, recorded_at))
	}

	/// The newest entry in the correction chain that starts at `seq`.
	pub fn latest_revision(&self, seq: u64) -> Option<&RawResult> {
		let mut current = self.raw_results.iter().find(|entry| entry.seq == seq)?;

		while let Some(next) = self
			.raw_results
			.iter()
			.find(|entry| entry.seq > current.seq && entry.supersedes() == Some(current.seq))
		{
			current = next;
		}

		Some(current)
	}

	pub fn set_scores(&mut self, scores: Scores) {
		self.scores = scores;
	}

	pub fn set_metadata(&mut self, tool: &str, queried_at: OffsetDateTime) {
		self.metadata = EnrichmentMetadata { tool: tool.to_string(), queried_at: Some(queried_at) };
	}

	pub fn validate(&self) -> Vec<Violation> {
		let mut violations = Vec::new();
		let mut last_seq = 0;

		for entry in &self.raw_results {
			if entry.seq <= last_seq {
				violations.push(invalid(format!(
					"raw_results seq {} is not strictly increasing.",
					entry.seq
				)));
			}
			if let Some(target) = entry.supersedes()
				&& (target >= entry.seq || !self.raw_results.iter().any(|e| e.seq == target))
			{
				violations.push(invalid(format!(
					"raw_results seq {} supersedes unknown entry {target}.",
					entry.seq
				)));
			}

			last_seq = entry.seq;
		}
		for edge in &self.correlations {
			if let Err(violation) = check_confidence(edge.confidence) {
				violations.push(violation);
			}
		}
		for (name, items) in self.signals.lists() {
			if items.iter().any(|item| !item.is_object()) {
				violations.push(invalid(format!("signals.{name} items must be JSON objects.")));
			}
		}
		for (name, value) in [
			("completeness", self.scores.completeness),
			("freshness", self.scores.freshness),
			("risk", self.scores.risk),
		] {
			if !(0.0..=1.0).contains(&value) {
				violations.push(invalid(format!("scores.{name} must be in the range 0.0-1.0.")));
			}
		}

		violations
	}
}

fn check_confidence(confidence: f64) -> Result<(), Violation> {
	if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
		Ok(())
	} else {
		Err(invalid(format!("Correlation confidence {confidence} is outside 0.0-1.0.")))
	}
}

fn invalid(message: String) -> Violation {
	Violation::new(Section::Enrichment, None, ViolationCode::InvalidEvidence, message)
}
