//! Completeness, freshness and risk. Every function here is pure; callers pass `now`.

use std::collections::BTreeMap;

use serde_json::Value;
use time::OffsetDateTime;

use dossier_config::Scoring;

use crate::{
	enrichment::Scores,
	profile::Profile,
	schema::{FieldPath, Section},
};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Weight for `key`, defaulting to 1.0 when the table has no entry.
pub fn table_weight(table: &BTreeMap<String, f64>, key: &str) -> f64 {
	table.get(key).copied().unwrap_or(1.0)
}

/// Combined weight of a field: section weight times field weight.
pub fn field_weight(
	section_weights: &BTreeMap<String, f64>,
	field_weights: &BTreeMap<String, f64>,
	path: &FieldPath,
) -> f64 {
	table_weight(section_weights, path.section.as_str())
		* table_weight(field_weights, &path.to_string())
}

pub fn completeness(profile: &Profile, cfg: &Scoring) -> f64 {
	let mut total = 0.0;
	let mut populated = 0.0;

	for section in Section::DATA {
		for spec in section.fields() {
			let path = FieldPath::new(section, spec.name);
			let weight = field_weight(&cfg.section_weights, &cfg.field_weights, &path);

			total += weight;

			if profile.is_populated(&path) {
				populated += weight;
			}
		}
	}

	if total > 0.0 { (populated / total).clamp(0.0, 1.0) } else { 0.0 }
}

/// Weighted mean over data sections of `0.5^(age / half_life)`, where age is measured from the
/// newest audit record touching the section. Untouched sections contribute zero.
pub fn freshness(profile: &Profile, cfg: &Scoring, now: OffsetDateTime) -> f64 {
	let half_life_secs = cfg.freshness_half_life_days * SECONDS_PER_DAY;
	let mut total = 0.0;
	let mut weighted = 0.0;

	for section in Section::DATA {
		let weight = table_weight(&cfg.section_weights, section.as_str());

		total += weight;

		let Some(touched) = profile.last_touched(section) else { continue };
		let age_secs = (now - touched).as_seconds_f64().max(0.0);

		weighted += weight * 0.5_f64.powf(age_secs / half_life_secs);
	}

	if total > 0.0 { (weighted / total).clamp(0.0, 1.0) } else { 0.0 }
}

pub fn risk(profile: &Profile, cfg: &Scoring) -> f64 {
	let mut score = 0.0;

	if let Some(Value::Array(flags)) = profile.field(&FieldPath::new(Section::Risk, "red_flags")) {
		for flag in flags {
			let severity = flag.get("severity").and_then(Value::as_str).unwrap_or_default();

			score += cfg.severity_weights.get(severity).copied().unwrap_or(0.0);
		}
	}

	let sanctions_hit = flag_set(profile, FieldPath::new(Section::Risk, "sanctions_hit"))
		|| profile.is_populated(&FieldPath::new(Section::Legal, "sanctions"));

	if sanctions_hit {
		score += cfg.sanctions_weight;
	}
	if flag_set(profile, FieldPath::new(Section::Risk, "breach_detected")) {
		score += cfg.breach_weight;
	}

	score.clamp(0.0, 1.0)
}

pub fn score(profile: &Profile, cfg: &Scoring, now: OffsetDateTime) -> Scores {
	Scores {
		completeness: completeness(profile, cfg),
		freshness: freshness(profile, cfg, now),
		risk: risk(profile, cfg),
	}
}

fn flag_set(profile: &Profile, path: FieldPath) -> bool {
	profile.field(&path).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use time::{Duration, macros::datetime};
	use uuid::Uuid;

	use super::*;
	use crate::{
		enrichment::{Identifier, IdentifierKind},
		profile::SchemaPatch,
	};

	fn seeded(now: OffsetDateTime) -> Profile {
		Profile::initialize(Uuid::nil(), &[Identifier::new(IdentifierKind::Name, "Jane Doe")], now)
			.expect("seeded profile")
	}

	#[test]
	fn completeness_counts_populated_fields() {
		let profile = seeded(datetime!(2026-01-01 00:00 UTC));
		let field_count: usize = Section::DATA.iter().map(|section| section.fields().len()).sum();
		let value = completeness(&profile, &Scoring::default());

		assert!((value - 1.0 / field_count as f64).abs() < 1e-12);
	}

	#[test]
	fn freshness_halves_after_one_half_life() {
		let start = datetime!(2026-01-01 00:00 UTC);
		let profile = seeded(start);
		let cfg = Scoring::default();
		let fresh = freshness(&profile, &cfg, start);
		let aged = freshness(&profile, &cfg, start + Duration::days(30));

		assert!((fresh - 1.0 / 9.0).abs() < 1e-12);
		assert!((aged - fresh / 2.0).abs() < 1e-12);
	}

	#[test]
	fn risk_sums_severities_and_caps_at_one() {
		let now = datetime!(2026-01-01 00:00 UTC);
		let mut profile = seeded(now);
		let cfg = Scoring::default();
		let patch = SchemaPatch::new()
			.set(
				Section::Risk,
				"red_flags",
				json!([
					{ "category": "breach", "severity": "high" },
					{ "category": "fraud", "severity": "medium" }
				]),
			)
			.set(Section::Risk, "breach_detected", json!(true));

		profile.apply_patch("m", &patch, None, false, now);

		assert!((risk(&profile, &cfg) - 0.75).abs() < 1e-12);

		let sanctions = SchemaPatch::new()
			.set(Section::Legal, "sanctions", json!([{ "list": "OFAC SDN" }]));

		profile.apply_patch("m", &sanctions, None, false, now);

		assert_eq!(risk(&profile, &cfg), 1.0);
	}

	#[test]
	fn zero_weight_tables_score_zero() {
		let profile = seeded(datetime!(2026-01-01 00:00 UTC));
		let cfg = Scoring {
			section_weights: Section::DATA
				.iter()
				.map(|section| (section.as_str().to_string(), 0.0))
				.collect(),
			..Scoring::default()
		};

		assert_eq!(completeness(&profile, &cfg), 0.0);
	}
}
