//! Gap analysis and lookup scheduling.
//!
//! Everything here is a pure function of its inputs. Time enters through [`PlanContext::now`].

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use dossier_config::Planner;
use dossier_domain::{FieldPath, Profile, Section, scoring};
use dossier_storage::{HistoryEntry, Outcome};

use crate::registry::{ModuleDescriptor, Registry};

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
	#[error("Module dependencies form a cycle: {}.", cycle.join(" -> "))]
	DependencyCycle { cycle: Vec<String> },
}

/// Per-section gap in 0.0-1.0 plus the section-weighted overall gap.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GapReport {
	pub sections: BTreeMap<Section, f64>,
	pub overall: f64,
}
impl GapReport {
	pub fn section(&self, section: Section) -> f64 {
		self.sections.get(&section).copied().unwrap_or(0.0)
	}
}

/// Scheduling state that is not part of the profile or history.
#[derive(Clone, Debug)]
pub struct PlanContext {
	pub now: OffsetDateTime,
	/// Modules currently running.
	pub in_flight: BTreeSet<String>,
	/// Rate classes with a call in progress.
	pub busy_rate_classes: BTreeSet<String>,
	pub quarantined: BTreeSet<String>,
}
impl PlanContext {
	pub fn new(now: OffsetDateTime) -> Self {
		Self {
			now,
			in_flight: BTreeSet::new(),
			busy_rate_classes: BTreeSet::new(),
			quarantined: BTreeSet::new(),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Suggestion {
	pub module: String,
	pub score: f64,
	pub gap_contribution: f64,
	pub pivot: String,
	pub pivot_hash: String,
}

pub fn analyze_gaps(profile: &Profile, cfg: &Planner, now: OffsetDateTime) -> GapReport {
	let stale_after = cfg.stale_after_secs.map(|secs| Duration::seconds(secs as i64));
	let mut sections = BTreeMap::new();
	let mut total_weight = 0.0;
	let mut weighted_gap = 0.0;

	for section in Section::DATA {
		let mut total = 0.0;
		let mut missing = 0.0;

		for spec in section.fields() {
			let path = FieldPath::new(section, spec.name);
			let weight = scoring::table_weight(&cfg.field_weights, &path.to_string());

			total += weight;

			if !profile.is_populated(&path) || is_stale(profile, &path, stale_after, now) {
				missing += weight;
			}
		}

		let gap = if total > 0.0 { (missing / total).clamp(0.0, 1.0) } else { 0.0 };
		let section_weight = scoring::table_weight(&cfg.section_weights, section.as_str());

		total_weight += section_weight;
		weighted_gap += section_weight * gap;

		sections.insert(section, gap);
	}

	let overall = if total_weight > 0.0 { weighted_gap / total_weight } else { 0.0 };

	GapReport { sections, overall }
}

/// Ranks the registered lookups for the next batch. Excluded modules are omitted; the rest are
/// ordered by score, then fewer output sections, then name.
pub fn suggest_modules(
	profile: &Profile,
	history: &[HistoryEntry],
	registry: &Registry,
	cfg: &Planner,
	ctx: &PlanContext,
) -> Result<Vec<Suggestion>, PlannerError> {
	check_dependencies(registry)?;

	let gaps = analyze_gaps(profile, cfg, ctx.now);
	let cooldown = cfg.cooldown_secs.map(|secs| Duration::seconds(secs as i64));
	let mut suggestions = Vec::new();

	for descriptor in registry.descriptors() {
		let name = descriptor.name.as_str();

		if ctx.quarantined.contains(name) || !dependencies_met(descriptor, history) {
			continue;
		}

		let pivot = descriptor.pivot(profile);
		let excluded = history.iter().any(|entry| {
			entry.module_name == name
				&& entry.pivot_hash == pivot.hash
				&& entry.counts_for_dedup()
				&& cooldown.is_none_or(|window| ctx.now - entry.timestamp < window)
		});

		if excluded {
			tracing::debug!(module = name, pivot = %pivot.label, "Skipping repeated pivot.");

			continue;
		}

		let contribution: f64 = descriptor
			.declared_output_sections
			.iter()
			.map(|section| {
				scoring::table_weight(&cfg.section_weights, section.as_str())
					* gaps.section(*section)
			})
			.sum();

		if contribution <= 0.0 {
			continue;
		}

		let failures = history
			.iter()
			.filter(|entry| {
				entry.module_name == name
					&& entry.outcome == Outcome::Failure
					&& entry.error_kind.is_none_or(|kind| kind.reached_source())
			})
			.count();
		let mut score = contribution * registry.reliability(cfg, name)
			- cfg.history_penalty * failures as f64;

		if ctx.in_flight.contains(name) || ctx.busy_rate_classes.contains(&descriptor.rate_class)
		{
			score -= cfg.in_progress_penalty;
		}
		if score <= 0.0 {
			continue;
		}

		suggestions.push((
			descriptor.declared_output_sections.len(),
			Suggestion {
				module: descriptor.name.clone(),
				score,
				gap_contribution: contribution,
				pivot: pivot.label,
				pivot_hash: pivot.hash,
			},
		));
	}

	suggestions.sort_by(|(a_outputs, a), (b_outputs, b)| {
		b.score
			.total_cmp(&a.score)
			.then_with(|| a_outputs.cmp(b_outputs))
			.then_with(|| a.module.cmp(&b.module))
	});

	Ok(suggestions.into_iter().map(|(_, suggestion)| suggestion).collect())
}

/// Picks up to `limit` suggestions for one batch. Each pick counts as in flight while the rest
/// are ranked, so later modules sharing its rate class pay the in-progress penalty.
pub fn plan_batch(
	profile: &Profile,
	history: &[HistoryEntry],
	registry: &Registry,
	cfg: &Planner,
	ctx: &PlanContext,
	limit: usize,
) -> Result<Vec<Suggestion>, PlannerError> {
	let mut ctx = ctx.clone();
	let mut batch = Vec::new();

	while batch.len() < limit {
		let ranked = suggest_modules(profile, history, registry, cfg, &ctx)?;
		let Some(next) =
			ranked.into_iter().find(|suggestion| !ctx.in_flight.contains(&suggestion.module))
		else {
			break;
		};

		ctx.in_flight.insert(next.module.clone());

		if let Some(descriptor) = registry.descriptor(&next.module) {
			ctx.busy_rate_classes.insert(descriptor.rate_class.clone());
		}

		batch.push(next);
	}

	Ok(batch)
}

/// Fails with the first cycle found, walking modules in name order.
pub fn check_dependencies(registry: &Registry) -> Result<(), PlannerError> {
	let graph: BTreeMap<&str, &[String]> = registry
		.descriptors()
		.map(|descriptor| (descriptor.name.as_str(), descriptor.depends_on.as_slice()))
		.collect();
	let mut done = BTreeSet::new();

	for name in graph.keys().copied() {
		let mut path = Vec::new();

		if let Some(cycle) = find_cycle(name, &graph, &mut path, &mut done) {
			return Err(PlannerError::DependencyCycle { cycle });
		}
	}

	Ok(())
}

fn find_cycle<'a>(
	name: &'a str,
	graph: &BTreeMap<&'a str, &'a [String]>,
	path: &mut Vec<&'a str>,
	done: &mut BTreeSet<&'a str>,
) -> Option<Vec<String>> {
	if let Some(start) = path.iter().position(|entry| *entry == name) {
		let mut cycle: Vec<String> = path[start..].iter().map(|entry| entry.to_string()).collect();

		cycle.push(name.to_string());

		return Some(cycle);
	}
	if done.contains(name) {
		return None;
	}

	path.push(name);

	for dep in graph.get(name).copied().unwrap_or(&[]) {
		if let Some(cycle) = find_cycle(dep.as_str(), graph, path, done) {
			return Some(cycle);
		}
	}

	path.pop();
	done.insert(name);

	None
}

fn dependencies_met(descriptor: &ModuleDescriptor, history: &[HistoryEntry]) -> bool {
	descriptor.depends_on.iter().all(|dep| {
		history.iter().any(|entry| &entry.module_name == dep && entry.counts_for_dedup())
	})
}

fn is_stale(
	profile: &Profile,
	path: &FieldPath,
	stale_after: Option<Duration>,
	now: OffsetDateTime,
) -> bool {
	let Some(window) = stale_after else { return false };

	profile
		.field_last_touched(path)
		.is_some_and(|touched| now - touched > window)
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use serde_json::json;
	use time::macros::datetime;
	use uuid::Uuid;

	use dossier_config::Config;
	use dossier_domain::{Identifier, IdentifierKind, SchemaPatch};

	use super::*;
	use crate::{BoxFuture, Lookup, LookupContext, LookupError, LookupOutcome};

	const NOW: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

	struct Inert(ModuleDescriptor);
	impl Lookup for Inert {
		fn descriptor(&self) -> &ModuleDescriptor {
			&self.0
		}

		fn execute<'a>(
			&'a self,
			_: &'a Profile,
			_: &'a LookupContext,
		) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
			Box::pin(async { Err(LookupError::fatal("not called")) })
		}
	}

	fn registry(descriptors: Vec<ModuleDescriptor>) -> Registry {
		let catalog: Vec<Arc<dyn Lookup>> =
			descriptors.into_iter().map(|d| Arc::new(Inert(d)) as Arc<dyn Lookup>).collect();

		Registry::from_catalog(&Config::default(), catalog).expect("registry")
	}

	fn seeded() -> Profile {
		let seeds = [Identifier::new(IdentifierKind::Domain, "example.com")];

		Profile::initialize(Uuid::nil(), &seeds, NOW).expect("profile")
	}

	#[test]
	fn stale_fields_count_as_gaps() {
		let mut profile = seeded();
		let patch = SchemaPatch::new().set(Section::Digital, "ips", json!(["10.0.0.1"]));

		assert!(profile.apply_patch("manual", &patch, None, false, NOW).is_applied());

		let fresh = Planner::default();
		let stale = Planner { stale_after_secs: Some(3_600), ..Planner::default() };
		let later = NOW + Duration::hours(2);

		assert_eq!(analyze_gaps(&profile, &fresh, later).section(Section::Digital), 0.6);
		assert_eq!(analyze_gaps(&profile, &stale, later).section(Section::Digital), 1.0);
	}

	#[test]
	fn dependency_cycles_are_reported() {
		let registry = registry(vec![
			ModuleDescriptor::new("alpha", &[Section::Digital]).depends_on(&["beta"]),
			ModuleDescriptor::new("beta", &[Section::Digital]).depends_on(&["alpha"]),
		]);
		let err = suggest_modules(
			&seeded(),
			&[],
			&registry,
			&Planner::default(),
			&PlanContext::new(NOW),
		)
		.expect_err("cycle");
		let PlannerError::DependencyCycle { cycle } = err;

		assert_eq!(cycle, vec!["alpha", "beta", "alpha"]);
	}

	#[test]
	fn in_progress_penalty_applies_to_busy_rate_classes() {
		let registry = registry(vec![
			ModuleDescriptor::new("whois", &[Section::Business]).rate_class("shared"),
			ModuleDescriptor::new("registry", &[Section::Business]).rate_class("other"),
		]);
		let mut ctx = PlanContext::new(NOW);

		ctx.busy_rate_classes.insert("shared".to_string());

		let suggestions =
			suggest_modules(&seeded(), &[], &registry, &Planner::default(), &ctx).expect("plan");

		assert_eq!(suggestions[0].module, "registry");
		assert!((suggestions[0].score - suggestions[1].score - 0.25).abs() < 1e-9);
	}

	#[test]
	fn quarantined_modules_are_not_suggested() {
		let registry = registry(vec![ModuleDescriptor::new("whois", &[Section::Business])]);
		let mut ctx = PlanContext::new(NOW);

		ctx.quarantined.insert("whois".to_string());

		let suggestions =
			suggest_modules(&seeded(), &[], &registry, &Planner::default(), &ctx).expect("plan");

		assert!(suggestions.is_empty());
	}
}
