use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub service: Service,
	pub engine: Engine,
	pub planner: Planner,
	pub runner: Runner,
	pub scoring: Scoring,
	pub registry: Registry,
	/// Static per-module settings, keyed by module name.
	pub modules: BTreeMap<String, Map<String, Value>>,
	pub credentials: Credentials,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Service {
	pub log_level: String,
	/// Label written to `enrichment.metadata.tool`.
	pub tool_name: String,
}
impl Default for Service {
	fn default() -> Self {
		Self { log_level: "info".to_string(), tool_name: "dossier".to_string() }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Engine {
	pub max_concurrency: u32,
	/// Module runs an investigation may record, counting those restored from a snapshot.
	pub module_budget: u32,
	/// Upper bound on suggestions taken from one planning round.
	pub batch_size: u32,
	/// Planning stops once the overall gap score drops below this value.
	pub stop_gap_threshold: f64,
}
impl Default for Engine {
	fn default() -> Self {
		Self { max_concurrency: 4, module_budget: 32, batch_size: 4, stop_gap_threshold: 0.1 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Planner {
	/// Optional. History entries older than this stop excluding a module. Unset means an
	/// identical input hash excludes the module for the whole investigation.
	pub cooldown_secs: Option<u64>,
	/// Optional. Populated fields not touched for this long count as gaps again.
	pub stale_after_secs: Option<u64>,
	pub history_penalty: f64,
	pub in_progress_penalty: f64,
	pub default_reliability: f64,
	/// Per-module reliability priors, overriding descriptor defaults.
	pub reliability: BTreeMap<String, f64>,
	/// Keys are section names.
	pub section_weights: BTreeMap<String, f64>,
	/// Keys are "<section>.<field>" paths.
	pub field_weights: BTreeMap<String, f64>,
}
impl Default for Planner {
	fn default() -> Self {
		Self {
			cooldown_secs: None,
			stale_after_secs: None,
			history_penalty: 0.05,
			in_progress_penalty: 0.25,
			default_reliability: 1.0,
			reliability: BTreeMap::new(),
			section_weights: BTreeMap::new(),
			field_weights: BTreeMap::new(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Runner {
	pub attempt_timeout_ms: u64,
	pub max_retries: u32,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
	/// Spacing applied to rate classes without an explicit entry.
	pub default_min_spacing_ms: u64,
	pub rate_classes: BTreeMap<String, RateClass>,
	pub circuit_breaker: CircuitBreaker,
	pub quarantine: Quarantine,
}
impl Default for Runner {
	fn default() -> Self {
		Self {
			attempt_timeout_ms: 15_000,
			max_retries: 2,
			base_backoff_ms: 500,
			max_backoff_ms: 30_000,
			default_min_spacing_ms: 0,
			rate_classes: BTreeMap::new(),
			circuit_breaker: CircuitBreaker::default(),
			quarantine: Quarantine::default(),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RateClass {
	pub min_spacing_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CircuitBreaker {
	pub failure_threshold: u32,
	pub window_ms: u64,
	pub cooldown_ms: u64,
}
impl Default for CircuitBreaker {
	fn default() -> Self {
		Self { failure_threshold: 3, window_ms: 60_000, cooldown_ms: 120_000 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Quarantine {
	pub max_fatals: u32,
	pub window_ms: u64,
}
impl Default for Quarantine {
	fn default() -> Self {
		Self { max_fatals: 3, window_ms: 600_000 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Scoring {
	pub freshness_half_life_days: f64,
	pub sanctions_weight: f64,
	pub breach_weight: f64,
	/// Keys are red-flag severities: low, medium, high, critical.
	pub severity_weights: BTreeMap<String, f64>,
	/// Keys are section names.
	pub section_weights: BTreeMap<String, f64>,
	/// Keys are "<section>.<field>" paths.
	pub field_weights: BTreeMap<String, f64>,
}
impl Default for Scoring {
	fn default() -> Self {
		Self {
			freshness_half_life_days: 30.0,
			sanctions_weight: 0.5,
			breach_weight: 0.3,
			severity_weights: default_severity_weights(),
			section_weights: BTreeMap::new(),
			field_weights: BTreeMap::new(),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Registry {
	/// Module names to register. Empty registers the whole catalog.
	pub enabled: Vec<String>,
}

/// Secrets resolved once at load time. Values of the form `env:NAME` are replaced with the
/// environment variable during normalization.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub(crate) BTreeMap<String, String>);
impl Credentials {
	pub fn new(values: BTreeMap<String, String>) -> Self {
		Self(values)
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.get(name).map(String::as_str)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.0.keys().map(String::as_str)
	}
}
impl std::fmt::Debug for Credentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_map().entries(self.0.keys().map(|key| (key, "[REDACTED]"))).finish()
	}
}

fn default_severity_weights() -> BTreeMap<String, f64> {
	[("low", 0.05), ("medium", 0.15), ("high", 0.3), ("critical", 0.5)]
		.into_iter()
		.map(|(key, value)| (key.to_string(), value))
		.collect()
}
