mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	CircuitBreaker, Config, Credentials, Engine, Planner, Quarantine, RateClass, Registry, Runner,
	Scoring, Service,
};

use std::{collections::BTreeMap, env, fs, path::Path};

const ENV_REFERENCE_PREFIX: &str = "env:";
const SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg)?;

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.engine.max_concurrency == 0 {
		return Err(Error::Validation {
			message: "engine.max_concurrency must be greater than zero.".to_string(),
		});
	}
	if cfg.engine.batch_size == 0 {
		return Err(Error::Validation {
			message: "engine.batch_size must be greater than zero.".to_string(),
		});
	}
	if !cfg.engine.stop_gap_threshold.is_finite()
		|| !(0.0..=1.0).contains(&cfg.engine.stop_gap_threshold)
	{
		return Err(Error::Validation {
			message: "engine.stop_gap_threshold must be in the range 0.0-1.0.".to_string(),
		});
	}

	for (label, value) in [
		("planner.history_penalty", cfg.planner.history_penalty),
		("planner.in_progress_penalty", cfg.planner.in_progress_penalty),
		("planner.default_reliability", cfg.planner.default_reliability),
		("scoring.sanctions_weight", cfg.scoring.sanctions_weight),
		("scoring.breach_weight", cfg.scoring.breach_weight),
	] {
		ensure_non_negative(label, value)?;
	}

	validate_weight_table("planner.reliability", &cfg.planner.reliability)?;
	validate_weight_table("planner.section_weights", &cfg.planner.section_weights)?;
	validate_weight_table("planner.field_weights", &cfg.planner.field_weights)?;
	validate_weight_table("scoring.severity_weights", &cfg.scoring.severity_weights)?;
	validate_weight_table("scoring.section_weights", &cfg.scoring.section_weights)?;
	validate_weight_table("scoring.field_weights", &cfg.scoring.field_weights)?;

	for key in cfg.scoring.severity_weights.keys() {
		if !SEVERITIES.contains(&key.as_str()) {
			return Err(Error::Validation {
				message: format!(
					"scoring.severity_weights.{key} is not one of low, medium, high, or critical."
				),
			});
		}
	}

	if !cfg.scoring.freshness_half_life_days.is_finite()
		|| cfg.scoring.freshness_half_life_days <= 0.0
	{
		return Err(Error::Validation {
			message: "scoring.freshness_half_life_days must be greater than zero.".to_string(),
		});
	}
	if cfg.runner.attempt_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "runner.attempt_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.runner.base_backoff_ms > cfg.runner.max_backoff_ms {
		return Err(Error::Validation {
			message: "runner.base_backoff_ms must not exceed runner.max_backoff_ms.".to_string(),
		});
	}
	if cfg.runner.circuit_breaker.failure_threshold == 0 {
		return Err(Error::Validation {
			message: "runner.circuit_breaker.failure_threshold must be greater than zero."
				.to_string(),
		});
	}
	if cfg.runner.circuit_breaker.window_ms == 0 {
		return Err(Error::Validation {
			message: "runner.circuit_breaker.window_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.runner.quarantine.max_fatals == 0 {
		return Err(Error::Validation {
			message: "runner.quarantine.max_fatals must be greater than zero.".to_string(),
		});
	}

	for name in cfg.runner.rate_classes.keys() {
		if name.trim().is_empty() {
			return Err(Error::Validation {
				message: "runner.rate_classes keys must be non-empty.".to_string(),
			});
		}
	}
	for name in &cfg.registry.enabled {
		if name.trim().is_empty() {
			return Err(Error::Validation {
				message: "registry.enabled entries must be non-empty.".to_string(),
			});
		}
	}
	for (name, value) in &cfg.credentials.0 {
		if value.starts_with(ENV_REFERENCE_PREFIX) {
			return Err(Error::Validation {
				message: format!("credentials.{name} was not resolved."),
			});
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) -> Result<()> {
	cfg.service.log_level = cfg.service.log_level.trim().to_string();
	cfg.registry.enabled = cfg
		.registry
		.enabled
		.iter()
		.map(|name| name.trim().to_string())
		.filter(|name| !name.is_empty())
		.collect();

	resolve_credentials(&mut cfg.credentials.0)
}

fn resolve_credentials(values: &mut BTreeMap<String, String>) -> Result<()> {
	for (name, value) in values.iter_mut() {
		let Some(var) = value.strip_prefix(ENV_REFERENCE_PREFIX) else {
			continue;
		};
		let resolved = env::var(var.trim()).map_err(|_| Error::Validation {
			message: format!("credentials.{name} references unset environment variable {var}."),
		})?;

		*value = resolved;
	}

	Ok(())
}

fn validate_weight_table(label: &str, table: &BTreeMap<String, f64>) -> Result<()> {
	for (key, value) in table {
		if key.trim().is_empty() {
			return Err(Error::Validation { message: format!("{label} keys must be non-empty.") });
		}

		ensure_non_negative(&format!("{label}.{key}"), *value)?;
	}

	Ok(())
}

fn ensure_non_negative(label: &str, value: f64) -> Result<()> {
	if !value.is_finite() {
		return Err(Error::Validation { message: format!("{label} must be a finite number.") });
	}
	if value < 0.0 {
		return Err(Error::Validation { message: format!("{label} must be zero or greater.") });
	}

	Ok(())
}
