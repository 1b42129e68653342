use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;

use dossier_config::{Config, Planner};
use dossier_domain::{FieldPath, Profile, Section, normalize};

use crate::{Error, Lookup, Result};

/// Registry metadata for one lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDescriptor {
	pub name: String,
	pub declared_output_sections: Vec<Section>,
	pub declared_input_fields: Vec<FieldPath>,
	pub rate_class: String,
	/// Prior in 0.0-1.0. `[planner.reliability]` overrides it; unset falls back to
	/// `planner.default_reliability`.
	pub reliability: Option<f64>,
	/// Modules that must have been attempted before this one is scheduled.
	pub depends_on: Vec<String>,
}
impl ModuleDescriptor {
	pub fn new(name: &str, outputs: &[Section]) -> Self {
		Self {
			name: name.to_string(),
			declared_output_sections: outputs.to_vec(),
			declared_input_fields: Vec::new(),
			rate_class: name.to_string(),
			reliability: None,
			depends_on: Vec::new(),
		}
	}

	pub fn reads(mut self, fields: &[FieldPath]) -> Self {
		self.declared_input_fields = fields.to_vec();

		self
	}

	pub fn rate_class(mut self, rate_class: &str) -> Self {
		self.rate_class = rate_class.to_string();

		self
	}

	pub fn reliability(mut self, reliability: f64) -> Self {
		self.reliability = Some(reliability);

		self
	}

	pub fn depends_on(mut self, modules: &[&str]) -> Self {
		self.depends_on = modules.iter().map(|name| name.to_string()).collect();

		self
	}

	/// Label and idempotency key for the profile's current input values.
	///
	/// The key is a blake3 hash over the module name and the canonical JSON of each declared
	/// input field, in declaration order. Absent fields hash as `null`.
	pub fn pivot(&self, profile: &Profile) -> Pivot {
		let mut hasher = blake3::Hasher::new();
		let mut labels = Vec::with_capacity(self.declared_input_fields.len());

		hasher.update(self.name.as_bytes());
		hasher.update(b"\0");

		for path in &self.declared_input_fields {
			let value = profile.field(path).cloned().unwrap_or(Value::Null);
			let canonical = normalize::canonical_json(&value);

			hasher.update(path.to_string().as_bytes());
			hasher.update(b"=");
			hasher.update(canonical.as_bytes());
			hasher.update(b"\n");

			if normalize::is_populated(Some(&value)) {
				labels.push(format!("{path}={}", pivot_label(&value)));
			}
		}

		Pivot {
			label: if labels.is_empty() { "*".to_string() } else { labels.join("; ") },
			hash: hasher.finalize().to_hex().to_string(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		let fail = |message: &str| {
			Err(Error::Descriptor { module: self.name.clone(), message: message.to_string() })
		};

		let valid_char =
			|ch: char| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-';

		if self.name.is_empty() || !self.name.chars().all(valid_char) {
			return fail("name must be non-empty lowercase ASCII, digits, '_' or '-'.");
		}
		if self.declared_output_sections.is_empty() {
			return fail("declared_output_sections must be non-empty.");
		}
		if self.declared_output_sections.iter().any(|section| section.is_reserved()) {
			return fail("declared_output_sections must not include the enrichment section.");
		}

		let mut outputs = self.declared_output_sections.clone();

		outputs.sort();
		outputs.dedup();

		if outputs.len() != self.declared_output_sections.len() {
			return fail("declared_output_sections must not repeat a section.");
		}
		if self.declared_input_fields.iter().any(|path| path.spec().is_none()) {
			return fail("declared_input_fields must name schema fields.");
		}
		if self.rate_class.trim().is_empty() {
			return fail("rate_class must be non-empty.");
		}
		if let Some(reliability) = self.reliability
			&& (!reliability.is_finite() || !(0.0..=1.0).contains(&reliability))
		{
			return fail("reliability must be in the range 0.0-1.0.");
		}
		if self.depends_on.iter().any(|dep| dep == &self.name) {
			return fail("depends_on must not name the module itself.");
		}

		Ok(())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pivot {
	pub label: String,
	pub hash: String,
}

/// Registered lookups keyed by name.
#[derive(Clone, Default)]
pub struct Registry {
	lookups: BTreeMap<String, Arc<dyn Lookup>>,
}
impl Registry {
	/// Registers the catalog entries enabled in `[registry]` (all of them when the list is
	/// empty). Any invalid descriptor, duplicate name, unknown enabled name or unknown dependency
	/// fails the whole pass.
	pub fn from_catalog(cfg: &Config, catalog: Vec<Arc<dyn Lookup>>) -> Result<Self> {
		let mut available = BTreeMap::new();

		for lookup in catalog {
			let descriptor = lookup.descriptor();

			descriptor.validate()?;

			let name = descriptor.name.clone();

			if available.contains_key(&name) {
				return Err(Error::Registry {
					message: format!("catalog registers module {name} twice."),
				});
			}

			available.insert(name, lookup);
		}

		let lookups = if cfg.registry.enabled.is_empty() {
			available
		} else {
			let mut selected = BTreeMap::new();

			for name in &cfg.registry.enabled {
				let lookup = available.remove(name).ok_or_else(|| Error::Registry {
					message: format!("registry.enabled names unknown module {name}."),
				})?;

				selected.insert(name.clone(), lookup);
			}

			selected
		};

		for lookup in lookups.values() {
			let descriptor = lookup.descriptor();

			for dep in &descriptor.depends_on {
				if !lookups.contains_key(dep) {
					return Err(Error::Registry {
						message: format!(
							"module {} depends on {dep}, which is not registered.",
							descriptor.name
						),
					});
				}
			}
		}
		for (name, reliability) in &cfg.planner.reliability {
			if !lookups.contains_key(name) {
				tracing::warn!(
					module = %name,
					"Reliability override names an unregistered module."
				);
			}
			if *reliability > 1.0 {
				return Err(Error::Config {
					message: format!("planner.reliability.{name} must be at most 1.0."),
				});
			}
		}

		Ok(Self { lookups })
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn Lookup>> {
		self.lookups.get(name)
	}

	pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
		self.lookups.get(name).map(|lookup| lookup.descriptor())
	}

	/// Descriptors in name order.
	pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
		self.lookups.values().map(|lookup| lookup.descriptor())
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.lookups.keys().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.lookups.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lookups.is_empty()
	}

	/// Config override, else the descriptor prior.
	pub fn reliability(&self, cfg: &Planner, name: &str) -> f64 {
		cfg.reliability
			.get(name)
			.copied()
			.or_else(|| self.descriptor(name).and_then(|descriptor| descriptor.reliability))
			.unwrap_or(cfg.default_reliability)
	}
}
impl std::fmt::Debug for Registry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.lookups.keys()).finish()
	}
}

fn pivot_label(value: &Value) -> String {
	match value {
		Value::String(text) => text.clone(),
		Value::Array(items) => {
			let first = items.first().map(pivot_label).unwrap_or_default();

			if items.len() > 1 { format!("{first} (+{})", items.len() - 1) } else { first }
		},
		other => normalize::canonical_json(other),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use time::macros::datetime;
	use uuid::Uuid;

	use dossier_domain::{Identifier, IdentifierKind, SchemaPatch};

	use super::*;
	use crate::{BoxFuture, LookupContext, LookupError, LookupOutcome};

	struct Stub(ModuleDescriptor);
	impl Lookup for Stub {
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

	fn catalog(descriptors: Vec<ModuleDescriptor>) -> Vec<Arc<dyn Lookup>> {
		descriptors.into_iter().map(|d| Arc::new(Stub(d)) as Arc<dyn Lookup>).collect()
	}

	fn whois() -> ModuleDescriptor {
		ModuleDescriptor::new("whois", &[Section::Digital])
			.reads(&[FieldPath::new(Section::Digital, "domains")])
	}

	#[test]
	fn invalid_catalogs_are_rejected() {
		let cfg = Config::default();

		assert!(matches!(
			Registry::from_catalog(&cfg, catalog(vec![whois(), whois()])),
			Err(Error::Registry { .. })
		));
		assert!(matches!(
			Registry::from_catalog(
				&cfg,
				catalog(vec![ModuleDescriptor::new("scan", &[Section::Enrichment])])
			),
			Err(Error::Descriptor { .. })
		));
		assert!(matches!(
			Registry::from_catalog(&cfg, catalog(vec![whois().depends_on(&["dns"])])),
			Err(Error::Registry { .. })
		));
	}

	#[test]
	fn enabled_list_selects_and_overrides_reliability() {
		let mut cfg = Config::default();

		cfg.registry.enabled = vec!["whois".to_string()];
		cfg.planner.reliability.insert("whois".to_string(), 0.4);

		let registry = Registry::from_catalog(
			&cfg,
			catalog(vec![whois().reliability(0.9), ModuleDescriptor::new("dns", &[Section::Geo])]),
		)
		.expect("registry");

		assert_eq!(registry.names().collect::<Vec<_>>(), vec!["whois"]);
		assert_eq!(registry.reliability(&cfg.planner, "whois"), 0.4);
		assert_eq!(registry.reliability(&Planner::default(), "whois"), 0.9);

		cfg.registry.enabled = vec!["ftp".to_string()];

		assert!(Registry::from_catalog(&cfg, catalog(vec![whois()])).is_err());
	}

	#[test]
	fn pivot_tracks_declared_inputs_only() {
		let now = datetime!(2026-03-01 09:00 UTC);
		let seeds = [Identifier::new(IdentifierKind::Domain, "example.com")];
		let mut profile = Profile::initialize(Uuid::nil(), &seeds, now).expect("profile");
		let before = whois().pivot(&profile);

		assert_eq!(before.label, "digital.domains=example.com");

		let unrelated = SchemaPatch::new().set(Section::Geo, "countries", json!(["AU"]));

		assert!(profile.apply_patch("geo", &unrelated, None, false, now).is_applied());
		assert_eq!(whois().pivot(&profile), before);

		let more = SchemaPatch::new().set(Section::Digital, "domains", json!(["example.org"]));

		assert!(profile.apply_patch("dns", &more, None, false, now).is_applied());

		let after = whois().pivot(&profile);

		assert_ne!(after.hash, before.hash);
		assert_eq!(after.label, "digital.domains=example.com (+1)");
	}
}
