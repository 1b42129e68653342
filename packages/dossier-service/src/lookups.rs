//! Built-in lookups backed by public sources.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use reqwest::Client;
use serde_json::{Map, Value, json};

use dossier_config::Config;
use dossier_domain::{
	Correlation, FieldPath, Identifier, IdentifierKind, Profile, SchemaPatch, Section,
};
use dossier_providers::{
	crtsh::{self, CrtShConfig, CrtShReport},
	rdap::{self, RdapConfig, RdapRecord},
};
use dossier_storage::Outcome;

use crate::{
	BoxFuture, Lookup, LookupContext, LookupError, LookupOutcome, ModuleDescriptor, Result,
};

pub const CRTSH: &str = "crtsh";
pub const RDAP: &str = "rdap";

const CRTSH_CONFIDENCE: f64 = 0.9;
const RDAP_CONFIDENCE: f64 = 0.7;

/// Every built-in lookup, configured from its `[modules.<name>]` table.
pub fn builtin_catalog(cfg: &Config) -> Result<Vec<Arc<dyn Lookup>>> {
	let empty = Map::new();
	let settings = |name: &str| cfg.modules.get(name).unwrap_or(&empty);

	Ok(vec![
		Arc::new(CrtShLookup::new(dossier_providers::settings(settings(CRTSH))?)?),
		Arc::new(RdapLookup::new(dossier_providers::settings(settings(RDAP))?)?),
	])
}

/// Certificate-transparency host discovery for known domains.
pub struct CrtShLookup {
	descriptor: ModuleDescriptor,
	cfg: CrtShConfig,
	client: Client,
}
impl CrtShLookup {
	pub fn new(cfg: CrtShConfig) -> Result<Self> {
		let descriptor = ModuleDescriptor::new(CRTSH, &[Section::Digital])
			.reads(&[domains_path()])
			.rate_class("ct_logs")
			.reliability(0.8);
		let client = dossier_providers::http_client(cfg.timeout_ms, &cfg.user_agent)?;

		Ok(Self { descriptor, cfg, client })
	}

	async fn query_all(&self, profile: &Profile) -> Result<LookupOutcome, LookupError> {
		let domains = profile_domains(profile);
		let targets: Vec<&String> = domains.iter().take(self.cfg.max_domains).collect();
		let mut reports = Vec::new();
		let mut errors = Vec::new();

		for domain in &targets {
			match crtsh::query(&self.client, &self.cfg, domain).await {
				Ok(report) => reports.push(report),
				Err(err) => errors.push((domain.to_string(), LookupError::from(err))),
			}
		}

		if reports.is_empty()
			&& let Some((_, err)) = errors.first()
		{
			return Err(err.clone());
		}

		Ok(crtsh_outcome(&domains, reports, &errors))
	}
}
impl Lookup for CrtShLookup {
	fn descriptor(&self) -> &ModuleDescriptor {
		&self.descriptor
	}

	fn execute<'a>(
		&'a self,
		profile: &'a Profile,
		_: &'a LookupContext,
	) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
		Box::pin(self.query_all(profile))
	}
}

/// Registration data for known domains: owning organization and the canonical name.
pub struct RdapLookup {
	descriptor: ModuleDescriptor,
	cfg: RdapConfig,
	client: Client,
}
impl RdapLookup {
	pub fn new(cfg: RdapConfig) -> Result<Self> {
		let descriptor = ModuleDescriptor::new(RDAP, &[Section::Digital, Section::Business])
			.reads(&[domains_path()])
			.rate_class(RDAP);
		let client = dossier_providers::http_client(cfg.timeout_ms, &cfg.user_agent)?;

		Ok(Self { descriptor, cfg, client })
	}

	async fn query_all(&self, profile: &Profile) -> Result<LookupOutcome, LookupError> {
		let mut targets = BTreeSet::new();
		let mut records = Vec::new();
		let mut not_found = Vec::new();
		let mut errors = Vec::new();

		for domain in profile_domains(profile) {
			let canonical = rdap::canonical_domain(&domain);

			if self.cfg.accepts(&canonical) {
				targets.insert(canonical);
			}
		}
		for (i, domain) in targets.iter().take(self.cfg.max_domains).enumerate() {
			if i > 0 && self.cfg.spacing_ms > 0 {
				tokio::time::sleep(Duration::from_millis(self.cfg.spacing_ms)).await;
			}

			match rdap::query(&self.client, &self.cfg, domain).await {
				Ok(Some(record)) => records.push(record),
				Ok(None) => not_found.push(domain.clone()),
				Err(err) => errors.push((domain.clone(), LookupError::from(err))),
			}
		}

		if records.is_empty()
			&& not_found.is_empty()
			&& let Some((_, err)) = errors.first()
		{
			return Err(err.clone());
		}

		Ok(rdap_outcome(records, not_found, &errors))
	}
}
impl Lookup for RdapLookup {
	fn descriptor(&self) -> &ModuleDescriptor {
		&self.descriptor
	}

	fn execute<'a>(
		&'a self,
		profile: &'a Profile,
		_: &'a LookupContext,
	) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
		Box::pin(self.query_all(profile))
	}
}

/// Folds per-domain crt.sh reports into one outcome. Hosts already on the profile are skipped.
pub fn crtsh_outcome(
	known: &[String],
	reports: Vec<CrtShReport>,
	errors: &[(String, LookupError)],
) -> LookupOutcome {
	let mut seen: BTreeSet<&str> = known.iter().map(String::as_str).collect();
	let mut hosts = Vec::new();
	let mut queried = Vec::new();
	let mut rows = Vec::new();
	let mut total_rows = 0;
	let mut truncated = false;

	for report in &reports {
		queried.push(report.domain.clone());
		total_rows += report.total_rows;
		truncated |= report.rows.len() < report.total_rows;

		rows.extend(report.rows.iter().cloned());

		for host in &report.hosts {
			if seen.insert(host.as_str()) {
				hosts.push(host.clone());
			}
		}
	}

	let status = if errors.is_empty() { Outcome::Success } else { Outcome::Partial };
	let payload = object(json!({
		"domains": queried,
		"hosts": hosts,
		"rows": rows,
		"total_rows": total_rows,
		"truncated": truncated,
	}));
	let identifier = queried.first().cloned().unwrap_or_default();
	let mut outcome = LookupOutcome::new(status, &identifier, CRTSH, payload);

	if !hosts.is_empty() {
		outcome.schema_patch = SchemaPatch::new().set(Section::Digital, "domains", json!(hosts));
	}

	for host in &hosts {
		outcome.identifiers.push(Identifier::new(IdentifierKind::Domain, host));
		outcome.correlations.push(Correlation {
			identifier: host.clone(),
			source: CRTSH.to_string(),
			field: domains_path().to_string(),
			confidence: CRTSH_CONFIDENCE,
		});
	}
	for (domain, err) in errors {
		outcome.diagnostics.push(format!("{domain}: {err}"));
	}
	if queried.is_empty() && errors.is_empty() {
		outcome.status = Outcome::Partial;
		outcome.diagnostics.push("profile has no domains to query".to_string());
	}

	outcome
}

/// Folds RDAP records into one outcome: organization names to `business.company_names`, the
/// registered domain and its `www.` host to `digital.domains`.
pub fn rdap_outcome(
	records: Vec<RdapRecord>,
	not_found: Vec<String>,
	errors: &[(String, LookupError)],
) -> LookupOutcome {
	let mut companies: Vec<String> = Vec::new();
	let mut domains = Vec::new();
	let mut summaries = Vec::new();
	let mut correlations = Vec::new();

	for record in &records {
		domains.push(record.domain.clone());
		domains.push(format!("www.{}", record.domain));

		if let Some(org) = &record.org {
			if !companies.contains(&org.name) {
				companies.push(org.name.clone());
			}

			correlations.push(Correlation {
				identifier: record.domain.clone(),
				source: RDAP.to_string(),
				field: FieldPath::new(Section::Business, "company_names").to_string(),
				confidence: RDAP_CONFIDENCE,
			});
		}

		summaries.push(json!({
			"domain": record.domain,
			"org": record.org.as_ref().map(|org| org.name.clone()),
			"justification": record.org.as_ref().map(|org| org.justification.clone()),
			"nameservers": record.nameservers,
			"status": record.status,
			"raw": record.raw,
		}));
	}

	let status = if errors.is_empty() { Outcome::Success } else { Outcome::Partial };
	let identifier = records.first().map(|record| record.domain.clone()).unwrap_or_default();
	let payload = object(json!({ "records": summaries, "not_found": not_found }));
	let mut patch = SchemaPatch::new();

	if !domains.is_empty() {
		patch.insert(Section::Digital, "domains", json!(domains));
	}
	if !companies.is_empty() {
		patch.insert(Section::Business, "company_names", json!(companies));
	}

	let mut outcome = LookupOutcome::new(status, &identifier, "rdap_domain", payload)
		.with_patch(patch);

	outcome.identifiers = companies
		.iter()
		.map(|name| Identifier::new(IdentifierKind::Company, name))
		.collect();
	outcome.correlations = correlations;

	for (domain, err) in errors {
		outcome.diagnostics.push(format!("{domain}: {err}"));
	}

	outcome
}

fn domains_path() -> FieldPath {
	FieldPath::new(Section::Digital, "domains")
}

fn profile_domains(profile: &Profile) -> Vec<String> {
	match profile.field(&domains_path()) {
		Some(Value::Array(items)) =>
			items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
		_ => Vec::new(),
	}
}

fn object(value: Value) -> Map<String, Value> {
	match value {
		Value::Object(map) => map,
		other => Map::from_iter([("value".to_string(), other)]),
	}
}
