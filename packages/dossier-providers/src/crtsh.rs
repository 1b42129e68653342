use std::collections::BTreeSet;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CrtShConfig {
	pub base_url: String,
	pub timeout_ms: u64,
	/// Domains queried per attempt, taken in profile order.
	pub max_domains: usize,
	/// Cap on new hosts reported per query.
	pub max_hosts: usize,
	/// Cap on raw rows kept as evidence per query. `total_rows` keeps the full count.
	pub max_rows: usize,
	pub user_agent: String,
}
impl Default for CrtShConfig {
	fn default() -> Self {
		Self {
			base_url: "https://crt.sh".to_string(),
			timeout_ms: 15_000,
			max_domains: 5,
			max_hosts: 300,
			max_rows: 500,
			user_agent: "dossier-crtsh/0.1".to_string(),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrtShReport {
	pub domain: String,
	/// Normalized host names not already in `known`, first-seen order.
	pub hosts: Vec<String>,
	pub rows: Vec<Value>,
	pub total_rows: usize,
}

pub async fn query(client: &Client, cfg: &CrtShConfig, domain: &str) -> Result<CrtShReport> {
	let url = format!(
		"{}/?q=%25.{domain}&exclude=expired&deduplicate=Y&output=json",
		cfg.base_url.trim_end_matches('/')
	);
	let json = crate::get_json(client, &url).await?;

	parse_rows(domain, json, cfg.max_hosts, cfg.max_rows, &BTreeSet::new())
}

/// Extracts hosts from crt.sh rows. `name_value` may hold several newline-separated names.
pub fn parse_rows(
	domain: &str,
	json: Value,
	max_hosts: usize,
	max_rows: usize,
	known: &BTreeSet<String>,
) -> Result<CrtShReport> {
	let Value::Array(rows) = json else {
		return Err(Error::InvalidResponse {
			message: "crt.sh response is not a JSON array.".to_string(),
		});
	};
	let mut seen = known.clone();
	let mut hosts = Vec::new();

	'rows: for row in &rows {
		let Some(names) = row.get("name_value").and_then(Value::as_str) else { continue };

		for name in names.lines() {
			if hosts.len() >= max_hosts {
				break 'rows;
			}

			let Some(host) = normalize_host(name) else { continue };

			if seen.insert(host.clone()) {
				hosts.push(host);
			}
		}
	}

	let total_rows = rows.len();

	Ok(CrtShReport {
		domain: domain.to_string(),
		hosts,
		rows: rows.into_iter().take(max_rows).collect(),
		total_rows,
	})
}

/// Lowercases, strips a leading wildcard label, and rejects anything that is not a dotted name.
pub fn normalize_host(raw: &str) -> Option<String> {
	let host = raw.trim().to_lowercase();
	let host = host.strip_prefix("*.").unwrap_or(&host).trim_end_matches('.');

	if !host.contains('.') || host.contains(char::is_whitespace) || host.contains('*') {
		return None;
	}
	if host.contains('@') {
		return None;
	}

	Some(host.to_string())
}
