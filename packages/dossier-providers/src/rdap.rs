use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RdapConfig {
	/// Registry endpoint; `/domain/<name>` is appended.
	pub base_url: String,
	pub timeout_ms: u64,
	/// Only domains ending in one of these suffixes are queried. Empty queries every domain.
	pub suffixes: Vec<String>,
	/// Domains queried per attempt, in name order.
	pub max_domains: usize,
	/// Pause between consecutive registry calls within one attempt.
	pub spacing_ms: u64,
	pub user_agent: String,
}
impl Default for RdapConfig {
	fn default() -> Self {
		Self {
			base_url: "https://rdap.org".to_string(),
			timeout_ms: 10_000,
			suffixes: vec![".au".to_string()],
			max_domains: 10,
			spacing_ms: 300,
			user_agent: "dossier-rdap/0.1".to_string(),
		}
	}
}
impl RdapConfig {
	pub fn accepts(&self, domain: &str) -> bool {
		self.suffixes.is_empty()
			|| self.suffixes.iter().any(|suffix| domain.ends_with(suffix.as_str()))
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrgHint {
	pub name: String,
	/// Where the name was found, e.g. `entity with roles registrant`.
	pub justification: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RdapRecord {
	pub domain: String,
	pub org: Option<OrgHint>,
	pub nameservers: Vec<String>,
	pub status: Vec<String>,
	pub raw: Value,
}

/// Looks up a domain. A 404 from the registry is `Ok(None)`.
pub async fn query(
	client: &Client,
	cfg: &RdapConfig,
	domain: &str,
) -> Result<Option<RdapRecord>> {
	let domain = canonical_domain(domain);
	let url = format!("{}/domain/{domain}", cfg.base_url.trim_end_matches('/'));

	match crate::get_json(client, &url).await {
		Ok(json) => parse_record(&domain, json).map(Some),
		Err(Error::Status { status: 404, .. }) => Ok(None),
		Err(err) => Err(err),
	}
}

pub fn parse_record(domain: &str, json: Value) -> Result<RdapRecord> {
	if !json.is_object() {
		return Err(Error::InvalidResponse {
			message: "RDAP response is not a JSON object.".to_string(),
		});
	}

	let status = json
		.get("status")
		.and_then(Value::as_array)
		.map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
		.unwrap_or_default();

	Ok(RdapRecord {
		domain: domain.to_string(),
		org: extract_org_name(&json),
		nameservers: extract_nameservers(&json),
		status,
		raw: json,
	})
}

/// Registrant or registrar entities first, then any entity with a vCard name, then remarks that
/// mention a registrant or entity.
pub fn extract_org_name(json: &Value) -> Option<OrgHint> {
	let entities =
		json.get("entities").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);

	for entity in entities {
		let roles: Vec<&str> = entity
			.get("roles")
			.and_then(Value::as_array)
			.map(|roles| roles.iter().filter_map(Value::as_str).collect())
			.unwrap_or_default();

		if (roles.contains(&"registrant") || roles.contains(&"registrar"))
			&& let Some(name) = entity.get("vcardArray").and_then(vcard_name)
		{
			return Some(OrgHint {
				name,
				justification: format!("entity with roles {}", roles.join(",")),
			});
		}
	}
	for entity in entities {
		if let Some(name) = entity.get("vcardArray").and_then(vcard_name) {
			return Some(OrgHint { name, justification: "entity vcard".to_string() });
		}
	}

	let remarks = json.get("remarks").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);

	for remark in remarks {
		let lines = remark.get("description").and_then(Value::as_array);

		for line in lines.into_iter().flatten().filter_map(Value::as_str) {
			let lower = line.to_lowercase();

			if lower.contains("registrant") || lower.contains("entity") {
				return Some(OrgHint {
					name: line.to_string(),
					justification: "remarks".to_string(),
				});
			}
		}
	}

	None
}

pub fn extract_nameservers(json: &Value) -> Vec<String> {
	json.get("nameservers")
		.and_then(Value::as_array)
		.map(|items| {
			items
				.iter()
				.filter_map(|ns| ns.get("ldhName").and_then(Value::as_str))
				.map(str::to_lowercase)
				.collect()
		})
		.unwrap_or_default()
}

/// Strips a leading `www.` label and lowercases.
pub fn canonical_domain(domain: &str) -> String {
	let domain = domain.trim().to_lowercase();

	domain.strip_prefix("www.").map(str::to_string).unwrap_or(domain)
}

// vcardArray: ["vcard", [["fn", {}, "text", "Name"], ...]]
fn vcard_name(vcard: &Value) -> Option<String> {
	let properties = vcard.as_array().filter(|parts| parts.len() == 2)?.get(1)?.as_array()?;

	properties.iter().find_map(|property| {
		let property = property.as_array()?;

		if property.len() >= 4 && property[0].as_str() == Some("fn") {
			property[3].as_str().map(str::trim).filter(|name| !name.is_empty()).map(str::to_string)
		} else {
			None
		}
	})
}
