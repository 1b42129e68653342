use std::{collections::BTreeMap, fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalize;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap_or_else(|_| unreachable!())
});
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[a-z0-9]([a-z0-9_-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9_-]*[a-z0-9])?)+$")
		.unwrap_or_else(|_| unreachable!())
});

pub const RED_FLAG_SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];

#[derive(
	Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Section {
	Identity,
	Contact,
	Digital,
	Business,
	Legal,
	Metadata,
	Social,
	Geo,
	Risk,
	Enrichment,
}
impl Section {
	pub const ALL: [Self; 10] = [
		Self::Identity,
		Self::Contact,
		Self::Digital,
		Self::Business,
		Self::Legal,
		Self::Metadata,
		Self::Social,
		Self::Geo,
		Self::Risk,
		Self::Enrichment,
	];
	/// Sections a lookup may write through a schema patch.
	pub const DATA: [Self; 9] = [
		Self::Identity,
		Self::Contact,
		Self::Digital,
		Self::Business,
		Self::Legal,
		Self::Metadata,
		Self::Social,
		Self::Geo,
		Self::Risk,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Identity => "identity",
			Self::Contact => "contact",
			Self::Digital => "digital",
			Self::Business => "business",
			Self::Legal => "legal",
			Self::Metadata => "metadata",
			Self::Social => "social",
			Self::Geo => "geo",
			Self::Risk => "risk",
			Self::Enrichment => "enrichment",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|section| section.as_str() == raw.trim())
	}

	/// The enrichment section is owned by the evidence ledger and never patched directly.
	pub fn is_reserved(self) -> bool {
		matches!(self, Self::Enrichment)
	}

	pub fn fields(self) -> &'static [FieldSpec] {
		match self {
			Self::Identity => IDENTITY_FIELDS,
			Self::Contact => CONTACT_FIELDS,
			Self::Digital => DIGITAL_FIELDS,
			Self::Business => BUSINESS_FIELDS,
			Self::Legal => LEGAL_FIELDS,
			Self::Metadata => METADATA_FIELDS,
			Self::Social => SOCIAL_FIELDS,
			Self::Geo => GEO_FIELDS,
			Self::Risk => RISK_FIELDS,
			Self::Enrichment => &[],
		}
	}

	pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
		self.fields().iter().find(|spec| spec.name == name)
	}
}
impl fmt::Display for Section {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
	Scalar,
	List,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
	Text,
	Lowercase,
	Email,
	Hostname,
	Phone,
	Number,
	Bool,
	Object,
	RedFlag,
}
impl ValueKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Text => "text",
			Self::Lowercase => "lowercase text",
			Self::Email => "email address",
			Self::Hostname => "hostname",
			Self::Phone => "phone number",
			Self::Number => "number",
			Self::Bool => "boolean",
			Self::Object => "object",
			Self::RedFlag => "red flag object",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
	pub name: &'static str,
	pub shape: Shape,
	pub kind: ValueKind,
}
impl FieldSpec {
	const fn scalar(name: &'static str, kind: ValueKind) -> Self {
		Self { name, shape: Shape::Scalar, kind }
	}

	const fn list(name: &'static str, kind: ValueKind) -> Self {
		Self { name, shape: Shape::List, kind }
	}
}

const IDENTITY_FIELDS: &[FieldSpec] = &[
	FieldSpec::scalar("full_name", ValueKind::Text),
	FieldSpec::scalar("dob", ValueKind::Text),
	FieldSpec::scalar("gender", ValueKind::Text),
	FieldSpec::scalar("nationality", ValueKind::Text),
	FieldSpec::list("aliases", ValueKind::Text),
];
const CONTACT_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("emails", ValueKind::Email),
	FieldSpec::list("phones", ValueKind::Phone),
	FieldSpec::list("usernames", ValueKind::Lowercase),
	FieldSpec::list("addresses", ValueKind::Text),
];
const DIGITAL_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("domains", ValueKind::Hostname),
	FieldSpec::list("ips", ValueKind::Lowercase),
	FieldSpec::list("devices", ValueKind::Text),
	FieldSpec::list("exposed_ports", ValueKind::Number),
	FieldSpec::list("urls", ValueKind::Text),
];
const BUSINESS_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("company_names", ValueKind::Text),
	FieldSpec::scalar("abn", ValueKind::Text),
	FieldSpec::list("roles", ValueKind::Text),
	FieldSpec::list("directorships", ValueKind::Text),
];
const LEGAL_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("court_cases", ValueKind::Object),
	FieldSpec::list("bankruptcies", ValueKind::Object),
	FieldSpec::list("sanctions", ValueKind::Object),
];
const METADATA_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("documents", ValueKind::Object),
	FieldSpec::scalar("group", ValueKind::Text),
];
const SOCIAL_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("platforms", ValueKind::Lowercase),
	FieldSpec::list("profile_links", ValueKind::Text),
	FieldSpec::scalar("last_activity", ValueKind::Text),
];
const GEO_FIELDS: &[FieldSpec] = &[
	FieldSpec::list("cities", ValueKind::Text),
	FieldSpec::list("countries", ValueKind::Text),
	FieldSpec::list("geo_coordinates", ValueKind::Object),
];
const RISK_FIELDS: &[FieldSpec] = &[
	FieldSpec::scalar("exposure_score", ValueKind::Number),
	FieldSpec::list("red_flags", ValueKind::RedFlag),
	FieldSpec::scalar("sanctions_hit", ValueKind::Bool),
	FieldSpec::scalar("breach_detected", ValueKind::Bool),
];

/// A `section.field` reference into the schema.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
	pub section: Section,
	pub field: String,
}
impl FieldPath {
	pub fn new(section: Section, field: impl Into<String>) -> Self {
		Self { section, field: field.into() }
	}

	/// Parses and checks the path against the schema.
	pub fn parse(raw: &str) -> Result<Self, String> {
		let (section, field) =
			raw.split_once('.').ok_or_else(|| format!("{raw:?} is not a section.field path."))?;
		let section = Section::parse(section)
			.ok_or_else(|| format!("{raw:?} names an unknown section."))?;

		if section.field(field).is_none() {
			return Err(format!("{raw:?} names a field outside the {section} schema."));
		}

		Ok(Self::new(section, field))
	}

	pub fn spec(&self) -> Option<&'static FieldSpec> {
		self.section.field(&self.field)
	}
}
impl fmt::Display for FieldPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.section, self.field)
	}
}
impl TryFrom<String> for FieldPath {
	type Error = String;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(&value)
	}
}
impl From<FieldPath> for String {
	fn from(value: FieldPath) -> Self {
		value.to_string()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
	UnknownField,
	TypeMismatch,
	ReservedSection,
	OutsideDeclaredSections,
	ScalarConflict,
	InvalidEvidence,
}
impl ViolationCode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::UnknownField => "REJECT_UNKNOWN_FIELD",
			Self::TypeMismatch => "REJECT_TYPE_MISMATCH",
			Self::ReservedSection => "REJECT_RESERVED_SECTION",
			Self::OutsideDeclaredSections => "REJECT_UNDECLARED_SECTION",
			Self::ScalarConflict => "REJECT_SCALAR_CONFLICT",
			Self::InvalidEvidence => "REJECT_INVALID_EVIDENCE",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
	pub section: Section,
	pub field: Option<String>,
	pub code: ViolationCode,
	pub message: String,
}
impl Violation {
	pub fn new(
		section: Section,
		field: Option<&str>,
		code: ViolationCode,
		message: impl Into<String>,
	) -> Self {
		Self { section, field: field.map(str::to_string), code, message: message.into() }
	}

	/// `section.field`, or the bare section name for section-level violations.
	pub fn path(&self) -> String {
		match &self.field {
			Some(field) => format!("{}.{field}", self.section),
			None => self.section.to_string(),
		}
	}
}
impl fmt::Display for Violation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {} ({})", self.path(), self.message, self.code.as_str())
	}
}

/// Checks a single-section patch against the closed field contract. Values are checked after
/// normalization, so the result is the same whether or not the caller normalized first.
pub fn validate_patch(section: Section, patch: &Map<String, Value>) -> Vec<Violation> {
	if section.is_reserved() {
		return vec![Violation::new(
			section,
			None,
			ViolationCode::ReservedSection,
			"Section is written only through the evidence ledger.",
		)];
	}

	let mut violations = Vec::new();

	for (field, value) in patch {
		let Some(spec) = section.field(field) else {
			violations.push(Violation::new(
				section,
				Some(field),
				ViolationCode::UnknownField,
				"Field is not declared in the schema.",
			));

			continue;
		};

		if let Err(message) = check_value(spec, value) {
			violations.push(Violation::new(
				section,
				Some(field),
				ViolationCode::TypeMismatch,
				message,
			));
		}
	}

	violations
}

pub fn check_value(spec: &FieldSpec, value: &Value) -> Result<(), String> {
	match spec.shape {
		Shape::Scalar => check_item(spec.kind, value),
		Shape::List => {
			let Some(items) = value.as_array() else {
				return Err(format!("Expected a list of {}.", spec.kind.as_str()));
			};

			for (idx, item) in items.iter().enumerate() {
				check_item(spec.kind, item).map_err(|message| format!("Item {idx}: {message}"))?;
			}

			Ok(())
		},
	}
}

fn check_item(kind: ValueKind, value: &Value) -> Result<(), String> {
	let expected = || format!("Expected {}.", kind.as_str());

	match kind {
		ValueKind::Text | ValueKind::Lowercase => {
			let raw = value.as_str().ok_or_else(expected)?;

			if normalize::normalize_text(raw).is_empty() {
				return Err("Text must be non-empty.".to_string());
			}
		},
		ValueKind::Email => {
			let raw = value.as_str().ok_or_else(expected)?;

			if !EMAIL_RE.is_match(&normalize::normalize_text(raw).to_lowercase()) {
				return Err(expected());
			}
		},
		ValueKind::Hostname => {
			let raw = value.as_str().ok_or_else(expected)?;

			if !HOSTNAME_RE.is_match(&normalize::normalize_hostname(raw)) {
				return Err(expected());
			}
		},
		ValueKind::Phone => {
			let raw = value.as_str().ok_or_else(expected)?;

			if !normalize::normalize_phone(raw).chars().any(|ch| ch.is_ascii_digit()) {
				return Err(expected());
			}
		},
		ValueKind::Number =>
			if !value.is_number() {
				return Err(expected());
			},
		ValueKind::Bool =>
			if !value.is_boolean() {
				return Err(expected());
			},
		ValueKind::Object =>
			if !value.is_object() {
				return Err(expected());
			},
		ValueKind::RedFlag => {
			let object = value.as_object().ok_or_else(expected)?;
			let category = object.get("category").and_then(Value::as_str).unwrap_or_default();

			if category.trim().is_empty() {
				return Err("Red flag requires a non-empty category.".to_string());
			}

			let severity = object
				.get("severity")
				.and_then(Value::as_str)
				.map(|raw| raw.trim().to_lowercase())
				.unwrap_or_default();

			if !RED_FLAG_SEVERITIES.contains(&severity.as_str()) {
				return Err(
					"Red flag severity must be one of low, medium, high, or critical.".to_string()
				);
			}
		},
	}

	Ok(())
}

/// Rejects weight-table keys that do not name a data section or a `section.field` path.
pub fn check_weight_keys(
	label: &str,
	section_weights: &BTreeMap<String, f64>,
	field_weights: &BTreeMap<String, f64>,
) -> Result<(), String> {
	for key in section_weights.keys() {
		match Section::parse(key) {
			Some(section) if !section.is_reserved() => {},
			_ => return Err(format!("{label}.section_weights.{key} is not a data section.")),
		}
	}
	for key in field_weights.keys() {
		FieldPath::parse(key).map_err(|err| format!("{label}.field_weights: {err}"))?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_data_section_declares_fields() {
		for section in Section::DATA {
			assert!(!section.fields().is_empty(), "{section} has no fields");
		}

		assert!(Section::Enrichment.fields().is_empty());
	}

	#[test]
	fn undeclared_field_is_reported_by_name() {
		let patch = serde_json::json!({ "domains_whois": [{ "domain": "example.com" }] });
		let violations = validate_patch(Section::Digital, patch.as_object().expect("object"));

		assert_eq!(violations.len(), 1);
		assert_eq!(violations[0].field.as_deref(), Some("domains_whois"));
		assert_eq!(violations[0].code, ViolationCode::UnknownField);
	}

	#[test]
	fn list_fields_require_arrays_of_the_declared_kind() {
		let patch = serde_json::json!({ "emails": "a@example.com", "phones": ["no digits"] });
		let violations = validate_patch(Section::Contact, patch.as_object().expect("object"));

		assert_eq!(violations.len(), 2);
		assert!(violations.iter().all(|v| v.code == ViolationCode::TypeMismatch));
	}

	#[test]
	fn red_flags_need_known_severity() {
		let spec = Section::Risk.field("red_flags").expect("red_flags spec");
		let ok = serde_json::json!([{ "category": "data_breach", "severity": "High" }]);
		let bad = serde_json::json!([{ "category": "data_breach", "severity": "catastrophic" }]);

		assert!(check_value(spec, &ok).is_ok());
		assert!(check_value(spec, &bad).is_err());
	}

	#[test]
	fn field_paths_round_trip_through_strings() {
		let path = FieldPath::parse("identity.full_name").expect("valid path");

		assert_eq!(path.to_string(), "identity.full_name");
		assert!(FieldPath::parse("identity.shoe_size").is_err());
		assert!(FieldPath::parse("dossier.full_name").is_err());
	}

	#[test]
	fn weight_keys_must_exist() {
		let sections = BTreeMap::from([("enrichment".to_string(), 1.0)]);

		assert!(check_weight_keys("planner", &sections, &BTreeMap::new()).is_err());

		let fields = BTreeMap::from([("digital.domains".to_string(), 2.0)]);

		assert!(check_weight_keys("planner", &BTreeMap::new(), &fields).is_ok());
	}
}
