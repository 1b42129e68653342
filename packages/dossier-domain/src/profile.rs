use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	enrichment::{Enrichment, Identifier, IdentifierKind},
	normalize,
	schema::{self, FieldPath, Section, Shape, Violation, ViolationCode},
};

pub const SEED_MODULE: &str = "seed";

pub type SectionData = Map<String, Value>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
	#[default]
	Active,
	Frozen,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
	pub module: String,
	pub fields_changed: Vec<FieldPath>,
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
}

/// Field values keyed by section. Sections are typed, so a patch can only name sections that
/// exist; field names are checked when the patch is applied.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaPatch(BTreeMap<Section, SectionData>);
impl SchemaPatch {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(mut self, section: Section, field: &str, value: Value) -> Self {
		self.insert(section, field, value);

		self
	}

	pub fn insert(&mut self, section: Section, field: &str, value: Value) {
		self.0.entry(section).or_default().insert(field.to_string(), value);
	}

	pub fn sections(&self) -> impl Iterator<Item = Section> + '_ {
		self.0.keys().copied()
	}

	pub fn iter(&self) -> impl Iterator<Item = (Section, &SectionData)> {
		self.0.iter().map(|(section, data)| (*section, data))
	}

	pub fn is_empty(&self) -> bool {
		self.0.values().all(Map::is_empty)
	}

	pub fn contains(&self, section: Section, field: &str) -> bool {
		self.0.get(&section).is_some_and(|data| data.contains_key(field))
	}

	/// Drops sections outside `allowed`. Used to restrict a lookup's contribution to its
	/// declared output.
	pub fn restricted_to(&self, allowed: &[Section]) -> Self {
		Self(
			self.0
				.iter()
				.filter(|(section, _)| allowed.contains(section))
				.map(|(section, data)| (*section, data.clone()))
				.collect(),
		)
	}
}
impl From<BTreeMap<Section, SectionData>> for SchemaPatch {
	fn from(value: BTreeMap<Section, SectionData>) -> Self {
		Self(value)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
	Applied { fields_changed: Vec<FieldPath> },
	Rejected { violations: Vec<Violation> },
}
impl MutationOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, Self::Applied { .. })
	}

	pub fn violations(&self) -> &[Violation] {
		match self {
			Self::Applied { .. } => &[],
			Self::Rejected { violations } => violations,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
	subject_id: Uuid,
	#[serde(with = "time::serde::rfc3339")]
	created_at: OffsetDateTime,
	status: ProfileStatus,
	sections: BTreeMap<Section, SectionData>,
	enrichment: Enrichment,
	audit: Vec<AuditRecord>,
}
impl Profile {
	/// Builds a profile from seed identifiers. The first name becomes `identity.full_name`,
	/// later names become aliases.
	pub fn initialize(
		subject_id: Uuid,
		seeds: &[Identifier],
		now: OffsetDateTime,
	) -> Result<Self, Vec<Violation>> {
		let mut profile = Self {
			subject_id,
			created_at: now,
			status: ProfileStatus::Active,
			sections: Section::DATA.into_iter().map(|section| (section, Map::new())).collect(),
			enrichment: Enrichment::default(),
			audit: Vec::new(),
		};
		let mut lists = BTreeMap::<(Section, &str), Vec<Value>>::new();
		let mut patch = SchemaPatch::new();

		for seed in seeds {
			if seed.value.is_empty() {
				continue;
			}

			let (section, field) = match seed.kind {
				IdentifierKind::Name if !patch.contains(Section::Identity, "full_name") => {
					patch.insert(Section::Identity, "full_name", Value::from(seed.value.clone()));
					profile.enrichment.record_identifier(seed.clone());

					continue;
				},
				IdentifierKind::Name => (Section::Identity, "aliases"),
				IdentifierKind::Email => (Section::Contact, "emails"),
				IdentifierKind::Phone => (Section::Contact, "phones"),
				IdentifierKind::Username => (Section::Contact, "usernames"),
				IdentifierKind::Domain => (Section::Digital, "domains"),
				IdentifierKind::Ip => (Section::Digital, "ips"),
				IdentifierKind::Company => (Section::Business, "company_names"),
			};

			lists.entry((section, field)).or_default().push(Value::from(seed.value.clone()));
			profile.enrichment.record_identifier(seed.clone());
		}
		for ((section, field), values) in lists {
			patch.insert(section, field, Value::Array(values));
		}

		match profile.apply_patch(SEED_MODULE, &patch, None, false, now) {
			MutationOutcome::Applied { .. } => Ok(profile),
			MutationOutcome::Rejected { violations } => Err(violations),
		}
	}

	pub fn subject_id(&self) -> Uuid {
		self.subject_id
	}

	pub fn created_at(&self) -> OffsetDateTime {
		self.created_at
	}

	pub fn status(&self) -> ProfileStatus {
		self.status
	}

	pub fn is_frozen(&self) -> bool {
		self.status == ProfileStatus::Frozen
	}

	pub fn freeze(&mut self) {
		self.status = ProfileStatus::Frozen;
	}

	pub fn section(&self, section: Section) -> Option<&SectionData> {
		self.sections.get(&section)
	}

	pub fn field(&self, path: &FieldPath) -> Option<&Value> {
		self.sections.get(&path.section)?.get(&path.field)
	}

	pub fn is_populated(&self, path: &FieldPath) -> bool {
		normalize::is_populated(self.field(path))
	}

	pub fn enrichment(&self) -> &Enrichment {
		&self.enrichment
	}

	pub fn enrichment_mut(&mut self) -> &mut Enrichment {
		&mut self.enrichment
	}

	pub fn audit(&self) -> &[AuditRecord] {
		&self.audit
	}

	/// Timestamp of the newest audit record touching `section`.
	pub fn last_touched(&self, section: Section) -> Option<OffsetDateTime> {
		self.audit
			.iter()
			.rev()
			.find(|record| record.fields_changed.iter().any(|path| path.section == section))
			.map(|record| record.timestamp)
	}

	pub fn field_last_touched(&self, path: &FieldPath) -> Option<OffsetDateTime> {
		self.audit
			.iter()
			.rev()
			.find(|record| record.fields_changed.contains(path))
			.map(|record| record.timestamp)
	}

	/// All violations `patch` would raise, without applying it.
	///
	/// `declared` restricts which sections may be written; `None` allows every data section.
	pub fn check_patch(
		&self,
		patch: &SchemaPatch,
		declared: Option<&[Section]>,
		force: bool,
	) -> Vec<Violation> {
		let mut violations = Vec::new();

		for (section, data) in patch.iter() {
			if section.is_reserved() {
				violations.extend(schema::validate_patch(section, data));

				continue;
			}
			if let Some(declared) = declared
				&& !declared.contains(&section)
			{
				violations.push(Violation::new(
					section,
					None,
					ViolationCode::OutsideDeclaredSections,
					"Section is not in the module's declared output sections.",
				));

				continue;
			}

			let field_violations = schema::validate_patch(section, data);

			if !field_violations.is_empty() {
				violations.extend(field_violations);

				continue;
			}
			if force {
				continue;
			}

			let current = self.sections.get(&section);

			for (field, value) in data {
				let Some(spec) = section.field(field) else { continue };

				if spec.shape != Shape::Scalar {
					continue;
				}

				let existing = current.and_then(|data| data.get(field));

				if !normalize::is_populated(existing) {
					continue;
				}

				let incoming = normalize::normalize_value(spec, value);

				if existing.map(|existing| normalize::dedup_key(spec.kind, existing))
					!= Some(normalize::dedup_key(spec.kind, &incoming))
				{
					violations.push(Violation::new(
						section,
						Some(field),
						ViolationCode::ScalarConflict,
						"Field is already set to a different value; pass force to overwrite.",
					));
				}
			}
		}

		violations
	}

	/// Applies every field of `patch` or none of them. Lists merge by normalized union keeping
	/// prior order; scalars are set once unless `force` is set.
	pub fn apply_patch(
		&mut self,
		module: &str,
		patch: &SchemaPatch,
		declared: Option<&[Section]>,
		force: bool,
		now: OffsetDateTime,
	) -> MutationOutcome {
		let violations = self.check_patch(patch, declared, force);

		if !violations.is_empty() {
			return MutationOutcome::Rejected { violations };
		}

		let mut staged = self.sections.clone();
		let mut fields_changed = Vec::new();

		for (section, data) in patch.iter() {
			let target = staged.entry(section).or_default();

			for (field, value) in data {
				let Some(spec) = section.field(field) else { continue };
				let incoming = normalize::normalize_value(spec, value);
				let changed = match spec.shape {
					Shape::List => merge_list(target, field, spec.kind, incoming),
					Shape::Scalar => merge_scalar(target, field, spec.kind, incoming),
				};

				if changed {
					fields_changed.push(FieldPath::new(section, field.as_str()));
				}
			}
		}

		let staged_violations = validate_sections(&staged);

		if !staged_violations.is_empty() {
			return MutationOutcome::Rejected { violations: staged_violations };
		}

		self.sections = staged;

		if !fields_changed.is_empty() {
			self.audit.push(AuditRecord {
				module: module.to_string(),
				fields_changed: fields_changed.clone(),
				timestamp: now,
			});
		}

		MutationOutcome::Applied { fields_changed }
	}

	/// Full-document check, including the evidence ledger.
	pub fn validate(&self) -> Vec<Violation> {
		let mut violations = validate_sections(&self.sections);

		violations.extend(self.enrichment.validate());

		violations
	}
}

fn merge_list(
	target: &mut SectionData,
	field: &str,
	kind: schema::ValueKind,
	incoming: Value,
) -> bool {
	let Value::Array(items) = incoming else { return false };
	let slot = target.entry(field.to_string()).or_insert_with(|| Value::Array(Vec::new()));
	let Value::Array(existing) = slot else { return false };
	let mut changed = false;

	for item in items {
		let key = normalize::dedup_key(kind, &item);

		if !existing.iter().any(|known| normalize::dedup_key(kind, known) == key) {
			existing.push(item);

			changed = true;
		}
	}

	if existing.is_empty() {
		target.remove(field);
	}

	changed
}

fn merge_scalar(
	target: &mut SectionData,
	field: &str,
	kind: schema::ValueKind,
	incoming: Value,
) -> bool {
	let same = target
		.get(field)
		.is_some_and(|known| {
			normalize::dedup_key(kind, known) == normalize::dedup_key(kind, &incoming)
		});

	if same {
		return false;
	}

	target.insert(field.to_string(), incoming);

	true
}

fn validate_sections(sections: &BTreeMap<Section, SectionData>) -> Vec<Violation> {
	let mut violations = Vec::new();

	for (section, data) in sections {
		let field_violations = schema::validate_patch(*section, data);

		if !field_violations.is_empty() {
			violations.extend(field_violations);

			continue;
		}

		for (field, value) in data {
			let Some(spec) = section.field(field) else { continue };

			if normalize::normalize_value(spec, value) != *value {
				violations.push(Violation::new(
					*section,
					Some(field),
					ViolationCode::TypeMismatch,
					"Stored value is not normalized or holds duplicates.",
				));
			}
		}
	}

	violations
}
