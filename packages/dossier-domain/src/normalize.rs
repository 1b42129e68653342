use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;

use crate::schema::{FieldSpec, Shape, ValueKind};

/// NFKC, trimmed, inner whitespace collapsed to single spaces.
pub fn normalize_text(raw: &str) -> String {
	let folded: String = raw.nfkc().collect();

	folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_hostname(raw: &str) -> String {
	let host = normalize_text(raw).to_lowercase();
	let host = host.strip_prefix("*.").unwrap_or(&host);

	host.trim_end_matches('.').to_string()
}

/// Keeps a leading `+` and the digits.
pub fn normalize_phone(raw: &str) -> String {
	let text = normalize_text(raw);
	let mut out = String::with_capacity(text.len());

	if text.starts_with('+') {
		out.push('+');
	}

	out.extend(text.chars().filter(char::is_ascii_digit));

	out
}

/// Normalizes one item of the given kind. Values that fail the kind check are returned
/// unchanged so the validator can report them.
pub fn normalize_item(kind: ValueKind, value: &Value) -> Value {
	match (kind, value) {
		(ValueKind::Text, Value::String(raw)) => Value::String(normalize_text(raw)),
		(ValueKind::Lowercase | ValueKind::Email, Value::String(raw)) =>
			Value::String(normalize_text(raw).to_lowercase()),
		(ValueKind::Hostname, Value::String(raw)) => Value::String(normalize_hostname(raw)),
		(ValueKind::Phone, Value::String(raw)) => Value::String(normalize_phone(raw)),
		(ValueKind::RedFlag, Value::Object(object)) => {
			let mut flag = normalize_object(object);

			if let Some(Value::String(severity)) = flag.get_mut("severity") {
				*severity = normalize_text(severity).to_lowercase();
			}

			Value::Object(flag)
		},
		(ValueKind::Object, Value::Object(object)) => Value::Object(normalize_object(object)),
		_ => value.clone(),
	}
}

/// Normalizes a field value by its shape and kind. Lists are deduplicated by key with the first
/// occurrence kept.
pub fn normalize_value(spec: &FieldSpec, value: &Value) -> Value {
	match (spec.shape, value) {
		(Shape::List, Value::Array(items)) => {
			let mut seen = Vec::<String>::with_capacity(items.len());
			let mut out = Vec::with_capacity(items.len());

			for item in items {
				let item = normalize_item(spec.kind, item);
				let key = dedup_key(spec.kind, &item);

				if !seen.contains(&key) {
					seen.push(key);
					out.push(item);
				}
			}

			Value::Array(out)
		},
		(Shape::Scalar, value) => normalize_item(spec.kind, value),
		_ => value.clone(),
	}
}

/// Identity used for list unions. Text compares case-insensitively but stores its original case.
pub fn dedup_key(kind: ValueKind, value: &Value) -> String {
	match (kind, value) {
		(ValueKind::Text, Value::String(text)) => text.to_lowercase(),
		(_, Value::String(text)) => text.clone(),
		_ => canonical_json(value),
	}
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
	fn sorted(value: &Value) -> Value {
		match value {
			Value::Object(object) => {
				let mut keys: Vec<_> = object.keys().collect();

				keys.sort();

				Value::Object(
					keys.into_iter().map(|key| (key.clone(), sorted(&object[key]))).collect(),
				)
			},
			Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
			_ => value.clone(),
		}
	}

	sorted(value).to_string()
}

/// A field counts as populated when it holds a non-empty list, non-empty string, or any other
/// non-null value.
pub fn is_populated(value: Option<&Value>) -> bool {
	match value {
		None | Some(Value::Null) => false,
		Some(Value::Array(items)) => !items.is_empty(),
		Some(Value::String(text)) => !text.is_empty(),
		Some(Value::Object(object)) => !object.is_empty(),
		Some(_) => true,
	}
}

fn normalize_object(object: &Map<String, Value>) -> Map<String, Value> {
	object
		.iter()
		.map(|(key, value)| {
			let value = match value {
				Value::String(text) => Value::String(normalize_text(text)),
				other => other.clone(),
			};

			(key.clone(), value)
		})
		.collect()
}
