use std::{future::Future, pin::Pin};

use serde_json::{Map, Value};

use dossier_config::Credentials;
use dossier_domain::{Correlation, Identifier, Profile, SchemaPatch, Signals};
use dossier_storage::{ErrorKind, Outcome};

use crate::registry::ModuleDescriptor;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A lookup source. Implementations read the profile snapshot they are handed and report what
/// they found; they never write to the profile themselves.
pub trait Lookup
where
	Self: Send + Sync,
{
	fn descriptor(&self) -> &ModuleDescriptor;

	fn execute<'a>(
		&'a self,
		profile: &'a Profile,
		ctx: &'a LookupContext,
	) -> BoxFuture<'a, Result<LookupOutcome, LookupError>>;
}

/// Static inputs for one module: credentials resolved at startup and its `[modules.<name>]`
/// settings table.
#[derive(Clone, Debug, Default)]
pub struct LookupContext {
	pub credentials: Credentials,
	pub settings: Map<String, Value>,
}

/// The unstructured result of one attempt. Always recorded, even when the patch is rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvidence {
	pub identifier: String,
	pub kind: String,
	pub payload: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LookupOutcome {
	pub status: Outcome,
	pub schema_patch: SchemaPatch,
	pub raw: RawEvidence,
	pub diagnostics: Vec<String>,
	pub identifiers: Vec<Identifier>,
	pub correlations: Vec<Correlation>,
	pub signals: Signals,
}
impl LookupOutcome {
	pub fn new(status: Outcome, identifier: &str, kind: &str, payload: Map<String, Value>) -> Self {
		Self {
			status,
			schema_patch: SchemaPatch::new(),
			raw: RawEvidence {
				identifier: identifier.to_string(),
				kind: kind.to_string(),
				payload,
			},
			diagnostics: Vec::new(),
			identifiers: Vec::new(),
			correlations: Vec::new(),
			signals: Signals::default(),
		}
	}

	pub fn with_patch(mut self, patch: SchemaPatch) -> Self {
		self.schema_patch = patch;

		self
	}

	pub fn with_diagnostic(mut self, message: impl Into<String>) -> Self {
		self.diagnostics.push(message.into());

		self
	}
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
	#[error("Lookup timed out.")]
	Timeout,
	#[error("Source answered with HTTP {status}: {message}")]
	Http { status: u16, message: String },
	#[error("Transport failure: {message}")]
	Transport { message: String },
	#[error("{message}")]
	Fatal { message: String },
}
impl LookupError {
	pub fn fatal(message: impl Into<String>) -> Self {
		Self::Fatal { message: message.into() }
	}

	/// Timeouts, transport failures, HTTP 5xx and HTTP 429 are retried.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Timeout | Self::Transport { .. } => true,
			Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
			Self::Fatal { .. } => false,
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Timeout => ErrorKind::Timeout,
			Self::Http { .. } | Self::Transport { .. } => ErrorKind::HttpError,
			Self::Fatal { .. } => ErrorKind::Exception,
		}
	}
}
impl From<dossier_providers::Error> for LookupError {
	fn from(err: dossier_providers::Error) -> Self {
		if err.is_timeout() {
			return Self::Timeout;
		}
		if let Some(status) = err.status() {
			return Self::Http { status, message: err.to_string() };
		}
		if err.is_connect() {
			return Self::Transport { message: err.to_string() };
		}

		Self::Fatal { message: err.to_string() }
	}
}
