mod error;

pub use error::{Error, Result};

use std::{
	collections::VecDeque,
	sync::{Arc, Mutex},
	time::Duration,
};

use serde_json::{Map, Value, json};
use time::{OffsetDateTime, macros::datetime};
use tokio::time::Instant;
use uuid::Uuid;

use dossier_config::Config;
use dossier_domain::{Identifier, IdentifierKind, Profile, SchemaPatch};
use dossier_service::{
	BoxFuture, Lookup, LookupContext, LookupError, LookupOutcome, ModuleDescriptor, Registry,
};
use dossier_storage::{Outcome, ProfileStore};

/// Fixed clock reading for deterministic tests.
pub const T0: OffsetDateTime = datetime!(2026-03-01 09:00 UTC);

/// One scripted response. The delay runs on the tokio clock, so paused-time tests advance it
/// instantly.
#[derive(Clone, Debug)]
pub struct Step {
	pub delay: Duration,
	pub result: Result<LookupOutcome, LookupError>,
}

/// A lookup that replays a queue of responses and records when it was called.
pub struct ScriptedLookup {
	descriptor: ModuleDescriptor,
	steps: Mutex<VecDeque<Step>>,
	fallback: Step,
	calls: Mutex<Vec<Instant>>,
}
impl ScriptedLookup {
	/// Answers every call with an empty successful outcome until steps are queued.
	pub fn new(descriptor: ModuleDescriptor) -> Self {
		let fallback = Step { delay: Duration::ZERO, result: Ok(empty_outcome(&descriptor.name)) };

		Self {
			descriptor,
			steps: Mutex::new(VecDeque::new()),
			fallback,
			calls: Mutex::new(Vec::new()),
		}
	}

	pub fn then(self, delay: Duration, result: Result<LookupOutcome, LookupError>) -> Self {
		self.steps.lock().unwrap_or_else(|err| err.into_inner()).push_back(Step { delay, result });

		self
	}

	pub fn then_ok(self, outcome: LookupOutcome) -> Self {
		self.then(Duration::ZERO, Ok(outcome))
	}

	pub fn then_err(self, err: LookupError) -> Self {
		self.then(Duration::ZERO, Err(err))
	}

	/// Response used once the queue is drained.
	pub fn otherwise(
		mut self,
		delay: Duration,
		result: Result<LookupOutcome, LookupError>,
	) -> Self {
		self.fallback = Step { delay, result };

		self
	}

	pub fn calls(&self) -> Vec<Instant> {
		self.calls.lock().unwrap_or_else(|err| err.into_inner()).clone()
	}

	pub fn call_count(&self) -> usize {
		self.calls.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	fn next_step(&self) -> Step {
		self.calls.lock().unwrap_or_else(|err| err.into_inner()).push(Instant::now());

		self.steps
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.pop_front()
			.unwrap_or_else(|| self.fallback.clone())
	}
}
impl Lookup for ScriptedLookup {
	fn descriptor(&self) -> &ModuleDescriptor {
		&self.descriptor
	}

	fn execute<'a>(
		&'a self,
		_: &'a Profile,
		_: &'a LookupContext,
	) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
		let step = self.next_step();

		Box::pin(async move {
			if !step.delay.is_zero() {
				tokio::time::sleep(step.delay).await;
			}

			step.result
		})
	}
}

/// A successful outcome carrying `patch`, with a small raw payload naming the module.
pub fn outcome(module: &str, patch: SchemaPatch) -> LookupOutcome {
	empty_outcome(module).with_patch(patch)
}

pub fn empty_outcome(module: &str) -> LookupOutcome {
	LookupOutcome::new(Outcome::Success, "subject", module, object(json!({ "module": module })))
}

/// Defaults with no spacing, short backoff and a small budget.
pub fn config() -> Config {
	let mut cfg = Config::default();

	cfg.engine.module_budget = 8;
	cfg.engine.stop_gap_threshold = 0.0;
	cfg.runner.base_backoff_ms = 100;
	cfg.runner.max_backoff_ms = 1_000;
	cfg.runner.attempt_timeout_ms = 5_000;

	cfg
}

pub fn registry(cfg: &Config, lookups: Vec<Arc<ScriptedLookup>>) -> Result<Registry> {
	let catalog: Vec<Arc<dyn Lookup>> =
		lookups.into_iter().map(|lookup| lookup as Arc<dyn Lookup>).collect();

	Ok(Registry::from_catalog(cfg, catalog)?)
}

pub fn seeds(name: &str) -> Vec<Identifier> {
	vec![Identifier::new(IdentifierKind::Name, name)]
}

pub fn store(seeds: &[Identifier]) -> Result<Arc<ProfileStore>> {
	Ok(Arc::new(ProfileStore::initialize(Uuid::nil(), seeds, "dossier-test", T0)?))
}

pub fn object(value: Value) -> Map<String, Value> {
	match value {
		Value::Object(map) => map,
		_ => Map::new(),
	}
}
