use std::{
	collections::{BTreeMap, BTreeSet, VecDeque},
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::{
	sync::watch,
	time::{self, Instant},
};

use dossier_config::Runner;
use dossier_domain::Profile;
use dossier_storage::{ErrorKind, Outcome};

use crate::{Lookup, LookupContext, LookupError, LookupOutcome};

const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Investigation-wide cancellation flag. Clones share the same flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
	tx: Arc<watch::Sender<bool>>,
	rx: watch::Receiver<bool>,
}
impl CancelToken {
	pub fn new() -> Self {
		let (tx, rx) = watch::channel(false);

		Self { tx: Arc::new(tx), rx }
	}

	pub fn cancel(&self) {
		self.tx.send_replace(true);
	}

	pub fn is_cancelled(&self) -> bool {
		*self.rx.borrow()
	}

	/// Resolves once [`CancelToken::cancel`] has been called on any clone.
	pub async fn cancelled(&self) {
		let mut rx = self.rx.clone();

		if rx.wait_for(|cancelled| *cancelled).await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}
impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug)]
pub enum AttemptResult {
	Completed(LookupOutcome),
	Failed { kind: ErrorKind, message: String },
}

/// What happened to one module run, after retries.
#[derive(Debug)]
pub struct AttemptReport {
	pub module: String,
	/// Calls issued against the source. Zero when the run short-circuited.
	pub attempts: u32,
	pub result: AttemptResult,
}
impl AttemptReport {
	fn failed(module: &str, attempts: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			module: module.to_string(),
			attempts,
			result: AttemptResult::Failed { kind, message: message.into() },
		}
	}
}

#[derive(Debug, Default)]
struct RateClassState {
	next_slot: Option<Instant>,
	failures: VecDeque<Instant>,
	open_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct RunnerState {
	classes: BTreeMap<String, RateClassState>,
	fatals: BTreeMap<String, VecDeque<Instant>>,
}

/// Executes lookups under per-rate-class spacing and circuit breakers, with per-attempt
/// timeouts, bounded retries and module quarantine.
#[derive(Debug)]
pub struct ModuleRunner {
	cfg: Runner,
	state: Mutex<RunnerState>,
}
impl ModuleRunner {
	pub fn new(cfg: Runner) -> Self {
		Self { cfg, state: Mutex::new(RunnerState::default()) }
	}

	pub async fn run(
		&self,
		lookup: Arc<dyn Lookup>,
		profile: Arc<Profile>,
		ctx: Arc<LookupContext>,
		cancel: CancelToken,
	) -> AttemptReport {
		let descriptor = lookup.descriptor();
		let module = descriptor.name.as_str();
		let rate_class = descriptor.rate_class.as_str();
		let attempt_timeout = Duration::from_millis(self.cfg.attempt_timeout_ms);
		let mut calls = 0;

		loop {
			if cancel.is_cancelled() {
				return AttemptReport::failed(module, calls, ErrorKind::Cancelled, "cancelled");
			}
			if let Some(until) = self.open_until(rate_class) {
				return AttemptReport::failed(
					module,
					calls,
					ErrorKind::CircuitOpen,
					format!(
						"circuit open for rate class {rate_class} for another {} ms",
						until.saturating_duration_since(Instant::now()).as_millis()
					),
				);
			}

			let slot = self.reserve_slot(rate_class);

			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					return AttemptReport::failed(module, calls, ErrorKind::Cancelled, "cancelled");
				},
				_ = time::sleep_until(slot) => {},
			}

			if self.open_until(rate_class).is_some() {
				continue;
			}

			calls += 1;

			tracing::debug!(module, rate_class, attempt = calls, "Calling lookup.");

			let result = tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					return AttemptReport::failed(module, calls, ErrorKind::Cancelled, "cancelled");
				},
				result = time::timeout(attempt_timeout, lookup.execute(&profile, &ctx)) => {
					result.unwrap_or(Err(LookupError::Timeout))
				},
			};
			let err = match result {
				Ok(outcome) => {
					// A source that answers with a failure outcome still counts against its
					// breaker. It is not retried.
					if outcome.status == Outcome::Failure {
						self.record_failure(rate_class);
					} else {
						self.record_success(rate_class);
					}

					return AttemptReport {
						module: module.to_string(),
						attempts: calls,
						result: AttemptResult::Completed(outcome),
					};
				},
				Err(err) => err,
			};

			self.record_failure(rate_class);

			if !err.is_transient() {
				self.record_fatal(module);

				return AttemptReport::failed(module, calls, err.kind(), err.to_string());
			}
			if calls > self.cfg.max_retries {
				return AttemptReport::failed(module, calls, err.kind(), err.to_string());
			}

			let backoff =
				backoff_for_attempt(calls, self.cfg.base_backoff_ms, self.cfg.max_backoff_ms);

			tracing::debug!(
				module,
				attempt = calls,
				backoff_ms = backoff.as_millis() as u64,
				error = %err,
				"Retrying lookup."
			);

			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					return AttemptReport::failed(module, calls, ErrorKind::Cancelled, "cancelled");
				},
				_ = time::sleep(backoff) => {},
			}
		}
	}

	pub fn is_quarantined(&self, module: &str) -> bool {
		let now = Instant::now();
		let mut state = self.lock();

		state.fatals.get_mut(module).is_some_and(|fatals| self.quarantine_active(fatals, now))
	}

	/// Modules currently excluded from planning.
	pub fn quarantined(&self) -> BTreeSet<String> {
		let now = Instant::now();
		let mut state = self.lock();

		state
			.fatals
			.iter_mut()
			.filter_map(|(module, fatals)| {
				self.quarantine_active(fatals, now).then(|| module.clone())
			})
			.collect()
	}

	/// Counts a run that died outside [`ModuleRunner::run`], such as a panicking lookup, as both a
	/// source failure and a fatal module error.
	pub fn record_crash(&self, module: &str, rate_class: &str) {
		self.record_failure(rate_class);
		self.record_fatal(module);
	}

	pub fn is_circuit_open(&self, rate_class: &str) -> bool {
		self.open_until(rate_class).is_some()
	}

	/// Earliest instant at which an open breaker closes again.
	pub fn next_breaker_reset(&self) -> Option<Instant> {
		let now = Instant::now();

		self.lock()
			.classes
			.values()
			.filter_map(|class| class.open_until)
			.filter(|at| *at > now)
			.min()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, RunnerState> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}

	fn min_spacing(&self, rate_class: &str) -> Duration {
		let millis = self
			.cfg
			.rate_classes
			.get(rate_class)
			.map_or(self.cfg.default_min_spacing_ms, |class| class.min_spacing_ms);

		Duration::from_millis(millis)
	}

	/// Claims the next call slot for `rate_class`. Concurrent callers get slots spaced at least
	/// the class minimum apart.
	fn reserve_slot(&self, rate_class: &str) -> Instant {
		let now = Instant::now();
		let spacing = self.min_spacing(rate_class);
		let mut state = self.lock();
		let class = state.classes.entry(rate_class.to_string()).or_default();
		let slot = class.next_slot.map_or(now, |next| next.max(now));

		class.next_slot = Some(slot + spacing);

		slot
	}

	fn open_until(&self, rate_class: &str) -> Option<Instant> {
		let now = Instant::now();
		let mut state = self.lock();
		let class = state.classes.get_mut(rate_class)?;

		match class.open_until {
			Some(until) if until > now => Some(until),
			Some(_) => {
				class.open_until = None;

				tracing::info!(rate_class, "Circuit breaker reset.");

				None
			},
			None => None,
		}
	}

	fn record_success(&self, rate_class: &str) {
		let mut state = self.lock();

		if let Some(class) = state.classes.get_mut(rate_class) {
			class.failures.clear();
		}
	}

	fn record_failure(&self, rate_class: &str) {
		let breaker = &self.cfg.circuit_breaker;
		let now = Instant::now();
		let window = Duration::from_millis(breaker.window_ms);
		let mut state = self.lock();
		let class = state.classes.entry(rate_class.to_string()).or_default();

		class.failures.push_back(now);

		while class.failures.front().is_some_and(|at| now.duration_since(*at) > window) {
			class.failures.pop_front();
		}

		if class.failures.len() >= breaker.failure_threshold as usize {
			class.failures.clear();
			class.open_until = Some(now + Duration::from_millis(breaker.cooldown_ms));

			tracing::warn!(
				rate_class,
				cooldown_ms = breaker.cooldown_ms,
				"Circuit breaker opened after consecutive failures."
			);
		}
	}

	fn record_fatal(&self, module: &str) {
		let now = Instant::now();
		let mut state = self.lock();
		let fatals = state.fatals.entry(module.to_string()).or_default();

		fatals.push_back(now);

		if self.quarantine_active(fatals, now) {
			tracing::warn!(module, "Module quarantined after repeated fatal errors.");
		}
	}

	fn quarantine_active(&self, fatals: &mut VecDeque<Instant>, now: Instant) -> bool {
		let window = Duration::from_millis(self.cfg.quarantine.window_ms);

		while fatals.front().is_some_and(|at| now.duration_since(*at) >= window) {
			fatals.pop_front();
		}

		fatals.len() >= self.cfg.quarantine.max_fatals as usize
	}
}

/// Exponential backoff starting at `base_ms` for the first retry, capped at `max_ms`.
pub fn backoff_for_attempt(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
	let exp = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
	let base = base_ms.saturating_mul(1 << exp);

	Duration::from_millis(base.min(max_ms))
}
