use std::{sync::Arc, time::Duration};

use dossier_config::{Planner, RateClass, Runner};
use dossier_domain::{Profile, Section};
use dossier_service::{
	AttemptReport, AttemptResult, BoxFuture, CancelToken, Lookup, LookupContext, LookupError,
	LookupOutcome, ModuleDescriptor, ModuleRunner, Suggestion,
	investigation::{Investigation, Task},
};
use dossier_storage::{ErrorKind, ExecutionHistory, Outcome};
use dossier_testkit::ScriptedLookup;

/// Panics instead of answering.
struct Crashing(ModuleDescriptor);
impl Lookup for Crashing {
	fn descriptor(&self) -> &ModuleDescriptor {
		&self.0
	}

	fn execute<'a>(
		&'a self,
		_: &'a Profile,
		_: &'a LookupContext,
	) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
		panic!("lookup crashed")
	}
}

fn runner_cfg() -> Runner {
	dossier_testkit::config().runner
}

fn profile() -> Arc<Profile> {
	dossier_testkit::store(&dossier_testkit::seeds("Jane Doe"))
		.expect("Failed to seed store.")
		.snapshot()
}

fn lookup(name: &str, rate_class: &str) -> ScriptedLookup {
	ScriptedLookup::new(ModuleDescriptor::new(name, &[Section::Digital]).rate_class(rate_class))
}

async fn run(
	runner: &ModuleRunner,
	lookup: &Arc<ScriptedLookup>,
	cancel: &CancelToken,
) -> AttemptReport {
	let lookup: Arc<dyn Lookup> = Arc::clone(lookup) as Arc<dyn Lookup>;

	runner.run(lookup, profile(), Arc::default(), cancel.clone()).await
}

fn failure_kind(report: &AttemptReport) -> Option<ErrorKind> {
	match &report.result {
		AttemptResult::Failed { kind, .. } => Some(*kind),
		AttemptResult::Completed(_) => None,
	}
}

fn unavailable() -> LookupError {
	LookupError::Http { status: 503, message: "unavailable".to_string() }
}

#[tokio::test(start_paused = true)]
async fn ready_modules_sharing_a_rate_class_are_spaced() {
	let mut cfg = runner_cfg();

	cfg.rate_classes.insert("dns".to_string(), RateClass { min_spacing_ms: 500 });

	let runner = ModuleRunner::new(cfg);
	let p = Arc::new(lookup("module_p", "dns"));
	let q = Arc::new(lookup("module_q", "dns"));
	let cancel = CancelToken::new();
	let (first, second) = tokio::join!(run(&runner, &p, &cancel), run(&runner, &q, &cancel));

	assert!(matches!(first.result, AttemptResult::Completed(_)));
	assert!(matches!(second.result, AttemptResult::Completed(_)));

	let mut calls = [p.calls(), q.calls()].concat();

	calls.sort();

	assert_eq!(calls.len(), 2);
	assert!(calls[1] - calls[0] >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_open_the_breaker_until_cooldown() {
	let mut cfg = runner_cfg();

	cfg.max_retries = 2;
	cfg.circuit_breaker.failure_threshold = 3;
	cfg.circuit_breaker.window_ms = 60_000;
	cfg.circuit_breaker.cooldown_ms = 120_000;

	let runner = ModuleRunner::new(cfg);
	let crtsh = Arc::new(
		lookup("crtsh", "ct_logs").otherwise(Duration::ZERO, Err(unavailable())),
	);
	let sibling = Arc::new(lookup("crtsh_mirror", "ct_logs"));
	let cancel = CancelToken::new();
	let failed = run(&runner, &crtsh, &cancel).await;

	assert_eq!(failed.attempts, 3);
	assert_eq!(failure_kind(&failed), Some(ErrorKind::HttpError));
	assert!(runner.is_circuit_open("ct_logs"));

	let short_circuited = run(&runner, &sibling, &cancel).await;

	assert_eq!(short_circuited.attempts, 0);
	assert_eq!(failure_kind(&short_circuited), Some(ErrorKind::CircuitOpen));
	assert_eq!(sibling.call_count(), 0);

	tokio::time::advance(Duration::from_millis(120_001)).await;

	let recovered = run(&runner, &sibling, &cancel).await;

	assert!(matches!(recovered.result, AttemptResult::Completed(_)));
	assert_eq!(sibling.call_count(), 1);
	assert!(!runner.is_circuit_open("ct_logs"));
}

#[tokio::test(start_paused = true)]
async fn a_success_resets_the_failure_run() {
	let mut cfg = runner_cfg();

	cfg.max_retries = 0;
	cfg.circuit_breaker.failure_threshold = 3;

	let runner = ModuleRunner::new(cfg);
	let flaky = Arc::new(
		lookup("flaky", "shared")
			.then_err(unavailable())
			.then_err(unavailable())
			.then_ok(dossier_testkit::empty_outcome("flaky"))
			.then_err(unavailable())
			.then_err(unavailable()),
	);
	let cancel = CancelToken::new();

	for _ in 0..5 {
		run(&runner, &flaky, &cancel).await;
	}

	assert_eq!(flaky.call_count(), 5);
	assert!(!runner.is_circuit_open("shared"));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_with_backoff() {
	let runner = ModuleRunner::new(runner_cfg());
	let flaky = Arc::new(
		lookup("flaky", "flaky")
			.then_err(LookupError::Http { status: 429, message: "slow down".to_string() })
			.then_err(LookupError::Timeout),
	);
	let report = run(&runner, &flaky, &CancelToken::new()).await;
	let calls = flaky.calls();

	assert!(matches!(report.result, AttemptResult::Completed(_)));
	assert_eq!(report.attempts, 3);
	assert!(calls[1] - calls[0] >= Duration::from_millis(100));
	assert!(calls[2] - calls[1] >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out() {
	let mut cfg = runner_cfg();

	cfg.max_retries = 0;
	cfg.attempt_timeout_ms = 1_000;

	let runner = ModuleRunner::new(cfg);
	let slow = Arc::new(lookup("slow", "slow").otherwise(
		Duration::from_secs(30),
		Ok(dossier_testkit::empty_outcome("slow")),
	));
	let report = run(&runner, &slow, &CancelToken::new()).await;

	assert_eq!(failure_kind(&report), Some(ErrorKind::Timeout));
	assert_eq!(report.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_an_in_flight_call() {
	let runner = ModuleRunner::new(runner_cfg());
	let slow = Arc::new(lookup("slow", "slow").otherwise(
		Duration::from_secs(3),
		Ok(dossier_testkit::empty_outcome("slow")),
	));
	let cancel = CancelToken::new();
	let (report, _) = tokio::join!(run(&runner, &slow, &cancel), async {
		tokio::time::sleep(Duration::from_secs(1)).await;
		cancel.cancel();
	});

	assert_eq!(failure_kind(&report), Some(ErrorKind::Cancelled));
	assert_eq!(slow.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_fatal_errors_quarantine_a_module() {
	let mut cfg = runner_cfg();

	cfg.quarantine.max_fatals = 2;
	cfg.quarantine.window_ms = 60_000;

	let runner = ModuleRunner::new(cfg);
	let broken = Arc::new(
		lookup("broken", "broken").otherwise(Duration::ZERO, Err(LookupError::fatal("bad parse"))),
	);
	let cancel = CancelToken::new();
	let first = run(&runner, &broken, &cancel).await;

	assert_eq!(first.attempts, 1);
	assert_eq!(failure_kind(&first), Some(ErrorKind::Exception));
	assert!(!runner.is_quarantined("broken"));

	run(&runner, &broken, &cancel).await;

	assert!(runner.is_quarantined("broken"));
	assert!(runner.quarantined().contains("broken"));

	tokio::time::advance(Duration::from_secs(61)).await;

	assert!(!runner.is_quarantined("broken"));
}

#[tokio::test(start_paused = true)]
async fn failure_outcomes_count_against_the_breaker() {
	let mut cfg = runner_cfg();

	cfg.circuit_breaker.failure_threshold = 3;

	let runner = ModuleRunner::new(cfg);
	let mut failing = dossier_testkit::empty_outcome("crtsh");

	failing.status = Outcome::Failure;

	let crtsh = Arc::new(lookup("crtsh", "ct_logs").otherwise(Duration::ZERO, Ok(failing)));
	let cancel = CancelToken::new();
	let first = run(&runner, &crtsh, &cancel).await;

	assert_eq!(first.attempts, 1);
	assert!(matches!(first.result, AttemptResult::Completed(_)));

	for _ in 0..4 {
		run(&runner, &crtsh, &cancel).await;
	}

	assert_eq!(crtsh.call_count(), 3);
	assert!(runner.is_circuit_open("ct_logs"));
}

#[tokio::test]
async fn crashed_lookups_count_as_fatal_failures() {
	let mut cfg = runner_cfg();

	cfg.quarantine.max_fatals = 2;
	cfg.circuit_breaker.failure_threshold = 2;

	let runner = Arc::new(ModuleRunner::new(cfg));
	let investigation = Investigation::new(
		dossier_testkit::store(&dossier_testkit::seeds("Jane Doe")).expect("Failed to seed store."),
		Arc::new(ExecutionHistory::new()),
		Arc::clone(&runner),
		Planner::default(),
		1,
	);
	let lookup: Arc<dyn Lookup> = Arc::new(Crashing(
		ModuleDescriptor::new("crashy", &[Section::Geo]).rate_class("fragile"),
	));
	let suggestion = Suggestion {
		module: "crashy".to_string(),
		score: 1.0,
		gap_contribution: 1.0,
		pivot: "*".to_string(),
		pivot_hash: "crashy".to_string(),
	};

	for _ in 0..2 {
		let task = Task {
			suggestion: suggestion.clone(),
			lookup: Arc::clone(&lookup),
			ctx: Arc::default(),
		};
		let entries = investigation
			.execute_batch(vec![task], &CancelToken::new())
			.await
			.expect("Batch ran.");

		assert_eq!(entries[0].outcome, Outcome::Failure);
		assert_eq!(entries[0].error_kind, Some(ErrorKind::Exception));
	}

	assert!(runner.is_quarantined("crashy"));
	assert!(runner.is_circuit_open("fragile"));
}
