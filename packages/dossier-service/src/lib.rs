pub mod engine;
pub mod investigation;
pub mod lookup;
pub mod lookups;
pub mod planner;
pub mod registry;
pub mod runner;

mod error;

pub use engine::{Engine, EngineState, RunSummary, StopReason};
pub use error::{Error, Result};
pub use investigation::Investigation;
pub use lookup::{BoxFuture, Lookup, LookupContext, LookupError, LookupOutcome, RawEvidence};
pub use planner::{GapReport, PlanContext, PlannerError, Suggestion};
pub use registry::{ModuleDescriptor, Pivot, Registry};
pub use runner::{AttemptReport, AttemptResult, CancelToken, ModuleRunner};
