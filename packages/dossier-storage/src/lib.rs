pub mod history;
pub mod profile_store;
pub mod snapshot;

mod error;

pub use error::Error;
pub use history::{ErrorKind, ExecutionHistory, HistoryEntry, Outcome};
pub use profile_store::{EvidenceReceipt, EvidenceRecord, ProfileStore};
pub use snapshot::InvestigationSnapshot;

pub type Result<T, E = Error> = std::result::Result<T, E>;
