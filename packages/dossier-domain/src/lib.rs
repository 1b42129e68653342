pub mod enrichment;
pub mod normalize;
pub mod profile;
pub mod schema;
pub mod scoring;

pub use enrichment::{
	Correlation, Enrichment, EnrichmentMetadata, Identifier, IdentifierKind, RawResult, Scores,
	Signals,
};
pub use profile::{AuditRecord, MutationOutcome, Profile, ProfileStatus, SchemaPatch, SectionData};
pub use schema::{FieldPath, FieldSpec, Section, Shape, ValueKind, Violation, ViolationCode};
