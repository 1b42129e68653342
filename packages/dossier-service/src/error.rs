pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid module descriptor {module}: {message}")]
	Descriptor { module: String, message: String },
	#[error("Registry error: {message}")]
	Registry { message: String },
	#[error("Invalid configuration: {message}")]
	Config { message: String },
	#[error("Planner invariant violated: {message}")]
	PlannerInvariant { message: String },
	#[error("Investigation is already finished; the profile is frozen.")]
	Finished,
	#[error(transparent)]
	Storage(#[from] dossier_storage::Error),
	#[error(transparent)]
	Provider(#[from] dossier_providers::Error),
}
impl From<crate::planner::PlannerError> for Error {
	fn from(err: crate::planner::PlannerError) -> Self {
		Self::PlannerInvariant { message: err.to_string() }
	}
}
