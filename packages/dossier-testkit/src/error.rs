pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("{0}")]
	Message(String),

	#[error(transparent)]
	Storage(#[from] dossier_storage::Error),

	#[error(transparent)]
	Service(#[from] dossier_service::Error),
}
