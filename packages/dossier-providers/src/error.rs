pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error("Request to {url} timed out.")]
	Timeout { url: String },
	#[error("{url} answered with HTTP {status}.")]
	Status { status: u16, url: String },
	#[error("{message}")]
	InvalidConfig { message: String },
	#[error("{message}")]
	InvalidResponse { message: String },
}
impl Error {
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Status { status, .. } => Some(*status),
			Self::Reqwest(err) => err.status().map(|status| status.as_u16()),
			_ => None,
		}
	}

	pub fn is_timeout(&self) -> bool {
		match self {
			Self::Timeout { .. } => true,
			Self::Reqwest(err) => err.is_timeout(),
			_ => false,
		}
	}

	/// Connection-level failures that never produced a response.
	pub fn is_connect(&self) -> bool {
		matches!(self, Self::Reqwest(err) if err.is_connect() || err.is_request())
	}
}
