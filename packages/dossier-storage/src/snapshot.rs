use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use dossier_domain::Profile;

use crate::{Error, ExecutionHistory, HistoryEntry, ProfileStore, Result};

pub const SNAPSHOT_FORMAT: &str = "dossier.snapshot.v1";

/// Durable investigation state. Serialized with sorted keys at every depth, so exporting the same
/// state twice yields identical bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSnapshot {
	pub format: String,
	pub profile: Profile,
	pub history: Vec<HistoryEntry>,
}
impl InvestigationSnapshot {
	pub fn new(profile: Profile, history: Vec<HistoryEntry>) -> Self {
		Self { format: SNAPSHOT_FORMAT.to_string(), profile, history }
	}

	pub fn capture(store: &ProfileStore, history: &ExecutionHistory) -> Self {
		Self::new(Profile::clone(&store.snapshot()), history.snapshot())
	}

	pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
		// Round-tripping through `Value` sorts every object's keys.
		let value = serde_json::to_value(self)?;
		let mut bytes = serde_json::to_vec_pretty(&value)?;

		bytes.push(b'\n');

		Ok(bytes)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		let snapshot: Self = serde_json::from_slice(bytes)?;

		if snapshot.format != SNAPSHOT_FORMAT {
			return Err(Error::UnsupportedFormat {
				found: snapshot.format,
				expected: SNAPSHOT_FORMAT,
			});
		}

		Ok(snapshot)
	}

	/// Writes to a sibling temporary file and renames it into place.
	pub fn write(&self, path: &Path) -> Result<()> {
		let bytes = self.to_canonical_bytes()?;
		let tmp = path.with_extension("tmp");

		fs::write(&tmp, bytes).map_err(|err| Error::Io { path: tmp.clone(), source: err })?;
		fs::rename(&tmp, path).map_err(|err| Error::Io { path: path.to_path_buf(), source: err })
	}

	pub fn read(path: &Path) -> Result<Self> {
		let bytes =
			fs::read(path).map_err(|err| Error::Io { path: path.to_path_buf(), source: err })?;

		Self::from_bytes(&bytes)
	}

	/// Rebuilds live stores from the snapshot, validating both.
	pub fn restore(self) -> Result<(ProfileStore, ExecutionHistory)> {
		Ok((ProfileStore::new(self.profile)?, ExecutionHistory::from_entries(self.history)?))
	}
}
