//! Access to the worklist files in the entries directory.
//!
//! The store keeps no state besides its location: every call goes to the filesystem.

use crate::codec::{self, DecodeError, EncodeError};
use crate::dataset::Dataset;
use crate::error::Partial;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default file extension of worklist entries.
pub const DEFAULT_EXTENSION: &str = "wl";

#[derive(Debug, Error)]
pub enum EntryError {
	#[error("Failed to access {}: {source}", path.display())]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to decode {}: {source}", path.display())]
	Decode { path: PathBuf, source: DecodeError },
	#[error("Failed to encode {}: {source}", path.display())]
	Encode { path: PathBuf, source: EncodeError },
}

impl EntryError {
	/// The file the error refers to.
	pub fn path(&self) -> &Path {
		match self {
			Self::Io { path, .. } | Self::Decode { path, .. } | Self::Encode { path, .. } => path,
		}
	}
}

/// A worklist entry and the file it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct WorklistEntry {
	pub path: PathBuf,
	pub dataset: Dataset,
}

#[derive(Debug, Clone)]
pub struct EntryStore {
	dir: PathBuf,
	extension: String,
}

impl EntryStore {
	pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
		Self {
			dir: dir.into(),
			extension: extension.into(),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn extension(&self) -> &str {
		&self.extension
	}

	/// Whether `path` has the worklist extension.
	pub fn is_entry(&self, path: &Path) -> bool {
		path.extension()
			.is_some_and(|extension| extension == self.extension.as_str())
	}

	/// Reads and decodes all entries, sorted by path.
	///
	/// Files that cannot be read or decoded are skipped; their errors are returned
	/// together with the entries that could be read.
	pub fn list_entries(&self) -> Partial<Vec<WorklistEntry>, EntryError> {
		let mut errors = Vec::new();
		let paths = match self.entry_paths() {
			Ok(paths) => paths,
			Err(err) => {
				warn!("{err}");
				return Partial::new(Vec::new(), vec![err]);
			}
		};

		let mut entries = Vec::with_capacity(paths.len());
		for path in paths {
			match self.read_entry(&path) {
				Ok(entry) => entries.push(entry),
				Err(err) => {
					warn!("Skipped worklist entry: {err}");
					errors.push(err);
				}
			}
		}

		debug!(
			entries = entries.len(),
			errors = errors.len(),
			dir = %self.dir.display(),
			"Listed worklist entries"
		);
		Partial::new(entries, errors)
	}

	fn entry_paths(&self) -> Result<Vec<PathBuf>, EntryError> {
		let io_error = |source| EntryError::Io {
			path: self.dir.clone(),
			source,
		};

		let mut paths = Vec::new();
		for entry in std::fs::read_dir(&self.dir).map_err(io_error)? {
			let path = entry.map_err(io_error)?.path();
			if path.is_file() && self.is_entry(&path) {
				paths.push(path);
			}
		}
		paths.sort();
		Ok(paths)
	}

	pub fn read_entry(&self, path: &Path) -> Result<WorklistEntry, EntryError> {
		let bytes = std::fs::read(path).map_err(|source| EntryError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		let dataset = codec::decode(&bytes).map_err(|source| EntryError::Decode {
			path: path.to_path_buf(),
			source,
		})?;

		Ok(WorklistEntry {
			path: path.to_path_buf(),
			dataset,
		})
	}

	/// Writes `dataset` as entry `name` (without extension) and returns its path.
	///
	/// The file is written next to its destination first and then renamed, so
	/// readers of the directory never observe a partially written entry.
	pub fn write_entry(&self, name: &str, dataset: &Dataset) -> Result<PathBuf, EntryError> {
		let path = self.dir.join(format!("{name}.{}", self.extension));
		let bytes = codec::encode(dataset).map_err(|source| EntryError::Encode {
			path: path.clone(),
			source,
		})?;

		let staging = self.dir.join(format!(".{name}.tmp"));
		let io_error = |source| EntryError::Io {
			path: path.clone(),
			source,
		};
		std::fs::write(&staging, bytes).map_err(io_error)?;
		if let Err(err) = std::fs::rename(&staging, &path) {
			let _ = std::fs::remove_file(&staging);
			return Err(io_error(err));
		}

		info!(path = %path.display(), "Wrote worklist entry");
		Ok(path)
	}

	pub fn remove_entry(&self, path: &Path) -> Result<(), EntryError> {
		std::fs::remove_file(path).map_err(|source| EntryError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		info!(path = %path.display(), "Removed worklist entry");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;

	fn dataset(patient_id: &str) -> Dataset {
		[DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from(patient_id),
		)]
		.into_iter()
		.collect()
	}

	fn patient_id(entry: &WorklistEntry) -> String {
		let element = entry.dataset.get(tags::PATIENT_ID).unwrap();
		element.to_str().unwrap().trim_end().to_string()
	}

	#[test]
	fn lists_valid_entries_and_reports_invalid_ones() {
		let dir = tempfile::tempdir().unwrap();
		let store = EntryStore::new(dir.path(), DEFAULT_EXTENSION);
		store.write_entry("a", &dataset("P-A")).unwrap();
		store.write_entry("c", &dataset("P-C")).unwrap();
		std::fs::write(dir.path().join("b.wl"), b"").unwrap();
		std::fs::write(dir.path().join("notes.txt"), b"not an entry").unwrap();

		let result = store.list_entries();
		let ids: Vec<_> = result.value.iter().map(patient_id).collect();
		assert_eq!(ids, vec!["P-A", "P-C"]);

		let error = result.error.unwrap();
		assert_eq!(error.len(), 1);
		assert_eq!(error.causes()[0].path(), dir.path().join("b.wl"));
		assert!(error.to_string().contains("b.wl"));
	}

	#[test]
	fn missing_directory_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		let store = EntryStore::new(dir.path().join("missing"), DEFAULT_EXTENSION);

		let result = store.list_entries();
		assert!(result.value.is_empty());
		assert!(matches!(
			result.error.unwrap().causes(),
			[EntryError::Io { .. }]
		));
	}

	#[test]
	fn writes_complete_entries() {
		let dir = tempfile::tempdir().unwrap();
		let store = EntryStore::new(dir.path(), "wl");

		let path = store.write_entry("exam-1", &dataset("P-1")).unwrap();
		assert_eq!(path, dir.path().join("exam-1.wl"));
		assert!(!dir.path().join(".exam-1.tmp").exists());

		let entry = store.read_entry(&path).unwrap();
		assert_eq!(patient_id(&entry), "P-1");

		let file = dicom::object::open_file(&path).unwrap();
		assert_eq!(
			file.meta().media_storage_sop_class_uid(),
			dicom::dictionary_std::uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND
		);
	}

	#[test]
	fn removes_entries() {
		let dir = tempfile::tempdir().unwrap();
		let store = EntryStore::new(dir.path(), "wl");
		let path = store.write_entry("exam-1", &dataset("P-1")).unwrap();

		store.remove_entry(&path).unwrap();
		assert!(!path.exists());
		assert!(matches!(
			store.remove_entry(&path),
			Err(EntryError::Io { .. })
		));
	}
}
