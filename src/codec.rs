//! Binary encoding of worklist entries, delegated to `dicom-rs`.

use crate::dataset::Dataset;
use crate::types::UI;
use dicom::dictionary_std::uids;
use dicom::object::{
	FileDicomObject, FileMetaTableBuilder, InMemDicomObject, ReadError, WriteError,
};
use std::io::Cursor;
use thiserror::Error;
use uuid::Uuid;

/// Length of the file preamble that precedes the `DICM` magic code.
const PREAMBLE_LENGTH: usize = 128;
const MAGIC_CODE: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("File is empty")]
	Empty,
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] ReadError),
}

#[derive(Debug, Error)]
pub enum EncodeError {
	#[error("Failed to build file meta group: {0}")]
	Meta(String),
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] WriteError),
}

/// Decodes a DICOM file, with or without its 128 byte preamble.
pub fn decode(bytes: &[u8]) -> Result<Dataset, DecodeError> {
	if bytes.is_empty() {
		return Err(DecodeError::Empty);
	}

	let body = if bytes.len() >= PREAMBLE_LENGTH + MAGIC_CODE.len()
		&& &bytes[PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC_CODE.len()] == MAGIC_CODE
	{
		&bytes[PREAMBLE_LENGTH..]
	} else {
		bytes
	};

	let file = dicom::object::from_reader(Cursor::new(body))?;
	Ok(Dataset::from(file.into_inner()))
}

/// Wraps a dataset into a worklist file object with a fresh SOP instance UID.
pub fn to_file_object(
	dataset: &Dataset,
) -> Result<FileDicomObject<InMemDicomObject>, EncodeError> {
	let instance_uid = new_instance_uid();
	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)
		.media_storage_sop_instance_uid(instance_uid.as_str())
		.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
		.build()
		.map_err(|err| EncodeError::Meta(err.to_string()))?;

	Ok(dataset.to_object().with_exact_meta(meta))
}

/// Encodes a dataset as a complete DICOM file, including preamble and file meta group.
pub fn encode(dataset: &Dataset) -> Result<Vec<u8>, EncodeError> {
	let file = to_file_object(dataset)?;
	let mut buffer = Vec::new();
	file.write_all(&mut buffer)?;
	Ok(buffer)
}

/// Generates a UID under the 2.25 root from a random UUID.
pub fn new_instance_uid() -> UI {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}
