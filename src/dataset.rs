use dicom::core::header::Header;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use thiserror::Error;

/// An ordered list of data elements.
///
/// Unlike [`InMemDicomObject`], which keeps its elements sorted by tag, a dataset
/// preserves the order in which its elements were produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset(Vec<InMemElement>);

impl Dataset {
	pub const fn new() -> Self {
		Self(Vec::new())
	}

	pub fn push(&mut self, element: InMemElement) {
		self.0.push(element);
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn elements(&self) -> &[InMemElement] {
		&self.0
	}

	pub fn iter(&self) -> std::slice::Iter<'_, InMemElement> {
		self.0.iter()
	}

	/// Returns the first element with the given tag.
	pub fn get(&self, tag: Tag) -> Option<&InMemElement> {
		self.0.iter().find(|element| element.tag() == tag)
	}

	/// Converts the dataset into an object suitable for encoding.
	/// If a tag occurs more than once, the last occurrence wins.
	pub fn to_object(&self) -> InMemDicomObject {
		InMemDicomObject::from_element_iter(self.0.iter().cloned())
	}
}

impl From<InMemDicomObject> for Dataset {
	fn from(object: InMemDicomObject) -> Self {
		object.into_iter().collect()
	}
}

impl FromIterator<InMemElement> for Dataset {
	fn from_iter<T: IntoIterator<Item = InMemElement>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl IntoIterator for Dataset {
	type Item = InMemElement;
	type IntoIter = std::vec::IntoIter<InMemElement>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl<'a> IntoIterator for &'a Dataset {
	type Item = &'a InMemElement;
	type IntoIter = std::slice::Iter<'a, InMemElement>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

/// A single value handed over by a rule before it is typed by the VR of its attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
	Text(String),
	Integer(i64),
	Number(f64),
}

impl std::fmt::Display for ScalarValue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Text(text) => f.write_str(text),
			Self::Integer(value) => write!(f, "{value}"),
			Self::Number(value) => write!(f, "{value}"),
		}
	}
}

#[derive(Debug, Error)]
pub enum ElementError {
	#[error("Value '{value}' is not valid for VR {vr:?}")]
	InvalidValue { vr: VR, value: String },
	#[error("VR {0:?} cannot be constructed from scalar values")]
	UnsupportedVr(VR),
}

/// Creates a data element whose value is typed according to `vr`.
pub fn new_element(tag: Tag, vr: VR, values: &[ScalarValue]) -> Result<InMemElement, ElementError> {
	let value = primitive_value(vr, values)?;
	Ok(DataElement::new(tag, vr, value))
}

/// Converts untyped scalars into the primitive value representation of `vr`.
///
/// Numeric VRs accept numbers and numeric text; textual VRs accept anything and
/// format numbers the way DICOM expects them (integers without a fraction).
pub fn primitive_value(vr: VR, values: &[ScalarValue]) -> Result<PrimitiveValue, ElementError> {
	if values.is_empty() {
		return Ok(PrimitiveValue::Empty);
	}

	let value = match vr {
		VR::US => PrimitiveValue::U16(convert(vr, values, to_integer::<u16>)?.into()),
		VR::UL => PrimitiveValue::U32(convert(vr, values, to_integer::<u32>)?.into()),
		VR::UV => PrimitiveValue::U64(convert(vr, values, to_integer::<u64>)?.into()),
		VR::SS => PrimitiveValue::I16(convert(vr, values, to_integer::<i16>)?.into()),
		VR::SL => PrimitiveValue::I32(convert(vr, values, to_integer::<i32>)?.into()),
		VR::SV => PrimitiveValue::I64(convert(vr, values, to_integer::<i64>)?.into()),
		VR::FL => PrimitiveValue::F32(convert(vr, values, to_f32)?.into()),
		VR::FD => PrimitiveValue::F64(convert(vr, values, to_f64)?.into()),
		VR::SQ | VR::OB | VR::OW | VR::OD | VR::OF | VR::OL | VR::OV => {
			return Err(ElementError::UnsupportedVr(vr));
		}
		_ => {
			let texts: Vec<String> = values.iter().map(to_text).collect();
			match <[String; 1]>::try_from(texts) {
				Ok([text]) => PrimitiveValue::from(text),
				Err(texts) => PrimitiveValue::Strs(texts.into()),
			}
		}
	};
	Ok(value)
}

fn convert<T>(
	vr: VR,
	values: &[ScalarValue],
	f: impl Fn(&ScalarValue) -> Option<T>,
) -> Result<Vec<T>, ElementError> {
	values
		.iter()
		.map(|value| {
			f(value).ok_or_else(|| ElementError::InvalidValue {
				vr,
				value: value.to_string(),
			})
		})
		.collect()
}

fn to_integer<T: TryFrom<i64>>(value: &ScalarValue) -> Option<T> {
	let integer = match value {
		ScalarValue::Integer(integer) => *integer,
		#[allow(clippy::cast_possible_truncation)]
		ScalarValue::Number(number) if number.fract() == 0.0 => *number as i64,
		ScalarValue::Number(_) => return None,
		ScalarValue::Text(text) => text.trim().parse().ok()?,
	};
	T::try_from(integer).ok()
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(value: &ScalarValue) -> Option<f64> {
	match value {
		ScalarValue::Integer(integer) => Some(*integer as f64),
		ScalarValue::Number(number) => Some(*number),
		ScalarValue::Text(text) => text.trim().parse().ok(),
	}
}

#[allow(clippy::cast_possible_truncation)]
fn to_f32(value: &ScalarValue) -> Option<f32> {
	to_f64(value).map(|value| value as f32)
}

fn to_text(value: &ScalarValue) -> String {
	match value {
		ScalarValue::Number(number) if number.fract() == 0.0 && number.is_finite() => {
			format!("{number:.0}")
		}
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	#[test]
	fn preserves_insertion_order() {
		let mut dataset = Dataset::new();
		dataset.push(DataElement::new(
			tags::PATIENT_NAME,
			VR::PN,
			PrimitiveValue::from("Doe^John"),
		));
		dataset.push(DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			PrimitiveValue::from("A-1"),
		));

		let tags: Vec<Tag> = dataset.iter().map(Header::tag).collect();
		assert_eq!(tags, vec![tags::PATIENT_NAME, tags::ACCESSION_NUMBER]);

		let object = dataset.to_object();
		assert_eq!(
			object.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
			"Doe^John"
		);
	}

	#[test]
	fn textual_values() {
		let value = primitive_value(VR::PN, &[ScalarValue::Text("Doe^John".into())]).unwrap();
		assert_eq!(value, PrimitiveValue::from("Doe^John"));

		let value = primitive_value(
			VR::CS,
			&[ScalarValue::Text("CT".into()), ScalarValue::Text("MR".into())],
		)
		.unwrap();
		assert_eq!(
			value,
			PrimitiveValue::Strs(vec![String::from("CT"), String::from("MR")].into())
		);

		let value = primitive_value(VR::IS, &[ScalarValue::Number(42.0)]).unwrap();
		assert_eq!(value, PrimitiveValue::from("42"));
	}

	#[test]
	fn numeric_values() {
		let value = primitive_value(VR::US, &[ScalarValue::Integer(7)]).unwrap();
		assert_eq!(value, PrimitiveValue::U16(vec![7].into()));

		let value = primitive_value(VR::FD, &[ScalarValue::Text("72.5".into())]).unwrap();
		assert_eq!(value, PrimitiveValue::F64(vec![72.5].into()));
	}

	#[test]
	fn rejects_values_outside_the_vr() {
		let err = primitive_value(VR::US, &[ScalarValue::Integer(70_000)]).unwrap_err();
		assert!(matches!(err, ElementError::InvalidValue { vr: VR::US, .. }));

		let err = primitive_value(VR::SL, &[ScalarValue::Text("abc".into())]).unwrap_err();
		assert!(matches!(err, ElementError::InvalidValue { .. }));

		let err = primitive_value(VR::OB, &[ScalarValue::Integer(1)]).unwrap_err();
		assert!(matches!(err, ElementError::UnsupportedVr(VR::OB)));
	}

	#[test]
	fn no_values_yield_an_empty_element() {
		let element = new_element(tags::PATIENT_ID, VR::LO, &[]).unwrap();
		assert_eq!(element.value().primitive(), Some(&PrimitiveValue::Empty));
	}
}
