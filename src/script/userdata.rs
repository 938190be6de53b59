use crate::dataset::{new_element, Dataset, ScalarValue};
use crate::dictionary::TagResolver;
use dicom::core::header::Header;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, DicomValue, Length, Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use mlua::{AnyUserData, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};
use std::sync::Arc;

/// A tag constant, e.g. the global `PatientName`.
#[derive(Debug, Clone, Copy)]
pub struct LuaTag(pub Tag);

impl UserData for LuaTag {
	fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
		fields.add_field_method_get("group", |_, this| Ok(this.0.group()));
		fields.add_field_method_get("element", |_, this| Ok(this.0.element()));
	}

	fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
		methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
		methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
			Ok(other.borrow::<Self>().is_ok_and(|other| other.0 == this.0))
		});
	}
}

/// A data element created by `tag(name, value)`.
#[derive(Debug, Clone)]
pub struct LuaElement(pub InMemElement);

impl UserData for LuaElement {
	fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
		fields.add_field_method_get("tag", |_, this| Ok(LuaTag(this.0.tag())));
		fields.add_field_method_get("vr", |_, this| Ok(this.0.vr().to_string()));
		fields.add_field_method_get("value", |_, this| Ok(element_text(&this.0)));
	}

	fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
		methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
			Ok(format!(
				"{} {} {}",
				this.0.tag(),
				this.0.vr(),
				element_text(&this.0).unwrap_or_default()
			))
		});
	}
}

/// Read-only view of a dataset, handed to rules as the template.
pub struct LuaDataset {
	pub(crate) dataset: Dataset,
	resolver: Arc<TagResolver>,
}

impl LuaDataset {
	pub fn new(dataset: Dataset, resolver: Arc<TagResolver>) -> Self {
		Self { dataset, resolver }
	}
}

impl UserData for LuaDataset {
	fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
		methods.add_method("get", |_, this, name: Value| {
			let tag = tag_from_lua(&this.resolver, &name)?;
			Ok(this.dataset.get(tag).and_then(element_text))
		});
		methods.add_method("has", |_, this, name: Value| {
			let tag = tag_from_lua(&this.resolver, &name)?;
			Ok(this.dataset.get(tag).is_some())
		});
		methods.add_method("len", |_, this, ()| Ok(this.dataset.len()));
		methods.add_method("elements", |_, this, ()| {
			Ok(this
				.dataset
				.iter()
				.cloned()
				.map(LuaElement)
				.collect::<Vec<_>>())
		});
		methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.dataset.len()));
	}
}

fn element_text(element: &InMemElement) -> Option<String> {
	let text = element.to_str().ok()?;
	Some(
		text.trim_end_matches(|c: char| c == ' ' || c == '\0')
			.to_owned(),
	)
}

/// Accepts a keyword, a tag string or a tag constant.
pub(crate) fn tag_from_lua(resolver: &TagResolver, value: &Value) -> mlua::Result<Tag> {
	match value {
		Value::String(name) => resolver
			.resolve(&name.to_str()?)
			.map_err(mlua::Error::external),
		Value::UserData(data) => Ok(data.borrow::<LuaTag>()?.0),
		other => Err(mlua::Error::RuntimeError(format!(
			"expected a tag keyword or tag constant, got {}",
			other.type_name()
		))),
	}
}

/// Builds an element typed by the VR the dictionary defines for `tag`.
///
/// Values are `nil` (empty element), a string, a number, or an array of those
/// for multi-valued attributes. Sequences take an array of items, where every
/// item is anything a rule may return.
pub(crate) fn element_from_lua(
	resolver: &TagResolver,
	tag: Tag,
	value: Value,
) -> mlua::Result<InMemElement> {
	let vr = resolver.vr(tag);
	if vr == VR::SQ {
		let items = sequence_items(value)?;
		return Ok(DataElement::new(
			tag,
			VR::SQ,
			DicomValue::Sequence(DataSetSequence::new(items, Length::UNDEFINED)),
		));
	}

	let values = scalars_from_lua(value)?;
	new_element(tag, vr, &values).map_err(mlua::Error::external)
}

fn scalars_from_lua(value: Value) -> mlua::Result<Vec<ScalarValue>> {
	match value {
		Value::Nil => Ok(Vec::new()),
		Value::Table(values) => values
			.sequence_values::<Value>()
			.map(|value| value.and_then(scalar_from_lua))
			.collect(),
		other => Ok(vec![scalar_from_lua(other)?]),
	}
}

fn scalar_from_lua(value: Value) -> mlua::Result<ScalarValue> {
	match value {
		Value::String(text) => Ok(ScalarValue::Text(text.to_str()?.to_string())),
		Value::Integer(integer) => Ok(ScalarValue::Integer(integer)),
		Value::Number(number) => Ok(ScalarValue::Number(number)),
		other => Err(mlua::Error::RuntimeError(format!(
			"a {} cannot be used as a DICOM value",
			other.type_name()
		))),
	}
}

fn sequence_items(value: Value) -> mlua::Result<Vec<InMemDicomObject>> {
	match value {
		Value::Nil => Ok(Vec::new()),
		Value::Table(items) => items
			.sequence_values::<Value>()
			.map(|item| -> mlua::Result<InMemDicomObject> {
				let item = dataset_from_lua(item?)?.unwrap_or_default();
				Ok(item.to_object())
			})
			.collect(),
		other => Err(mlua::Error::RuntimeError(format!(
			"sequence items must be given as an array, got {}",
			other.type_name()
		))),
	}
}

/// Interprets the value returned by a rule.
///
/// `nil` and `false` mean the rule does not apply. A single element, an array of
/// elements, or a dataset view produce a dataset.
pub(crate) fn dataset_from_lua(value: Value) -> mlua::Result<Option<Dataset>> {
	match value {
		Value::Nil | Value::Boolean(false) => Ok(None),
		Value::UserData(data) => {
			if let Ok(element) = data.borrow::<LuaElement>() {
				return Ok(Some(Dataset::from_iter([element.0.clone()])));
			}
			let view = data.borrow::<LuaDataset>()?;
			Ok(Some(view.dataset.clone()))
		}
		Value::Table(elements) => elements
			.sequence_values::<Value>()
			.map(|element| match element? {
				Value::UserData(data) => Ok(data.borrow::<LuaElement>()?.0.clone()),
				other => Err(mlua::Error::RuntimeError(format!(
					"expected an element created by tag(), got {}",
					other.type_name()
				))),
			})
			.collect::<mlua::Result<Dataset>>()
			.map(Some),
		other => Err(mlua::Error::RuntimeError(format!(
			"a rule cannot return a {}",
			other.type_name()
		))),
	}
}
