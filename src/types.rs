use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// The party that books an examination.
///
/// Rule scripts receive this record as a table with PascalCase keys, e.g. `c.Name`.
/// Fields that are not known to this crate are kept in `extra` and exposed as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Customer {
	pub id: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub phone: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub address: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// The subject of the scheduled procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Patient {
	pub id: String,
	pub name: String,
	/// Birth date in DICOM DA format (YYYYMMDD).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub birth_date: Option<String>,
	/// DICOM sex code: `M`, `F` or `O`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sex: Option<String>,
	/// Weight in kilograms.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub weight: Option<f64>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn intake_records_use_pascal_case() {
		let customer: Customer = serde_json::from_str(
			r#"{"Id":"C-1","Name":"Doe^Jane","Email":"jane@example.org","Branch":"North"}"#,
		)
		.unwrap();

		assert_eq!(customer.id, "C-1");
		assert_eq!(customer.email.as_deref(), Some("jane@example.org"));
		assert_eq!(customer.extra.get("Branch"), Some(&Value::from("North")));

		let json = serde_json::to_value(&customer).unwrap();
		assert_eq!(json["Name"], "Doe^Jane");
		assert_eq!(json["Branch"], "North");
		assert!(json.get("Phone").is_none());
	}
}
