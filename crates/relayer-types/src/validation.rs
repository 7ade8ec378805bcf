//! Schema validation for implementation-specific configuration tables.
//!
//! Pluggable sections of the relayer configuration (`[storage]`, `[account]`,
//! `[chain]`) are kept as raw TOML so each implementation can declare the
//! fields it needs. A [`ConfigSchema`] checks such a table before the
//! implementation is constructed from it.

use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
}

/// Type of a configuration field.
#[derive(Debug)]
pub enum FieldType {
	String,
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	/// `0x`-prefixed 20-byte hex address.
	Address,
	/// `http(s)://` endpoint.
	Url,
	Array(Box<FieldType>),
}

impl FieldType {
	fn name(&self) -> &'static str {
		match self {
			FieldType::String => "string",
			FieldType::Integer { .. } => "integer",
			FieldType::Boolean => "boolean",
			FieldType::Address => "address",
			FieldType::Url => "url",
			FieldType::Array(_) => "array",
		}
	}
}

/// Custom check run after the type check succeeded.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		check_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of one configuration table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| ValidationError::TypeMismatch {
				field: "root".to_string(),
				expected: "table".to_string(),
				actual: config.type_str().to_string(),
			})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn mismatch(field: &str, expected: &FieldType, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field.to_string(),
		expected: expected.name().to_string(),
		actual: value.type_str().to_string(),
	}
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
	ValidationError::InvalidValue {
		field: field.to_string(),
		message: message.into(),
	}
}

fn check_type(field: &str, value: &toml::Value, expected: &FieldType) -> Result<(), ValidationError> {
	match expected {
		FieldType::String => {
			value.as_str().ok_or_else(|| mismatch(field, expected, value))?;
		}
		FieldType::Boolean => {
			value.as_bool().ok_or_else(|| mismatch(field, expected, value))?;
		}
		FieldType::Integer { min, max } => {
			let int_val = value
				.as_integer()
				.ok_or_else(|| mismatch(field, expected, value))?;
			if let Some(min_val) = min {
				if int_val < *min_val {
					return Err(invalid(
						field,
						format!("Value {} is less than minimum {}", int_val, min_val),
					));
				}
			}
			if let Some(max_val) = max {
				if int_val > *max_val {
					return Err(invalid(
						field,
						format!("Value {} is greater than maximum {}", int_val, max_val),
					));
				}
			}
		}
		FieldType::Address => {
			let addr = value
				.as_str()
				.ok_or_else(|| mismatch(field, expected, value))?;
			let valid = addr
				.strip_prefix("0x")
				.map(|digits| digits.len() == 40 && hex::decode(digits).is_ok())
				.unwrap_or(false);
			if !valid {
				return Err(invalid(field, "must be a 0x-prefixed 20-byte hex address"));
			}
		}
		FieldType::Url => {
			let url = value
				.as_str()
				.ok_or_else(|| mismatch(field, expected, value))?;
			if !(url.starts_with("http://") || url.starts_with("https://")) {
				return Err(invalid(field, "URL must start with http:// or https://"));
			}
		}
		FieldType::Array(inner) => {
			let items = value
				.as_array()
				.ok_or_else(|| mismatch(field, expected, value))?;
			for (i, item) in items.iter().enumerate() {
				check_type(&format!("{}[{}]", field, i), item, inner)?;
			}
		}
	}

	Ok(())
}

/// Validates an implementation-specific configuration table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(doc: &str) -> toml::Value {
		toml::Value::Table(toml::from_str(doc).unwrap())
	}

	fn schema() -> Schema {
		Schema::new(
			vec![
				Field::new("rpc_url", FieldType::Url),
				Field::new("contract", FieldType::Address),
			],
			vec![Field::new(
				"chain_id",
				FieldType::Integer {
					min: Some(1),
					max: None,
				},
			)
			.with_validator(|value| match value.as_integer() {
				Some(11155111) | Some(1) => Ok(()),
				_ => Err("unsupported chain".to_string()),
			})],
		)
	}

	#[test]
	fn test_valid_table() {
		let config = parse(
			r#"
rpc_url = "https://rpc.example.com"
contract = "0x0000000000000000000000000000000000000001"
chain_id = 11155111
"#,
		);
		assert!(schema().validate(&config).is_ok());
	}

	#[test]
	fn test_missing_and_malformed_fields() {
		let missing = parse(r#"rpc_url = "https://rpc.example.com""#);
		assert_eq!(
			schema().validate(&missing),
			Err(ValidationError::MissingField("contract".to_string()))
		);

		let bad_address = parse(
			r#"
rpc_url = "https://rpc.example.com"
contract = "0x1234"
"#,
		);
		assert!(matches!(
			schema().validate(&bad_address),
			Err(ValidationError::InvalidValue { field, .. }) if field == "contract"
		));

		let bad_url = parse(
			r#"
rpc_url = "ws://rpc.example.com"
contract = "0x0000000000000000000000000000000000000001"
"#,
		);
		assert!(schema().validate(&bad_url).is_err());
	}

	#[test]
	fn test_custom_validator_runs_on_optional_field() {
		let config = parse(
			r#"
rpc_url = "https://rpc.example.com"
contract = "0x0000000000000000000000000000000000000001"
chain_id = 5
"#,
		);
		assert!(matches!(
			schema().validate(&config),
			Err(ValidationError::InvalidValue { message, .. }) if message == "unsupported chain"
		));
	}
}
