/// JSON language files: a flat object of translation keys.
/// Output is pretty-printed with two-space indentation and unescaped UTF-8.
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use super::{strip_bom, FileFormat, FormatError, FormatHandler};
use crate::backup::write_atomic;
use crate::pipeline::UnitMap;

pub struct JsonHandler;

impl JsonHandler {
    pub fn new() -> Self {
        Self
    }
}

impl FormatHandler for JsonHandler {
    fn parse(&self, content: &str) -> Result<UnitMap, FormatError> {
        let value: Value = serde_json::from_str(strip_bom(content))
            .map_err(|e| FormatError::ParseError(format!("JSON parse error: {}", e)))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(FormatError::ParseError(format!(
                "expected a JSON object, found {}",
                kind(&other)
            ))),
        }
    }

    fn render(&self, units: &UnitMap) -> Result<String, FormatError> {
        to_pretty_string(units)
    }

    fn format(&self) -> FileFormat {
        FileFormat::Json
    }
}

pub fn to_pretty_string<T: Serialize + ?Sized>(value: &T) -> Result<String, FormatError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| FormatError::SerializationError(format!("JSON serialize error: {}", e)))
}

/// Reads a JSON object file, keeping key order.
pub fn read_object(path: &Path) -> Result<UnitMap, FormatError> {
    let content = fs::read_to_string(path)?;
    JsonHandler::new()
        .parse(&content)
        .map_err(|err| FormatError::ParseError(format!("{}: {err}", path.display())))
}

/// Writes `value` as pretty JSON, replacing `path` atomically.
pub fn write_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), FormatError> {
    let rendered = to_pretty_string(value)?;
    write_atomic(path, rendered.as_bytes())?;
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
