//! Language file formats.
//! Every format is read into, and written from, a key-ordered [`UnitMap`].

pub mod json;
pub mod lang;
pub mod snbt;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::{write_atomic, BackupError};
use crate::pipeline::UnitMap;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Write error: {0}")]
    WriteError(#[from] BackupError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Json,
    Lang,
    Snbt,
    Markdown,
    Unknown,
}

impl FileFormat {
    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "json" => Self::Json,
            "lang" => Self::Lang,
            "snbt" => Self::Snbt,
            "md" | "markdown" => Self::Markdown,
            _ => Self::Unknown,
        }
    }

    /// Detect format from path
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }
}

/// Reads and writes one language-file format.
pub trait FormatHandler: Send + Sync {
    fn parse(&self, content: &str) -> Result<UnitMap, FormatError>;

    fn render(&self, units: &UnitMap) -> Result<String, FormatError>;

    fn format(&self) -> FileFormat;
}

/// Get appropriate handler for a format
pub fn get_handler(format: FileFormat) -> Option<Box<dyn FormatHandler>> {
    match format {
        FileFormat::Json => Some(Box::new(json::JsonHandler::new())),
        FileFormat::Lang => Some(Box::new(lang::LangHandler::new())),
        FileFormat::Snbt => Some(Box::new(snbt::SnbtHandler::new())),
        FileFormat::Markdown | FileFormat::Unknown => None,
    }
}

/// Drops a leading UTF-8 byte order mark.
pub fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

pub fn read_units(path: &Path) -> Result<UnitMap, FormatError> {
    let format = FileFormat::from_path(path);
    let handler = get_handler(format)
        .ok_or_else(|| FormatError::UnsupportedFormat(path.display().to_string()))?;
    let content = fs::read_to_string(path)?;
    handler
        .parse(strip_bom(&content))
        .map_err(|err| FormatError::ParseError(format!("{}: {err}", path.display())))
}

/// Renders `units` in the format implied by `path` and replaces the file
/// atomically.
pub fn write_units(path: &Path, units: &UnitMap) -> Result<(), FormatError> {
    let format = FileFormat::from_path(path);
    let handler = get_handler(format)
        .ok_or_else(|| FormatError::UnsupportedFormat(path.display().to_string()))?;
    let rendered = handler.render(units)?;
    write_atomic(path, rendered.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_formats_by_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a/en_us.JSON")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("en_us.lang")), FileFormat::Lang);
        assert_eq!(FileFormat::from_path(Path::new("lang/en_us.snbt")), FileFormat::Snbt);
        assert_eq!(FileFormat::from_path(Path::new("README")), FileFormat::Unknown);
        assert!(get_handler(FileFormat::Markdown).is_none());
    }

    #[test]
    fn reads_and_writes_through_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("en_us.lang");
        fs::write(&path, "\u{feff}item.a=Alpha\n").unwrap();

        let units = read_units(&path).unwrap();
        assert_eq!(units["item.a"], "Alpha");

        let out = dir.path().join("nested/zh_cn.json");
        write_units(&out, &units).unwrap();
        assert_eq!(read_units(&out).unwrap(), units);

        let err = write_units(&dir.path().join("notes.txt"), &units).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedFormat(_)));
    }
}
