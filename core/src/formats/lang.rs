/// Legacy `.lang` files: one `key=value` pair per line, `#` comments.
use super::{FileFormat, FormatError, FormatHandler};
use crate::pipeline::UnitMap;
use serde_json::Value;

pub struct LangHandler;

impl LangHandler {
    pub fn new() -> Self {
        Self
    }
}

impl FormatHandler for LangHandler {
    fn parse(&self, content: &str) -> Result<UnitMap, FormatError> {
        Ok(parse_lang(content))
    }

    fn render(&self, units: &UnitMap) -> Result<String, FormatError> {
        let mut out = String::new();
        for (key, value) in units {
            let Value::String(text) = value else {
                return Err(FormatError::SerializationError(format!(
                    "'{key}' is not a string and cannot be written to a .lang file"
                )));
            };
            out.push_str(key);
            out.push('=');
            out.push_str(text);
            out.push('\n');
        }
        Ok(out)
    }

    fn format(&self) -> FileFormat {
        FileFormat::Lang
    }
}

/// Splits every non-comment line on its first `=`; both sides are trimmed and
/// later duplicates replace earlier ones. Lines without `=` are ignored.
pub fn parse_lang(content: &str) -> UnitMap {
    let mut units = UnitMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            units.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_skips_comments() {
        let units = parse_lang(
            "# header\n\nitem.pearl.name = Ender Pearl\ntip=a=b\nno separator\nitem.pearl.name=Pearl\n",
        );
        assert_eq!(units.len(), 2);
        assert_eq!(units["item.pearl.name"], "Pearl");
        assert_eq!(units["tip"], "a=b");
    }

    #[test]
    fn renders_string_values_only() {
        let handler = LangHandler::new();
        let units = parse_lang("a=1\nb=2");
        assert_eq!(handler.render(&units).unwrap(), "a=1\nb=2\n");

        let mut nested = UnitMap::new();
        nested.insert("list".into(), serde_json::json!(["x"]));
        assert!(handler.render(&nested).is_err());
    }
}
