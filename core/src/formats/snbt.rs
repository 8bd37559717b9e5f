/// SNBT language files as used by quest books: a single compound whose
/// values are strings or lists of strings.
///
/// ```text
/// {
/// 	quest.0A1B.title: "Getting Started"
/// 	quest.0A1B.quest_desc: [
/// 		"First page"
/// 		"{@pagebreak}"
/// 	]
/// }
/// ```
///
/// Keys may be bare or quoted, strings use `"` or `'`, and entries are
/// separated by commas or newlines. Any other tag type is rejected.
use super::{FileFormat, FormatError, FormatHandler};
use crate::pipeline::UnitMap;
use serde_json::Value;

pub struct SnbtHandler;

impl SnbtHandler {
    pub fn new() -> Self {
        Self
    }
}

impl FormatHandler for SnbtHandler {
    fn parse(&self, content: &str) -> Result<UnitMap, FormatError> {
        parse_snbt(content)
    }

    fn render(&self, units: &UnitMap) -> Result<String, FormatError> {
        write_snbt(units)
    }

    fn format(&self) -> FileFormat {
        FileFormat::Snbt
    }
}

pub fn parse_snbt(content: &str) -> Result<UnitMap, FormatError> {
    let mut cursor = Cursor::new(content);
    cursor.skip_separators();
    cursor.expect('{')?;

    let mut units = UnitMap::new();
    loop {
        cursor.skip_separators();
        match cursor.peek() {
            None => return Err(cursor.error("unterminated compound")),
            Some('}') => {
                cursor.bump();
                break;
            }
            Some(_) => {}
        }

        let key = cursor.key()?;
        cursor.skip_whitespace();
        cursor.expect(':')?;
        cursor.skip_whitespace();
        let value = match cursor.peek() {
            Some('"' | '\'') => Value::String(cursor.string()?),
            Some('[') => Value::Array(cursor.string_list()?),
            _ => return Err(cursor.error(&format!("'{key}' must be a string or a list of strings"))),
        };
        units.insert(key, value);
    }

    cursor.skip_separators();
    if cursor.peek().is_some() {
        return Err(cursor.error("unexpected content after the compound"));
    }
    Ok(units)
}

pub fn write_snbt(units: &UnitMap) -> Result<String, FormatError> {
    let mut out = String::from("{\n");
    for (key, value) in units {
        out.push('\t');
        out.push_str(&quote_key(key));
        out.push_str(": ");
        match value {
            Value::String(text) => out.push_str(&quote(text)),
            Value::Array(items) => {
                out.push_str("[\n");
                for item in items {
                    let Value::String(text) = item else {
                        return Err(FormatError::SerializationError(format!(
                            "'{key}' contains a non-string list element"
                        )));
                    };
                    out.push_str("\t\t");
                    out.push_str(&quote(text));
                    out.push('\n');
                }
                out.push_str("\t]");
            }
            _ => {
                return Err(FormatError::SerializationError(format!(
                    "'{key}' is neither a string nor a list of strings"
                )))
            }
        }
        out.push('\n');
    }
    out.push_str("}\n");
    Ok(out)
}

fn is_bare_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+')
}

fn quote_key(key: &str) -> String {
    if !key.is_empty() && key.chars().all(is_bare_char) {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            chars: content.strip_prefix('\u{feff}').unwrap_or(content).chars().peekable(),
            line: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, message: &str) -> FormatError {
        FormatError::ParseError(format!("SNBT line {}: {message}", self.line))
    }

    fn expect(&mut self, expected: char) -> Result<(), FormatError> {
        match self.bump() {
            Some(ch) if ch == expected => Ok(()),
            Some(ch) => Err(self.error(&format!("expected '{expected}', found '{ch}'"))),
            None => Err(self.error(&format!("expected '{expected}', found end of input"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(|ch| ch.is_whitespace() || ch == ',') {
            self.bump();
        }
    }

    fn key(&mut self) -> Result<String, FormatError> {
        if matches!(self.peek(), Some('"' | '\'')) {
            return self.string();
        }
        let mut key = String::new();
        while let Some(ch) = self.peek().filter(|ch| is_bare_char(*ch)) {
            key.push(ch);
            self.bump();
        }
        if key.is_empty() {
            return Err(self.error("expected a key"));
        }
        Ok(key)
    }

    fn string(&mut self) -> Result<String, FormatError> {
        let quote = self.bump().unwrap_or('"');
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some(other) => text.push(other),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(ch) if ch == quote => return Ok(text),
                Some(ch) => text.push(ch),
            }
        }
    }

    fn string_list(&mut self) -> Result<Vec<Value>, FormatError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    return Ok(items);
                }
                Some('"' | '\'') => items.push(Value::String(self.string()?)),
                Some(ch) => return Err(self.error(&format!("unexpected '{ch}' in string list"))),
                None => return Err(self.error("unterminated list")),
            }
        }
    }
}
