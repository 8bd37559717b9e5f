//! Recovery of structured data from model output.
//!
//! Models wrap JSON in code fences, leave trailing commas, forget quotes or
//! commas, use Python literals, or stop before the last closing bracket.
//! [`parse`] tries the strict parser first and falls back to a lenient
//! recursive-descent parser that accepts all of the above.

use serde_json::{Map, Number, Value};
use thiserror::Error;

const MAX_DEPTH: usize = 128;
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("unrecoverable model output ({reason}): {preview:?}")]
    Unrecoverable { reason: String, preview: String },
}

impl RepairError {
    pub fn unrecoverable(reason: impl Into<String>, text: &str) -> Self {
        RepairError::Unrecoverable {
            reason: reason.into(),
            preview: text.chars().take(PREVIEW_CHARS).collect(),
        }
    }
}

/// Strips a surrounding Markdown code fence (with or without a language tag)
/// and surrounding whitespace.
pub fn strip_code_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse(text: &str) -> Result<Value, RepairError> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err(RepairError::unrecoverable("empty output", text));
    }

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }

    if let Some(value) = best_candidate(body) {
        return Ok(value);
    }

    // `"key": "value", ...` without the enclosing braces.
    if body.starts_with(['"', '\'']) && body.contains(':') {
        let mut parser = LenientParser::new(body);
        let object = parser.parse_object_body();
        if !object.is_empty() {
            return Ok(Value::Object(object));
        }
    }

    Err(RepairError::unrecoverable("no JSON structure found", text))
}

/// Parses every top-level `{` or `[` in `body` and keeps the widest object,
/// or the widest array when no object was found. Brackets in surrounding
/// prose such as `[zh_cn]` therefore lose to the actual answer.
fn best_candidate(body: &str) -> Option<Value> {
    let mut parser = LenientParser::new(body);
    let mut best: Option<((bool, usize), Value)> = None;
    let mut from = 0;
    while let Some(offset) = parser.chars[from..].iter().position(|c| matches!(c, '{' | '[')) {
        let start = from + offset;
        parser.pos = start;
        parser.closers.clear();
        let Some(value) = parser.parse_value() else { break };
        let end = parser.pos.max(start + 1);

        let rank = (value.is_object(), end - start);
        if best.as_ref().map_or(true, |(best_rank, _)| rank > *best_rank) {
            best = Some((rank, value));
        }
        from = end;
    }
    best.map(|(_, value)| value)
}

struct LenientParser {
    chars: Vec<char>,
    pos: usize,
    /// Closers expected by the currently open containers, innermost last.
    closers: Vec<char>,
}

impl LenientParser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            closers: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_insignificant();
        match self.peek()? {
            '{' => {
                self.pos += 1;
                Some(self.parse_container('}'))
            }
            '[' => {
                self.pos += 1;
                Some(self.parse_container(']'))
            }
            quote @ ('"' | '\'') => {
                self.pos += 1;
                Some(Value::String(self.parse_string(quote)))
            }
            _ => self.parse_bare(false).map(interpret_bare),
        }
    }

    fn parse_container(&mut self, closer: char) -> Value {
        if self.closers.len() >= MAX_DEPTH {
            return Value::Null;
        }
        self.closers.push(closer);
        let value = if closer == '}' {
            Value::Object(self.parse_object_body())
        } else {
            Value::Array(self.parse_array_body())
        };
        self.closers.pop();
        value
    }

    fn parse_object_body(&mut self) -> Map<String, Value> {
        let mut object = Map::new();
        loop {
            self.skip_separators();
            let Some(next) = self.peek() else { break };
            if self.at_closer(next) {
                break;
            }
            if matches!(next, '}' | ']') {
                // Stray closer that matches nothing open: drop it.
                self.pos += 1;
                continue;
            }

            let start = self.pos;
            let key = match next {
                '"' | '\'' => {
                    self.pos += 1;
                    self.parse_string(next)
                }
                _ => self.parse_bare(true).unwrap_or_default(),
            };

            self.skip_insignificant();
            let value = if self.peek() == Some(':') {
                self.pos += 1;
                self.parse_value_or_empty()
            } else {
                Value::String(String::new())
            };

            if self.pos == start {
                self.pos += 1;
                continue;
            }
            if !key.is_empty() {
                object.insert(key, value);
            }
        }
        object
    }

    fn parse_array_body(&mut self) -> Vec<Value> {
        let mut items = Vec::new();
        loop {
            self.skip_separators();
            let Some(next) = self.peek() else { break };
            if self.at_closer(next) {
                break;
            }
            if matches!(next, '}' | ']') {
                self.pos += 1;
                continue;
            }

            let start = self.pos;
            if let Some(value) = self.parse_value() {
                items.push(value);
            }
            if self.pos == start {
                self.pos += 1;
            }
        }
        items
    }

    /// Consumes `ch` when it closes the innermost container. Returns true
    /// when the innermost container ends here, including when `ch` belongs
    /// to an enclosing container (left unconsumed for it).
    fn at_closer(&mut self, ch: char) -> bool {
        let Some(&innermost) = self.closers.last() else {
            return false;
        };
        if ch == innermost {
            self.pos += 1;
            return true;
        }
        matches!(ch, '}' | ']') && self.closers[..self.closers.len() - 1].contains(&ch)
    }

    fn parse_value_or_empty(&mut self) -> Value {
        self.skip_insignificant();
        match self.peek() {
            None | Some(',') => Value::String(String::new()),
            Some(ch) if matches!(ch, '}' | ']') => Value::String(String::new()),
            _ => self
                .parse_value()
                .unwrap_or_else(|| Value::String(String::new())),
        }
    }

    /// Reads a quoted string whose opening quote is already consumed. A quote
    /// character only closes the string when what follows looks like JSON
    /// punctuation; otherwise it is kept as part of the text.
    fn parse_string(&mut self, quote: char) -> String {
        let mut out = String::new();
        while let Some(ch) = self.peek() {
            self.pos += 1;
            match ch {
                '\\' => self.parse_escape(&mut out),
                c if c == quote => {
                    if self.closes_string() {
                        return out;
                    }
                    out.push(c);
                }
                c => out.push(c),
            }
        }
        out
    }

    fn closes_string(&self) -> bool {
        let mut index = self.pos;
        let mut saw_newline = false;
        while let Some(&ch) = self.chars.get(index) {
            if !ch.is_whitespace() {
                return saw_newline || matches!(ch, ',' | ':' | '}' | ']' | '"' | '\'' | '/');
            }
            saw_newline |= ch == '\n';
            index += 1;
        }
        true
    }

    fn parse_escape(&mut self, out: &mut String) {
        let Some(ch) = self.peek() else {
            out.push('\\');
            return;
        };
        self.pos += 1;
        match ch {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            '/' | '\\' | '"' | '\'' => out.push(ch),
            'u' => match self.read_hex4() {
                Some(high @ 0xD800..=0xDBFF) => {
                    let low = if self.chars.get(self.pos) == Some(&'\\')
                        && self.chars.get(self.pos + 1) == Some(&'u')
                    {
                        self.pos += 2;
                        self.read_hex4()
                    } else {
                        None
                    };
                    let combined = low
                        .filter(|low| (0xDC00..=0xDFFF).contains(low))
                        .map(|low| 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00));
                    out.push(combined.and_then(char::from_u32).unwrap_or('\u{FFFD}'));
                }
                Some(code) => out.push(char::from_u32(code).unwrap_or('\u{FFFD}')),
                None => out.push_str("\\u"),
            },
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    fn read_hex4(&mut self) -> Option<u32> {
        let digits: String = self.chars.get(self.pos..self.pos + 4)?.iter().collect();
        let code = u32::from_str_radix(&digits, 16).ok()?;
        self.pos += 4;
        Some(code)
    }

    /// Unquoted token. Keys stop at `:`; values run to the end of the line
    /// or the next separator.
    fn parse_bare(&mut self, is_key: bool) -> Option<String> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            let stop = matches!(ch, ',' | '}' | ']' | '\n' | '\r') || (is_key && ch == ':');
            if stop {
                break;
            }
            self.pos += 1;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }

    fn skip_separators(&mut self) {
        loop {
            self.skip_insignificant();
            if self.peek() == Some(',') {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_insignificant(&mut self) {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
            let next_two = (self.peek(), self.chars.get(self.pos + 1).copied());
            match next_two {
                (Some('/'), Some('/')) => {
                    while self.peek().is_some_and(|ch| ch != '\n') {
                        self.pos += 1;
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    while self.pos < self.chars.len()
                        && !(self.chars[self.pos] == '*' && self.chars.get(self.pos + 1) == Some(&'/'))
                    {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.chars.len());
                }
                _ => break,
            }
        }
    }
}

fn interpret_bare(token: String) -> Value {
    match token.as_str() {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        "null" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(integer) = token.parse::<i64>() {
        return Value::Number(integer.into());
    }
    if let Some(number) = token.parse::<f64>().ok().and_then(Number::from_f64) {
        if token.chars().all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | 'e' | 'E')) {
            return Value::Number(number);
        }
    }
    Value::String(token)
}
