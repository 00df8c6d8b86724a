//! Normalisation of raw extraction responses into structured results.
//!
//! Every function here is total: malformed input yields `None`, never an error.

use serde_json::{Map, Number, Value};

/// Turn an extraction service response body into a structured result.
pub fn normalize_response(body: &Value) -> Option<Value> {
    match body.get("analyzeResult") {
        Some(result) => normalize_analyze_result(result),
        None => match body {
            Value::String(text) => structured_from_text(text),
            Value::Object(map) if map.contains_key("status") && map.len() == 1 => None,
            other => non_empty(other.clone()),
        },
    }
}

fn normalize_analyze_result(result: &Value) -> Option<Value> {
    if let Some(text) = result.get("content").and_then(Value::as_str) {
        return structured_from_text(text);
    }
    if let Some(pages) = result.get("readResults").and_then(Value::as_array) {
        return pages_to_structured(pages);
    }
    match result {
        Value::String(text) => structured_from_text(text),
        other => non_empty(other.clone()),
    }
}

/// `readResults` pages become `{"Page_1": "<lines joined by spaces>", ...}`.
fn pages_to_structured(pages: &[Value]) -> Option<Value> {
    let mut out = Map::new();
    for (idx, page) in pages.iter().enumerate() {
        let text = page
            .get("lines")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|line| line.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        out.insert(format!("Page_{}", idx + 1), Value::String(text));
    }
    non_empty(Value::Object(out))
}

/// Parse model text as JSON, then as a Python-style literal, else `None`.
pub fn structured_from_text(text: &str) -> Option<Value> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(body)
        .ok()
        .or_else(|| parse_python_literal(body));
    parsed.and_then(non_empty)
}

/// Null, empty strings, empty arrays, and empty objects carry no result.
pub fn non_empty(value: Value) -> Option<Value> {
    let empty = match &value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    };
    if empty { None } else { Some(value) }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line (```json).
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a Python literal (dict, list, tuple, str, int, float, bool, None).
pub fn parse_python_literal(text: &str) -> Option<Value> {
    let mut parser = LiteralParser {
        chars: text.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos == parser.chars.len() {
        Some(value)
    } else {
        None
    }
}

/// Same nesting limit serde_json applies before falling back here.
const MAX_LITERAL_DEPTH: usize = 128;

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl LiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.nested(Self::dict),
            '[' => self.nested(|p| p.sequence('[', ']')),
            '(' => self.nested(|p| p.sequence('(', ')')),
            '\'' | '"' => self.string().map(Value::String),
            c if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.number(),
            c if c.is_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Option<Value>) -> Option<Value> {
        if self.depth >= MAX_LITERAL_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn dict(&mut self) -> Option<Value> {
        self.bump();
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek()? == '}' {
                self.bump();
                return Some(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => (if b { "True" } else { "False" }).to_string(),
                Value::Null => "None".to_string(),
                _ => return None,
            };
            self.skip_ws();
            if self.bump()? != ':' {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.bump()? {
                ',' => continue,
                '}' => return Some(Value::Object(map)),
                _ => return None,
            }
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Option<Value> {
        debug_assert_eq!(self.peek(), Some(open));
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek()? == close {
                self.bump();
                return Some(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump()? {
                ',' => continue,
                c if c == close => return Some(Value::Array(items)),
                _ => return None,
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'u' => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let code = u32::from_str_radix(&hex, 16).ok()?;
                        out.push(char::from_u32(code)?);
                    }
                    other => out.push(other),
                },
                c if c == quote => return Some(out),
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_'))
        {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if let Ok(int) = raw.parse::<i64>() {
            return Some(Value::Number(int.into()));
        }
        let float = raw.parse::<f64>().ok()?;
        Number::from_f64(float).map(Value::Number)
    }

    fn keyword(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" => Some(Value::Bool(true)),
            "False" => Some(Value::Bool(false)),
            "None" => Some(Value::Null),
            _ => None,
        }
    }
}
