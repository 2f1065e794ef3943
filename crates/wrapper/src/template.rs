//! `{placeholder}` templates used by tool invocations.
//!
//! Templates are parsed once when the registry is built; rendering never fails; missing values are
//! reported as `None` so callers decide whether to omit the fragment.

use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template such as `--name={name}` or `/users/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template string.
    ///
    /// `{{` and `}}` are literal braces.
    ///
    /// # Errors
    ///
    /// Returns a message describing the problem when a `{` is never closed, a `}` is unmatched, or a
    /// placeholder name is not an identifier.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(format!("unterminated placeholder in template '{raw}'"));
                    }
                    if !is_identifier(&name) {
                        return Err(format!(
                            "invalid placeholder '{{{name}}}' in template '{raw}'"
                        ));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => return Err(format!("unmatched '}}' in template '{raw}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Placeholder names in order of appearance (may repeat).
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The single placeholder name when the template is exactly `{name}`.
    #[must_use]
    pub fn sole_placeholder(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Placeholder(name)] => Some(name.as_str()),
            _ => None,
        }
    }

    /// Render with `args`; `None` when any referenced value is absent (or `null`).
    #[must_use]
    pub fn render(&self, args: &JsonObject) -> Option<String> {
        self.render_with(args, str::to_string)
    }

    /// Like [`Template::render`], passing each substituted value through `encode`.
    pub fn render_with(&self, args: &JsonObject, encode: impl Fn(&str) -> String) -> Option<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Placeholder(name) => match args.get(name) {
                    None | Some(Value::Null) => return None,
                    Some(v) => out.push_str(&encode(&value_to_string(v))),
                },
            }
        }
        Some(out)
    }

    /// Render as zero or more argv elements.
    ///
    /// A template that is exactly one placeholder bound to an array expands into one element per
    /// item. A template referencing an absent value renders to nothing.
    #[must_use]
    pub fn render_argv(&self, args: &JsonObject) -> Vec<String> {
        if let Some(name) = self.sole_placeholder()
            && let Some(Value::Array(items)) = args.get(name)
        {
            return items.iter().map(value_to_string).collect();
        }
        self.render(args).into_iter().collect()
    }
}

/// Render a JSON value the way it appears inside a command line or URL.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
