//! Tool registry: the artifact's tool list compiled into callable handlers.

use crate::backend::{BackendAdapter, Concurrency, Invocation};
use crate::config::{ParameterSpec, ServerConfig, ToolSpec};
use crate::error::{Result, WrapperError};
use crate::template::JsonObject;
use rmcp::model::Tool;
use serde_json::{Number, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The fixed set of parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "array" => Ok(Self::Array),
            "object" => Ok(Self::Object),
            other => Err(format!(
                "unsupported parameter type '{other}' (expected string, integer, number, boolean, array or object)"
            )),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        };
        f.write_str(s)
    }
}

impl ParamType {
    /// Coerce `value` to this type.
    ///
    /// # Errors
    ///
    /// Returns a short reason when the value cannot represent this type.
    pub fn coerce(self, value: Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (ParamType::String, v @ Value::String(_)) => Ok(v),
            (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ParamType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

            (ParamType::Integer, Value::Number(n)) => integer_from_number(&n)
                .ok_or_else(|| format!("expected integer, got {n}")),
            (ParamType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected integer, got \"{s}\"")),

            (ParamType::Number, v @ Value::Number(_)) => Ok(v),
            (ParamType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected number, got \"{s}\"")),

            (ParamType::Boolean, v @ Value::Bool(_)) => Ok(v),
            (ParamType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("expected boolean, got \"{s}\"")),
            },

            (ParamType::Array, v @ Value::Array(_)) | (ParamType::Object, v @ Value::Object(_)) => {
                Ok(v)
            }
            (ParamType::Array | ParamType::Object, Value::String(s)) => {
                match (self, serde_json::from_str::<Value>(&s)) {
                    (ParamType::Array, Ok(v @ Value::Array(_)))
                    | (ParamType::Object, Ok(v @ Value::Object(_))) => Ok(v),
                    _ => Err(format!("expected {self}, got \"{s}\"")),
                }
            }

            (t, other) => Err(format!("expected {t}, got {}", json_kind(&other))),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integer_from_number(n: &Number) -> Option<Value> {
    if n.is_i64() || n.is_u64() {
        return Some(Value::Number(n.clone()));
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        return Some(Value::from(f as i64));
    }
    None
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// A callable tool: declared parameters plus the compiled backend invocation.
#[derive(Debug, Clone)]
pub struct ToolHandler {
    name: String,
    description: String,
    parameters: Vec<Parameter>,
    invocation: Invocation,
    /// Placeholders that need a value even when their parameter is optional.
    mandatory: BTreeSet<String>,
    input_schema: Arc<JsonObject>,
}

impl ToolHandler {
    fn build(spec: &ToolSpec, adapter: &BackendAdapter) -> Result<Self> {
        let invalid = |reason: String| {
            WrapperError::Config(format!("Tool '{}': {}", spec.name, reason))
        };

        if spec.name.trim().is_empty() {
            return Err(WrapperError::Config(
                "Tool names must not be empty".to_string(),
            ));
        }

        let mut parameters = Vec::with_capacity(spec.parameters.len());
        let mut seen = BTreeSet::new();
        for p in &spec.parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(invalid(format!("duplicate parameter '{}'", p.name)));
            }
            parameters.push(build_parameter(p).map_err(invalid)?);
        }

        let invocation = adapter.compile(spec).map_err(invalid)?;
        if let Some(missing) = invocation
            .placeholders()
            .into_iter()
            .find(|ph| !seen.contains(ph.as_str()))
        {
            return Err(invalid(format!(
                "placeholder '{{{missing}}}' does not match any declared parameter"
            )));
        }
        let mandatory = invocation.mandatory_placeholders();

        let input_schema = Arc::new(input_schema(&parameters));

        Ok(Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameters,
            invocation,
            mandatory,
            input_schema,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    #[must_use]
    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// The MCP tool definition advertised in `tools/list`.
    #[must_use]
    pub fn tool(&self) -> Tool {
        Tool::new(
            self.name.clone(),
            self.description.clone(),
            Arc::clone(&self.input_schema),
        )
    }

    /// Validate a call's arguments against the declared parameters.
    ///
    /// Unknown names are rejected, `null` counts as absent, defaults fill gaps, and each value is
    /// coerced to its declared type.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::InvalidArguments`] describing the first problem found.
    pub fn coerce_arguments(&self, arguments: Option<JsonObject>) -> Result<JsonObject> {
        let invalid = |reason: String| WrapperError::InvalidArguments {
            tool: self.name.clone(),
            reason,
        };

        let mut supplied = arguments.unwrap_or_default();
        if let Some(unknown) = supplied
            .keys()
            .find(|k| !self.parameters.iter().any(|p| &p.name == *k))
        {
            return Err(invalid(format!("unknown argument '{unknown}'")));
        }

        let mut out = JsonObject::new();
        for p in &self.parameters {
            match supplied.remove(&p.name).filter(|v| !v.is_null()) {
                Some(v) => {
                    let v = p
                        .param_type
                        .coerce(v)
                        .map_err(|e| invalid(format!("parameter '{}': {}", p.name, e)))?;
                    out.insert(p.name.clone(), v);
                }
                None => {
                    if let Some(default) = &p.default {
                        out.insert(p.name.clone(), default.clone());
                    } else if p.required {
                        return Err(invalid(format!("missing required argument '{}'", p.name)));
                    }
                }
            }
        }

        if let Some(missing) = self.mandatory.iter().find(|m| !out.contains_key(*m)) {
            return Err(invalid(format!(
                "argument '{missing}' is required to build the request path"
            )));
        }

        Ok(out)
    }
}

fn build_parameter(spec: &ParameterSpec) -> std::result::Result<Parameter, String> {
    if spec.name.trim().is_empty() {
        return Err("parameter names must not be empty".to_string());
    }
    let param_type: ParamType = spec
        .param_type
        .parse()
        .map_err(|e| format!("parameter '{}': {}", spec.name, e))?;
    let default = match &spec.default {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            param_type
                .coerce(v.clone())
                .map_err(|e| format!("default for parameter '{}': {}", spec.name, e))?,
        ),
    };
    Ok(Parameter {
        name: spec.name.clone(),
        param_type,
        description: spec.description.clone(),
        required: spec.required.unwrap_or(true),
        default,
    })
}

fn input_schema(parameters: &[Parameter]) -> JsonObject {
    let mut properties = JsonObject::new();
    let mut required: Vec<&str> = Vec::new();

    for p in parameters {
        let mut prop = json!({ "type": p.param_type.to_string() });
        if !p.description.is_empty() {
            prop["description"] = json!(p.description);
        }
        if let Some(default) = &p.default {
            prop["default"] = default.clone();
        }
        properties.insert(p.name.clone(), prop);

        if p.required && p.default.is_none() {
            required.push(&p.name);
        }
    }

    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), json!(required));
    }
    schema.insert("additionalProperties".to_string(), json!(false));
    schema
}

/// Immutable mapping from tool name to handler, plus the backend the handlers were compiled for.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    adapter: BackendAdapter,
    concurrency: Concurrency,
    handlers: Vec<Arc<ToolHandler>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Compile every tool in `config`.
    ///
    /// Fails on the first malformed tool; no partially built registry is ever returned.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Config`] for an unknown backend type, a duplicate tool name, an
    /// unsupported parameter type, or a template placeholder with no matching parameter.
    pub fn build(config: &ServerConfig) -> Result<Self> {
        let adapter = BackendAdapter::resolve(&config.backend)?;
        let concurrency = adapter.concurrency(config.backend.concurrency);

        let mut handlers = Vec::with_capacity(config.tools.len());
        let mut index = HashMap::with_capacity(config.tools.len());
        for spec in &config.tools {
            if index.contains_key(&spec.name) {
                return Err(WrapperError::Config(format!(
                    "Duplicate tool name '{}'",
                    spec.name
                )));
            }
            let handler = ToolHandler::build(spec, &adapter)?;
            index.insert(spec.name.clone(), handlers.len());
            handlers.push(Arc::new(handler));
        }

        Ok(Self {
            adapter,
            concurrency,
            handlers,
            index,
        })
    }

    /// # Errors
    ///
    /// Returns [`WrapperError::ToolNotFound`] when no tool has this name.
    pub fn lookup(&self, name: &str) -> Result<Arc<ToolHandler>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.handlers[i]))
            .ok_or_else(|| WrapperError::ToolNotFound(name.to_string()))
    }

    #[must_use]
    pub fn adapter(&self) -> &BackendAdapter {
        &self.adapter
    }

    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers in declared order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<ToolHandler>> {
        self.handlers.iter()
    }

    /// MCP tool definitions in declared order.
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.handlers.iter().map(|h| h.tool()).collect()
    }
}
