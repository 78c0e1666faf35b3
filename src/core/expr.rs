//! Expression evaluation over the flow data map.
//!
//! The flow interpreter only depends on the [`Evaluator`] trait; the
//! bundled [`TemplateEvaluator`] substitutes `${name}` templates with
//! dotted-path lookups into the data map and the session env. Hosts can
//! install a richer language behind the same contract.

use crate::core::env;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

pub trait Evaluator: Send + Sync {
    fn eval_any(
        &self,
        env: &HashMap<String, String>,
        data: &HashMap<String, Value>,
        expr: &Value,
    ) -> Result<Value>;

    fn eval_bool(
        &self,
        env: &HashMap<String, String>,
        data: &HashMap<String, Value>,
        expr: &Value,
    ) -> Result<bool> {
        to_bool(&self.eval_any(env, data, expr)?)
    }

    fn eval_list(
        &self,
        env: &HashMap<String, String>,
        data: &HashMap<String, Value>,
        expr: &Value,
    ) -> Result<Vec<Value>> {
        match self.eval_any(env, data, expr)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::semantic(format!(
                "expected a list, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Evaluates an optional object template; `None`/null yields `None`.
    fn eval_object(
        &self,
        env: &HashMap<String, String>,
        data: &HashMap<String, Value>,
        expr: Option<&Value>,
    ) -> Result<Option<Value>> {
        match expr {
            None | Some(Value::Null) => Ok(None),
            Some(expr) => self.eval_any(env, data, expr).map(Some),
        }
    }
}

fn to_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("true") {
                Ok(true)
            } else if trimmed.eq_ignore_ascii_case("false") || trimmed.is_empty() {
                Ok(false)
            } else {
                Err(Error::semantic(format!("not a boolean: {trimmed:?}")))
            }
        }
        other => Err(Error::semantic(format!(
            "not a boolean: {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Default)]
pub struct TemplateEvaluator;

impl Evaluator for TemplateEvaluator {
    fn eval_any(
        &self,
        env: &HashMap<String, String>,
        data: &HashMap<String, Value>,
        expr: &Value,
    ) -> Result<Value> {
        Ok(match expr {
            Value::String(s) => eval_string(env, data, s),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.eval_any(env, data, item))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.eval_any(env, data, value)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

/// A string that is exactly one `${path}` reference keeps the referenced
/// value's type; anything else is textual substitution.
fn eval_string(env: &HashMap<String, String>, data: &HashMap<String, Value>, s: &str) -> Value {
    if let Some(path) = whole_reference(s) {
        return resolve(env, data, path).unwrap_or(Value::Null);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                match resolve(env, data, path) {
                    Some(value) => out.push_str(&stringify(&value)),
                    None => {
                        out.push_str("${");
                        out.push_str(path);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner)
}

fn resolve(
    env: &HashMap<String, String>,
    data: &HashMap<String, Value>,
    path: &str,
) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    let mut current = match data.get(head) {
        Some(value) => value.clone(),
        None => return env::lookup(env, head).map(Value::String),
    };

    for segment in segments {
        current = match &current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?.clone()
            }
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
