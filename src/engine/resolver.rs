//! Placeholder resolution and condition evaluation.
//!
//! Node configuration values may embed `{{ path }}` expressions. Lookup
//! order is fixed: local scope variables first, then `credential.*`, then
//! `env.*`, then prior node outputs addressed as `nodeId.field.subfield`.
//! A string that consists of exactly one placeholder resolves to the typed
//! value; placeholders embedded in larger strings are stringified in place.
//! Missing paths resolve to an empty value and record a trace warning, they
//! never abort the run.

use crate::credentials::CredentialResolver;
use crate::workflow::types::{LogEntry, LogLevel, NodeOutput, WorkflowNode};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").unwrap());

/// Config keys holding nested sub-graph definitions or schemas. These are
/// structural, not data, and must reach their sub-interpreter verbatim.
const PASSTHROUGH_KEYS: &[&str] = &[
    "branches",
    "iterationNodes",
    "iterationConnections",
    "loopNodes",
    "loopConnections",
    "flowGroupNodes",
    "flowGroupConnections",
    "inputFieldsSchema",
    "retry",
];

/// Lookup scope for one resolution pass.
///
/// `outputs` is a chain checked innermost-first, so a nested sub-graph sees
/// its own node outputs before the parent run's.
pub struct Scope<'a> {
    pub locals: &'a Map<String, Value>,
    pub outputs: Vec<&'a BTreeMap<String, NodeOutput>>,
}

impl<'a> Scope<'a> {
    pub fn new(locals: &'a Map<String, Value>, outputs: Vec<&'a BTreeMap<String, NodeOutput>>) -> Self {
        Self { locals, outputs }
    }
}

/// Stateless resolver bound to a credential source.
pub struct Resolver<'a> {
    credentials: &'a dyn CredentialResolver,
}

impl<'a> Resolver<'a> {
    pub fn new(credentials: &'a dyn CredentialResolver) -> Self {
        Self { credentials }
    }

    /// Resolve all placeholders inside `value` if it is a string; other
    /// scalar types pass through untouched.
    pub async fn resolve_value(
        &self,
        value: &Value,
        scope: &Scope<'_>,
        logs: &mut Vec<LogEntry>,
    ) -> Value {
        let Value::String(s) = value else {
            return value.clone();
        };
        self.resolve_str(s, scope, logs).await
    }

    async fn resolve_str(&self, s: &str, scope: &Scope<'_>, logs: &mut Vec<LogEntry>) -> Value {
        let captures: Vec<(String, String)> = PLACEHOLDER_RE
            .captures_iter(s)
            .map(|c| (c[0].to_string(), c[1].to_string()))
            .collect();
        if captures.is_empty() {
            return Value::String(s.to_string());
        }

        // Whole-string single placeholder keeps the typed value.
        if captures.len() == 1 && captures[0].0 == s {
            return self
                .lookup(&captures[0].1, scope, logs)
                .await
                .unwrap_or(Value::Null);
        }

        let mut out = s.to_string();
        for (literal, path) in captures {
            let substitute = match self.lookup(&path, scope, logs).await {
                Some(v) => stringify(&v),
                None => String::new(),
            };
            out = out.replacen(&literal, &substitute, 1);
        }
        Value::String(out)
    }

    /// Dotted-path lookup across the scope chain. Returns `None` (with a
    /// trace warning) when no source supplies the path.
    async fn lookup(
        &self,
        path: &str,
        scope: &Scope<'_>,
        logs: &mut Vec<LogEntry>,
    ) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();
        let head = parts[0];

        if let Some(root) = scope.locals.get(head) {
            if let Some(found) = walk(root, &parts[1..]) {
                return Some(found);
            }
        }

        if head == "credential" && parts.len() >= 2 {
            let name = parts[1..].join(".");
            match self.credentials.resolve(&name).await {
                Some(secret) => return Some(Value::String(secret)),
                None => {
                    logs.push(LogEntry::new(
                        LogLevel::Error,
                        format!("Credential '{name}' not found."),
                    ));
                    return None;
                }
            }
        }

        if head == "env" && parts.len() >= 2 {
            if let Ok(value) = std::env::var(parts[1..].join(".")) {
                return Some(Value::String(value));
            }
        }

        for outputs in &scope.outputs {
            if let Some(output) = outputs.get(head) {
                if let Some(found) = walk(&scope_view(output), &parts[1..]) {
                    return Some(found);
                }
            }
        }

        logs.push(LogEntry::new(
            LogLevel::Info,
            format!("Placeholder '{{{{{path}}}}}' did not resolve; substituting empty value."),
        ));
        None
    }

    /// Resolve a node's full configuration in two phases: `inputMapping`
    /// against the surrounding scope, then `config` against the surrounding
    /// scope extended with the mapped variables. The result carries the
    /// mapped variables under the `input` key.
    pub async fn resolve_node_config(
        &self,
        node: &WorkflowNode,
        scope: &Scope<'_>,
        logs: &mut Vec<LogEntry>,
    ) -> Map<String, Value> {
        let mut mapped = Map::new();
        if let Some(mapping) = &node.input_mapping {
            for (key, expr) in mapping {
                let resolved = self.resolve_value(expr, scope, logs).await;
                mapped.insert(key.clone(), resolved);
            }
        }

        let mut combined = scope.locals.clone();
        for (k, v) in &mapped {
            combined.insert(k.clone(), v.clone());
        }
        let inner = Scope::new(&combined, scope.outputs.clone());

        let mut resolved = Map::new();
        for (key, value) in &node.config {
            if PASSTHROUGH_KEYS.contains(&key.as_str()) {
                resolved.insert(key.clone(), value.clone());
            } else {
                resolved.insert(key.clone(), self.resolve_deep(value, &inner, logs).await);
            }
        }
        resolved.insert("input".to_string(), Value::Object(mapped));
        resolved
    }

    /// Recursive resolution through arrays and objects.
    fn resolve_deep<'b>(
        &'b self,
        value: &'b Value,
        scope: &'b Scope<'b>,
        logs: &'b mut Vec<LogEntry>,
    ) -> Pin<Box<dyn Future<Output = Value> + Send + 'b>> {
        Box::pin(async move {
            match value {
                Value::String(s) => self.resolve_str(s, scope, logs).await,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_deep(item, scope, &mut *logs).await);
                    }
                    Value::Array(out)
                }
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (k, v) in map {
                        let resolved = self.resolve_deep(v, scope, &mut *logs).await;
                        out.insert(k.clone(), resolved);
                    }
                    Value::Object(out)
                }
                other => other.clone(),
            }
        })
    }
}

/// Placeholder-visible view of a node output: the payload extended with
/// `status` and, on failure, `error_message`, so error-handle consumers can
/// reference `{{failedNode.error_message}}`.
fn scope_view(output: &NodeOutput) -> Value {
    match &output.payload {
        Value::Object(map) => {
            let mut view = map.clone();
            if let Ok(status) = serde_json::to_value(output.status) {
                view.insert("status".to_string(), status);
            }
            if let Some(message) = &output.error {
                view.insert("error_message".to_string(), Value::String(message.clone()));
            }
            Value::Object(view)
        }
        other => other.clone(),
    }
}

fn walk(root: &Value, parts: &[&str]) -> Option<Value> {
    let mut current = root;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(*part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Evaluate a fully-resolved condition expression to a boolean.
///
/// Supports one binary comparison (`===`, `!==`, `==`, `!=`, `<=`, `>=`,
/// `<`, `>`) between typed operands, or the truthiness of a single value.
/// Malformed input evaluates to `false` rather than failing the node.
pub fn evaluate_condition(expression: &str) -> bool {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return false;
    }

    // Longer operators first so "<=" is not split as "<".
    for op in ["===", "!==", "==", "!=", "<=", ">=", "<", ">"] {
        let mut split = trimmed.splitn(2, op);
        let (Some(left), Some(right)) = (split.next(), split.next()) else {
            continue;
        };
        // An empty side (e.g. a placeholder that resolved to nothing)
        // compares as the empty string, as the expression author wrote it.
        let (left, right) = (left.trim(), right.trim());
        let (a, b) = (parse_operand(left), parse_operand(right));
        return match op {
            "===" => strict_eq(&a, &b),
            "!==" => !strict_eq(&a, &b),
            "==" => loose_eq(&a, &b),
            "!=" => !loose_eq(&a, &b),
            "<=" => compare(&a, &b, |o| o.is_le()),
            ">=" => compare(&a, &b, |o| o.is_ge()),
            "<" => compare(&a, &b, |o| o.is_lt()),
            ">" => compare(&a, &b, |o| o.is_gt()),
            _ => false,
        };
    }

    truthy(&parse_operand(trimmed))
}

/// Parse one operand into a typed value: booleans, null, quoted strings and
/// numbers are recognized, everything else stays a bare string.
fn parse_operand(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "undefined" => return Value::Null,
        _ => {}
    }
    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if let Ok(n) = raw.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }
    Value::String(raw.to_string())
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    stringify(a) == stringify(b)
}

fn compare(a: &Value, b: &Value, accept: fn(std::cmp::Ordering) -> bool) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).map(accept).unwrap_or(false);
    }
    accept(stringify(a).cmp(&stringify(b)))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
