// Module: Template
// Liquid-dialect rendering for parameter maps and HTTP request specs.
// Supports `{{ a.b[0].c }}` paths with `first`/`last` accessors and a pipe
// chain of the filters the action configs actually use: default, upcase,
// downcase, map, join, truncate.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::errors::TemplateError;
use crate::protocol::Delivery;

static EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid expression regex"));

/// Environment variables are only exposed when the template names them.
static ENV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*env\.([A-Z_][A-Z0-9_]*)\s*[}|]").expect("valid env scan regex")
});

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_-]+)((?:\[\d+\])*)$").expect("valid segment regex"));

/// Root scope a template is evaluated against.
///
/// For a delivery: every top-level key of `data` is promoted to the root,
/// `event` aliases the whole of `data`, and `action` exposes the upstream
/// action identity when the delivery carries one.
#[derive(Debug, Clone)]
pub struct RenderContext {
    root: Map<String, Value>,
}

impl RenderContext {
    pub fn for_delivery(delivery: &Delivery) -> Self {
        let mut root = delivery.data.clone();
        root.insert("event".to_string(), Value::Object(delivery.data.clone()));
        if let Some(action) = &delivery.action {
            root.insert(
                "action".to_string(),
                json!({
                    "id": action.id,
                    "name": action.name,
                    "slug": action.slug,
                }),
            );
        }
        Self { root }
    }

    /// Build a context from an arbitrary object; non-objects get an empty
    /// root. Used by tests and synthetic renders.
    pub fn from_value(value: Value) -> Self {
        let root = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { root }
    }
}

/// Render a template against the context. Unresolved variables render as
/// empty strings; only malformed expressions and bad filters are errors.
pub fn render(template: &str, ctx: &RenderContext) -> Result<String, TemplateError> {
    let env = scan_env(template);
    let mut output = String::with_capacity(template.len());
    let mut last_index = 0;

    for capture in EXPR_RE.captures_iter(template) {
        let matched = capture.get(0).expect("capture 0 always present");
        output.push_str(&template[last_index..matched.start()]);
        let expr = capture.get(1).expect("capture 1 always present").as_str();
        let value = eval_expression(expr, ctx, &env)?;
        output.push_str(&stringify(&value));
        last_index = matched.end();
    }

    output.push_str(&template[last_index..]);
    Ok(output)
}

/// Render for a parameter value: any failure collapses to an empty string,
/// logged once, so one bad template never aborts a dispatch.
pub fn render_or_empty(template: &str, ctx: &RenderContext) -> String {
    match render(template, ctx) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!(template, error = %err, "template render failed; using empty value");
            String::new()
        }
    }
}

/// Collect the process environment variables this template names. Unset
/// names stay absent so `default:` can distinguish unset from empty.
fn scan_env(template: &str) -> Map<String, Value> {
    let mut env = Map::new();
    for capture in ENV_RE.captures_iter(template) {
        let name = capture.get(1).expect("capture 1 always present").as_str();
        if let Ok(value) = std::env::var(name) {
            env.insert(name.to_string(), Value::String(value));
        }
    }
    env
}

fn eval_expression(
    expr: &str,
    ctx: &RenderContext,
    env: &Map<String, Value>,
) -> Result<Value, TemplateError> {
    let parts = split_pipes(expr);
    let path = match parts.first() {
        Some(first) if !first.trim().is_empty() => first.trim(),
        _ => return Err(TemplateError::Malformed(expr.trim().to_string())),
    };

    let mut value = resolve_path(path, ctx, env)?;
    for filter in &parts[1..] {
        value = apply_filter(filter.trim(), value)?;
    }
    Ok(value)
}

/// Split a `var | filter: "arg" | filter` chain on pipes outside quotes.
fn split_pipes(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in expr.chars() {
        match (ch, quote) {
            ('"' | '\'', None) => {
                quote = Some(ch);
                current.push(ch);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(c);
            }
            ('|', None) => {
                parts.push(current.clone());
                current.clear();
            }
            (c, _) => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn resolve_path(
    path: &str,
    ctx: &RenderContext,
    env: &Map<String, Value>,
) -> Result<Value, TemplateError> {
    // `env` is its own namespace, scanned lazily from the template.
    let (scope, remainder) = match path.strip_prefix("env.") {
        Some(rest) => (env, rest),
        None if path == "env" => return Ok(Value::Object(env.clone())),
        None => (&ctx.root, path),
    };

    // Parse every segment up front so a malformed tail is an error even
    // when an earlier segment already fails to resolve.
    let mut segments = Vec::new();
    for segment in remainder.split('.') {
        let capture = SEGMENT_RE
            .captures(segment)
            .ok_or_else(|| TemplateError::Malformed(path.to_string()))?;
        segments.push((
            capture.get(1).expect("segment name").as_str(),
            capture.get(2).expect("segment indexes").as_str(),
        ));
    }

    let mut current: Option<&Value> = None;
    for (name, indexes) in segments {
        let next = match current {
            None => scope.get(name),
            Some(value) => step(value, name),
        };
        let mut value = match next {
            Some(v) => v,
            None => return Ok(Value::Null),
        };

        for index in indexes
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split("][")
            .filter(|s| !s.is_empty())
        {
            let idx: usize = index
                .parse()
                .map_err(|_| TemplateError::Malformed(path.to_string()))?;
            match value.get(idx) {
                Some(v) => value = v,
                None => return Ok(Value::Null),
            }
        }

        current = Some(value);
    }

    Ok(current.cloned().unwrap_or(Value::Null))
}

/// One dot-step into a value; arrays understand `first` and `last`.
fn step<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(name),
        Value::Array(items) => match name {
            "first" => items.first(),
            "last" => items.last(),
            _ => None,
        },
        _ => None,
    }
}

fn apply_filter(spec: &str, value: Value) -> Result<Value, TemplateError> {
    let (name, raw_args) = match spec.split_once(':') {
        Some((name, args)) => (name.trim(), args.trim()),
        None => (spec, ""),
    };
    let args = parse_args(raw_args)?;

    match name {
        "default" => {
            let fallback = require_arg(name, &args, 0)?;
            let empty = matches!(&value, Value::Null)
                || matches!(&value, Value::String(s) if s.is_empty());
            Ok(if empty { fallback.clone() } else { value })
        }
        "upcase" => Ok(Value::String(stringify(&value).to_uppercase())),
        "downcase" => Ok(Value::String(stringify(&value).to_lowercase())),
        "strip" => Ok(Value::String(stringify(&value).trim().to_string())),
        "map" => {
            let field = stringify(require_arg(name, &args, 0)?);
            match value {
                Value::Array(items) => Ok(Value::Array(
                    items
                        .into_iter()
                        .map(|item| item.get(&field).cloned().unwrap_or(Value::Null))
                        .collect(),
                )),
                other => Ok(other),
            }
        }
        "join" => {
            let separator = match args.first() {
                Some(arg) => stringify(arg),
                None => " ".to_string(),
            };
            match value {
                Value::Array(items) => Ok(Value::String(
                    items
                        .iter()
                        .map(stringify)
                        .collect::<Vec<_>>()
                        .join(&separator),
                )),
                other => Ok(other),
            }
        }
        "split" => {
            let separator = stringify(require_arg(name, &args, 0)?);
            let s = stringify(&value);
            if separator.is_empty() {
                return Ok(Value::Array(
                    s.chars().map(|c| Value::String(c.to_string())).collect(),
                ));
            }
            Ok(Value::Array(
                s.split(&separator)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "replace" => {
            let from = stringify(require_arg(name, &args, 0)?);
            let to = stringify(require_arg(name, &args, 1)?);
            Ok(Value::String(stringify(&value).replace(&from, &to)))
        }
        "size" => {
            let size = match &value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                Value::Null => 0,
                _ => stringify(&value).chars().count(),
            };
            Ok(Value::Number(size.into()))
        }
        "truncate" => {
            let limit = match require_arg(name, &args, 0)? {
                Value::Number(n) => n.as_u64().unwrap_or(0) as usize,
                _ => {
                    return Err(TemplateError::BadFilterArg {
                        filter: "truncate".to_string(),
                        expected: "an integer length".to_string(),
                    })
                }
            };
            Ok(Value::String(truncate(&stringify(&value), limit)))
        }
        other => Err(TemplateError::UnknownFilter(other.to_string())),
    }
}

/// Filter arguments: comma-separated literals, commas inside quotes kept.
fn parse_args(raw: &str) -> Result<Vec<Value>, TemplateError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in raw.chars() {
        match (ch, quote) {
            ('"' | '\'', None) => {
                quote = Some(ch);
                current.push(ch);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(c);
            }
            (',', None) => {
                parts.push(current.clone());
                current.clear();
            }
            (c, _) => current.push(c),
        }
    }
    parts.push(current);
    parts.into_iter().map(|part| parse_literal(&part)).collect()
}

fn require_arg<'a>(
    filter: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a Value, TemplateError> {
    args.get(index).ok_or_else(|| TemplateError::BadFilterArg {
        filter: filter.to_string(),
        expected: format!("at least {} argument(s)", index + 1),
    })
}

/// Filter arguments: quoted strings and integers; anything else is taken as
/// a bare string.
fn parse_literal(raw: &str) -> Result<Value, TemplateError> {
    let raw = raw.trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    if let Ok(n) = raw.parse::<u64>() {
        return Ok(json!(n));
    }
    Ok(Value::String(raw.to_string()))
}

/// Liquid truncate: the result is at most `limit` characters, the trailing
/// `...` included.
fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(&"..."[..limit.min(3)]);
    out
}

/// Rendering of a final value: scalars print naturally, nil prints empty,
/// composites print as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => serde_json::to_string(composite).unwrap_or_default(),
    }
}
