//! Request/response template rendering.
//!
//! Tool definitions carry `{{ expr }}` placeholders in their path, headers,
//! and body templates. An expression is a dotted path over the render
//! context (`args.x`, `config.url`, `request.headers.authorization`,
//! `response.data.items.0`) or a call to one of a small set of built-in
//! functions. Unknown paths render as the empty string; object and array
//! values render as compact JSON.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::config::ToolDef;

/// Errors raised while rendering a template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    #[error("invalid expression '{0}'")]
    BadExpression(String),
    #[error("{func}: {message}")]
    BadCall { func: String, message: String },
}

/// Client request data visible to templates, merged from the session's
/// captured snapshot and the current request (current wins).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub path: HashMap<String, String>,
    pub body: Value,
}

impl RequestContext {
    /// Overlay another request on top of this one; the overlay wins.
    pub fn merge(&self, overlay: &RequestContext) -> RequestContext {
        let mut merged = self.clone();
        merged.headers.extend(overlay.headers.clone());
        merged.query.extend(overlay.query.clone());
        merged.cookies.extend(overlay.cookies.clone());
        merged.path.extend(overlay.path.clone());
        if !overlay.body.is_null() {
            merged.body = overlay.body.clone();
        }
        merged
    }
}

/// Upstream response data visible to `response_body` templates.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    /// Parsed JSON body, Null when the body was not JSON.
    pub data: Value,
    /// Raw body text.
    pub body: String,
}

/// Full render context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub args: Map<String, Value>,
    pub config: Map<String, Value>,
    pub request: RequestContext,
    pub response: ResponseContext,
}

impl Context {
    fn to_value(&self) -> Value {
        let map_to_value = |m: &HashMap<String, String>| {
            Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        };

        serde_json::json!({
            "args": Value::Object(self.args.clone()),
            "config": Value::Object(self.config.clone()),
            "request": {
                "headers": map_to_value(&self.request.headers),
                "query": map_to_value(&self.request.query),
                "cookies": map_to_value(&self.request.cookies),
                "path": map_to_value(&self.request.path),
                "body": self.request.body,
            },
            "response": {
                "data": self.response.data,
                "body": self.response.body,
            },
        })
    }
}

/// Render a template against a context.
pub fn render(template: &str, ctx: &Context) -> Result<String, TemplateError> {
    let root = ctx.to_value();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(template.len() - rest.len() + start))?;
        let expr = after[..end].trim();
        let value = eval(expr, &root)?;
        out.push_str(&value_to_string(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Evaluate one placeholder expression to a JSON value.
pub fn eval(expr: &str, root: &Value) -> Result<Value, TemplateError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(TemplateError::BadExpression(expr.to_string()));
    }

    // Function call: name(arg, ...)
    if let Some(open) = expr.find('(') {
        let name = expr[..open].trim();
        if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && expr.ends_with(')') {
            let inner = &expr[open + 1..expr.len() - 1];
            let args = split_call_args(inner)
                .into_iter()
                .map(|a| eval_atom(a.trim(), root))
                .collect::<Result<Vec<_>, _>>()?;
            return apply_function(name, args);
        }
    }

    eval_atom(expr, root)
}

/// Evaluate a literal or dotted path.
fn eval_atom(expr: &str, root: &Value) -> Result<Value, TemplateError> {
    // String literal
    if (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
        || (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
    {
        return Ok(Value::String(expr[1..expr.len() - 1].to_string()));
    }
    // Number literal
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    if expr.contains('.') && expr.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') {
        if let Ok(f) = expr.parse::<f64>() {
            return Ok(serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null));
        }
    }

    // Dotted path with optional numeric segments for array indexing.
    let mut current = root;
    for segment in expr.split('.') {
        if segment.is_empty() {
            return Err(TemplateError::BadExpression(expr.to_string()));
        }
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(idx) => items.get(idx).unwrap_or(&Value::Null),
                Err(_) => &Value::Null,
            },
            _ => &Value::Null,
        };
    }
    Ok(current.clone())
}

/// Split call arguments on commas that are not inside quotes.
fn split_call_args(inner: &str) -> Vec<&str> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth_quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (c, depth_quote) {
            ('"', None) | ('\'', None) => depth_quote = Some(c),
            (q, Some(open)) if q == open => depth_quote = None,
            (',', None) => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

fn apply_function(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    let arity = |n: usize| -> Result<(), TemplateError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(TemplateError::BadCall {
                func: name.to_string(),
                message: format!("expected {} argument(s), got {}", n, args.len()),
            })
        }
    };

    match name {
        "toString" => {
            arity(1)?;
            Ok(Value::String(value_to_string(&args[0])))
        }
        "toNumber" => {
            arity(1)?;
            match &args[0] {
                Value::Number(n) => Ok(Value::Number(n.clone())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| TemplateError::BadCall {
                        func: name.to_string(),
                        message: format!("'{}' is not a number", s),
                    }),
                other => Err(TemplateError::BadCall {
                    func: name.to_string(),
                    message: format!("cannot convert {} to a number", type_name(other)),
                }),
            }
        }
        "length" => {
            arity(1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => {
                    return Err(TemplateError::BadCall {
                        func: name.to_string(),
                        message: format!("{} has no length", type_name(other)),
                    })
                }
            };
            Ok(Value::Number((len as u64).into()))
        }
        "toJSON" => {
            arity(1)?;
            Ok(Value::String(args[0].to_string()))
        }
        "fromJSON" => {
            arity(1)?;
            let text = args[0].as_str().ok_or_else(|| TemplateError::BadCall {
                func: name.to_string(),
                message: "argument must be a string".to_string(),
            })?;
            serde_json::from_str(text).map_err(|e| TemplateError::BadCall {
                func: name.to_string(),
                message: e.to_string(),
            })
        }
        "join" => {
            arity(2)?;
            let sep = value_to_string(&args[1]);
            match &args[0] {
                Value::Array(items) => Ok(Value::String(
                    items
                        .iter()
                        .map(value_to_string)
                        .collect::<Vec<_>>()
                        .join(&sep),
                )),
                other => Err(TemplateError::BadCall {
                    func: name.to_string(),
                    message: format!("cannot join {}", type_name(other)),
                }),
            }
        }
        "default" => {
            arity(2)?;
            let missing = matches!(&args[0], Value::Null)
                || matches!(&args[0], Value::String(s) if s.is_empty());
            Ok(if missing {
                args[1].clone()
            } else {
                args[0].clone()
            })
        }
        other => Err(TemplateError::BadCall {
            func: other.to_string(),
            message: "unknown function".to_string(),
        }),
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

/// Stringify a value for interpolation: nulls vanish, strings pass through,
/// everything else is compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Insert declared defaults for arguments the caller omitted.
pub fn fill_default_args(tool: &ToolDef, args: &mut Map<String, Value>) {
    for arg in &tool.args {
        if !args.contains_key(&arg.name) {
            if let Some(default) = &arg.default {
                args.insert(arg.name.clone(), default.clone());
            }
        }
    }
}

/// Parse JSON strings back into structure for arguments declared as
/// object/array. Clients frequently double-encode these.
pub fn normalize_json_string_values(tool: &ToolDef, args: &mut Map<String, Value>) {
    for arg in &tool.args {
        if arg.arg_type != "object" && arg.arg_type != "array" {
            continue;
        }
        let Some(Value::String(raw)) = args.get(&arg.name) else {
            continue;
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => {
                args.insert(arg.name.clone(), parsed);
            }
            _ => {
                tracing::debug!(
                    tool = %tool.name,
                    arg = %arg.name,
                    "argument declared {} but is not valid JSON, leaving as string",
                    arg.arg_type
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        let mut ctx = Context::default();
        ctx.args = json!({
            "x": 42,
            "name": "world",
            "tags": ["a", "b"],
            "filter": { "kind": "primary" }
        })
        .as_object()
        .unwrap()
        .clone();
        ctx.config = json!({ "url": "http://u" }).as_object().unwrap().clone();
        ctx.request
            .headers
            .insert("authorization".to_string(), "Bearer tok".to_string());
        ctx
    }

    #[test]
    fn test_render_dotted_paths() {
        let ctx = ctx();
        assert_eq!(render("{{config.url}}/e", &ctx).unwrap(), "http://u/e");
        assert_eq!(render("x={{args.x}}", &ctx).unwrap(), "x=42");
        assert_eq!(
            render("{{request.headers.authorization}}", &ctx).unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn test_render_array_index_and_objects() {
        let ctx = ctx();
        assert_eq!(render("{{args.tags.1}}", &ctx).unwrap(), "b");
        assert_eq!(
            render("{{args.filter}}", &ctx).unwrap(),
            "{\"kind\":\"primary\"}"
        );
    }

    #[test]
    fn test_render_unknown_path_is_empty() {
        let ctx = ctx();
        assert_eq!(render("[{{args.missing}}]", &ctx).unwrap(), "[]");
        assert_eq!(render("[{{request.query.q}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_render_functions() {
        let ctx = ctx();
        assert_eq!(render("{{toString(args.x)}}", &ctx).unwrap(), "42");
        assert_eq!(render("{{length(args.tags)}}", &ctx).unwrap(), "2");
        assert_eq!(render("{{join(args.tags, \",\")}}", &ctx).unwrap(), "a,b");
        assert_eq!(
            render("{{toJSON(args.filter)}}", &ctx).unwrap(),
            "{\"kind\":\"primary\"}"
        );
        assert_eq!(
            render("{{default(args.missing, \"fallback\")}}", &ctx).unwrap(),
            "fallback"
        );
        assert_eq!(
            render("{{default(args.name, \"fallback\")}}", &ctx).unwrap(),
            "world"
        );
        assert_eq!(
            render("{{fromJSON(\"[1,2]\")}}", &ctx).unwrap(),
            "[1,2]"
        );
    }

    #[test]
    fn test_render_errors() {
        let ctx = ctx();
        assert!(matches!(
            render("{{args.x", &ctx),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            render("{{nope(args.x)}}", &ctx),
            Err(TemplateError::BadCall { .. })
        ));
    }

    fn tool_with_args(args: Vec<ToolArg>) -> ToolDef {
        ToolDef {
            name: "t".into(),
            description: String::new(),
            method: "POST".into(),
            path: "{{config.url}}".into(),
            headers: Default::default(),
            args,
            request_body: String::new(),
            response_body: String::new(),
            input_schema: Value::Null,
        }
    }

    use crate::config::{ArgPosition, ToolArg};

    #[test]
    fn test_fill_default_args() {
        let tool = tool_with_args(vec![ToolArg {
            name: "limit".into(),
            position: ArgPosition::Query,
            arg_type: "number".into(),
            required: false,
            description: String::new(),
            default: Some(json!(10)),
            items: None,
        }]);

        let mut args = Map::new();
        fill_default_args(&tool, &mut args);
        assert_eq!(args["limit"], 10);

        let mut args: Map<String, Value> =
            json!({ "limit": 5 }).as_object().unwrap().clone();
        fill_default_args(&tool, &mut args);
        assert_eq!(args["limit"], 5);
    }

    #[test]
    fn test_normalize_json_string_values() {
        let tool = tool_with_args(vec![ToolArg {
            name: "filter".into(),
            position: ArgPosition::Body,
            arg_type: "object".into(),
            required: false,
            description: String::new(),
            default: None,
            items: None,
        }]);

        let mut args: Map<String, Value> =
            json!({ "filter": "{\"kind\":\"x\"}" }).as_object().unwrap().clone();
        normalize_json_string_values(&tool, &mut args);
        assert_eq!(args["filter"]["kind"], "x");

        // Not valid JSON: left alone.
        let mut args: Map<String, Value> =
            json!({ "filter": "not json" }).as_object().unwrap().clone();
        normalize_json_string_values(&tool, &mut args);
        assert_eq!(args["filter"], "not json");
    }

    #[test]
    fn test_request_merge_current_wins() {
        let mut snapshot = RequestContext::default();
        snapshot
            .headers
            .insert("authorization".into(), "Bearer session".into());
        snapshot.query.insert("tenant".into(), "acme".into());

        let mut current = RequestContext::default();
        current
            .headers
            .insert("authorization".into(), "Bearer fresh".into());

        let merged = snapshot.merge(&current);
        assert_eq!(merged.headers["authorization"], "Bearer fresh");
        assert_eq!(merged.query["tenant"], "acme");
    }
}
