//! Template expression evaluator: `{{ path | filter(args) }}`.
//!
//! A recursive-descent scanner (`interpolate_value` for whole-string typed
//! substitution, `interpolate_string` for embedded textual substitution,
//! `navigate_json_path` for path traversal), built for this system's
//! single-brace-pair syntax and
//! extended with the filter pipeline (`tojson`, `default`, `length`, `join`).
//!
//! Evaluation is pure and non-suspending: it never calls a tool, never
//! sleeps, and always terminates. Any failure is a [`ErrorCode::TemplateError`]
//! and is never retryable.

use dael_types::{DaelError, ErrorCode};
use serde_json::{Map, Value};

/// The two namespaces a template expression may read from.
pub struct TemplateContext<'a> {
    pub inputs: &'a Value,
    pub steps: &'a Value,
}

#[derive(Debug, Clone)]
enum PathSegment {
    Field(String),
    Index(i64),
    Key(String),
}

#[derive(Debug, Clone)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn into_value(self) -> Value {
        match self {
            Literal::Str(s) => Value::String(s),
            Literal::Num(n) => serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            Literal::Bool(b) => Value::Bool(b),
            Literal::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
struct FilterCall {
    name: String,
    args: Vec<Literal>,
}

#[derive(Debug, Clone)]
struct Expr {
    path: Vec<PathSegment>,
    filters: Vec<FilterCall>,
}

fn template_error(message: impl Into<String>) -> DaelError {
    DaelError::new(ErrorCode::TemplateError, message)
}

/// Renders a template string, preserving the original JSON type when the
/// whole (trimmed) string is exactly one `{{ expr }}` expression. Otherwise
/// every embedded expression is substituted as text and the result is a
/// [`Value::String`].
pub fn render_value(template: &str, context: &TemplateContext) -> Result<Value, DaelError> {
    match single_expression(template) {
        Some(inner) => {
            let expr = parse_expression(inner)?;
            evaluate(&expr, context)
        }
        None => Ok(Value::String(render_string(template, context)?)),
    }
}

/// Renders every `{{ expr }}` occurrence in `template` to its textual form
/// and substitutes it in place, regardless of how many occurrences exist.
pub fn render_string(template: &str, context: &TemplateContext) -> Result<String, DaelError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match find_expression(rest) {
            None => {
                output.push_str(rest);
                break;
            }
            Some((before, inner, after)) => {
                output.push_str(before);
                let expr = parse_expression(inner)?;
                let value = evaluate(&expr, context)?;
                output.push_str(&display_value(&value));
                rest = after;
            }
        }
    }
    Ok(output)
}

/// Recursively renders every string leaf of a JSON value (object/array
/// structure preserved, each string value passed through [`render_value`]).
pub fn render_tree(value: &Value, context: &TemplateContext) -> Result<Value, DaelError> {
    match value {
        Value::String(s) => render_value(s, context),
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_tree(item, context)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, v) in map {
                rendered.insert(key.clone(), render_tree(v, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// If `template`, once trimmed, is exactly one `{{ ... }}` expression with no
/// surrounding text, returns its inner content.
fn single_expression(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("}}") || inner.contains("{{") {
        return None;
    }
    Some(inner.trim())
}

/// Finds the first `{{ ... }}` occurrence, returning the text before it, its
/// inner content, and the text after it.
fn find_expression(text: &str) -> Option<(&str, &str, &str)> {
    let start = text.find("{{")?;
    let after_open = &text[start + 2..];
    let end = after_open.find("}}")?;
    let inner = &after_open[..end];
    let before = &text[..start];
    let after = &after_open[end + 2..];
    Some((before, inner.trim(), after))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn parse_expression(input: &str) -> Result<Expr, DaelError> {
    let parts = split_top_level(input, '|');
    let mut parts = parts.into_iter();
    let path_part = parts.next().ok_or_else(|| template_error("empty template expression"))?;
    let path = parse_path(path_part.trim())?;
    let mut filters = Vec::new();
    for filter_part in parts {
        filters.push(parse_filter(filter_part.trim())?);
    }
    Ok(Expr { path, filters })
}

/// Splits `input` on `separator`, ignoring separators inside single or double
/// quotes and inside `()`/`[]` nesting.
fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;
    let mut start = 0usize;
    let bytes = input.as_bytes();
    let mut index = 0usize;
    while index < bytes.len() {
        let ch = input[index..].chars().next().unwrap();
        match in_quote {
            Some(q) if ch == q => in_quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' => in_quote = Some(ch),
                '(' | '[' => depth += 1,
                ')' | ']' => depth -= 1,
                c if c == separator && depth == 0 => {
                    parts.push(&input[start..index]);
                    start = index + ch.len_utf8();
                }
                _ => {}
            },
        }
        index += ch.len_utf8();
    }
    parts.push(&input[start..]);
    parts
}

fn parse_path(input: &str) -> Result<Vec<PathSegment>, DaelError> {
    if input.is_empty() {
        return Err(template_error("empty path expression"));
    }
    let mut segments = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut index = 0usize;
    while index < chars.len() {
        match chars[index] {
            '.' => {
                index += 1;
            }
            '[' => {
                let close = chars[index..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + index)
                    .ok_or_else(|| template_error(format!("unterminated '[' in path '{input}'")))?;
                let raw: String = chars[index + 1..close].iter().collect();
                let raw = raw.trim();
                if let Some(stripped) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
                    segments.push(PathSegment::Key(stripped.to_string()));
                } else if let Some(stripped) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                    segments.push(PathSegment::Key(stripped.to_string()));
                } else {
                    let n: i64 = raw
                        .parse()
                        .map_err(|_| template_error(format!("invalid index '{raw}' in path '{input}'")))?;
                    segments.push(PathSegment::Index(n));
                }
                index = close + 1;
            }
            _ => {
                let start = index;
                while index < chars.len() && chars[index] != '.' && chars[index] != '[' {
                    index += 1;
                }
                let field: String = chars[start..index].iter().collect();
                if field.is_empty() {
                    return Err(template_error(format!("empty path segment in '{input}'")));
                }
                segments.push(PathSegment::Field(field));
            }
        }
    }
    if segments.is_empty() {
        return Err(template_error(format!("path '{input}' has no segments")));
    }
    Ok(segments)
}

fn parse_filter(input: &str) -> Result<FilterCall, DaelError> {
    if input.is_empty() {
        return Err(template_error("empty filter in pipeline"));
    }
    match input.find('(') {
        None => Ok(FilterCall {
            name: input.to_string(),
            args: Vec::new(),
        }),
        Some(open) => {
            let name = input[..open].trim().to_string();
            let close = input
                .rfind(')')
                .ok_or_else(|| template_error(format!("unterminated '(' in filter '{input}'")))?;
            let raw_args = &input[open + 1..close];
            let args = if raw_args.trim().is_empty() {
                Vec::new()
            } else {
                split_top_level(raw_args, ',')
                    .into_iter()
                    .map(|arg| parse_literal(arg.trim()))
                    .collect::<Result<Vec<_>, _>>()?
            };
            Ok(FilterCall { name, args })
        }
    }
}

fn parse_literal(input: &str) -> Result<Literal, DaelError> {
    if let Some(stripped) = input.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(Literal::Str(stripped.to_string()));
    }
    if let Some(stripped) = input.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Literal::Str(stripped.to_string()));
    }
    match input {
        "true" => Ok(Literal::Bool(true)),
        "false" => Ok(Literal::Bool(false)),
        "null" => Ok(Literal::Null),
        _ => input
            .parse::<f64>()
            .map(Literal::Num)
            .map_err(|_| template_error(format!("invalid filter argument '{input}'"))),
    }
}

fn evaluate(expr: &Expr, context: &TemplateContext) -> Result<Value, DaelError> {
    let mut current = navigate(&expr.path, context)?;
    for filter in &expr.filters {
        current = apply_filter(filter, current)?;
    }
    current.ok_or_else(|| {
        template_error(format!(
            "path '{}' did not resolve and no 'default' filter was supplied",
            render_path(&expr.path)
        ))
    })
}

fn render_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, segment) in path.iter().enumerate() {
        match segment {
            PathSegment::Field(f) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(f);
            }
            PathSegment::Index(n) => out.push_str(&format!("[{n}]")),
            PathSegment::Key(k) => out.push_str(&format!("['{k}']")),
        }
    }
    out
}

fn navigate(path: &[PathSegment], context: &TemplateContext) -> Result<Option<Value>, DaelError> {
    let (root_name, rest) = match path.split_first() {
        Some((PathSegment::Field(name), rest)) => (name.as_str(), rest),
        _ => return Err(template_error("path must start with a root name ('inputs' or 'steps')")),
    };
    let mut current = match root_name {
        "inputs" => context.inputs.clone(),
        "steps" => context.steps.clone(),
        other => {
            return Err(template_error(format!(
                "unknown root '{other}': expected 'inputs' or 'steps'"
            )))
        }
    };
    for segment in rest {
        let next = match (segment, &current) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name).cloned(),
            (PathSegment::Key(key), Value::Object(map)) => map.get(key).cloned(),
            (PathSegment::Index(i), Value::Array(items)) => usize::try_from(*i).ok().and_then(|i| items.get(i)).cloned(),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn apply_filter(filter: &FilterCall, current: Option<Value>) -> Result<Option<Value>, DaelError> {
    if filter.name == "default" {
        return match current {
            Some(value) => Ok(Some(value)),
            None => {
                let arg = filter
                    .args
                    .first()
                    .cloned()
                    .ok_or_else(|| template_error("'default' filter requires one argument"))?;
                Ok(Some(arg.into_value()))
            }
        };
    }

    let value = current.ok_or_else(|| {
        template_error(format!(
            "cannot apply filter '{}' to an unresolved path; add 'default' first",
            filter.name
        ))
    })?;

    match filter.name.as_str() {
        "tojson" => Ok(Some(Value::String(
            serde_json::to_string(&value).map_err(|e| template_error(format!("tojson failed: {e}")))?,
        ))),
        "length" => match &value {
            Value::Array(items) => Ok(Some(Value::Number(items.len().into()))),
            Value::Object(map) => Ok(Some(Value::Number(map.len().into()))),
            Value::String(s) => Ok(Some(Value::Number(s.chars().count().into()))),
            other => Err(template_error(format!("'length' is not defined for {}", type_name(other)))),
        },
        "join" => {
            let separator = match filter.args.first() {
                Some(Literal::Str(s)) => s.clone(),
                Some(_) => return Err(template_error("'join' argument must be a string")),
                None => String::new(),
            };
            match &value {
                Value::Array(items) => {
                    let joined = items.iter().map(display_value).collect::<Vec<_>>().join(&separator);
                    Ok(Some(Value::String(joined)))
                }
                other => Err(template_error(format!("'join' is not defined for {}", type_name(other)))),
            }
        }
        other => Err(template_error(format!("unknown filter '{other}'"))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context<'a>(inputs: &'a Value, steps: &'a Value) -> TemplateContext<'a> {
        TemplateContext { inputs, steps }
    }

    #[test]
    fn resolves_simple_input_path_preserving_type() {
        let inputs = json!({"count": 3});
        let steps = json!({});
        let value = render_value("{{ inputs.count }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!(3));
    }

    #[test]
    fn resolves_step_output_array_index() {
        let inputs = json!({});
        let steps = json!({"fetch": {"status": "success", "output": {"items": ["a", "b"]}}});
        let value = render_value("{{ steps.fetch.output.items[1] }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!("b"));
    }

    #[test]
    fn missing_path_without_default_is_template_error() {
        let inputs = json!({});
        let steps = json!({});
        let error = render_value("{{ inputs.missing }}", &context(&inputs, &steps)).unwrap_err();
        assert_eq!(error.code, ErrorCode::TemplateError);
        assert!(!error.retryable);
    }

    #[test]
    fn default_filter_supplies_fallback() {
        let inputs = json!({});
        let steps = json!({});
        let value = render_value("{{ inputs.missing | default('none') }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!("none"));
    }

    #[test]
    fn length_filter_counts_array_items() {
        let inputs = json!({"items": [1, 2, 3]});
        let steps = json!({});
        let value = render_value("{{ inputs.items | length }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!(3));
    }

    #[test]
    fn join_filter_joins_array_with_separator() {
        let inputs = json!({"tags": ["a", "b", "c"]});
        let steps = json!({});
        let value = render_value("{{ inputs.tags | join(', ') }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!("a, b, c"));
    }

    #[test]
    fn tojson_filter_serializes_objects() {
        let inputs = json!({"obj": {"a": 1}});
        let steps = json!({});
        let value = render_value("{{ inputs.obj | tojson }}", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!("{\"a\":1}"));
    }

    #[test]
    fn embedded_expressions_render_as_text() {
        let inputs = json!({"name": "world"});
        let steps = json!({});
        let value = render_value("Hello, {{ inputs.name }}!", &context(&inputs, &steps)).unwrap();
        assert_eq!(value, json!("Hello, world!"));
    }

    #[test]
    fn render_tree_walks_nested_structures() {
        let inputs = json!({"url": "https://example.com"});
        let steps = json!({});
        let params = json!({"request": {"target": "{{ inputs.url }}", "retries": 3}});
        let rendered = render_tree(&params, &context(&inputs, &steps)).unwrap();
        assert_eq!(rendered["request"]["target"], json!("https://example.com"));
        assert_eq!(rendered["request"]["retries"], json!(3));
    }

    #[test]
    fn unknown_filter_is_template_error() {
        let inputs = json!({"x": 1});
        let steps = json!({});
        let error = render_value("{{ inputs.x | uppercase }}", &context(&inputs, &steps)).unwrap_err();
        assert_eq!(error.code, ErrorCode::TemplateError);
    }
}
