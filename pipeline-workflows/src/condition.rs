//! ABOUTME: Condition Engine — evaluates a boolean expression against
//! ABOUTME: either the Result Store/inputs/variables (a step's `condition`)
//! ABOUTME: or a bare `Value` (a `data_transform` `filter`'s predicate).

use crate::template::TemplateContext;
use pipeline_core::{PipelineError, Result, Value};

/// Evaluate a condition expression. Supported forms, highest precedence
/// first:
///
/// - `<expr> || <expr>` / `<expr> && <expr>` — boolean combination, either
///   side itself one of the forms below
/// - `!<path>` — negated truthiness (or negated comparison)
/// - `<path> <op> <literal>` where `<op>` is one of `==`, `!=`, `>=`, `<=`,
///   `>`, `<`
/// - `<path>` alone — bare truthiness (`Value::is_truthy`)
///
/// A referenced path that resolves to nothing (skipped step, unset input)
/// is treated as `Value::Null`, so a condition gating on a skipped
/// dependency evaluates to `false` rather than erroring out.
pub fn evaluate(expression: &str, ctx: &TemplateContext<'_>) -> Result<bool> {
    evaluate_or(expression, ctx)
}

/// Evaluate the same grammar against a bare `Value` instead of a Result
/// Store — used by `data_transform`'s `filter` operation, where each row is
/// a `Value::Map` and an unqualified path (or the empty path) addresses it
/// directly rather than a named step.
pub fn evaluate_value(expression: &str, value: &Value) -> Result<bool> {
    evaluate_or(expression, &ValueResolver(value))
}

/// Resolves a bare dotted path to a `Value`, against whatever backing store
/// a condition is being evaluated over.
trait PathResolver {
    fn resolve(&self, path: &str) -> Value;
}

impl PathResolver for TemplateContext<'_> {
    fn resolve(&self, path: &str) -> Value {
        crate::template::resolve_raw(path, self).unwrap_or(Value::Null)
    }
}

struct ValueResolver<'a>(&'a Value);

impl PathResolver for ValueResolver<'_> {
    fn resolve(&self, path: &str) -> Value {
        if path.is_empty() {
            return self.0.clone();
        }
        self.0.get_path(path).cloned().unwrap_or(Value::Null)
    }
}

fn evaluate_or<R: PathResolver>(expr: &str, r: &R) -> Result<bool> {
    let parts = split_top_level(expr, "||");
    if parts.len() > 1 {
        for part in parts {
            if evaluate_and(part.trim(), r)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    evaluate_and(expr, r)
}

fn evaluate_and<R: PathResolver>(expr: &str, r: &R) -> Result<bool> {
    let parts = split_top_level(expr, "&&");
    if parts.len() > 1 {
        for part in parts {
            if !evaluate_unary(part.trim(), r)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    evaluate_unary(expr, r)
}

fn evaluate_unary<R: PathResolver>(expr: &str, r: &R) -> Result<bool> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix('!') {
        return Ok(!evaluate_comparison(rest.trim(), r));
    }
    Ok(evaluate_comparison(expr, r))
}

fn evaluate_comparison<R: PathResolver>(expr: &str, r: &R) -> bool {
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((lhs, rhs)) = split_on_operator(expr, op) {
            let left = r.resolve(lhs.trim());
            let right = resolve_literal_or_path(rhs.trim(), r);
            return compare(op, &left, &right);
        }
    }
    r.resolve(expr).is_truthy()
}

/// Split `expr` on every top-level (outside quotes) occurrence of `op`.
/// Returns a single-element vec (the whole expression) if `op` never
/// appears at top level.
fn split_top_level<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    let bytes = expr.len();
    while i < bytes {
        let c = expr[i..].chars().next().unwrap();
        if c == '\'' && !in_double {
            in_single = !in_single;
        } else if c == '"' && !in_single {
            in_double = !in_double;
        } else if !in_single && !in_double && expr[i..].starts_with(op) {
            parts.push(&expr[start..i]);
            i += op.len();
            start = i;
            continue;
        }
        i += c.len_utf8();
    }
    parts.push(&expr[start..]);
    parts
}

/// Find the first top-level (outside quotes) occurrence of `op` in `expr`.
fn split_on_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < expr.len() {
        let c = expr[i..].chars().next().unwrap();
        if c == '\'' && !in_double {
            in_single = !in_single;
        } else if c == '"' && !in_single {
            in_double = !in_double;
        } else if !in_single && !in_double && expr[i..].starts_with(op) {
            return Some((&expr[..i], &expr[i + op.len()..]));
        }
        i += c.len_utf8();
    }
    None
}

/// The right-hand side of a comparison may be a quoted string literal, a
/// bare number/boolean literal, or another dotted path.
fn resolve_literal_or_path<R: PathResolver>(token: &str, r: &R) -> Value {
    if let Some(stripped) = token.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::String(stripped.to_string());
    }
    if let Some(stripped) = token.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Value::String(stripped.to_string());
    }
    if token == "true" {
        return Value::Bool(true);
    }
    if token == "false" {
        return Value::Bool(false);
    }
    if token == "null" {
        return Value::Null;
    }
    if let Ok(n) = token.parse::<f64>() {
        return Value::Number(n);
    }
    r.resolve(token)
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => left == right,
        "!=" => left != right,
        ">" | "<" | ">=" | "<=" => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                "<=" => l <= r,
                _ => unreachable!(),
            },
            _ => false,
        },
        _ => false,
    }
}

/// Map a Template Engine rendering failure-mode into a condition error for
/// callers that want a `PipelineError::Condition` instead of a silent
/// `false` (used when an author's condition string is outright malformed,
/// e.g. unbalanced quotes).
pub fn evaluate_or_err(expression: &str, ctx: &TemplateContext<'_>) -> Result<bool> {
    evaluate(expression, ctx).map_err(|err| match err {
        PipelineError::Condition { .. } => err,
        other => PipelineError::Condition {
            message: other.to_string(),
            expression: Some(expression.to_string()),
        },
    })
}
