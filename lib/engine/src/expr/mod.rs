//! Step condition evaluation and `${{ … }}` interpolation.
//!
//! Expressions see a read-only context of run/job environment, the trigger
//! descriptor, and the outputs of steps that ran *before* the current one.
//! Resolution is forgiving by contract: an unknown path yields the empty
//! string rather than an error, so a reference to a step that never ran is
//! simply falsy. Only syntactically malformed expressions fail, and they
//! fail the step with `INVALID_IF_EXPRESSION`.

pub mod parse;

use crate::run::TriggerInfo;
use parse::{CallFunc, CompareOp, Expr, Operand};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

pub use parse::ParseError as ExprError;

/// Read-only context for expression evaluation.
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    /// Merged run + job environment.
    pub env: BTreeMap<String, String>,
    /// The run's trigger descriptor, if any.
    pub trigger: Option<TriggerInfo>,
    /// Outputs of preceding steps, keyed by the step's user-chosen id.
    pub steps: HashMap<String, BTreeMap<String, JsonValue>>,
    /// Matrix values, when the job is a matrix expansion.
    pub matrix: Option<BTreeMap<String, JsonValue>>,
}

impl ExprContext {
    /// Records a finished step's outputs under its user id.
    pub fn cache_step_outputs(
        &mut self,
        user_id: Option<&str>,
        outputs: &BTreeMap<String, JsonValue>,
    ) {
        if let Some(id) = user_id {
            self.steps.insert(id.to_string(), outputs.clone());
        }
    }
}

/// A resolved expression value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    /// Truthiness: null is false, numbers compare against zero, strings are
    /// truthy unless empty or the literal "false".
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    trimmed.parse().ok()
                }
            }
            Self::Bool(_) | Self::Null => None,
        }
    }

    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => Self::Num(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Self::Str(s.clone()),
            // Structured values stringify, matching coercion elsewhere.
            other => Self::Str(other.to_string()),
        }
    }
}

/// Coerces a value to its string form: null becomes the empty string,
/// booleans become `true`/`false`, integral numbers drop the fraction.
#[must_use]
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        Value::Str(s) => s.clone(),
    }
}

/// Resolves a raw value string: path resolution first, then numeric parse,
/// boolean literals, and finally the literal string with quotes stripped.
#[must_use]
pub fn resolve_value(raw: &str, ctx: &ExprContext) -> Value {
    let trimmed = raw.trim();
    if is_context_path(trimmed) {
        return resolve_path(trimmed, ctx);
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return Value::Num(n);
    }
    match trimmed {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(strip_quotes(trimmed).to_string()),
    }
}

fn is_context_path(raw: &str) -> bool {
    ["env.", "trigger.", "steps.", "matrix."]
        .iter()
        .any(|prefix| raw.starts_with(prefix))
        || raw == "trigger"
}

fn strip_quotes(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// Resolves a dotted context path. Unknown paths yield `Str("")`.
fn resolve_path(path: &str, ctx: &ExprContext) -> Value {
    let empty = Value::Str(String::new());

    if let Some(name) = path.strip_prefix("env.") {
        return ctx
            .env
            .get(name)
            .map(|v| Value::Str(v.clone()))
            .unwrap_or(empty);
    }

    if path == "trigger" || path.starts_with("trigger.") {
        let Some(trigger) = &ctx.trigger else {
            return empty;
        };
        return match path {
            "trigger" | "trigger.type" | "trigger.kind" => {
                match serde_json::to_value(trigger.kind) {
                    Ok(JsonValue::String(kind)) => Value::Str(kind),
                    _ => empty,
                }
            }
            "trigger.actor" => trigger
                .actor
                .as_ref()
                .map(|a| Value::Str(a.clone()))
                .unwrap_or(empty),
            "trigger.payload" => trigger
                .payload
                .as_ref()
                .map(Value::from_json)
                .unwrap_or(empty),
            _ => {
                let Some(rest) = path.strip_prefix("trigger.payload.") else {
                    return empty;
                };
                trigger
                    .payload
                    .as_ref()
                    .and_then(|payload| walk_json(payload, rest))
                    .map(|v| Value::from_json(&v))
                    .unwrap_or(empty)
            }
        };
    }

    if let Some(rest) = path.strip_prefix("steps.") {
        let Some((step_id, outputs_path)) = rest.split_once('.') else {
            return empty;
        };
        let Some(key_path) = outputs_path.strip_prefix("outputs") else {
            return empty;
        };
        let Some(outputs) = ctx.steps.get(step_id) else {
            return empty;
        };
        if key_path.is_empty() {
            // Whole outputs map referenced.
            return Value::Str(
                serde_json::to_string(outputs).unwrap_or_default(),
            );
        }
        let Some(key_path) = key_path.strip_prefix('.') else {
            return empty;
        };
        let (first, rest) = match key_path.split_once('.') {
            Some((first, rest)) => (first, Some(rest)),
            None => (key_path, None),
        };
        let Some(root) = outputs.get(first) else {
            return empty;
        };
        return match rest {
            Some(rest) => walk_json(root, rest)
                .map(|v| Value::from_json(&v))
                .unwrap_or(empty),
            None => Value::from_json(root),
        };
    }

    if let Some(name) = path.strip_prefix("matrix.") {
        return ctx
            .matrix
            .as_ref()
            .and_then(|matrix| matrix.get(name))
            .map(Value::from_json)
            .unwrap_or(empty);
    }

    empty
}

fn walk_json(root: &JsonValue, dotted: &str) -> Option<JsonValue> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn resolve_operand(operand: &Operand, ctx: &ExprContext) -> Value {
    match operand {
        Operand::Path(path) => resolve_path(path, ctx),
        Operand::Number(n) => Value::Num(*n),
        Operand::Str(s) => Value::Str(s.clone()),
        Operand::Bool(b) => Value::Bool(*b),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    // Numeric compare when both sides read as numbers, string coercion
    // otherwise (null -> "", bool -> "true"/"false").
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => coerce_to_string(left) == coerce_to_string(right),
    }
}

fn eval(expr: &Expr, ctx: &ExprContext) -> bool {
    match expr {
        Expr::Or(left, right) => eval(left, ctx) || eval(right, ctx),
        Expr::And(left, right) => eval(left, ctx) && eval(right, ctx),
        Expr::Not(inner) => !eval(inner, ctx),
        Expr::Compare { op, left, right } => {
            let equal = values_equal(&resolve_operand(left, ctx), &resolve_operand(right, ctx));
            match op {
                CompareOp::Eq => equal,
                CompareOp::Ne => !equal,
            }
        }
        Expr::Call {
            func,
            subject,
            needle,
        } => {
            let subject = coerce_to_string(&resolve_operand(subject, ctx));
            let needle = coerce_to_string(&resolve_operand(needle, ctx));
            match func {
                CallFunc::Contains => subject.contains(&needle),
                CallFunc::StartsWith => subject.starts_with(&needle),
                CallFunc::EndsWith => subject.ends_with(&needle),
            }
        }
        Expr::Operand(operand) => resolve_operand(operand, ctx).is_truthy(),
    }
}

/// Evaluates a step's `if` expression.
///
/// A surrounding `${{ … }}` wrapper is accepted and stripped.
///
/// # Errors
///
/// Returns an error when the expression cannot be parsed.
pub fn evaluate_condition(raw: &str, ctx: &ExprContext) -> Result<bool, ExprError> {
    let inner = strip_interpolation_wrapper(raw);
    let expr = parse::parse(inner)?;
    Ok(eval(&expr, ctx))
}

fn strip_interpolation_wrapper(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("${{")
        && let Some(inner) = rest.strip_suffix("}}")
    {
        return inner.trim();
    }
    trimmed
}

/// Replaces every `${{ … }}` occurrence in `template` with the coerced
/// string form of the resolved value.
///
/// Interpolation is best-effort by contract: an unterminated `${{` is
/// copied through verbatim.
#[must_use]
pub fn interpolate(template: &str, ctx: &ExprContext) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let value = resolve_value(after[..end].trim(), ctx);
                result.push_str(&coerce_to_string(&value));
                rest = &after[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Interpolates every string leaf in a step's `with` map.
#[must_use]
pub fn interpolate_params(
    with: &BTreeMap<String, JsonValue>,
    ctx: &ExprContext,
) -> BTreeMap<String, JsonValue> {
    with.iter()
        .map(|(key, value)| {
            let interpolated = match value {
                JsonValue::String(s) => JsonValue::String(interpolate(s, ctx)),
                other => other.clone(),
            };
            (key.clone(), interpolated)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::TriggerKind;

    fn context() -> ExprContext {
        let mut ctx = ExprContext::default();
        ctx.env.insert("BRANCH".to_string(), "release/1.2".to_string());
        ctx.env.insert("DEPLOY".to_string(), "true".to_string());
        ctx.trigger = Some(TriggerInfo {
            kind: TriggerKind::Push,
            actor: Some("alice".to_string()),
            payload: Some(serde_json::json!({ "ref": "refs/heads/main", "pr": { "number": 7 } })),
        });
        ctx.steps.insert(
            "s1".to_string(),
            [
                ("exitCode".to_string(), serde_json::json!(0)),
                ("artifact".to_string(), serde_json::json!("dist.tar")),
            ]
            .into_iter()
            .collect(),
        );
        ctx
    }

    #[test]
    fn comparison_against_step_outputs() {
        let ctx = context();
        assert!(evaluate_condition("steps.s1.outputs.exitCode == 0", &ctx).unwrap());
        assert!(!evaluate_condition("steps.s1.outputs.exitCode == 1", &ctx).unwrap());
        assert!(evaluate_condition("steps.s1.outputs.exitCode != 1", &ctx).unwrap());
    }

    #[test]
    fn wrapped_condition_is_unwrapped() {
        let ctx = context();
        assert!(evaluate_condition("${{ steps.s1.outputs.exitCode == 0 }}", &ctx).unwrap());
    }

    #[test]
    fn unknown_step_reference_is_falsy() {
        let ctx = context();
        assert!(!evaluate_condition("steps.ghost.outputs.exitCode", &ctx).unwrap());
        // Unknown path compares equal to the empty string.
        assert!(evaluate_condition("steps.ghost.outputs.x == ''", &ctx).unwrap());
    }

    #[test]
    fn logical_operators_and_parentheses() {
        let ctx = context();
        assert!(evaluate_condition("env.DEPLOY && steps.s1.outputs.exitCode == 0", &ctx).unwrap());
        assert!(evaluate_condition("env.MISSING || env.DEPLOY", &ctx).unwrap());
        assert!(!evaluate_condition("!(env.DEPLOY)", &ctx).unwrap());
        assert!(evaluate_condition("!env.MISSING", &ctx).unwrap());
        // && binds tighter than ||.
        assert!(evaluate_condition("env.DEPLOY || env.MISSING && env.MISSING", &ctx).unwrap());
    }

    #[test]
    fn string_predicates() {
        let ctx = context();
        assert!(evaluate_condition("contains(env.BRANCH, 'release')", &ctx).unwrap());
        assert!(evaluate_condition("startsWith(trigger.payload.ref, 'refs/heads/')", &ctx).unwrap());
        assert!(evaluate_condition("endsWith(steps.s1.outputs.artifact, '.tar')", &ctx).unwrap());
        assert!(!evaluate_condition("contains(env.BRANCH, 'hotfix')", &ctx).unwrap());
    }

    #[test]
    fn trigger_paths() {
        let ctx = context();
        assert!(evaluate_condition("trigger.type == 'push'", &ctx).unwrap());
        assert!(evaluate_condition("trigger.actor == 'alice'", &ctx).unwrap());
        assert!(evaluate_condition("trigger.payload.pr.number == 7", &ctx).unwrap());
    }

    #[test]
    fn numeric_and_string_equality_coercion() {
        let ctx = context();
        // Both sides numeric: numeric compare.
        assert!(evaluate_condition("'1.0' == 1", &ctx).unwrap());
        // Booleans coerce to strings.
        assert!(evaluate_condition("env.DEPLOY == true", &ctx).unwrap());
        // Null-ish (unknown path) coerces to "".
        assert!(evaluate_condition("env.MISSING == ''", &ctx).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let ctx = context();
        assert!(evaluate_condition("env.X ==", &ctx).is_err());
        assert!(evaluate_condition("${{ }}", &ctx).is_err());
        assert!(evaluate_condition("(env.X", &ctx).is_err());
    }

    #[test]
    fn interpolation_replaces_occurrences() {
        let ctx = context();
        assert_eq!(
            interpolate("deploy ${{ env.BRANCH }} (exit ${{ steps.s1.outputs.exitCode }})", &ctx),
            "deploy release/1.2 (exit 0)"
        );
        assert_eq!(interpolate("no placeholders", &ctx), "no placeholders");
        assert_eq!(interpolate("unknown: '${{ env.NOPE }}'", &ctx), "unknown: ''");
        // Unterminated wrapper copies through.
        assert_eq!(interpolate("${{ env.BRANCH", &ctx), "${{ env.BRANCH");
    }

    #[test]
    fn interpolation_of_literals() {
        let ctx = ExprContext::default();
        assert_eq!(interpolate("${{ 'quoted' }}", &ctx), "quoted");
        assert_eq!(interpolate("${{ 42 }}", &ctx), "42");
        assert_eq!(interpolate("${{ true }}", &ctx), "true");
    }

    #[test]
    fn interpolate_params_touches_only_strings() {
        let ctx = context();
        let with: BTreeMap<String, JsonValue> = [
            ("run".to_string(), serde_json::json!("echo ${{ env.BRANCH }}")),
            ("count".to_string(), serde_json::json!(3)),
        ]
        .into_iter()
        .collect();

        let result = interpolate_params(&with, &ctx);
        assert_eq!(result["run"], serde_json::json!("echo release/1.2"));
        assert_eq!(result["count"], serde_json::json!(3));
    }
}
