use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::graph::{BlockKind, ConditionOp, ConditionRule, ContentBlock, VarType, VariableDef};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex"));

/// A variable as the evaluator sees it. Values persist as text; the declared
/// type decides how the text is read back.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl VarValue {
    /// Read stored text back per the declared type. Text that does not parse
    /// as the declared type stays a string, which makes numeric comparisons
    /// on it false rather than an error.
    pub fn parse(raw: &str, var_type: VarType) -> VarValue {
        match var_type {
            VarType::String => VarValue::Str(raw.to_string()),
            VarType::Number => match raw.trim().parse::<f64>() {
                Ok(n) => VarValue::Num(n),
                Err(_) => VarValue::Str(raw.to_string()),
            },
            VarType::Boolean => match raw.trim() {
                "true" => VarValue::Bool(true),
                "false" => VarValue::Bool(false),
                _ => VarValue::Str(raw.to_string()),
            },
        }
    }

    pub fn from_json(value: &Value) -> Option<VarValue> {
        match value {
            Value::String(s) => Some(VarValue::Str(s.clone())),
            Value::Number(n) => n.as_f64().map(VarValue::Num),
            Value::Bool(b) => Some(VarValue::Bool(*b)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            VarValue::Str(s) => s.clone(),
            VarValue::Num(n) => n.to_string(),
            VarValue::Bool(b) => b.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            VarValue::Num(n) => Some(*n),
            VarValue::Str(s) => s.trim().parse().ok(),
            VarValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }
}

/// Per-user snapshot: declared defaults overlaid with stored values.
pub type VarSnapshot = HashMap<String, VarValue>;

/// Build a snapshot from variable declarations and the raw stored rows.
/// Stored values win over declared defaults; stored names that were never
/// declared are kept as strings.
pub fn snapshot(declared: &[VariableDef], stored: &HashMap<String, String>) -> VarSnapshot {
    let mut vars = VarSnapshot::new();
    for def in declared {
        if let Some(default) = def.default_value.as_ref().and_then(VarValue::from_json) {
            vars.insert(def.name.clone(), default);
        }
    }
    for (name, raw) in stored {
        let var_type = declared
            .iter()
            .find(|d| d.name == *name)
            .map(|d| d.var_type)
            .unwrap_or_default();
        vars.insert(name.clone(), VarValue::parse(raw, var_type));
    }
    vars
}

/// Replace every `{identifier}` placeholder with the variable's stringified
/// value. Placeholders with no matching variable stay verbatim. Total: never
/// fails, never drops text.
pub fn interpolate(text: &str, vars: &VarSnapshot) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.as_text(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Interpolate a content block for dispatch. Only text payloads carry
/// placeholders; media blocks pass through unchanged.
pub fn interpolate_block(block: &ContentBlock, vars: &VarSnapshot) -> ContentBlock {
    let mut block = block.clone();
    if block.kind == BlockKind::Text {
        if let Some(content) = &block.content {
            block.content = Some(interpolate(content, vars));
        }
    }
    block
}

fn rule_value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn rule_value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Evaluate a condition rule against the snapshot. Fail-open: a missing rule,
/// a blank variable name or an unknown operator all yield `true` so malformed
/// graphs still advance. A variable absent from the snapshot stringifies as
/// the empty string and never satisfies a numeric comparison.
pub fn evaluate_condition(rule: Option<&ConditionRule>, vars: &VarSnapshot) -> bool {
    let Some(rule) = rule else { return true };
    if rule.variable.is_empty() {
        return true;
    }

    let var = vars.get(&rule.variable);
    let var_text = var.map(VarValue::as_text).unwrap_or_default();

    match rule.operator {
        ConditionOp::Equals => var_text == rule_value_text(&rule.value),
        ConditionOp::NotEquals => var_text != rule_value_text(&rule.value),
        ConditionOp::Greater => match (var.and_then(VarValue::as_number), rule_value_number(&rule.value)) {
            (Some(left), Some(right)) => left > right,
            _ => false,
        },
        ConditionOp::Less => match (var.and_then(VarValue::as_number), rule_value_number(&rule.value)) {
            (Some(left), Some(right)) => left < right,
            _ => false,
        },
        ConditionOp::Contains => var_text.contains(&rule_value_text(&rule.value)),
        ConditionOp::Unknown => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, VarValue)]) -> VarSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn rule(variable: &str, operator: ConditionOp, value: Value) -> ConditionRule {
        ConditionRule {
            variable: variable.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn test_interpolate_replaces_and_preserves() {
        let vars = vars(&[("name", VarValue::Str("A".into()))]);
        assert_eq!(
            interpolate("Hi {name}, balance {bal}", &vars),
            "Hi A, balance {bal}"
        );
    }

    #[test]
    fn test_interpolate_number_formatting() {
        let vars = vars(&[("age", VarValue::Num(20.0)), ("pi", VarValue::Num(3.5))]);
        assert_eq!(interpolate("{age}/{pi}", &vars), "20/3.5");
    }

    #[test]
    fn test_interpolate_ignores_non_word_placeholders() {
        let vars = vars(&[("a b", VarValue::Str("x".into()))]);
        assert_eq!(interpolate("{a b} {}", &vars), "{a b} {}");
    }

    #[test]
    fn test_condition_fail_open() {
        let empty = VarSnapshot::new();
        assert!(evaluate_condition(None, &empty));
        assert!(evaluate_condition(
            Some(&rule("", ConditionOp::Equals, json!("x"))),
            &empty
        ));
        assert!(evaluate_condition(
            Some(&rule("x", ConditionOp::Unknown, json!("y"))),
            &empty
        ));
    }

    #[test]
    fn test_condition_equals_stringifies() {
        let vars = vars(&[("age", VarValue::Num(18.0))]);
        assert!(evaluate_condition(
            Some(&rule("age", ConditionOp::Equals, json!("18"))),
            &vars
        ));
        assert!(evaluate_condition(
            Some(&rule("age", ConditionOp::NotEquals, json!("19"))),
            &vars
        ));
        // missing variable compares as the empty string
        assert!(evaluate_condition(
            Some(&rule("missing", ConditionOp::Equals, json!(""))),
            &vars
        ));
    }

    #[test]
    fn test_condition_numeric_comparisons() {
        let vars = vars(&[("age", VarValue::Num(20.0))]);
        assert!(evaluate_condition(
            Some(&rule("age", ConditionOp::Greater, json!("18"))),
            &vars
        ));
        assert!(!evaluate_condition(
            Some(&rule("age", ConditionOp::Less, json!("18"))),
            &vars
        ));

        // non-numeric text never satisfies either direction
        let vars = self::vars(&[("age", VarValue::Str("abc".into()))]);
        assert!(!evaluate_condition(
            Some(&rule("age", ConditionOp::Greater, json!("18"))),
            &vars
        ));
        assert!(!evaluate_condition(
            Some(&rule("age", ConditionOp::Less, json!("18"))),
            &vars
        ));
    }

    #[test]
    fn test_condition_numeric_string_coerces() {
        let vars = vars(&[("age", VarValue::Str("20".into()))]);
        assert!(evaluate_condition(
            Some(&rule("age", ConditionOp::Greater, json!(18))),
            &vars
        ));
    }

    #[test]
    fn test_condition_contains() {
        let vars = vars(&[("plan", VarValue::Str("pro-yearly".into()))]);
        assert!(evaluate_condition(
            Some(&rule("plan", ConditionOp::Contains, json!("pro"))),
            &vars
        ));
        assert!(!evaluate_condition(
            Some(&rule("plan", ConditionOp::Contains, json!("free"))),
            &vars
        ));
    }

    #[test]
    fn test_snapshot_overlay() {
        let declared = vec![
            VariableDef {
                name: "name".into(),
                var_type: VarType::String,
                default_value: Some(json!("guest")),
            },
            VariableDef {
                name: "age".into(),
                var_type: VarType::Number,
                default_value: None,
            },
        ];
        let mut stored = HashMap::new();
        stored.insert("age".to_string(), "20".to_string());
        stored.insert("extra".to_string(), "hi".to_string());

        let snap = snapshot(&declared, &stored);
        assert_eq!(snap.get("name"), Some(&VarValue::Str("guest".into())));
        assert_eq!(snap.get("age"), Some(&VarValue::Num(20.0)));
        assert_eq!(snap.get("extra"), Some(&VarValue::Str("hi".into())));
    }

    #[test]
    fn test_snapshot_keeps_unparseable_number_as_text() {
        let declared = vec![VariableDef {
            name: "age".into(),
            var_type: VarType::Number,
            default_value: None,
        }];
        let mut stored = HashMap::new();
        stored.insert("age".to_string(), "abc".to_string());

        let snap = snapshot(&declared, &stored);
        assert_eq!(snap.get("age"), Some(&VarValue::Str("abc".into())));
    }
}
