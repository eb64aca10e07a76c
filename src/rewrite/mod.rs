//! Request-body rewriting: ordered `set`/`remove` rules over JSON bodies,
//! gated by conditions, with `${{path}}` value templates evaluated against
//! the original body. Rules and paths compile at config validation time.

pub mod condition;
pub mod path;

use serde_json::Value;

use crate::config::types::{BodyRewriteSettings, RuleSettings};
use condition::Condition;
use path::PathExpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Set,
    Remove,
}

pub struct Rule {
    pub name: String,
    op: RuleOp,
    path: PathExpr,
    value: Option<ValueTemplate>,
    conditions: Vec<Condition>,
}

pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(settings: &BodyRewriteSettings) -> Result<Self, String> {
        let rules = settings
            .rules
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Apply the rule list to a JSON body. Returns `None` when nothing
    /// changed (body not parseable as JSON, or no rule matched) so the
    /// caller can forward the original bytes untouched.
    ///
    /// Conditions evaluate against the working document (the result of all
    /// prior rules); value templates evaluate against the original body.
    pub fn apply(&self, body: &[u8]) -> Option<Vec<u8>> {
        let original: Value = serde_json::from_slice(body).ok()?;
        let mut working = original.clone();
        let mut touched = false;

        for rule in &self.rules {
            if !rule.conditions.iter().all(|c| c.eval(&working)) {
                continue;
            }
            match rule.op {
                RuleOp::Set => {
                    if let Some(template) = &rule.value {
                        rule.path.set(&mut working, template.render(&original));
                        touched = true;
                    }
                }
                RuleOp::Remove => {
                    if rule.path.resolve(&working).is_some() {
                        rule.path.remove(&mut working);
                        touched = true;
                    }
                }
            }
        }

        if !touched {
            return None;
        }
        serde_json::to_vec(&working).ok()
    }
}

impl Rule {
    fn compile(settings: &RuleSettings) -> Result<Self, String> {
        let op = match settings.operation.as_str() {
            "set" => RuleOp::Set,
            "remove" => RuleOp::Remove,
            other => {
                return Err(format!(
                    "rule '{}': unknown operation '{}'",
                    settings.name, other
                ))
            }
        };
        let path = PathExpr::parse(&settings.path)
            .map_err(|e| format!("rule '{}': {}", settings.name, e))?;

        let value = match (&op, &settings.value) {
            (RuleOp::Set, Some(v)) => Some(
                ValueTemplate::compile(v)
                    .map_err(|e| format!("rule '{}': {}", settings.name, e))?,
            ),
            (RuleOp::Set, None) => {
                return Err(format!("rule '{}': 'set' requires a value", settings.name))
            }
            (RuleOp::Remove, _) => None,
        };

        let conditions = settings
            .conditions
            .iter()
            .map(|c| {
                Condition::compile(&c.field, &c.operator, c.value.as_ref())
                    .map_err(|e| format!("rule '{}': {}", settings.name, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: settings.name.clone(),
            op,
            path,
            value,
            conditions,
        })
    }
}

/// A rule value with `${{path}}` tokens compiled out.
///
/// A string that is exactly one token resolves to the referenced node with
/// its type preserved (missing → null). Tokens embedded in a larger string
/// render textually: missing → empty, containers → JSON, scalars → their
/// string form.
enum ValueTemplate {
    Literal(Value),
    Node(PathExpr),
    Text(Vec<Piece>),
    Array(Vec<ValueTemplate>),
    Object(Vec<(String, ValueTemplate)>),
}

enum Piece {
    Lit(String),
    Path(PathExpr),
}

impl ValueTemplate {
    fn compile(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Self::compile_string(s),
            Value::Array(items) => {
                if items.iter().all(|v| !value_has_token(v)) {
                    return Ok(Self::Literal(value.clone()));
                }
                Ok(Self::Array(
                    items
                        .iter()
                        .map(Self::compile)
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
            Value::Object(map) => {
                if map.values().all(|v| !value_has_token(v)) {
                    return Ok(Self::Literal(value.clone()));
                }
                Ok(Self::Object(
                    map.iter()
                        .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                        .collect::<Result<Vec<_>, String>>()?,
                ))
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn compile_string(s: &str) -> Result<Self, String> {
        let pieces = split_tokens(s)?;
        match pieces.as_slice() {
            [TokenPiece::Text(_)] | [] => Ok(Self::Literal(Value::String(s.to_string()))),
            [TokenPiece::Token(path)] => Ok(Self::Node(PathExpr::parse(path)?)),
            _ => {
                let compiled = pieces
                    .into_iter()
                    .map(|p| match p {
                        TokenPiece::Text(t) => Ok(Piece::Lit(t)),
                        TokenPiece::Token(path) => Ok(Piece::Path(PathExpr::parse(&path)?)),
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                Ok(Self::Text(compiled))
            }
        }
    }

    fn render(&self, original: &Value) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Node(path) => path.resolve(original).cloned().unwrap_or(Value::Null),
            Self::Text(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Lit(t) => out.push_str(t),
                        Piece::Path(path) => match path.resolve(original) {
                            None => {}
                            Some(Value::String(s)) => out.push_str(s),
                            Some(v) => {
                                out.push_str(&serde_json::to_string(v).unwrap_or_default())
                            }
                        },
                    }
                }
                Value::String(out)
            }
            Self::Array(items) => {
                Value::Array(items.iter().map(|t| t.render(original)).collect())
            }
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, t)| (k.clone(), t.render(original)))
                    .collect(),
            ),
        }
    }
}

enum TokenPiece {
    Text(String),
    Token(String),
}

/// Split a string on `${{…}}` tokens. Unterminated tokens are a compile
/// error.
fn split_tokens(s: &str) -> Result<Vec<TokenPiece>, String> {
    let mut pieces = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${{") {
        let Some(end) = rest[start..].find("}}") else {
            return Err(format!("unterminated ${{{{…}}}} token in '{}'", s));
        };
        if start > 0 {
            pieces.push(TokenPiece::Text(rest[..start].to_string()));
        }
        pieces.push(TokenPiece::Token(
            rest[start + 3..start + end].trim().to_string(),
        ));
        rest = &rest[start + end + 2..];
    }
    if !rest.is_empty() {
        pieces.push(TokenPiece::Text(rest.to_string()));
    }
    Ok(pieces)
}

fn value_has_token(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("${{"),
        Value::Array(items) => items.iter().any(value_has_token),
        Value::Object(map) => map.values().any(value_has_token),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ConditionSettings, RuleSettings};
    use serde_json::json;

    fn rule_set(rules: Vec<RuleSettings>) -> RuleSet {
        RuleSet::compile(&BodyRewriteSettings {
            enabled: true,
            rules,
        })
        .unwrap()
    }

    fn rule(
        name: &str,
        operation: &str,
        path: &str,
        value: Option<Value>,
        conditions: Vec<(&str, &str, Option<Value>)>,
    ) -> RuleSettings {
        RuleSettings {
            name: name.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
            value,
            conditions: conditions
                .into_iter()
                .map(|(field, operator, value)| ConditionSettings {
                    field: field.to_string(),
                    operator: operator.to_string(),
                    value,
                })
                .collect(),
        }
    }

    fn apply(rules: &RuleSet, body: Value) -> Option<Value> {
        rules
            .apply(&serde_json::to_vec(&body).unwrap())
            .map(|out| serde_json::from_slice(&out).unwrap())
    }

    #[test]
    fn default_model_rule() {
        let rules = rule_set(vec![rule(
            "default-model",
            "set",
            "model",
            Some(json!("gpt-4")),
            vec![("model", "nexists", None)],
        )]);

        let out = apply(&rules, json!({"messages": [1]})).unwrap();
        assert_eq!(out, json!({"messages": [1], "model": "gpt-4"}));

        // Present model is left alone — and nothing changed, so the body
        // passes through byte-identical.
        assert!(apply(&rules, json!({"model": "x", "messages": [1]})).is_none());
    }

    #[test]
    fn remove_disallowed_field() {
        let rules = rule_set(vec![rule(
            "strip-frequency-penalty",
            "remove",
            "frequency_penalty",
            None,
            vec![("frequency_penalty", "exists", None)],
        )]);

        let out = apply(&rules, json!({"frequency_penalty": 0.5, "model": "x"})).unwrap();
        assert_eq!(out, json!({"model": "x"}));
        assert!(apply(&rules, json!({"model": "x"})).is_none());
    }

    #[test]
    fn rules_apply_in_order_on_prior_results() {
        let rules = rule_set(vec![
            rule("set-a", "set", "a", Some(json!(1)), vec![]),
            // Sees the `a` the previous rule just wrote.
            rule(
                "set-b",
                "set",
                "b",
                Some(json!(2)),
                vec![("a", "eq", Some(json!(1)))],
            ),
        ]);
        let out = apply(&rules, json!({})).unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn standalone_token_preserves_type() {
        let rules = rule_set(vec![rule(
            "copy-temp",
            "set",
            "options.temperature",
            Some(json!("${{temperature}}")),
            vec![],
        )]);
        let out = apply(&rules, json!({"temperature": 0.7})).unwrap();
        assert_eq!(out["options"]["temperature"], json!(0.7));

        // Missing path resolves to null.
        let out = apply(&rules, json!({})).unwrap();
        assert_eq!(out["options"]["temperature"], Value::Null);
    }

    #[test]
    fn embedded_tokens_render_textually() {
        let rules = rule_set(vec![rule(
            "tag",
            "set",
            "tag",
            Some(json!("model=${{model}} opts=${{opts}} missing=${{nope}}")),
            vec![],
        )]);
        let out = apply(&rules, json!({"model": "m1", "opts": {"a": 1}})).unwrap();
        assert_eq!(out["tag"], json!(r#"model=m1 opts={"a":1} missing="#));
    }

    #[test]
    fn templates_read_the_original_body() {
        let rules = rule_set(vec![
            rule("wipe", "set", "model", Some(json!("replaced")), vec![]),
            // The template still sees the pre-rewrite model.
            rule("save", "set", "orig", Some(json!("${{model}}")), vec![]),
        ]);
        let out = apply(&rules, json!({"model": "m1"})).unwrap();
        assert_eq!(out["model"], json!("replaced"));
        assert_eq!(out["orig"], json!("m1"));
    }

    #[test]
    fn structured_value_with_embedded_token() {
        let rules = rule_set(vec![rule(
            "wrap",
            "set",
            "meta",
            Some(json!({"source": "proxy", "model": "${{model}}"})),
            vec![],
        )]);
        let out = apply(&rules, json!({"model": "m1"})).unwrap();
        assert_eq!(out["meta"], json!({"source": "proxy", "model": "m1"}));
    }

    #[test]
    fn non_json_body_passes_through() {
        let rules = rule_set(vec![rule("x", "set", "a", Some(json!(1)), vec![])]);
        assert!(rules.apply(b"not json at all").is_none());
    }

    #[test]
    fn empty_rule_set_never_touches_the_body() {
        let rules = rule_set(vec![]);
        assert!(rules.apply(br#"{"a":1}"#).is_none());
    }

    #[test]
    fn compile_rejects_bad_rules() {
        for bad in [
            rule("r", "upsert", "a", Some(json!(1)), vec![]),
            rule("r", "set", "a", None, vec![]),
            rule("r", "set", "a..b", Some(json!(1)), vec![]),
            rule("r", "set", "a", Some(json!("${{unterminated")), vec![]),
            rule("r", "set", "a", Some(json!(1)), vec![("f", "eq", None)]),
        ] {
            assert!(RuleSet::compile(&BodyRewriteSettings {
                enabled: true,
                rules: vec![bad],
            })
            .is_err());
        }
    }
}
