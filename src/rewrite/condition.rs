use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::path::PathExpr;

/// Condition operators over the JSON value selected by a rule condition's
/// `field` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    Nin,
    Like,
    Nlike,
    Contains,
    Ncontains,
    Between,
    Nbetween,
    Startswith,
    Endswith,
    Exists,
    Nexists,
    Isnull,
    Notnull,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "lt" => Self::Lt,
            "ge" => Self::Ge,
            "le" => Self::Le,
            "in" => Self::In,
            "nin" => Self::Nin,
            "like" => Self::Like,
            "nlike" => Self::Nlike,
            "contains" => Self::Contains,
            "ncontains" => Self::Ncontains,
            "between" => Self::Between,
            "nbetween" => Self::Nbetween,
            "startswith" => Self::Startswith,
            "endswith" => Self::Endswith,
            "exists" => Self::Exists,
            "nexists" => Self::Nexists,
            "isnull" => Self::Isnull,
            "notnull" => Self::Notnull,
            _ => return None,
        })
    }

    fn needs_value(&self) -> bool {
        !matches!(
            self,
            Self::Exists | Self::Nexists | Self::Isnull | Self::Notnull
        )
    }
}

/// One compiled rule condition. `like`/`nlike` patterns compile to anchored
/// regexes at registration time.
#[derive(Debug)]
pub struct Condition {
    field: PathExpr,
    op: Operator,
    value: Option<Value>,
    like: Option<Regex>,
}

impl Condition {
    pub fn compile(field: &str, operator: &str, value: Option<&Value>) -> Result<Self, String> {
        let op = Operator::parse(operator)
            .ok_or_else(|| format!("unknown condition operator '{}'", operator))?;
        let field = PathExpr::parse(field)?;

        if op.needs_value() && value.is_none() {
            return Err(format!(
                "condition on '{}' with operator '{}' requires a value",
                field, operator
            ));
        }

        match op {
            Operator::In | Operator::Nin => {
                if !matches!(value, Some(Value::Array(_))) {
                    return Err(format!(
                        "condition '{}' on '{}' requires an array value",
                        operator, field
                    ));
                }
            }
            Operator::Between | Operator::Nbetween => match value {
                Some(Value::Array(arr)) if arr.len() == 2 => {}
                _ => {
                    return Err(format!(
                        "condition '{}' on '{}' requires a two-element array",
                        operator, field
                    ))
                }
            },
            Operator::Like
            | Operator::Nlike
            | Operator::Startswith
            | Operator::Endswith => {
                if !matches!(value, Some(Value::String(_))) {
                    return Err(format!(
                        "condition '{}' on '{}' requires a string value",
                        operator, field
                    ));
                }
            }
            _ => {}
        }

        let like = match (op, value) {
            (Operator::Like | Operator::Nlike, Some(Value::String(pat))) => {
                Some(compile_like(pat)?)
            }
            _ => None,
        };

        Ok(Self {
            field,
            op,
            value: value.cloned(),
            like,
        })
    }

    /// Evaluate against the current request body. A path that does not
    /// resolve satisfies only `nexists`; every other operator is false on a
    /// missing field.
    pub fn eval(&self, root: &Value) -> bool {
        let selected = self.field.resolve(root);
        match self.op {
            Operator::Exists => selected.is_some(),
            Operator::Nexists => selected.is_none(),
            Operator::Isnull => matches!(selected, Some(Value::Null)),
            Operator::Notnull => matches!(selected, Some(v) if !v.is_null()),
            _ => {
                let Some(selected) = selected else {
                    return false;
                };
                let expected = self.value.as_ref();
                match self.op {
                    Operator::Eq => Some(selected) == expected,
                    Operator::Ne => Some(selected) != expected,
                    Operator::Gt => compare(selected, expected).map_or(false, |o| o.is_gt()),
                    Operator::Lt => compare(selected, expected).map_or(false, |o| o.is_lt()),
                    Operator::Ge => compare(selected, expected).map_or(false, |o| o.is_ge()),
                    Operator::Le => compare(selected, expected).map_or(false, |o| o.is_le()),
                    Operator::In => in_array(selected, expected),
                    Operator::Nin => !in_array(selected, expected),
                    Operator::Contains => contains(selected, expected),
                    Operator::Ncontains => !contains(selected, expected),
                    Operator::Between => between(selected, expected),
                    Operator::Nbetween => !between(selected, expected),
                    Operator::Startswith => with_strs(selected, expected, |s, e| s.starts_with(e)),
                    Operator::Endswith => with_strs(selected, expected, |s, e| s.ends_with(e)),
                    Operator::Like => self
                        .like
                        .as_ref()
                        .zip(selected.as_str())
                        .map_or(false, |(re, s)| re.is_match(s)),
                    Operator::Nlike => self
                        .like
                        .as_ref()
                        .zip(selected.as_str())
                        .map_or(false, |(re, s)| !re.is_match(s)),
                    _ => false,
                }
            }
        }
    }
}

/// SQL-style wildcard pattern: `%` matches any run, `_` any single char.
fn compile_like(pattern: &str) -> Result<Regex, String> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    RegexBuilder::new(&re)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| format!("invalid like pattern '{}': {}", pattern, e))
}

fn compare(selected: &Value, expected: Option<&Value>) -> Option<std::cmp::Ordering> {
    match (selected, expected?) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// `in`: the selected value is an element of the given array.
fn in_array(selected: &Value, expected: Option<&Value>) -> bool {
    matches!(expected, Some(Value::Array(arr)) if arr.contains(selected))
}

/// `contains`: the selected array/string/object contains the given value.
fn contains(selected: &Value, expected: Option<&Value>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    match selected {
        Value::Array(arr) => arr.contains(expected),
        Value::String(s) => expected.as_str().map_or(false, |sub| s.contains(sub)),
        Value::Object(map) => expected.as_str().map_or(false, |k| map.contains_key(k)),
        _ => false,
    }
}

/// Inclusive range test over a `[low, high]` pair.
fn between(selected: &Value, expected: Option<&Value>) -> bool {
    let Some(Value::Array(bounds)) = expected else {
        return false;
    };
    let (Some(low), Some(high)) = (bounds.first(), bounds.get(1)) else {
        return false;
    };
    let ge_low = compare(selected, Some(low)).map_or(false, |o| o.is_ge());
    let le_high = compare(selected, Some(high)).map_or(false, |o| o.is_le());
    ge_low && le_high
}

fn with_strs(selected: &Value, expected: Option<&Value>, f: fn(&str, &str) -> bool) -> bool {
    match (selected.as_str(), expected.and_then(Value::as_str)) {
        (Some(s), Some(e)) => f(s, e),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: &str, value: Value) -> Condition {
        Condition::compile(field, op, Some(&value)).unwrap()
    }

    fn cond_bare(field: &str, op: &str) -> Condition {
        Condition::compile(field, op, None).unwrap()
    }

    #[test]
    fn eq_ne() {
        let doc = json!({"model": "gpt-4", "n": 3});
        assert!(cond("model", "eq", json!("gpt-4")).eval(&doc));
        assert!(!cond("model", "eq", json!("gpt-3")).eval(&doc));
        assert!(cond("n", "ne", json!(4)).eval(&doc));
        // Missing fields satisfy nothing but nexists.
        assert!(!cond("missing", "ne", json!("x")).eval(&doc));
    }

    #[test]
    fn numeric_and_string_ordering() {
        let doc = json!({"t": 0.7, "name": "beta"});
        assert!(cond("t", "gt", json!(0.5)).eval(&doc));
        assert!(cond("t", "le", json!(0.7)).eval(&doc));
        assert!(!cond("t", "lt", json!(0.7)).eval(&doc));
        assert!(cond("name", "ge", json!("alpha")).eval(&doc));
        // Mixed types never order.
        assert!(!cond("name", "gt", json!(1)).eval(&doc));
    }

    #[test]
    fn in_vs_contains_direction() {
        let doc = json!({"model": "a", "tags": ["x", "y"], "text": "hello", "obj": {"k": 1}});
        assert!(cond("model", "in", json!(["a", "b"])).eval(&doc));
        assert!(!cond("model", "in", json!(["b"])).eval(&doc));
        assert!(cond("tags", "contains", json!("x")).eval(&doc));
        assert!(cond("text", "contains", json!("ell")).eval(&doc));
        assert!(cond("obj", "contains", json!("k")).eval(&doc));
        assert!(cond("model", "nin", json!(["b"])).eval(&doc));
        assert!(cond("tags", "ncontains", json!("z")).eval(&doc));
    }

    #[test]
    fn like_wildcards() {
        let doc = json!({"model": "gpt-4-turbo"});
        assert!(cond("model", "like", json!("gpt-%")).eval(&doc));
        assert!(cond("model", "like", json!("gpt-_-turbo")).eval(&doc));
        assert!(!cond("model", "like", json!("claude-%")).eval(&doc));
        assert!(cond("model", "nlike", json!("claude-%")).eval(&doc));
        // Metacharacters in the pattern are literal.
        let doc2 = json!({"v": "a.b"});
        assert!(cond("v", "like", json!("a.b")).eval(&doc2));
        assert!(!cond("v", "like", json!("a.c")).eval(&doc2));
    }

    #[test]
    fn between_is_inclusive() {
        let doc = json!({"n": 5});
        assert!(cond("n", "between", json!([5, 10])).eval(&doc));
        assert!(cond("n", "between", json!([1, 5])).eval(&doc));
        assert!(!cond("n", "between", json!([6, 10])).eval(&doc));
        assert!(cond("n", "nbetween", json!([6, 10])).eval(&doc));
    }

    #[test]
    fn starts_ends_with() {
        let doc = json!({"path": "/v1/chat"});
        assert!(cond("path", "startswith", json!("/v1")).eval(&doc));
        assert!(cond("path", "endswith", json!("chat")).eval(&doc));
        assert!(!cond("path", "startswith", json!("/v2")).eval(&doc));
    }

    #[test]
    fn existence_and_null() {
        let doc = json!({"a": null, "b": 1});
        assert!(cond_bare("a", "exists").eval(&doc));
        assert!(cond_bare("c", "nexists").eval(&doc));
        assert!(!cond_bare("a", "nexists").eval(&doc));
        assert!(cond_bare("a", "isnull").eval(&doc));
        assert!(cond_bare("b", "notnull").eval(&doc));
        assert!(!cond_bare("c", "isnull").eval(&doc));
        assert!(!cond_bare("c", "notnull").eval(&doc));
    }

    #[test]
    fn compile_validates_shapes() {
        assert!(Condition::compile("a", "eq", None).is_err());
        assert!(Condition::compile("a", "in", Some(&json!("x"))).is_err());
        assert!(Condition::compile("a", "between", Some(&json!([1]))).is_err());
        assert!(Condition::compile("a", "like", Some(&json!(3))).is_err());
        assert!(Condition::compile("a", "frobnicate", Some(&json!(1))).is_err());
        assert!(Condition::compile("a..b", "exists", None).is_err());
    }
}
