use serde_json::Value;
use std::fmt;

/// A compiled path expression over a JSON tree: dot-separated object keys
/// with `[n]` array indices, e.g. `messages[0].content` or `model`.
///
/// Expressions compile once at rule-registration time; invalid syntax is a
/// configuration error, never a runtime one.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl PathExpr {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("empty path expression".to_string());
        }
        let mut segments = Vec::new();
        let mut chars = raw.char_indices().peekable();

        loop {
            match chars.peek() {
                None => break,
                Some((_, '[')) => {
                    chars.next();
                    let mut digits = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        digits.push(c);
                    }
                    if !closed {
                        return Err(format!("path '{}': unclosed '['", raw));
                    }
                    let index: usize = digits
                        .parse()
                        .map_err(|_| format!("path '{}': non-numeric index '{}'", raw, digits))?;
                    segments.push(Segment::Index(index));
                    // After `]` the next character must be `.`, `[`, or end.
                    match chars.peek() {
                        None | Some((_, '[')) => {}
                        Some((_, '.')) => {
                            chars.next();
                            if chars.peek().is_none() {
                                return Err(format!("path '{}': trailing '.'", raw));
                            }
                        }
                        Some((_, c)) => {
                            return Err(format!("path '{}': unexpected '{}' after ']'", raw, c))
                        }
                    }
                }
                Some(_) => {
                    let mut key = String::new();
                    while let Some((_, c)) = chars.peek() {
                        if *c == '.' || *c == '[' {
                            break;
                        }
                        key.push(*c);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(format!("path '{}': empty segment", raw));
                    }
                    segments.push(Segment::Key(key));
                    if let Some((_, '.')) = chars.peek() {
                        chars.next();
                        if chars.peek().is_none() {
                            return Err(format!("path '{}': trailing '.'", raw));
                        }
                    }
                }
            }
        }

        if segments.is_empty() {
            return Err(format!("path '{}': no segments", raw));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Walk the tree; `None` when any segment fails to resolve.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut node = root;
        for seg in &self.segments {
            node = match seg {
                Segment::Key(k) => node.as_object()?.get(k)?,
                Segment::Index(i) => node.as_array()?.get(*i)?,
            };
        }
        Some(node)
    }

    /// Write `value` at this path, creating intermediate objects/arrays as
    /// needed. Nodes of the wrong container type along the way are replaced.
    pub fn set(&self, root: &mut Value, value: Value) {
        Self::set_inner(root, &self.segments, value);
    }

    fn set_inner(node: &mut Value, segments: &[Segment], value: Value) {
        let Some((head, rest)) = segments.split_first() else {
            *node = value;
            return;
        };
        match head {
            Segment::Key(k) => {
                if !node.is_object() {
                    *node = Value::Object(serde_json::Map::new());
                }
                if let Value::Object(map) = node {
                    let child = map.entry(k.clone()).or_insert(Value::Null);
                    Self::set_inner(child, rest, value);
                }
            }
            Segment::Index(i) => {
                if !node.is_array() {
                    *node = Value::Array(Vec::new());
                }
                if let Value::Array(arr) = node {
                    while arr.len() <= *i {
                        arr.push(Value::Null);
                    }
                    Self::set_inner(&mut arr[*i], rest, value);
                }
            }
        }
    }

    /// Delete the node at this path; no-op when it does not exist.
    pub fn remove(&self, root: &mut Value) {
        Self::remove_inner(root, &self.segments);
    }

    fn remove_inner(node: &mut Value, segments: &[Segment]) {
        match segments {
            [] => {}
            [last] => match (last, node) {
                (Segment::Key(k), Value::Object(map)) => {
                    map.remove(k);
                }
                (Segment::Index(i), Value::Array(arr)) => {
                    if *i < arr.len() {
                        arr.remove(*i);
                    }
                }
                _ => {}
            },
            [head, rest @ ..] => {
                let child = match (head, node) {
                    (Segment::Key(k), Value::Object(map)) => map.get_mut(k),
                    (Segment::Index(i), Value::Array(arr)) => arr.get_mut(*i),
                    _ => None,
                };
                if let Some(child) = child {
                    Self::remove_inner(child, rest);
                }
            }
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
