//! Variable store and `{{expr}}` resolution.
//!
//! Values are `serde_json::Value`, so step outputs, loop bindings, and
//! parsed JSON all live in one typed map. Expressions embedded in strings
//! follow a small grammar, precedence low to high:
//!
//! ```text
//! expr     := or
//! or       := and (" or " and)*
//! and      := eq (" and " eq)*
//! eq       := chain (("==" | "!=") chain)?
//! chain    := primary ("|" filter)*            filter := length | filter(cond)
//! primary  := literal | path
//! path     := ident ("." ident | "[" digits "]")*
//! ```
//!
//! Splitting is done by a hand-rolled scanner that respects quotes and
//! bracket depth, not by regex, so values containing ` or ` or `==` never
//! confuse the parser.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::WeftError;

/// Mutable name → value mapping threaded through a workflow execution.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: BTreeMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Replace every `{{EXPR}}` in `input` with the string form of its
    /// resolved value. The first unresolved variable fails the whole call.
    pub fn resolve_string(&self, input: &str) -> Result<String, WeftError> {
        let (resolved, error) = self.resolve_string_lenient(input);
        match error {
            Some(err) => Err(err),
            None => Ok(resolved),
        }
    }

    /// Like [`resolve_string`](Self::resolve_string), but unresolved
    /// expressions keep their literal `{{EXPR}}` text; the first error is
    /// returned alongside the best-effort output.
    pub fn resolve_string_lenient(&self, input: &str) -> (String, Option<WeftError>) {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        let mut first_error: Option<WeftError> = None;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let expr = after[..end].trim();
                    match self.evaluate_expr(expr) {
                        Ok(value) => out.push_str(&value_to_string(&value)),
                        Err(err) => {
                            out.push_str(&rest[start..start + 2 + end + 2]);
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // unterminated `{{` stays literal
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        (out, first_error)
    }

    /// Evaluate a step `if` condition: resolve the enclosing `{{…}}` first,
    /// then apply equality and boolean combinators over the resolved text.
    pub fn evaluate_condition(&self, input: &str) -> Result<bool, WeftError> {
        let text = if input.contains("{{") {
            self.resolve_string(input)?
        } else {
            input.to_string()
        };
        evaluate_condition_text(&text)
    }

    /// Evaluate a condition whose atoms are expressions against this store
    /// (transform `filter`, the `filter(cond)` pipe). Bare identifiers
    /// resolve as variables instead of literal text.
    pub fn evaluate_condition_expr(&self, condition: &str) -> Result<bool, WeftError> {
        for or_part in split_top_level(condition, " or ") {
            let mut all = true;
            for and_part in split_top_level(or_part, " and ") {
                let value = self.evaluate_expr(and_part.trim())?;
                if !value_truthy(&value) {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Evaluate one expression (the text between `{{` and `}}`).
    pub fn evaluate_expr(&self, expr: &str) -> Result<Value, WeftError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(WeftError::ExpressionMalformed {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        // or / and: sequential short-circuit splits
        let or_parts = split_top_level(expr, " or ");
        if or_parts.len() > 1 {
            for part in or_parts {
                if value_truthy(&self.evaluate_expr(part)?) {
                    return Ok(Value::Bool(true));
                }
            }
            return Ok(Value::Bool(false));
        }

        let and_parts = split_top_level(expr, " and ");
        if and_parts.len() > 1 {
            for part in and_parts {
                if !value_truthy(&self.evaluate_expr(part)?) {
                    return Ok(Value::Bool(false));
                }
            }
            return Ok(Value::Bool(true));
        }

        // equality / inequality
        if let Some((lhs, rhs, negate)) = split_equality(expr) {
            let left = self.evaluate_expr(lhs)?;
            let right = self.evaluate_expr(rhs)?;
            let equal = strip_quotes(&value_to_string(&left)) == strip_quotes(&value_to_string(&right));
            return Ok(Value::Bool(equal != negate));
        }

        // filter chain
        let chain = split_top_level(expr, "|");
        if chain.len() > 1 {
            let mut value = self.eval_primary(chain[0].trim(), expr)?;
            for filter in &chain[1..] {
                value = self.apply_filter(value, filter.trim(), expr)?;
            }
            return Ok(value);
        }

        self.eval_primary(expr, expr)
    }

    fn eval_primary(&self, token: &str, full: &str) -> Result<Value, WeftError> {
        let token = token.trim();

        // quoted literal
        if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
            || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
        {
            return Ok(Value::String(token[1..token.len() - 1].to_string()));
        }

        match token {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "null" => return Ok(Value::Null),
            _ => {}
        }

        if let Ok(int) = token.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        if let Ok(float) = token.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(float) {
                return Ok(Value::Number(n));
            }
        }

        self.eval_path(token, full)
    }

    fn eval_path(&self, path: &str, full: &str) -> Result<Value, WeftError> {
        let mut chars = path.char_indices().peekable();
        let root_end = path
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(path.len());
        let root = path[..root_end].trim();

        if root.is_empty() || !is_identifier(root) {
            return Err(WeftError::ExpressionMalformed {
                expr: full.to_string(),
                reason: format!("'{}' is not a valid identifier", path),
            });
        }

        let mut current = self
            .values
            .get(root)
            .cloned()
            .ok_or_else(|| WeftError::VariableNotFound {
                name: root.to_string(),
                expr: full.to_string(),
            })?;

        // skip past the root
        while let Some(&(i, _)) = chars.peek() {
            if i >= root_end {
                break;
            }
            chars.next();
        }

        let mut traversed = root.to_string();
        while let Some((_, c)) = chars.next() {
            match c {
                '.' => {
                    let mut field = String::new();
                    while let Some(&(_, nc)) = chars.peek() {
                        if nc == '.' || nc == '[' {
                            break;
                        }
                        field.push(nc);
                        chars.next();
                    }
                    let field = field.trim().to_string();
                    if field.is_empty() {
                        return Err(WeftError::ExpressionMalformed {
                            expr: full.to_string(),
                            reason: "trailing '.' in path".to_string(),
                        });
                    }
                    current = implicit_json(current);
                    traversed = format!("{}.{}", traversed, field);
                    current = match current.get(&field) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(WeftError::VariableNotFound {
                                name: traversed,
                                expr: full.to_string(),
                            })
                        }
                    };
                }
                '[' => {
                    let mut digits = String::new();
                    let mut closed = false;
                    for (_, nc) in chars.by_ref() {
                        if nc == ']' {
                            closed = true;
                            break;
                        }
                        digits.push(nc);
                    }
                    if !closed {
                        return Err(WeftError::ExpressionMalformed {
                            expr: full.to_string(),
                            reason: "unclosed '[' in path".to_string(),
                        });
                    }
                    let index: usize =
                        digits.trim().parse().map_err(|_| WeftError::ExpressionMalformed {
                            expr: full.to_string(),
                            reason: format!("'{}' is not a valid index", digits),
                        })?;
                    current = implicit_json(current);
                    traversed = format!("{}[{}]", traversed, index);
                    current = match current.get(index) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(WeftError::VariableNotFound {
                                name: traversed,
                                expr: full.to_string(),
                            })
                        }
                    };
                }
                other => {
                    return Err(WeftError::ExpressionMalformed {
                        expr: full.to_string(),
                        reason: format!("unexpected '{}' in path", other),
                    })
                }
            }
        }

        Ok(current)
    }

    fn apply_filter(&self, value: Value, filter: &str, full: &str) -> Result<Value, WeftError> {
        if filter == "length" {
            let value = implicit_json(value);
            let len = match &value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                _ => {
                    return Err(WeftError::ExpressionMalformed {
                        expr: full.to_string(),
                        reason: "length expects a sequence, mapping, or string".to_string(),
                    })
                }
            };
            return Ok(Value::Number(len.into()));
        }

        if let Some(args) = filter
            .strip_prefix("filter(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let value = implicit_json(value);
            let items = match value {
                Value::Array(items) => items,
                _ => {
                    return Err(WeftError::ExpressionMalformed {
                        expr: full.to_string(),
                        reason: "filter(...) expects a sequence".to_string(),
                    })
                }
            };
            let mut kept = Vec::new();
            for item in items {
                if self.element_matches(&item, args)? {
                    kept.push(item);
                }
            }
            return Ok(Value::Array(kept));
        }

        Err(WeftError::ExpressionMalformed {
            expr: full.to_string(),
            reason: format!("unknown filter '{}'", filter),
        })
    }

    /// Evaluate a filter condition against one element: the element's
    /// fields shadow the outer scope, and `item` binds the whole element.
    /// A reference to a field the element lacks makes it not match.
    pub fn element_matches(&self, element: &Value, condition: &str) -> Result<bool, WeftError> {
        let mut scope = self.clone();
        if let Value::Object(fields) = element {
            for (key, val) in fields {
                scope.set(key.clone(), val.clone());
            }
        }
        scope.set("item", element.clone());

        match scope.evaluate_condition_expr(condition) {
            Ok(result) => Ok(result),
            Err(WeftError::VariableNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Evaluate a condition over already-resolved text: equality, inequality,
/// and ` or `/` and ` combinators; anything else is a truthiness test.
pub fn evaluate_condition_text(text: &str) -> Result<bool, WeftError> {
    for or_part in split_top_level(text, " or ") {
        let mut all = true;
        for and_part in split_top_level(or_part, " and ") {
            if !condition_atom(and_part.trim()) {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn condition_atom(atom: &str) -> bool {
    if let Some((lhs, rhs, negate)) = split_equality(atom) {
        let equal = strip_quotes(lhs.trim()) == strip_quotes(rhs.trim());
        return equal != negate;
    }
    truthy(&strip_quotes(atom.trim()))
}

/// Spec stringification: null is empty, booleans lowercase, numbers in
/// decimal form, sequences and mappings as canonical JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// A non-empty, non-`"0"`, non-`"false"` string is truthy.
pub fn truthy(s: &str) -> bool {
    !s.is_empty() && s != "0" && s != "false"
}

fn value_truthy(value: &Value) -> bool {
    truthy(&strip_quotes(&value_to_string(value)))
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// If `value` is a string containing a JSON object or array, parse it.
fn implicit_json(value: Value) -> Value {
    if let Value::String(s) = &value {
        let trimmed = s.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                return parsed;
            }
        }
    }
    value
}

/// Split on `sep` occurrences that sit outside quotes, parentheses, and
/// brackets. Returns the whole input as a single part when `sep` never
/// appears at the top level.
fn split_top_level<'s>(input: &'s str, sep: &str) -> Vec<&'s str> {
    let bytes = input.as_bytes();
    let sep_bytes = sep.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'(' | b'[' if !in_single && !in_double => depth += 1,
            b')' | b']' if !in_single && !in_double => depth -= 1,
            _ => {}
        }
        if !in_single && !in_double && depth == 0 && bytes[i..].starts_with(sep_bytes) {
            parts.push(&input[start..i]);
            i += sep_bytes.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}

/// Find a top-level `==` or `!=`; returns (lhs, rhs, negate).
fn split_equality(input: &str) -> Option<(&str, &str, bool)> {
    let bytes = input.as_bytes();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;

    for i in 0..bytes.len().saturating_sub(1) {
        let c = bytes[i];
        match c {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'(' | b'[' if !in_single && !in_double => depth += 1,
            b')' | b']' if !in_single && !in_double => depth -= 1,
            _ => {}
        }
        if in_single || in_double || depth != 0 {
            continue;
        }
        if bytes[i] == b'=' && bytes[i + 1] == b'=' {
            return Some((&input[..i], &input[i + 2..], false));
        }
        if bytes[i] == b'!' && bytes[i + 1] == b'=' {
            return Some((&input[..i], &input[i + 2..], true));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VariableStore {
        let mut s = VariableStore::new();
        s.set("name", json!("world"));
        s.set("count", json!(3));
        s.set("flag", json!(true));
        s.set("nothing", Value::Null);
        s.set(
            "report",
            json!({"title": "Q3", "items": [{"id": 1, "status": "open"}, {"id": 2, "status": "done"}]}),
        );
        s.set(
            "encoded",
            json!("{\"inner\": {\"value\": 42}, \"list\": [\"a\", \"b\"]}"),
        );
        s
    }

    #[test]
    fn test_round_trip() {
        let s = store();
        assert_eq!(s.resolve_string("{{name}}").unwrap(), "world");
        assert_eq!(s.resolve_string("echo {{name}}").unwrap(), "echo world");
        assert_eq!(s.resolve_string("no vars here").unwrap(), "no vars here");
    }

    #[test]
    fn test_stringification_rules() {
        let s = store();
        assert_eq!(s.resolve_string("{{nothing}}").unwrap(), "");
        assert_eq!(s.resolve_string("{{flag}}").unwrap(), "true");
        assert_eq!(s.resolve_string("{{count}}").unwrap(), "3");
        assert_eq!(
            s.resolve_string("{{report.items}}").unwrap(),
            "[{\"id\":1,\"status\":\"open\"},{\"id\":2,\"status\":\"done\"}]"
        );
    }

    #[test]
    fn test_canonical_json_round_trips() {
        let s = store();
        let rendered = s.resolve_string("{{report}}").unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(&parsed, s.get("report").unwrap());
    }

    #[test]
    fn test_path_traversal() {
        let s = store();
        assert_eq!(s.resolve_string("{{report.title}}").unwrap(), "Q3");
        assert_eq!(s.resolve_string("{{report.items[0].id}}").unwrap(), "1");
        assert_eq!(
            s.resolve_string("{{report.items[1].status}}").unwrap(),
            "done"
        );
    }

    #[test]
    fn test_implicit_json_parse_of_strings() {
        let s = store();
        assert_eq!(s.resolve_string("{{encoded.inner.value}}").unwrap(), "42");
        assert_eq!(s.resolve_string("{{encoded.list[1]}}").unwrap(), "b");
    }

    #[test]
    fn test_unresolved_variable() {
        let s = store();
        let err = s.resolve_string("{{missing}}").unwrap_err();
        assert!(matches!(err, WeftError::VariableNotFound { ref name, .. } if name == "missing"));

        let (text, err) = s.resolve_string_lenient("a {{missing}} b {{name}}");
        assert_eq!(text, "a {{missing}} b world");
        assert!(err.is_some());
    }

    #[test]
    fn test_missing_field_and_index() {
        let s = store();
        assert!(matches!(
            s.resolve_string("{{report.absent}}"),
            Err(WeftError::VariableNotFound { ref name, .. }) if name == "report.absent"
        ));
        assert!(matches!(
            s.resolve_string("{{report.items[9]}}"),
            Err(WeftError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn test_length_filter() {
        let s = store();
        assert_eq!(s.resolve_string("{{report.items | length}}").unwrap(), "2");
        assert_eq!(s.resolve_string("{{name | length}}").unwrap(), "5");
        assert_eq!(s.resolve_string("{{report | length}}").unwrap(), "2");
        assert_eq!(s.resolve_string("{{encoded.list | length}}").unwrap(), "2");
    }

    #[test]
    fn test_filter_filter() {
        let s = store();
        assert_eq!(
            s.resolve_string("{{report.items | filter(status == 'open')}}")
                .unwrap(),
            "[{\"id\":1,\"status\":\"open\"}]"
        );
        assert_eq!(
            s.resolve_string("{{report.items | filter(status == 'open') | length}}")
                .unwrap(),
            "1"
        );
        // element without the referenced field simply does not match
        assert_eq!(
            s.resolve_string("{{report.items | filter(severity == 'high') | length}}")
                .unwrap(),
            "0"
        );
    }

    #[test]
    fn test_equality_in_expressions() {
        let s = store();
        assert_eq!(s.resolve_string("{{name == 'world'}}").unwrap(), "true");
        assert_eq!(s.resolve_string("{{name == \"mars\"}}").unwrap(), "false");
        assert_eq!(s.resolve_string("{{name != 'mars'}}").unwrap(), "true");
        assert_eq!(s.resolve_string("{{count == 3}}").unwrap(), "true");
    }

    #[test]
    fn test_boolean_combinators() {
        let s = store();
        assert_eq!(
            s.resolve_string("{{flag and name == 'world'}}").unwrap(),
            "true"
        );
        assert_eq!(
            s.resolve_string("{{nothing or name == 'world'}}").unwrap(),
            "true"
        );
        assert_eq!(
            s.resolve_string("{{nothing or name == 'mars'}}").unwrap(),
            "false"
        );
    }

    #[test]
    fn test_quoted_content_does_not_split() {
        let mut s = store();
        s.set("phrase", json!("this or that"));
        // the ` or ` inside the quoted literal must not split the expression
        assert_eq!(
            s.resolve_string("{{phrase == 'this or that'}}").unwrap(),
            "true"
        );
    }

    #[test]
    fn test_condition_evaluation() {
        let s = store();
        assert!(s.evaluate_condition("{{name}} == 'world'").unwrap());
        assert!(!s.evaluate_condition("{{name}} == 'mars'").unwrap());
        assert!(s.evaluate_condition("{{name}} != 'mars'").unwrap());
        assert!(s.evaluate_condition("{{flag}}").unwrap());
        assert!(!s.evaluate_condition("{{nothing}}").unwrap());
        assert!(s
            .evaluate_condition("{{nothing}} or {{count}} == 3")
            .unwrap());
        assert!(!s.evaluate_condition("false").unwrap());
        assert!(!s.evaluate_condition("0").unwrap());
        assert!(s.evaluate_condition("anything-else").unwrap());
    }

    #[test]
    fn test_condition_missing_variable_propagates() {
        let s = store();
        assert!(matches!(
            s.evaluate_condition("{{missing}} == 'x'"),
            Err(WeftError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        let s = store();
        assert!(matches!(
            s.resolve_string("{{report.items[oops]}}"),
            Err(WeftError::ExpressionMalformed { .. })
        ));
        assert!(matches!(
            s.resolve_string("{{name | shout}}"),
            Err(WeftError::ExpressionMalformed { .. })
        ));
        assert!(matches!(
            s.resolve_string("{{}}"),
            Err(WeftError::ExpressionMalformed { .. })
        ));
    }

    #[test]
    fn test_unterminated_braces_stay_literal() {
        let s = store();
        assert_eq!(s.resolve_string("tail {{name").unwrap(), "tail {{name");
    }

    #[test]
    fn test_literals() {
        let s = store();
        assert_eq!(s.resolve_string("{{'quoted'}}").unwrap(), "quoted");
        assert_eq!(s.resolve_string("{{42}}").unwrap(), "42");
        assert_eq!(s.resolve_string("{{true}}").unwrap(), "true");
        assert_eq!(s.resolve_string("{{null}}").unwrap(), "");
    }
}
