//! Condition evaluator for step `condition` guards.
//!
//! Grammar (no parentheses, `and` binds tighter than `or`):
//!
//! ```text
//! expr      := and_expr ( "or" and_expr )*
//! and_expr  := predicate ( "and" predicate )*
//! predicate := path op literal | path check
//! op        := == | != | > | >= | < | <= | contains | not_contains
//!            | in | not_in | starts_with | ends_with
//! check     := is_empty | is_not_empty | is_null | is_not_null
//! literal   := 'str' | "str" | number | true | false | null | none | JSON
//! ```
//!
//! Paths are resolved against [`ExecutionContext::condition_scope`]. Missing
//! paths read as `null`. Malformed expressions never raise at evaluation time:
//! they evaluate to `false` and are logged.

use serde_json::Value;
use thiserror::Error;

use super::context::ExecutionContext;
use super::variables::{lookup_path, value_to_string};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while parsing a condition expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("unexpected end of condition, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),

    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

// ---------------------------------------------------------------------------
// Parsed form
// ---------------------------------------------------------------------------

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    In,
    NotIn,
    StartsWith,
    EndsWith,
}

impl CompareOp {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            _ => return None,
        })
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            _ => return None,
        })
    }
}

/// Postfix unary checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryCheck {
    IsEmpty,
    IsNotEmpty,
    IsNull,
    IsNotNull,
}

impl UnaryCheck {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            "is_null" => Self::IsNull,
            "is_not_null" => Self::IsNotNull,
            _ => return None,
        })
    }
}

/// A single test against one dotted path.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        path: String,
        op: CompareOp,
        literal: Value,
    },
    Check {
        path: String,
        check: UnaryCheck,
    },
}

/// A parsed condition in disjunctive form: any group whose predicates all
/// hold makes the condition true.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    any_of: Vec<Vec<Predicate>>,
}

impl Condition {
    /// OR-groups of AND-ed predicates.
    pub fn groups(&self) -> &[Vec<Predicate>] {
        &self.any_of
    }

    /// Evaluate against a JSON scope.
    pub fn evaluate(&self, scope: &Value) -> bool {
        self.any_of
            .iter()
            .any(|group| group.iter().all(|p| p.evaluate(scope)))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Symbol(String),
    Str(String),
    Json(Value),
}

fn is_symbol_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>')
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let mut text = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < chars.len() {
                match chars[j] {
                    '\\' if j + 1 < chars.len() => {
                        text.push(chars[j + 1]);
                        j += 2;
                    }
                    ch if ch == c => {
                        closed = true;
                        j += 1;
                        break;
                    }
                    ch => {
                        text.push(ch);
                        j += 1;
                    }
                }
            }
            if !closed {
                return Err(ConditionError::InvalidLiteral(chars[i..].iter().collect()));
            }
            tokens.push(Token::Str(text));
            i = j;
        } else if c == '[' || c == '{' {
            let end = json_extent(&chars, i)
                .ok_or_else(|| ConditionError::InvalidLiteral(chars[i..].iter().collect()))?;
            let raw: String = chars[i..end].iter().collect();
            let value = serde_json::from_str(&raw)
                .map_err(|_| ConditionError::InvalidLiteral(raw.clone()))?;
            tokens.push(Token::Json(value));
            i = end;
        } else if is_symbol_char(c) {
            let start = i;
            while i < chars.len() && is_symbol_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Symbol(chars[start..i].iter().collect()));
        } else {
            let start = i;
            while i < chars.len()
                && !chars[i].is_whitespace()
                && !is_symbol_char(chars[i])
                && !matches!(chars[i], '\'' | '"' | '[' | '{')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        }
    }
    Ok(tokens)
}

/// End index (exclusive) of the bracketed JSON value starting at `start`.
fn json_extent(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &c) in chars[start..].iter().enumerate() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(mut self) -> Result<Condition, ConditionError> {
        if self.tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut any_of = vec![vec![self.predicate()?]];
        while let Some(token) = self.next() {
            match token {
                Token::Word(w) if w.eq_ignore_ascii_case("and") => {
                    let predicate = self.predicate()?;
                    if let Some(group) = any_of.last_mut() {
                        group.push(predicate);
                    }
                }
                Token::Word(w) if w.eq_ignore_ascii_case("or") => {
                    any_of.push(vec![self.predicate()?]);
                }
                other => return Err(ConditionError::UnexpectedToken(describe(&other))),
            }
        }
        Ok(Condition { any_of })
    }

    fn predicate(&mut self) -> Result<Predicate, ConditionError> {
        let path = match self.next() {
            Some(Token::Word(w)) => parse_path(w)?,
            Some(other) => return Err(ConditionError::UnexpectedToken(describe(&other))),
            None => return Err(ConditionError::UnexpectedEnd("a path")),
        };

        let op = match self.next() {
            Some(Token::Symbol(s)) => {
                CompareOp::from_symbol(&s).ok_or(ConditionError::UnknownOperator(s))?
            }
            Some(Token::Word(w)) => {
                if let Some(check) = UnaryCheck::from_word(&w) {
                    return Ok(Predicate::Check { path, check });
                }
                CompareOp::from_word(&w).ok_or(ConditionError::UnknownOperator(w))?
            }
            Some(other) => return Err(ConditionError::UnexpectedToken(describe(&other))),
            None => return Err(ConditionError::UnexpectedEnd("an operator")),
        };

        let literal = match self.next() {
            Some(token) => parse_literal(token)?,
            None => return Err(ConditionError::UnexpectedEnd("a literal")),
        };
        Ok(Predicate::Compare { path, op, literal })
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) | Token::Symbol(w) => w.clone(),
        Token::Str(s) => format!("'{s}'"),
        Token::Json(v) => v.to_string(),
    }
}

fn parse_path(word: String) -> Result<String, ConditionError> {
    let valid = !matches!(word.to_ascii_lowercase().as_str(), "and" | "or")
        && word.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(word)
    } else {
        Err(ConditionError::InvalidPath(word))
    }
}

fn parse_literal(token: Token) -> Result<Value, ConditionError> {
    match token {
        Token::Str(s) => Ok(Value::String(s)),
        Token::Json(v) => Ok(v),
        Token::Symbol(s) => Err(ConditionError::UnexpectedToken(s)),
        Token::Word(w) => match w.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" | "none" => Ok(Value::Null),
            _ => {
                if let Ok(n) = w.parse::<i64>() {
                    Ok(Value::from(n))
                } else if let Some(n) = w
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                {
                    Ok(Value::Number(n))
                } else {
                    Err(ConditionError::InvalidLiteral(w))
                }
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Predicate {
    fn evaluate(&self, scope: &Value) -> bool {
        match self {
            Self::Compare { path, op, literal } => compare(lookup(scope, path), *op, literal),
            Self::Check { path, check } => {
                let value = lookup(scope, path);
                match check {
                    UnaryCheck::IsEmpty => is_empty(value),
                    UnaryCheck::IsNotEmpty => !is_empty(value),
                    UnaryCheck::IsNull => value.is_null(),
                    UnaryCheck::IsNotNull => !value.is_null(),
                }
            }
        }
    }
}

fn lookup<'a>(scope: &'a Value, path: &str) -> &'a Value {
    let segments: Vec<&str> = path.split('.').collect();
    lookup_path(scope, &segments).unwrap_or(&Value::Null)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Equality with numbers compared by value (`1 == 1.0`).
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Null, _) | (_, Value::Null) => None,
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

fn contains(container: &Value, item: &Value) -> bool {
    match (container, item) {
        (Value::Null, _) => false,
        (Value::Array(items), _) => items.iter().any(|v| loosely_equal(v, item)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
        (other, Value::String(needle)) => value_to_string(other).contains(needle.as_str()),
        _ => false,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => loosely_equal(left, right),
        CompareOp::Ne => !loosely_equal(left, right),
        CompareOp::Gt => ordering(left, right) == Some(Greater),
        CompareOp::Ge => matches!(ordering(left, right), Some(Greater | Equal)),
        CompareOp::Lt => ordering(left, right) == Some(Less),
        CompareOp::Le => matches!(ordering(left, right), Some(Less | Equal)),
        CompareOp::Contains => contains(left, right),
        CompareOp::NotContains => !contains(left, right),
        CompareOp::In => contains(right, left),
        CompareOp::NotIn => !contains(right, left),
        CompareOp::StartsWith => {
            !left.is_null() && value_to_string(left).starts_with(&value_to_string(right))
        }
        CompareOp::EndsWith => {
            !left.is_null() && value_to_string(left).ends_with(&value_to_string(right))
        }
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Entry points used by the scheduler and the definition validator.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Parse an expression without evaluating it.
    pub fn parse(expression: &str) -> Result<Condition, ConditionError> {
        Parser {
            tokens: tokenize(expression)?,
            pos: 0,
        }
        .parse()
    }

    /// Evaluate against an explicit JSON scope. Malformed input is `false`.
    pub fn evaluate_scope(expression: &str, scope: &Value) -> bool {
        match Self::parse(expression) {
            Ok(condition) => condition.evaluate(scope),
            Err(err) => {
                tracing::warn!(condition = expression, error = %err, "malformed condition, treating as false");
                false
            }
        }
    }

    /// Evaluate against the current state of an execution.
    pub fn evaluate(expression: &str, ctx: &ExecutionContext) -> bool {
        match Self::parse(expression) {
            Ok(condition) => condition.evaluate(&ctx.condition_scope()),
            Err(err) => {
                tracing::warn!(
                    execution_id = %ctx.execution_id(),
                    condition = expression,
                    error = %err,
                    "malformed condition, treating as false"
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_types::workflow::{StepDefinition, StepStatus, UserContext, WorkflowDefinition};
    use uuid::Uuid;

    fn scope() -> Value {
        json!({
            "approval": {
                "status": "completed",
                "output": {"decision": "approved", "score": 7},
                "decision": "approved",
                "score": 7,
                "error": null
            },
            "fetch": {"items": [1, 2, 3], "tags": ["a", "b"], "body": "", "name": "report.pdf"},
            "trigger_data": {"source": "chat", "count": "12"}
        })
    }

    fn eval(expr: &str) -> bool {
        ConditionEvaluator::evaluate_scope(expr, &scope())
    }

    // -----------------------------------------------------------------------
    // Comparisons
    // -----------------------------------------------------------------------

    #[test]
    fn test_equality_on_output_and_merged_fields() {
        assert!(eval("approval.output.decision == 'approved'"));
        assert!(eval("approval.decision == \"approved\""));
        assert!(!eval("approval.output.decision == 'denied'"));
        assert!(eval("approval.output.decision != 'denied'"));
        assert!(eval("approval.status == 'completed'"));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("approval.output.score > 5"));
        assert!(eval("approval.output.score >= 7"));
        assert!(eval("approval.output.score == 7.0"));
        assert!(!eval("approval.output.score < 7"));
        assert!(eval("approval.output.score <= 7.5"));
        // numeric strings compare as numbers against numbers
        assert!(eval("trigger_data.count > 10"));
    }

    #[test]
    fn test_no_spaces_around_symbols() {
        assert!(eval("approval.output.score>5"));
        assert!(eval("approval.decision=='approved'"));
    }

    #[test]
    fn test_containment_operators() {
        assert!(eval("fetch.items contains 2"));
        assert!(eval("fetch.tags not_contains 'z'"));
        assert!(eval("fetch.name contains 'port'"));
        assert!(eval(r#"trigger_data.source in ["chat", "email"]"#));
        assert!(eval("trigger_data.source not_in [\"webhook\"]"));
        assert!(eval("fetch.name starts_with 'report'"));
        assert!(eval("fetch.name ends_with '.pdf'"));
        assert!(!eval("fetch.name ends_with '.doc'"));
    }

    #[test]
    fn test_unary_checks() {
        assert!(eval("fetch.body is_empty"));
        assert!(eval("fetch.items is_not_empty"));
        assert!(eval("approval.error is_null"));
        assert!(eval("fetch.missing is_null"));
        assert!(eval("approval.output is_not_null"));
    }

    #[test]
    fn test_missing_path_reads_as_null() {
        assert!(!eval("ghost.output.decision == 'approved'"));
        assert!(eval("ghost.output.decision == null"));
        assert!(!eval("ghost.count > 1"));
    }

    // -----------------------------------------------------------------------
    // Logic
    // -----------------------------------------------------------------------

    #[test]
    fn test_and_binds_tighter_than_or() {
        // false and false or true -> true
        assert!(eval(
            "approval.decision == 'denied' and fetch.body is_not_empty or fetch.items contains 3"
        ));
        // true or false and false -> true
        assert!(eval("approval.score == 7 or approval.score == 1 and fetch.body is_not_empty"));
        // false or (true and false) -> false
        assert!(!eval("approval.score == 1 or approval.score == 7 and fetch.body is_not_empty"));
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert!(eval("approval.score == 7 AND approval.decision == 'approved'"));
        assert!(eval("approval.score == 1 OR approval.decision == 'approved'"));
    }

    // -----------------------------------------------------------------------
    // Malformed input
    // -----------------------------------------------------------------------

    #[test]
    fn test_malformed_expressions_fail_to_parse() {
        for bad in [
            "",
            "   ",
            "a.output.ok ===",
            "a.output.ok = 1",
            "a.output.ok ==",
            "a.output.ok matches 'x'",
            "a.output.ok == unquoted",
            "a.output.ok == 'unterminated",
            "a..b == 1",
            "a == 1 and",
            "a == 1 b == 2",
            "== 1",
            "a == [1, 2",
        ] {
            assert!(ConditionEvaluator::parse(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn test_malformed_evaluates_false() {
        assert!(!eval("approval.decision === 'approved'"));
        assert!(!eval("approval.decision == approved"));
    }

    #[test]
    fn test_parse_exposes_groups() {
        let condition =
            ConditionEvaluator::parse("a.x == 1 and b.y is_null or c.z in [1, 2]").unwrap();
        assert_eq!(condition.groups().len(), 2);
        assert_eq!(condition.groups()[0].len(), 2);
        assert_eq!(
            condition.groups()[1][0],
            Predicate::Compare {
                path: "c.z".to_string(),
                op: CompareOp::In,
                literal: json!([1, 2]),
            }
        );
    }

    #[test]
    fn test_literal_forms() {
        let scope = json!({"s": {"t": true, "n": null, "f": 1.5, "o": {"k": 1}}});
        assert!(ConditionEvaluator::evaluate_scope("s.t == TRUE", &scope));
        assert!(ConditionEvaluator::evaluate_scope("s.n == none", &scope));
        assert!(ConditionEvaluator::evaluate_scope("s.f == 1.5", &scope));
        assert!(ConditionEvaluator::evaluate_scope("s.o == {\"k\": 1}", &scope));
        assert!(ConditionEvaluator::evaluate_scope("s.o contains 'k'", &scope));
    }

    // -----------------------------------------------------------------------
    // Against an execution context
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_against_context() {
        let def = WorkflowDefinition::new("c", vec![StepDefinition::new("approval", "noop")]);
        let mut ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(def),
            json!({"priority": "high"}),
            UserContext::default(),
        );
        ctx.set_step_output(
            "approval",
            json!({"decision": "denied"}).as_object().cloned().unwrap(),
        )
        .unwrap();
        ctx.record_state("approval", StepStatus::Completed, None);

        assert!(ConditionEvaluator::evaluate(
            "approval.output.decision == 'denied'",
            &ctx
        ));
        assert!(ConditionEvaluator::evaluate(
            "trigger_data.priority == 'high'",
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate("approval.output.decision ==", &ctx));
    }
}
