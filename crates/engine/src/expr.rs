//! Condition expression language for IF nodes.
//!
//! Expressions are tokenized and parsed once when the DAG is compiled and
//! evaluated against a `{steps, inputs}` context at run time. Nothing is
//! ever executed dynamically.
//!
//! Grammar (precedence low → high):
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := comparison ( "&&" comparison )*
//! comparison := unary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) unary )?
//! unary      := "!" unary | primary
//! primary    := literal | reference | "(" or ")"
//! literal    := number | 'string' | "string" | true | false | null
//! reference  := "inputs" ( "." segment )* | "steps" "." id "." "outputs" ( "." segment )*
//! ```
//!
//! `===` and `!==` are accepted as aliases of `==` and `!=`. Comparisons do
//! not chain. Equality is strict JSON equality, except that numbers compare
//! by value. Ordering requires two numbers or two strings. Missing
//! references evaluate to `null`. `!`, `&&` and `||` use truthiness:
//! `null`, `false`, `0`, `""`, `[]` and `{}` are false.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use thiserror::Error;

use nodes::value::get_path;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at offset {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        pos: usize,
        expected: &'static str,
    },

    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unknown reference '{0}' (expected inputs.<field> or steps.<id>.outputs.<field>)")]
    InvalidReference(String),

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("expression has more than {0} tokens")]
    TooLong(usize),

    #[error("cannot compare {left} with {right} using '{op}'")]
    Incomparable {
        op: &'static str,
        left: String,
        right: String,
    },
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {n}"),
            Self::Str(s) => format!("string '{s}'"),
            Self::Ident(i) => format!("'{i}'"),
            Self::True => "'true'".into(),
            Self::False => "'false'".into(),
            Self::Null => "'null'".into(),
            Self::Op(op) => format!("'{}'", op.symbol()),
            Self::And => "'&&'".into(),
            Self::Or => "'||'".into(),
            Self::Not => "'!'".into(),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '-')
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);

    while let Some(&(pos, c)) = chars.get(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, pos));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, pos));
                i += 1;
            }
            '&' if peek(i + 1) == Some('&') => {
                tokens.push((Token::And, pos));
                i += 2;
            }
            '|' if peek(i + 1) == Some('|') => {
                tokens.push((Token::Or, pos));
                i += 2;
            }
            '=' if peek(i + 1) == Some('=') => {
                tokens.push((Token::Op(CompareOp::Eq), pos));
                i += if peek(i + 2) == Some('=') { 3 } else { 2 };
            }
            '!' if peek(i + 1) == Some('=') => {
                tokens.push((Token::Op(CompareOp::Ne), pos));
                i += if peek(i + 2) == Some('=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push((Token::Not, pos));
                i += 1;
            }
            '<' | '>' => {
                let or_equal = peek(i + 1) == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                tokens.push((Token::Op(op), pos));
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match peek(j) {
                        None => return Err(ExpressionError::UnterminatedString(pos)),
                        Some('\\') => {
                            let escaped = peek(j + 1).ok_or(ExpressionError::UnterminatedString(pos))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            j += 2;
                        }
                        Some(ch) if ch == quote => break,
                        Some(ch) => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push((Token::Str(text), pos));
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while peek(j).is_some_and(|n| n.is_ascii_digit() || n == '.') {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|&(_, c)| c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber(text.clone()))?;
                tokens.push((Token::Number(number), pos));
                i = j;
            }
            c if is_ident_start(c) => {
                let mut j = i + 1;
                while peek(j).is_some_and(is_ident_continue) {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|&(_, c)| c).collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push((token, pos));
                i = j;
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A data reference inside an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Input { path: String },
    Step { node_id: String, path: String },
}

impl Reference {
    fn parse(text: &str) -> Result<Self, ExpressionError> {
        let invalid = || ExpressionError::InvalidReference(text.to_owned());
        let (root, rest) = text.split_once('.').unwrap_or((text, ""));
        match root {
            "inputs" => Ok(Self::Input {
                path: rest.to_owned(),
            }),
            "steps" => {
                let (node_id, rest) = rest.split_once('.').ok_or_else(invalid)?;
                let path = match rest.split_once('.') {
                    Some(("outputs", path)) => path,
                    None if rest == "outputs" => "",
                    _ => return Err(invalid()),
                };
                if node_id.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::Step {
                    node_id: node_id.to_owned(),
                    path: path.to_owned(),
                })
            }
            _ => Err(invalid()),
        }
    }

    fn resolve(&self, ctx: &EvalContext<'_>) -> Value {
        let found = match self {
            Self::Input { path } => get_path(ctx.inputs, path),
            Self::Step { node_id, path } => ctx.steps.get(node_id).and_then(|out| get_path(out, path)),
        };
        found.cloned().unwrap_or(Value::Null)
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(Reference),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Values an expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Outputs of completed steps keyed by node id.
    pub steps: &'a HashMap<String, Value>,
    /// The run's trigger input.
    pub inputs: &'a Value,
}

/// Nesting limit for `!` and parentheses.
const MAX_DEPTH: usize = 32;
/// Bounds the size of the tree, which is evaluated and dropped recursively.
const MAX_TOKENS: usize = 512;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.comparison()?));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.unary()?;
        let Some(&Token::Op(op)) = self.peek() else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.unary()?;

        if let Some((Token::Op(_), pos)) = self.tokens.get(self.pos) {
            return Err(ExpressionError::UnexpectedToken {
                found: "chained comparison".into(),
                pos: *pos,
                expected: "'&&' or '||' between comparisons",
            });
        }
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        const EXPECTED: &str = "a value, reference or '('";
        let (token, pos) = self.next().ok_or(ExpressionError::UnexpectedEnd(EXPECTED))?;
        match token {
            Token::Number(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| ExpressionError::InvalidNumber(n.to_string()))?,
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Reference(Reference::parse(&name)?)),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((other, pos)) => Err(ExpressionError::UnexpectedToken {
                        found: other.describe(),
                        pos,
                        expected: "')'",
                    }),
                    None => Err(ExpressionError::UnexpectedEnd("')'")),
                }
            }
            other => Err(ExpressionError::UnexpectedToken {
                found: other.describe(),
                pos,
                expected: EXPECTED,
            }),
        }
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn order(op: CompareOp, left: &Value, right: &Value) -> Result<Ordering, ExpressionError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| ExpressionError::Incomparable {
        op: op.symbol(),
        left: left.to_string(),
        right: right.to_string(),
    })
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ExpressionError::TooLong(MAX_TOKENS));
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let expr = parser.or()?;
        if let Some((token, pos)) = parser.tokens.get(parser.pos) {
            return Err(ExpressionError::UnexpectedToken {
                found: token.describe(),
                pos: *pos,
                expected: "end of expression",
            });
        }
        Ok(expr)
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Value, ExpressionError> {
        Ok(match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(r) => r.resolve(ctx),
            Self::Not(inner) => Value::Bool(!truthy(&inner.evaluate(ctx)?)),
            Self::And(l, r) => Value::Bool(truthy(&l.evaluate(ctx)?) && truthy(&r.evaluate(ctx)?)),
            Self::Or(l, r) => Value::Bool(truthy(&l.evaluate(ctx)?) || truthy(&r.evaluate(ctx)?)),
            Self::Compare { op, left, right } => {
                let (l, r) = (left.evaluate(ctx)?, right.evaluate(ctx)?);
                Value::Bool(match op {
                    CompareOp::Eq => loosely_equal(&l, &r),
                    CompareOp::Ne => !loosely_equal(&l, &r),
                    CompareOp::Lt => order(*op, &l, &r)?.is_lt(),
                    CompareOp::Le => order(*op, &l, &r)?.is_le(),
                    CompareOp::Gt => order(*op, &l, &r)?.is_gt(),
                    CompareOp::Ge => order(*op, &l, &r)?.is_ge(),
                })
            }
        })
    }

    /// Evaluate and reduce the result to a boolean by truthiness.
    pub fn evaluate_bool(&self, ctx: &EvalContext<'_>) -> Result<bool, ExpressionError> {
        self.evaluate(ctx).map(|v| truthy(&v))
    }

    /// Node ids of every `steps.<id>` reference, sorted.
    pub fn referenced_steps(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_steps(&mut out);
        out
    }

    fn collect_steps(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Reference(Reference::Step { node_id, .. }) => {
                out.insert(node_id.clone());
            }
            Self::Literal(_) | Self::Reference(_) => {}
            Self::Not(inner) => inner.collect_steps(out),
            Self::Compare { left, right, .. } | Self::And(left, right) | Self::Or(left, right) => {
                left.collect_steps(out);
                right.collect_steps(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str) -> Result<bool, ExpressionError> {
        let steps = HashMap::from([
            ("fetch".to_string(), json!({ "status": 200, "body": { "items": [1, 2] }, "label": "ok" })),
            ("count-items".to_string(), json!({ "result": 0 })),
        ]);
        let inputs = json!({ "amount": 150, "tier": "gold", "flags": [] });
        Expr::parse(src)?.evaluate_bool(&EvalContext { steps: &steps, inputs: &inputs })
    }

    #[test]
    fn comparisons_against_steps_and_inputs() {
        assert!(eval("steps.fetch.outputs.status == 200").unwrap());
        assert!(eval("inputs.amount > 100 && inputs.tier == 'gold'").unwrap());
        assert!(eval("inputs.amount <= 150").unwrap());
        assert!(!eval("inputs.amount < -5").unwrap());
        assert!(eval(r#"steps.fetch.outputs.label != "fail""#).unwrap());
        assert!(eval("steps.fetch.outputs.body.items.1 === 2").unwrap());
        assert!(eval("steps.count-items.outputs.result == 0").unwrap());
    }

    #[test]
    fn precedence_and_grouping() {
        // && binds tighter than ||.
        assert!(eval("true || false && false").unwrap());
        assert!(!eval("(true || false) && false").unwrap());
        assert!(eval("!false && !(inputs.amount < 10)").unwrap());
        // ! binds tighter than ==.
        assert!(eval("!inputs.missing == true").unwrap());
    }

    #[test]
    fn truthiness_and_missing_references() {
        assert!(!eval("inputs.flags").unwrap());
        assert!(!eval("inputs.missing").unwrap());
        assert!(eval("inputs.missing == null").unwrap());
        assert!(eval("steps.fetch.outputs").unwrap());
    }

    #[test]
    fn ordering_mixed_types_is_an_error() {
        assert!(matches!(
            eval("inputs.tier > 3"),
            Err(ExpressionError::Incomparable { op: ">", .. })
        ));
    }

    #[test]
    fn malformed_expressions_are_rejected_at_parse_time() {
        assert_eq!(Expr::parse("   "), Err(ExpressionError::Empty));
        assert!(matches!(Expr::parse("inputs.a == 'x"), Err(ExpressionError::UnterminatedString(_))));
        assert!(matches!(Expr::parse("1 < 2 < 3"), Err(ExpressionError::UnexpectedToken { .. })));
        assert!(matches!(Expr::parse("(inputs.a"), Err(ExpressionError::UnexpectedEnd(_))));
        assert!(matches!(Expr::parse("process.exit == 1"), Err(ExpressionError::InvalidReference(_))));
        assert!(matches!(Expr::parse("steps.a.result == 1"), Err(ExpressionError::InvalidReference(_))));
        assert!(matches!(Expr::parse("inputs.a; drop"), Err(ExpressionError::UnexpectedChar { ch: ';', .. })));
    }

    #[test]
    fn nesting_and_length_are_bounded() {
        let nots = format!("{}true", "!".repeat(100));
        assert_eq!(Expr::parse(&nots), Err(ExpressionError::TooDeep(MAX_DEPTH)));

        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(Expr::parse(&parens), Err(ExpressionError::TooLong(_) | ExpressionError::TooDeep(_))));
        let parens = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(Expr::parse(&parens), Err(ExpressionError::TooDeep(MAX_DEPTH)));

        let chain = vec!["true"; 5_000].join(" && ");
        assert_eq!(Expr::parse(&chain), Err(ExpressionError::TooLong(MAX_TOKENS)));

        // Reasonable nesting still parses.
        assert!(eval("!(!(inputs.amount > 1 && (inputs.tier == 'gold' || !false)))").is_ok());
        let nested = format!("{}true{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(Expr::parse(&nested).is_ok());
    }

    #[test]
    fn referenced_steps_are_collected() {
        let expr = Expr::parse("steps.b.outputs.x > 1 || !(steps.a.outputs.y == inputs.z)").unwrap();
        let refs: Vec<String> = expr.referenced_steps().into_iter().collect();
        assert_eq!(refs, vec!["a", "b"]);
    }
}
