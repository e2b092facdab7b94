//! Condition expression evaluation for `when`, `if`, and frontmatter
//! `condition` fields.
//!
//! Grammar: `${var}` references (dotted paths allowed), string/number/
//! boolean literals, comparisons, `&&`/`||`/`!`, parentheses, and the
//! `${var.exists}` existence test. Undefined variables evaluate as null,
//! which is falsy.

use serde_json::Value as JsonValue;

use super::context::VariableEnvironment;

/// Evaluate an expression against the variable environment.
pub fn evaluate(input: &str, env: &VariableEnvironment) -> anyhow::Result<bool> {
    let mut parser = Parser::new(input);
    let expr = parser.expression(0)?;
    parser.expect_end()?;
    Ok(expr.eval(env)?.truthy())
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl Value {
    fn of(json: &JsonValue) -> Self {
        match json {
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Null => Value::Null,
            other => Value::String(other.to_string()),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty() && s != "false" && s != "0",
            Value::Null => false,
        }
    }

    /// Numeric view, used when the other side of a comparison is a
    /// number.
    fn coerced_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Left/right binding powers for precedence climbing: comparisons
    /// bind tighter than `&&`, which binds tighter than `||`.
    fn binding(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 2),
            BinOp::And => (3, 4),
            _ => (5, 6),
        }
    }
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Lookup(String),
    Exists(String),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn eval(&self, env: &VariableEnvironment) -> anyhow::Result<Value> {
        Ok(match self {
            Expr::Literal(value) => value.clone(),
            Expr::Lookup(path) => env
                .lookup(path)
                .map(|v| Value::of(&v))
                .unwrap_or(Value::Null),
            Expr::Exists(path) => Value::Bool(env.exists(path)),
            Expr::Not(inner) => Value::Bool(!inner.eval(env)?.truthy()),
            Expr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
            } => Value::Bool(lhs.eval(env)?.truthy() && rhs.eval(env)?.truthy()),
            Expr::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
            } => Value::Bool(lhs.eval(env)?.truthy() || rhs.eval(env)?.truthy()),
            Expr::Binary { op, lhs, rhs } => {
                Value::Bool(compare(*op, &lhs.eval(env)?, &rhs.eval(env)?)?)
            }
        })
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> anyhow::Result<bool> {
    // A string next to a number compares numerically when it parses.
    let numeric = match (lhs, rhs) {
        (Value::Number(l), r) => r.coerced_number().map(|r| (*l, r)),
        (l, Value::Number(r)) => l.coerced_number().map(|l| (l, *r)),
        _ => None,
    };
    if let Some((l, r)) = numeric {
        return Ok(match op {
            BinOp::Eq => l == r,
            BinOp::Ne => l != r,
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Gt => l > r,
            BinOp::Ge => l >= r,
            BinOp::And | BinOp::Or => unreachable!("logical ops evaluate through truthiness"),
        });
    }

    match op {
        BinOp::Eq => Ok(lhs == rhs),
        BinOp::Ne => Ok(lhs != rhs),
        _ => {
            let (Value::String(l), Value::String(r)) = (lhs, rhs) else {
                anyhow::bail!("cannot order {lhs:?} and {rhs:?}");
            };
            Ok(match op {
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Op(BinOp),
    Bang,
    LParen,
    RParen,
    End,
}

/// Single-pass parser. Tokens are scanned lazily from a byte cursor
/// with one token of lookahead; binary operators are folded by
/// precedence climbing.
struct Parser<'a> {
    src: &'a str,
    pos: usize,
    lookahead: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            lookahead: None,
        }
    }

    fn expression(&mut self, min_power: u8) -> anyhow::Result<Expr> {
        let mut lhs = self.atom()?;
        while let Token::Op(op) = self.peek()? {
            let op = *op;
            let (left, right) = op.binding();
            if left < min_power {
                break;
            }
            self.bump()?;
            let rhs = self.expression(right)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> anyhow::Result<Expr> {
        Ok(match self.bump()? {
            Token::Bang => Expr::Not(Box::new(self.atom()?)),
            Token::LParen => {
                let inner = self.expression(0)?;
                match self.bump()? {
                    Token::RParen => inner,
                    other => anyhow::bail!("expected `)`, found {other:?}"),
                }
            }
            Token::Var(path) => match path.strip_suffix(".exists") {
                Some(base) => Expr::Exists(base.to_string()),
                None => Expr::Lookup(path),
            },
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Num(n) => Expr::Literal(Value::Number(n)),
            Token::Bool(b) => Expr::Literal(Value::Bool(b)),
            Token::Op(op) => anyhow::bail!("expression starts with operator {op:?}"),
            Token::RParen => anyhow::bail!("unmatched `)`"),
            Token::End => anyhow::bail!("expression ended early"),
        })
    }

    fn expect_end(&mut self) -> anyhow::Result<()> {
        match self.bump()? {
            Token::End => Ok(()),
            other => anyhow::bail!("unexpected {other:?} after expression"),
        }
    }

    fn peek(&mut self) -> anyhow::Result<&Token> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scan()?);
        }
        Ok(self.lookahead.as_ref().expect("lookahead just filled"))
    }

    fn bump(&mut self) -> anyhow::Result<Token> {
        match self.lookahead.take() {
            Some(token) => Ok(token),
            None => self.scan(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn scan(&mut self) -> anyhow::Result<Token> {
        while let Some(c) = self.rest().chars().next() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            return Ok(Token::End);
        };

        // Two-character operators first, then the single characters
        // they would otherwise shadow.
        for (symbol, op) in [
            ("==", BinOp::Eq),
            ("!=", BinOp::Ne),
            ("<=", BinOp::Le),
            (">=", BinOp::Ge),
            ("&&", BinOp::And),
            ("||", BinOp::Or),
        ] {
            if rest.starts_with(symbol) {
                self.pos += symbol.len();
                return Ok(Token::Op(op));
            }
        }

        match first {
            '<' => {
                self.pos += 1;
                Ok(Token::Op(BinOp::Lt))
            }
            '>' => {
                self.pos += 1;
                Ok(Token::Op(BinOp::Gt))
            }
            '(' => {
                self.pos += 1;
                Ok(Token::LParen)
            }
            ')' => {
                self.pos += 1;
                Ok(Token::RParen)
            }
            '!' => {
                self.pos += 1;
                Ok(Token::Bang)
            }
            '$' => {
                let body = rest.strip_prefix("${").ok_or_else(|| {
                    anyhow::anyhow!("expected `${{` at byte {}", self.pos)
                })?;
                let close = body
                    .find('}')
                    .ok_or_else(|| anyhow::anyhow!("unclosed `${{` at byte {}", self.pos))?;
                self.pos += 2 + close + 1;
                Ok(Token::Var(body[..close].to_string()))
            }
            '\'' | '"' => {
                let body = &rest[1..];
                let close = body.find(first).ok_or_else(|| {
                    anyhow::anyhow!("unterminated string at byte {}", self.pos)
                })?;
                self.pos += 1 + close + 1;
                Ok(Token::Str(body[..close].to_string()))
            }
            c if c.is_ascii_digit() || c == '-' => {
                let len = rest
                    .char_indices()
                    .skip(1)
                    .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                let text = &rest[..len];
                let number: f64 = text.parse().map_err(|_| {
                    anyhow::anyhow!("invalid number `{text}` at byte {}", self.pos)
                })?;
                self.pos += len;
                Ok(Token::Num(number))
            }
            c if c.is_ascii_alphabetic() => {
                let len = rest
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(rest.len());
                let word = &rest[..len];
                self.pos += len;
                match word {
                    "true" => Ok(Token::Bool(true)),
                    "false" => Ok(Token::Bool(false)),
                    other => anyhow::bail!(
                        "unknown word `{other}` (variables are written ${{name}})"
                    ),
                }
            }
            other => anyhow::bail!("unexpected character `{other}` at byte {}", self.pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(vars: serde_json::Value) -> VariableEnvironment {
        let serde_json::Value::Object(map) = vars else {
            panic!("vars must be an object")
        };
        VariableEnvironment::new("test", None, map)
    }

    #[test]
    fn truthiness_of_bare_variable() {
        let e = env(json!({"flag": true, "empty": "", "zero": 0}));
        assert!(evaluate("${flag}", &e).unwrap());
        assert!(!evaluate("${empty}", &e).unwrap());
        assert!(!evaluate("${zero}", &e).unwrap());
        assert!(!evaluate("${missing}", &e).unwrap());
    }

    #[test]
    fn string_equality() {
        let e = env(json!({"env": "production"}));
        assert!(evaluate("${env} == 'production'", &e).unwrap());
        assert!(!evaluate("${env} != \"production\"", &e).unwrap());
    }

    #[test]
    fn numeric_comparison_with_coercion() {
        let e = env(json!({"score": "85"}));
        assert!(evaluate("${score} >= 80", &e).unwrap());
        assert!(!evaluate("${score} < 80", &e).unwrap());
        assert!(evaluate("${score} == 85", &e).unwrap());
    }

    #[test]
    fn non_numeric_string_never_equals_a_number() {
        let e = env(json!({"label": "beta"}));
        assert!(!evaluate("${label} == 3", &e).unwrap());
        assert!(evaluate("${label} != 3", &e).unwrap());
        assert!(evaluate("${label} > 2", &e).is_err());
    }

    #[test]
    fn logical_operators_short_circuit() {
        let e = env(json!({"a": true, "b": false}));
        assert!(!evaluate("${a} && ${b}", &e).unwrap());
        assert!(evaluate("${a} || ${b}", &e).unwrap());
        assert!(evaluate("!(${b})", &e).unwrap());
    }

    #[test]
    fn precedence_comparison_over_and_over_or() {
        let e = env(json!({"n": 5, "flag": false}));
        // Parses as (${n} > 1 && ${flag}) || ${n} == 5.
        assert!(evaluate("${n} > 1 && ${flag} || ${n} == 5", &e).unwrap());
    }

    #[test]
    fn exists_suffix() {
        let e = env(json!({"defined": "x"}));
        assert!(evaluate("${defined.exists}", &e).unwrap());
        assert!(!evaluate("${undefined.exists}", &e).unwrap());
    }

    #[test]
    fn dotted_step_paths_resolve() {
        let mut e = env(json!({}));
        e.record_step("build", json!({"success": true, "output": {"code": 0}}));
        assert!(evaluate("${steps.build.success}", &e).unwrap());
        assert!(evaluate("${steps.build.output.code} == 0", &e).unwrap());
    }

    #[test]
    fn parenthesized_grouping() {
        let e = env(json!({"a": false, "b": true, "c": true}));
        assert!(evaluate("(${a} || ${b}) && ${c}", &e).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let e = env(json!({}));
        assert!(evaluate("${a} ==", &e).is_err());
        assert!(evaluate("$a", &e).is_err());
        assert!(evaluate("${a} frobnicate", &e).is_err());
        assert!(evaluate("${a", &e).is_err());
        assert!(evaluate("(${a}", &e).is_err());
        assert!(evaluate("'unterminated", &e).is_err());
    }
}
