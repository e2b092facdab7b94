//! Query tool: read a structured file and extract values for later
//! steps.
//!
//! `checks` resolve dot-paths and export values or existence booleans;
//! `expression` evaluates a small JavaScript-like expression against a
//! sandbox whose only bindings are `data` and `Object.keys`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;

use super::{Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{QueryFormat, Step, ToolSpec};

pub struct QueryTool;

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &'static str {
        "query"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Query(spec) = &step.action else {
            return Err(EngineError::internal("query tool got a non-query step"));
        };

        let path = ctx.project_path(&spec.file);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            query_error(format!("cannot read `{}`", spec.file))
                .with_context("resolved_path", path.display().to_string())
                .with_source(e)
        })?;

        let format = match spec.format {
            Some(format) => format,
            None => detect_format(&path)
                .ok_or_else(|| query_error(format!("cannot detect format of `{}`", spec.file)))?,
        };
        let data = parse_document(&raw, format)?;

        let mut output = Map::new();
        for check in &spec.checks {
            let value = resolve_path(&data, &check.path);
            if let Some(name) = &check.export {
                output.insert(name.clone(), value.clone().unwrap_or(Value::Null));
            }
            if let Some(name) = &check.export_exists {
                // Exists means present, non-null, and not boolean false.
                let exists = match &value {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                    Some(_) => true,
                };
                output.insert(name.clone(), Value::Bool(exists));
            }
        }

        let mut result = ToolOutput::default();
        if let Some(expression) = &spec.expression {
            let value = expr::evaluate(expression, &data)
                .map_err(|e| query_error(format!("expression failed: {e}")))?;
            if spec.checks.is_empty() {
                output.insert("value".to_string(), value);
            } else {
                result.tool_result = Some(json!({ "value": value }));
            }
        }

        result.output = Some(Value::Object(output));
        Ok(result)
    }
}

fn query_error(message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorCode::QueryFailed, message)
}

fn detect_format(path: &Path) -> Option<QueryFormat> {
    match path.extension()?.to_str()? {
        "json" => Some(QueryFormat::Json),
        "yaml" | "yml" => Some(QueryFormat::Yaml),
        "toml" => Some(QueryFormat::Toml),
        "env" => Some(QueryFormat::Env),
        _ => None,
    }
}

fn parse_document(raw: &str, format: QueryFormat) -> Result<Value> {
    match format {
        QueryFormat::Json => serde_json::from_str(raw)
            .map_err(|e| query_error(format!("invalid JSON: {e}")).with_source(e)),
        QueryFormat::Yaml => serde_yaml::from_str(raw)
            .map_err(|e| query_error(format!("invalid YAML: {e}")).with_source(e)),
        QueryFormat::Toml => {
            let table: toml::Table = raw
                .parse()
                .map_err(|e: toml::de::Error| query_error(format!("invalid TOML: {e}")))?;
            serde_json::to_value(table)
                .map_err(|e| query_error(format!("TOML conversion failed: {e}")))
        }
        QueryFormat::Env => {
            let mut map = Map::new();
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"').trim_matches('\'');
                    map.insert(key.trim().to_string(), Value::String(value.to_string()));
                }
            }
            Ok(Value::Object(map))
        }
    }
}

/// Resolve a dot-path such as `scripts.build` or `workspaces[0]`.
fn resolve_path(data: &Value, path: &str) -> Option<Value> {
    let mut current = data.clone();
    for segment in path.split('.') {
        let (name, indices) = split_indices(segment);
        if !name.is_empty() {
            current = current.get(name)?.clone();
        }
        for index in indices {
            current = current.get(index)?.clone();
        }
    }
    Some(current)
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    match segment.find('[') {
        None => (segment, Vec::new()),
        Some(start) => {
            let name = &segment[..start];
            let indices = segment[start..]
                .split(['[', ']'])
                .filter(|part| !part.is_empty())
                .filter_map(|part| part.parse().ok())
                .collect();
            (name, indices)
        }
    }
}

/// Expression sandbox: `data`, member/index access, `.length`,
/// `Object.keys(...)`, comparisons, `&&`/`||`/`!`, parentheses.
mod expr {
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq)]
    enum Tok {
        Ident(String),
        Num(f64),
        Str(String),
        Dot,
        LBracket,
        RBracket,
        LParen,
        RParen,
        Eq,
        Ne,
        Gt,
        Lt,
        Ge,
        Le,
        And,
        Or,
        Not,
    }

    #[derive(Debug, Clone)]
    enum Expr {
        Data,
        ObjectNs,
        Lit(Value),
        Member(Box<Expr>, String),
        Index(Box<Expr>, Box<Expr>),
        Keys(Box<Expr>),
        Cmp(Box<Expr>, Tok, Box<Expr>),
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
        Not(Box<Expr>),
    }

    pub fn evaluate(input: &str, data: &Value) -> anyhow::Result<Value> {
        let mut tokens = tokenize(input)?;
        let expr = parse_or(&mut tokens)?;
        if !tokens.is_empty() {
            anyhow::bail!("trailing tokens in expression");
        }
        eval(&expr, data)
    }

    fn tokenize(input: &str) -> anyhow::Result<Vec<Tok>> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&ch) = chars.peek() {
            match ch {
                ' ' | '\t' | '\n' | '\r' => {
                    chars.next();
                }
                '.' => {
                    chars.next();
                    tokens.push(Tok::Dot);
                }
                '[' => {
                    chars.next();
                    tokens.push(Tok::LBracket);
                }
                ']' => {
                    chars.next();
                    tokens.push(Tok::RBracket);
                }
                '(' => {
                    chars.next();
                    tokens.push(Tok::LParen);
                }
                ')' => {
                    chars.next();
                    tokens.push(Tok::RParen);
                }
                '\'' | '"' => {
                    let quote = ch;
                    chars.next();
                    let mut out = String::new();
                    loop {
                        match chars.next() {
                            Some(c) if c == quote => break,
                            Some(c) => out.push(c),
                            None => anyhow::bail!("unterminated string literal"),
                        }
                    }
                    tokens.push(Tok::Str(out));
                }
                '=' => {
                    chars.next();
                    if chars.next() != Some('=') {
                        anyhow::bail!("expected '=='");
                    }
                    // Tolerate strict equality spelling.
                    if chars.peek() == Some(&'=') {
                        chars.next();
                    }
                    tokens.push(Tok::Eq);
                }
                '!' => {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        if chars.peek() == Some(&'=') {
                            chars.next();
                        }
                        tokens.push(Tok::Ne);
                    } else {
                        tokens.push(Tok::Not);
                    }
                }
                '>' => {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Tok::Ge);
                    } else {
                        tokens.push(Tok::Gt);
                    }
                }
                '<' => {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Tok::Le);
                    } else {
                        tokens.push(Tok::Lt);
                    }
                }
                '&' => {
                    chars.next();
                    if chars.next() != Some('&') {
                        anyhow::bail!("expected '&&'");
                    }
                    tokens.push(Tok::And);
                }
                '|' => {
                    chars.next();
                    if chars.next() != Some('|') {
                        anyhow::bail!("expected '||'");
                    }
                    tokens.push(Tok::Or);
                }
                c if c.is_ascii_digit() => {
                    let mut out = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_digit() || c == '.' {
                            out.push(chars.next().unwrap());
                        } else {
                            break;
                        }
                    }
                    tokens.push(Tok::Num(out.parse()?));
                }
                c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                    let mut out = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                            out.push(chars.next().unwrap());
                        } else {
                            break;
                        }
                    }
                    tokens.push(Tok::Ident(out));
                }
                other => anyhow::bail!("unexpected character `{other}`"),
            }
        }
        Ok(tokens)
    }

    fn parse_or(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        let mut left = parse_and(tokens)?;
        while tokens.first() == Some(&Tok::Or) {
            tokens.remove(0);
            left = Expr::Or(Box::new(left), Box::new(parse_and(tokens)?));
        }
        Ok(left)
    }

    fn parse_and(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        let mut left = parse_cmp(tokens)?;
        while tokens.first() == Some(&Tok::And) {
            tokens.remove(0);
            left = Expr::And(Box::new(left), Box::new(parse_cmp(tokens)?));
        }
        Ok(left)
    }

    fn parse_cmp(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        let left = parse_unary(tokens)?;
        if let Some(op @ (Tok::Eq | Tok::Ne | Tok::Gt | Tok::Lt | Tok::Ge | Tok::Le)) =
            tokens.first().cloned()
        {
            tokens.remove(0);
            let right = parse_unary(tokens)?;
            return Ok(Expr::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        if tokens.first() == Some(&Tok::Not) {
            tokens.remove(0);
            return Ok(Expr::Not(Box::new(parse_unary(tokens)?)));
        }
        parse_postfix(tokens)
    }

    fn parse_postfix(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        let mut expr = parse_primary(tokens)?;
        loop {
            match tokens.first() {
                Some(Tok::Dot) => {
                    tokens.remove(0);
                    let Some(Tok::Ident(name)) = tokens.first().cloned() else {
                        anyhow::bail!("expected property name after '.'");
                    };
                    tokens.remove(0);
                    // Only Object.keys(...) is callable in the sandbox.
                    if matches!(expr, Expr::ObjectNs) {
                        if name != "keys" {
                            anyhow::bail!("Object.{name} is not available");
                        }
                        if tokens.first() != Some(&Tok::LParen) {
                            anyhow::bail!("Object.keys must be called");
                        }
                        tokens.remove(0);
                        let arg = parse_or(tokens)?;
                        if tokens.is_empty() || tokens.remove(0) != Tok::RParen {
                            anyhow::bail!("expected ')' after Object.keys argument");
                        }
                        expr = Expr::Keys(Box::new(arg));
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Tok::LBracket) => {
                    tokens.remove(0);
                    let index = parse_or(tokens)?;
                    if tokens.is_empty() || tokens.remove(0) != Tok::RBracket {
                        anyhow::bail!("expected ']'");
                    }
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(tokens: &mut Vec<Tok>) -> anyhow::Result<Expr> {
        if tokens.is_empty() {
            anyhow::bail!("unexpected end of expression");
        }
        match tokens.remove(0) {
            Tok::Ident(name) => match name.as_str() {
                "data" => Ok(Expr::Data),
                "Object" => Ok(Expr::ObjectNs),
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Lit(Value::Null)),
                other => anyhow::bail!("`{other}` is not defined in the query sandbox"),
            },
            Tok::Num(n) => Ok(Expr::Lit(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Tok::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Tok::LParen => {
                let inner = parse_or(tokens)?;
                if tokens.is_empty() || tokens.remove(0) != Tok::RParen {
                    anyhow::bail!("expected ')'");
                }
                Ok(inner)
            }
            other => anyhow::bail!("unexpected token {other:?}"),
        }
    }

    fn eval(expr: &Expr, data: &Value) -> anyhow::Result<Value> {
        match expr {
            Expr::Data => Ok(data.clone()),
            Expr::ObjectNs => anyhow::bail!("Object cannot be used as a value"),
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Member(base, name) => {
                let base = eval(base, data)?;
                member(&base, name)
            }
            Expr::Index(base, index) => {
                let base = eval(base, data)?;
                let index = eval(index, data)?;
                match (&base, &index) {
                    (Value::Array(items), Value::Number(n)) => Ok(n
                        .as_f64()
                        .map(|f| f as usize)
                        .and_then(|i| items.get(i))
                        .cloned()
                        .unwrap_or(Value::Null)),
                    (Value::Object(map), Value::String(key)) => {
                        Ok(map.get(key).cloned().unwrap_or(Value::Null))
                    }
                    (Value::Null, _) => anyhow::bail!("cannot index null"),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Keys(inner) => match eval(inner, data)? {
                Value::Object(map) => {
                    Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
                }
                Value::Array(items) => Ok(Value::Array(
                    (0..items.len()).map(|i| Value::String(i.to_string())).collect(),
                )),
                other => anyhow::bail!("Object.keys expects an object, got {other}"),
            },
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, data)?))),
            Expr::And(left, right) => {
                let left = eval(left, data)?;
                if !truthy(&left) {
                    return Ok(left);
                }
                eval(right, data)
            }
            Expr::Or(left, right) => {
                let left = eval(left, data)?;
                if truthy(&left) {
                    return Ok(left);
                }
                eval(right, data)
            }
            Expr::Cmp(left, op, right) => {
                let left = eval(left, data)?;
                let right = eval(right, data)?;
                compare(&left, op, &right)
            }
        }
    }

    fn member(base: &Value, name: &str) -> anyhow::Result<Value> {
        match base {
            Value::Null => anyhow::bail!("cannot read `{name}` of null"),
            Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
            Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
            Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }

    fn truthy(value: &Value) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    fn compare(left: &Value, op: &Tok, right: &Value) -> anyhow::Result<Value> {
        let result = match op {
            Tok::Eq => loose_eq(left, right),
            Tok::Ne => !loose_eq(left, right),
            _ => {
                let ordering = match (left, right) {
                    (Value::Number(l), Value::Number(r)) => l
                        .as_f64()
                        .zip(r.as_f64())
                        .and_then(|(l, r)| l.partial_cmp(&r)),
                    (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                    _ => None,
                }
                .ok_or_else(|| anyhow::anyhow!("cannot order {left} and {right}"))?;
                match op {
                    Tok::Gt => ordering.is_gt(),
                    Tok::Lt => ordering.is_lt(),
                    Tok::Ge => ordering.is_ge(),
                    Tok::Le => ordering.is_le(),
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn loose_eq(left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
            _ => left == right,
        }
    }
}
