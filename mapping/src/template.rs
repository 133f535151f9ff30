// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A minimal recursive-descent template renderer.
//!
//! Supports `{{ path.to.field }}` substitution, `{% if %}/{% else if %}/
//! {% else %}/{% endif %}` conditionals, integer arithmetic, and
//! equality/ordering comparisons against string and numeric literals. This
//! is deliberately not a general templating language: it covers the subset
//! a topic mapping's `mapping_template` field needs and nothing more.

use serde_json::Value;

use crate::error::RenderError;

#[derive(Debug, Clone, PartialEq)]
enum Chunk<'a> {
    Text(&'a str),
    Output(&'a str),
    Tag(&'a str),
}

fn tokenize(src: &str) -> Vec<Chunk<'_>> {
    let mut chunks = Vec::new();
    let mut rest = src;
    loop {
        let next_output = rest.find("{{");
        let next_tag = rest.find("{%");
        let next = match (next_output, next_tag) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        let Some(start) = next else {
            if !rest.is_empty() {
                chunks.push(Chunk::Text(rest));
            }
            break;
        };
        if start > 0 {
            chunks.push(Chunk::Text(&rest[..start]));
        }
        let is_output = rest[start..].starts_with("{{");
        let close = if is_output { "}}" } else { "%}" };
        let body_start = start + 2;
        let Some(close_rel) = rest[body_start..].find(close) else {
            chunks.push(Chunk::Text(&rest[start..]));
            break;
        };
        let body_end = body_start + close_rel;
        let body = rest[body_start..body_end].trim();
        if is_output {
            chunks.push(Chunk::Output(body));
        } else {
            chunks.push(Chunk::Tag(body));
        }
        rest = &rest[body_end + close.len()..];
    }
    chunks
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(Expr),
    If(Vec<(Expr, Vec<Node>)>, Vec<Node>),
}

fn parse_nodes<'a>(
    chunks: &[Chunk<'a>],
    pos: &mut usize,
) -> Result<(Vec<Node>, Option<&'a str>), RenderError> {
    let mut nodes = Vec::new();
    while *pos < chunks.len() {
        match chunks[*pos] {
            Chunk::Text(text) => {
                nodes.push(Node::Text(text.to_string()));
                *pos += 1;
            }
            Chunk::Output(expr_src) => {
                nodes.push(Node::Output(parse_expr(expr_src)?));
                *pos += 1;
            }
            Chunk::Tag(tag) => {
                if tag == "else" || tag == "endif" || tag.starts_with("else if") {
                    return Ok((nodes, Some(tag)));
                }
                if let Some(cond_src) = tag.strip_prefix("if ") {
                    *pos += 1;
                    let mut branches = Vec::new();
                    let cond = parse_expr(cond_src.trim())?;
                    let (body, terminator) = parse_nodes(chunks, pos)?;
                    branches.push((cond, body));

                    let mut terminator = terminator;
                    let mut else_body = Vec::new();
                    loop {
                        match terminator {
                            Some(t) if t.starts_with("else if") => {
                                *pos += 1;
                                let cond_src = t["else if".len()..].trim();
                                let cond = parse_expr(cond_src)?;
                                let (body, next_term) = parse_nodes(chunks, pos)?;
                                branches.push((cond, body));
                                terminator = next_term;
                            }
                            Some("else") => {
                                *pos += 1;
                                let (body, next_term) = parse_nodes(chunks, pos)?;
                                else_body = body;
                                terminator = next_term;
                            }
                            Some("endif") => {
                                *pos += 1;
                                break;
                            }
                            _ => {
                                return Err(RenderError::UnexpectedToken(
                                    "missing endif".to_string(),
                                ))
                            }
                        }
                    }
                    nodes.push(Node::If(branches, else_body));
                } else {
                    return Err(RenderError::UnexpectedToken(tag.to_string()));
                }
            }
        }
    }
    Ok((nodes, None))
}

#[derive(Debug, Clone)]
enum Expr {
    Var(Vec<String>),
    Int(i64),
    Str(String),
    BinOp(Box<Expr>, Op, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    Op(&'static str),
}

fn lex_expr(src: &str) -> Result<Vec<Tok>, RenderError> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '"' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(RenderError::UnexpectedToken("unterminated string".to_string()));
            }
            i += 1;
            toks.push(Tok::Str(s));
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<i64>()
                .map_err(|_| RenderError::UnexpectedToken(text.clone()))?;
            toks.push(Tok::Int(value));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            toks.push(Tok::Ident(text));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        match two.as_str() {
            "==" | "!=" | "<=" | ">=" => {
                toks.push(Tok::Op(match two.as_str() {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    _ => ">=",
                }));
                i += 2;
                continue;
            }
            _ => {}
        }
        let op = match c {
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '<' => "<",
            '>' => ">",
            _ => return Err(RenderError::UnexpectedToken(c.to_string())),
        };
        toks.push(Tok::Op(op));
        i += 1;
    }
    Ok(toks)
}

struct ExprParser {
    toks: Vec<Tok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_comparison(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.parse_additive()?;
        while let Some(Tok::Op(op)) = self.peek() {
            let op = match *op {
                "==" => Op::Eq,
                "!=" => Op::Ne,
                "<" => Op::Lt,
                "<=" => Op::Le,
                ">" => Op::Gt,
                ">=" => Op::Ge,
                _ => break,
            };
            self.next();
            let rhs = self.parse_additive()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(Tok::Op(op @ ("+" | "-"))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_multiplicative()?;
            let op = if op == "+" { Op::Add } else { Op::Sub };
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.parse_primary()?;
        while let Some(Tok::Op(op @ ("*" | "/"))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_primary()?;
            let op = if op == "*" { Op::Mul } else { Op::Div };
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, RenderError> {
        match self.next() {
            Some(Tok::Ident(name)) => {
                Ok(Expr::Var(name.split('.').map(str::to_string).collect()))
            }
            Some(Tok::Int(v)) => Ok(Expr::Int(v)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            other => Err(RenderError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

fn parse_expr(src: &str) -> Result<Expr, RenderError> {
    let toks = lex_expr(src)?;
    let mut parser = ExprParser { toks, pos: 0 };
    let expr = parser.parse_comparison()?;
    if parser.pos != parser.toks.len() {
        return Err(RenderError::UnexpectedToken(src.to_string()));
    }
    Ok(expr)
}

fn lookup<'a>(ctx: &'a Value, path: &[String]) -> Result<&'a Value, RenderError> {
    let mut current = ctx;
    for segment in path {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| RenderError::UnknownVariable(path.join(".")))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| RenderError::UnknownVariable(path.join(".")))?;
                items
                    .get(index)
                    .ok_or_else(|| RenderError::UnknownVariable(path.join(".")))?
            }
            _ => return Err(RenderError::UnknownVariable(path.join("."))),
        };
    }
    Ok(current)
}

fn eval(expr: &Expr, ctx: &Value) -> Result<Value, RenderError> {
    match expr {
        Expr::Var(path) => Ok(lookup(ctx, path)?.clone()),
        Expr::Int(v) => Ok(Value::from(*v)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::BinOp(lhs, op, rhs) => {
            let lhs = eval(lhs, ctx)?;
            let rhs = eval(rhs, ctx)?;
            eval_binop(&lhs, *op, &rhs)
        }
    }
}

fn as_i64(v: &Value, what: &str) -> Result<i64, RenderError> {
    v.as_i64()
        .ok_or_else(|| RenderError::TypeMismatch(format!("{what} is not an integer")))
}

fn eval_binop(lhs: &Value, op: Op, rhs: &Value) -> Result<Value, RenderError> {
    match op {
        Op::Add => Ok(Value::from(as_i64(lhs, "lhs")? + as_i64(rhs, "rhs")?)),
        Op::Sub => Ok(Value::from(as_i64(lhs, "lhs")? - as_i64(rhs, "rhs")?)),
        Op::Mul => Ok(Value::from(as_i64(lhs, "lhs")? * as_i64(rhs, "rhs")?)),
        Op::Div => {
            let rhs = as_i64(rhs, "rhs")?;
            if rhs == 0 {
                return Err(RenderError::TypeMismatch("division by zero".to_string()));
            }
            Ok(Value::from(as_i64(lhs, "lhs")? / rhs))
        }
        Op::Eq => Ok(Value::Bool(lhs == rhs)),
        Op::Ne => Ok(Value::Bool(lhs != rhs)),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            if let (Some(l), Some(r)) = (lhs.as_i64(), rhs.as_i64()) {
                let result = match op {
                    Op::Lt => l < r,
                    Op::Le => l <= r,
                    Op::Gt => l > r,
                    _ => l >= r,
                };
                Ok(Value::Bool(result))
            } else if let (Some(l), Some(r)) = (lhs.as_str(), rhs.as_str()) {
                let result = match op {
                    Op::Lt => l < r,
                    Op::Le => l <= r,
                    Op::Gt => l > r,
                    _ => l >= r,
                };
                Ok(Value::Bool(result))
            } else {
                Err(RenderError::TypeMismatch(
                    "ordering comparison needs two numbers or two strings".to_string(),
                ))
            }
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_i64() != Some(0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_nodes(nodes: &[Node], ctx: &Value, out: &mut String) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output(expr) => out.push_str(&value_to_string(&eval(expr, ctx)?)),
            Node::If(branches, else_body) => {
                let mut matched = false;
                for (cond, body) in branches {
                    if truthy(&eval(cond, ctx)?) {
                        render_nodes(body, ctx, out)?;
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    render_nodes(else_body, ctx, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Render `template` against `context`, producing the derived payload.
pub fn render(template: &str, context: &Value) -> Result<String, RenderError> {
    let chunks = tokenize(template);
    let mut pos = 0;
    let (nodes, terminator) = parse_nodes(&chunks, &mut pos)?;
    if terminator.is_some() {
        return Err(RenderError::UnexpectedToken(
            "unmatched else/endif".to_string(),
        ));
    }
    let mut out = String::new();
    render_nodes(&nodes, context, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_plain_variable() {
        let ctx = json!({"value": "pressed"});
        assert_eq!(render("state={{ value }}", &ctx).unwrap(), "state=pressed");
    }

    #[test]
    fn substitutes_nested_path() {
        let ctx = json!({"sensor": {"reading": 42}});
        assert_eq!(render("{{ sensor.reading }}", &ctx).unwrap(), "42");
    }

    #[test]
    fn if_else_if_else_chain() {
        let template =
            "{% if value == \"pressed\" %}on{% else if value == \"released\" %}off{% endif %}";
        let ctx = json!({"value": "released"});
        assert_eq!(render(template, &ctx).unwrap(), "off");

        let ctx = json!({"value": "held"});
        assert_eq!(render(template, &ctx).unwrap(), "");
    }

    #[test]
    fn integer_arithmetic() {
        let ctx = json!({"count": 3});
        assert_eq!(render("{{ count * 2 }}", &ctx).unwrap(), "6");
    }

    #[test]
    fn unknown_variable_errors() {
        let ctx = json!({});
        assert!(matches!(
            render("{{ missing }}", &ctx),
            Err(RenderError::UnknownVariable(_))
        ));
    }
}
