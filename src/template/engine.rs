//! A small template language compatible with the common secret templates:
//! `with`, `if`, `range`, `else`, field access, variables, pipelines and a
//! handful of functions.
//!
//! Secrets are discovered statically: every `secret` call must take string
//! literals, so the runner can fetch all of them before evaluation, which is
//! then synchronous.

use std::collections::{BTreeSet, HashMap};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use super::TemplateError;

const NO_VALUE: &str = "<no value>";

/// A `secret` call: the path plus `key=value` write parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl SecretRequest {
    fn from_args(args: &[String]) -> Result<Self, TemplateError> {
        let (path, rest) = args
            .split_first()
            .ok_or_else(|| TemplateError::Exec("secret requires a path".to_string()))?;
        let mut params = Vec::with_capacity(rest.len());
        for arg in rest {
            let (k, v) = arg.split_once('=').ok_or_else(|| {
                TemplateError::Exec(format!("secret parameter '{}' is not key=value", arg))
            })?;
            params.push((k.to_string(), v.to_string()));
        }
        params.sort();
        Ok(Self {
            path: path.trim_matches('/').to_string(),
            params,
        })
    }

    /// Parameters become a write; without them the path is read
    pub fn is_write(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn body(&self) -> Value {
        Value::Object(
            self.params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl std::fmt::Display for SecretRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Field(Vec<String>),
    Var(String, Vec<String>),
    Str(String),
    Num(Value),
    Ident(String),
    Pipe,
    Declare,
    Comma,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Arg {
    Field(Vec<String>),
    Var(String, Vec<String>),
    Literal(Value),
    Func(String),
    Sub(Pipeline),
}

#[derive(Debug, Clone)]
struct Command {
    args: Vec<Arg>,
}

#[derive(Debug, Clone, Default)]
struct Pipeline {
    decl: Vec<String>,
    cmds: Vec<Command>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Action(Pipeline),
    If {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

enum Segment {
    Text(String),
    Action { tokens: Vec<Tok>, line: usize },
}

fn line_of(src: &str, pos: usize) -> usize {
    src[..pos].matches('\n').count() + 1
}

fn split_segments(src: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut trim_next = false;

    while pos < src.len() {
        let Some(offset) = src[pos..].find("{{") else {
            let mut text = &src[pos..];
            if trim_next {
                text = text.trim_start();
            }
            if !text.is_empty() {
                segments.push(Segment::Text(text.to_string()));
            }
            break;
        };
        let start = pos + offset;
        let line = line_of(src, start);

        let mut inner_start = start + 2;
        let trim_left = src[inner_start..].starts_with("- ")
            || src[inner_start..].starts_with("-\n")
            || src[inner_start..].starts_with("-\t");
        if trim_left {
            inner_start += 1;
        }

        let end = src[inner_start..]
            .find("}}")
            .map(|o| inner_start + o)
            .ok_or_else(|| TemplateError::Parse {
                line,
                message: "unclosed action".to_string(),
            })?;
        let mut inner = &src[inner_start..end];
        let trim_right = inner.ends_with(" -") || inner.ends_with("\n-") || inner.ends_with("\t-");
        if trim_right {
            inner = &inner[..inner.len() - 1];
        }

        let mut text = &src[pos..start];
        if trim_next {
            text = text.trim_start();
        }
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }

        let trimmed = inner.trim();
        if !(trimmed.starts_with("/*") && trimmed.ends_with("*/")) {
            let tokens = tokenize(inner).map_err(|message| TemplateError::Parse { line, message })?;
            if tokens.is_empty() {
                return Err(TemplateError::Parse {
                    line,
                    message: "empty action".to_string(),
                });
            }
            segments.push(Segment::Action { tokens, line });
        }

        trim_next = trim_right;
        pos = end + 2;
    }
    Ok(segments)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn take_while(chars: &[char], mut i: usize, pred: impl Fn(char) -> bool) -> usize {
    while i < chars.len() && pred(chars[i]) {
        i += 1;
    }
    i
}

fn field_chain(chars: &[char], mut i: usize) -> (Vec<String>, usize) {
    let mut fields = Vec::new();
    while i < chars.len() && chars[i] == '.' {
        let end = take_while(chars, i + 1, is_ident_char);
        if end == i + 1 {
            break;
        }
        fields.push(chars[i + 1..end].iter().collect());
        i = end;
    }
    (fields, i)
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Tok::Pipe);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Tok::Declare);
                i += 2;
            }
            '.' => {
                let (fields, end) = field_chain(&chars, i);
                if fields.is_empty() {
                    i += 1;
                } else {
                    i = end;
                }
                tokens.push(Tok::Field(fields));
            }
            '$' => {
                let end = take_while(&chars, i + 1, is_ident_char);
                let name: String = chars[i + 1..end].iter().collect();
                let (fields, end) = field_chain(&chars, end);
                tokens.push(Tok::Var(name, fields));
                i = end;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('"') => '"',
                                Some('\\') => '\\',
                                other => return Err(format!("bad escape {:?}", other)),
                            };
                            s.push(escaped);
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Tok::Str(s));
                i += 1;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == '`')
                    .ok_or_else(|| "unterminated raw string".to_string())?;
                tokens.push(Tok::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let end = take_while(&chars, i + 1, |d| d.is_ascii_digit() || d == '.');
                let text: String = chars[i..end].iter().collect();
                let num = if let Ok(n) = text.parse::<i64>() {
                    Value::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| format!("bad number '{}'", text))?
                };
                tokens.push(Tok::Num(num));
                i = end;
            }
            c if is_ident_char(c) => {
                let end = take_while(&chars, i, is_ident_char);
                tokens.push(Tok::Ident(chars[i..end].iter().collect()));
                i = end;
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct PipelineParser<'a> {
    tokens: &'a [Tok],
    pos: usize,
    line: usize,
}

impl<'a> PipelineParser<'a> {
    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn parse(tokens: &'a [Tok], line: usize) -> Result<Pipeline, TemplateError> {
        let mut parser = Self { tokens, pos: 0, line };
        let pipe = parser.pipeline(true)?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected tokens after pipeline"));
        }
        Ok(pipe)
    }

    fn declarations(&mut self) -> Vec<String> {
        let tokens = self.tokens;
        match tokens[self.pos..] {
            [Tok::Var(ref a, ref fa), Tok::Comma, Tok::Var(ref b, ref fb), Tok::Declare, ..]
                if fa.is_empty() && fb.is_empty() =>
            {
                self.pos += 4;
                vec![a.clone(), b.clone()]
            }
            [Tok::Var(ref a, ref fa), Tok::Declare, ..] if fa.is_empty() => {
                self.pos += 2;
                vec![a.clone()]
            }
            _ => Vec::new(),
        }
    }

    fn pipeline(&mut self, top: bool) -> Result<Pipeline, TemplateError> {
        let decl = if top { self.declarations() } else { Vec::new() };
        let mut cmds = Vec::new();
        loop {
            let mut args = Vec::new();
            while let Some(tok) = self.tokens.get(self.pos) {
                let arg = match tok {
                    Tok::Pipe | Tok::RParen => break,
                    Tok::Field(f) => Arg::Field(f.clone()),
                    Tok::Var(v, f) => Arg::Var(v.clone(), f.clone()),
                    Tok::Str(s) => Arg::Literal(Value::String(s.clone())),
                    Tok::Num(n) => Arg::Literal(n.clone()),
                    Tok::Ident(name) => match name.as_str() {
                        "true" => Arg::Literal(Value::Bool(true)),
                        "false" => Arg::Literal(Value::Bool(false)),
                        "nil" => Arg::Literal(Value::Null),
                        _ => Arg::Func(name.clone()),
                    },
                    Tok::LParen => {
                        self.pos += 1;
                        let sub = self.pipeline(false)?;
                        if self.tokens.get(self.pos) != Some(&Tok::RParen) {
                            return Err(self.error("unclosed parenthesis"));
                        }
                        Arg::Sub(sub)
                    }
                    Tok::Declare | Tok::Comma => return Err(self.error("unexpected declaration")),
                };
                args.push(arg);
                self.pos += 1;
            }
            if args.is_empty() {
                return Err(self.error("missing value for command"));
            }
            cmds.push(Command { args });
            if self.tokens.get(self.pos) == Some(&Tok::Pipe) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(Pipeline { decl, cmds })
    }
}

enum Terminator {
    Eof,
    End,
    Else(Vec<Tok>),
}

struct TreeParser {
    segments: std::vec::IntoIter<Segment>,
}

impl TreeParser {
    fn list(&mut self) -> Result<(Vec<Node>, Terminator, usize), TemplateError> {
        let mut nodes = Vec::new();
        while let Some(segment) = self.segments.next() {
            let (tokens, line) = match segment {
                Segment::Text(t) => {
                    nodes.push(Node::Text(t));
                    continue;
                }
                Segment::Action { tokens, line } => (tokens, line),
            };
            let keyword = match tokens.first() {
                Some(Tok::Ident(k)) => k.as_str(),
                _ => "",
            };
            match keyword {
                "end" if tokens.len() == 1 => return Ok((nodes, Terminator::End, line)),
                "else" => return Ok((nodes, Terminator::Else(tokens[1..].to_vec()), line)),
                "if" | "with" | "range" => {
                    let node = self.branch(keyword, &tokens[1..], line)?;
                    nodes.push(node);
                }
                "define" | "template" | "block" | "break" | "continue" => {
                    return Err(TemplateError::Parse {
                        line,
                        message: format!("'{}' is not supported", keyword),
                    });
                }
                _ => nodes.push(Node::Action(PipelineParser::parse(&tokens, line)?)),
            }
        }
        Ok((nodes, Terminator::Eof, 0))
    }

    fn branch(&mut self, keyword: &str, tokens: &[Tok], line: usize) -> Result<Node, TemplateError> {
        let pipe = PipelineParser::parse(tokens, line)?;
        let (body, term, term_line) = self.list()?;
        let otherwise = match term {
            Terminator::End => Vec::new(),
            Terminator::Eof => {
                return Err(TemplateError::Parse {
                    line,
                    message: format!("unclosed '{}'", keyword),
                });
            }
            Terminator::Else(rest) if rest.is_empty() => {
                let (otherwise, term, _) = self.list()?;
                if !matches!(term, Terminator::End) {
                    return Err(TemplateError::Parse {
                        line: term_line,
                        message: "expected 'end' after 'else'".to_string(),
                    });
                }
                otherwise
            }
            Terminator::Else(rest) => match rest.first() {
                // `else if` / `else with` share the outer `end`
                Some(Tok::Ident(k)) if k == "if" || k == "with" => {
                    let k = k.clone();
                    vec![self.branch(&k, &rest[1..], term_line)?]
                }
                _ => {
                    return Err(TemplateError::Parse {
                        line: term_line,
                        message: "unexpected tokens after 'else'".to_string(),
                    });
                }
            },
        };
        Ok(match keyword {
            "if" => Node::If { pipe, body, otherwise },
            "with" => Node::With { pipe, body, otherwise },
            _ => Node::Range { pipe, body, otherwise },
        })
    }
}

/// A parsed template
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
    error_on_missing_key: bool,
    secrets: BTreeSet<SecretRequest>,
}

impl Template {
    pub fn parse(name: &str, src: &str, error_on_missing_key: bool) -> Result<Self, TemplateError> {
        let mut parser = TreeParser {
            segments: split_segments(src)?.into_iter(),
        };
        let (nodes, term, line) = parser.list()?;
        match term {
            Terminator::Eof => {}
            Terminator::End => {
                return Err(TemplateError::Parse {
                    line,
                    message: "unexpected 'end'".to_string(),
                });
            }
            Terminator::Else(_) => {
                return Err(TemplateError::Parse {
                    line,
                    message: "unexpected 'else'".to_string(),
                });
            }
        }

        let mut secrets = BTreeSet::new();
        collect_secrets(&nodes, &mut secrets)?;
        Ok(Self {
            name: name.to_string(),
            nodes,
            error_on_missing_key,
            secrets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every secret the template reads, in a stable order
    pub fn secrets(&self) -> impl Iterator<Item = &SecretRequest> {
        self.secrets.iter()
    }

    /// Evaluate against prefetched `secrets` (each a `{Data, LeaseID, ...}`
    /// object) with `env` resolving environment variables.
    pub fn render(
        &self,
        secrets: &HashMap<SecretRequest, Value>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<String, TemplateError> {
        let mut exec = Exec {
            secrets,
            env,
            strict: self.error_on_missing_key,
            vars: Vec::new(),
            out: String::new(),
        };
        exec.walk(&self.nodes, &Value::Null)?;
        Ok(exec.out)
    }
}

fn collect_pipeline(pipe: &Pipeline, out: &mut BTreeSet<SecretRequest>) -> Result<(), TemplateError> {
    for (i, cmd) in pipe.cmds.iter().enumerate() {
        for arg in &cmd.args {
            if let Arg::Sub(sub) = arg {
                collect_pipeline(sub, out)?;
            }
        }
        if !matches!(cmd.args.first(), Some(Arg::Func(f)) if f == "secret") {
            continue;
        }
        if i > 0 {
            return Err(TemplateError::Exec(
                "secret cannot receive a piped value".to_string(),
            ));
        }
        let literals = cmd.args[1..]
            .iter()
            .map(|a| match a {
                Arg::Literal(Value::String(s)) => Ok(s.clone()),
                _ => Err(TemplateError::Exec(
                    "secret arguments must be string literals".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.insert(SecretRequest::from_args(&literals)?);
    }
    Ok(())
}

fn collect_secrets(nodes: &[Node], out: &mut BTreeSet<SecretRequest>) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(pipe) => collect_pipeline(pipe, out)?,
            Node::If { pipe, body, otherwise }
            | Node::With { pipe, body, otherwise }
            | Node::Range { pipe, body, otherwise } => {
                collect_pipeline(pipe, out)?;
                collect_secrets(body, out)?;
                collect_secrets(otherwise, out)?;
            }
        }
    }
    Ok(())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => NO_VALUE.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Exec<'a> {
    secrets: &'a HashMap<SecretRequest, Value>,
    env: &'a dyn Fn(&str) -> Option<String>,
    strict: bool,
    vars: Vec<(String, Value)>,
    out: String,
}

impl Exec<'_> {
    fn walk(&mut self, nodes: &[Node], dot: &Value) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(t) => self.out.push_str(t),
                Node::Action(pipe) => {
                    let value = self.pipeline(pipe, dot)?;
                    if pipe.decl.is_empty() {
                        self.out.push_str(&display(&value));
                    }
                }
                Node::If { pipe, body, otherwise } => {
                    let mark = self.vars.len();
                    let value = self.pipeline(pipe, dot)?;
                    if truthy(&value) {
                        self.walk(body, dot)?;
                    } else {
                        self.walk(otherwise, dot)?;
                    }
                    self.vars.truncate(mark);
                }
                Node::With { pipe, body, otherwise } => {
                    let mark = self.vars.len();
                    let value = self.pipeline(pipe, dot)?;
                    if truthy(&value) {
                        self.walk(body, &value)?;
                    } else {
                        self.walk(otherwise, dot)?;
                    }
                    self.vars.truncate(mark);
                }
                Node::Range { pipe, body, otherwise } => {
                    let mark = self.vars.len();
                    let value = self.pipeline_value(pipe, dot)?;
                    let items: Vec<(Value, Value)> = match value {
                        Value::Array(a) => a
                            .into_iter()
                            .enumerate()
                            .map(|(i, v)| (Value::from(i), v))
                            .collect(),
                        Value::Object(o) => o.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
                        Value::Null => Vec::new(),
                        other => {
                            return Err(TemplateError::Exec(format!("range can't iterate over {}", other)));
                        }
                    };
                    if items.is_empty() {
                        self.walk(otherwise, dot)?;
                    }
                    for (key, item) in items {
                        let scope = self.vars.len();
                        match pipe.decl.as_slice() {
                            [v] => self.vars.push((v.clone(), item.clone())),
                            [k, v] => {
                                self.vars.push((k.clone(), key));
                                self.vars.push((v.clone(), item.clone()));
                            }
                            _ => {}
                        }
                        self.walk(body, &item)?;
                        self.vars.truncate(scope);
                    }
                    self.vars.truncate(mark);
                }
            }
        }
        Ok(())
    }

    /// Evaluate without binding declarations (range binds per element)
    fn pipeline_value(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, TemplateError> {
        let mut value: Option<Value> = None;
        for cmd in &pipe.cmds {
            value = Some(self.command(cmd, dot, value)?);
        }
        Ok(value.unwrap_or(Value::Null))
    }

    fn pipeline(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, TemplateError> {
        let value = self.pipeline_value(pipe, dot)?;
        if let Some(name) = pipe.decl.first() {
            self.vars.push((name.clone(), value.clone()));
        }
        Ok(value)
    }

    fn command(&mut self, cmd: &Command, dot: &Value, piped: Option<Value>) -> Result<Value, TemplateError> {
        if let Some(Arg::Func(name)) = cmd.args.first() {
            let mut args = Vec::with_capacity(cmd.args.len());
            for arg in &cmd.args[1..] {
                args.push(self.arg(arg, dot)?);
            }
            args.extend(piped);
            return self.call(name, args);
        }
        if cmd.args.len() > 1 || piped.is_some() {
            return Err(TemplateError::Exec("can't give argument to non-function".to_string()));
        }
        match cmd.args.first() {
            Some(arg) => self.arg(arg, dot),
            None => Ok(Value::Null),
        }
    }

    fn arg(&mut self, arg: &Arg, dot: &Value) -> Result<Value, TemplateError> {
        match arg {
            Arg::Field(path) => self.lookup(dot, path),
            Arg::Var(name, path) => {
                let base = if name.is_empty() {
                    // `$` is the root data, which is always empty here
                    Value::Null
                } else {
                    self.vars
                        .iter()
                        .rev()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| TemplateError::Exec(format!("undefined variable ${}", name)))?
                };
                self.lookup(&base, path)
            }
            Arg::Literal(v) => Ok(v.clone()),
            Arg::Func(name) => self.call(name, Vec::new()),
            Arg::Sub(pipe) => self.pipeline_value(pipe, dot),
        }
    }

    fn lookup(&self, base: &Value, path: &[String]) -> Result<Value, TemplateError> {
        let mut current = base;
        for (i, key) in path.iter().enumerate() {
            match current {
                Value::Object(map) => match map.get(key) {
                    Some(v) => current = v,
                    None if self.strict => {
                        return Err(TemplateError::MissingKey(path[..=i].join(".")));
                    }
                    None => return Ok(Value::Null),
                },
                Value::Null if self.strict => {
                    return Err(TemplateError::MissingKey(path[..=i].join(".")));
                }
                Value::Null => return Ok(Value::Null),
                other => {
                    return Err(TemplateError::Exec(format!(
                        "can't evaluate field {} in {}",
                        key, other
                    )));
                }
            }
        }
        Ok(current.clone())
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
        let one = |args: &[Value]| -> Result<String, TemplateError> {
            match args {
                [v] => Ok(match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                }),
                _ => Err(TemplateError::Exec(format!(
                    "{} expects 1 argument, got {}",
                    name,
                    args.len()
                ))),
            }
        };

        match name {
            "secret" => {
                let strings: Vec<String> = args
                    .iter()
                    .map(|a| a.as_str().unwrap_or_default().to_string())
                    .collect();
                let request = SecretRequest::from_args(&strings)?;
                self.secrets
                    .get(&request)
                    .cloned()
                    .ok_or_else(|| TemplateError::Exec(format!("secret '{}' was not fetched", request)))
            }
            "env" => Ok(Value::String((self.env)(&one(&args)?).unwrap_or_default())),
            "toJSON" => match args.as_slice() {
                [v] => Ok(Value::String(v.to_string())),
                _ => Err(TemplateError::Exec("toJSON expects 1 argument".to_string())),
            },
            "toUpper" => Ok(Value::String(one(&args)?.to_uppercase())),
            "toLower" => Ok(Value::String(one(&args)?.to_lowercase())),
            "trimSpace" => Ok(Value::String(one(&args)?.trim().to_string())),
            "base64Encode" => Ok(Value::String(STANDARD.encode(one(&args)?))),
            other => Err(TemplateError::Exec(format!("function '{}' not defined", other))),
        }
    }
}
