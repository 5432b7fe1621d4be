//! In-process evaluator for straight-line Python
//!
//! Covers what the executor prompt asks the model to write: imports (ignored),
//! assignments, arithmetic, `print` with f-strings and format specs, a few
//! builtins and `math.*`. Runtime failures are appended to the captured
//! output as a Python-style traceback. Code that uses control flow, functions
//! or comprehensions is not run at all: the result is `SKIPPED_NOTICE`, which
//! carries no error marker, so the subprocess backend alone decides the attempt.

use super::CodeRunner;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "def", "class", "for", "while", "if", "elif", "else", "try", "except", "finally", "with",
    "return", "lambda", "yield", "async", "await", "global", "del", "assert", "raise",
];

/// Output for code outside the evaluated subset.
pub const SKIPPED_NOTICE: &str = "inline evaluation skipped: uses";

const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "log", "log10", "log2", "exp", "fabs", "floor", "ceil", "trunc", "isclose",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineEvaluator;

impl InlineEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Run `code` and return everything it printed, followed by a traceback
    /// if it failed.
    pub fn evaluate(code: &str) -> String {
        let mut interpreter = Interpreter::default();
        match interpreter.run(code) {
            Ok(Run::Completed) => interpreter.out,
            Ok(Run::Skipped(construct)) => format!("{} `{}`\n", SKIPPED_NOTICE, construct),
            Err((line, err)) => {
                let mut output = interpreter.out;
                let _ = write!(
                    output,
                    "Traceback (most recent call last):\n  File \"<inline>\", line {}, in <module>\n{}: {}\n",
                    line, err.kind, err.message
                );
                output
            }
        }
    }
}

#[async_trait]
impl CodeRunner for InlineEvaluator {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn run(&self, code: &str) -> String {
        let code = code.to_string();
        tokio::task::spawn_blocking(move || InlineEvaluator::evaluate(&code))
            .await
            .unwrap_or_else(|e| format!("Error: inline evaluation aborted: {}", e))
    }
}

//
// ================= Values =================
//

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    None,
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::None => "NoneType",
        }
    }

    fn number(&self) -> Option<Num> {
        match self {
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            Value::Bool(b) => Some(Num::Int(*b as i64)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        self.number().map(Num::to_f64)
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::List(v) | Value::Tuple(v) => !v.is_empty(),
            Value::None => false,
        }
    }

    /// `str(value)`
    fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)`
    fn repr(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::None => "None".to_string(),
            Value::List(items) => format!(
                "[{}]",
                items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
            ),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!(
                "({})",
                items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Python's `repr(float)`.
fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let abs = x.abs();
    if !(1e-4..1e16).contains(&abs) {
        let sci = format!("{:e}", x);
        if let Some((mantissa, exp)) = sci.split_once('e') {
            if let Ok(exp) = exp.parse::<i32>() {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{}e{}{:02}", mantissa, sign, exp.abs());
            }
        }
        return sci;
    }

    let s = format!("{}", x);
    if s.contains('.') {
        s
    } else {
        format!("{}.0", s)
    }
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

//
// ================= Errors =================
//

#[derive(Debug, Clone)]
struct PyError {
    kind: &'static str,
    message: String,
}

type Eval<T> = std::result::Result<T, PyError>;

fn py_err<T>(kind: &'static str, message: impl Into<String>) -> Eval<T> {
    Err(PyError {
        kind,
        message: message.into(),
    })
}

fn syntax_error<T>() -> Eval<T> {
    py_err("SyntaxError", "invalid syntax")
}

//
// ================= Lexer =================
//

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    FStr(String),
    Name(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "+=", "-=", "*=", "/=", "%=", "==", "!=", "<=", ">=", "+", "-", "*",
    "/", "%", "(", ")", "[", "]", ",", "=", ".", "<", ">", ":",
];

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "f" | "r" | "rf" | "fr" | "u"
    )
}

fn read_string(chars: &[char], start: usize, raw: bool) -> Eval<(String, usize)> {
    let quote = chars[start];
    let triple = chars.len() >= start + 3 && chars[start + 1] == quote && chars[start + 2] == quote;
    let mut i = if triple { start + 3 } else { start + 1 };
    let mut value = String::new();

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            if !triple {
                return Ok((value, i + 1));
            }
            if i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote {
                return Ok((value, i + 3));
            }
        }
        if c == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            if raw {
                value.push(c);
                value.push(next);
            } else {
                match next {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    '\n' => {}
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            }
            i += 2;
            continue;
        }
        if c == '\n' && !triple {
            break;
        }
        value.push(c);
        i += 1;
    }

    py_err("SyntaxError", "unterminated string literal")
}

fn read_number(chars: &[char], start: usize) -> Eval<(Token, usize)> {
    let mut i = start;
    let mut text = String::new();
    let mut is_float = false;

    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '_' {
        } else if c == '.' && !is_float {
            is_float = true;
            text.push(c);
        } else if (c == 'e' || c == 'E') && !text.is_empty() {
            is_float = true;
            text.push('e');
            if i + 1 < chars.len() && (chars[i + 1] == '+' || chars[i + 1] == '-') {
                text.push(chars[i + 1]);
                i += 1;
            }
        } else {
            break;
        }
        i += 1;
    }

    if is_float {
        match text.parse::<f64>() {
            Ok(f) => Ok((Token::Float(f), i)),
            Err(_) => py_err("SyntaxError", format!("invalid decimal literal '{}'", text)),
        }
    } else {
        match text.parse::<i64>() {
            Ok(n) => Ok((Token::Int(n), i)),
            // Past i64 range: keep going as a float.
            Err(_) => Ok((Token::Float(text.parse::<f64>().unwrap_or(f64::INFINITY)), i)),
        }
    }
}

fn tokenize(source: &str) -> Eval<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            break;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') && is_string_prefix(&word) {
                let lower = word.to_ascii_lowercase();
                let (value, next) = read_string(&chars, i, lower.contains('r'))?;
                i = next;
                tokens.push(if lower.contains('f') {
                    Token::FStr(value)
                } else {
                    Token::Str(value)
                });
            } else {
                tokens.push(Token::Name(word));
            }
            continue;
        }

        if c == '"' || c == '\'' {
            let (value, next) = read_string(&chars, i, false)?;
            i = next;
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) {
            let (token, next) = read_number(&chars, i)?;
            i = next;
            tokens.push(token);
            continue;
        }

        for op in OPERATORS {
            let len = op.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(op.chars()) {
                tokens.push(Token::Op(op));
                i += len;
                continue 'outer;
            }
        }

        return py_err("SyntaxError", format!("invalid character '{}'", c));
    }

    Ok(tokens)
}

/// A statement's source text and the line it starts on.
struct LogicalLine {
    line: usize,
    text: String,
    indented: bool,
}

/// Split source into statements: bracketed continuations and backslash
/// continuations are joined, `;` separates, comments are dropped.
fn logical_lines(code: &str) -> std::result::Result<Vec<LogicalLine>, (usize, PyError)> {
    let chars: Vec<char> = code.chars().collect();
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut line_no = 1;
    let mut start_line = 1;
    let mut depth: i32 = 0;
    let mut quote: Option<(char, bool)> = None;
    let mut after_semicolon = false;
    let mut i = 0;

    let finish = |current: &mut String, start_line: usize, after_semicolon: bool, lines: &mut Vec<LogicalLine>| {
        let indented = !after_semicolon && current.starts_with([' ', '\t']);
        let text = current.trim().to_string();
        if !text.is_empty() {
            lines.push(LogicalLine {
                line: start_line,
                text,
                indented,
            });
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];

        if let Some((q, triple)) = quote {
            current.push(c);
            if c == '\\' && i + 1 < chars.len() {
                current.push(chars[i + 1]);
                if chars[i + 1] == '\n' {
                    line_no += 1;
                }
                i += 2;
                continue;
            }
            if c == '\n' {
                line_no += 1;
            }
            if c == q {
                if !triple {
                    quote = None;
                } else if i + 2 < chars.len() && chars[i + 1] == q && chars[i + 2] == q {
                    current.push(q);
                    current.push(q);
                    i += 2;
                    quote = None;
                }
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' => {
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                quote = Some((c, triple));
                current.push(c);
                if triple {
                    current.push(c);
                    current.push(c);
                    i += 2;
                }
            }
            '#' => {
                while i + 1 < chars.len() && chars[i + 1] != '\n' {
                    i += 1;
                }
            }
            '\\' if i + 1 < chars.len() && chars[i + 1] == '\n' => {
                current.push(' ');
                line_no += 1;
                i += 1;
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            '\n' => {
                if depth > 0 {
                    current.push(' ');
                } else {
                    finish(&mut current, start_line, after_semicolon, &mut lines);
                    after_semicolon = false;
                    start_line = line_no + 1;
                }
                line_no += 1;
            }
            ';' if depth <= 0 => {
                finish(&mut current, start_line, after_semicolon, &mut lines);
                after_semicolon = true;
                start_line = line_no;
            }
            _ => current.push(c),
        }
        i += 1;
    }
    if quote.is_some() {
        return Err((
            start_line,
            PyError {
                kind: "SyntaxError",
                message: "unterminated string literal".to_string(),
            },
        ));
    }
    if depth > 0 {
        return Err((
            start_line,
            PyError {
                kind: "SyntaxError",
                message: "'(' was never closed".to_string(),
            },
        ));
    }
    finish(&mut current, start_line, after_semicolon, &mut lines);

    Ok(lines)
}

/// First keyword (outside string literals) or block header the evaluator does
/// not model.
fn unsupported_construct(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut word = String::new();
    let mut i = 0;

    while i <= chars.len() {
        let c = chars.get(i).copied();
        match c {
            Some(c) if c.is_alphanumeric() || c == '_' => word.push(c),
            _ => {
                if UNSUPPORTED_KEYWORDS.contains(&word.as_str()) {
                    return Some(word);
                }
                word.clear();
                if let Some(q @ ('"' | '\'')) = c {
                    i += 1;
                    while i < chars.len() && chars[i] != q {
                        if chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
            }
        }
        i += 1;
    }

    if text.ends_with(':') {
        return Some(text.to_string());
    }
    None
}

//
// ================= Interpreter =================
//

#[derive(Default)]
struct Interpreter {
    vars: HashMap<String, Value>,
    out: String,
}

enum Run {
    Completed,
    Skipped(String),
}

enum Statement {
    Assign(Vec<Vec<String>>, usize),
    AugAssign(String, &'static str, usize),
    Expr,
}

impl Interpreter {
    fn run(&mut self, code: &str) -> std::result::Result<Run, (usize, PyError)> {
        let lines = logical_lines(code)?;

        if let Some(construct) = lines.iter().find_map(|line| unsupported_construct(&line.text)) {
            return Ok(Run::Skipped(construct));
        }

        // Python rejects the whole module before running anything.
        let mut compiled = Vec::with_capacity(lines.len());
        for line in &lines {
            if line.indented {
                return Err((
                    line.line,
                    PyError {
                        kind: "IndentationError",
                        message: "unexpected indent".to_string(),
                    },
                ));
            }
            let tokens = tokenize(&line.text).map_err(|e| (line.line, e))?;
            compiled.push((line.line, tokens));
        }

        for (line, tokens) in compiled {
            self.execute(&tokens).map_err(|e| (line, e))?;
        }
        Ok(Run::Completed)
    }

    fn execute(&mut self, tokens: &[Token]) -> Eval<()> {
        let Some(first) = tokens.first() else {
            return Ok(());
        };

        if let Token::Name(word) = first {
            if word == "import" || word == "from" {
                return Ok(());
            }
            if word == "pass" && tokens.len() == 1 {
                return Ok(());
            }
        }

        match classify(tokens)? {
            Statement::Assign(targets, expr_start) => {
                let value = self.eval_tokens(&tokens[expr_start..])?;
                for target in targets {
                    self.bind(&target, value.clone())?;
                }
                Ok(())
            }
            Statement::AugAssign(name, op, expr_start) => {
                let current = self
                    .vars
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| name_error(&name))?;
                let rhs = self.eval_tokens(&tokens[expr_start..])?;
                let value = binary(op.trim_end_matches('='), current, rhs)?;
                self.vars.insert(name, value);
                Ok(())
            }
            Statement::Expr => {
                self.eval_tokens(tokens)?;
                Ok(())
            }
        }
    }

    fn bind(&mut self, target: &[String], value: Value) -> Eval<()> {
        if target.len() == 1 {
            self.vars.insert(target[0].clone(), value);
            return Ok(());
        }

        let items = match value {
            Value::Tuple(items) | Value::List(items) => items,
            other => {
                return py_err(
                    "TypeError",
                    format!("cannot unpack non-iterable {} object", other.type_name()),
                )
            }
        };
        if items.len() != target.len() {
            return py_err(
                "ValueError",
                format!(
                    "not enough values to unpack (expected {}, got {})",
                    target.len(),
                    items.len()
                ),
            );
        }
        for (name, item) in target.iter().zip(items) {
            self.vars.insert(name.clone(), item);
        }
        Ok(())
    }

    fn eval_tokens(&mut self, tokens: &[Token]) -> Eval<Value> {
        let mut parser = Parser {
            tokens,
            pos: 0,
            interp: self,
        };
        let value = parser.expression_list()?;
        if parser.pos != tokens.len() {
            return syntax_error();
        }
        Ok(value)
    }

    fn eval_source(&mut self, source: &str) -> Eval<Value> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return py_err("SyntaxError", "f-string: empty expression not allowed");
        }
        self.eval_tokens(&tokens)
    }

    fn format_fstring(&mut self, raw: &str) -> Eval<String> {
        let chars: Vec<char> = raw.chars().collect();
        let mut out = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '{' {
                if chars.get(i + 1) == Some(&'{') {
                    out.push('{');
                    i += 2;
                    continue;
                }
                let (expr, conversion, spec, next) = split_replacement_field(&chars, i + 1)?;
                let value = self.eval_source(&expr)?;
                let value = match conversion {
                    Some('r') => Value::Str(value.repr()),
                    Some('s') => Value::Str(value.to_str()),
                    _ => value,
                };
                out.push_str(&format_value(&value, &spec)?);
                i = next;
                continue;
            }
            if c == '}' {
                if chars.get(i + 1) == Some(&'}') {
                    out.push('}');
                    i += 2;
                    continue;
                }
                return py_err("SyntaxError", "f-string: single '}' is not allowed");
            }
            out.push(c);
            i += 1;
        }
        Ok(out)
    }
}

fn name_error(name: &str) -> PyError {
    PyError {
        kind: "NameError",
        message: format!("name '{}' is not defined", name),
    }
}

/// Work out whether a statement assigns, augments or just evaluates.
fn classify(tokens: &[Token]) -> Eval<Statement> {
    let mut depth = 0;
    let mut splits = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Op("(") | Token::Op("[") => depth += 1,
            Token::Op(")") | Token::Op("]") => depth -= 1,
            Token::Op(op) if depth == 0 && op.len() >= 2 && op.ends_with('=') && !matches!(*op, "==" | "!=" | "<=" | ">=") => {
                if !splits.is_empty() {
                    return syntax_error();
                }
                let [Token::Name(name)] = &tokens[..i] else {
                    return py_err("SyntaxError", "illegal expression for augmented assignment");
                };
                return Ok(Statement::AugAssign(name.clone(), *op, i + 1));
            }
            Token::Op("=") if depth == 0 => splits.push(i),
            _ => {}
        }
    }

    let Some(&last) = splits.last() else {
        return Ok(Statement::Expr);
    };

    let mut targets = Vec::new();
    let mut start = 0;
    for &split in &splits {
        let mut names = Vec::new();
        for (j, token) in tokens[start..split].iter().enumerate() {
            match (j % 2, token) {
                (0, Token::Name(name)) => names.push(name.clone()),
                (1, Token::Op(",")) => {}
                _ => return py_err("SyntaxError", "cannot assign to expression"),
            }
        }
        if names.is_empty() {
            return syntax_error();
        }
        targets.push(names);
        start = split + 1;
    }

    if last + 1 >= tokens.len() {
        return syntax_error();
    }
    Ok(Statement::Assign(targets, last + 1))
}

/// Returns (expression, conversion, format spec, index after the closing brace).
fn split_replacement_field(
    chars: &[char],
    start: usize,
) -> Eval<(String, Option<char>, String, usize)> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut i = start;
    let mut expr_end = None;
    let mut conversion = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth -= 1,
            '}' if depth > 0 => depth -= 1,
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') && expr_end.is_none() => {
                expr_end = Some(i);
                conversion = chars.get(i + 1).copied();
                i += 2;
                continue;
            }
            ':' if depth == 0 => {
                let expr_end = expr_end.unwrap_or(i);
                let spec_start = i + 1;
                let close = chars[spec_start..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|p| spec_start + p);
                let Some(close) = close else {
                    return py_err("SyntaxError", "f-string: expecting '}'");
                };
                let expr: String = chars[start..expr_end].iter().collect();
                let spec: String = chars[spec_start..close].iter().collect();
                return Ok((expr, conversion, spec, close + 1));
            }
            '}' => {
                let expr_end = expr_end.unwrap_or(i);
                let expr: String = chars[start..expr_end].iter().collect();
                return Ok((expr, conversion, String::new(), i + 1));
            }
            _ => {}
        }
        i += 1;
    }

    py_err("SyntaxError", "f-string: expecting '}'")
}

//
// ================= Expressions =================
//

struct Parser<'t, 'i> {
    tokens: &'t [Token],
    pos: usize,
    interp: &'i mut Interpreter,
}

impl<'t, 'i> Parser<'t, 'i> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn peek_name(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == name)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expect_op(&mut self, op: &str) -> Eval<()> {
        if self.peek_op(op) {
            self.pos += 1;
            Ok(())
        } else {
            py_err("SyntaxError", format!("expected '{}'", op))
        }
    }

    fn at_expression_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::Op(")")) | Some(Token::Op("]")))
    }

    /// `a` or `a, b, ...` (a tuple).
    fn expression_list(&mut self) -> Eval<Value> {
        let first = self.expression()?;
        if !self.peek_op(",") {
            return Ok(first);
        }

        let mut items = vec![first];
        while self.peek_op(",") {
            self.pos += 1;
            if self.at_expression_end() {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Value::Tuple(items))
    }

    fn expression(&mut self) -> Eval<Value> {
        if self.peek_name("not") {
            self.pos += 1;
            let value = self.expression()?;
            return Ok(Value::Bool(!value.truthy()));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Eval<Value> {
        let mut left = self.additive()?;
        let mut result: Option<bool> = None;

        while let Some(Token::Op(op)) = self.peek() {
            if !matches!(*op, "<" | ">" | "<=" | ">=" | "==" | "!=") {
                break;
            }
            self.pos += 1;
            let right = self.additive()?;
            let holds = compare(op, &left, &right)?;
            result = Some(result.unwrap_or(true) && holds);
            left = right;
        }

        Ok(match result {
            Some(b) => Value::Bool(b),
            None => left,
        })
    }

    fn additive(&mut self) -> Eval<Value> {
        let mut left = self.term()?;
        while let Some(Token::Op(op)) = self.peek() {
            if !matches!(*op, "+" | "-") {
                break;
            }
            self.pos += 1;
            let right = self.term()?;
            left = binary(op, left, right)?;
        }
        Ok(left)
    }

    fn term(&mut self) -> Eval<Value> {
        let mut left = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            if !matches!(*op, "*" | "/" | "//" | "%") {
                break;
            }
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Eval<Value> {
        if self.peek_op("-") {
            self.pos += 1;
            let value = self.unary()?;
            return match value.number() {
                Some(Num::Int(i)) => Ok(i
                    .checked_neg()
                    .map(Value::Int)
                    .unwrap_or(Value::Float(-(i as f64)))),
                Some(Num::Float(f)) => Ok(Value::Float(-f)),
                None => py_err(
                    "TypeError",
                    format!("bad operand type for unary -: '{}'", value.type_name()),
                ),
            };
        }
        if self.peek_op("+") {
            self.pos += 1;
            let value = self.unary()?;
            return match value.number() {
                Some(Num::Int(i)) => Ok(Value::Int(i)),
                Some(Num::Float(f)) => Ok(Value::Float(f)),
                None => py_err(
                    "TypeError",
                    format!("bad operand type for unary +: '{}'", value.type_name()),
                ),
            };
        }
        self.power()
    }

    fn power(&mut self) -> Eval<Value> {
        let base = self.postfix()?;
        if self.peek_op("**") {
            self.pos += 1;
            let exponent = self.unary()?;
            return binary("**", base, exponent);
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Eval<Value> {
        let mut value = self.primary()?;

        loop {
            if self.peek_op(".") {
                self.pos += 1;
                let Some(Token::Name(attr)) = self.advance() else {
                    return syntax_error();
                };
                if !self.peek_op("(") {
                    return py_err(
                        "AttributeError",
                        format!("'{}' object has no attribute '{}'", value.type_name(), attr),
                    );
                }
                let (args, kwargs) = self.call_args()?;
                value = call_method(value, attr, args, kwargs)?;
            } else if self.peek_op("[") {
                self.pos += 1;
                let index = self.expression()?;
                self.expect_op("]")?;
                value = subscript(value, index)?;
            } else {
                return Ok(value);
            }
        }
    }

    fn primary(&mut self) -> Eval<Value> {
        let Some(token) = self.advance() else {
            return py_err("SyntaxError", "unexpected end of statement");
        };

        match token {
            Token::Int(i) => Ok(Value::Int(*i)),
            Token::Float(f) => Ok(Value::Float(*f)),
            Token::Str(s) => {
                let mut s = s.clone();
                // Adjacent literals concatenate.
                while let Some(Token::Str(next)) = self.peek() {
                    s.push_str(next);
                    self.pos += 1;
                }
                Ok(Value::Str(s))
            }
            Token::FStr(raw) => Ok(Value::Str(self.interp.format_fstring(raw)?)),
            Token::Op("(") => {
                if self.peek_op(")") {
                    self.pos += 1;
                    return Ok(Value::Tuple(Vec::new()));
                }
                let value = self.expression_list()?;
                self.expect_op(")")?;
                Ok(value)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                while !self.peek_op("]") {
                    items.push(self.expression()?);
                    if !self.peek_op(",") {
                        break;
                    }
                    self.pos += 1;
                }
                self.expect_op("]")?;
                Ok(Value::List(items))
            }
            Token::Name(name) => self.name(name),
            _ => syntax_error(),
        }
    }

    fn name(&mut self, name: &str) -> Eval<Value> {
        match name {
            "True" => return Ok(Value::Bool(true)),
            "False" => return Ok(Value::Bool(false)),
            "None" => return Ok(Value::None),
            _ => {}
        }

        if name == "math" && self.peek_op(".") && !self.interp.vars.contains_key("math") {
            self.pos += 1;
            let Some(Token::Name(attr)) = self.advance() else {
                return syntax_error();
            };
            if self.peek_op("(") {
                let (args, kwargs) = self.call_args()?;
                reject_kwargs(&format!("math.{}", attr), &kwargs)?;
                return call_math(attr, args);
            }
            return math_constant(attr);
        }

        if self.peek_op("(") {
            if let Some(value) = self.interp.vars.get(name) {
                return py_err(
                    "TypeError",
                    format!("'{}' object is not callable", value.type_name()),
                );
            }
            let (args, kwargs) = self.call_args()?;
            return self.call_builtin(name, args, kwargs);
        }

        self.interp
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| name_error(name))
    }

    fn call_args(&mut self) -> Eval<(Vec<Value>, Vec<(String, Value)>)> {
        self.expect_op("(")?;
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        while !self.peek_op(")") {
            let keyword = match (self.peek(), self.tokens.get(self.pos + 1)) {
                (Some(Token::Name(name)), Some(Token::Op("="))) => Some(name.clone()),
                _ => None,
            };
            if let Some(keyword) = keyword {
                self.pos += 2;
                kwargs.push((keyword, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return py_err("SyntaxError", "positional argument follows keyword argument");
                }
                args.push(self.expression()?);
            }
            if !self.peek_op(",") {
                break;
            }
            self.pos += 1;
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Eval<Value> {
        if name == "print" {
            let mut sep = " ".to_string();
            let mut end = "\n".to_string();
            for (key, value) in kwargs {
                match key.as_str() {
                    "sep" => sep = value.to_str(),
                    "end" => end = value.to_str(),
                    "flush" | "file" => {}
                    other => {
                        return py_err(
                            "TypeError",
                            format!("'{}' is an invalid keyword argument for print()", other),
                        )
                    }
                }
            }
            let line = args.iter().map(Value::to_str).collect::<Vec<_>>().join(&sep);
            self.interp.out.push_str(&line);
            self.interp.out.push_str(&end);
            return Ok(Value::None);
        }

        reject_kwargs(name, &kwargs)?;
        // `from math import sqrt` style imports are ignored, so bare math names resolve here.
        if MATH_FUNCTIONS.contains(&name) {
            return call_math(name, args);
        }
        call_function(name, args)
    }
}

fn reject_kwargs(name: &str, kwargs: &[(String, Value)]) -> Eval<()> {
    match kwargs.first() {
        Some((key, _)) => py_err(
            "TypeError",
            format!("{}() got an unexpected keyword argument '{}'", name, key),
        ),
        None => Ok(()),
    }
}

fn expect_arity(name: &str, args: &[Value], min: usize, max: usize) -> Eval<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return py_err(
            "TypeError",
            format!("{}() takes {} arguments ({} given)", name, expected, args.len()),
        );
    }
    Ok(())
}

fn float_arg(name: &str, value: &Value) -> Eval<f64> {
    value.as_f64().map_or_else(
        || {
            py_err(
                "TypeError",
                format!("{}() argument must be a real number, not '{}'", name, value.type_name()),
            )
        },
        Ok,
    )
}

fn call_function(name: &str, args: Vec<Value>) -> Eval<Value> {
    match name {
        "abs" => {
            expect_arity(name, &args, 1, 1)?;
            match args[0].number() {
                Some(Num::Int(i)) => Ok(Value::Int(i.abs())),
                Some(Num::Float(f)) => Ok(Value::Float(f.abs())),
                None => py_err(
                    "TypeError",
                    format!("bad operand type for abs(): '{}'", args[0].type_name()),
                ),
            }
        }
        "round" => {
            expect_arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(Value::Int(n)) => Some(*n),
                Some(other) => {
                    return py_err(
                        "TypeError",
                        format!("'{}' object cannot be interpreted as an integer", other.type_name()),
                    )
                }
            };
            match (args[0].number(), ndigits) {
                (Some(Num::Int(i)), _) => Ok(Value::Int(i)),
                (Some(Num::Float(f)), None) => float_to_int(round_half_even(f)),
                (Some(Num::Float(f)), Some(n)) if n >= 0 => {
                    let rounded = format!("{:.*}", n as usize, f).parse::<f64>().unwrap_or(f);
                    Ok(Value::Float(rounded))
                }
                (Some(Num::Float(f)), Some(n)) => {
                    let scale = 10f64.powi((-n) as i32);
                    Ok(Value::Float(round_half_even(f / scale) * scale))
                }
                (None, _) => py_err(
                    "TypeError",
                    format!("type {} doesn't define __round__ method", args[0].type_name()),
                ),
            }
        }
        "min" | "max" => {
            let mut items = args;
            if let [Value::List(inner) | Value::Tuple(inner)] = items.as_mut_slice() {
                items = std::mem::take(inner);
            }
            if items.is_empty() {
                return py_err("ValueError", format!("{}() arg is an empty sequence", name));
            }
            let mut best = items[0].clone();
            for item in items.into_iter().skip(1) {
                let replace = if name == "min" {
                    compare("<", &item, &best)?
                } else {
                    compare(">", &item, &best)?
                };
                if replace {
                    best = item;
                }
            }
            Ok(best)
        }
        "sum" => {
            expect_arity(name, &args, 1, 2)?;
            let items = match &args[0] {
                Value::List(items) | Value::Tuple(items) => items.clone(),
                other => {
                    return py_err(
                        "TypeError",
                        format!("'{}' object is not iterable", other.type_name()),
                    )
                }
            };
            let start = args.get(1).cloned().unwrap_or(Value::Int(0));
            items.into_iter().try_fold(start, |acc, item| binary("+", acc, item))
        }
        "len" => {
            expect_arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) | Value::Tuple(items) => Ok(Value::Int(items.len() as i64)),
                other => py_err(
                    "TypeError",
                    format!("object of type '{}' has no len()", other.type_name()),
                ),
            }
        }
        "int" => {
            expect_arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Str(s)) => s.trim().replace('_', "").parse::<i64>().map(Value::Int).or_else(|_| {
                    py_err(
                        "ValueError",
                        format!("invalid literal for int() with base 10: '{}'", s),
                    )
                }),
                Some(value) => match value.number() {
                    Some(Num::Int(i)) => Ok(Value::Int(i)),
                    Some(Num::Float(f)) => float_to_int(f.trunc()),
                    None => py_err(
                        "TypeError",
                        format!(
                            "int() argument must be a string or a real number, not '{}'",
                            value.type_name()
                        ),
                    ),
                },
            }
        }
        "float" => {
            expect_arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().replace('_', "").parse::<f64>().map(Value::Float).or_else(|_| {
                    py_err("ValueError", format!("could not convert string to float: '{}'", s))
                }),
                Some(value) => Ok(Value::Float(float_arg(name, value)?)),
            }
        }
        "str" => {
            expect_arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.first().map(Value::to_str).unwrap_or_default()))
        }
        "bool" => {
            expect_arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
        }
        "pow" => {
            expect_arity(name, &args, 2, 2)?;
            let mut args = args.into_iter();
            match (args.next(), args.next()) {
                (Some(base), Some(exp)) => binary("**", base, exp),
                _ => syntax_error(),
            }
        }
        "format" => {
            expect_arity(name, &args, 1, 2)?;
            let spec = args.get(1).map(Value::to_str).unwrap_or_default();
            Ok(Value::Str(format_value(&args[0], &spec)?))
        }
        "list" | "tuple" => {
            expect_arity(name, &args, 0, 1)?;
            let items = match args.into_iter().next() {
                None => Vec::new(),
                Some(Value::List(items)) | Some(Value::Tuple(items)) => items,
                Some(Value::Str(s)) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                Some(other) => {
                    return py_err(
                        "TypeError",
                        format!("'{}' object is not iterable", other.type_name()),
                    )
                }
            };
            Ok(if name == "list" {
                Value::List(items)
            } else {
                Value::Tuple(items)
            })
        }
        _ => Err(name_error(name)),
    }
}

fn call_method(
    receiver: Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval<Value> {
    match (&receiver, method) {
        (Value::Str(template), "format") => {
            reject_kwargs("format", &kwargs)?;
            Ok(Value::Str(str_format(template, &args)?))
        }
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Float(f), "is_integer") => Ok(Value::Bool(f.fract() == 0.0)),
        (Value::List(_), "append") => py_err(
            "NotImplementedError",
            "in-place list mutation is not supported",
        ),
        _ => py_err(
            "AttributeError",
            format!(
                "'{}' object has no attribute '{}'",
                receiver.type_name(),
                method
            ),
        ),
    }
}

fn call_math(name: &str, args: Vec<Value>) -> Eval<Value> {
    let qualified = format!("math.{}", name);
    let unary = |args: &[Value]| -> Eval<f64> {
        expect_arity(&qualified, args, 1, 1)?;
        float_arg(&qualified, &args[0])
    };

    let domain = || -> Eval<Value> { py_err("ValueError", "math domain error") };

    match name {
        "sqrt" => {
            let x = unary(&args)?;
            if x < 0.0 {
                return domain();
            }
            Ok(Value::Float(x.sqrt()))
        }
        "log" => {
            expect_arity(&qualified, &args, 1, 2)?;
            let x = float_arg(&qualified, &args[0])?;
            if x <= 0.0 {
                return domain();
            }
            match args.get(1) {
                Some(base) => {
                    let base = float_arg(&qualified, base)?;
                    if base <= 0.0 || base == 1.0 {
                        return domain();
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
                None => Ok(Value::Float(x.ln())),
            }
        }
        "log10" | "log2" => {
            let x = unary(&args)?;
            if x <= 0.0 {
                return domain();
            }
            Ok(Value::Float(if name == "log10" { x.log10() } else { x.log2() }))
        }
        "exp" => Ok(Value::Float(unary(&args)?.exp())),
        "fabs" => Ok(Value::Float(unary(&args)?.abs())),
        "floor" => float_to_int(unary(&args)?.floor()),
        "ceil" => float_to_int(unary(&args)?.ceil()),
        "trunc" => float_to_int(unary(&args)?.trunc()),
        "pow" => {
            expect_arity(&qualified, &args, 2, 2)?;
            let base = float_arg(&qualified, &args[0])?;
            let exp = float_arg(&qualified, &args[1])?;
            Ok(Value::Float(base.powf(exp)))
        }
        "isclose" => {
            expect_arity(&qualified, &args, 2, 2)?;
            let a = float_arg(&qualified, &args[0])?;
            let b = float_arg(&qualified, &args[1])?;
            Ok(Value::Bool((a - b).abs() <= 1e-9 * a.abs().max(b.abs())))
        }
        _ => py_err(
            "AttributeError",
            format!("module 'math' has no attribute '{}'", name),
        ),
    }
}

fn math_constant(name: &str) -> Eval<Value> {
    match name {
        "pi" => Ok(Value::Float(std::f64::consts::PI)),
        "e" => Ok(Value::Float(std::f64::consts::E)),
        "tau" => Ok(Value::Float(std::f64::consts::TAU)),
        "inf" => Ok(Value::Float(f64::INFINITY)),
        "nan" => Ok(Value::Float(f64::NAN)),
        _ => py_err(
            "AttributeError",
            format!("module 'math' has no attribute '{}'", name),
        ),
    }
}

fn float_to_int(f: f64) -> Eval<Value> {
    if f.is_nan() {
        return py_err("ValueError", "cannot convert float NaN to integer");
    }
    if f.is_infinite() {
        return py_err("OverflowError", "cannot convert float infinity to integer");
    }
    if f.abs() >= 9.2e18 {
        return py_err("OverflowError", "integer out of supported range");
    }
    Ok(Value::Int(f as i64))
}

fn subscript(value: Value, index: Value) -> Eval<Value> {
    let i = match index {
        Value::Int(i) => i,
        other => {
            return py_err(
                "TypeError",
                format!("indices must be integers, not {}", other.type_name()),
            )
        }
    };

    let items: Vec<Value> = match value {
        Value::List(items) | Value::Tuple(items) => items,
        Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
        other => {
            return py_err(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )
        }
    };

    let len = items.len() as i64;
    let position = if i < 0 { len + i } else { i };
    if position < 0 || position >= len {
        return py_err("IndexError", "index out of range");
    }
    Ok(items[position as usize].clone())
}

fn compare(op: &str, left: &Value, right: &Value) -> Eval<bool> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return Ok(match op {
            "<" => a < b,
            ">" => a > b,
            "<=" => a <= b,
            ">=" => a >= b,
            "==" => a == b,
            _ => a != b,
        });
    }
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Ok(match op {
            "<" => a < b,
            ">" => a > b,
            "<=" => a <= b,
            ">=" => a >= b,
            "==" => a == b,
            _ => a != b,
        });
    }
    match op {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        _ => py_err(
            "TypeError",
            format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op,
                left.type_name(),
                right.type_name()
            ),
        ),
    }
}

fn unsupported(op: &str, left: &Value, right: &Value) -> PyError {
    PyError {
        kind: "TypeError",
        message: format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op,
            left.type_name(),
            right.type_name()
        ),
    }
}

fn binary(op: &str, left: Value, right: Value) -> Eval<Value> {
    match (&left, &right) {
        (Value::Str(a), Value::Str(b)) if op == "+" => return Ok(Value::Str(format!("{}{}", a, b))),
        (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) if op == "*" => {
            return Ok(Value::Str(s.repeat((*n).max(0) as usize)))
        }
        (Value::List(a), Value::List(b)) if op == "+" => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (Value::Str(_), other) if op == "+" && other.number().is_some() => {
            return py_err(
                "TypeError",
                format!("can only concatenate str (not \"{}\") to str", other.type_name()),
            )
        }
        _ => {}
    }

    let (Some(a), Some(b)) = (left.number(), right.number()) else {
        return Err(unsupported(op, &left, &right));
    };

    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_binary(op, x, y),
        _ => float_binary(op, a.to_f64(), b.to_f64()),
    }
}

fn int_binary(op: &str, x: i64, y: i64) -> Eval<Value> {
    let checked = match op {
        "+" => x.checked_add(y),
        "-" => x.checked_sub(y),
        "*" => x.checked_mul(y),
        "/" => {
            if y == 0 {
                return py_err("ZeroDivisionError", "division by zero");
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        "//" | "%" => {
            if y == 0 {
                return py_err("ZeroDivisionError", "integer division or modulo by zero");
            }
            let Some(mut q) = x.checked_div(y) else {
                return float_binary(op, x as f64, y as f64);
            };
            let mut r = x % y;
            if r != 0 && ((r < 0) != (y < 0)) {
                q -= 1;
                r += y;
            }
            return Ok(Value::Int(if op == "//" { q } else { r }));
        }
        "**" => {
            if y < 0 {
                if x == 0 {
                    return py_err(
                        "ZeroDivisionError",
                        "0.0 cannot be raised to a negative power",
                    );
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        _ => return py_err("SyntaxError", format!("unknown operator '{}'", op)),
    };

    match checked {
        Some(v) => Ok(Value::Int(v)),
        None => float_binary(op, x as f64, y as f64),
    }
}

fn float_binary(op: &str, x: f64, y: f64) -> Eval<Value> {
    let value = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => {
            if y == 0.0 {
                return py_err("ZeroDivisionError", "float division by zero");
            }
            x / y
        }
        "//" => {
            if y == 0.0 {
                return py_err("ZeroDivisionError", "float floor division by zero");
            }
            (x / y).floor()
        }
        "%" => {
            if y == 0.0 {
                return py_err("ZeroDivisionError", "float modulo");
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                r + y
            } else {
                r
            }
        }
        "**" => {
            if x == 0.0 && y < 0.0 {
                return py_err(
                    "ZeroDivisionError",
                    "0.0 cannot be raised to a negative power",
                );
            }
            if x < 0.0 && y.fract() != 0.0 {
                return py_err("ValueError", "complex results are not supported");
            }
            x.powf(y)
        }
        _ => return py_err("SyntaxError", format!("unknown operator '{}'", op)),
    };
    Ok(Value::Float(value))
}

//
// ================= Formatting =================
//

/// `str.format` with `{}`, `{0}` and `{:spec}` fields.
fn str_format(template: &str, args: &[Value]) -> Eval<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut auto_index = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            out.push('{');
            i += 2;
            continue;
        }
        if c == '}' && chars.get(i + 1) == Some(&'}') {
            out.push('}');
            i += 2;
            continue;
        }
        if c != '{' {
            out.push(c);
            i += 1;
            continue;
        }

        let Some(close) = chars[i..].iter().position(|&c| c == '}').map(|p| i + p) else {
            return py_err("ValueError", "Single '{' encountered in format string");
        };
        let field: String = chars[i + 1..close].iter().collect();
        let (name, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));

        let index = if name.is_empty() {
            auto_index += 1;
            auto_index - 1
        } else {
            name.parse::<usize>().or_else(|_| {
                py_err("KeyError", format!("'{}'", name))
            })?
        };
        let value = args.get(index).ok_or_else(|| PyError {
            kind: "IndexError",
            message: format!("Replacement index {} out of range for positional args tuple", index),
        })?;
        out.push_str(&format_value(value, spec)?);
        i = close + 1;
    }
    Ok(out)
}

#[derive(Debug, Default)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Eval<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = FormatSpec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        parsed.align = Some(chars[0]);
        i = 1;
    }

    if i < chars.len() && matches!(chars[i], '+' | '-' | ' ') {
        parsed.sign = Some(chars[i]);
        i += 1;
    }
    if i < chars.len() && chars[i] == '#' {
        i += 1;
    }
    if i < chars.len() && chars[i] == '0' {
        parsed.zero = true;
        i += 1;
    }

    let width_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i > width_start {
        parsed.width = chars[width_start..i]
            .iter()
            .collect::<String>()
            .parse()
            .unwrap_or(0);
    }

    if i < chars.len() && matches!(chars[i], ',' | '_') {
        parsed.grouping = Some(chars[i]);
        i += 1;
    }

    if i < chars.len() && chars[i] == '.' {
        i += 1;
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return py_err("ValueError", "Format specifier missing precision");
        }
        parsed.precision = chars[start..i].iter().collect::<String>().parse().ok();
    }

    if i < chars.len() {
        parsed.kind = Some(chars[i]);
        i += 1;
    }
    if i != chars.len() {
        return py_err("ValueError", format!("Invalid format specifier '{}'", spec));
    }
    Ok(parsed)
}

fn group_digits(digits: &str, separator: char) -> String {
    let (int_part, rest) = match digits.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => digits.split_at(pos),
        None => (digits, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

/// Python's `%e` style exponent: `1.500000e+03`.
fn format_exponent(x: f64, precision: usize, upper: bool) -> String {
    let sci = format!("{:.*e}", precision, x);
    let formatted = match sci.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => sci,
    };
    if upper {
        formatted.to_uppercase()
    } else {
        formatted
    }
}

fn strip_fraction_zeros(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exp)) if mantissa.contains('.') => {
            let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
            format!("{}e{}", mantissa, exp)
        }
        None if s.contains('.') => s.trim_end_matches('0').trim_end_matches('.').to_string(),
        _ => s.to_string(),
    }
}

fn format_general(x: f64, precision: usize) -> String {
    let precision = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    let exp = x.abs().log10().floor() as i32;
    if exp >= -4 && exp < precision as i32 {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, x))
    } else {
        strip_fraction_zeros(&format_exponent(x, precision - 1, false))
    }
}

fn format_value(value: &Value, spec: &str) -> Eval<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let spec = parse_spec(spec)?;

    let (body, numeric) = match (value, spec.kind) {
        (Value::Str(s), None | Some('s')) => {
            let s = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            };
            (s, false)
        }
        (Value::Str(_), Some(kind)) => {
            return py_err(
                "ValueError",
                format!("Unknown format code '{}' for object of type 'str'", kind),
            )
        }
        (value, kind) => {
            let Some(number) = value.number() else {
                return py_err(
                    "TypeError",
                    format!("unsupported format string passed to {}.__format__", value.type_name()),
                );
            };
            (format_number(number, kind, spec.precision)?, true)
        }
    };

    let (negative, magnitude) = match body.strip_prefix('-') {
        Some(rest) if numeric => (true, rest.to_string()),
        _ => (false, body),
    };

    let magnitude = match spec.grouping {
        Some(separator) if numeric => group_digits(&magnitude, separator),
        _ => magnitude,
    };

    let sign = if negative {
        "-"
    } else if numeric {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    } else {
        ""
    };

    let (fill, align) = if spec.zero && spec.align.is_none() && numeric {
        ('0', '=')
    } else {
        (
            spec.fill.unwrap_or(' '),
            spec.align.unwrap_or(if numeric { '>' } else { '<' }),
        )
    };

    let len = sign.chars().count() + magnitude.chars().count();
    let padding = spec.width.saturating_sub(len);
    let pad = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();

    Ok(match align {
        '<' => format!("{}{}{}", sign, magnitude, pad(padding)),
        '^' => format!(
            "{}{}{}{}",
            pad(padding / 2),
            sign,
            magnitude,
            pad(padding - padding / 2)
        ),
        '=' => format!("{}{}{}", sign, pad(padding), magnitude),
        _ => format!("{}{}{}", pad(padding), sign, magnitude),
    })
}

fn format_number(number: Num, kind: Option<char>, precision: Option<usize>) -> Eval<String> {
    Ok(match (kind, number) {
        (None | Some('d') | Some('n'), Num::Int(i)) if precision.is_none() => i.to_string(),
        (Some('d'), Num::Float(_)) => {
            return py_err(
                "ValueError",
                "Unknown format code 'd' for object of type 'float'",
            )
        }
        (Some('f') | Some('F'), n) => format!("{:.*}", precision.unwrap_or(6), n.to_f64()),
        (Some('%'), n) => format!("{:.*}%", precision.unwrap_or(6), n.to_f64() * 100.0),
        (Some('e') | Some('E'), n) => {
            format_exponent(n.to_f64(), precision.unwrap_or(6), kind == Some('E'))
        }
        (Some('g') | Some('G'), n) => format_general(n.to_f64(), precision.unwrap_or(6)),
        (None, Num::Float(f)) => match precision {
            Some(p) => {
                let general = format_general(f, p);
                if general.contains(['.', 'e', 'n', 'i']) {
                    general
                } else {
                    format!("{}.0", general)
                }
            }
            None => float_repr(f),
        },
        (None, Num::Int(i)) => format_general(i as f64, precision.unwrap_or(6)),
        (Some(other), n) => {
            let type_name = match n {
                Num::Int(_) => "int",
                Num::Float(_) => "float",
            };
            return py_err(
                "ValueError",
                format!(
                    "Unknown format code '{}' for object of type '{}'",
                    other, type_name
                ),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: &str) -> String {
        InlineEvaluator::evaluate(code)
    }

    #[test]
    fn test_growth_rate_script() {
        let code = r#"
import math

revenue_2019 = 120
revenue_2020 = 150
growth = (revenue_2020 - revenue_2019) / revenue_2019 * 100
print(round(growth, 2))
"#;
        assert_eq!(run(code), "25.0\n");
    }

    #[test]
    fn test_fstrings_and_format_specs() {
        let code = "x = 1234.5678\nratio = 0.256\nprint(f\"Total: {x:,.2f}\", f'{ratio:.1%}', f\"{x!r}\")";
        assert_eq!(run(code), "Total: 1,234.57 25.6% 1234.5678\n");

        assert_eq!(run("print('{:.3f} and {}'.format(2/3, 7))"), "0.667 and 7\n");
        assert_eq!(run("print(f'{42:>5}|{\"ab\":<4}|{3.0}')"), "   42|ab  |3.0\n");
    }

    #[test]
    fn test_python_numeric_semantics() {
        assert_eq!(run("print(7 // 2, -7 // 2, -7 % 3, 2 ** -1, 10 / 5)"), "3 -4 2 0.5 2.0\n");
        assert_eq!(run("print(-2 ** 2, round(2.5), round(3.5), abs(-3))"), "-4 2 4 3\n");
        assert_eq!(run("print(0.1 + 0.2)"), "0.30000000000000004\n");
        assert_eq!(run("print(1e20, 1.5e-5, math.sqrt(16))"), "1e+20 1.5e-05 4.0\n");
    }

    #[test]
    fn test_multiline_parentheses_and_augmented_assignment() {
        let code = "total = (\n    10 +\n    5\n)\ntotal += 5  # bump\ntotal *= 2\na, b = 1, 2\nprint(total, a + b, sep=', ')";
        assert_eq!(run(code), "40, 3\n");
    }

    #[test]
    fn test_builtins() {
        let code = "values = [3, 1.5, 2]\nprint(min(values), max(4, 9), sum(values), len(values), int('12'), float('2.5'))";
        assert_eq!(run(code), "1.5 9 6.5 3 12 2.5\n");
    }

    #[test]
    fn test_name_error_keeps_prior_output() {
        let output = run("print('start')\nprint(missing)");
        assert!(output.starts_with("start\nTraceback (most recent call last):"));
        assert!(output.contains("line 2"));
        assert!(output.contains("NameError: name 'missing' is not defined"));
    }

    #[test]
    fn test_zero_division() {
        let output = run("x = 1 / 0");
        assert!(output.contains("ZeroDivisionError: division by zero"));
        assert!(output.contains("Traceback"));
    }

    #[test]
    fn test_syntax_errors_are_reported_before_running() {
        let output = run("print('never')\nx = (1 +\n");
        assert!(!output.contains("never"));

        let output = run("print(1)\n  y = 2");
        assert!(output.contains("IndentationError: unexpected indent"));
        assert!(!output.starts_with('1'));
    }

    #[test]
    fn test_control_flow_is_skipped_without_error() {
        let output = run("def growth(a, b):\n    return (b - a) / a * 100\nprint(growth(120, 150))");
        assert_eq!(output, format!("{} `def`\n", SKIPPED_NOTICE));

        let output = run("values = [1, 2]\nprint(sum([v for v in values]))");
        assert!(output.ends_with("`for`\n"));
        assert!(!output.contains("Error"));

        let output = run("a = 1\nif a > 0:\n    print('positive')");
        assert!(output.starts_with(SKIPPED_NOTICE));
        assert!(!output.contains("Traceback"));

        // Keywords inside string literals are just text.
        assert_eq!(run("print('for if else')"), "for if else\n");
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(run("from math import sqrt\nprint(sqrt(9), math.floor(2.7), math.log10(1000))"), "3.0 2 3.0\n");
        assert!(run("print(math.sqrt(-1))").contains("ValueError: math domain error"));
    }

    #[test]
    fn test_type_errors() {
        assert!(run("print('a' + 1)").contains("TypeError: can only concatenate str"));
        assert!(run("x = 3\nx(1)").contains("TypeError: 'int' object is not callable"));
    }

    #[tokio::test]
    async fn test_runs_on_blocking_pool() {
        let output = InlineEvaluator::new().run("print(6 * 7)").await;
        assert_eq!(output, "42\n");
    }
}
