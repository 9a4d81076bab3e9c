//! The code-step sandbox: a small explicit-AST interpreter for the tiny
//! imperative language workflow code steps are written in.
//!
//! Hand-written recursive descent, with an explicit error variant on every
//! parse failure. There is no host `eval`: every construct is parsed into an
//! explicit AST node and walked by [`Sandbox::run`].
//!
//! Seven defense-in-depth layers, each implemented at a distinct point:
//!
//! 1. static import gate — the grammar has no `import` statement; the
//!    keyword is rejected at lex time (`CODE_SECURITY`).
//! 2. builtin/call-target gate — `context.tools.call(name, params)` is the
//!    only callable form; any other call expression is rejected at parse
//!    time (`CODE_SECURITY`).
//! 3. tool whitelist — dispatch goes through [`ToolBridge`], which is the
//!    caller's own whitelisted, registry-backed implementation; it also
//!    rejects `python_exec`, since a code step invoking it would be a code
//!    step invoking code.
//! 4. call budget — [`SandboxLimits::tool_call_budget`] caps
//!    `context.tools.call` invocations per run (default 10, `CODE_RUNTIME`
//!    on exceed).
//! 5. JSON-serializable parameters — `context.tools.call`'s second argument
//!    must evaluate to a JSON object; anything else is `PARAM_INVALID`.
//! 6. wall-clock timeout — elapsed time is checked between statements and
//!    at every loop iteration (`CODE_TIMEOUT`).
//! 7. runaway-loop prevention — a hard cap on loop iterations and on total
//!    statements executed stands in for recursion limiting in a language
//!    with no user-defined functions to recurse through (`CODE_RUNTIME`).
//!
//! Every other parse failure (malformed literals, unbalanced braces,
//! unexpected tokens) is `CODE_SYNTAX`; every other evaluation failure
//! (undefined variables, type mismatches, division by zero) is
//! `CODE_RUNTIME`.

use std::time::{Duration, Instant};

use dael_types::{DaelError, ErrorCode};
use serde_json::{Map, Value};

/// Bridges `tools.call` to a real tool registry/invoker. Implementations are
/// expected to enforce their own whitelist; the sandbox only enforces budget
/// and parameter shape.
pub trait ToolBridge {
    fn call(&mut self, name: &str, params: Value) -> Result<Value, DaelError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub tool_call_budget: u32,
    pub timeout: Duration,
    pub max_loop_iterations: u64,
    pub max_statements: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            tool_call_budget: 10,
            timeout: Duration::from_secs(5),
            max_loop_iterations: 10_000,
            max_statements: 100_000,
        }
    }
}

fn syntax_error(message: impl Into<String>) -> DaelError {
    DaelError::new(ErrorCode::CodeSyntax, message)
}

fn runtime_error(message: impl Into<String>) -> DaelError {
    DaelError::new(ErrorCode::CodeRuntime, message)
}

fn security_error(message: impl Into<String>) -> DaelError {
    DaelError::new(ErrorCode::CodeSecurity, message)
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    If,
    Else,
    For,
    In,
    Return,
    Let,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Semicolon,
    Eof,
}

fn lex(source: &str) -> Result<Vec<Token>, DaelError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                    } else {
                        s.push(chars[i]);
                        i += 1;
                    }
                }
                if i >= chars.len() {
                    return Err(syntax_error("unterminated string literal"));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| syntax_error(format!("invalid number literal '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "for" => Token::For,
                    "in" => Token::In,
                    "return" => Token::Return,
                    "let" => Token::Let,
                    "import" | "from" | "__import__" | "exec" | "eval" => {
                        return Err(security_error(format!("'{word}' is not permitted in sandboxed code")))
                    }
                    _ => Token::Ident(word),
                });
            }
            other => return Err(syntax_error(format!("unexpected character '{other}'"))),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    ToolCall(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Assign(String, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    For(String, Expr, Vec<Stmt>),
    Return(Expr),
    Expr(Expr),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), DaelError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(syntax_error(format!("expected {expected:?}, found {:?}", self.peek())))
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, DaelError> {
        let mut statements = Vec::new();
        while *self.peek() != Token::Eof {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, DaelError> {
        self.expect(&Token::LBrace)?;
        let mut statements = Vec::new();
        while *self.peek() != Token::RBrace {
            if *self.peek() == Token::Eof {
                return Err(syntax_error("unterminated block"));
            }
            statements.push(self.parse_statement()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt, DaelError> {
        match self.peek().clone() {
            Token::Let => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(&Token::Assign)?;
                let value = self.parse_expr()?;
                self.skip_semicolon();
                Ok(Stmt::Let(name, value))
            }
            Token::Return => {
                self.advance();
                let value = self.parse_expr()?;
                self.skip_semicolon();
                Ok(Stmt::Return(value))
            }
            Token::If => {
                self.advance();
                let condition = self.parse_expr()?;
                let then_branch = self.parse_block()?;
                let else_branch = if *self.peek() == Token::Else {
                    self.advance();
                    if *self.peek() == Token::If {
                        vec![self.parse_statement()?]
                    } else {
                        self.parse_block()?
                    }
                } else {
                    Vec::new()
                };
                Ok(Stmt::If(condition, then_branch, else_branch))
            }
            Token::For => {
                self.advance();
                let binding = self.expect_ident()?;
                self.expect(&Token::In)?;
                let iterable = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For(binding, iterable, body))
            }
            Token::Ident(name) => {
                // assignment or expression statement; disambiguate by lookahead.
                if self.tokens.get(self.pos + 1) == Some(&Token::Assign) {
                    self.advance();
                    self.advance();
                    let value = self.parse_expr()?;
                    self.skip_semicolon();
                    Ok(Stmt::Assign(name, value))
                } else {
                    let expr = self.parse_expr()?;
                    self.skip_semicolon();
                    Ok(Stmt::Expr(expr))
                }
            }
            _ => {
                let expr = self.parse_expr()?;
                self.skip_semicolon();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn skip_semicolon(&mut self) {
        if *self.peek() == Token::Semicolon {
            self.advance();
        }
    }

    fn expect_ident(&mut self) -> Result<String, DaelError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(syntax_error(format!("expected identifier, found {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, DaelError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_equality()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary(Box::new(left), BinOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, DaelError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, DaelError> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Not => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, DaelError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let field = self.expect_ident()?;
                    if *self.peek() == Token::LParen {
                        // the only callable form is `context.tools.call(name, params)`.
                        let is_tools_call = field == "call"
                            && matches!(&expr, Expr::Field(base, name) if name == "tools" && matches!(base.as_ref(), Expr::Var(v) if v == "context"));
                        if !is_tools_call {
                            return Err(security_error(format!(
                                "call expressions are only permitted as 'context.tools.call(...)', found '.{field}(...)'"
                            )));
                        }
                        self.advance();
                        let name_arg = self.parse_expr()?;
                        self.expect(&Token::Comma)?;
                        let params_arg = self.parse_expr()?;
                        self.expect(&Token::RParen)?;
                        expr = Expr::ToolCall(Box::new(name_arg), Box::new(params_arg));
                    } else {
                        expr = Expr::Field(Box::new(expr), field);
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    return Err(security_error("bare function calls are not permitted in sandboxed code"));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, DaelError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    items.push(self.parse_expr()?);
                    while *self.peek() == Token::Comma {
                        self.advance();
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            other => Err(syntax_error(format!("unexpected token {other:?}"))),
        }
    }
}

fn parse(source: &str) -> Result<Vec<Stmt>, DaelError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

enum Flow {
    Normal,
    Return(Value),
}

pub struct Sandbox<'a> {
    variables: Map<String, Value>,
    bridge: &'a mut dyn ToolBridge,
    limits: SandboxLimits,
    start: Instant,
    tool_calls_made: u32,
    statements_executed: u64,
}

impl<'a> Sandbox<'a> {
    pub fn new(variables: Map<String, Value>, bridge: &'a mut dyn ToolBridge, limits: SandboxLimits) -> Self {
        Self {
            variables,
            bridge,
            limits,
            start: Instant::now(),
            tool_calls_made: 0,
            statements_executed: 0,
        }
    }

    /// Parses and runs `source`, returning the value passed to `return`, or
    /// `Value::Null` if execution falls off the end without one.
    pub fn run(&mut self, source: &str) -> Result<Value, DaelError> {
        let program = parse(source)?;
        match self.exec_block(&program)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Null),
        }
    }

    fn check_deadline(&self) -> Result<(), DaelError> {
        if self.start.elapsed() > self.limits.timeout {
            return Err(DaelError::new(ErrorCode::CodeTimeout, "sandboxed code exceeded its wall-clock timeout"));
        }
        Ok(())
    }

    fn exec_block(&mut self, statements: &[Stmt]) -> Result<Flow, DaelError> {
        for stmt in statements {
            self.statements_executed += 1;
            if self.statements_executed > self.limits.max_statements {
                return Err(runtime_error("sandboxed code exceeded the maximum statement count"));
            }
            self.check_deadline()?;
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                returned => return Ok(returned),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, DaelError> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                self.variables.insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Assign(name, expr) => {
                if !self.variables.contains_key(name) {
                    return Err(runtime_error(format!("cannot assign to undeclared variable '{name}'")));
                }
                let value = self.eval(expr)?;
                self.variables.insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => Ok(Flow::Return(self.eval(expr)?)),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If(condition, then_branch, else_branch) => {
                if truthy(&self.eval(condition)?) {
                    self.exec_block(then_branch)
                } else {
                    self.exec_block(else_branch)
                }
            }
            Stmt::For(binding, iterable, body) => {
                let items = match self.eval(iterable)? {
                    Value::Array(items) => items,
                    other => return Err(runtime_error(format!("cannot iterate over {}", type_name(&other)))),
                };
                let mut iterations = 0u64;
                for item in items {
                    iterations += 1;
                    if iterations > self.limits.max_loop_iterations {
                        return Err(runtime_error("loop exceeded the maximum iteration count"));
                    }
                    self.check_deadline()?;
                    self.variables.insert(binding.clone(), item);
                    match self.exec_block(body)? {
                        Flow::Normal => {}
                        returned => return Ok(returned),
                    }
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, DaelError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| runtime_error(format!("undefined variable '{name}'"))),
            Expr::Field(base, field) => {
                let base_value = self.eval(base)?;
                match base_value {
                    Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
                    other => Err(runtime_error(format!("cannot access field '{field}' on {}", type_name(&other)))),
                }
            }
            Expr::Index(base, index) => {
                let base_value = self.eval(base)?;
                let index_value = self.eval(index)?;
                match (&base_value, &index_value) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n.as_i64().unwrap_or(-1);
                        usize::try_from(i).ok().and_then(|i| items.get(i)).cloned().ok_or_else(|| runtime_error("array index out of bounds"))
                    }
                    (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
                    _ => Err(runtime_error(format!(
                        "cannot index {} with {}",
                        type_name(&base_value),
                        type_name(&index_value)
                    ))),
                }
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => match value {
                        Value::Number(n) => Ok(serde_json::Number::from_f64(-n.as_f64().unwrap_or(0.0))
                            .map(Value::Number)
                            .unwrap_or(Value::Null)),
                        other => Err(runtime_error(format!("cannot negate {}", type_name(&other)))),
                    },
                }
            }
            Expr::Binary(left, op, right) => self.eval_binary(left, *op, right),
            Expr::ToolCall(name_expr, params_expr) => self.eval_tool_call(name_expr, params_expr),
        }
    }

    fn eval_binary(&mut self, left: &Expr, op: BinOp, right: &Expr) -> Result<Value, DaelError> {
        if op == BinOp::And {
            let l = self.eval(left)?;
            if !truthy(&l) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&self.eval(right)?)));
        }
        if op == BinOp::Or {
            let l = self.eval(left)?;
            if truthy(&l) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&self.eval(right)?)));
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(l == r)),
            BinOp::Ne => Ok(Value::Bool(l != r)),
            BinOp::Add => match (&l, &r) {
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
                (Value::Number(_), Value::Number(_)) => numeric_op(&l, &r, |a, b| a + b),
                (Value::Array(a), Value::Array(b)) => {
                    let mut combined = a.clone();
                    combined.extend(b.clone());
                    Ok(Value::Array(combined))
                }
                _ => Err(runtime_error(format!("cannot add {} and {}", type_name(&l), type_name(&r)))),
            },
            BinOp::Sub => numeric_op(&l, &r, |a, b| a - b),
            BinOp::Mul => numeric_op(&l, &r, |a, b| a * b),
            BinOp::Div => {
                let divisor = as_number(&r)?;
                if divisor == 0.0 {
                    return Err(runtime_error("division by zero"));
                }
                numeric_op(&l, &r, |a, b| a / b)
            }
            BinOp::Mod => {
                let divisor = as_number(&r)?;
                if divisor == 0.0 {
                    return Err(runtime_error("modulo by zero"));
                }
                numeric_op(&l, &r, |a, b| a % b)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let a = as_number(&l)?;
                let b = as_number(&r)?;
                let result = match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above with short-circuit evaluation"),
        }
    }

    fn eval_tool_call(&mut self, name_expr: &Expr, params_expr: &Expr) -> Result<Value, DaelError> {
        self.check_deadline()?;
        if self.tool_calls_made >= self.limits.tool_call_budget {
            return Err(runtime_error(format!(
                "sandboxed code exceeded its tool-call budget of {}",
                self.limits.tool_call_budget
            )));
        }
        let name = match self.eval(name_expr)? {
            Value::String(s) => s,
            other => return Err(runtime_error(format!("context.tools.call name must be a string, found {}", type_name(&other)))),
        };
        let params = match self.eval(params_expr)? {
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(DaelError::new(
                    ErrorCode::ParamInvalid,
                    format!("context.tools.call params must be a JSON object, found {}", type_name(&other)),
                ))
            }
        };
        self.tool_calls_made += 1;
        self.bridge.call(&name, params)
    }
}

fn numeric_op(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, DaelError> {
    let a = as_number(l)?;
    let b = as_number(r)?;
    Ok(serde_json::Number::from_f64(f(a, b)).map(Value::Number).unwrap_or(Value::Null))
}

fn as_number(value: &Value) -> Result<f64, DaelError> {
    value
        .as_f64()
        .ok_or_else(|| runtime_error(format!("expected a number, found {}", type_name(value))))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RecordingBridge {
        responses: Vec<Value>,
        calls: Vec<(String, Value)>,
    }

    impl ToolBridge for RecordingBridge {
        fn call(&mut self, name: &str, params: Value) -> Result<Value, DaelError> {
            self.calls.push((name.to_string(), params));
            Ok(self.responses.remove(0))
        }
    }

    #[test]
    fn runs_arithmetic_and_returns_result() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let result = sandbox.run("let x = 2 + 3 * 4; return x;").unwrap();
        assert_eq!(result, json!(14.0));
    }

    #[test]
    fn if_else_branches_on_condition() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let result = sandbox
            .run("let x = 5; if x > 3 { return \"big\"; } else { return \"small\"; }")
            .unwrap();
        assert_eq!(result, json!("big"));
    }

    #[test]
    fn for_loop_accumulates_over_array() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let result = sandbox
            .run("let total = 0; for n in [1, 2, 3] { total = total + n; } return total;")
            .unwrap();
        assert_eq!(result, json!(6.0));
    }

    #[test]
    fn tools_call_dispatches_through_bridge_and_consumes_budget() {
        let mut bridge = RecordingBridge {
            responses: vec![json!({"ok": true})],
            calls: vec![],
        };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let result = sandbox
            .run("return context.tools.call(\"http.get\", {\"url\": \"https://example.com\"});")
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(bridge.calls.len(), 1);
        assert_eq!(bridge.calls[0].0, "http.get");
    }

    #[test]
    fn tool_call_budget_is_enforced() {
        let mut bridge = RecordingBridge {
            responses: vec![json!(1), json!(1)],
            calls: vec![],
        };
        let limits = SandboxLimits { tool_call_budget: 1, ..SandboxLimits::default() };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, limits);
        let error = sandbox
            .run("context.tools.call(\"a\", {}); context.tools.call(\"b\", {}); return 1;")
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::CodeRuntime);
    }

    #[test]
    fn tool_call_params_must_be_an_object() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let error = sandbox.run("return context.tools.call(\"a\", 1);").unwrap_err();
        assert_eq!(error.code, ErrorCode::ParamInvalid);
    }

    #[test]
    fn rejects_import_keyword() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let error = sandbox.run("import os; return 1;").unwrap_err();
        assert_eq!(error.code, ErrorCode::CodeSecurity);
    }

    #[test]
    fn rejects_arbitrary_function_calls() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let error = sandbox.run("return eval_something(1);").unwrap_err();
        assert_eq!(error.code, ErrorCode::CodeSecurity);
    }

    #[test]
    fn rejects_non_tools_method_calls() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, SandboxLimits::default());
        let error = sandbox.run("let x = [1, 2]; return x.call(1, 2);").unwrap_err();
        assert_eq!(error.code, ErrorCode::CodeSecurity);
    }

    #[test]
    fn loop_iteration_cap_is_enforced() {
        let mut bridge = RecordingBridge { responses: vec![], calls: vec![] };
        let limits = SandboxLimits { max_loop_iterations: 2, ..SandboxLimits::default() };
        let mut sandbox = Sandbox::new(Map::new(), &mut bridge, limits);
        let error = sandbox.run("for n in [1, 2, 3] { let x = n; } return 1;").unwrap_err();
        assert_eq!(error.code, ErrorCode::CodeRuntime);
    }
}
