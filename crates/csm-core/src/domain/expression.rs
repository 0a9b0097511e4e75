//! Restricted expression interpreter.
//!
//! Guards such as `context.user && context.user.age >= 18` and return-value
//! transforms such as `{ size: context.size, price: context.price + (context.extraCharge || 0) }`
//! are parsed into a small AST and interpreted against the context. Nothing
//! outside the context is reachable: the only free identifier is `context`.

use serde_json::{Map, Value};

use crate::domain::coercion::{compare, loose_eq, number_value, strict_eq, to_display_string, to_number, truthy};
use crate::error::{CoreError, CoreResult};
use crate::types::Context;

/// A parsed expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Undefined,
    Identifier(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Not,
    Negate,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LooseEqual,
    LooseNotEqual,
    StrictEqual,
    StrictNotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCTUATORS: [&str; 28] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "+", "-", "*", "/", "%", "!", "(", ")", "[",
    "]", "{", "}", ".", ",", ":", "?", ";",
];

fn syntax_error(message: impl Into<String>) -> CoreError {
    CoreError::ExpressionError(message.into())
}

fn tokenize(source: &str) -> CoreResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).map_or(false, |n| n.is_ascii_digit())) {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| syntax_error(format!("Invalid number literal '{}'", text)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            pos += 1;
            loop {
                match chars.get(pos) {
                    None => return Err(syntax_error("Unterminated string literal")),
                    Some(&ch) if ch == quote => {
                        pos += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(pos + 1)
                            .ok_or_else(|| syntax_error("Unterminated string literal"))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => *other,
                        });
                        pos += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        pos += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$') {
                pos += 1;
            }
            tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            continue;
        }

        let rest: String = chars[pos..chars.len().min(pos + 3)].iter().collect();
        match PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            Some(punct) => {
                tokens.push(Token::Punct(*punct));
                pos += punct.chars().count();
            }
            None => return Err(syntax_error(format!("Unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.peek_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> CoreResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(syntax_error(format!("Expected '{}' but found {}", punct, self.describe_current())))
        }
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            None => "end of expression".to_string(),
            Some(Token::Number(n)) => format!("number {}", n),
            Some(Token::Str(s)) => format!("string \"{}\"", s),
            Some(Token::Ident(name)) => format!("identifier '{}'", name),
            Some(Token::Punct(p)) => format!("'{}'", p),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_expression(&mut self) -> CoreResult<Expr> {
        let test = self.parse_logical_or()?;
        if self.eat_punct("?") {
            let consequent = self.parse_expression()?;
            self.expect_punct(":")?;
            let alternate = self.parse_expression()?;
            return Ok(Expr::Conditional(Box::new(test), Box::new(consequent), Box::new(alternate)));
        }
        Ok(test)
    }

    fn parse_logical_or(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_logical_and()?;
        loop {
            let op = if self.eat_punct("||") {
                LogicalOp::Or
            } else if self.eat_punct("??") {
                LogicalOp::Nullish
            } else {
                return Ok(left);
            };
            let right = self.parse_logical_and()?;
            left = Expr::Logical(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_logical_and(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_binary(0)?;
        while self.eat_punct("&&") {
            let right = self.parse_binary(0)?;
            left = Expr::Logical(LogicalOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Precedence levels, loosest first: equality, relational, additive, multiplicative
    fn parse_binary(&mut self, level: usize) -> CoreResult<Expr> {
        const LEVELS: [&[(&str, BinaryOp)]; 4] = [
            &[
                ("===", BinaryOp::StrictEqual),
                ("!==", BinaryOp::StrictNotEqual),
                ("==", BinaryOp::LooseEqual),
                ("!=", BinaryOp::LooseNotEqual),
            ],
            &[
                ("<=", BinaryOp::LessEqual),
                (">=", BinaryOp::GreaterEqual),
                ("<", BinaryOp::Less),
                (">", BinaryOp::Greater),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Subtract)],
            &[("*", BinaryOp::Multiply), ("/", BinaryOp::Divide), ("%", BinaryOp::Remainder)],
        ];

        if level == LEVELS.len() {
            return self.parse_unary();
        }

        let mut left = self.parse_binary(level + 1)?;
        'outer: loop {
            for (punct, op) in LEVELS[level] {
                if self.eat_punct(punct) {
                    let right = self.parse_binary(level + 1)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_unary(&mut self) -> CoreResult<Expr> {
        let op = if self.eat_punct("!") {
            UnaryOp::Not
        } else if self.eat_punct("-") {
            UnaryOp::Negate
        } else if self.eat_punct("+") {
            UnaryOp::Plus
        } else {
            return self.parse_postfix();
        };
        Ok(Expr::Unary(op, Box::new(self.parse_unary()?)))
    }

    fn parse_postfix(&mut self) -> CoreResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.next_token() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    _ => return Err(syntax_error("Expected property name after '.'")),
                }
            } else if self.eat_punct("[") {
                let index = self.parse_expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> CoreResult<Expr> {
        match self.next_token() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                "undefined" => Expr::Undefined,
                _ => Expr::Identifier(name),
            }),
            Some(Token::Punct("(")) => {
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Some(Token::Punct("{")) => self.parse_object(),
            Some(Token::Punct("[")) => self.parse_array(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(syntax_error(format!("Unexpected {}", self.describe_current())))
            }
        }
    }

    fn parse_object(&mut self) -> CoreResult<Expr> {
        let mut properties = Vec::new();
        while !self.eat_punct("}") {
            let key = match self.next_token() {
                Some(Token::Ident(name)) => name,
                Some(Token::Str(s)) => s,
                Some(Token::Number(n)) => to_display_string(Some(&number_value(n))),
                _ => return Err(syntax_error("Expected property name in object literal")),
            };

            let value = if self.eat_punct(":") {
                self.parse_expression()?
            } else {
                Expr::Identifier(key.clone())
            };
            properties.push((key, value));

            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(properties))
    }

    fn parse_array(&mut self) -> CoreResult<Expr> {
        let mut items = Vec::new();
        while !self.eat_punct("]") {
            items.push(self.parse_expression()?);
            if !self.eat_punct(",") {
                self.expect_punct("]")?;
                break;
            }
        }
        Ok(Expr::Array(items))
    }
}

impl Expression {
    /// Parse an expression.
    ///
    /// A leading `return` and a trailing `;` are tolerated.
    pub fn parse(source: &str) -> CoreResult<Self> {
        let mut tokens = tokenize(source)?;
        if matches!(tokens.first(), Some(Token::Ident(word)) if word == "return") {
            tokens.remove(0);
        }
        while matches!(tokens.last(), Some(Token::Punct(";"))) {
            tokens.pop();
        }
        if tokens.is_empty() {
            return Err(syntax_error("Empty expression"));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_expression()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax_error(format!("Unexpected {}", parser.describe_current())));
        }
        Ok(Expression { root })
    }

    /// Evaluate against a context; `None` is an undefined result
    pub fn evaluate(&self, context: &Context) -> CoreResult<Option<Value>> {
        Evaluator { context }.eval(&self.root)
    }
}

/// Parse and evaluate in one step; an undefined result becomes `null`
pub fn evaluate(source: &str, context: &Context) -> CoreResult<Value> {
    Ok(Expression::parse(source)?.evaluate(context)?.unwrap_or(Value::Null))
}

/// Parse and evaluate for truthiness
pub fn evaluate_truthy(source: &str, context: &Context) -> CoreResult<bool> {
    let value = Expression::parse(source)?.evaluate(context)?;
    Ok(truthy(value.as_ref()))
}

struct Evaluator<'a> {
    context: &'a Context,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> CoreResult<Option<Value>> {
        match expr {
            Expr::Literal(value) => Ok(Some(value.clone())),
            Expr::Undefined => Ok(None),
            Expr::Identifier(name) => match name.as_str() {
                "context" => Ok(Some(Value::Object(self.context.clone()))),
                _ => Err(CoreError::ExpressionError(format!("{} is not defined", name))),
            },
            Expr::Member(object, property) => {
                let object = self.eval(object)?;
                member(object.as_ref(), property)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                let key = match index {
                    Some(Value::Number(n)) => to_display_string(Some(&number_value(n.as_f64().unwrap_or(f64::NAN)))),
                    other => to_display_string(other.as_ref()),
                };
                member(object.as_ref(), &key)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                Ok(Some(match op {
                    UnaryOp::Not => Value::Bool(!truthy(value.as_ref())),
                    UnaryOp::Negate => number_value(-to_number(value.as_ref())),
                    UnaryOp::Plus => number_value(to_number(value.as_ref())),
                }))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(Some(binary(*op, left.as_ref(), right.as_ref())))
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOp::And => !truthy(left.as_ref()),
                    LogicalOp::Or => truthy(left.as_ref()),
                    LogicalOp::Nullish => !matches!(left, None | Some(Value::Null)),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if truthy(self.eval(test)?.as_ref()) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Object(properties) => {
                let mut object = Map::new();
                for (key, value) in properties {
                    if let Some(value) = self.eval(value)? {
                        object.insert(key.clone(), value);
                    }
                }
                Ok(Some(Value::Object(object)))
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(values)))
            }
        }
    }
}

fn member(object: Option<&Value>, property: &str) -> CoreResult<Option<Value>> {
    match object {
        None => Err(CoreError::ExpressionError(format!(
            "Cannot read properties of undefined (reading '{}')",
            property
        ))),
        Some(Value::Null) => Err(CoreError::ExpressionError(format!(
            "Cannot read properties of null (reading '{}')",
            property
        ))),
        Some(Value::Object(map)) => Ok(map.get(property).cloned()),
        Some(Value::Array(items)) => Ok(if property == "length" {
            Some(Value::from(items.len()))
        } else {
            property.parse::<usize>().ok().and_then(|index| items.get(index).cloned())
        }),
        Some(Value::String(s)) => Ok(if property == "length" {
            Some(Value::from(s.chars().count()))
        } else {
            property
                .parse::<usize>()
                .ok()
                .and_then(|index| s.chars().nth(index))
                .map(|ch| Value::String(ch.to_string()))
        }),
        Some(_) => Ok(None),
    }
}

fn binary(op: BinaryOp, left: Option<&Value>, right: Option<&Value>) -> Value {
    use std::cmp::Ordering;

    match op {
        BinaryOp::Add => {
            if matches!(left, Some(Value::String(_))) || matches!(right, Some(Value::String(_))) {
                Value::String(format!("{}{}", to_display_string(left), to_display_string(right)))
            } else {
                number_value(to_number(left) + to_number(right))
            }
        }
        BinaryOp::Subtract => number_value(to_number(left) - to_number(right)),
        BinaryOp::Multiply => number_value(to_number(left) * to_number(right)),
        BinaryOp::Divide => number_value(to_number(left) / to_number(right)),
        BinaryOp::Remainder => number_value(to_number(left) % to_number(right)),
        BinaryOp::Less => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::LessEqual => Value::Bool(matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))),
        BinaryOp::Greater => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::GreaterEqual => {
            Value::Bool(matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)))
        }
        BinaryOp::LooseEqual => Value::Bool(loose_eq(left, right)),
        BinaryOp::LooseNotEqual => Value::Bool(!loose_eq(left, right)),
        BinaryOp::StrictEqual => Value::Bool(strict_eq(left, right)),
        BinaryOp::StrictNotEqual => Value::Bool(!strict_eq(left, right)),
    }
}
