//! Formula expressions: tokenizer, recursive-descent parser, and evaluator.

use std::fmt;
use std::sync::Arc;

use crate::error::FormulaError;
use crate::value::Value;

// ============================================================================
// Expression AST
// ============================================================================

/// A parsed formula expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant.
    Literal(Value),
    /// A symbol, bound to a path through the symbol mappings.
    Symbol(String),
    /// A prefix operator.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// Its operand.
        operand: Box<Expr>,
    },
    /// An infix operator.
    Binary {
        /// The operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// A built-in function call.
    Call {
        /// The function.
        function: Function,
        /// Arguments, in order.
        args: Vec<Expr>,
    },
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
}

/// Infix operators, loosest binding first: `||`, `&&`, comparisons,
/// `+ -`, `* / %`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`, also text concatenation.
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`, always a decimal result.
    Div,
    /// `%`
    Rem,
}

/// Built-in functions. See [`Function::name`] for the spelling used in
/// expressions.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Min,
    Max,
    Round,
    Floor,
    Ceil,
    Sqrt,
    If,
    Len,
    Upper,
    Lower,
    Concat,
    IsNull,
}

impl Function {
    const ALL: [Function; 13] = [
        Function::Abs,
        Function::Min,
        Function::Max,
        Function::Round,
        Function::Floor,
        Function::Ceil,
        Function::Sqrt,
        Function::If,
        Function::Len,
        Function::Upper,
        Function::Lower,
        Function::Concat,
        Function::IsNull,
    ];

    /// Look a function up by its (case-insensitive) name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// The function name.
    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Sqrt => "sqrt",
            Function::If => "if",
            Function::Len => "len",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Concat => "concat",
            Function::IsNull => "isnull",
        }
    }

    /// Returns true if the function can be called with `count` arguments.
    fn accepts(self, count: usize) -> bool {
        match self {
            Function::Min | Function::Max => count >= 1,
            Function::Round => (1..=2).contains(&count),
            Function::If => count == 3,
            Function::Concat => true,
            _ => count == 1,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where and why parsing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset into the expression text.
    pub offset: usize,
    /// Human-readable description.
    pub message: String,
}

impl ParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }

    /// Attach the expression text.
    pub fn into_formula_error(self, expression: &str) -> FormulaError {
        FormulaError::Parse {
            expression: expression.to_string(),
            offset: self.offset,
            message: self.message,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl Expr {
    /// Parse expression text.
    pub fn parse(text: &str) -> Result<Expr, ParseError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            (Token::End, _) => Ok(expr),
            (token, offset) => Err(ParseError::new(offset, format!("unexpected {token}"))),
        }
    }

    /// Distinct symbol names, in order of first appearance.
    pub fn symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Symbol(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Unary { operand, .. } => operand.collect_symbols(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_symbols(out);
                }
            }
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Integer(i) => write!(f, "number {i}"),
            Token::Decimal(d) => write!(f, "number {d}"),
            Token::Text(t) => write!(f, "string {t:?}"),
            Token::Ident(name) => write!(f, "'{name}'"),
            Token::Op(op) => write!(f, "'{op}'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::End => f.write_str("end of expression"),
        }
    }
}

const OPERATORS: [&str; 15] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "=",
];

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while pos < text.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;

        if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            while pos < text.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            let literal = &text[start..pos];
            let token = if literal.contains('.') {
                literal
                    .parse::<f64>()
                    .map(Token::Decimal)
                    .map_err(|_| ParseError::new(start, format!("malformed number '{literal}'")))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Token::Integer)
                    .map_err(|_| ParseError::new(start, format!("number '{literal}' is too large")))?
            };
            tokens.push((token, start));
            continue;
        }

        if c == b'"' || c == b'\'' {
            pos += 1;
            let mut value = String::new();
            loop {
                let Some(ch) = text[pos..].chars().next() else {
                    return Err(ParseError::new(start, "unterminated string"));
                };
                pos += ch.len_utf8();
                if ch as u32 == c as u32 {
                    break;
                }
                if ch == '\\' {
                    let Some(escaped) = text[pos..].chars().next() else {
                        return Err(ParseError::new(start, "unterminated string"));
                    };
                    pos += escaped.len_utf8();
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    value.push(ch);
                }
            }
            tokens.push((Token::Text(value), start));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while pos < text.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push((Token::Ident(text[start..pos].to_string()), start));
            continue;
        }

        let token = match c {
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(token) = token {
            pos += 1;
            tokens.push((token, start));
            continue;
        }

        match OPERATORS.iter().find(|op| text[pos..].starts_with(**op)) {
            Some(&"=") => return Err(ParseError::new(start, "use '==' for comparison")),
            Some(op) => {
                pos += op.len();
                tokens.push((Token::Op(*op), start));
            }
            None => {
                let ch = text[pos..].chars().next().unwrap_or('?');
                return Err(ParseError::new(start, format!("unexpected character '{ch}'")));
            }
        }
    }

    tokens.push((Token::End, text.len()));
    Ok(tokens)
}

// ============================================================================
// Parser (recursive descent)
// ============================================================================

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> (Token, usize) {
        self.tokens[self.pos.min(self.tokens.len() - 1)].clone()
    }

    fn advance(&mut self) -> (Token, usize) {
        let token = self.peek();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[(&str, BinOp)]) -> Option<BinOp> {
        if let (Token::Op(current), _) = self.peek() {
            if let Some((_, op)) = ops.iter().find(|(text, _)| *text == current) {
                self.pos += 1;
                return Some(*op);
            }
        }
        None
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while let Some(op) = self.eat_op(&[("||", BinOp::Or)]) {
            let rhs = self.parse_and()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        while let Some(op) = self.eat_op(&[("&&", BinOp::And)]) {
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        const OPS: [(&str, BinOp); 6] = [
            ("==", BinOp::Eq),
            ("!=", BinOp::Ne),
            ("<=", BinOp::Le),
            (">=", BinOp::Ge),
            ("<", BinOp::Lt),
            (">", BinOp::Gt),
        ];
        let lhs = self.parse_additive()?;
        match self.eat_op(&OPS) {
            Some(op) => {
                let rhs = self.parse_additive()?;
                if let (Token::Op(next), offset) = self.peek() {
                    if OPS.iter().any(|(text, _)| *text == next) {
                        return Err(ParseError::new(offset, "comparisons cannot be chained"));
                    }
                }
                Ok(binary(op, lhs, rhs))
            }
            None => Ok(lhs),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(op) = self.eat_op(&[("+", BinOp::Add), ("-", BinOp::Sub)]) {
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) =
            self.eat_op(&[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)])
        {
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            (Token::Op("-"), _) => UnaryOp::Neg,
            (Token::Op("!"), _) => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            (Token::Integer(i), _) => Ok(Expr::Literal(Value::Integer(i))),
            (Token::Decimal(d), _) => Ok(Expr::Literal(Value::Decimal(d))),
            (Token::Text(t), _) => Ok(Expr::Literal(Value::Text(Arc::from(t)))),
            (Token::LParen, _) => {
                let expr = self.parse_or()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            (Token::Ident(name), offset) => {
                let keyword = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = keyword {
                    return Ok(Expr::Literal(value));
                }
                if !matches!(self.peek(), (Token::LParen, _)) {
                    return Ok(Expr::Symbol(name));
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| ParseError::new(offset, format!("unknown function '{name}'")))?;
                self.advance();
                let args = self.parse_args()?;
                if !function.accepts(args.len()) {
                    return Err(ParseError::new(
                        offset,
                        format!("{function} does not take {} argument(s)", args.len()),
                    ));
                }
                Ok(Expr::Call { function, args })
            }
            (token, offset) => Err(ParseError::new(offset, format!("unexpected {token}"))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if matches!(self.peek(), (Token::RParen, _)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                (Token::Comma, _) => continue,
                (Token::RParen, _) => return Ok(args),
                (token, offset) => {
                    return Err(ParseError::new(offset, format!("expected ',' or ')', found {token}")))
                }
            }
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ParseError> {
        match self.advance() {
            (Token::RParen, _) => Ok(()),
            (token, offset) => Err(ParseError::new(offset, format!("expected ')', found {token}"))),
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

// ============================================================================
// Evaluator
// ============================================================================

impl Expr {
    /// Evaluate with symbol values supplied by `lookup`.
    ///
    /// `Null` propagates through operators; a `NotReady` operand makes the
    /// result `NotReady`.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, FormulaError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Symbol(name) => lookup(name).ok_or_else(|| FormulaError::UnboundSymbol(name.clone())),
            Expr::Unary { op, operand } => {
                let value = operand.evaluate(lookup)?;
                unary(*op, value)
            }
            Expr::Binary { op: BinOp::And, lhs, rhs } => logical(false, lhs, rhs, lookup),
            Expr::Binary { op: BinOp::Or, lhs, rhs } => logical(true, lhs, rhs, lookup),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = lhs.evaluate(lookup)?;
                let rhs = rhs.evaluate(lookup)?;
                arithmetic(*op, lhs, rhs)
            }
            Expr::Call { function, args } => call(*function, args, lookup),
        }
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, FormulaError> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (_, Value::NotReady) => Ok(Value::NotReady),
        (UnaryOp::Neg, Value::Integer(i)) => i
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| FormulaError::evaluation("integer overflow")),
        (UnaryOp::Neg, Value::Decimal(d)) => Ok(Value::Decimal(-d)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, other) => Err(FormulaError::evaluation(format!("cannot negate {}", other.kind()))),
        (UnaryOp::Not, other) => Err(FormulaError::evaluation(format!("cannot apply '!' to {}", other.kind()))),
    }
}

/// Short-circuiting `&&` (`short_on = false`) and `||` (`short_on = true`).
fn logical(
    short_on: bool,
    lhs: &Expr,
    rhs: &Expr,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, FormulaError> {
    let lhs = lhs.evaluate(lookup)?;
    if !lhs.is_ready() {
        return Ok(Value::NotReady);
    }
    let lhs = truth(lhs)?;
    if lhs == Some(short_on) {
        return Ok(Value::Bool(short_on));
    }
    let rhs = rhs.evaluate(lookup)?;
    if !rhs.is_ready() {
        return Ok(Value::NotReady);
    }
    let rhs = truth(rhs)?;
    match (lhs, rhs) {
        (_, Some(b)) if b == short_on => Ok(Value::Bool(short_on)),
        (Some(_), Some(b)) => Ok(Value::Bool(b)),
        _ => Ok(Value::Null),
    }
}

fn truth(value: Value) -> Result<Option<bool>, FormulaError> {
    match value {
        Value::Bool(b) => Ok(Some(b)),
        Value::Null => Ok(None),
        other => Err(FormulaError::evaluation(format!("expected boolean, found {}", other.kind()))),
    }
}

fn arithmetic(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, FormulaError> {
    if matches!(lhs, Value::NotReady) || matches!(rhs, Value::NotReady) {
        return Ok(Value::NotReady);
    }
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinOp::Eq => Ok(Value::Bool(equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &lhs, &rhs),
        BinOp::Add => match (&lhs, &rhs) {
            (Value::Text(_), _) | (_, Value::Text(_)) => Ok(Value::from(format!("{lhs}{rhs}"))),
            _ => numeric(op, &lhs, &rhs, i64::checked_add, |a, b| a + b),
        },
        BinOp::Sub => numeric(op, &lhs, &rhs, i64::checked_sub, |a, b| a - b),
        BinOp::Mul => numeric(op, &lhs, &rhs, i64::checked_mul, |a, b| a * b),
        BinOp::Div => {
            let (a, b) = as_numbers(op, &lhs, &rhs)?;
            if b == 0.0 {
                return Err(FormulaError::evaluation("division by zero"));
            }
            Ok(Value::Decimal(a / b))
        }
        BinOp::Rem => {
            if matches!(rhs, Value::Integer(0)) || rhs.as_f64() == Some(0.0) {
                return Err(FormulaError::evaluation("division by zero"));
            }
            numeric(op, &lhs, &rhs, i64::checked_rem, |a, b| a % b)
        }
        BinOp::And | BinOp::Or => unreachable!("logical operators short-circuit"),
    }
}

fn numeric(
    op: BinOp,
    lhs: &Value,
    rhs: &Value,
    int: fn(i64, i64) -> Option<i64>,
    dec: fn(f64, f64) -> f64,
) -> Result<Value, FormulaError> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return int(*a, *b)
            .map(Value::Integer)
            .ok_or_else(|| FormulaError::evaluation("integer overflow"));
    }
    let (a, b) = as_numbers(op, lhs, rhs)?;
    Ok(Value::Decimal(dec(a, b)))
}

fn as_numbers(op: BinOp, lhs: &Value, rhs: &Value) -> Result<(f64, f64), FormulaError> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(FormulaError::evaluation(format!(
            "cannot apply {op:?} to {} and {}",
            lhs.kind(),
            rhs.kind()
        ))),
    }
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) if !(matches!(lhs, Value::Integer(_)) && matches!(rhs, Value::Integer(_))) => a == b,
        _ => lhs == rhs,
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, FormulaError> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = as_numbers(op, lhs, rhs)?;
            a.partial_cmp(&b)
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Le => ordering != Ordering::Greater,
        BinOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    }))
}

fn call(
    function: Function,
    args: &[Expr],
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, FormulaError> {
    if !function.accepts(args.len()) {
        return Err(FormulaError::evaluation(format!(
            "{function} does not take {} argument(s)",
            args.len()
        )));
    }
    if function == Function::If {
        let condition = args[0].evaluate(lookup)?;
        if !condition.is_ready() {
            return Ok(Value::NotReady);
        }
        return match truth(condition)? {
            Some(true) => args[1].evaluate(lookup),
            Some(false) => args[2].evaluate(lookup),
            None => Ok(Value::Null),
        };
    }

    let values = args
        .iter()
        .map(|arg| arg.evaluate(lookup))
        .collect::<Result<Vec<_>, _>>()?;
    if values.iter().any(|v| !v.is_ready()) {
        return Ok(Value::NotReady);
    }
    if function == Function::IsNull {
        return Ok(Value::Bool(values[0].is_null()));
    }
    if function == Function::Concat {
        let text: String = values
            .iter()
            .filter(|v| !v.is_null())
            .map(ToString::to_string)
            .collect();
        return Ok(Value::from(text));
    }
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    let first = &values[0];
    match function {
        Function::Abs => match first {
            Value::Integer(i) => i
                .checked_abs()
                .map(Value::Integer)
                .ok_or_else(|| FormulaError::evaluation("integer overflow")),
            _ => Ok(Value::Decimal(number(function, first)?.abs())),
        },
        Function::Min | Function::Max => {
            let mut best = first;
            let mut best_number = number(function, first)?;
            for value in &values[1..] {
                let candidate = number(function, value)?;
                let better = match function {
                    Function::Min => candidate < best_number,
                    _ => candidate > best_number,
                };
                if better {
                    best = value;
                    best_number = candidate;
                }
            }
            Ok(best.clone())
        }
        Function::Round => {
            let digits = match values.get(1) {
                Some(Value::Integer(d)) => i32::try_from(*d)
                    .map_err(|_| FormulaError::evaluation("round: digits out of range"))?,
                Some(other) => {
                    return Err(FormulaError::evaluation(format!(
                        "round: digits must be an integer, found {}",
                        other.kind()
                    )))
                }
                None => 0,
            };
            match first {
                Value::Integer(i) if digits >= 0 => Ok(Value::Integer(*i)),
                _ => {
                    let factor = 10f64.powi(digits);
                    Ok(Value::Decimal((number(function, first)? * factor).round() / factor))
                }
            }
        }
        Function::Floor => match first {
            Value::Integer(i) => Ok(Value::Integer(*i)),
            _ => Ok(Value::Decimal(number(function, first)?.floor())),
        },
        Function::Ceil => match first {
            Value::Integer(i) => Ok(Value::Integer(*i)),
            _ => Ok(Value::Decimal(number(function, first)?.ceil())),
        },
        Function::Sqrt => {
            let x = number(function, first)?;
            if x < 0.0 {
                return Err(FormulaError::evaluation("sqrt of a negative number"));
            }
            Ok(Value::Decimal(x.sqrt()))
        }
        Function::Len => Ok(Value::Integer(text(function, first)?.chars().count() as i64)),
        Function::Upper => Ok(Value::from(text(function, first)?.to_uppercase())),
        Function::Lower => Ok(Value::from(text(function, first)?.to_lowercase())),
        Function::If | Function::IsNull | Function::Concat => unreachable!("handled above"),
    }
}

fn number(function: Function, value: &Value) -> Result<f64, FormulaError> {
    value.as_f64().ok_or_else(|| {
        FormulaError::evaluation(format!("{function}: expected number, found {}", value.kind()))
    })
}

fn text(function: Function, value: &Value) -> Result<&str, FormulaError> {
    value.as_text().ok_or_else(|| {
        FormulaError::evaluation(format!("{function}: expected text, found {}", value.kind()))
    })
}
