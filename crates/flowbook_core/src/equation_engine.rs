use crate::autodiff::Dual;
use crate::traits::{Scalar, SystemKind, VectorField};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// Failures while turning equation strings into bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EquationError {
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("invalid number literal \"{0}\"")]
    InvalidNumber(String),
    #[error("expected ')'")]
    MissingParen,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown variable or parameter: {0}")]
    UnknownIdentifier(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("name \"{0}\" is declared more than once")]
    DuplicateName(String),
    #[error("expected {expected} equations, got {got}")]
    EquationCount { expected: usize, got: usize },
    #[error("in equation {index} (\"{source_text}\"): {error}")]
    InEquation {
        index: usize,
        source_text: String,
        error: Box<EquationError>,
    },
}

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    LoadConst(f64),
    /// Pushes a state variable, by declaration order.
    LoadVar(usize),
    LoadParam(usize),
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    Mul,
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Abs,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "sqrt" => Function::Sqrt,
            "tanh" => Function::Tanh,
            "abs" => Function::Abs,
            _ => return None,
        })
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Exp => a.exp(),
            Function::Log => a.ln(),
            Function::Sqrt => a.sqrt(),
            Function::Tanh => a.tanh(),
            Function::Abs => a.abs(),
        }
    }
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current state vector (read-only).
/// - `params`: Parameter vector (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], params: &[T], t: T, stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::constant(val)),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::LoadParam(idx) => stack.push(params[idx]),
                OpCode::LoadTime => stack.push(t),
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Call(f) => {
                    let a = pop(stack);
                    stack.push(f.apply(a));
                }
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
            }
        }

        pop(stack)
    }
}

// Compiled bytecode is stack-balanced, so an empty pop only happens for
// hand-built programs; they evaluate to NaN.
fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Negate(Box<Expr>),
    Call(String, Box<Expr>),
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable and parameter names to indices; `t` is the time unless
/// it is declared as a variable or parameter.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, EquationError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), EquationError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if name == "t" {
                    ops.push(OpCode::LoadTime);
                } else {
                    return Err(EquationError::UnknownIdentifier(name.clone()));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    other => return Err(EquationError::UnexpectedToken(other.to_string())),
                });
            }
            Expr::Negate(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                let function = Function::lookup(func)
                    .ok_or_else(|| EquationError::UnknownFunction(func.clone()))?;
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(function));
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
///
/// Precedence, loosest first: `+ -`, `* /`, `^` (right-associative), unary
/// minus. So `-x^2` is `(-x)^2`, and `2^3^2` is `2^9`.
pub fn parse(input: &str) -> Result<Expr, EquationError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    match parser.consume() {
        None => Ok(expr),
        Some(token) => Err(EquationError::UnexpectedToken(format!("{token:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EquationError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '-' || d == '+') && num_str.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| EquationError::InvalidNumber(num_str.clone()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(EquationError::UnexpectedCharacter(other)),
            });
            chars.next();
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

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_sum(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.parse_product()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some('+'),
            Some(Token::Minus) => Some('-'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.parse_power()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some('*'),
            Some(Token::Slash) => Some('/'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, EquationError> {
        let base = self.parse_unary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_power()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, EquationError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EquationError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_sum()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(EquationError::UnexpectedToken(format!("{token:?}"))),
            None => Err(EquationError::UnexpectedEnd),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), EquationError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(EquationError::MissingParen),
        }
    }
}

// --- EquationSystem ---

/// A vector field given as one equation string per state variable.
pub struct EquationSystem {
    pub var_names: Vec<String>,
    pub param_names: Vec<String>,
    pub equations: Vec<Bytecode>,
    pub kind: SystemKind,
    // Interior mutability for VM stacks to avoid allocation in rhs.
    // This makes the system !Sync.
    f64_stack: RefCell<Vec<f64>>,
    dual_stack: RefCell<Vec<Dual>>,
}

impl EquationSystem {
    pub fn compile(
        var_names: &[&str],
        param_names: &[&str],
        equations: &[&str],
        kind: SystemKind,
    ) -> Result<Self, EquationError> {
        if equations.len() != var_names.len() {
            return Err(EquationError::EquationCount {
                expected: var_names.len(),
                got: equations.len(),
            });
        }
        let var_names: Vec<String> = var_names.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = param_names.iter().map(|s| s.to_string()).collect();
        let mut seen = std::collections::HashSet::new();
        for name in var_names.iter().chain(param_names.iter()) {
            if !seen.insert(name.as_str()) {
                return Err(EquationError::DuplicateName(name.clone()));
            }
        }

        let compiler = Compiler::new(&var_names, &param_names);
        let compiled = equations
            .iter()
            .enumerate()
            .map(|(index, source)| {
                parse(source)
                    .and_then(|expr| compiler.compile(&expr))
                    .map_err(|error| EquationError::InEquation {
                        index,
                        source_text: source.to_string(),
                        error: Box::new(error),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            var_names,
            param_names,
            equations: compiled,
            kind,
            f64_stack: RefCell::new(Vec::with_capacity(64)),
            dual_stack: RefCell::new(Vec::with_capacity(64)),
        })
    }

    fn evaluate<T: Scalar>(&self, stack: &mut Vec<T>, du: &mut [T], u: &[T], p: &[T], t: T) {
        for (slot, eq) in du.iter_mut().zip(self.equations.iter()) {
            *slot = VM::execute(eq, u, p, t, stack);
        }
    }
}

impl VectorField<f64> for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn parameter_count(&self) -> usize {
        self.param_names.len()
    }

    fn rhs(&self, du: &mut [f64], u: &[f64], p: &[f64], t: f64) {
        self.evaluate(&mut self.f64_stack.borrow_mut(), du, u, p, t);
    }

    fn kind(&self) -> SystemKind {
        self.kind
    }
}

impl VectorField<Dual> for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn parameter_count(&self) -> usize {
        self.param_names.len()
    }

    fn rhs(&self, du: &mut [Dual], u: &[Dual], p: &[Dual], t: Dual) {
        self.evaluate(&mut self.dual_stack.borrow_mut(), du, u, p, t);
    }

    fn kind(&self) -> SystemKind {
        self.kind
    }
}
