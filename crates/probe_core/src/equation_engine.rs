use crate::autodiff::Dual;
use crate::source::Sample;
use crate::traits::{DynamicalSystem, Scalar};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unknown variable or parameter: {0}")]
    UnknownIdentifier(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("expected {expected} equations, got {actual}")]
    EquationCount { expected: usize, actual: usize },
}

/// OpCodes for the stack VM. The VM operates on `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes a coordinate of the sample (by index).
    LoadVar(usize),
    /// Pushes the time derivative of a coordinate (by index).
    LoadRate(usize),
    /// Pushes the sample time.
    LoadTime,
    /// Pushes a named parameter (by index).
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Sin,
    Cos,
    Exp,
    Sqrt,
    Neg,
}

/// A compiled expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stateless stack machine; `execute` receives everything it reads.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        sample: &Sample<'_, T>,
        params: &[f64],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(val) => T::lift(val),
                OpCode::LoadVar(idx) => sample.y[idx],
                OpCode::LoadRate(idx) => sample.ydot[idx],
                OpCode::LoadTime => sample.t,
                OpCode::LoadParam(idx) => T::lift(params[idx]),
                OpCode::Neg => -pop(stack),
                OpCode::Sin => pop(stack).sin(),
                OpCode::Cos => pop(stack).cos(),
                OpCode::Exp => pop(stack).exp(),
                OpCode::Sqrt => pop(stack).sqrt(),
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    }
                }
            };
            stack.push(value);
        }

        pop(stack)
    }
}

// Compiled bytecode is balanced; an empty pop only happens for empty code.
fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::zero)
}

/// Scratch stacks for both scalar types, so one compiled system can be
/// evaluated with `f64` and `Dual` without allocating.
#[derive(Debug, Default)]
pub struct VmStacks {
    real: RefCell<Vec<f64>>,
    dual: RefCell<Vec<Dual>>,
}

impl Clone for VmStacks {
    fn clone(&self) -> Self {
        Self::default()
    }
}

/// Scalars the VM keeps a scratch stack for.
pub trait VmScalar: Scalar {
    fn scratch(stacks: &VmStacks) -> &RefCell<Vec<Self>>;
}

impl VmScalar for f64 {
    fn scratch(stacks: &VmStacks) -> &RefCell<Vec<Self>> {
        &stacks.real
    }
}

impl VmScalar for Dual {
    fn scratch(stacks: &VmStacks) -> &RefCell<Vec<Self>> {
        &stacks.dual
    }
}

impl VmStacks {
    pub fn run<T: VmScalar>(&self, bytecode: &Bytecode, sample: &Sample<'_, T>, params: &[f64]) -> T {
        let mut stack = T::scratch(self).borrow_mut();
        VM::execute(bytecode, sample, params, &mut stack)
    }
}

// --- AST & Parser ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Negate(Box<Expr>),
    Call(String, Box<Expr>),
}

/// Suffix naming the time derivative of a coordinate in quantity expressions.
pub const RATE_SUFFIX: &str = "_dot";

/// Resolves names and lowers an `Expr` into `Bytecode`.
///
/// Lookup order: coordinates, rates (`<coordinate>_dot`, when enabled),
/// parameters, then `t`.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
    rates: bool,
}

impl Compiler {
    /// Compiler for vector fields: rates are not visible.
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
            rates: false,
        }
    }

    /// Compiler for probe quantities: `<name>_dot` reads the rate of `name`.
    pub fn with_rates(var_names: &[String], param_names: &[String]) -> Self {
        Self {
            rates: true,
            ..Self::new(var_names, param_names)
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ExpressionError> {
        let mut ops = Vec::new();
        self.lower(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn resolve(&self, name: &str) -> Result<OpCode, ExpressionError> {
        if let Some(&idx) = self.var_map.get(name) {
            return Ok(OpCode::LoadVar(idx));
        }
        if self.rates {
            if let Some(&idx) = name
                .strip_suffix(RATE_SUFFIX)
                .and_then(|base| self.var_map.get(base))
            {
                return Ok(OpCode::LoadRate(idx));
            }
        }
        if let Some(&idx) = self.param_map.get(name) {
            return Ok(OpCode::LoadParam(idx));
        }
        if name == "t" {
            return Ok(OpCode::LoadTime);
        }
        Err(ExpressionError::UnknownIdentifier(name.to_string()))
    }

    fn lower(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ExpressionError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => ops.push(self.resolve(name)?),
            Expr::Binary(left, op, right) => {
                self.lower(left, ops)?;
                self.lower(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    other => return Err(ExpressionError::UnexpectedCharacter(*other)),
                });
            }
            Expr::Negate(operand) => {
                self.lower(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.lower(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "sqrt" => OpCode::Sqrt,
                    _ => return Err(ExpressionError::UnknownFunction(func.clone())),
                });
            }
        }
        Ok(())
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::Syntax(format!(
            "unexpected trailing {token:?}"
        ))),
    }
}

/// Parses and compiles in one go.
pub fn compile_expression(compiler: &Compiler, input: &str) -> Result<Bytecode, ExpressionError> {
    compiler.compile(&parse(input)?)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = literal
                .parse()
                .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
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
                '+' | '-' | '*' | '/' | '^' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(ExpressionError::UnexpectedCharacter(other)),
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

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some(Token::Op(c)) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    fn parse_sum(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_product()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&['*', '/']) {
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // -x^2 parses as -(x^2).
    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op(&['-']).is_some() {
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_power()
    }

    // Right-associative: 2^3^2 = 2^(3^2).
    fn parse_power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.parse_primary()?;
        if self.eat_op(&['^']).is_some() {
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn expect_close(&mut self) -> Result<(), ExpressionError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ExpressionError::Syntax("expected ')'".to_string())),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let arg = self.parse_sum()?;
                    self.expect_close()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                self.expect_close()?;
                Ok(expr)
            }
            Some(token) => Err(ExpressionError::Syntax(format!("unexpected {token:?}"))),
            None => Err(ExpressionError::Syntax("unexpected end of input".to_string())),
        }
    }
}

// --- EquationSystem ---

/// A data-driven model: one compiled expression per coordinate.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub params: Vec<f64>,
    pub var_names: Vec<String>,
    pub param_names: Vec<String>,
    stacks: VmStacks,
}

impl EquationSystem {
    pub fn new(equations: Vec<Bytecode>, params: Vec<f64>) -> Self {
        Self {
            equations,
            params,
            var_names: Vec::new(),
            param_names: Vec::new(),
            stacks: VmStacks::default(),
        }
    }

    /// Compiles `dx_i/dt = equations[i]` over the named coordinates.
    pub fn compile(
        var_names: &[&str],
        param_names: &[&str],
        params: &[f64],
        equations: &[&str],
    ) -> Result<Self, ExpressionError> {
        if equations.len() != var_names.len() {
            return Err(ExpressionError::EquationCount {
                expected: var_names.len(),
                actual: equations.len(),
            });
        }
        if params.len() != param_names.len() {
            return Err(ExpressionError::Syntax(format!(
                "{} parameter names but {} values",
                param_names.len(),
                params.len()
            )));
        }
        let var_names = owned(var_names);
        let param_names = owned(param_names);
        let compiler = Compiler::new(&var_names, &param_names);
        let bytecodes = equations
            .iter()
            .map(|eq| compile_expression(&compiler, eq))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            var_names,
            param_names,
            ..Self::new(bytecodes, params.to_vec())
        })
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> Result<(), ExpressionError> {
        let idx = self
            .param_names
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| ExpressionError::UnknownIdentifier(name.to_string()))?;
        self.params[idx] = value;
        Ok(())
    }
}

pub(crate) fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl<T: VmScalar> DynamicalSystem<T> for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let sample = Sample { t, y: x, ydot: &[] };
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = self.stacks.run(eq, &sample, &self.params);
        }
    }
}
