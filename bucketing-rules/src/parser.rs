//! Recursive-descent parser producing the rule AST.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::ContextValue;
use crate::functions::{FUNCTION_NAMESPACE, Function, FunctionRegistry};
use crate::lexer::{Lexer, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

pub(crate) enum Expr {
    Literal(ContextValue),
    Identifier(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Arc<Function>, Vec<Expr>),
}

impl Expr {
    /// Collect the free variable names referenced by this expression.
    pub(crate) fn collect_identifiers<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Identifier(name) => {
                out.insert(name);
            }
            Expr::Member(target, _) => target.collect_identifiers(out),
            Expr::Index(target, index) => {
                target.collect_identifiers(out);
                index.collect_identifiers(out);
            }
            Expr::Unary(_, operand) => operand.collect_identifiers(out),
            Expr::Binary(_, left, right) => {
                left.collect_identifiers(out);
                right.collect_identifiers(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|arg| arg.collect_identifiers(out)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseError {
    Syntax(String),
    UnknownFunction(String),
}

/// Maximum depth of parser recursion: parentheses, index expressions,
/// function arguments and unary operators.
const MAX_NESTING: usize = 128;

/// Maximum height of the resulting tree. Long operator chains build deep
/// trees without deep parser recursion, and evaluation walks the tree
/// recursively.
const MAX_DEPTH: usize = 256;

fn too_deep() -> ParseError {
    ParseError::Syntax("expression nested too deeply".to_string())
}

pub(crate) fn parse(source: &str, functions: &FunctionRegistry) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(source).tokenize().map_err(ParseError::Syntax)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        nesting: 0,
        functions,
    };
    let node = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ParseError::Syntax(format!("unexpected {extra} after expression")));
    }
    Ok(node.expr)
}

/// An expression together with the height of its tree.
struct Node {
    expr: Expr,
    depth: usize,
}

impl Node {
    fn leaf(expr: Expr) -> Self {
        Self { expr, depth: 1 }
    }

    fn branch(expr: Expr, child_depth: usize) -> Result<Self, ParseError> {
        let depth = child_depth + 1;
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        Ok(Self { expr, depth })
    }

    fn binary(op: BinaryOp, left: Node, right: Node) -> Result<Self, ParseError> {
        let depth = left.depth.max(right.depth);
        Self::branch(
            Expr::Binary(op, Box::new(left.expr), Box::new(right.expr)),
            depth,
        )
    }
}

struct Parser<'f> {
    tokens: Vec<Token>,
    cursor: usize,
    nesting: usize,
    functions: &'f FunctionRegistry,
}

impl Parser<'_> {
    /// Run `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.nesting >= MAX_NESTING {
            return Err(too_deep());
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Node::binary(BinaryOp::Or, left, right)?;
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            let right = self.parse_equality()?;
            left = Node::binary(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.parse_relational()?;
            left = Node::binary(op, left, right)?;
        }
    }

    fn parse_relational(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.parse_additive()?;
            left = Node::binary(op, left, right)?;
        }
    }

    fn parse_additive(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.parse_multiplicative()?;
            left = Node::binary(op, left, right)?;
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.parse_unary()?;
            left = Node::binary(op, left, right)?;
        }
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        let op = match self.peek() {
            Some(Token::Not) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Empty) => UnaryOp::Empty,
            _ => return self.parse_postfix(),
        };
        self.cursor += 1;
        let operand = self.nested(Self::parse_unary)?;
        Node::branch(Expr::Unary(op, Box::new(operand.expr)), operand.depth)
    }

    fn parse_postfix(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(name)) => {
                        node = Node::branch(Expr::Member(Box::new(node.expr), name), node.depth)?;
                    }
                    other => return Err(unexpected(other, "property name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.nested(Self::parse_or)?;
                self.expect(&Token::RBracket)?;
                let depth = node.depth.max(index.depth);
                node = Node::branch(
                    Expr::Index(Box::new(node.expr), Box::new(index.expr)),
                    depth,
                )?;
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        match self.advance() {
            Some(Token::True) => Ok(Node::leaf(Expr::Literal(ContextValue::Bool(true)))),
            Some(Token::False) => Ok(Node::leaf(Expr::Literal(ContextValue::Bool(false)))),
            Some(Token::Null) => Ok(Node::leaf(Expr::Literal(ContextValue::Null))),
            Some(Token::Int(i)) => Ok(Node::leaf(Expr::Literal(ContextValue::Int(i)))),
            Some(Token::Float(f)) => Ok(Node::leaf(Expr::Literal(ContextValue::Float(f)))),
            Some(Token::Str(s)) => Ok(Node::leaf(Expr::Literal(ContextValue::String(s)))),
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::Colon) {
                    self.cursor += 1;
                    let local = match self.advance() {
                        Some(Token::Ident(local)) => local,
                        other => return Err(unexpected(other, "function name after ':'")),
                    };
                    if name != FUNCTION_NAMESPACE {
                        return Err(ParseError::UnknownFunction(format!("{name}:{local}")));
                    }
                    self.parse_call(&local)
                } else if self.peek() == Some(&Token::LParen) {
                    self.parse_call(&name)
                } else {
                    Ok(Node::leaf(Expr::Identifier(name)))
                }
            }
            other => Err(unexpected(other, "an expression")),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Node, ParseError> {
        let function = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| ParseError::UnknownFunction(name.to_string()))?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        let mut depth = 0;
        if !self.eat(&Token::RParen) {
            loop {
                let arg = self.nested(Self::parse_or)?;
                depth = depth.max(arg.depth);
                args.push(arg.expr);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        if args.len() != function.arity() {
            return Err(ParseError::Syntax(format!(
                "function '{}' expects {} argument(s), got {}",
                function.name(),
                function.arity(),
                args.len()
            )));
        }
        Node::branch(Expr::Call(function, args), depth)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            let found = self.peek().cloned();
            Err(unexpected(found, &expected.to_string()))
        }
    }
}

fn unexpected(found: Option<Token>, wanted: &str) -> ParseError {
    match found {
        Some(token) => ParseError::Syntax(format!("expected {wanted}, found {token}")),
        None => ParseError::Syntax(format!("expected {wanted}, found end of rule")),
    }
}
