use super::value::{VBType, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Equal => "=",
            BinOp::NotEqual => "!=",
            BinOp::Less => "<",
            BinOp::Greater => ">",
            BinOp::LessEqual => "<=",
            BinOp::GreaterEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation of a number.
    Negate,
    /// Logical "not" of a boolean.
    Invert,
}

/// A procedure parameter as written in `how to "name" given x, a number.`
///
/// `ty` is `None` when the source left the type out; the compiler infers it
/// from how the body uses the parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Option<VBType>,
}

impl Param {
    pub fn typed(name: impl Into<String>, ty: VBType) -> Self {
        Param {
            name: name.into(),
            ty: Some(ty),
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            ty: None,
        }
    }
}

/// AST produced by the parser and consumed by the bytecode compiler.
///
/// The parser guarantees the tree is grammatically well formed; every
/// name, type and arity check happens in the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Literal value, possibly a nested constant list.
    Value(Value),

    Unary {
        op: UnaryOp,
        expr: Box<Node>,
    },

    Binary {
        left: Box<Node>,
        op: BinOp,
        right: Box<Node>,
    },

    /// The value produced by the previous statement of the same block.
    TheResult,

    VarRef(String),

    /// `variable name, a type, from value`
    VarDecl {
        name: String,
        ty: Option<VBType>,
        value: Option<Box<Node>>,
    },

    /// `set name to value`
    VarSet {
        name: String,
        value: Box<Node>,
    },

    If {
        condition: Box<Node>,
        then: Vec<Node>,
        otherwise: Option<Vec<Node>>,
    },

    While {
        condition: Box<Node>,
        body: Vec<Node>,
    },

    /// `repeat times times: body`
    Repeat {
        times: Box<Node>,
        body: Vec<Node>,
    },

    Call {
        name: String,
        args: Vec<Node>,
    },

    /// `how to "name" given params [giving back type]. body done`
    ProcDef {
        name: String,
        params: Vec<Param>,
        return_type: Option<VBType>,
        body: Vec<Node>,
    },

    Convert {
        expr: Box<Node>,
        target: VBType,
    },

    Return(Option<Box<Node>>),

    /// List literal with arbitrary item expressions.
    List(Vec<Node>),

    /// `#index of list`, 1-based.
    ListGet {
        index: Box<Node>,
        list: Box<Node>,
    },

    /// `set #index of list to value`
    ListSet {
        index: Box<Node>,
        list: Box<Node>,
        value: Box<Node>,
    },
}

// Construction helpers, mostly for front ends and tests.
impl Node {
    pub fn number(n: f64) -> Node {
        Node::Value(Value::Number(n))
    }

    pub fn string(s: impl Into<String>) -> Node {
        Node::Value(Value::String(s.into()))
    }

    pub fn boolean(b: bool) -> Node {
        Node::Value(Value::Boolean(b))
    }

    pub fn var(name: impl Into<String>) -> Node {
        Node::VarRef(name.into())
    }

    pub fn binary(left: Node, op: BinOp, right: Node) -> Node {
        Node::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, expr: Node) -> Node {
        Node::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    pub fn declare(name: impl Into<String>, ty: Option<VBType>, value: Node) -> Node {
        Node::VarDecl {
            name: name.into(),
            ty,
            value: Some(Box::new(value)),
        }
    }

    pub fn assign(name: impl Into<String>, value: Node) -> Node {
        Node::VarSet {
            name: name.into(),
            value: Box::new(value),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Node>) -> Node {
        Node::Call {
            name: name.into(),
            args,
        }
    }

    pub fn convert(expr: Node, target: VBType) -> Node {
        Node::Convert {
            expr: Box::new(expr),
            target,
        }
    }

    pub fn ret(expr: Option<Node>) -> Node {
        Node::Return(expr.map(Box::new))
    }

    /// Short name of the node kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Value(v) => match v {
                Value::Number(_) => "number literal",
                Value::String(_) => "string literal",
                Value::Boolean(_) => "boolean literal",
                Value::List(_) => "list literal",
                Value::Void => "void literal",
            },
            Node::Unary { op: UnaryOp::Negate, .. } => "negation",
            Node::Unary { op: UnaryOp::Invert, .. } => "not",
            Node::Binary { .. } => "operator",
            Node::TheResult => "the result",
            Node::VarRef(_) => "variable",
            Node::VarDecl { .. } => "variable declaration",
            Node::VarSet { .. } => "assignment",
            Node::If { .. } => "if",
            Node::While { .. } => "while",
            Node::Repeat { .. } => "repeat",
            Node::Call { .. } => "procedure call",
            Node::ProcDef { .. } => "procedure definition",
            Node::Convert { .. } => "conversion",
            Node::Return(_) => "return",
            Node::List(_) => "list",
            Node::ListGet { .. } => "list item",
            Node::ListSet { .. } => "list item assignment",
        }
    }

    /// Whether every path through this statement ends in `return`.
    pub fn always_returns(&self) -> bool {
        match self {
            Node::Return(_) => true,
            Node::If {
                then,
                otherwise: Some(otherwise),
                ..
            } => block_always_returns(then) && block_always_returns(otherwise),
            _ => false,
        }
    }
}

pub fn block_always_returns(block: &[Node]) -> bool {
    block.last().is_some_and(Node::always_returns)
}
