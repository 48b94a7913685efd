use std::rc::Rc;

/// Statements of the allowed subset. Anything outside this enum is rejected
/// at parse time.
#[derive(Clone, Debug)]
pub enum Stmt {
    Expr(Expr),
    /// `a = b = value` keeps every target; unpacking targets nest.
    Assign { targets: Vec<Target>, value: Expr },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
    },
    FuncDef {
        name: String,
        params: Rc<ParamSpec>,
        body: Rc<[Stmt]>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        finally: Vec<Stmt>,
    },
    /// `raise` / `raise Err("msg")`.
    Raise(Option<Expr>),
}

#[derive(Clone, Debug)]
pub enum Target {
    Name(String),
    /// `obj[index] = value`
    Index { obj: Expr, index: Expr },
    /// Tuple/list unpacking, e.g. `a, (b, c) = ...`
    Unpack(Vec<Target>),
}

#[derive(Clone, Debug)]
pub struct ExceptHandler {
    /// Exception class names; empty means a bare `except:`.
    pub classes: Vec<String>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug, Default)]
pub struct ParamSpec {
    pub params: Vec<Param>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Expr {
    None,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    FString(Vec<FStringPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Set(Vec<Expr>),
    Attr {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<CallArg>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolChain {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Not(Box<Expr>),
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    /// `body if test else orelse`
    Cond {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda {
        params: Rc<ParamSpec>,
        body: Rc<Expr>,
    },
    Comp {
        kind: CompKind,
        key: Box<Expr>,
        /// Value expression for dict comprehensions only.
        value: Option<Box<Expr>>,
        clauses: Vec<CompClause>,
    },
}

#[derive(Clone, Debug)]
pub enum FStringPart {
    Lit(String),
    /// `{expr}`, `{expr!r}`, `{expr:spec}`; the spec is raw text.
    Expr {
        expr: Expr,
        conversion: Option<char>,
        format: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct CompClause {
    pub target: Target,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

/// One call-site argument in source order.
#[derive(Clone, Debug)]
pub enum CallArg {
    Positional(Expr),
    Keyword(String, Expr),
    Star(Expr),
    DoubleStar(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}
