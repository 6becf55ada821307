use std::fmt;
use std::sync::Arc;

/// Name of the resource a node was parsed from, if any. Shared across every
/// node of one parse.
pub(crate) type ResourceName = Option<Arc<str>>;

/// A node in the parse tree. Rendering a node adds its contribution to the
/// output: plain text, one branch of an `#if`, the value of a reference, and
/// so on. Nodes are immutable once built and record where they came from for
/// diagnostics.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) resource: ResourceName,
    pub(crate) line: u32,
    pub(crate) kind: NodeKind,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    /// Concatenation of a sequence of nodes.
    Cons(Vec<Node>),
    /// Literal template text, including verbatim `#[[..]]#` content.
    Text(String),
    /// A comment. Contributes nothing, but participates in the `#set`
    /// whitespace elision rules.
    Comment,
    /// An expression rendered into the output, such as a `$reference`.
    Expr(Expr),
    If {
        condition: Expr,
        true_part: Box<Node>,
        false_part: Box<Node>,
    },
    ForEach {
        var: String,
        collection: Expr,
        body: Box<Node>,
    },
    Set {
        var: String,
        expr: Expr,
    },
    Define {
        var: String,
        body: Arc<Node>,
    },
    MacroCall {
        name: String,
        args: Vec<Arc<Expr>>,
        /// Present for the `#@name(..) body #end` form.
        body: Option<Arc<Node>>,
    },
    Break {
        scope: Option<Expr>,
    },
    Parse {
        resource_expr: Expr,
    },
    Evaluate {
        expr: Expr,
    },
}

impl Node {
    pub(crate) fn new(resource: &ResourceName, line: u32, kind: NodeKind) -> Node {
        Node {
            resource: resource.clone(),
            line,
            kind,
        }
    }

    /// An empty node, used for example as the missing `#else` branch.
    pub(crate) fn empty(resource: &ResourceName, line: u32) -> Node {
        Node::new(resource, line, NodeKind::Cons(Vec::new()))
    }

    pub(crate) fn cons(resource: &ResourceName, line: u32, nodes: Vec<Node>) -> Node {
        Node::new(resource, line, NodeKind::Cons(nodes))
    }

    /// True if this node is a span of text that is all whitespace.
    pub(crate) fn is_whitespace(&self) -> bool {
        match &self.kind {
            NodeKind::Text(text) => text.chars().all(char::is_whitespace),
            _ => false,
        }
    }

    /// True if this node is all whitespace with no newline in it.
    pub(crate) fn is_horizontal_whitespace(&self) -> bool {
        match &self.kind {
            NodeKind::Text(text) => text.chars().all(|c| c.is_whitespace() && c != '\n'),
            _ => false,
        }
    }

    /// True for the directive node kinds, as the whitespace elision rules
    /// classify them. Comments and plain expressions are not directives.
    pub(crate) fn is_directive(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::If { .. }
                | NodeKind::ForEach { .. }
                | NodeKind::Set { .. }
                | NodeKind::Define { .. }
                | NodeKind::MacroCall { .. }
                | NodeKind::Break { .. }
                | NodeKind::Parse { .. }
                | NodeKind::Evaluate { .. }
        )
    }

    pub(crate) fn is_reference(&self) -> bool {
        matches!(
            &self.kind,
            NodeKind::Expr(Expr {
                kind: ExprKind::Ref(_),
                ..
            })
        )
    }

    pub(crate) fn is_set(&self) -> bool {
        matches!(self.kind, NodeKind::Set { .. })
    }

    pub(crate) fn is_comment(&self) -> bool {
        matches!(self.kind, NodeKind::Comment)
    }
}

/// An expression in the parse tree. Expressions appear inside directives and
/// inside reference suffixes, and evaluate to a [`crate::Value`].
#[derive(Debug)]
pub(crate) struct Expr {
    pub(crate) resource: ResourceName,
    pub(crate) line: u32,
    pub(crate) kind: ExprKind,
}

#[derive(Debug)]
pub(crate) enum ExprKind {
    Constant(Constant),
    /// A quoted string. Double-quoted strings were parsed as a nested
    /// mini-template, so the nodes may include references and directives.
    StringLiteral { quote: char, nodes: Vec<Node> },
    ListLiteral(Vec<Expr>),
    RangeLiteral { first: Box<Expr>, last: Box<Expr> },
    Binary {
        lhs: Box<Expr>,
        op: Operator,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    Ref(RefExpr),
}

#[derive(Debug, Clone)]
pub(crate) enum Constant {
    Null,
    Bool(bool),
    Int(i32),
}

/// A `$`-rooted reference chain. The silent flag from `$!` is carried on
/// every link of the chain.
#[derive(Debug)]
pub(crate) enum RefExpr {
    Plain {
        id: String,
        silent: bool,
    },
    Member {
        lhs: Box<RefExpr>,
        id: String,
        silent: bool,
    },
    Method {
        lhs: Box<RefExpr>,
        id: String,
        args: Vec<Expr>,
        silent: bool,
    },
    Index {
        lhs: Box<RefExpr>,
        index: Box<Expr>,
        silent: bool,
    },
}

impl RefExpr {
    pub(crate) fn silent(&self) -> bool {
        match self {
            RefExpr::Plain { silent, .. }
            | RefExpr::Member { silent, .. }
            | RefExpr::Method { silent, .. }
            | RefExpr::Index { silent, .. } => *silent,
        }
    }
}

impl Expr {
    pub(crate) fn new(resource: &ResourceName, line: u32, kind: ExprKind) -> Expr {
        Expr {
            resource: resource.clone(),
            line,
            kind,
        }
    }

    /// Binary expressions take their location from the left operand.
    pub(crate) fn binary(lhs: Expr, op: Operator, rhs: Expr) -> Expr {
        let resource = lhs.resource.clone();
        let line = lhs.line;
        Expr {
            resource,
            line,
            kind: ExprKind::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            },
        }
    }

    pub(crate) fn not(expr: Expr) -> Expr {
        let resource = expr.resource.clone();
        let line = expr.line;
        Expr {
            resource,
            line,
            kind: ExprKind::Not(Box::new(expr)),
        }
    }

    /// True if a null value of this expression is silently dropped from the
    /// output instead of raising an error.
    pub(crate) fn is_silent(&self) -> bool {
        match &self.kind {
            ExprKind::Ref(r) => r.silent(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Plus,
    Minus,
    Times,
    Divide,
    Remainder,
}

impl Operator {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Operator::Or => "||",
            Operator::And => "&&",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Times => "*",
            Operator::Divide => "/",
            Operator::Remainder => "%",
        }
    }

    /// Precedence, low to high. The parser's dummy "stop" level is 0.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            Operator::Or => 1,
            Operator::And => 2,
            Operator::Equal | Operator::NotEqual => 3,
            Operator::Less
            | Operator::LessOrEqual
            | Operator::Greater
            | Operator::GreaterOrEqual => 4,
            Operator::Plus | Operator::Minus => 5,
            Operator::Times | Operator::Divide | Operator::Remainder => 6,
        }
    }

    /// The ordering comparisons, which reject null operands.
    pub(crate) fn is_inequality(self) -> bool {
        self.precedence() == 4
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// The Display impls below reconstruct the source form of a node. This is what
// error messages show, and what a null operand turns into during string
// concatenation, so the output must match what Velocity prints for the
// expression forms (`$x`, `$x.foo(23)`, `[1..3]`, parenthesised operands of
// lower precedence).

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Constant(c) => write!(f, "{c}"),
            ExprKind::StringLiteral { quote, nodes } => {
                write!(f, "{quote}")?;
                for node in nodes {
                    write!(f, "{node}")?;
                }
                write!(f, "{quote}")
            }
            ExprKind::ListLiteral(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
            ExprKind::RangeLiteral { first, last } => write!(f, "[{first}..{last}]"),
            ExprKind::Binary { lhs, op, rhs } => {
                write_operand(f, lhs, *op)?;
                write!(f, " {op} ")?;
                write_operand(f, rhs, *op)
            }
            ExprKind::Not(expr) => {
                if matches!(expr.kind, ExprKind::Binary { .. }) {
                    write!(f, "!({expr})")
                } else {
                    write!(f, "!{expr}")
                }
            }
            ExprKind::Ref(r) => write!(f, "{r}"),
        }
    }
}

/// Restores the parentheses in, for example, `(2 + 3) * 4`.
fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expr, op: Operator) -> fmt::Result {
    if let ExprKind::Binary { op: inner, .. } = &operand.kind
        && inner.precedence() < op.precedence()
    {
        return write!(f, "({operand})");
    }
    write!(f, "{operand}")
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(i) => write!(f, "{i}"),
        }
    }
}

impl fmt::Display for RefExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefExpr::Plain { id, silent } => {
                if *silent {
                    write!(f, "$!{id}")
                } else {
                    write!(f, "${id}")
                }
            }
            RefExpr::Member { lhs, id, .. } => write!(f, "{lhs}.{id}"),
            RefExpr::Method { lhs, id, args, .. } => {
                write!(f, "{lhs}.{id}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            RefExpr::Index { lhs, index, .. } => write!(f, "{lhs}[{index}]"),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Cons(nodes) => {
                for node in nodes {
                    write!(f, "{node}")?;
                }
                Ok(())
            }
            NodeKind::Text(text) => f.write_str(text),
            NodeKind::Comment => Ok(()),
            NodeKind::Expr(expr) => write!(f, "{expr}"),
            NodeKind::If {
                condition,
                true_part,
                false_part,
            } => {
                write!(f, "#if ({condition}){true_part}")?;
                if !matches!(&false_part.kind, NodeKind::Cons(nodes) if nodes.is_empty()) {
                    write!(f, "#else{false_part}")?;
                }
                write!(f, "#end")
            }
            NodeKind::ForEach {
                var,
                collection,
                body,
            } => write!(f, "#foreach (${var} in {collection}){body}#end"),
            NodeKind::Set { var, expr } => write!(f, "#set (${var} = {expr})"),
            NodeKind::Define { var, body } => write!(f, "#define (${var}){body}#end"),
            NodeKind::MacroCall { name, args, body } => {
                let prefix = if body.is_some() { "#@" } else { "#" };
                write!(f, "{prefix}{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")?;
                if let Some(body) = body {
                    write!(f, "{body}#end")?;
                }
                Ok(())
            }
            NodeKind::Break { scope } => match scope {
                Some(scope) => write!(f, "#break({scope})"),
                None => write!(f, "#break"),
            },
            NodeKind::Parse { resource_expr } => write!(f, "#parse({resource_expr})"),
            NodeKind::Evaluate { expr } => write!(f, "#evaluate({expr})"),
        }
    }
}
