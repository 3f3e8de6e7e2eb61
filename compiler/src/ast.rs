// ast.rs — Resolved host-language syntax tree for one compilation unit
//
// The external front end parses host-language source, resolves types and
// overloads, and hands the result over in this arena form. Nodes are
// addressed by u32 ids in creation (source) order; spans are byte offsets
// into the unit source. Every expression carries its resolved type as text,
// a compile-time-constant flag, and the folded value for integer constants.
//
// Preconditions: produced by a front end (or `builder::UnitBuilder`) from
//                fully resolved input.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Span ─────────────────────────────────────────────────────────────────

/// Byte-offset span in the unit source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    /// Zero-width span at a byte offset.
    pub fn at(pos: usize) -> Self {
        Span {
            start: pos,
            end: pos,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ── Node identifiers ─────────────────────────────────────────────────────
//
// Allocated in creation order by the front end / builder. An ExprId is the
// node identity used for reference deduplication: re-visiting the same
// syntactic occurrence yields the same id.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeclId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

// ── Well-known type names ────────────────────────────────────────────────

/// Resolved type names the analysis dispatches on. The front end reports
/// these exact strings for the DSL index types.
pub mod types {
    /// Type of a parity expression (`EVEN`, `ODD`, `ALL`, or a runtime value).
    pub const PARITY: &str = "Parity";
    /// Type of the per-site index symbol `X`.
    pub const SITE: &str = "SiteIndex";
    /// Result type of `X + Direction`.
    pub const SITE_NEIGHBOR: &str = "SiteNeighbor";
    /// Result type of `X + CoordinateVector`.
    pub const SITE_OFFSET: &str = "SiteOffset";
    /// Type of a lattice direction value.
    pub const DIRECTION: &str = "Direction";
    /// Type of a general coordinate shift.
    pub const COORD_VECTOR: &str = "CoordinateVector";
    /// Per-site container template prefix.
    pub const FIELD_PREFIX: &str = "Field<";
}

/// Extract `T` from a `Field<T>` type name. Returns `None` when the type is
/// not a field template instance.
pub fn field_element_type(ty: &str) -> Option<&str> {
    let rest = ty.strip_prefix(types::FIELD_PREFIX)?;
    let inner = rest.strip_suffix('>')?;
    Some(inner.trim())
}

/// True when the type text names a per-site field container.
pub fn is_field_type(ty: &str) -> bool {
    ty.starts_with(types::FIELD_PREFIX) && ty.ends_with('>')
}

/// Element type of a non-field container (`std::vector<T>`, `T[N]`).
pub fn container_element_type(ty: &str) -> Option<&str> {
    if let Some(rest) = ty.strip_prefix("std::vector<") {
        return rest.strip_suffix('>').map(str::trim);
    }
    if let Some(open) = ty.find('[') {
        if ty.ends_with(']') {
            return Some(ty[..open].trim());
        }
    }
    None
}

// ── Parity ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Even,
    Odd,
    All,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::Even => "EVEN",
            Parity::Odd => "ODD",
            Parity::All => "ALL",
        };
        write!(f, "{}", s)
    }
}

// ── Operators ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
}

impl AssignOp {
    /// Compound assignments read the target as well as writing it.
    pub fn is_compound(&self) -> bool {
        !matches!(self, AssignOp::Assign)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::AddAssign => "+=",
            AssignOp::SubAssign => "-=",
            AssignOp::MulAssign => "*=",
            AssignOp::DivAssign => "/=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::EqEq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    /// Resolved static type as text (e.g. `double`, `Field<Complex>`).
    pub ty: String,
    /// True when the front end proved the expression a compile-time constant.
    #[serde(default)]
    pub is_const: bool,
    /// Folded value for integer-valued constants.
    #[serde(default)]
    pub const_value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    /// Parity literal `EVEN` / `ODD` / `ALL`.
    ParityLit(Parity),
    /// The per-site index symbol `X`.
    Site,
    VarRef {
        decl: DeclId,
    },
    /// `base[index]` — a field access when `base` has field type.
    Index {
        base: ExprId,
        index: ExprId,
    },
    Member {
        base: ExprId,
        member: String,
    },
    Unary {
        op: UnOp,
        operand: ExprId,
    },
    AddrOf(ExprId),
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Assign {
        op: AssignOp,
        target: ExprId,
        value: ExprId,
    },
    Call(CallExpr),
    Ternary {
        cond: ExprId,
        then_arm: ExprId,
        else_arm: ExprId,
    },
    Paren(ExprId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    /// Resolved callee, when the front end could name one.
    pub func: Option<FuncId>,
    pub name: String,
    pub args: Vec<ExprId>,
}

// ── Statements ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
    #[serde(default)]
    pub pragmas: Vec<Pragma>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(ExprId),
    Decl {
        decl: DeclId,
        init: Option<ExprId>,
    },
    Block(Vec<StmtId>),
    If {
        cond: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
    },
    For {
        init: Option<StmtId>,
        cond: Option<ExprId>,
        step: Option<ExprId>,
        body: StmtId,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    DoWhile {
        body: StmtId,
        cond: ExprId,
    },
    Switch {
        cond: ExprId,
        body: StmtId,
    },
    /// `onsites(parity) { … }` — the block form of the site loop.
    SiteLoop {
        parity: ExprId,
        body: StmtId,
    },
    Return(Option<ExprId>),
}

// ── Declarations ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    Auto,
    Static,
    Extern,
}

impl Storage {
    fn auto() -> Storage {
        Storage::Auto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decl {
    pub name: String,
    pub ty: String,
    pub span: Span,
    #[serde(default = "Storage::auto")]
    pub storage: Storage,
}

// ── Pragmas ──────────────────────────────────────────────────────────────

/// Source annotations recognized as configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pragma {
    /// Disable vector-backend eligibility for the annotated loop.
    NoVectorize,
    /// Listed variables bypass dependency tracking inside the loop.
    RawAccess(Vec<String>),
    /// The annotated function may be called from a site loop without
    /// being analyzed as one.
    LoopCallable,
    /// Dump the annotated subtree to stderr; no semantic effect.
    DumpTree,
}

// ── Functions and classes ────────────────────────────────────────────────

/// One generic parameter → deduced argument binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericArg {
    /// Generic parameter name as spelled in the definition.
    pub param: String,
    /// Deduced argument, as type or value text.
    pub arg: String,
    /// Where the argument type is declared in this unit. `None` for
    /// builtins and types declared elsewhere.
    #[serde(default)]
    pub decl_span: Option<Span>,
}

/// Generic standing of a function definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateKind {
    /// Ordinary non-generic function.
    Plain,
    /// A generic definition pattern; never analyzed directly.
    Primary,
    /// A concrete instantiation of a generic (possibly through an
    /// enclosing generic class); carries the substitution in `generics`.
    Specialization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub decl: DeclId,
    pub name: String,
    pub ty: String,
    /// Passed by reference.
    #[serde(default)]
    pub by_ref: bool,
    /// Reference-to-const; a by-ref parameter that is not const may be
    /// written through.
    #[serde(default)]
    pub is_const: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub qualified_name: String,
    /// Full definition span, including the body.
    pub span: Span,
    /// Span of the name token inside the definition. `None` when the name
    /// stems from an out-of-line declaration and must be hunted for.
    #[serde(default)]
    pub name_span: Option<Span>,
    /// Byte offset where the body `{` begins; `span.start..decl_end` is
    /// the declaration part used as the canonical signature.
    pub decl_end: usize,
    pub body: Option<StmtId>,
    pub params: Vec<Param>,
    pub return_type: String,
    #[serde(default)]
    pub is_inline: bool,
    pub template: TemplateKind,
    /// Substitution for the function's own generic parameters
    /// (specializations only).
    #[serde(default)]
    pub generics: Vec<GenericArg>,
    /// Enclosing class, innermost first in the parent chain.
    #[serde(default)]
    pub parent: Option<ClassId>,
    #[serde(default)]
    pub pragmas: Vec<Pragma>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    /// Full class definition span.
    pub span: Span,
    /// Byte offset just past the terminating `;`.
    pub end: usize,
    /// Substitution level contributed by this class when it is a generic
    /// instance enclosing a specialized method.
    #[serde(default)]
    pub generics: Vec<GenericArg>,
    #[serde(default)]
    pub parent: Option<ClassId>,
}

// ── Compilation unit ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    /// Compilation unit name (file stem).
    pub name: String,
    /// Full source text of the unit.
    pub source: String,
    pub exprs: Vec<Expr>,
    pub stmts: Vec<Stmt>,
    pub decls: Vec<Decl>,
    pub functions: Vec<Function>,
    pub classes: Vec<ClassDecl>,
    /// Function definitions in source order.
    pub order: Vec<FuncId>,
}

impl Unit {
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn class(&self, id: ClassId) -> &ClassDecl {
        &self.classes[id.0 as usize]
    }

    /// Exact source text spanned by a node.
    pub fn text(&self, span: Span) -> &str {
        &self.source[span.start..span.end]
    }

    pub fn expr_text(&self, id: ExprId) -> &str {
        self.text(self.expr(id).span)
    }

    /// True when the expression has per-site field type.
    pub fn is_field_expr(&self, id: ExprId) -> bool {
        is_field_type(&self.expr(id).ty)
    }

    /// Strip grouping parentheses.
    pub fn skip_parens(&self, mut id: ExprId) -> ExprId {
        while let ExprKind::Paren(inner) = self.expr(id).kind {
            id = inner;
        }
        id
    }

    /// Walk an index/member chain down to the variable at its base, the way
    /// compound accesses like `s.m[i][j]` resolve to `s`. Returns `None`
    /// when the base is not a plain variable (a call result, a literal).
    pub fn find_base_decl(&self, id: ExprId) -> Option<DeclId> {
        let mut cur = self.skip_parens(id);
        loop {
            match &self.expr(cur).kind {
                ExprKind::VarRef { decl } => return Some(*decl),
                ExprKind::Index { base, .. } => cur = self.skip_parens(*base),
                ExprKind::Member { base, .. } => cur = self.skip_parens(*base),
                _ => return None,
            }
        }
    }

    /// True when any node of the expression tree is a per-site field access.
    pub fn contains_field_access(&self, id: ExprId) -> bool {
        let e = self.expr(id);
        if let ExprKind::Index { base, .. } = &e.kind {
            if self.is_field_expr(*base) {
                return true;
            }
        }
        self.children(id)
            .iter()
            .any(|&c| self.contains_field_access(c))
    }

    /// Generic instances of a class template, by name (the query side of
    /// the front end's specialization enumeration).
    pub fn class_specializations(&self, name: &str) -> Vec<ClassId> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.name == name && !c.generics.is_empty())
            .map(|(i, _)| ClassId(i as u32))
            .collect()
    }

    /// Direct subexpressions of a node.
    pub fn children(&self, id: ExprId) -> Vec<ExprId> {
        match &self.expr(id).kind {
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::ParityLit(_)
            | ExprKind::Site
            | ExprKind::VarRef { .. } => Vec::new(),
            ExprKind::Index { base, index } => vec![*base, *index],
            ExprKind::Member { base, .. } => vec![*base],
            ExprKind::Unary { operand, .. } => vec![*operand],
            ExprKind::AddrOf(operand) => vec![*operand],
            ExprKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            ExprKind::Assign { target, value, .. } => vec![*target, *value],
            ExprKind::Call(call) => call.args.clone(),
            ExprKind::Ternary {
                cond,
                then_arm,
                else_arm,
            } => vec![*cond, *then_arm, *else_arm],
            ExprKind::Paren(inner) => vec![*inner],
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
