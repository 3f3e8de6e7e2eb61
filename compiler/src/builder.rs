// builder.rs — Programmatic construction of resolved units
//
// `UnitBuilder` is the in-process population path for the `ast` arenas: it
// creates nodes bottom-up, synthesizes the unit source text, and assigns
// exact byte spans when an item (external declaration, type, class,
// function) is added to the unit. Tests drive the analysis through it; a
// front end may use it instead of the JSON form.
//
// Expressions and statements carry pending text until their enclosing item
// is added; adding the item writes the text into the unit source and
// rebases every node span onto its final position.
//
// Preconditions: items are added after their bodies are fully built; a
//                node is used by at most one parent.
// Postconditions: `unit.text(node.span)` returns exactly the node's text.
// Failure modes: none (panics indicate builder misuse, test-only code).
// Side effects: none.

use std::collections::HashMap;

use crate::ast::*;

// ── Pending node text ────────────────────────────────────────────────────

/// One segment of a composed expression text: literal text or a child
/// expression (recorded with its offset for later span rebasing).
enum Part<'a> {
    T(&'a str),
    E(ExprId),
}

#[derive(Debug, Clone, Default)]
struct PendExpr {
    text: String,
    kids: Vec<(ExprId, usize)>,
}

#[derive(Debug, Clone, Default)]
struct PendStmt {
    text: String,
    ekids: Vec<(ExprId, usize)>,
    skids: Vec<(StmtId, usize)>,
}

// ── Function / method descriptors ────────────────────────────────────────

/// Everything needed to add one function definition to the unit.
#[derive(Debug, Clone)]
pub struct FnDef {
    pub name: String,
    /// Qualified name used when re-emitting a specialization; defaults to
    /// `name` (or `Class::name` for methods).
    pub qualified: Option<String>,
    pub ret: String,
    pub params: Vec<Param>,
    pub body: StmtId,
    pub template: TemplateKind,
    pub generics: Vec<GenericArg>,
    pub is_inline: bool,
    pub pragmas: Vec<Pragma>,
}

impl FnDef {
    pub fn plain(name: &str, ret: &str, params: Vec<Param>, body: StmtId) -> Self {
        FnDef {
            name: name.to_string(),
            qualified: None,
            ret: ret.to_string(),
            params,
            body,
            template: TemplateKind::Plain,
            generics: Vec::new(),
            is_inline: false,
            pragmas: Vec::new(),
        }
    }

    pub fn specialization(
        name: &str,
        ret: &str,
        params: Vec<Param>,
        body: StmtId,
        generics: Vec<GenericArg>,
    ) -> Self {
        FnDef {
            name: name.to_string(),
            qualified: None,
            ret: ret.to_string(),
            params,
            body,
            template: TemplateKind::Specialization,
            generics,
            is_inline: false,
            pragmas: Vec::new(),
        }
    }

    pub fn inline(mut self) -> Self {
        self.is_inline = true;
        self
    }

    pub fn with_pragma(mut self, p: Pragma) -> Self {
        self.pragmas.push(p);
        self
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct UnitBuilder {
    unit: Unit,
    pend_exprs: Vec<PendExpr>,
    pend_stmts: Vec<PendStmt>,
    named_consts: HashMap<String, DeclId>,
}

impl UnitBuilder {
    pub fn new(name: &str) -> Self {
        UnitBuilder {
            unit: Unit {
                name: name.to_string(),
                source: String::new(),
                exprs: Vec::new(),
                stmts: Vec::new(),
                decls: Vec::new(),
                functions: Vec::new(),
                classes: Vec::new(),
                order: Vec::new(),
            },
            pend_exprs: Vec::new(),
            pend_stmts: Vec::new(),
            named_consts: HashMap::new(),
        }
    }

    /// The unit under construction. Spans of nodes not yet attached to an
    /// added item are not final.
    pub fn peek(&self) -> &Unit {
        &self.unit
    }

    pub fn finish(self) -> Unit {
        self.unit
    }

    // ── Declarations ────────────────────────────────────────────────────

    /// Declare a variable outside any loop; emits `ty name;` at unit level.
    pub fn external_var(&mut self, name: &str, ty: &str) -> DeclId {
        let start = self.unit.source.len();
        self.unit
            .source
            .push_str(&format!("{} {};\n", ty, name));
        let name_start = start + ty.len() + 1;
        let id = DeclId(self.unit.decls.len() as u32);
        self.unit.decls.push(Decl {
            name: name.to_string(),
            ty: ty.to_string(),
            span: Span::new(name_start, name_start + name.len()),
            storage: Storage::Auto,
        });
        id
    }

    /// Declare a per-site field container outside any loop.
    pub fn field(&mut self, name: &str, element_ty: &str) -> DeclId {
        self.external_var(name, &format!("Field<{}>", element_ty))
    }

    /// Declaration used inside a loop body (span assigned on placement of
    /// its `decl_stmt`).
    pub fn local_decl(&mut self, name: &str, ty: &str) -> DeclId {
        self.make_decl(name, ty, Storage::Auto)
    }

    pub fn static_decl(&mut self, name: &str, ty: &str) -> DeclId {
        self.make_decl(name, ty, Storage::Static)
    }

    fn make_decl(&mut self, name: &str, ty: &str, storage: Storage) -> DeclId {
        let id = DeclId(self.unit.decls.len() as u32);
        self.unit.decls.push(Decl {
            name: name.to_string(),
            ty: ty.to_string(),
            span: Span::at(0),
            storage,
        });
        id
    }

    /// Parameter declaration for a function under construction.
    pub fn param(&mut self, name: &str, ty: &str, by_ref: bool, is_const: bool) -> Param {
        let decl = self.make_decl(name, ty, Storage::Auto);
        Param {
            decl,
            name: name.to_string(),
            ty: ty.to_string(),
            by_ref,
            is_const,
        }
    }

    /// Emit a type declaration (`struct Name { };`) and return its span,
    /// for use as a `GenericArg::decl_span`.
    pub fn declare_type(&mut self, name: &str) -> Span {
        let start = self.unit.source.len();
        self.unit
            .source
            .push_str(&format!("struct {} {{ }};\n", name));
        Span::new(start, self.unit.source.len() - 1)
    }

    // ── Expressions ─────────────────────────────────────────────────────

    fn new_expr(
        &mut self,
        kind: ExprKind,
        ty: &str,
        pend: PendExpr,
        is_const: bool,
        const_value: Option<i64>,
    ) -> ExprId {
        let id = ExprId(self.unit.exprs.len() as u32);
        self.unit.exprs.push(Expr {
            kind,
            span: Span::at(0),
            ty: ty.to_string(),
            is_const,
            const_value,
        });
        self.pend_exprs.push(pend);
        id
    }

    fn etext(&self, id: ExprId) -> &str {
        &self.pend_exprs[id.0 as usize].text
    }

    pub fn int(&mut self, v: i64) -> ExprId {
        let pend = PendExpr {
            text: v.to_string(),
            kids: Vec::new(),
        };
        self.new_expr(ExprKind::IntLit(v), "int", pend, true, Some(v))
    }

    pub fn float(&mut self, v: f64) -> ExprId {
        let pend = PendExpr {
            text: format!("{v}"),
            kids: Vec::new(),
        };
        self.new_expr(ExprKind::FloatLit(v), "double", pend, true, None)
    }

    pub fn parity(&mut self, p: Parity) -> ExprId {
        let pend = PendExpr {
            text: p.to_string(),
            kids: Vec::new(),
        };
        self.new_expr(ExprKind::ParityLit(p), types::PARITY, pend, true, None)
    }

    pub fn site(&mut self) -> ExprId {
        let pend = PendExpr {
            text: "X".to_string(),
            kids: Vec::new(),
        };
        self.new_expr(ExprKind::Site, types::SITE, pend, false, None)
    }

    pub fn var(&mut self, decl: DeclId) -> ExprId {
        let d = self.unit.decl(decl);
        let (name, ty) = (d.name.clone(), d.ty.clone());
        let pend = PendExpr {
            text: name,
            kids: Vec::new(),
        };
        self.new_expr(ExprKind::VarRef { decl }, &ty, pend, false, None)
    }

    /// Reference to a named compile-time direction constant (`e_x` …).
    /// Re-uses one declaration per name.
    pub fn direction_const(&mut self, name: &str, value: i64) -> ExprId {
        let decl = match self.named_consts.get(name) {
            Some(&d) => d,
            None => {
                let d = self.external_var(name, types::DIRECTION);
                self.named_consts.insert(name.to_string(), d);
                d
            }
        };
        let pend = PendExpr {
            text: name.to_string(),
            kids: Vec::new(),
        };
        self.new_expr(
            ExprKind::VarRef { decl },
            types::DIRECTION,
            pend,
            true,
            Some(value),
        )
    }

    pub fn index(&mut self, base: ExprId, index: ExprId) -> ExprId {
        let base_ty = self.unit.expr(base).ty.clone();
        let ty = field_element_type(&base_ty)
            .map(str::to_string)
            .or_else(|| container_element_type(&base_ty).map(str::to_string))
            .unwrap_or_else(|| base_ty.clone());
        let pend = self.compose(&[Part::E(base), Part::T("["), Part::E(index), Part::T("]")]);
        self.new_expr(ExprKind::Index { base, index }, &ty, pend, false, None)
    }

    pub fn member(&mut self, base: ExprId, name: &str, ty: &str) -> ExprId {
        let pend = self.compose(&[Part::E(base), Part::T("."), Part::T(name)]);
        self.new_expr(
            ExprKind::Member {
                base,
                member: name.to_string(),
            },
            ty,
            pend,
            false,
            None,
        )
    }

    pub fn paren(&mut self, inner: ExprId) -> ExprId {
        let ty = self.unit.expr(inner).ty.clone();
        let is_const = self.unit.expr(inner).is_const;
        let cv = self.unit.expr(inner).const_value;
        let pend = self.compose(&[Part::T("("), Part::E(inner), Part::T(")")]);
        self.new_expr(ExprKind::Paren(inner), &ty, pend, is_const, cv)
    }

    pub fn unary(&mut self, op: UnOp, operand: ExprId) -> ExprId {
        let ty = self.unit.expr(operand).ty.clone();
        let pend = self.compose(&[Part::T(op.symbol()), Part::E(operand)]);
        self.new_expr(ExprKind::Unary { op, operand }, &ty, pend, false, None)
    }

    pub fn addr_of(&mut self, operand: ExprId) -> ExprId {
        let ty = format!("{}*", self.unit.expr(operand).ty);
        let pend = self.compose(&[Part::T("&"), Part::E(operand)]);
        self.new_expr(ExprKind::AddrOf(operand), &ty, pend, false, None)
    }

    pub fn binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        let lty = self.unit.expr(lhs).ty.clone();
        let rty = self.unit.expr(rhs).ty.clone();
        let ty = match op {
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::EqEq | BinOp::Ne
            | BinOp::And | BinOp::Or => "int".to_string(),
            BinOp::Add if lty == types::SITE && rty == types::DIRECTION => {
                types::SITE_NEIGHBOR.to_string()
            }
            BinOp::Add if lty == types::SITE && rty == types::COORD_VECTOR => {
                types::SITE_OFFSET.to_string()
            }
            _ => lty,
        };
        let is_const = self.unit.expr(lhs).is_const && self.unit.expr(rhs).is_const;
        let pend = self.compose(&[
            Part::E(lhs),
            Part::T(" "),
            Part::T(op.symbol()),
            Part::T(" "),
            Part::E(rhs),
        ]);
        self.new_expr(ExprKind::Binary { op, lhs, rhs }, &ty, pend, is_const, None)
    }

    pub fn add(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn assign(&mut self, op: AssignOp, target: ExprId, value: ExprId) -> ExprId {
        let ty = self.unit.expr(target).ty.clone();
        let pend = self.compose(&[
            Part::E(target),
            Part::T(" "),
            Part::T(op.symbol()),
            Part::T(" "),
            Part::E(value),
        ]);
        self.new_expr(ExprKind::Assign { op, target, value }, &ty, pend, false, None)
    }

    pub fn call(&mut self, name: &str, args: Vec<ExprId>, ret_ty: &str) -> ExprId {
        self.call_inner(None, name, args, ret_ty)
    }

    /// Call to a function already added to the unit.
    pub fn call_func(&mut self, func: FuncId, args: Vec<ExprId>) -> ExprId {
        let f = self.unit.func(func);
        let (name, ret) = (f.name.clone(), f.return_type.clone());
        self.call_inner(Some(func), &name, args, &ret)
    }

    fn call_inner(
        &mut self,
        func: Option<FuncId>,
        name: &str,
        args: Vec<ExprId>,
        ret_ty: &str,
    ) -> ExprId {
        let mut parts = vec![Part::T(name), Part::T("(")];
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                parts.push(Part::T(", "));
            }
            parts.push(Part::E(*a));
        }
        parts.push(Part::T(")"));
        let pend = self.compose(&parts);
        self.new_expr(
            ExprKind::Call(CallExpr {
                func,
                name: name.to_string(),
                args,
            }),
            ret_ty,
            pend,
            false,
            None,
        )
    }

    pub fn ternary(&mut self, cond: ExprId, then_arm: ExprId, else_arm: ExprId) -> ExprId {
        let ty = self.unit.expr(then_arm).ty.clone();
        let pend = self.compose(&[
            Part::E(cond),
            Part::T(" ? "),
            Part::E(then_arm),
            Part::T(" : "),
            Part::E(else_arm),
        ]);
        self.new_expr(
            ExprKind::Ternary {
                cond,
                then_arm,
                else_arm,
            },
            &ty,
            pend,
            false,
            None,
        )
    }

    fn compose(&self, parts: &[Part]) -> PendExpr {
        let mut text = String::new();
        let mut kids = Vec::new();
        for p in parts {
            match p {
                Part::T(s) => text.push_str(s),
                Part::E(e) => {
                    kids.push((*e, text.len()));
                    text.push_str(self.etext(*e));
                }
            }
        }
        PendExpr { text, kids }
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn new_stmt(&mut self, kind: StmtKind, pend: PendStmt) -> StmtId {
        let id = StmtId(self.unit.stmts.len() as u32);
        self.unit.stmts.push(Stmt {
            kind,
            span: Span::at(0),
            pragmas: Vec::new(),
        });
        self.pend_stmts.push(pend);
        id
    }

    fn stext(&self, id: StmtId) -> &str {
        &self.pend_stmts[id.0 as usize].text
    }

    pub fn expr_stmt(&mut self, e: ExprId) -> StmtId {
        let pend = PendStmt {
            text: format!("{};", self.etext(e)),
            ekids: vec![(e, 0)],
            skids: Vec::new(),
        };
        self.new_stmt(StmtKind::Expr(e), pend)
    }

    pub fn decl_stmt(&mut self, decl: DeclId, init: Option<ExprId>) -> StmtId {
        let d = self.unit.decl(decl);
        let head = format!("{} {}", d.ty, d.name);
        let name_off = d.ty.len() + 1;
        let name_len = d.name.len();
        let mut text = head;
        let mut ekids = Vec::new();
        if let Some(e) = init {
            text.push_str(" = ");
            ekids.push((e, text.len()));
            text.push_str(self.etext(e));
        }
        text.push(';');
        // Final decl span is assigned on placement relative to this text.
        let id = self.new_stmt(StmtKind::Decl { decl, init }, PendStmt {
            text,
            ekids,
            skids: Vec::new(),
        });
        // Remember where the declared name sits inside the statement.
        self.unit.decls[decl.0 as usize].span = Span::new(name_off, name_off + name_len);
        id
    }

    pub fn block(&mut self, stmts: Vec<StmtId>) -> StmtId {
        let mut text = String::from("{\n");
        let mut skids = Vec::new();
        for s in &stmts {
            skids.push((*s, text.len()));
            text.push_str(self.stext(*s));
            text.push('\n');
        }
        text.push('}');
        self.new_stmt(StmtKind::Block(stmts), PendStmt {
            text,
            ekids: Vec::new(),
            skids,
        })
    }

    pub fn if_stmt(
        &mut self,
        cond: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
    ) -> StmtId {
        let mut text = String::from("if (");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        ekids.push((cond, text.len()));
        text.push_str(self.etext(cond));
        text.push_str(") ");
        skids.push((then_branch, text.len()));
        text.push_str(self.stext(then_branch));
        if let Some(e) = else_branch {
            text.push_str(" else ");
            skids.push((e, text.len()));
            text.push_str(self.stext(e));
        }
        self.new_stmt(
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            PendStmt { text, ekids, skids },
        )
    }

    pub fn while_stmt(&mut self, cond: ExprId, body: StmtId) -> StmtId {
        let mut text = String::from("while (");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        ekids.push((cond, text.len()));
        text.push_str(self.etext(cond));
        text.push_str(") ");
        skids.push((body, text.len()));
        text.push_str(self.stext(body));
        self.new_stmt(StmtKind::While { cond, body }, PendStmt { text, ekids, skids })
    }

    pub fn for_stmt(
        &mut self,
        init: Option<StmtId>,
        cond: Option<ExprId>,
        step: Option<ExprId>,
        body: StmtId,
    ) -> StmtId {
        let mut text = String::from("for (");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        match init {
            Some(s) => {
                skids.push((s, text.len()));
                text.push_str(self.stext(s));
                text.push(' ');
            }
            None => text.push_str("; "),
        }
        if let Some(c) = cond {
            ekids.push((c, text.len()));
            text.push_str(self.etext(c));
        }
        text.push_str("; ");
        if let Some(s) = step {
            ekids.push((s, text.len()));
            text.push_str(self.etext(s));
        }
        text.push_str(") ");
        skids.push((body, text.len()));
        text.push_str(self.stext(body));
        self.new_stmt(
            StmtKind::For {
                init,
                cond,
                step,
                body,
            },
            PendStmt { text, ekids, skids },
        )
    }

    pub fn do_while(&mut self, body: StmtId, cond: ExprId) -> StmtId {
        let mut text = String::from("do ");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        skids.push((body, text.len()));
        text.push_str(self.stext(body));
        text.push_str(" while (");
        ekids.push((cond, text.len()));
        text.push_str(self.etext(cond));
        text.push_str(");");
        self.new_stmt(StmtKind::DoWhile { body, cond }, PendStmt { text, ekids, skids })
    }

    pub fn switch_stmt(&mut self, cond: ExprId, body: StmtId) -> StmtId {
        let mut text = String::from("switch (");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        ekids.push((cond, text.len()));
        text.push_str(self.etext(cond));
        text.push_str(") ");
        skids.push((body, text.len()));
        text.push_str(self.stext(body));
        self.new_stmt(StmtKind::Switch { cond, body }, PendStmt { text, ekids, skids })
    }

    /// `onsites(parity) body` — the block form of the site loop.
    pub fn onsites(&mut self, parity: ExprId, body: StmtId) -> StmtId {
        let mut text = String::from("onsites(");
        let mut ekids = Vec::new();
        let mut skids = Vec::new();
        ekids.push((parity, text.len()));
        text.push_str(self.etext(parity));
        text.push_str(") ");
        skids.push((body, text.len()));
        text.push_str(self.stext(body));
        self.new_stmt(StmtKind::SiteLoop { parity, body }, PendStmt { text, ekids, skids })
    }

    pub fn ret(&mut self, e: Option<ExprId>) -> StmtId {
        let mut text = String::from("return");
        let mut ekids = Vec::new();
        if let Some(e) = e {
            text.push(' ');
            ekids.push((e, text.len()));
            text.push_str(self.etext(e));
        }
        text.push(';');
        self.new_stmt(StmtKind::Return(e), PendStmt {
            text,
            ekids,
            skids: Vec::new(),
        })
    }

    /// Attach a pragma to a statement.
    pub fn tag(&mut self, stmt: StmtId, p: Pragma) {
        self.unit.stmts[stmt.0 as usize].pragmas.push(p);
    }

    // ── Items ───────────────────────────────────────────────────────────

    /// Add a function definition; writes its text into the unit source and
    /// finalizes all spans underneath.
    pub fn add_function(&mut self, def: FnDef) -> FuncId {
        self.add_function_in(def, None)
    }

    /// Add a class with methods. Returns the class id and the method ids in
    /// the order given.
    pub fn add_class(
        &mut self,
        name: &str,
        generics: Vec<GenericArg>,
        methods: Vec<FnDef>,
    ) -> (ClassId, Vec<FuncId>) {
        let class_id = ClassId(self.unit.classes.len() as u32);
        let start = self.unit.source.len();
        self.unit.source.push_str(&format!("struct {} {{\n", name));
        self.unit.classes.push(ClassDecl {
            name: name.to_string(),
            span: Span::new(start, start),
            end: 0,
            generics,
            parent: None,
        });
        let mut ids = Vec::new();
        for mut m in methods {
            if m.qualified.is_none() {
                m.qualified = Some(format!("{}::{}", name, m.name));
            }
            ids.push(self.add_function_in(m, Some(class_id)));
        }
        self.unit.source.push_str("};\n");
        let end = self.unit.source.len() - 1;
        let c = &mut self.unit.classes[class_id.0 as usize];
        c.span = Span::new(start, end);
        c.end = end;
        (class_id, ids)
    }

    fn add_function_in(&mut self, def: FnDef, parent: Option<ClassId>) -> FuncId {
        // Generic header sits outside the definition span, the way the
        // front end reports specialization ranges.
        if !def.generics.is_empty() {
            let params: Vec<String> = def
                .generics
                .iter()
                .map(|g| format!("typename {}", g.param))
                .collect();
            self.unit
                .source
                .push_str(&format!("template <{}>\n", params.join(", ")));
        }
        let start = self.unit.source.len();
        if def.is_inline {
            self.unit.source.push_str("inline ");
        }
        self.unit.source.push_str(&def.ret);
        self.unit.source.push(' ');
        let name_start = self.unit.source.len();
        self.unit.source.push_str(&def.name);
        let name_span = Span::new(name_start, self.unit.source.len());
        self.unit.source.push('(');
        for (i, p) in def.params.iter().enumerate() {
            if i > 0 {
                self.unit.source.push_str(", ");
            }
            if p.is_const {
                self.unit.source.push_str("const ");
            }
            self.unit.source.push_str(&p.ty);
            if p.by_ref {
                self.unit.source.push('&');
            }
            self.unit.source.push(' ');
            let pstart = self.unit.source.len();
            self.unit.source.push_str(&p.name);
            self.unit.decls[p.decl.0 as usize].span =
                Span::new(pstart, self.unit.source.len());
        }
        self.unit.source.push(')');
        let decl_end = self.unit.source.len();
        self.unit.source.push(' ');
        let body_base = self.unit.source.len();
        let body_text = self.stext(def.body).to_string();
        self.unit.source.push_str(&body_text);
        self.unit.source.push_str("\n\n");
        let end = body_base + body_text.len();
        self.place_stmt(def.body, body_base);

        let id = FuncId(self.unit.functions.len() as u32);
        self.unit.functions.push(Function {
            qualified_name: def.qualified.unwrap_or_else(|| def.name.clone()),
            name: def.name,
            span: Span::new(start, end),
            name_span: Some(name_span),
            decl_end,
            body: Some(def.body),
            params: def.params,
            return_type: def.ret,
            is_inline: def.is_inline,
            template: def.template,
            generics: def.generics,
            parent,
            pragmas: def.pragmas,
        });
        self.unit.order.push(id);
        id
    }

    // ── Placement ───────────────────────────────────────────────────────

    fn place_stmt(&mut self, id: StmtId, base: usize) {
        let pend = self.pend_stmts[id.0 as usize].clone();
        self.unit.stmts[id.0 as usize].span = Span::new(base, base + pend.text.len());
        if let StmtKind::Decl { decl, .. } = self.unit.stmts[id.0 as usize].kind {
            let rel = self.unit.decls[decl.0 as usize].span;
            self.unit.decls[decl.0 as usize].span =
                Span::new(base + rel.start, base + rel.end);
        }
        for (e, off) in pend.ekids {
            self.place_expr(e, base + off);
        }
        for (s, off) in pend.skids {
            self.place_stmt(s, base + off);
        }
    }

    fn place_expr(&mut self, id: ExprId, base: usize) {
        let pend = self.pend_exprs[id.0 as usize].clone();
        self.unit.exprs[id.0 as usize].span = Span::new(base, base + pend.text.len());
        for (e, off) in pend.kids {
            self.place_expr(e, base + off);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placed_spans_match_text() {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let g = b.field("g", "double");
        let fv = b.var(f);
        let gv = b.var(g);
        let x1 = b.site();
        let x2 = b.site();
        let dx = b.direction_const("e_x", 0);
        let x_dx = b.add(x2, dx);
        let lhs = b.index(fv, x1);
        let rhs = b.index(gv, x_dx);
        let two = b.float(2.0);
        let prod = b.mul(rhs, two);
        let asn = b.assign(AssignOp::Assign, lhs, prod);
        let st = b.expr_stmt(asn);
        let body = b.block(vec![st]);
        let p = b.parity(Parity::Even);
        let lp = b.onsites(p, body);
        let lblock = b.block(vec![lp]);
        let kernel = FnDef::plain("kernel", "void", vec![], lblock);
        b.add_function(kernel);
        let unit = b.finish();

        assert_eq!(unit.expr_text(lhs), "f[X]");
        assert_eq!(unit.expr_text(rhs), "g[X + e_x]");
        assert_eq!(unit.expr_text(asn), "f[X] = g[X + e_x] * 2");
        assert!(unit.text(unit.stmt(lp).span).starts_with("onsites(EVEN)"));
        assert_eq!(unit.expr_text(x_dx), "X + e_x");
    }

    #[test]
    fn function_layout_records_name_and_decl_end() {
        let mut b = UnitBuilder::new("u");
        let zero = b.int(0);
        let r = b.ret(Some(zero));
        let body = b.block(vec![r]);
        let p = b.param("x", "double", false, false);
        let f = b.add_function(FnDef::plain("sq", "double", vec![p], body));
        let unit = b.finish();
        let func = unit.func(f);

        assert_eq!(unit.text(func.name_span.unwrap()), "sq");
        assert_eq!(
            unit.text(Span::new(func.span.start, func.decl_end)),
            "double sq(double x)"
        );
        assert!(unit.text(func.span).ends_with('}'));
    }

    #[test]
    fn generic_header_is_outside_function_span() {
        let mut b = UnitBuilder::new("u");
        let body = b.block(vec![]);
        let p = b.param("v", "T", true, true);
        let f = b.add_function(FnDef::specialization(
            "norm",
            "double",
            vec![p],
            body,
            vec![GenericArg {
                param: "T".to_string(),
                arg: "double".to_string(),
                decl_span: None,
            }],
        ));
        let unit = b.finish();
        let func = unit.func(f);
        assert!(unit.text(func.span).starts_with("double norm"));
        assert!(unit.source.contains("template <typename T>"));
    }

    #[test]
    fn class_end_points_past_methods() {
        let mut b = UnitBuilder::new("u");
        let body = b.block(vec![]);
        let (cid, mids) = b.add_class(
            "Mat",
            vec![GenericArg {
                param: "T".to_string(),
                arg: "double".to_string(),
                decl_span: None,
            }],
            vec![FnDef::specialization("tr", "T", vec![], body, vec![])],
        );
        let unit = b.finish();
        let class = unit.class(cid);
        assert!(unit.text(class.span).starts_with("struct Mat {"));
        assert_eq!(&unit.source[class.end - 1..class.end], ";");
        assert_eq!(unit.func(mids[0]).parent, Some(cid));
        assert_eq!(unit.func(mids[0]).qualified_name, "Mat::tr");
        assert_eq!(unit.class_specializations("Mat"), vec![cid]);
    }
}
