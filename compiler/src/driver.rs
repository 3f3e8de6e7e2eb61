// driver.rs — Traversal driver for site-loop analysis
//
// Performs the single depth-first pass over each recognized site loop,
// sequencing the scope tracker, field collector, variable tracker, and
// conditional analyzer, then runs the post-collection check passes and
// hands the validated `LoopAnalysis` to the (external) code emitter. Also
// drives the unit-level walk that dispatches plain functions vs. generic
// specializations.
//
// Subtree suppression is an explicit visitor contract: every
// classification step returns `Visit::{Descend, SkipChildren}` (a fatal
// condition is the stop state, propagated as `Err`), and the two walk
// functions below are the only places that interpret it.
//
// Preconditions: `unit` is a fully resolved tree; `db` is the cross-unit
//                specialization store.
// Postconditions: returns per-loop analyses, emitted specializations, the
//                 edited unit source, and all accumulated diagnostics.
// Failure modes: malformed loop shapes abort the run (`Fatal`); DSL
//                violations accumulate as diagnostics.
// Side effects: writes to the unit's edit buffer; specialization cache
//               insertions.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::ast::*;
use crate::diag::{any_errors, codes, Diagnostic, FatalResult};
use crate::field::{self, FieldInfo, FieldRef};
use crate::scope::ScopeTracker;
use crate::specialize::{self, SpecRecord, SpecializationDb};
use crate::srcbuf::SourceBuffer;
use crate::vars::{self, ArrayCapture, HistogramRef, Reduction, VarInfo};

// ── Public types ─────────────────────────────────────────────────────────

/// Parity class of one site loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParityClass {
    Even,
    Odd,
    All,
    /// Chosen at run time; not statically known.
    Unknown,
}

impl ParityClass {
    pub fn from_parity(p: Parity) -> Self {
        match p {
            Parity::Even => ParityClass::Even,
            Parity::Odd => ParityClass::Odd,
            Parity::All => ParityClass::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParityClass::Even => "EVEN",
            ParityClass::Odd => "ODD",
            ParityClass::All => "ALL",
            ParityClass::Unknown => "unknown",
        }
    }
}

/// Pragma flags attached to one loop.
#[derive(Debug, Clone, Default)]
pub struct LoopPragmas {
    pub no_vectorize: bool,
    pub raw_access: Vec<String>,
}

/// Visitor verdict for one node; a fatal condition is the stop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Descend,
    SkipChildren,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub verbose: bool,
    /// Emit specializations without the implicit `inline`.
    pub no_inline_specializations: bool,
}

/// Result of analyzing one compilation unit.
#[derive(Debug)]
pub struct AnalysisResult {
    pub analysis: UnitAnalysis,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct UnitAnalysis {
    pub loops: Vec<LoopAnalysis>,
    pub specializations: Vec<SpecRecord>,
    /// Unit source with loop markers and specializations applied.
    pub edited_source: String,
    pub failed: bool,
}

/// Validated analysis of one site loop, handed to the code emitter.
#[derive(Debug)]
pub struct LoopAnalysis {
    pub parity: ParityClass,
    pub parity_text: String,
    pub loop_text: String,
    pub no_vectorize: bool,
    pub raw_access: Vec<String>,
    pub fields: Vec<FieldInfo>,
    pub field_refs: Vec<FieldRef>,
    pub vars: Vec<VarInfo>,
    pub histograms: Vec<HistogramRef>,
    pub captures: Vec<ArrayCapture>,
    pub has_site_dependent_conditional: bool,
    pub assert_parity_at_runtime: bool,
}

impl LoopAnalysis {
    /// Human-readable one-loop summary (snapshot and verbose output).
    pub fn summary(&self) -> String {
        let mut out = String::new();
        writeln!(
            out,
            "loop parity={} vectorize={} site-dependent-conditional={}{}",
            self.parity.as_str(),
            if self.no_vectorize { "off" } else { "on" },
            if self.has_site_dependent_conditional {
                "yes"
            } else {
                "no"
            },
            if self.assert_parity_at_runtime {
                " assert-parity"
            } else {
                ""
            },
        )
        .unwrap();
        for f in &self.fields {
            let mut acc = Vec::new();
            if f.is_written {
                acc.push("write".to_string());
            }
            if f.is_read_at_site {
                acc.push("read-at-site".to_string());
            }
            if f.is_read_neighbor {
                acc.push("read-neighbor".to_string());
            }
            if f.is_read_offset {
                acc.push("read-offset".to_string());
            }
            let dirs: Vec<&str> = f.dirs.iter().map(|d| d.dir_text.as_str()).collect();
            writeln!(
                out,
                "  field {}: element={} {}{}",
                f.name,
                f.element_type,
                acc.join(" "),
                if dirs.is_empty() {
                    String::new()
                } else {
                    format!(" dirs=[{}]", dirs.join(", "))
                },
            )
            .unwrap();
        }
        for v in &self.vars {
            let scope = if v.is_loop_local { "local" } else { "external" };
            let red = match v.reduction {
                Reduction::None => "",
                Reduction::Sum => " reduction=sum",
                Reduction::Product => " reduction=product",
            };
            writeln!(
                out,
                "  var {}: {} refs={}{}{}",
                v.name,
                scope,
                v.refs.len(),
                red,
                if v.is_site_dependent {
                    " site-dependent"
                } else {
                    ""
                },
            )
            .unwrap();
        }
        for h in &self.histograms {
            writeln!(
                out,
                "  histogram {}[{}]: element={} op={}",
                h.container_name,
                h.index_name,
                h.element_type,
                match h.op {
                    Reduction::Sum => "sum",
                    Reduction::Product => "product",
                    Reduction::None => "none",
                },
            )
            .unwrap();
        }
        out
    }

    /// Machine-readable metadata for the downstream generator.
    pub fn report(&self) -> LoopReport {
        LoopReport {
            parity: self.parity.as_str().to_string(),
            parity_text: self.parity_text.clone(),
            no_vectorize: self.no_vectorize,
            has_site_dependent_conditional: self.has_site_dependent_conditional,
            assert_parity_at_runtime: self.assert_parity_at_runtime,
            fields: self
                .fields
                .iter()
                .map(|f| FieldReport {
                    name: f.name.clone(),
                    element_type: f.element_type.clone(),
                    written: f.is_written,
                    read_at_site: f.is_read_at_site,
                    read_neighbor: f.is_read_neighbor,
                    read_offset: f.is_read_offset,
                    directions: f.dirs.iter().map(|d| d.dir_text.clone()).collect(),
                })
                .collect(),
            vars: self
                .vars
                .iter()
                .map(|v| VarReport {
                    name: v.name.clone(),
                    loop_local: v.is_loop_local,
                    reduction: match v.reduction {
                        Reduction::None => None,
                        Reduction::Sum => Some("sum".to_string()),
                        Reduction::Product => Some("product".to_string()),
                    },
                    site_dependent: v.is_site_dependent,
                })
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|h| HistogramReport {
                    container: h.container_name.clone(),
                    index: h.index_name.clone(),
                    element_type: h.element_type.clone(),
                    op: match h.op {
                        Reduction::Product => "product".to_string(),
                        _ => "sum".to_string(),
                    },
                })
                .collect(),
            captures: self.captures.len(),
        }
    }
}

/// Serializable per-loop metadata (the `--emit analysis` payload).
#[derive(Debug, Serialize)]
pub struct LoopReport {
    pub parity: String,
    pub parity_text: String,
    pub no_vectorize: bool,
    pub has_site_dependent_conditional: bool,
    pub assert_parity_at_runtime: bool,
    pub fields: Vec<FieldReport>,
    pub vars: Vec<VarReport>,
    pub histograms: Vec<HistogramReport>,
    pub captures: usize,
}

#[derive(Debug, Serialize)]
pub struct FieldReport {
    pub name: String,
    pub element_type: String,
    pub written: bool,
    pub read_at_site: bool,
    pub read_neighbor: bool,
    pub read_offset: bool,
    pub directions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VarReport {
    pub name: String,
    pub loop_local: bool,
    pub reduction: Option<String>,
    pub site_dependent: bool,
}

#[derive(Debug, Serialize)]
pub struct HistogramReport {
    pub container: String,
    pub index: String,
    pub element_type: String,
    pub op: String,
}

// ── Per-loop context ─────────────────────────────────────────────────────

/// All mutable state of one loop analysis. Created at loop entry, consumed
/// at loop exit; never ambient, so reentrant specialization is safe.
pub struct LoopCtx<'u> {
    pub unit: &'u Unit,
    pub parity: ParityClass,
    pub parity_text: String,
    pub loop_text: String,
    pub pragmas: LoopPragmas,
    pub stmt_sequence: u32,
    /// An explicit parity index is legal only as the first field reference.
    pub accept_field_parity: bool,
    pub has_site_dependent_conditional: bool,
    /// Variables a condition referenced before their standing was known.
    pub conditional_vars: Vec<usize>,
    pub assert_parity_at_runtime: bool,
    pub field_refs: Vec<FieldRef>,
    pub field_infos: Vec<FieldInfo>,
    pub var_infos: Vec<VarInfo>,
    pub histograms: Vec<HistogramRef>,
    pub captures: Vec<ArrayCapture>,
    pub scope: ScopeTracker,
    pub diags: Vec<Diagnostic>,
    depth: i32,
    scope_level: u32,
}

impl<'u> LoopCtx<'u> {
    pub fn new(
        unit: &'u Unit,
        parity: ParityClass,
        parity_text: String,
        loop_text: String,
        pragmas: LoopPragmas,
        accept_field_parity: bool,
    ) -> Self {
        LoopCtx {
            unit,
            parity,
            parity_text,
            loop_text,
            pragmas,
            stmt_sequence: 0,
            accept_field_parity,
            has_site_dependent_conditional: false,
            conditional_vars: Vec::new(),
            assert_parity_at_runtime: false,
            field_refs: Vec::new(),
            field_infos: Vec::new(),
            var_infos: Vec::new(),
            histograms: Vec::new(),
            captures: Vec::new(),
            scope: ScopeTracker::new(),
            diags: Vec::new(),
            depth: 0,
            scope_level: 0,
        }
    }

    pub fn into_analysis(self) -> LoopAnalysis {
        LoopAnalysis {
            parity: self.parity,
            parity_text: self.parity_text,
            loop_text: self.loop_text,
            no_vectorize: self.pragmas.no_vectorize,
            raw_access: self.pragmas.raw_access,
            fields: self.field_infos,
            field_refs: self.field_refs,
            vars: self.var_infos,
            histograms: self.histograms,
            captures: self.captures,
            has_site_dependent_conditional: self.has_site_dependent_conditional,
            assert_parity_at_runtime: self.assert_parity_at_runtime,
        }
    }
}

// ── Public entry point ───────────────────────────────────────────────────

/// Analyze every site loop and loop-bearing specialization in the unit.
pub fn analyze_unit(
    unit: &Unit,
    db: &mut dyn SpecializationDb,
    options: &AnalyzeOptions,
) -> AnalysisResult {
    let mut driver = Driver::new(unit, db, options.clone());
    let fatal = driver.run().err();
    let mut diagnostics = driver.diagnostics;

    let analysis = match fatal {
        Some(f) => {
            // A fatal condition aborts the run: no output for any loop.
            diagnostics.push(f.into_diagnostic());
            UnitAnalysis {
                loops: Vec::new(),
                specializations: Vec::new(),
                edited_source: String::new(),
                failed: true,
            }
        }
        None => UnitAnalysis {
            failed: any_errors(&diagnostics),
            edited_source: driver.buffers[0].get(),
            loops: driver.loops,
            specializations: driver.specs,
        },
    };
    AnalysisResult {
        analysis,
        diagnostics,
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

pub struct Driver<'a> {
    pub unit: &'a Unit,
    pub options: AnalyzeOptions,
    pub db: &'a mut dyn SpecializationDb,
    pub diagnostics: Vec<Diagnostic>,
    pub loops: Vec<LoopAnalysis>,
    pub specs: Vec<SpecRecord>,
    /// Edit-buffer stack: index 0 is the unit buffer; active
    /// specializations push their private buffers on top.
    pub buffers: Vec<SourceBuffer>,
    /// Canonical signatures of specializations currently being emitted;
    /// guards mutually recursive instantiations.
    pub in_progress: HashSet<String>,
    pub specialized: HashSet<FuncId>,
    loop_cache: HashMap<FuncId, bool>,
}

impl<'a> Driver<'a> {
    pub fn new(
        unit: &'a Unit,
        db: &'a mut dyn SpecializationDb,
        options: AnalyzeOptions,
    ) -> Self {
        Driver {
            unit,
            options,
            db,
            diagnostics: Vec::new(),
            loops: Vec::new(),
            specs: Vec::new(),
            buffers: vec![SourceBuffer::new(&unit.source)],
            in_progress: HashSet::new(),
            specialized: HashSet::new(),
            loop_cache: HashMap::new(),
        }
    }

    pub fn active_buffer(&mut self) -> &mut SourceBuffer {
        self.buffers.last_mut().expect("buffer stack is never empty")
    }

    pub fn run(&mut self) -> FatalResult<()> {
        if self.options.verbose {
            for c in &self.unit.classes {
                if !c.generics.is_empty() {
                    let args: Vec<&str> =
                        c.generics.iter().map(|g| g.arg.as_str()).collect();
                    eprintln!("slx: class {}<{}> instance", c.name, args.join(", "));
                }
            }
        }
        let order = self.unit.order.clone();
        for fid in order {
            let f = self.unit.func(fid);
            match f.template {
                // Generic patterns are analyzed only through their
                // instantiations.
                TemplateKind::Primary => {}
                TemplateKind::Plain => {
                    let in_generic_class = f
                        .parent
                        .map(|c| !self.unit.class(c).generics.is_empty())
                        .unwrap_or(false);
                    if in_generic_class && self.function_contains_loop(fid) {
                        continue;
                    }
                    if let Some(body) = f.body {
                        self.walk_fn_stmt(body)?;
                    }
                }
                TemplateKind::Specialization => {
                    if self.function_contains_loop(fid) {
                        specialize::specialize_function(self, fid)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Unit-level walk (outside loops) ─────────────────────────────────

    pub fn walk_fn_stmt(&mut self, s: StmtId) -> FatalResult<()> {
        if self
            .unit
            .stmt(s)
            .pragmas
            .iter()
            .any(|p| matches!(p, Pragma::DumpTree))
        {
            self.dump_stmt(s);
        }
        match &self.unit.stmt(s).kind {
            StmtKind::SiteLoop { parity, body } => {
                let span = self.unit.stmt(s).span;
                let body_start = self.unit.stmt(*body).span.start;
                let pragmas = self.unit.stmt(s).pragmas.clone();
                // The loop-header text is replaced by generated code.
                self.active_buffer()
                    .remove(Span::new(span.start, body_start));
                self.analyze_loop(*body, Some(*parity), false, span, &pragmas)?;
            }
            StmtKind::Expr(e) => {
                if self.is_statement_loop(*e) {
                    let span = self.unit.stmt(s).span;
                    let pragmas = self.unit.stmt(s).pragmas.clone();
                    self.analyze_loop(s, None, true, span, &pragmas)?;
                } else {
                    self.check_outside_expr(*e);
                }
            }
            StmtKind::Decl { init, .. } => {
                if let Some(i) = init {
                    self.check_outside_expr(*i);
                }
            }
            StmtKind::Block(items) => {
                for &it in items {
                    self.walk_fn_stmt(it)?;
                }
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.check_outside_expr(*cond);
                let (t, e) = (*then_branch, *else_branch);
                self.walk_fn_stmt(t)?;
                if let Some(e) = e {
                    self.walk_fn_stmt(e)?;
                }
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let (init, cond, step, body) = (*init, *cond, *step, *body);
                if let Some(i) = init {
                    self.walk_fn_stmt(i)?;
                }
                if let Some(c) = cond {
                    self.check_outside_expr(c);
                }
                if let Some(st) = step {
                    self.check_outside_expr(st);
                }
                self.walk_fn_stmt(body)?;
            }
            StmtKind::While { cond, body } | StmtKind::Switch { cond, body } => {
                self.check_outside_expr(*cond);
                let body = *body;
                self.walk_fn_stmt(body)?;
            }
            StmtKind::DoWhile { body, cond } => {
                self.check_outside_expr(*cond);
                let body = *body;
                self.walk_fn_stmt(body)?;
            }
            StmtKind::Return(e) => {
                if let Some(e) = e {
                    self.check_outside_expr(*e);
                }
            }
        }
        Ok(())
    }

    /// `f[parity] = …` — the statement form of the site loop.
    fn is_statement_loop(&self, e: ExprId) -> bool {
        let e = self.unit.skip_parens(e);
        if let ExprKind::Assign { target, .. } = self.unit.expr(e).kind {
            let t = self.unit.skip_parens(target);
            if let ExprKind::Index { base, index } = self.unit.expr(t).kind {
                return self.unit.is_field_expr(base)
                    && self.unit.expr(index).ty == types::PARITY;
            }
        }
        false
    }

    /// Per-site field expressions are only meaningful inside site loops.
    fn check_outside_expr(&mut self, e: ExprId) {
        let mut stack = vec![e];
        while let Some(e) = stack.pop() {
            if let ExprKind::Index { base, index } = self.unit.expr(e).kind {
                if self.unit.is_field_expr(base) {
                    let span = self.unit.expr(e).span;
                    match self.unit.expr(index).ty.as_str() {
                        types::PARITY => self.diagnostics.push(
                            Diagnostic::error(
                                span,
                                "field[parity] expression is allowed only as the \
                                 left side of a field assignment statement",
                            )
                            .with_code(codes::E0110),
                        ),
                        types::SITE | types::SITE_NEIGHBOR | types::SITE_OFFSET => {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    span,
                                    "field[X] expressions are allowed only inside \
                                     site loops",
                                )
                                .with_code(codes::E0111),
                            )
                        }
                        _ => {}
                    }
                }
            }
            stack.extend(self.unit.children(e));
        }
    }

    // ── Loop analysis ───────────────────────────────────────────────────

    fn analyze_loop(
        &mut self,
        body: StmtId,
        parity_hint: Option<ExprId>,
        accept_field_parity: bool,
        loop_span: Span,
        pragmas: &[Pragma],
    ) -> FatalResult<()> {
        let (parity, parity_text) = match parity_hint {
            Some(p) => {
                let stripped = self.unit.skip_parens(p);
                let class = match self.unit.expr(stripped).kind {
                    ExprKind::ParityLit(lit) => ParityClass::from_parity(lit),
                    _ => ParityClass::Unknown,
                };
                (class, self.unit.expr_text(p).to_string())
            }
            None => (ParityClass::Unknown, String::new()),
        };

        let mut lp = LoopPragmas::default();
        for p in pragmas {
            match p {
                Pragma::NoVectorize => lp.no_vectorize = true,
                Pragma::RawAccess(names) => lp.raw_access.extend(names.iter().cloned()),
                _ => {}
            }
        }

        let mut ctx = LoopCtx::new(
            self.unit,
            parity,
            parity_text,
            self.unit.text(loop_span).to_string(),
            lp,
            accept_field_parity,
        );

        self.walk_loop_stmt(&mut ctx, body)?;

        // Check passes: variables first (fixpoint feeds the conditional
        // attribute), then field aggregation and hazards.
        vars::check_var_refs(&mut ctx);
        field::resolve_field_refs(&mut ctx);

        if !ctx.has_site_dependent_conditional {
            for &vi in &ctx.conditional_vars {
                if ctx.var_infos[vi].is_site_dependent {
                    ctx.has_site_dependent_conditional = true;
                    break;
                }
            }
        }

        if self.options.verbose {
            eprint!("{}", ctx.field_infos.len());
            eprintln!(
                " fields, {} vars in loop at {}",
                ctx.var_infos.len(),
                loop_span
            );
        }

        // Keep the original loop visible as a comment ahead of whatever
        // the emitter generates in its place.
        let comment = comment_block(&ctx.loop_text);
        self.active_buffer().insert_before(loop_span.start, &comment);

        self.diagnostics.append(&mut ctx.diags);
        self.loops.push(ctx.into_analysis());
        Ok(())
    }

    /// Statement walk inside a loop body. Sequencing points are statements
    /// at depth 1 (directly inside the nearest enclosing block).
    fn walk_loop_stmt(&mut self, ctx: &mut LoopCtx, s: StmtId) -> FatalResult<()> {
        ctx.depth += 1;
        if ctx.depth == 1 {
            ctx.stmt_sequence += 1;
        }
        if self
            .unit
            .stmt(s)
            .pragmas
            .iter()
            .any(|p| matches!(p, Pragma::DumpTree))
        {
            self.dump_stmt(s);
        }

        match self.unit.stmt(s).kind.clone() {
            StmtKind::Expr(e) => self.walk_loop_expr(ctx, e, false)?,
            StmtKind::Decl { decl, init } => self.visit_loop_decl(ctx, decl, init)?,
            StmtKind::Block(items) => {
                ctx.scope_level += 1;
                let saved = ctx.depth;
                ctx.depth = 0;
                for it in items {
                    self.walk_loop_stmt(ctx, it)?;
                }
                ctx.depth = saved;
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                ctx.scope_level += 1;
                self.walk_loop_expr(ctx, cond, false)?;
                self.walk_loop_stmt(ctx, then_branch)?;
                if let Some(e) = else_branch {
                    self.walk_loop_stmt(ctx, e)?;
                }
                self.check_conditional(ctx, cond);
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                ctx.scope_level += 1;
                if let Some(i) = init {
                    self.walk_loop_stmt(ctx, i)?;
                }
                if let Some(c) = cond {
                    self.walk_loop_expr(ctx, c, false)?;
                }
                if let Some(st) = step {
                    self.walk_loop_expr(ctx, st, false)?;
                }
                self.walk_loop_stmt(ctx, body)?;
                if let Some(c) = cond {
                    self.check_conditional(ctx, c);
                }
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
            }
            StmtKind::While { cond, body } | StmtKind::Switch { cond, body } => {
                ctx.scope_level += 1;
                self.walk_loop_expr(ctx, cond, false)?;
                self.walk_loop_stmt(ctx, body)?;
                self.check_conditional(ctx, cond);
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
            }
            StmtKind::DoWhile { body, cond } => {
                ctx.scope_level += 1;
                self.walk_loop_stmt(ctx, body)?;
                self.walk_loop_expr(ctx, cond, false)?;
                self.check_conditional(ctx, cond);
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
            }
            StmtKind::SiteLoop { .. } => {
                ctx.diags.push(Diagnostic::error(
                    self.unit.stmt(s).span,
                    "site loops cannot be nested",
                ));
            }
            StmtKind::Return(e) => {
                if let Some(e) = e {
                    self.walk_loop_expr(ctx, e, false)?;
                }
            }
        }

        ctx.depth -= 1;
        Ok(())
    }

    fn visit_loop_decl(
        &mut self,
        ctx: &mut LoopCtx,
        decl: DeclId,
        init: Option<ExprId>,
    ) -> FatalResult<()> {
        let d = self.unit.decl(decl).clone();
        match d.storage {
            Storage::Static | Storage::Extern => {
                ctx.diags.push(
                    Diagnostic::error(
                        d.span,
                        "static or external variable declarations are not allowed \
                         within site loops",
                    )
                    .with_code(codes::E0204),
                );
                return Ok(());
            }
            Storage::Auto => {}
        }
        if is_field_type(&d.ty) {
            ctx.diags.push(
                Diagnostic::error(
                    d.span,
                    "cannot declare field variables within site loops",
                )
                .with_code(codes::E0205),
            );
            return Ok(());
        }
        if d.name == "X" {
            ctx.diags.push(
                Diagnostic::warning(
                    d.span,
                    "declaring a variable 'X' shadows the site index",
                )
                .with_code(codes::W0301),
            );
        }

        ctx.scope.declare(decl, ctx.scope_level);
        vars::find_or_create_var(ctx, decl);
        if let Some(init) = init {
            self.walk_loop_expr(ctx, init, false)?;
            vars::record_decl_dependencies(ctx, decl, init);
        }
        Ok(())
    }

    /// Expression walk inside a loop body. `as_value` marks an expression
    /// whose result is consumed (the chained-assignment case `a[X] = b[X]
    /// = c`, where the inner target is written and read).
    fn walk_loop_expr(
        &mut self,
        ctx: &mut LoopCtx,
        e: ExprId,
        as_value: bool,
    ) -> FatalResult<()> {
        match self.visit_loop_expr(ctx, e, as_value)? {
            Visit::SkipChildren => Ok(()),
            Visit::Descend => {
                for c in self.unit.children(e) {
                    self.walk_loop_expr(ctx, c, false)?;
                }
                Ok(())
            }
        }
    }

    fn visit_loop_expr(
        &mut self,
        ctx: &mut LoopCtx,
        e: ExprId,
        as_value: bool,
    ) -> FatalResult<Visit> {
        // Compile-time constants are not variables.
        if self.unit.expr(e).is_const {
            return Ok(Visit::SkipChildren);
        }

        match self.unit.expr(e).kind.clone() {
            ExprKind::Assign { op, target, value } => {
                self.visit_assignment(ctx, op, target, value, as_value)?;
                Ok(Visit::SkipChildren)
            }
            ExprKind::Index { base, .. } => {
                if self.unit.is_field_expr(base) {
                    let nested = field::handle_field_access(ctx, e, false, false, false)?;
                    if let Some(idx) = nested {
                        self.walk_loop_expr(ctx, idx, false)?;
                    }
                    Ok(Visit::SkipChildren)
                } else if vars::handle_array_read(ctx, e) {
                    Ok(Visit::SkipChildren)
                } else {
                    Ok(Visit::Descend)
                }
            }
            ExprKind::VarRef { decl } => {
                if self.unit.is_field_expr(e) {
                    ctx.diags.push(
                        Diagnostic::error(
                            self.unit.expr(e).span,
                            "field expressions without a site index are not \
                             allowed within site loops",
                        )
                        .with_code(codes::E0104),
                    );
                    return Ok(Visit::SkipChildren);
                }
                let name = &self.unit.decl(decl).name;
                if !ctx.pragmas.raw_access.iter().any(|n| n == name) {
                    vars::handle_var_ref(ctx, e, false, None, None);
                }
                Ok(Visit::SkipChildren)
            }
            ExprKind::AddrOf(inner) => {
                if self.unit.contains_field_access(inner) {
                    ctx.diags.push(
                        Diagnostic::error(
                            self.unit.expr(e).span,
                            "taking the address of a field access is not allowed; \
                             copy the value first",
                        )
                        .with_code(codes::E0206),
                    );
                    Ok(Visit::SkipChildren)
                } else {
                    Ok(Visit::Descend)
                }
            }
            ExprKind::Call(call) => {
                self.visit_call(ctx, e, &call)?;
                Ok(Visit::SkipChildren)
            }
            ExprKind::Ternary {
                cond,
                then_arm,
                else_arm,
            } => {
                ctx.scope_level += 1;
                self.walk_loop_expr(ctx, cond, false)?;
                self.walk_loop_expr(ctx, then_arm, false)?;
                self.walk_loop_expr(ctx, else_arm, false)?;
                self.check_conditional(ctx, cond);
                ctx.scope_level -= 1;
                ctx.scope.prune_deeper_than(ctx.scope_level);
                Ok(Visit::SkipChildren)
            }
            _ => Ok(Visit::Descend),
        }
    }

    fn visit_assignment(
        &mut self,
        ctx: &mut LoopCtx,
        op: AssignOp,
        target: ExprId,
        value: ExprId,
        as_value: bool,
    ) -> FatalResult<()> {
        let t = self.unit.skip_parens(target);

        // Direct or member-qualified field write: f[X] = …, f[X].re = ….
        if let Some(access) = self.find_field_access_in_chain(t) {
            let member_write = access != t;
            let also_read = op.is_compound() || as_value || member_write;
            let nested =
                field::handle_field_access(ctx, access, true, also_read, false)?;
            if let Some(idx) = nested {
                self.walk_loop_expr(ctx, idx, false)?;
            }
            return self.walk_loop_expr(ctx, value, true);
        }

        match self.unit.expr(t).kind.clone() {
            ExprKind::Index { .. } => {
                if vars::handle_array_assign(ctx, t, op, value) {
                    self.walk_loop_expr(ctx, value, true)
                } else {
                    self.walk_loop_expr(ctx, t, false)?;
                    self.walk_loop_expr(ctx, value, true)
                }
            }
            ExprKind::VarRef { decl } => {
                if self.unit.is_field_expr(t) {
                    ctx.diags.push(
                        Diagnostic::error(
                            self.unit.expr(t).span,
                            "field expressions without a site index are not \
                             allowed within site loops",
                        )
                        .with_code(codes::E0104),
                    );
                    return self.walk_loop_expr(ctx, value, true);
                }
                let name = &self.unit.decl(decl).name;
                if !ctx.pragmas.raw_access.iter().any(|n| n == name) {
                    vars::handle_var_ref(ctx, t, true, Some(op), Some(value));
                }
                self.walk_loop_expr(ctx, value, true)
            }
            ExprKind::Member { .. } => {
                // Writing through a member chain mutates the base variable.
                match self.find_base_var_expr(t) {
                    Some(base) => {
                        vars::handle_var_ref(ctx, base, true, Some(op), Some(value));
                        self.walk_loop_expr(ctx, value, true)
                    }
                    None => {
                        self.walk_loop_expr(ctx, t, false)?;
                        self.walk_loop_expr(ctx, value, true)
                    }
                }
            }
            _ => {
                self.walk_loop_expr(ctx, t, false)?;
                self.walk_loop_expr(ctx, value, true)
            }
        }
    }

    /// The `VarRef` node at the base of a member/index chain.
    fn find_base_var_expr(&self, e: ExprId) -> Option<ExprId> {
        let mut cur = self.unit.skip_parens(e);
        loop {
            match self.unit.expr(cur).kind {
                ExprKind::VarRef { .. } => return Some(cur),
                ExprKind::Member { base, .. } => cur = self.unit.skip_parens(base),
                ExprKind::Index { base, .. } => cur = self.unit.skip_parens(base),
                _ => return None,
            }
        }
    }

    /// The per-site field access inside a member/index chain, if any:
    /// `f[X].re` resolves to the `f[X]` node.
    fn find_field_access_in_chain(&self, e: ExprId) -> Option<ExprId> {
        let mut cur = self.unit.skip_parens(e);
        loop {
            match self.unit.expr(cur).kind {
                ExprKind::Index { base, .. } => {
                    if self.unit.is_field_expr(base) {
                        return Some(cur);
                    }
                    cur = self.unit.skip_parens(base);
                }
                ExprKind::Member { base, .. } => cur = self.unit.skip_parens(base),
                _ => return None,
            }
        }
    }

    fn visit_call(
        &mut self,
        ctx: &mut LoopCtx,
        _e: ExprId,
        call: &CallExpr,
    ) -> FatalResult<()> {
        let params: Vec<Param> = match call.func {
            Some(fid) => {
                let f = self.unit.func(fid);
                let loop_callable = f
                    .pragmas
                    .iter()
                    .any(|p| matches!(p, Pragma::LoopCallable));
                if !loop_callable
                    && f.template == TemplateKind::Specialization
                    && self.function_contains_loop(fid)
                {
                    specialize::specialize_function(self, fid)?;
                }
                f.params.clone()
            }
            None => Vec::new(),
        };

        for (i, &arg) in call.args.iter().enumerate() {
            let writes_through = params
                .get(i)
                .map(|p| p.by_ref && !p.is_const)
                .unwrap_or(false);
            if !writes_through {
                self.walk_loop_expr(ctx, arg, false)?;
                continue;
            }
            let a = self.unit.skip_parens(arg);
            match self.unit.expr(a).kind.clone() {
                ExprKind::Index { base, .. } if self.unit.is_field_expr(base) => {
                    // Written and read through the reference.
                    let nested =
                        field::handle_field_access(ctx, a, true, true, true)?;
                    if let Some(idx) = nested {
                        self.walk_loop_expr(ctx, idx, false)?;
                    }
                }
                ExprKind::VarRef { decl } => {
                    if self.unit.is_field_expr(a) {
                        ctx.diags.push(
                            Diagnostic::error(
                                self.unit.expr(a).span,
                                "field expressions without a site index are not \
                                 allowed within site loops",
                            )
                            .with_code(codes::E0104),
                        );
                        continue;
                    }
                    let name = &self.unit.decl(decl).name;
                    if !ctx.pragmas.raw_access.iter().any(|n| n == name) {
                        vars::handle_var_ref(ctx, a, true, None, None);
                    }
                }
                _ => self.walk_loop_expr(ctx, a, false)?,
            }
        }
        Ok(())
    }

    /// Conditional site-dependence: a branch condition that reads a
    /// site-dependent value makes execution diverge between sites.
    fn check_conditional(&mut self, ctx: &mut LoopCtx, cond: ExprId) {
        if ctx.has_site_dependent_conditional {
            return;
        }
        let mut pending = Vec::new();
        if vars::is_site_dependent(ctx, cond, &mut pending) {
            ctx.has_site_dependent_conditional = true;
        } else {
            ctx.conditional_vars.extend(pending);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Whether a function's body (or anything it calls) contains a site
    /// loop. Cached; cycles terminate via the visited set.
    pub fn function_contains_loop(&mut self, fid: FuncId) -> bool {
        if let Some(&b) = self.loop_cache.get(&fid) {
            return b;
        }
        let mut visited = HashSet::new();
        let b = self.contains_loop_rec(fid, &mut visited);
        self.loop_cache.insert(fid, b);
        b
    }

    fn contains_loop_rec(&self, fid: FuncId, visited: &mut HashSet<FuncId>) -> bool {
        if !visited.insert(fid) {
            return false;
        }
        match self.unit.func(fid).body {
            Some(b) => self.stmt_contains_loop(b, visited),
            None => false,
        }
    }

    fn stmt_contains_loop(&self, s: StmtId, visited: &mut HashSet<FuncId>) -> bool {
        match &self.unit.stmt(s).kind {
            StmtKind::SiteLoop { .. } => true,
            StmtKind::Expr(e) => {
                self.is_statement_loop(*e) || self.expr_contains_loop(*e, visited)
            }
            StmtKind::Decl { init, .. } => init
                .map(|i| self.expr_contains_loop(i, visited))
                .unwrap_or(false),
            StmtKind::Block(items) => items
                .iter()
                .any(|&it| self.stmt_contains_loop(it, visited)),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr_contains_loop(*cond, visited)
                    || self.stmt_contains_loop(*then_branch, visited)
                    || else_branch
                        .map(|e| self.stmt_contains_loop(e, visited))
                        .unwrap_or(false)
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                init.map(|i| self.stmt_contains_loop(i, visited))
                    .unwrap_or(false)
                    || cond
                        .map(|c| self.expr_contains_loop(c, visited))
                        .unwrap_or(false)
                    || step
                        .map(|s| self.expr_contains_loop(s, visited))
                        .unwrap_or(false)
                    || self.stmt_contains_loop(*body, visited)
            }
            StmtKind::While { cond, body }
            | StmtKind::Switch { cond, body }
            | StmtKind::DoWhile { body, cond } => {
                self.expr_contains_loop(*cond, visited)
                    || self.stmt_contains_loop(*body, visited)
            }
            StmtKind::Return(e) => e
                .map(|e| self.expr_contains_loop(e, visited))
                .unwrap_or(false),
        }
    }

    fn expr_contains_loop(&self, e: ExprId, visited: &mut HashSet<FuncId>) -> bool {
        if let ExprKind::Call(call) = &self.unit.expr(e).kind {
            if let Some(fid) = call.func {
                if self.contains_loop_rec(fid, visited) {
                    return true;
                }
            }
        }
        self.unit
            .children(e)
            .iter()
            .any(|&c| self.expr_contains_loop(c, visited))
    }

    fn dump_stmt(&self, s: StmtId) {
        let text = self.unit.text(self.unit.stmt(s).span);
        let first = text.lines().next().unwrap_or("");
        eprintln!("**** tree dump of statement '{}'", first);
        eprintln!("{:#?}", self.unit.stmt(s));
        eprintln!("*****************************");
    }
}

/// Render source text as a line-comment block.
fn comment_block(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        out.push_str("// ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FnDef, UnitBuilder};
    use crate::specialize::MemorySpecDb;

    fn analyze(unit: &Unit) -> AnalysisResult {
        let mut db = MemorySpecDb::new();
        analyze_unit(unit, &mut db, &AnalyzeOptions::default())
    }

    /// `onsites(ALL) { f[X] = g[X + e_x]; }` — wrapped into a kernel fn.
    fn neighbor_loop(parity: Parity) -> Unit {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let g = b.field("g", "double");
        let fv = b.var(f);
        let gv = b.var(g);
        let x1 = b.site();
        let x2 = b.site();
        let ex = b.direction_const("e_x", 0);
        let shifted = b.add(x2, ex);
        let lhs = b.index(fv, x1);
        let rhs = b.index(gv, shifted);
        let asn = b.assign(AssignOp::Assign, lhs, rhs);
        let st = b.expr_stmt(asn);
        let body = b.block(vec![st]);
        let p = b.parity(parity);
        let lp = b.onsites(p, body);
        let outer = b.block(vec![lp]);
        b.add_function(FnDef::plain("kernel", "void", vec![], outer));
        b.finish()
    }

    #[test]
    fn neighbor_read_is_classified() {
        let unit = neighbor_loop(Parity::Even);
        let result = analyze(&unit);
        assert!(!result.analysis.failed, "{:?}", result.diagnostics);
        let lp = &result.analysis.loops[0];
        assert_eq!(lp.parity, ParityClass::Even);
        assert_eq!(lp.fields.len(), 2);
        let f = lp.fields.iter().find(|f| f.name == "f").unwrap();
        assert!(f.is_written && !f.is_read_neighbor);
        let g = lp.fields.iter().find(|f| f.name == "g").unwrap();
        assert!(g.is_read_neighbor && !g.is_written);
        assert_eq!(g.dirs.len(), 1);
        assert!(g.dirs[0].is_constant);
    }

    #[test]
    fn all_parity_write_neighbor_read_same_field_is_error() {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let fv1 = b.var(f);
        let fv2 = b.var(f);
        let x1 = b.site();
        let x2 = b.site();
        let ex = b.direction_const("e_x", 0);
        let shifted = b.add(x2, ex);
        let lhs = b.index(fv1, x1);
        let rhs = b.index(fv2, shifted);
        let asn = b.assign(AssignOp::Assign, lhs, rhs);
        let st = b.expr_stmt(asn);
        let body = b.block(vec![st]);
        let p = b.parity(Parity::All);
        let lp = b.onsites(p, body);
        let outer = b.block(vec![lp]);
        b.add_function(FnDef::plain("kernel", "void", vec![], outer));
        let unit = b.finish();

        let result = analyze(&unit);
        assert!(result.analysis.failed);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0107)));
    }

    #[test]
    fn statement_form_loop_takes_parity_from_index() {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let fv = b.var(f);
        let p = b.parity(Parity::Odd);
        let lhs = b.index(fv, p);
        let two = b.float(2.0);
        let asn = b.assign(AssignOp::Assign, lhs, two);
        let st = b.expr_stmt(asn);
        let outer = b.block(vec![st]);
        b.add_function(FnDef::plain("kernel", "void", vec![], outer));
        let unit = b.finish();

        let result = analyze(&unit);
        assert!(!result.analysis.failed, "{:?}", result.diagnostics);
        assert_eq!(result.analysis.loops.len(), 1);
        assert_eq!(result.analysis.loops[0].parity, ParityClass::Odd);
    }

    #[test]
    fn sum_reduction_is_detected() {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let s = b.external_var("total", "double");
        let fv = b.var(f);
        let x = b.site();
        let read = b.index(fv, x);
        let sv = b.var(s);
        let asn = b.assign(AssignOp::AddAssign, sv, read);
        let st = b.expr_stmt(asn);
        let body = b.block(vec![st]);
        let p = b.parity(Parity::All);
        let lp = b.onsites(p, body);
        let outer = b.block(vec![lp]);
        b.add_function(FnDef::plain("kernel", "void", vec![], outer));
        let unit = b.finish();

        let result = analyze(&unit);
        assert!(!result.analysis.failed, "{:?}", result.diagnostics);
        let lp = &result.analysis.loops[0];
        let total = lp.vars.iter().find(|v| v.name == "total").unwrap();
        assert_eq!(total.reduction, Reduction::Sum);
        assert!(total.is_site_dependent);
        assert!(!total.is_loop_local);
    }

    #[test]
    fn site_field_expr_outside_loop_is_error() {
        let mut b = UnitBuilder::new("u");
        let f = b.field("f", "double");
        let t = b.external_var("t", "double");
        let fv = b.var(f);
        let x = b.site();
        let read = b.index(fv, x);
        let tv = b.var(t);
        let asn = b.assign(AssignOp::Assign, tv, read);
        let st = b.expr_stmt(asn);
        let outer = b.block(vec![st]);
        b.add_function(FnDef::plain("setup", "void", vec![], outer));
        let unit = b.finish();

        let result = analyze(&unit);
        assert!(result.analysis.failed);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0111)));
    }

    #[test]
    fn edited_source_keeps_original_loop_as_comment() {
        let unit = neighbor_loop(Parity::All);
        let result = analyze(&unit);
        assert!(result
            .analysis
            .edited_source
            .contains("// onsites(ALL)"));
    }
}
