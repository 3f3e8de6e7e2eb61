// vars.rs — Variable reference tracking, dependencies, and the check pass
//
// Records one `VarInfo` per distinct plain variable touched in a loop,
// classifies reductions on externally declared variables, builds the
// dependency graph from assignment right-hand sides, propagates the
// site-dependence attribute to a fixpoint, and validates the mutation
// contract after collection completes. Also implements the array-access
// policy (uniform captures, whole-array captures, histogram reductions)
// and the site-dependence query the conditional analyzer uses.
//
// Preconditions: called with the per-loop context during or after the body
//                walk.
// Postconditions: site-dependence marks are exactly the transitive closure
//                 of "depends on a loop-local variable or a field read".
// Failure modes: DSL violations produce Diagnostic entries.
// Side effects: none beyond the context.

use crate::ast::{container_element_type, AssignOp, DeclId, ExprId, ExprKind};
use crate::diag::{codes, Diagnostic};
use crate::driver::LoopCtx;

// ── Data model ───────────────────────────────────────────────────────────

/// Reduction classification of an externally declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    None,
    Sum,
    Product,
}

impl Reduction {
    pub fn from_op(op: AssignOp) -> Reduction {
        match op {
            AssignOp::AddAssign => Reduction::Sum,
            AssignOp::MulAssign => Reduction::Product,
            _ => Reduction::None,
        }
    }
}

/// One occurrence of a plain variable.
#[derive(Debug, Clone)]
pub struct VarRefRecord {
    pub expr: ExprId,
    /// The immediately enclosing assignment operator, when the occurrence
    /// is an assignment target.
    pub assign_op: Option<AssignOp>,
    pub is_assigned: bool,
}

/// One distinct plain variable touched in the loop.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub decl: DeclId,
    pub name: String,
    pub ty: String,
    pub is_loop_local: bool,
    pub reduction: Reduction,
    pub is_site_dependent: bool,
    pub is_assigned: bool,
    /// Indices of VarInfos this variable's value depends on.
    pub depends_on: Vec<usize>,
    pub refs: Vec<VarRefRecord>,
}

/// A histogram-style reduction `container[loop_local] op= value` over a
/// caller-provided container.
#[derive(Debug, Clone)]
pub struct HistogramRef {
    pub expr: ExprId,
    pub container: DeclId,
    pub container_name: String,
    pub index_name: String,
    pub element_type: String,
    pub op: Reduction,
}

/// An external container access that is uniform across sites (or captured
/// whole when the index is loop-local); replaced by a loop-entry temporary
/// downstream.
#[derive(Debug, Clone)]
pub struct ArrayCapture {
    pub expr: ExprId,
    pub element_type: String,
    /// Whole-array capture (loop-local index) vs. single uniform element.
    pub whole: bool,
}

// ── Reference tracking ───────────────────────────────────────────────────

/// Find or create the VarInfo for a declaration.
pub fn find_or_create_var(ctx: &mut LoopCtx, decl: DeclId) -> usize {
    if let Some(i) = ctx.var_infos.iter().position(|v| v.decl == decl) {
        return i;
    }
    let d = ctx.unit.decl(decl);
    ctx.var_infos.push(VarInfo {
        decl,
        name: d.name.clone(),
        ty: d.ty.clone(),
        is_loop_local: ctx.scope.is_loop_local(decl),
        reduction: Reduction::None,
        is_site_dependent: false,
        is_assigned: false,
        depends_on: Vec::new(),
        refs: Vec::new(),
    });
    ctx.var_infos.len() - 1
}

/// Record one occurrence of a plain variable. `value` is the right-hand
/// side of the defining expression for assigning occurrences.
pub fn handle_var_ref(
    ctx: &mut LoopCtx,
    e: ExprId,
    is_assigned: bool,
    op: Option<AssignOp>,
    value: Option<ExprId>,
) {
    let decl = match ctx.unit.expr(e).kind {
        ExprKind::VarRef { decl } => decl,
        _ => return,
    };
    let vi = find_or_create_var(ctx, decl);

    ctx.var_infos[vi].refs.push(VarRefRecord {
        expr: e,
        assign_op: op.filter(|_| is_assigned),
        is_assigned,
    });

    if is_assigned {
        ctx.var_infos[vi].is_assigned = true;
        if !ctx.var_infos[vi].is_loop_local {
            if let Some(op) = op {
                let red = Reduction::from_op(op);
                if red != Reduction::None {
                    ctx.var_infos[vi].reduction = red;
                }
            }
        }
        if let Some(rhs) = value {
            record_dependencies(ctx, vi, rhs);
        }
    }
}

/// Add dependency edges from an assignment target to everything read on
/// its right-hand side. A field read marks the target site-dependent
/// immediately; the site symbol itself counts as a field-level read.
pub fn record_dependencies(ctx: &mut LoopCtx, target: usize, rhs: ExprId) {
    let mut stack = vec![rhs];
    while let Some(e) = stack.pop() {
        match &ctx.unit.expr(e).kind {
            ExprKind::VarRef { decl } if !ctx.unit.is_field_expr(e) => {
                let dep = find_or_create_var(ctx, *decl);
                if dep != target && !ctx.var_infos[target].depends_on.contains(&dep) {
                    ctx.var_infos[target].depends_on.push(dep);
                }
            }
            ExprKind::Index { base, .. } if ctx.unit.is_field_expr(*base) => {
                ctx.var_infos[target].is_site_dependent = true;
            }
            ExprKind::Site => {
                ctx.var_infos[target].is_site_dependent = true;
            }
            _ => {}
        }
        stack.extend(ctx.unit.children(e));
    }
}

/// Dependency edges for a loop-local declaration with an initializer.
pub fn record_decl_dependencies(ctx: &mut LoopCtx, decl: DeclId, init: ExprId) {
    let vi = find_or_create_var(ctx, decl);
    record_dependencies(ctx, vi, init);
}

// ── Array accesses ───────────────────────────────────────────────────────

/// True when the expression tree reads any loop-local variable.
pub fn contains_loop_local(ctx: &LoopCtx, e: ExprId) -> bool {
    let mut stack = vec![e];
    while let Some(e) = stack.pop() {
        if let ExprKind::VarRef { decl } = ctx.unit.expr(e).kind {
            if ctx.scope.is_loop_local(decl) {
                return true;
            }
        }
        stack.extend(ctx.unit.children(e));
    }
    false
}

/// Read access to a non-field container element. Returns true when the
/// access was fully handled (caller skips the subtree).
pub fn handle_array_read(ctx: &mut LoopCtx, e: ExprId) -> bool {
    let (base, index) = match ctx.unit.expr(e).kind {
        ExprKind::Index { base, index } => (base, index),
        _ => return false,
    };
    let container = match ctx.unit.find_base_decl(base) {
        Some(d) => d,
        // Not rooted in a variable (a call result): nothing to capture.
        None => return false,
    };
    let container_local = ctx.scope.is_loop_local(container);
    let index_local = contains_loop_local(ctx, index);
    let element_type = ctx.unit.expr(e).ty.clone();

    match (container_local, index_local) {
        (false, false) => {
            // Uniform across sites; captured as a single temporary.
            ctx.captures.push(ArrayCapture {
                expr: e,
                element_type,
                whole: false,
            });
            true
        }
        (false, true) => {
            // The whole container must be available per site.
            ctx.captures.push(ArrayCapture {
                expr: e,
                element_type,
                whole: true,
            });
            true
        }
        (true, false) => {
            // The index is communicated to the loop as an ordinary
            // external variable.
            let idx = ctx.unit.skip_parens(index);
            if matches!(ctx.unit.expr(idx).kind, ExprKind::VarRef { .. }) {
                handle_var_ref(ctx, idx, false, None, None);
            }
            true
        }
        (true, true) => true,
    }
}

/// Assignment to a non-field container element. Recognizes the histogram
/// reduction shape `external[loop_local] op= value`; any other assignment
/// through an external container is rejected. Returns true when handled.
pub fn handle_array_assign(
    ctx: &mut LoopCtx,
    target: ExprId,
    op: AssignOp,
    _value: ExprId,
) -> bool {
    let (base, index) = match ctx.unit.expr(target).kind {
        ExprKind::Index { base, index } => (base, index),
        _ => return false,
    };
    let container = match ctx.unit.find_base_decl(base) {
        Some(d) => d,
        None => return false,
    };
    let container_local = ctx.scope.is_loop_local(container);
    let index_local = contains_loop_local(ctx, index);
    let span = ctx.unit.expr(target).span;

    if container_local {
        // Local container: the write is private to the site. An external
        // index still needs ordinary variable handling.
        let idx = ctx.unit.skip_parens(index);
        if !index_local && matches!(ctx.unit.expr(idx).kind, ExprKind::VarRef { .. }) {
            handle_var_ref(ctx, idx, false, None, None);
        }
        return true;
    }

    if index_local {
        let idx = ctx.unit.skip_parens(index);
        let red = Reduction::from_op(op);
        let plain_local_index = matches!(
            ctx.unit.expr(idx).kind,
            ExprKind::VarRef { decl } if ctx.scope.is_loop_local(decl)
        );
        if red != Reduction::None && plain_local_index {
            let d = ctx.unit.decl(container);
            let element_type = container_element_type(&d.ty)
                .unwrap_or(&d.ty)
                .to_string();
            let container_name = d.name.clone();
            ctx.histograms.push(HistogramRef {
                expr: target,
                container,
                container_name,
                index_name: ctx.unit.expr_text(idx).to_string(),
                element_type,
                op: red,
            });
            handle_var_ref(ctx, idx, false, None, None);
        } else {
            ctx.diags.push(
                Diagnostic::error(
                    span,
                    "cannot combine a loop-local index with a container defined \
                     outside the loop, except in a histogram reduction \
                     'container[index] += value'",
                )
                .with_code(codes::E0203),
            );
        }
        return true;
    }

    // External container, uniform index: mutation of external state.
    ctx.diags.push(
        Diagnostic::error(
            span,
            "cannot assign to a container element defined outside the site loop",
        )
        .with_code(codes::E0202),
    );
    true
}

// ── Site dependence ──────────────────────────────────────────────────────

/// Whether an expression's value can differ between sites. Variables whose
/// standing is not yet known are appended to `pending` for the
/// post-fixpoint conditional check.
pub fn is_site_dependent(ctx: &mut LoopCtx, e: ExprId, pending: &mut Vec<usize>) -> bool {
    let mut dependent = false;
    let mut stack = vec![e];
    while let Some(e) = stack.pop() {
        match &ctx.unit.expr(e).kind {
            ExprKind::Site => dependent = true,
            ExprKind::Index { base, .. } if ctx.unit.is_field_expr(*base) => {
                dependent = true;
            }
            ExprKind::VarRef { decl } => {
                let vi = find_or_create_var(ctx, *decl);
                if ctx.var_infos[vi].is_site_dependent || ctx.var_infos[vi].is_loop_local {
                    dependent = true;
                } else {
                    pending.push(vi);
                }
            }
            _ => {}
        }
        stack.extend(ctx.unit.children(e));
    }
    dependent
}

/// Fixpoint closure over the dependency graph: a variable becomes
/// site-dependent when anything it depends on is site-dependent or
/// loop-local. Edges arrive in statement order, not topological order, so
/// the scan repeats until it makes no new marks.
pub fn propagate_site_dependence(ctx: &mut LoopCtx) {
    loop {
        let mut changed = false;
        for i in 0..ctx.var_infos.len() {
            if ctx.var_infos[i].is_site_dependent {
                continue;
            }
            let hit = ctx.var_infos[i].depends_on.iter().any(|&d| {
                ctx.var_infos[d].is_site_dependent || ctx.var_infos[d].is_loop_local
            });
            if hit {
                ctx.var_infos[i].is_site_dependent = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

// ── Check pass ───────────────────────────────────────────────────────────

/// Validate the mutation contract for externally declared variables after
/// collection completes.
pub fn check_var_refs(ctx: &mut LoopCtx) {
    for vi in 0..ctx.var_infos.len() {
        let info = ctx.var_infos[vi].clone();
        if info.is_loop_local {
            continue;
        }

        if info.reduction != Reduction::None {
            let assigns: Vec<usize> = info
                .refs
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_assigned)
                .map(|(i, _)| i)
                .collect();
            if assigns.len() > 1 {
                for (k, &ai) in assigns.iter().enumerate().skip(1) {
                    let span = ctx.unit.expr(info.refs[ai].expr).span;
                    ctx.diags.push(
                        Diagnostic::error(
                            span,
                            format!(
                                "reduction variable '{}' assigned more than once \
                                 within one site loop",
                                info.name
                            ),
                        )
                        .with_code(codes::E0201),
                    );
                    for (j, &aj) in assigns.iter().enumerate() {
                        if j != k {
                            let span = ctx.unit.expr(info.refs[aj].expr).span;
                            ctx.diags.push(Diagnostic::remark(
                                span,
                                format!("other assignment to '{}' here", info.name),
                            ));
                        }
                    }
                }
            }
        } else if info.is_assigned {
            for r in &info.refs {
                if r.is_assigned {
                    let span = ctx.unit.expr(r.expr).span;
                    ctx.diags.push(
                        Diagnostic::error(
                            span,
                            format!(
                                "cannot assign to variable '{}' defined outside the \
                                 site loop (unless a reduction '+=' or '*=')",
                                info.name
                            ),
                        )
                        .with_code(codes::E0202),
                    );
                }
            }
        }
    }

    propagate_site_dependence(ctx);
}
