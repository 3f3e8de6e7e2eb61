// field.rs — Field reference collection and field info resolution
//
// The collector records one `FieldRef` per syntactic occurrence of a
// per-site field access and classifies its index operand. The resolver
// aggregates the collected references into one `FieldInfo` per distinct
// field identity, dedups direction accesses structurally, and validates
// the read/write hazards that depend on the loop's parity class.
//
// Preconditions: called with the per-loop context while the driver walks
//                the loop body (collector) or after the walk (resolver).
// Postconditions: every FieldRef resolves to exactly one FieldInfo.
// Failure modes: undecomposable index chains are Fatal; DSL violations
//                produce Diagnostic entries and analysis continues.
// Side effects: none beyond the context.

use crate::ast::{types, ExprId, ExprKind, field_element_type, BinOp, Span};
use crate::canon::{canonical_expr, eval_const};
use crate::diag::{codes, Diagnostic, Fatal, FatalResult};
use crate::driver::{LoopCtx, ParityClass};

// ── Data model ───────────────────────────────────────────────────────────

/// Classification of a field index operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexClass {
    /// `f[X]` — plain per-site access.
    Site,
    /// `f[X + e]` with a compile-time-constant direction.
    ConstDirection(i64),
    /// `f[X + d]` with a runtime-selected direction.
    VarDirection,
    /// `f[X + v]` with a general coordinate offset.
    Offset,
    /// `f[EVEN]` — explicit parity; fixes the loop's parity class.
    Parity,
}

/// One syntactic occurrence of `field[index]`. Immutable once created.
#[derive(Debug, Clone)]
pub struct FieldRef {
    /// The full access expression; node identity used for deduplication.
    pub full: ExprId,
    pub name: ExprId,
    pub index: ExprId,
    pub class: IndexClass,
    /// Direction/offset operand text with the site symbol removed.
    pub dir_text: Option<String>,
    pub is_written: bool,
    pub is_read: bool,
    /// Statement sequence number at the point of occurrence.
    pub sequence: u32,
}

impl FieldRef {
    pub fn is_direction(&self) -> bool {
        matches!(
            self.class,
            IndexClass::ConstDirection(_) | IndexClass::VarDirection | IndexClass::Offset
        )
    }

    pub fn is_offset(&self) -> bool {
        self.class == IndexClass::Offset
    }
}

/// One distinct neighbor offset used against a field.
#[derive(Debug, Clone)]
pub struct DirectionAccess {
    pub index: ExprId,
    pub dir_text: String,
    pub is_offset: bool,
    pub is_constant: bool,
    pub constant_value: i64,
    /// Number of nearest-neighbor (non-offset) accesses sharing this
    /// direction.
    pub count: u32,
    /// Indices into the loop's FieldRef list.
    pub refs: Vec<usize>,
}

/// Aggregate access information for one distinct field in the loop.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Canonical field-name text; the identity references resolve by.
    pub name: String,
    pub name_expr: ExprId,
    pub element_type: String,
    pub is_written: bool,
    pub is_read_at_site: bool,
    pub is_read_neighbor: bool,
    pub is_read_offset: bool,
    pub first_assign_seq: u32,
    pub dirs: Vec<DirectionAccess>,
    /// Indices into the loop's FieldRef list.
    pub refs: Vec<usize>,
}

// ── Collector ────────────────────────────────────────────────────────────

/// Record one field access. Returns the index expression when it must be
/// walked for variable dependencies (runtime-selected direction/offset).
///
/// `is_func_arg` marks an access bound to a mutable reference parameter,
/// which writes through the reference and is diagnosed separately.
pub fn handle_field_access(
    ctx: &mut LoopCtx,
    e: ExprId,
    is_assign: bool,
    is_also_read: bool,
    is_func_arg: bool,
) -> FatalResult<Option<ExprId>> {
    let unit = ctx.unit;
    let (name, index) = match unit.expr(e).kind {
        ExprKind::Index { base, index } => (base, index),
        _ => {
            return Err(Fatal::new(
                codes::F0001,
                unit.expr(e).span,
                "expected a field access expression",
            ))
        }
    };

    // Idempotent collection: nested re-entry may visit a node twice.
    if ctx.field_refs.iter().any(|r| r.full == e) {
        return Ok(None);
    }

    let index_ty = unit.expr(index).ty.clone();
    let index_span = unit.expr(index).span;
    let mut nested_walk = None;

    let (class, dir_text) = match index_ty.as_str() {
        types::SITE => (IndexClass::Site, None),
        types::PARITY => {
            if ctx.accept_field_parity {
                // First reference of a statement-form loop fixes the
                // parity class for the whole loop.
                ctx.parity = parity_of_expr(ctx, index);
                ctx.parity_text = unit.expr_text(index).to_string();
            } else {
                ctx.diags.push(
                    Diagnostic::error(
                        index_span,
                        "field[parity] is not allowed here, use field[X] instead",
                    )
                    .with_code(codes::E0101),
                );
            }
            (IndexClass::Parity, None)
        }
        types::SITE_NEIGHBOR | types::SITE_OFFSET => {
            let is_offset = index_ty == types::SITE_OFFSET;
            if is_assign && !is_func_arg {
                ctx.diags.push(
                    Diagnostic::error(
                        index_span,
                        "cannot assign to a field expression with a [X + dir] index",
                    )
                    .with_code(codes::E0102),
                );
            }
            if is_assign && is_func_arg {
                ctx.diags.push(
                    Diagnostic::error(
                        index_span,
                        "cannot bind a field expression with a [X + dir] index \
                         to a mutable reference parameter",
                    )
                    .with_code(codes::E0103),
                );
            }

            let dir = decompose_site_shift(ctx, index)?;
            // Constant directions keep their source spelling (dedup goes
            // by value); variable directions dedup by canonical text.
            let (class, text) = if is_offset {
                match eval_const(unit, dir) {
                    Some(_) => (IndexClass::Offset, unit.expr_text(dir).to_string()),
                    None => {
                        nested_walk = Some(index);
                        (IndexClass::Offset, canonical_expr(unit, dir))
                    }
                }
            } else {
                match eval_const(unit, dir) {
                    Some(v) => (
                        IndexClass::ConstDirection(v),
                        unit.expr_text(dir).to_string(),
                    ),
                    None => {
                        nested_walk = Some(index);
                        (IndexClass::VarDirection, canonical_expr(unit, dir))
                    }
                }
            };
            (class, Some(text))
        }
        other => {
            return Err(Fatal::new(
                codes::F0001,
                index_span,
                format!("cannot classify field index of type '{}'", other),
            ))
        }
    };

    // Any field reference after the first must use the implicit site index.
    ctx.accept_field_parity = false;

    check_name_chain(ctx, name);

    ctx.field_refs.push(FieldRef {
        full: e,
        name,
        index,
        class,
        dir_text,
        is_written: is_assign,
        is_read: is_also_read || !is_assign,
        sequence: ctx.stmt_sequence,
    });

    Ok(nested_walk)
}

/// Parity class of a parity-typed index expression.
fn parity_of_expr(ctx: &LoopCtx, index: ExprId) -> ParityClass {
    let unit = ctx.unit;
    match unit.expr(unit.skip_parens(index)).kind {
        ExprKind::ParityLit(p) => ParityClass::from_parity(p),
        // A runtime parity value: not known until the loop executes.
        _ => ParityClass::Unknown,
    }
}

/// Split `X + dir` / `X + offset` into its non-site operand.
fn decompose_site_shift(ctx: &LoopCtx, index: ExprId) -> FatalResult<ExprId> {
    let unit = ctx.unit;
    let stripped = unit.skip_parens(index);
    if let ExprKind::Binary {
        op: BinOp::Add,
        lhs,
        rhs,
    } = unit.expr(stripped).kind
    {
        let l = unit.skip_parens(lhs);
        let r = unit.skip_parens(rhs);
        if matches!(unit.expr(l).kind, ExprKind::Site) {
            return Ok(r);
        }
        if matches!(unit.expr(r).kind, ExprKind::Site) {
            return Ok(l);
        }
    }
    Err(Fatal::new(
        codes::F0001,
        unit.expr(index).span,
        "could not decompose site + direction/offset index",
    ))
}

/// A field-name expression must not depend on loop-local variables.
fn check_name_chain(ctx: &mut LoopCtx, name: ExprId) {
    let unit = ctx.unit;
    let mut stack = vec![name];
    while let Some(e) = stack.pop() {
        if let ExprKind::VarRef { decl } = unit.expr(e).kind {
            if ctx.scope.is_loop_local(decl) {
                ctx.diags.push(
                    Diagnostic::error(
                        unit.expr(e).span,
                        "field reference depends on a loop-local variable",
                    )
                    .with_code(codes::E0105),
                );
            }
        }
        stack.extend(unit.children(e));
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────

/// Aggregate collected references into FieldInfos and validate hazards.
/// Runs once per loop after the body walk completes.
pub fn resolve_field_refs(ctx: &mut LoopCtx) {
    ctx.field_infos.clear();

    for ri in 0..ctx.field_refs.len() {
        let r = ctx.field_refs[ri].clone();
        let name = canonical_expr(ctx.unit, r.name);
        let name_ty = ctx.unit.expr(r.name).ty.clone();
        let name_span = ctx.unit.expr(r.name).span;

        let fi = match ctx.field_infos.iter().position(|i| i.name == name) {
            Some(i) => i,
            None => {
                let element_type = match field_element_type(&name_ty) {
                    Some(t) => t.to_string(),
                    None => {
                        ctx.diags.push(
                            Diagnostic::error(
                                name_span,
                                format!(
                                    "confused by the type of field expression: '{}'",
                                    name_ty
                                ),
                            )
                            .with_code(codes::E0106),
                        );
                        name_ty.clone()
                    }
                };
                ctx.field_infos.push(FieldInfo {
                    name: name.clone(),
                    name_expr: r.name,
                    element_type,
                    is_written: false,
                    is_read_at_site: false,
                    is_read_neighbor: false,
                    is_read_offset: false,
                    first_assign_seq: 0,
                    dirs: Vec::new(),
                    refs: Vec::new(),
                });
                ctx.field_infos.len() - 1
            }
        };

        // Element type must agree across references to the same identity.
        if let Some(t) = field_element_type(&name_ty) {
            if ctx.field_infos[fi].element_type != t {
                ctx.diags.push(
                    Diagnostic::error(
                        name_span,
                        format!(
                            "field '{}' element type mismatch: '{}' vs '{}'",
                            name, ctx.field_infos[fi].element_type, t
                        ),
                    )
                    .with_code(codes::E0106),
                );
            }
        }

        if r.is_written && !ctx.field_infos[fi].is_written {
            ctx.field_infos[fi].first_assign_seq = r.sequence;
            ctx.field_infos[fi].is_written = true;
        }

        // A plain per-site read counts as an at-site read only when it
        // occurs at or before the field's first write.
        if r.is_read {
            if r.is_direction() {
                ctx.field_infos[fi].is_read_neighbor = true;
            } else if !ctx.field_infos[fi].is_written
                || ctx.field_infos[fi].first_assign_seq >= r.sequence
            {
                ctx.field_infos[fi].is_read_at_site = true;
            }
        }
        if r.is_offset() {
            ctx.field_infos[fi].is_read_offset = true;
        }

        ctx.field_infos[fi].refs.push(ri);

        if r.is_direction() {
            record_direction(ctx, fi, ri);
        }
    }

    validate_write_hazards(ctx);
}

/// Dedup a direction access against the field's existing list by constant
/// value or canonical equivalence.
fn record_direction(ctx: &mut LoopCtx, fi: usize, ri: usize) {
    let r = ctx.field_refs[ri].clone();
    let nn = !r.is_offset() as u32;
    let (is_constant, constant_value) = match r.class {
        IndexClass::ConstDirection(v) => (true, v),
        _ => (false, 0),
    };
    let dir_text = r.dir_text.clone().unwrap_or_default();

    for dp in &mut ctx.field_infos[fi].dirs {
        let found = if is_constant {
            dp.is_constant && dp.constant_value == constant_value
        } else {
            dp.dir_text == dir_text
        };
        if found {
            dp.count += nn;
            dp.refs.push(ri);
            return;
        }
    }

    ctx.field_infos[fi].dirs.push(DirectionAccess {
        index: r.index,
        dir_text,
        is_offset: r.is_offset(),
        is_constant,
        constant_value,
        count: nn,
        refs: vec![ri],
    });
}

/// `f[ALL] = …` combined with a neighbor read of `f` in the same loop is
/// undefined: the write may clobber values a neighbor read still needs.
/// Fixed single parity is safe; dynamically chosen parity gets a runtime
/// assertion instead of a hard error.
fn validate_write_hazards(ctx: &mut LoopCtx) {
    for fi in 0..ctx.field_infos.len() {
        let info = ctx.field_infos[fi].clone();
        if !info.is_written || info.dirs.is_empty() {
            continue;
        }

        let mut found = false;
        for &ri in &info.refs {
            let r = &ctx.field_refs[ri];
            if !(r.is_direction() && !r.is_written && !r.is_offset()) {
                continue;
            }
            let span = read_span(ctx, ri);
            match ctx.parity {
                ParityClass::All => {
                    ctx.diags.push(
                        Diagnostic::error(
                            span,
                            format!(
                                "simultaneous neighbor access '{}' and assignment \
                                 of '{}' not allowed with parity ALL",
                                ctx.unit.expr_text(ctx.field_refs[ri].full),
                                info.name
                            ),
                        )
                        .with_code(codes::E0107),
                    );
                    found = true;
                }
                ParityClass::Unknown => {
                    ctx.diags.push(Diagnostic::remark(
                        span,
                        format!(
                            "simultaneous neighbor access and assignment of '{}' \
                             is allowed only when parity {} is EVEN or ODD; \
                             inserting a runtime assertion",
                            info.name, ctx.parity_text
                        ),
                    ));
                    ctx.assert_parity_at_runtime = true;
                    found = true;
                }
                ParityClass::Even | ParityClass::Odd => {}
            }
        }

        if found {
            for &ri in &info.refs {
                if ctx.field_refs[ri].is_written {
                    let span = read_span(ctx, ri);
                    ctx.diags
                        .push(Diagnostic::remark(span, "location of the assignment"));
                }
            }
        }
    }
}

fn read_span(ctx: &LoopCtx, ri: usize) -> Span {
    ctx.unit.expr(ctx.field_refs[ri].full).span
}
