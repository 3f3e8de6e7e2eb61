// canon.rs — Canonical expression text
//
// Renders an expression into a normalized textual form: grouping
// parentheses stripped, integer-constant subexpressions folded, single
// spacing around operators. Two syntactically different but semantically
// identical expressions (e.g. `e_x` vs. a folded `0`-th direction constant,
// `(d)` vs. `d`) produce the same canonical text, which is what direction
// deduplication and specialization cache keys compare.
//
// Preconditions: expression ids belong to the given unit.
// Postconditions: output is deterministic for a given tree.
// Failure modes: none.
// Side effects: none.

use crate::ast::{BinOp, Expr, ExprId, ExprKind, UnOp, Unit};

/// Canonical text of an expression.
pub fn canonical_expr(unit: &Unit, id: ExprId) -> String {
    let id = unit.skip_parens(id);
    if let Some(v) = eval_const(unit, id) {
        return v.to_string();
    }
    let e = unit.expr(id);
    match &e.kind {
        ExprKind::IntLit(v) => v.to_string(),
        ExprKind::FloatLit(v) => format!("{v}"),
        ExprKind::ParityLit(p) => p.to_string(),
        ExprKind::Site => "X".to_string(),
        ExprKind::VarRef { decl } => unit.decl(*decl).name.clone(),
        ExprKind::Index { base, index } => format!(
            "{}[{}]",
            canonical_expr(unit, *base),
            canonical_expr(unit, *index)
        ),
        ExprKind::Member { base, member } => {
            format!("{}.{}", canonical_expr(unit, *base), member)
        }
        ExprKind::Unary { op, operand } => {
            format!("{}{}", op.symbol(), canonical_expr(unit, *operand))
        }
        ExprKind::AddrOf(operand) => format!("&{}", canonical_expr(unit, *operand)),
        ExprKind::Binary { op, lhs, rhs } => format!(
            "{} {} {}",
            canonical_expr(unit, *lhs),
            op.symbol(),
            canonical_expr(unit, *rhs)
        ),
        ExprKind::Assign { op, target, value } => format!(
            "{} {} {}",
            canonical_expr(unit, *target),
            op.symbol(),
            canonical_expr(unit, *value)
        ),
        ExprKind::Call(call) => {
            let args: Vec<String> = call
                .args
                .iter()
                .map(|&a| canonical_expr(unit, a))
                .collect();
            format!("{}({})", call.name, args.join(", "))
        }
        ExprKind::Ternary {
            cond,
            then_arm,
            else_arm,
        } => format!(
            "{} ? {} : {}",
            canonical_expr(unit, *cond),
            canonical_expr(unit, *then_arm),
            canonical_expr(unit, *else_arm)
        ),
        ExprKind::Paren(_) => unreachable!("parens stripped above"),
    }
}

/// Structural equivalence of two expressions under canonicalization.
pub fn equivalent(unit: &Unit, a: ExprId, b: ExprId) -> bool {
    canonical_expr(unit, a) == canonical_expr(unit, b)
}

/// Integer value of a compile-time-constant expression, when foldable.
pub fn eval_const(unit: &Unit, id: ExprId) -> Option<i64> {
    let e: &Expr = unit.expr(unit.skip_parens(id));
    if let Some(v) = e.const_value {
        return Some(v);
    }
    match &e.kind {
        ExprKind::IntLit(v) => Some(*v),
        ExprKind::Paren(inner) => eval_const(unit, *inner),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => eval_const(unit, *operand).map(|v| -v),
        ExprKind::Binary { op, lhs, rhs } => {
            let l = eval_const(unit, *lhs)?;
            let r = eval_const(unit, *rhs)?;
            match op {
                BinOp::Add => Some(l + r),
                BinOp::Sub => Some(l - r),
                BinOp::Mul => Some(l * r),
                BinOp::Div if r != 0 => Some(l / r),
                BinOp::Rem if r != 0 => Some(l % r),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Collapse whitespace runs to single spaces (canonical signature text).
pub fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ────────────────────────────────────────────────────────────────
