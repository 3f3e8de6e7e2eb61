// Loop-analysis conformance tests.
//
// Each test drives `analyze_unit` over a builder-constructed unit and
// checks classification results or diagnostics at the library boundary.
// Negative cases assert the stable diagnostic code, not message text.

use slx::ast::*;
use slx::builder::{FnDef, UnitBuilder};
use slx::diag::{codes, DiagLevel};
use slx::driver::{analyze_unit, AnalysisResult, AnalyzeOptions, LoopCtx, ParityClass};
use slx::field;
use slx::specialize::MemorySpecDb;
use slx::vars::Reduction;

fn analyze(unit: &Unit) -> AnalysisResult {
    let mut db = MemorySpecDb::new();
    analyze_unit(unit, &mut db, &AnalyzeOptions::default())
}

fn error_count(result: &AnalysisResult, code: slx::diag::DiagCode) -> usize {
    result
        .diagnostics
        .iter()
        .filter(|d| d.code == Some(code))
        .count()
}

fn remark_count(result: &AnalysisResult) -> usize {
    result
        .diagnostics
        .iter()
        .filter(|d| d.level == DiagLevel::Remark)
        .count()
}

/// Wrap loop statements into a `kernel` function and finish the unit.
fn kernel(mut b: UnitBuilder, stmts: Vec<StmtId>) -> Unit {
    let outer = b.block(stmts);
    b.add_function(FnDef::plain("kernel", "void", vec![], outer));
    b.finish()
}

// ── Idempotent collection ───────────────────────────────────────────────

#[test]
fn revisiting_a_field_access_node_does_not_duplicate_the_reference() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let fv = b.var(f);
    let x = b.site();
    let ex = b.direction_const("e_x", 0);
    let shifted = b.add(x, ex);
    let access = b.index(fv, shifted);
    let st = b.expr_stmt(access);
    let unit = kernel(b, vec![st]);

    let mut ctx = LoopCtx::new(
        &unit,
        ParityClass::All,
        "ALL".to_string(),
        String::new(),
        Default::default(),
        false,
    );
    field::handle_field_access(&mut ctx, access, false, false, false).unwrap();
    field::handle_field_access(&mut ctx, access, false, false, false).unwrap();
    assert_eq!(ctx.field_refs.len(), 1);
}

// ── Sequence monotonicity ───────────────────────────────────────────────

#[test]
fn statement_sequence_numbers_increase_in_source_order() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let mut stmts = Vec::new();
    for k in 0..4 {
        let fv = b.var(f);
        let x = b.site();
        let lhs = b.index(fv, x);
        let v = b.float(k as f64);
        let asn = b.assign(AssignOp::AddAssign, lhs, v);
        stmts.push(b.expr_stmt(asn));
    }
    let body = b.block(stmts);
    let p = b.parity(Parity::Even);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let seqs: Vec<u32> = result.analysis.loops[0]
        .field_refs
        .iter()
        .map(|r| r.sequence)
        .collect();
    assert_eq!(seqs.len(), 4);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{:?}", seqs);
}

// ── Fixpoint closure ────────────────────────────────────────────────────

#[test]
fn site_dependence_closes_over_edges_added_out_of_order() {
    // a = b; b = c; c = f[X];  — when c is finally marked, the earlier
    // edges a→b→c must still propagate.
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let a = b.external_var("a", "double");
    let bb = b.external_var("b", "double");
    let c = b.external_var("c", "double");
    let d = b.external_var("d", "double");

    let (av, bv1) = (b.var(a), b.var(bb));
    let s1e = b.assign(AssignOp::Assign, av, bv1);
    let s1 = b.expr_stmt(s1e);
    let (bv2, cv1) = (b.var(bb), b.var(c));
    let s2e = b.assign(AssignOp::Assign, bv2, cv1);
    let s2 = b.expr_stmt(s2e);
    let cv2 = b.var(c);
    let fv = b.var(f);
    let x = b.site();
    let read = b.index(fv, x);
    let s3e = b.assign(AssignOp::Assign, cv2, read);
    let s3 = b.expr_stmt(s3e);
    let dv = b.var(d);
    let s4 = b.expr_stmt(dv);

    let body = b.block(vec![s1, s2, s3, s4]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    // Plain external assignments are errors, but analysis continues.
    let result = analyze(&unit);
    let lp = &result.analysis.loops[0];
    let dep = |name: &str| lp.vars.iter().find(|v| v.name == name).unwrap();
    assert!(dep("a").is_site_dependent);
    assert!(dep("b").is_site_dependent);
    assert!(dep("c").is_site_dependent);
    assert!(!dep("d").is_site_dependent);
}

// ── Reduction exclusivity ───────────────────────────────────────────────

#[test]
fn double_sum_reduction_reports_one_error_and_one_remark() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let r = b.external_var("r", "double");
    let mut stmts = Vec::new();
    for _ in 0..2 {
        let rv = b.var(r);
        let fv = b.var(f);
        let x = b.site();
        let read = b.index(fv, x);
        let asn = b.assign(AssignOp::AddAssign, rv, read);
        stmts.push(b.expr_stmt(asn));
    }
    let body = b.block(stmts);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0201), 1);
    assert_eq!(remark_count(&result), 1);
}

// ── Hazard classification ───────────────────────────────────────────────

fn self_neighbor_unit(parity: Parity) -> Unit {
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
    let p = b.parity(parity);
    let lp = b.onsites(p, body);
    kernel(b, vec![lp])
}

#[test]
fn all_parity_self_neighbor_is_an_error() {
    let result = analyze(&self_neighbor_unit(Parity::All));
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0107), 1);
}

#[test]
fn fixed_single_parity_self_neighbor_is_clean() {
    let result = analyze(&self_neighbor_unit(Parity::Even));
    assert!(!result.analysis.failed);
    assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
}

#[test]
fn dynamic_parity_self_neighbor_gets_remark_and_runtime_assertion() {
    // Statement form: f[par] = f[X + e_x]; with a runtime parity value.
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let par = b.external_var("par", "Parity");
    let fv1 = b.var(f);
    let fv2 = b.var(f);
    let pv = b.var(par);
    let x = b.site();
    let ex = b.direction_const("e_x", 0);
    let shifted = b.add(x, ex);
    let lhs = b.index(fv1, pv);
    let rhs = b.index(fv2, shifted);
    let asn = b.assign(AssignOp::Assign, lhs, rhs);
    let st = b.expr_stmt(asn);
    let unit = kernel(b, vec![st]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    assert!(remark_count(&result) >= 1);
    let lp = &result.analysis.loops[0];
    assert_eq!(lp.parity, ParityClass::Unknown);
    assert!(lp.assert_parity_at_runtime);
}

// ── Scope cleanup ───────────────────────────────────────────────────────

#[test]
fn local_declaration_dies_with_its_block() {
    // { double t; t = f[X]; }  r += t * f[X];  — the later `t` is a
    // different, externally declared variable.
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let t_outer = b.external_var("t", "double");
    let r = b.external_var("r", "double");
    let t_inner = b.local_decl("t", "double");

    let d = b.decl_stmt(t_inner, None);
    let tv_in = b.var(t_inner);
    let fv1 = b.var(f);
    let x1 = b.site();
    let read1 = b.index(fv1, x1);
    let asn_in = b.assign(AssignOp::Assign, tv_in, read1);
    let s_in = b.expr_stmt(asn_in);
    let inner = b.block(vec![d, s_in]);

    let rv = b.var(r);
    let tv_out = b.var(t_outer);
    let fv2 = b.var(f);
    let x2 = b.site();
    let read2 = b.index(fv2, x2);
    let prod = b.mul(tv_out, read2);
    let asn_out = b.assign(AssignOp::AddAssign, rv, prod);
    let s_out = b.expr_stmt(asn_out);

    let body = b.block(vec![inner, s_out]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let lp = &result.analysis.loops[0];
    let ts: Vec<_> = lp.vars.iter().filter(|v| v.name == "t").collect();
    assert_eq!(ts.len(), 2);
    assert!(ts.iter().any(|v| v.is_loop_local));
    assert!(ts.iter().any(|v| !v.is_loop_local));
}

// ── Histogram reductions and array captures ─────────────────────────────

#[test]
fn histogram_reduction_is_recognized_and_exempted() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let hist = b.external_var("hist", "std::vector<double>");
    let i = b.local_decl("i", "int");
    let zero = b.int(0);
    let di = b.decl_stmt(i, Some(zero));
    let hv = b.var(hist);
    let iv = b.var(i);
    let elem = b.index(hv, iv);
    let fv = b.var(f);
    let x = b.site();
    let read = b.index(fv, x);
    let asn = b.assign(AssignOp::AddAssign, elem, read);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![di, st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let lp = &result.analysis.loops[0];
    assert_eq!(lp.histograms.len(), 1);
    assert_eq!(lp.histograms[0].element_type, "double");
    assert_eq!(lp.histograms[0].op, Reduction::Sum);
    assert_eq!(lp.histograms[0].container_name, "hist");
}

#[test]
fn plain_assignment_through_external_container_with_local_index_is_error() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let hist = b.external_var("hist", "std::vector<double>");
    let i = b.local_decl("i", "int");
    let zero = b.int(0);
    let di = b.decl_stmt(i, Some(zero));
    let hv = b.var(hist);
    let iv = b.var(i);
    let elem = b.index(hv, iv);
    let fv = b.var(f);
    let x = b.site();
    let read = b.index(fv, x);
    let asn = b.assign(AssignOp::Assign, elem, read);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![di, st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0203), 1);
}

#[test]
fn external_array_accesses_become_captures() {
    // arr[k] (uniform element) and arr[j] (whole-array capture).
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let arr = b.external_var("arr", "double[16]");
    let k = b.external_var("k", "int");
    let r = b.external_var("r", "double");
    let j = b.local_decl("j", "int");

    let one = b.int(1);
    let dj = b.decl_stmt(j, Some(one));
    let rv1 = b.var(r);
    let av1 = b.var(arr);
    let kv = b.var(k);
    let e1 = b.index(av1, kv);
    let fv = b.var(f);
    let x = b.site();
    let read = b.index(fv, x);
    let prod = b.mul(e1, read);
    let asn1 = b.assign(AssignOp::AddAssign, rv1, prod);
    let s1 = b.expr_stmt(asn1);

    let t = b.local_decl("t", "double");
    let av2 = b.var(arr);
    let jv = b.var(j);
    let e2 = b.index(av2, jv);
    let dt = b.decl_stmt(t, Some(e2));

    let body = b.block(vec![dj, s1, dt]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let lp = &result.analysis.loops[0];
    assert_eq!(lp.captures.len(), 2);
    assert!(lp.captures.iter().any(|c| !c.whole));
    assert!(lp.captures.iter().any(|c| c.whole));
}

// ── Conditional site dependence ─────────────────────────────────────────

#[test]
fn condition_on_field_derived_local_marks_the_loop_divergent() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let g = b.field("g", "double");
    let t = b.local_decl("t", "double");

    let fv = b.var(f);
    let x1 = b.site();
    let read = b.index(fv, x1);
    let dt = b.decl_stmt(t, Some(read));
    let tv = b.var(t);
    let zero = b.int(0);
    let cond = b.binary(BinOp::Gt, tv, zero);
    let gv = b.var(g);
    let x2 = b.site();
    let lhs = b.index(gv, x2);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st = b.expr_stmt(asn);
    let then_blk = b.block(vec![st]);
    let ifst = b.if_stmt(cond, then_blk, None);

    let body = b.block(vec![dt, ifst]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    assert!(result.analysis.loops[0].has_site_dependent_conditional);
}

#[test]
fn uniform_condition_does_not_mark_the_loop_divergent() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let u = b.external_var("u", "double");

    let uv = b.var(u);
    let zero = b.int(0);
    let cond = b.binary(BinOp::Gt, uv, zero);
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st = b.expr_stmt(asn);
    let then_blk = b.block(vec![st]);
    let ifst = b.if_stmt(cond, then_blk, None);

    let body = b.block(vec![ifst]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    assert!(!result.analysis.loops[0].has_site_dependent_conditional);
}

// ── Loop-body legality ──────────────────────────────────────────────────

#[test]
fn assignment_through_neighbor_index_is_error() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let fv = b.var(f);
    let x = b.site();
    let ex = b.direction_const("e_x", 0);
    let shifted = b.add(x, ex);
    let lhs = b.index(fv, shifted);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::Even);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0102), 1);
}

#[test]
fn explicit_parity_after_first_reference_is_error() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let g = b.field("g", "double");
    let fv = b.var(f);
    let gv = b.var(g);
    let p1 = b.parity(Parity::Even);
    let p2 = b.parity(Parity::Odd);
    let lhs = b.index(fv, p1);
    let rhs = b.index(gv, p2);
    let asn = b.assign(AssignOp::Assign, lhs, rhs);
    let st = b.expr_stmt(asn);
    let unit = kernel(b, vec![st]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0101), 1);
}

#[test]
fn field_name_depending_on_loop_local_variable_is_error() {
    // fs[j][X] with loop-local j: the field identity varies per site.
    let mut b = UnitBuilder::new("u");
    let fs = b.external_var("fs", "Field<double>[4]");
    let j = b.local_decl("j", "int");
    let zero = b.int(0);
    let dj = b.decl_stmt(j, Some(zero));
    let fsv = b.var(fs);
    let jv = b.var(j);
    let elem = b.index(fsv, jv);
    let x = b.site();
    let access = b.index(elem, x);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, access, one);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![dj, st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert!(error_count(&result, codes::E0105) >= 1);
}

#[test]
fn field_declarations_and_statics_are_rejected_inside_loops() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let tmp = b.local_decl("tmp", "Field<double>");
    let d1 = b.decl_stmt(tmp, None);
    let cnt = b.static_decl("cnt", "int");
    let d2 = b.decl_stmt(cnt, None);
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![d1, d2, st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0205), 1);
    assert_eq!(error_count(&result, codes::E0204), 1);
}

#[test]
fn taking_address_of_field_access_is_error() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let p_decl = b.local_decl("p", "double*");
    let fv = b.var(f);
    let x = b.site();
    let access = b.index(fv, x);
    let addr = b.addr_of(access);
    let dp = b.decl_stmt(p_decl, Some(addr));
    let body = b.block(vec![dp]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0206), 1);
}

#[test]
fn field_expression_without_site_index_is_error_inside_loop() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let g = b.field("g", "double");
    let gv = b.var(g);
    let norm = b.call("norm", vec![gv], "double");
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let asn = b.assign(AssignOp::Assign, lhs, norm);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0104), 1);
}

// ── Pragmas ─────────────────────────────────────────────────────────────

#[test]
fn raw_access_pragma_bypasses_variable_tracking() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let w = b.external_var("w", "double");
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let wv = b.var(w);
    let asn = b.assign(AssignOp::Assign, lhs, wv);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    b.tag(lp, Pragma::RawAccess(vec!["w".to_string()]));
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let lp = &result.analysis.loops[0];
    assert!(lp.vars.iter().all(|v| v.name != "w"));
    assert_eq!(lp.raw_access, vec!["w".to_string()]);
}

#[test]
fn no_vectorize_pragma_is_recorded() {
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st = b.expr_stmt(asn);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    b.tag(lp, Pragma::NoVectorize);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.loops[0].no_vectorize);
}

// ── Function calls in loops ─────────────────────────────────────────────

#[test]
fn mutable_reference_argument_counts_as_external_mutation() {
    let mut b = UnitBuilder::new("u");
    let body_empty = b.block(vec![]);
    let out = b.param("out", "double", true, false);
    let accum = b.add_function(FnDef::plain("accum", "void", vec![out], body_empty));

    let f = b.field("f", "double");
    let s = b.external_var("s", "double");
    let sv = b.var(s);
    let call = b.call_func(accum, vec![sv]);
    let st1 = b.expr_stmt(call);
    let fv = b.var(f);
    let x = b.site();
    let lhs = b.index(fv, x);
    let one = b.float(1.0);
    let asn = b.assign(AssignOp::Assign, lhs, one);
    let st2 = b.expr_stmt(asn);
    let body = b.block(vec![st1, st2]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert_eq!(error_count(&result, codes::E0202), 1);
}

#[test]
fn field_bound_to_mutable_reference_is_written_and_read() {
    let mut b = UnitBuilder::new("u");
    let body_empty = b.block(vec![]);
    let v = b.param("v", "double", true, false);
    let scale = b.add_function(FnDef::plain("scale", "void", vec![v], body_empty));

    let f = b.field("f", "double");
    let fv = b.var(f);
    let x = b.site();
    let access = b.index(fv, x);
    let call = b.call_func(scale, vec![access]);
    let st = b.expr_stmt(call);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::Even);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(!result.analysis.failed, "{:?}", result.diagnostics);
    let info = &result.analysis.loops[0].fields[0];
    assert!(info.is_written);
    assert!(info.is_read_at_site);
}

// ── Fatal conditions ────────────────────────────────────────────────────

#[test]
fn undecomposable_site_index_aborts_the_run() {
    // An index of site-shifted type that is not an addition chain.
    let mut b = UnitBuilder::new("u");
    let f = b.field("f", "double");
    let d = b.external_var("d", "Direction");
    let fv = b.var(f);
    let x = b.site();
    let dv = b.var(d);
    let idx = b.call("shift", vec![x, dv], types::SITE_NEIGHBOR);
    let access = b.index(fv, idx);
    let st = b.expr_stmt(access);
    let body = b.block(vec![st]);
    let p = b.parity(Parity::All);
    let lp = b.onsites(p, body);
    let unit = kernel(b, vec![lp]);

    let result = analyze(&unit);
    assert!(result.analysis.failed);
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.level == DiagLevel::Fatal));
    // No partial output survives a fatal condition.
    assert!(result.analysis.loops.is_empty());
    assert!(result.analysis.edited_source.is_empty());
}
