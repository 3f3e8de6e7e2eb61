use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use slx::ast::{AssignOp, Parity, Unit};
use slx::builder::{FnDef, UnitBuilder};
use slx::driver::{analyze_unit, AnalyzeOptions};
use slx::specialize::MemorySpecDb;

// Synthetic unit: `loops` site loops, each with `stmts` neighbor-stencil
// statements, hosted in one kernel function.
fn stencil_unit(loops: usize, stmts: usize) -> Unit {
    let mut b = UnitBuilder::new("bench");
    let f = b.field("f", "double");
    let g = b.field("g", "double");
    let mut top = Vec::new();
    for _ in 0..loops {
        let mut body_stmts = Vec::new();
        for k in 0..stmts {
            let fv = b.var(f);
            let gv = b.var(g);
            let x1 = b.site();
            let x2 = b.site();
            let dir_name = ["e_x", "e_y", "e_z", "e_t"][k % 4];
            let ex = b.direction_const(dir_name, (k % 4) as i64);
            let shifted = b.add(x2, ex);
            let lhs = b.index(fv, x1);
            let rhs = b.index(gv, shifted);
            let asn = b.assign(AssignOp::AddAssign, lhs, rhs);
            body_stmts.push(b.expr_stmt(asn));
        }
        let body = b.block(body_stmts);
        let p = b.parity(Parity::Even);
        top.push(b.onsites(p, body));
    }
    let outer = b.block(top);
    b.add_function(FnDef::plain("kernel", "void", vec![], outer));
    b.finish()
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze_unit");
    for (loops, stmts) in [(1, 8), (8, 8), (8, 64)] {
        let unit = stencil_unit(loops, stmts);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", loops, stmts)),
            &unit,
            |bencher, unit| {
                bencher.iter(|| {
                    let mut db = MemorySpecDb::new();
                    let result =
                        analyze_unit(black_box(unit), &mut db, &AnalyzeOptions::default());
                    black_box(result.analysis.loops.len())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_analysis);
criterion_main!(benches);
