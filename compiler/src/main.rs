use clap::Parser;
use std::path::PathBuf;

use slx::driver::{analyze_unit, AnalyzeOptions};
use slx::specialize::MemorySpecDb;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Analysis,
    Source,
    Diags,
}

#[derive(Parser, Debug)]
#[command(
    name = "slx",
    version,
    about = "Site-loop compiler — analyzes and specializes lattice site loops"
)]
struct Cli {
    /// Resolved compilation unit (JSON, produced by the front end)
    unit: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Analysis)]
    emit: EmitStage,

    /// Cross-unit specialization cache file (loaded and updated)
    #[arg(long)]
    spec_cache: Option<PathBuf>,

    /// Emit specializations without the implicit `inline`
    #[arg(long)]
    no_inline: bool,

    /// Print analysis phases and counts
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        eprintln!("slx: unit = {}", cli.unit.display());
        eprintln!("slx: emit = {:?}", cli.emit);
    }

    // ── Load the resolved unit ──
    let text = match std::fs::read_to_string(&cli.unit) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("slx: error: {}: {}", cli.unit.display(), e);
            std::process::exit(2);
        }
    };
    let unit: slx::ast::Unit = match serde_json::from_str(&text) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("slx: error: {}: {}", cli.unit.display(), e);
            std::process::exit(2);
        }
    };

    if cli.verbose {
        eprintln!(
            "slx: {} functions, {} statements, {} expressions",
            unit.functions.len(),
            unit.stmts.len(),
            unit.exprs.len()
        );
    }

    // ── Specialization cache ──
    let mut db = match &cli.spec_cache {
        Some(path) if path.exists() => match MemorySpecDb::load(path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("slx: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        _ => MemorySpecDb::new(),
    };

    // ── Analysis ──
    let options = AnalyzeOptions {
        verbose: cli.verbose,
        no_inline_specializations: cli.no_inline,
    };
    let result = analyze_unit(&unit, &mut db, &options);

    for diag in &result.diagnostics {
        eprintln!("slx: {}", diag);
    }
    if cli.verbose {
        eprintln!(
            "slx: {} loops analyzed, {} specializations emitted",
            result.analysis.loops.len(),
            result.analysis.specializations.len()
        );
    }

    if let Some(path) = &cli.spec_cache {
        if let Err(e) = db.save(path) {
            eprintln!("slx: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }

    // ── Emission ──
    let payload = match cli.emit {
        EmitStage::Analysis => {
            let reports: Vec<_> = result.analysis.loops.iter().map(|l| l.report()).collect();
            match serde_json::to_string_pretty(&reports) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("slx: error: {}", e);
                    std::process::exit(2);
                }
            }
        }
        EmitStage::Source => result.analysis.edited_source.clone(),
        EmitStage::Diags => {
            let mut out = String::new();
            for d in &result.diagnostics {
                out.push_str(&d.to_string());
                out.push('\n');
            }
            out
        }
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, payload) {
                eprintln!("slx: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", payload),
    }

    if result.analysis.failed {
        std::process::exit(1);
    }
}
