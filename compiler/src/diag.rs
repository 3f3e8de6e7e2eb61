// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all analysis phases.
//
// Severity contract: `Fatal` aborts the whole run (propagated as the `Err`
// arm of `Result`); `Error` marks the run failed but analysis of the
// current loop continues; `Warning` never fails the run; `Remark` is
// supplementary context pushed immediately after the error it annotates and
// never stands alone.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0107`, `W0302`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable codes for every reportable condition.
pub mod codes {
    use super::DiagCode;

    // Field access (collector + resolver)
    /// Explicit parity index after the first field reference of the loop.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Assignment through a neighbor index (`f[X+d] = …`).
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Neighbor-indexed field passed as a mutable reference argument.
    pub const E0103: DiagCode = DiagCode("E0103");
    /// Field expression without a site index inside a site loop.
    pub const E0104: DiagCode = DiagCode("E0104");
    /// Field-name expression depends on a loop-local variable.
    pub const E0105: DiagCode = DiagCode("E0105");
    /// Field-name expression does not resolve to a field template type.
    pub const E0106: DiagCode = DiagCode("E0106");
    /// Write under ALL parity combined with a neighbor read of the same field.
    pub const E0107: DiagCode = DiagCode("E0107");
    /// Parity-indexed field expression outside a loop assignment.
    pub const E0110: DiagCode = DiagCode("E0110");
    /// Site-indexed field expression outside any site loop.
    pub const E0111: DiagCode = DiagCode("E0111");

    // Variables (tracker + check pass)
    /// Reduction variable assigned more than once in one loop.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Assignment to a variable declared outside the loop (not a reduction).
    pub const E0202: DiagCode = DiagCode("E0202");
    /// External container indexed by a loop-local index (not a histogram).
    pub const E0203: DiagCode = DiagCode("E0203");
    /// Static or external-storage declaration inside a site loop.
    pub const E0204: DiagCode = DiagCode("E0204");
    /// Field variable declared inside a site loop.
    pub const E0205: DiagCode = DiagCode("E0205");
    /// Address taken of a per-site field access.
    pub const E0206: DiagCode = DiagCode("E0206");

    // Warnings
    /// Declaration shadows the site-index symbol.
    pub const W0301: DiagCode = DiagCode("W0301");
    /// Specialization insertion point may precede a required declaration.
    pub const W0302: DiagCode = DiagCode("W0302");

    // Fatal (internal invariants)
    /// Site-indexed access whose index chain cannot be decomposed.
    pub const F0001: DiagCode = DiagCode("F0001");
    /// Function name token not found during specialization surgery.
    pub const F0002: DiagCode = DiagCode("F0002");
    /// Generic parameter/argument lists do not match.
    pub const F0003: DiagCode = DiagCode("F0003");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Fatal,
    Error,
    Warning,
    Remark,
}

impl DiagLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagLevel::Fatal => "fatal",
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
            DiagLevel::Remark => "remark",
        }
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any analysis phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code or hint.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message)
    }

    pub fn warning(span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message)
    }

    /// A remark must follow the error it annotates in the diagnostics list.
    pub fn remark(span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Remark, span, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(
                f,
                "{}[{}]: {} ({})",
                self.level.as_str(),
                code,
                self.message,
                self.span
            )?;
        } else {
            write!(f, "{}: {} ({})", self.level.as_str(), self.message, self.span)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True when any recorded diagnostic fails the run.
pub fn any_errors(diags: &[Diagnostic]) -> bool {
    diags
        .iter()
        .any(|d| matches!(d.level, DiagLevel::Error | DiagLevel::Fatal))
}

// ── Fatal abort ──────────────────────────────────────────────────────────

/// An internal-invariant violation that aborts the entire run. Propagated
/// with `?` through every analysis call; converted to a `Diagnostic` at the
/// run boundary.
#[derive(Debug, Clone)]
pub struct Fatal {
    pub code: DiagCode,
    pub span: Span,
    pub message: String,
}

impl Fatal {
    pub fn new(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Fatal {
            code,
            span,
            message: message.into(),
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        Diagnostic::new(DiagLevel::Fatal, self.span, self.message).with_code(self.code)
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal[{}]: {} ({})", self.code, self.message, self.span)
    }
}

impl std::error::Error for Fatal {}

pub type FatalResult<T> = Result<T, Fatal>;

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        Span::new(0, 1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::error(dummy_span(), "something failed");
        assert_eq!(format!("{d}"), "error: something failed (0..1)");
    }

    #[test]
    fn display_with_code_and_hint() {
        let d = Diagnostic::warning(dummy_span(), "shadows the site index")
            .with_code(codes::W0301)
            .with_hint("rename the variable");
        assert_eq!(
            format!("{d}"),
            "warning[W0301]: shadows the site index (0..1)\n  hint: rename the variable"
        );
    }

    #[test]
    fn any_errors_ignores_warnings_and_remarks() {
        let diags = vec![
            Diagnostic::warning(dummy_span(), "w"),
            Diagnostic::remark(dummy_span(), "r"),
        ];
        assert!(!any_errors(&diags));

        let mut with_err = diags.clone();
        with_err.push(Diagnostic::error(dummy_span(), "e"));
        assert!(any_errors(&with_err));
    }

    #[test]
    fn fatal_converts_to_diagnostic() {
        let f = Fatal::new(codes::F0001, dummy_span(), "bad index");
        let d = f.into_diagnostic();
        assert_eq!(d.level, DiagLevel::Fatal);
        assert_eq!(d.code, Some(codes::F0001));
    }
}
