// specialize.rs — Generic function/method specialization
//
// For a generic function whose body contains a site loop, produces a fully
// concrete copy of its source: builds the ordered parameter→argument
// substitution (the function's own generics first, then every enclosing
// generic scope nearest-first), applies it token-wise to a private edit
// buffer, rewrites the declaration head (qualified name, argument list,
// return type, `inline`, one `template <>` marker per substitution level),
// re-enters the whole analysis over the body, and inserts the result after
// the outermost enclosing declaration.
//
// A cross-unit cache keyed by the SHA-256 of the canonical declaration
// prevents duplicate emission: a non-inline specialization already defined
// by an earlier unit is re-emitted as a declaration only.
//
// Preconditions: `fid` is a Specialization (or a method of a specialized
//                class) whose body contains a site loop.
// Postconditions: a SpecRecord is appended and the unit buffer edited,
//                 unless the instantiation is already in flight.
// Failure modes: malformed generic bindings and unlocatable name tokens
//                are Fatal; insertion-point ordering problems are warnings.
// Side effects: unit edit buffer, specialization cache.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ast::{FuncId, GenericArg, Span};
use crate::canon::collapse_ws;
use crate::diag::{codes, Diagnostic, Fatal, FatalResult};
use crate::driver::Driver;
use crate::srcbuf::SourceBuffer;

// ── Cache interface ──────────────────────────────────────────────────────

/// Cross-unit specialization store: canonical signature key → defining
/// unit. Append-only; consulted before any emission.
pub trait SpecializationDb {
    fn lookup(&self, key: &str) -> Option<&str>;
    fn insert(&mut self, key: &str, unit: &str);
}

/// In-memory store, optionally persisted as JSON between tool invocations.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemorySpecDb {
    entries: HashMap<String, String>,
}

impl MemorySpecDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SpecializationDb for MemorySpecDb {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn insert(&mut self, key: &str, unit: &str) {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| unit.to_string());
    }
}

// ── Emission record ──────────────────────────────────────────────────────

/// One emitted specialization (full body or declaration-only).
#[derive(Debug, Clone)]
pub struct SpecRecord {
    pub function: FuncId,
    /// 16-hex key derived from the canonical declaration.
    pub key: String,
    pub canonical_decl: String,
    pub text: String,
    pub declaration_only: bool,
    /// Unit that holds the full body for a declaration-only emission.
    pub defined_in: Option<String>,
    pub inserted_at: usize,
}

/// 16-hex stable key of a canonical declaration.
pub fn signature_key(canonical_decl: &str) -> String {
    let digest = Sha256::digest(canonical_decl.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Specialization ───────────────────────────────────────────────────────

/// Emit the concrete specialization of `fid` and re-run the analysis over
/// its body.
pub fn specialize_function(d: &mut Driver, fid: FuncId) -> FatalResult<()> {
    if d.specialized.contains(&fid) {
        return Ok(());
    }
    let f = d.unit.func(fid);
    let body = match f.body {
        Some(b) => b,
        None => return Ok(()),
    };

    // Substitution levels: the function's own generics, then every
    // enclosing generic scope walking outward.
    let mut levels: Vec<Vec<GenericArg>> = Vec::new();
    if !f.generics.is_empty() {
        levels.push(f.generics.clone());
    }
    let mut parent = f.parent;
    while let Some(cid) = parent {
        let class = d.unit.class(cid);
        if !class.generics.is_empty() {
            levels.push(class.generics.clone());
        }
        parent = class.parent;
    }
    for level in &levels {
        for g in level {
            if g.param.is_empty() || g.arg.is_empty() {
                return Err(Fatal::new(
                    codes::F0003,
                    f.span,
                    format!(
                        "malformed generic parameter/argument binding for '{}'",
                        f.qualified_name
                    ),
                ));
            }
        }
    }
    let subs: Vec<(String, String)> = levels
        .iter()
        .flatten()
        .map(|g| (g.param.clone(), g.arg.clone()))
        .collect();

    let template_args = if f.generics.is_empty() {
        String::new()
    } else {
        let args: Vec<&str> = f.generics.iter().map(|g| g.arg.as_str()).collect();
        format!("<{}>", args.join(", "))
    };

    // Private per-function buffer; substitution happens before any other
    // surgery.
    let mut buf = SourceBuffer::from_slice(d.unit.text(f.span), f.span.start);
    buf.replace_tokens(f.span, &subs);

    // Remove everything up to and including the name token, then rebuild
    // the head: qualified name + args, return type, inline, template
    // markers.
    match f.name_span {
        Some(ns) if buf.contains(ns.start) => {
            buf.remove(Span::new(f.span.start, ns.start));
            buf.remove(ns);
        }
        _ => {
            let text = d.unit.text(f.span);
            let paren = text.find('(');
            let name_end = paren
                .and_then(|l| find_word(text, &f.name).filter(|&j| j < l))
                .map(|j| j + f.name.len());
            match name_end {
                Some(end) => buf.remove(Span::new(f.span.start, f.span.start + end)),
                None => {
                    return Err(Fatal::new(
                        codes::F0002,
                        f.span,
                        format!("could not locate the name token of '{}'", f.name),
                    ))
                }
            }
        }
    }

    buf.insert_before(
        f.span.start,
        &format!("{}{}", f.qualified_name, template_args),
    );
    buf.insert_before(f.span.start, &format!("{} ", f.return_type));
    let no_inline = d.options.no_inline_specializations;
    if !f.is_inline && !no_inline {
        buf.insert_before(f.span.start, "inline ");
    }
    for _ in 0..levels.len() {
        buf.insert_before(f.span.start, "template <>\n");
    }

    let decl_span = Span::new(f.span.start, f.decl_end);
    let canonical_decl = collapse_ws(&buf.get_range(decl_span));
    let key = signature_key(&canonical_decl);

    // Mutually recursive instantiations terminate here.
    if d.in_progress.contains(&key) {
        return Ok(());
    }

    let insert_at = insertion_point(d, fid);
    check_argument_declarations(d, fid, &levels, insert_at);

    // An emission marked inline must be present in every unit, so the
    // cache only short-circuits when specializations are emitted
    // non-inline.
    let effectively_inline = f.is_inline || !no_inline;
    if !effectively_inline {
        if let Some(unit) = d.db.lookup(&key).map(str::to_string) {
            let text = format!(
                "\n// ++++++++ specialization declared here, defined in unit {}\n{};\n// ++++++++\n",
                unit, canonical_decl
            );
            d.buffers[0].insert_after(insert_at, &text);
            d.specs.push(SpecRecord {
                function: fid,
                key,
                canonical_decl,
                text,
                declaration_only: true,
                defined_in: Some(unit),
                inserted_at: insert_at,
            });
            d.specialized.insert(fid);
            return Ok(());
        }
    }

    // Swap the private buffer in as the active write target and re-enter
    // the full pipeline over the body.
    d.specialized.insert(fid);
    d.in_progress.insert(key.clone());
    d.buffers.push(buf);
    let walk = d.walk_fn_stmt(body);
    let buf = d.buffers.pop().expect("specialization buffer present");
    d.in_progress.remove(&key);
    walk?;

    let text = format!(
        "\n\n// ++++++++ generated specialization {}\n{}\n// ++++++++\n",
        key,
        buf.get()
    );
    d.buffers[0].insert_after(insert_at, &text);
    if !effectively_inline {
        d.db.insert(&key, &d.unit.name);
    }
    d.specs.push(SpecRecord {
        function: fid,
        key,
        canonical_decl,
        text,
        declaration_only: false,
        defined_in: None,
        inserted_at: insert_at,
    });
    Ok(())
}

/// Insertion point: after the end of the outermost enclosing declaration.
fn insertion_point(d: &Driver, fid: FuncId) -> usize {
    let f = d.unit.func(fid);
    let mut outermost = None;
    let mut parent = f.parent;
    while let Some(cid) = parent {
        outermost = Some(cid);
        parent = d.unit.class(cid).parent;
    }
    match outermost {
        Some(cid) => d.unit.class(cid).end,
        None => f.span.end,
    }
}

/// Every generic type argument must be declared before the insertion
/// point; otherwise the emitted code may not build.
fn check_argument_declarations(
    d: &mut Driver,
    fid: FuncId,
    levels: &[Vec<GenericArg>],
    insert_at: usize,
) {
    let f = d.unit.func(fid);
    for g in levels.iter().flatten() {
        if let Some(ds) = g.decl_span {
            if ds.start >= insert_at {
                d.diagnostics.push(
                    Diagnostic::warning(
                        f.span,
                        format!(
                            "specialization insertion point for '{}' precedes the \
                             declaration of type '{}'; the output may not build",
                            f.qualified_name, g.arg
                        ),
                    )
                    .with_code(codes::W0302),
                );
            }
        }
    }
}

/// Byte offset of a whole-word occurrence.
fn find_word(text: &str, word: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(rel) = text[from..].find(word) {
        let i = from + rel;
        let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
        let after = i + word.len();
        let after_ok = after >= bytes.len() || !is_word_byte(bytes[after]);
        if before_ok && after_ok {
            return Some(i);
        }
        from = i + 1;
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_key_is_stable_16_hex() {
        let k = signature_key("template <> double norm<double>(Field<double>& v)");
        assert_eq!(k.len(), 16);
        assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(k, signature_key("template <> double norm<double>(Field<double>& v)"));
    }

    #[test]
    fn find_word_requires_boundaries() {
        assert_eq!(find_word("norm2 norm(", "norm"), Some(6));
        assert_eq!(find_word("normal", "norm"), None);
        assert_eq!(find_word("a_norm", "norm"), None);
    }

    #[test]
    fn memory_db_is_append_only() {
        let mut db = MemorySpecDb::new();
        db.insert("k", "unit_a");
        db.insert("k", "unit_b");
        assert_eq!(db.lookup("k"), Some("unit_a"));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn memory_db_roundtrips_through_json() {
        let mut db = MemorySpecDb::new();
        db.insert("abc123", "kernels");
        let path = std::env::temp_dir().join("slx_spec_db_test.json");
        db.save(&path).unwrap();
        let loaded = MemorySpecDb::load(&path).unwrap();
        assert_eq!(loaded.lookup("abc123"), Some("kernels"));
        let _ = std::fs::remove_file(&path);
    }
}
