// srcbuf.rs — Editable source buffer addressed by original offsets
//
// The output sink of the engine: supports text removal over a span,
// insertion before/after a location, and token-level find/replace over a
// span. Edits are addressed in *original* byte offsets (the coordinates
// syntax-tree spans carry), so edits never invalidate each other's
// positions. Internally a piece list: each piece covers an original range
// and either passes the original text through or substitutes replacement
// text.
//
// Token-level replacement uses a `logos` scanner so identifier substrings,
// string literals, and comments are never rewritten.
//
// Preconditions: spans lie inside the buffer's original range.
// Postconditions: `get()` reflects all edits applied so far.
// Failure modes: none (out-of-range spans are clamped).
// Side effects: none.

use logos::Logos;

use crate::ast::Span;

// ── Token scanner ────────────────────────────────────────────────────────

/// Host-language token classes relevant to identifier replacement.
/// Everything else (operators, numbers, punctuation) passes through
/// byte-for-byte via scanner error spans.
#[derive(Logos, Debug, Clone, PartialEq)]
enum Tok {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r#""([^"\\]|\\.)*""#)]
    StringLit,

    #[regex(r"//[^\n]*")]
    LineComment,

    #[regex(r"/\*([^*]|\*+[^*/])*\*+/")]
    BlockComment,

    #[regex(r"[ \t\r\n]+")]
    Whitespace,
}

/// Rewrite whole identifier tokens per the substitution list.
fn replace_idents(text: &str, subs: &[(String, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    for (tok, range) in Tok::lexer(text).spanned() {
        let slice = &text[range.clone()];
        match tok {
            Ok(Tok::Ident) => {
                match subs.iter().find(|(from, _)| from == slice) {
                    Some((_, to)) => out.push_str(to),
                    None => out.push_str(slice),
                }
            }
            _ => out.push_str(slice),
        }
    }
    out
}

// ── Piece list ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Piece {
    /// Original range covered, relative to the buffer start.
    start: usize,
    end: usize,
    /// `None`: original text passes through. `Some`: replacement text
    /// (empty string for a removal; zero-width range for an insertion).
    text: Option<String>,
}

/// Editable text buffer over one compilation unit or one function body.
#[derive(Debug, Clone)]
pub struct SourceBuffer {
    original: String,
    /// Original offset of the buffer's first byte (non-zero for a buffer
    /// cut out of a larger unit, so tree spans address it directly).
    base: usize,
    pieces: Vec<Piece>,
}

impl SourceBuffer {
    pub fn new(text: &str) -> Self {
        Self::from_slice(text, 0)
    }

    /// Buffer over a slice of a larger source, addressed by the slice's
    /// offsets in that source.
    pub fn from_slice(text: &str, base: usize) -> Self {
        SourceBuffer {
            original: text.to_string(),
            base,
            pieces: vec![Piece {
                start: 0,
                end: text.len(),
                text: None,
            }],
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// True when the absolute original offset lies inside this buffer.
    pub fn contains(&self, pos: usize) -> bool {
        pos >= self.base && pos <= self.base + self.original.len()
    }

    fn rel(&self, pos: usize) -> usize {
        pos.saturating_sub(self.base).min(self.original.len())
    }

    /// Ensure a piece boundary exists at the relative offset; return the
    /// index of the first piece starting there.
    ///
    /// An already-replaced piece cannot be split meaningfully: the head
    /// keeps the whole replacement and the tail is empty. Unchanged
    /// pieces split exactly.
    fn split_at(&mut self, rel: usize) -> usize {
        for i in 0..self.pieces.len() {
            let p = &self.pieces[i];
            if p.start < rel && rel < p.end {
                let tail = Piece {
                    start: rel,
                    end: p.end,
                    text: p.text.as_ref().map(|_| String::new()),
                };
                self.pieces[i].end = rel;
                self.pieces.insert(i + 1, tail);
                return i + 1;
            }
            if p.start >= rel {
                return i;
            }
        }
        self.pieces.len()
    }

    /// Remove the original text covered by `span`.
    pub fn remove(&mut self, span: Span) {
        let (s, e) = (self.rel(span.start), self.rel(span.end));
        if s >= e {
            return;
        }
        let lo = self.split_at(s);
        let hi = self.split_at(e);
        for p in &mut self.pieces[lo..hi] {
            if p.start < p.end || p.text.is_some() {
                p.text = Some(String::new());
            }
        }
    }

    /// Insert text at an original position, before anything already
    /// inserted there.
    pub fn insert_before(&mut self, pos: usize, text: &str) {
        let rel = self.rel(pos);
        let idx = self.split_at(rel);
        self.pieces.insert(
            idx,
            Piece {
                start: rel,
                end: rel,
                text: Some(text.to_string()),
            },
        );
    }

    /// Insert text at an original position, after anything already
    /// inserted there.
    pub fn insert_after(&mut self, pos: usize, text: &str) {
        let rel = self.rel(pos);
        let mut idx = self.split_at(rel);
        while idx < self.pieces.len()
            && self.pieces[idx].start == rel
            && self.pieces[idx].end == rel
        {
            idx += 1;
        }
        self.pieces.insert(
            idx,
            Piece {
                start: rel,
                end: rel,
                text: Some(text.to_string()),
            },
        );
    }

    /// Token-level identifier replacement over the original span.
    ///
    /// Replaced identifiers become their own token-sized pieces, so original
    /// offsets between them stay addressable by later edits.
    pub fn replace_tokens(&mut self, span: Span, subs: &[(String, String)]) {
        if subs.is_empty() {
            return;
        }
        let (s, e) = (self.rel(span.start), self.rel(span.end));
        let lo = self.split_at(s);
        let hi = self.split_at(e);

        let tail = self.pieces.split_off(hi);
        let mid = self.pieces.split_off(lo);
        for p in mid {
            match &p.text {
                Some(t) => {
                    // Already-replaced text: rewrite in place.
                    let replaced = replace_idents(t, subs);
                    self.pieces.push(Piece {
                        start: p.start,
                        end: p.end,
                        text: Some(replaced),
                    });
                }
                None => {
                    let slice = &self.original[p.start..p.end];
                    let mut cursor = p.start;
                    for (tok, range) in Tok::lexer(slice).spanned() {
                        if let Ok(Tok::Ident) = tok {
                            let ident = &slice[range.clone()];
                            if let Some((_, to)) =
                                subs.iter().find(|(from, _)| from == ident)
                            {
                                let abs_s = p.start + range.start;
                                let abs_e = p.start + range.end;
                                if cursor < abs_s {
                                    self.pieces.push(Piece {
                                        start: cursor,
                                        end: abs_s,
                                        text: None,
                                    });
                                }
                                self.pieces.push(Piece {
                                    start: abs_s,
                                    end: abs_e,
                                    text: Some(to.clone()),
                                });
                                cursor = abs_e;
                            }
                        }
                    }
                    if cursor < p.end {
                        self.pieces.push(Piece {
                            start: cursor,
                            end: p.end,
                            text: None,
                        });
                    }
                }
            }
        }
        self.pieces.extend(tail);
    }

    /// Current text of the whole buffer.
    pub fn get(&self) -> String {
        let mut out = String::with_capacity(self.original.len());
        for p in &self.pieces {
            match &p.text {
                Some(t) => out.push_str(t),
                None => out.push_str(&self.original[p.start..p.end]),
            }
        }
        out
    }

    /// Current text of an original span, with edits inside it applied.
    pub fn get_range(&mut self, span: Span) -> String {
        let (s, e) = (self.rel(span.start), self.rel(span.end));
        let lo = self.split_at(s);
        let hi = self.split_at(e);
        let mut out = String::new();
        for p in &self.pieces[lo..hi] {
            match &p.text {
                Some(t) => out.push_str(t),
                None => out.push_str(&self.original[p.start..p.end]),
            }
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
