//! Regex engine abstraction layer.
//!
//! Provides a unified interface over:
//! - `regex` crate (fast, O(m*n) guaranteed)
//! - `fancy-regex` (backreferences, lookaround, potentially exponential)
//!
//! Patterns without backreferences or lookaround go to `regex`.

use std::fmt::Debug;
use std::sync::Arc;

/// Span of every group of one match; index 0 is the whole match.
pub type Spans = Vec<Option<(usize, usize)>>;

// =============================================================================
// Options
// =============================================================================

/// `Regexp::IGNORECASE`.
pub const IGNORECASE: u32 = 1;
/// `Regexp::EXTENDED`: whitespace and comments in the pattern are ignored.
pub const EXTENDED: u32 = 2;
/// `Regexp::MULTILINE`: `.` matches newline.
pub const MULTILINE: u32 = 4;
/// Reported by every regexp: no encoding was given.
pub const NO_ENCODING: u32 = 16;

const FLAG_MASK: u32 = IGNORECASE | EXTENDED | MULTILINE;

/// Keep only the flags an engine understands.
#[inline]
pub fn engine_flags(options: u32) -> u32 {
    options & FLAG_MASK
}

/// Inline modifiers for `options`. `^` and `$` always match at line
/// boundaries.
fn apply_flags_to_pattern(pattern: &str, options: u32) -> String {
    let mut modifiers = String::from("m");
    if options & IGNORECASE != 0 {
        modifiers.push('i');
    }
    if options & MULTILINE != 0 {
        modifiers.push('s');
    }
    if options & EXTENDED != 0 {
        modifiers.push('x');
    }
    format!("(?{modifiers}){pattern}")
}

// =============================================================================
// Engine Trait
// =============================================================================

/// Which regex engine is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Standard,
    Fancy,
}

/// Unified regex engine interface.
pub trait Engine: Send + Sync + Debug {
    fn kind(&self) -> EngineKind;

    /// Leftmost match starting at or after byte `pos`, with the whole of
    /// `text` visible to anchors and lookaround.
    fn captures_at(&self, text: &str, pos: usize) -> Option<Spans>;

    /// Named groups and their indices, in group order.
    fn group_names(&self) -> Vec<(String, usize)>;

    /// Source pattern without the inline modifiers.
    fn pattern(&self) -> &str;
}

// =============================================================================
// Standard Engine (regex crate)
// =============================================================================

#[derive(Debug, Clone)]
pub struct StandardEngine {
    regex: regex::Regex,
    pattern: Arc<str>,
}

impl StandardEngine {
    pub fn compile(pattern: &str, options: u32) -> Result<Self, String> {
        let regex = regex::Regex::new(&apply_flags_to_pattern(pattern, options))
            .map_err(|e| error_summary(&e.to_string()))?;
        Ok(Self {
            regex,
            pattern: Arc::from(pattern),
        })
    }
}

impl Engine for StandardEngine {
    #[inline]
    fn kind(&self) -> EngineKind {
        EngineKind::Standard
    }

    fn captures_at(&self, text: &str, pos: usize) -> Option<Spans> {
        let caps = self.regex.captures_at(text, pos)?;
        Some(caps.iter().map(|m| m.map(|m| (m.start(), m.end()))).collect())
    }

    fn group_names(&self) -> Vec<(String, usize)> {
        self.regex
            .capture_names()
            .enumerate()
            .filter_map(|(i, name)| name.map(|n| (n.to_string(), i)))
            .collect()
    }

    #[inline]
    fn pattern(&self) -> &str {
        &self.pattern
    }
}

// =============================================================================
// Fancy Engine (fancy-regex crate)
// =============================================================================

#[derive(Debug, Clone)]
pub struct FancyEngine {
    regex: fancy_regex::Regex,
    pattern: Arc<str>,
}

impl FancyEngine {
    pub fn compile(pattern: &str, options: u32) -> Result<Self, String> {
        let regex = fancy_regex::Regex::new(&apply_flags_to_pattern(pattern, options))
            .map_err(|e| error_summary(&e.to_string()))?;
        Ok(Self {
            regex,
            pattern: Arc::from(pattern),
        })
    }
}

impl Engine for FancyEngine {
    #[inline]
    fn kind(&self) -> EngineKind {
        EngineKind::Fancy
    }

    fn captures_at(&self, text: &str, pos: usize) -> Option<Spans> {
        // Backtrack-limit errors count as no match.
        let caps = self.regex.captures_from_pos(text, pos).ok().flatten()?;
        Some(caps.iter().map(|m| m.map(|m| (m.start(), m.end()))).collect())
    }

    fn group_names(&self) -> Vec<(String, usize)> {
        named_groups(&self.pattern)
    }

    #[inline]
    fn pattern(&self) -> &str {
        &self.pattern
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Check if pattern requires fancy-regex features.
pub fn requires_fancy_engine(pattern: &str) -> bool {
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                // Backreference
                Some(d) if d.is_ascii_digit() && d != '0' => return true,
                Some('k') if chars.peek() == Some(&'<') => return true,
                _ => continue,
            }
        }
        if c == '(' && chars.peek() == Some(&'?') {
            chars.next();
            match chars.peek() {
                Some('=') | Some('!') => return true,
                Some('<') => {
                    chars.next();
                    if matches!(chars.peek(), Some('=') | Some('!')) {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }
    false
}

/// Last line of a parser error, without the `error: ` prefix.
fn error_summary(message: &str) -> String {
    let line = message
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(message);
    line.strip_prefix("error: ").unwrap_or(line).to_string()
}

/// Named groups found by scanning the pattern text.
fn named_groups(pattern: &str) -> Vec<(String, usize)> {
    let bytes = pattern.as_bytes();
    let mut names = Vec::new();
    let mut group = 0;
    let mut in_class = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'(' if !in_class => {
                let rest = &pattern[i + 1..];
                let name_start = if rest.starts_with("?P<") {
                    Some(3)
                } else if rest.starts_with("?<") && !rest[2..].starts_with(['=', '!']) {
                    Some(2)
                } else {
                    None
                };
                if let Some(start) = name_start {
                    group += 1;
                    if let Some(len) = rest[start..].find('>') {
                        names.push((rest[start..start + len].to_string(), group));
                    }
                } else if !rest.starts_with('?') {
                    group += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    names
}

/// Compile a pattern, automatically selecting the appropriate engine.
pub fn compile_pattern(pattern: &str, options: u32) -> Result<Box<dyn Engine>, String> {
    let options = engine_flags(options);
    if requires_fancy_engine(pattern) {
        Ok(Box::new(FancyEngine::compile(pattern, options)?))
    } else {
        Ok(Box::new(StandardEngine::compile(pattern, options)?))
    }
}

// =============================================================================
// Searching
// =============================================================================

/// First match whose start lies in `start..=end`.
///
/// Forward tries start positions ascending, backward descending; either
/// way the match may extend past `end`.
pub fn search_region(
    engine: &dyn Engine,
    text: &str,
    start: usize,
    end: usize,
    forward: bool,
) -> Option<Spans> {
    let end = end.min(text.len());
    if start > end {
        return None;
    }
    if forward {
        let spans = engine.captures_at(text, start)?;
        match spans.first().copied().flatten() {
            Some((s, _)) if s <= end => Some(spans),
            _ => None,
        }
    } else {
        (start..=end)
            .rev()
            .filter(|&pos| text.is_char_boundary(pos))
            .find_map(|pos| match_at(engine, text, pos))
    }
}

/// Match anchored at `pos`.
pub fn match_at(engine: &dyn Engine, text: &str, pos: usize) -> Option<Spans> {
    if pos > text.len() || !text.is_char_boundary(pos) {
        return None;
    }
    // Leftmost-first: if any match starts at `pos`, the search from `pos`
    // returns it.
    let spans = engine.captures_at(text, pos)?;
    match spans.first().copied().flatten() {
        Some((s, _)) if s == pos => Some(spans),
        _ => None,
    }
}
