//! The code-region pipeline: scans the document body for embedded script
//! regions, builds one concatenated program from them, runs it once, and
//! splices each region's exported output back over its source span.
//!
//! Inline regions are written `\py{...}`; block regions are fenced by
//! `\begin{python}` / `\end{python}`. Everything outside the region spans
//! is left byte-for-byte unchanged.

pub mod script;

use std::collections::HashSet;

use lazy_static::lazy_static;
use linked_hash_map::LinkedHashMap;
use nanoid::nanoid;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::args::find_matching;
use crate::common::{active_len, Span};
use crate::error::{Error, Result};
use self::script::ExecutionContext;

pub(crate) const INLINE_START: &str = "\\py{";
pub(crate) const BLOCK_BEGIN: &str = "\\begin{python}";
pub(crate) const BLOCK_END: &str = "\\end{python}";

const ID_ALPHABET: [char; 16] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', '0', 'a', 'b', 'c', 'd', 'e', 'f',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Inline,
    Block,
}

/// One embedded script region, extracted and ready to contribute to the
/// concatenated program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRegion {
    pub id: String,
    pub kind: RegionKind,
    /// Cleaned code text: comments and blank lines dropped, block
    /// indentation stripped.
    pub code: String,
    /// The code split on top-level `;`.
    pub statements: Vec<String>,
    /// Whether the trailing statement's value is exported implicitly.
    pub auto_export: bool,
    /// Marker-to-marker span in the document body.
    pub span: Span,
}

/// Runs the whole pipeline over a document body.
pub(crate) fn transform_body(body: &str, ctx: &mut ExecutionContext) -> Result<String> {
    let regions = scan_regions(body)?;
    if regions.is_empty() {
        return Ok(body.to_string());
    }
    let program = build_program(&regions);
    ctx.run(&program)?;
    let outputs = ctx.take_outputs();
    Ok(substitute(body, &regions, &outputs))
}

/// Scans the body line by line and extracts every code region in document
/// order. Full-line comments are skipped; a block begin marker sitting
/// behind an unescaped `%` is ignored.
pub(crate) fn scan_regions(body: &str) -> Result<Vec<CodeRegion>> {
    let lines = line_table(body);
    let mut regions = Vec::new();
    let mut ids = HashSet::new();
    let mut i = 0;
    while i < lines.len() {
        let (offset, line) = lines[i];
        if line.trim_start().starts_with('%') {
            i += 1;
            continue;
        }
        let active = &line[..active_len(line)];
        if let Some(marker) = active.find(BLOCK_BEGIN) {
            let (region, next) = extract_block(&lines, i, marker, &mut ids)?;
            regions.push(region);
            i = next;
            continue;
        }
        extract_inline(line, offset, &mut regions, &mut ids)?;
        i += 1;
    }
    Ok(regions)
}

/// Concatenates all regions into one program. Every region opens with a
/// registration call so exports land under its identifier; the trailing
/// statement is wrapped in `emit(...)` when the region auto-exports.
pub(crate) fn build_program(regions: &[CodeRegion]) -> String {
    let mut program = String::new();
    for region in regions {
        program.push_str(&format!("region_begin(\"{}\");\n", region.id));
        let last = region.statements.len().saturating_sub(1);
        for (i, statement) in region.statements.iter().enumerate() {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            if i == last && region.auto_export {
                program.push_str(&format!("emit({statement});\n"));
            } else {
                program.push_str(statement);
                program.push_str(";\n");
            }
        }
    }
    program
}

/// Replaces each region's span with its exported fragments, joined by a
/// blank line. A region with no output vanishes.
fn substitute(
    body: &str,
    regions: &[CodeRegion],
    outputs: &LinkedHashMap<String, Vec<String>>,
) -> String {
    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;
    for region in regions {
        out.push_str(&body[cursor..region.span.range.start]);
        if let Some(fragments) = outputs.get(&region.id) {
            out.push_str(&fragments.join("\n\n"));
        }
        cursor = region.span.range.end;
    }
    out.push_str(&body[cursor..]);
    out
}

fn line_table(body: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for part in body.split_inclusive('\n') {
        let line = part.strip_suffix('\n').unwrap_or(part);
        let line = line.strip_suffix('\r').unwrap_or(line);
        lines.push((offset, line));
        offset += part.len();
    }
    lines
}

fn fresh_id(ids: &mut HashSet<String>) -> String {
    loop {
        let id = nanoid!(10, &ID_ALPHABET);
        if ids.insert(id.clone()) {
            return id;
        }
    }
}

/// Extracts every `\py{...}` region on one line. The braces are matched
/// with the argument scanner, so nested and escaped braces behave as in
/// argument lists.
fn extract_inline(
    line: &str,
    offset: usize,
    regions: &mut Vec<CodeRegion>,
    ids: &mut HashSet<String>,
) -> Result<()> {
    let mut search = 0;
    while let Some(found) = line[search..].find(INLINE_START) {
        let start = search + found;
        let open = start + INLINE_START.len() - 1;
        let close = find_matching(line, open, offset)?;
        let code = line[open + 1..close].to_string();
        let statements = split_statements(&code);
        let auto_export = wants_auto_export(RegionKind::Inline, &statements);
        regions.push(CodeRegion {
            id: fresh_id(ids),
            kind: RegionKind::Inline,
            code,
            statements,
            auto_export,
            span: Span::new(offset + start, offset + close + 1),
        });
        search = close + 1;
    }
    Ok(())
}

/// Extracts a block region whose begin marker sits at column `marker` of
/// line `i`. Returns the region and the index of the first unconsumed
/// line.
fn extract_block(
    lines: &[(usize, &str)],
    i: usize,
    marker: usize,
    ids: &mut HashSet<String>,
) -> Result<(CodeRegion, usize)> {
    let (start_offset, start_line) = lines[i];
    let code_from = marker + BLOCK_BEGIN.len();
    let first_rest = &start_line[code_from..];

    let mut raw_lines: Vec<&str> = Vec::new();
    let mut end = None;
    if let Some(found) = first_rest.find(BLOCK_END) {
        raw_lines.push(&first_rest[..found]);
        end = Some((i, code_from + found));
    } else {
        if let Some(nested) = first_rest.find(BLOCK_BEGIN) {
            return Err(Error::syntax(
                start_offset + code_from + nested,
                "code regions may not be nested",
            ));
        }
        raw_lines.push(first_rest);
        for (j, &(offset, line)) in lines.iter().enumerate().skip(i + 1) {
            if let Some(found) = line.find(BLOCK_END) {
                if let Some(nested) = line[..found].find(BLOCK_BEGIN) {
                    return Err(Error::syntax(offset + nested, "code regions may not be nested"));
                }
                raw_lines.push(&line[..found]);
                end = Some((j, found));
                break;
            }
            if let Some(nested) = line.find(BLOCK_BEGIN) {
                return Err(Error::syntax(offset + nested, "code regions may not be nested"));
            }
            raw_lines.push(line);
        }
    }
    let Some((j, end_col)) = end else {
        return Err(Error::syntax(
            start_offset + marker,
            "unterminated code block",
        ));
    };

    let code = clean_block(&raw_lines);
    let statements = split_statements(&code);
    let auto_export = wants_auto_export(RegionKind::Block, &statements);
    let region = CodeRegion {
        id: fresh_id(ids),
        kind: RegionKind::Block,
        code,
        statements,
        auto_export,
        span: Span::new(start_offset + marker, lines[j].0 + end_col + BLOCK_END.len()),
    };
    Ok((region, j + 1))
}

/// Drops blank and comment-only lines, then strips the first remaining
/// line's indentation from every line.
fn clean_block(raw_lines: &[&str]) -> String {
    let kept: Vec<&str> = raw_lines
        .iter()
        .copied()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with("//")
        })
        .collect();
    let indent = kept
        .first()
        .map(|line| line.len() - line.trim_start().len())
        .unwrap_or(0);
    kept.iter()
        .map(|line| strip_indent(line, indent))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes up to `width` leading whitespace characters.
fn strip_indent(line: &str, width: usize) -> &str {
    let mut rest = line;
    let mut remaining = width;
    while remaining > 0 {
        match rest.chars().next() {
            Some(c) if c == ' ' || c == '\t' => {
                rest = &rest[c.len_utf8()..];
                remaining -= 1;
            }
            _ => break,
        }
    }
    rest
}

/// Splits code on top-level `;`, tracking bracket depth and string
/// literals. Line and block comments are stripped along the way, so a
/// trailing comment can never swallow an appended `;`. The final (possibly
/// empty) segment is kept: an empty tail means the region ended with `;`.
fn split_statements(code: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                current.push(c);
                while let Some(n) = chars.next() {
                    current.push(n);
                    if n == '\\' {
                        if let Some(escaped) = chars.next() {
                            current.push(escaped);
                        }
                        continue;
                    }
                    if n == c {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut star = false;
                for n in chars.by_ref() {
                    if star && n == '/' {
                        break;
                    }
                    star = n == '*';
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ';' if depth == 0 => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    statements.push(current);
    statements
}

lazy_static! {
    // An identifier (optionally declared, optionally followed by index or
    // field accesses) followed by an assignment operator. `=[^=]` keeps
    // `==` comparisons out.
    static ref ASSIGNMENT: Regex = Regex::new(
        r"^\s*(?:(?:let|const)\s+)?[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*|\[[^\]]*\])*\s*(?:[+\-*/%]=|=[^=])"
    )
    .unwrap();
}

/// Leading keywords that mark a statement as having no useful value.
const STMT_KEYWORDS: &[&str] = &[
    "fn", "for", "while", "loop", "do", "return", "break", "continue", "throw", "import", "let",
    "const",
];

fn is_assignment(statement: &str) -> bool {
    ASSIGNMENT.is_match(statement)
}

fn is_control_call(statement: &str) -> bool {
    let trimmed = statement.trim_start();
    for name in ["emit", "suppress_output"] {
        if let Some(rest) = trimmed.strip_prefix(name) {
            if rest.trim_start().starts_with('(') {
                return true;
            }
        }
    }
    false
}

fn starts_statement_block(statement: &str) -> bool {
    let trimmed = statement.trim_start();
    if trimmed.starts_with('}') {
        return true;
    }
    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    STMT_KEYWORDS.contains(&word.as_str())
}

/// Decides whether a region's trailing statement is exported implicitly.
///
/// Never when the region ends in `;`, when the trailing statement is an
/// assignment, declaration, or control-flow construct, or when it already
/// calls one of the control functions. A block region additionally opts
/// out as soon as any of its statements calls a control function.
fn wants_auto_export(kind: RegionKind, statements: &[String]) -> bool {
    let Some(last) = statements.last() else {
        return false;
    };
    let last = last.trim();
    if last.is_empty() {
        return false;
    }
    if kind == RegionKind::Block && statements.iter().any(|s| is_control_call(s)) {
        return false;
    }
    !(is_assignment(last) || starts_statement_block(last) || is_control_call(last))
}
