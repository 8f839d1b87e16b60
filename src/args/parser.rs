//! Single-pass scanner for delimited key-value argument lists.
//!
//! The scanner works on the text *inside* a delimiter group. It tracks a
//! nesting depth per delimiter kind, so commas and `=` only split at depth
//! zero, and a backslash in front of a structural character removes its
//! meaning.

use crate::args::{ArgValue, KeyVal, KeyValList, STRUCTURAL};
use crate::error::{Error, Result};

/// Returns the byte index of the delimiter matching the one at `open`.
///
/// `base` is added to offsets in error reports so they point into the
/// surrounding document rather than the slice being scanned.
pub(crate) fn find_matching(input: &str, open: usize, base: usize) -> Result<usize> {
    let opener = input[open..]
        .chars()
        .next()
        .ok_or_else(|| Error::syntax(base + open, "expected an opening delimiter"))?;
    let closer = match opener {
        '{' => '}',
        '[' => ']',
        _ => {
            return Err(Error::syntax(
                base + open,
                format!("`{opener}` is not a delimiter"),
            ))
        }
    };

    let mut braces = 0usize;
    let mut brackets = 0usize;
    let mut chars = input[open..].char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some(&(_, next)) = chars.peek() {
                    if STRUCTURAL.contains(&next) {
                        chars.next();
                    }
                }
                continue;
            }
            '{' => braces += 1,
            '}' => braces = braces.saturating_sub(1),
            '[' => brackets += 1,
            ']' => brackets = brackets.saturating_sub(1),
            _ => {}
        }
        if c == closer && braces == 0 && brackets == 0 && i > 0 {
            return Ok(open + i);
        }
    }
    Err(Error::syntax(
        base + open,
        format!("unterminated `{opener}`"),
    ))
}

/// Byte positions of every unescaped `target` at delimiter depth zero.
fn top_level_positions(input: &str, target: char) -> Vec<usize> {
    let mut out = Vec::new();
    let mut braces = 0usize;
    let mut brackets = 0usize;
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some(&(_, next)) = chars.peek() {
                    if STRUCTURAL.contains(&next) {
                        chars.next();
                    }
                }
            }
            '{' => braces += 1,
            '}' => braces = braces.saturating_sub(1),
            '[' => brackets += 1,
            ']' => brackets = brackets.saturating_sub(1),
            _ if c == target && braces == 0 && brackets == 0 => out.push(i),
            _ => {}
        }
    }
    out
}

/// Splits at top-level occurrences of `sep`, keeping each segment's offset.
fn split_top_level(input: &str, sep: char) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    for p in top_level_positions(input, sep) {
        out.push((start, &input[start..p]));
        start = p + sep.len_utf8();
    }
    out.push((start, &input[start..]));
    out
}

/// Removes the backslash in front of structural characters.
pub(crate) fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if STRUCTURAL.contains(&next) {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Parses the inside of a delimiter group into a key-value list.
///
/// A duplicate key keeps its first position but takes the last-seen value.
pub(crate) fn parse_list(input: &str, base: usize) -> Result<KeyValList> {
    let mut list = KeyValList::default();
    for (item_off, item) in split_top_level(input, ',') {
        if item.trim().is_empty() {
            continue;
        }
        let eqs = top_level_positions(item, '=');
        match eqs.len() {
            0 => list.push(KeyVal::flag(unescape(item.trim()))),
            1 => {
                let (key_raw, value_raw) = item.split_at(eqs[0]);
                let value_raw = &value_raw[1..];
                let key = unescape(key_raw.trim());
                let value = parse_value(value_raw, base + item_off + eqs[0] + 1)?;
                list.push(KeyVal::new(key, value));
            }
            _ => {
                return Err(Error::syntax(
                    base + item_off + eqs[1],
                    "more than one top-level `=` in a list item",
                ))
            }
        }
    }
    Ok(list)
}

/// Parses the value side of a `key = value` item. A value that consists of
/// a single delimiter group spanning the whole item becomes a nested list;
/// anything else is a scalar of the trimmed raw text.
fn parse_value(raw: &str, base: usize) -> Result<Option<ArgValue>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let lead = raw.len() - raw.trim_start().len();
    if trimmed.starts_with(['{', '[']) {
        let close = find_matching(trimmed, 0, base + lead)?;
        if close == trimmed.len() - 1 {
            let inner = &trimmed[1..close];
            return Ok(Some(ArgValue::List(parse_list(inner, base + lead + 1)?)));
        }
    }
    Ok(Some(ArgValue::Scalar(unescape(trimmed))))
}
