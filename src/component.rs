//! Structured model of LaTeX markup: macros, environments, and plain text.
//!
//! Components render to markup deterministically and parse back, so a
//! rendered tree survives a parse/render round trip unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::args::{find_matching, parse_list, ArgValue};
use crate::error::{Error, Result};

/// How an argument is delimited when rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    /// `{...}`
    Required,
    /// `[...]`
    Optional,
}

/// One argument group of a macro or environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub kind: ArgKind,
    pub value: ArgValue,
}

impl Argument {
    pub fn required(value: ArgValue) -> Self {
        Argument {
            kind: ArgKind::Required,
            value,
        }
    }

    pub fn optional(value: ArgValue) -> Self {
        Argument {
            kind: ArgKind::Optional,
            value,
        }
    }

    pub fn render(&self) -> String {
        match self.kind {
            ArgKind::Required => format!("{{{}}}", self.value.render()),
            ArgKind::Optional => format!("[{}]", self.value.render()),
        }
    }
}

/// A macro invocation, `\name` followed by its argument groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroCall {
    pub name: String,
    pub arguments: Vec<Argument>,
}

impl MacroCall {
    pub fn new(name: impl Into<String>) -> Self {
        MacroCall {
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    pub fn add_argument(&mut self, argument: Argument) {
        self.arguments.push(argument);
    }

    /// Replaces the argument at `index`. Panics if out of bounds, like
    /// slice indexing.
    pub fn set_argument(&mut self, index: usize, argument: Argument) {
        self.arguments[index] = argument;
    }

    pub fn insert_argument(&mut self, index: usize, argument: Argument) {
        self.arguments.insert(index, argument);
    }

    pub fn remove_argument(&mut self, index: usize) -> Argument {
        self.arguments.remove(index)
    }

    pub fn render(&self) -> String {
        let args: String = self.arguments.iter().map(Argument::render).collect();
        format!("\\{}{}", self.name, args)
    }

    /// Parses a single macro invocation whose backslash sits at `pos`.
    /// Returns the call and the offset just past its last argument.
    /// Unlike full markup parsing this accepts `_` in names, for
    /// preprocessor control macros.
    pub(crate) fn parse_at(input: &str, pos: usize, base: usize) -> Result<(MacroCall, usize)> {
        if !input[pos..].starts_with('\\') {
            return Err(Error::syntax(base + pos, "expected `\\`"));
        }
        let rest = &input[pos + 1..];
        let name_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
            .map(char::len_utf8)
            .sum::<usize>();
        if name_len == 0 {
            return Err(Error::syntax(base + pos, "expected a macro name"));
        }
        let name = &rest[..name_len];
        let (arguments, end) = parse_arguments(input, pos + 1 + name_len, base)?;
        Ok((
            MacroCall {
                name: name.to_string(),
                arguments,
            },
            end,
        ))
    }
}

impl fmt::Display for MacroCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A `\begin{name}...\end{name}` environment, or with `bare` set, an
/// anonymous group that renders as its content alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub arguments: Vec<Argument>,
    pub content: Vec<Component>,
    pub bare: bool,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Environment {
            name: name.into(),
            arguments: Vec::new(),
            content: Vec::new(),
            bare: false,
        }
    }

    /// An anonymous container holding components in sequence.
    pub fn group(content: Vec<Component>) -> Self {
        Environment {
            name: String::new(),
            arguments: Vec::new(),
            content,
            bare: true,
        }
    }

    pub fn add_argument(&mut self, argument: Argument) {
        self.arguments.push(argument);
    }

    pub fn set_argument(&mut self, index: usize, argument: Argument) {
        self.arguments[index] = argument;
    }

    pub fn insert_argument(&mut self, index: usize, argument: Argument) {
        self.arguments.insert(index, argument);
    }

    pub fn remove_argument(&mut self, index: usize) -> Argument {
        self.arguments.remove(index)
    }

    pub fn add_content(&mut self, component: Component) {
        self.content.push(component);
    }

    pub fn set_content(&mut self, index: usize, component: Component) {
        self.content[index] = component;
    }

    pub fn insert_content(&mut self, index: usize, component: Component) {
        self.content.insert(index, component);
    }

    pub fn remove_content(&mut self, index: usize) -> Component {
        self.content.remove(index)
    }

    pub fn render(&self) -> String {
        let body: String = self.content.iter().map(Component::render).collect();
        if self.bare {
            return body;
        }
        let args: String = self.arguments.iter().map(Argument::render).collect();
        format!(
            "\\begin{{{}}}{}\n{}\n\\end{{{}}}",
            self.name, args, body, self.name
        )
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A piece of a document: a macro call, an environment, or literal text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Component {
    Macro(MacroCall),
    Environment(Environment),
    Plain(String),
}

impl Component {
    /// Parses markup text into a component sequence.
    pub fn parse(input: &str) -> Result<Vec<Component>> {
        parse_components(input, 0)
    }

    pub fn render(&self) -> String {
        match self {
            Component::Macro(m) => m.render(),
            Component::Environment(e) => e.render(),
            Component::Plain(text) => text.clone(),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Consumes consecutive `{...}` / `[...]` groups starting at `pos`.
fn parse_arguments(input: &str, mut pos: usize, base: usize) -> Result<(Vec<Argument>, usize)> {
    let mut arguments = Vec::new();
    while pos < input.len() {
        let kind = match input.as_bytes()[pos] {
            b'{' => ArgKind::Required,
            b'[' => ArgKind::Optional,
            _ => break,
        };
        let close = find_matching(input, pos, base)?;
        let inner = &input[pos + 1..close];
        arguments.push(Argument {
            kind,
            value: ArgValue::List(parse_list(inner, base + pos + 1)?),
        });
        pos = close + 1;
    }
    Ok((arguments, pos))
}

fn parse_components(input: &str, base: usize) -> Result<Vec<Component>> {
    let mut out = Vec::new();
    let mut plain = String::new();
    let mut i = 0;

    let flush = |plain: &mut String, out: &mut Vec<Component>| {
        if !plain.is_empty() {
            out.push(Component::Plain(std::mem::take(plain)));
        }
    };

    while i < input.len() {
        if input.as_bytes()[i] != b'\\' {
            if let Some(c) = input[i..].chars().next() {
                plain.push(c);
                i += c.len_utf8();
            }
            continue;
        }
        let rest = &input[i + 1..];
        let name_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .count();
        if name_len == 0 {
            // Control symbol or escaped character; literal text.
            plain.push('\\');
            i += 1;
            if let Some(c) = rest.chars().next() {
                plain.push(c);
                i += c.len_utf8();
            }
            continue;
        }
        let name = &rest[..name_len];
        let after = i + 1 + name_len;
        if name == "begin" {
            let (env, end) = parse_environment(input, i, after, base)?;
            flush(&mut plain, &mut out);
            out.push(Component::Environment(env));
            i = end;
        } else {
            let (arguments, end) = parse_arguments(input, after, base)?;
            flush(&mut plain, &mut out);
            out.push(Component::Macro(MacroCall {
                name: name.to_string(),
                arguments,
            }));
            i = end;
        }
    }
    flush(&mut plain, &mut out);
    Ok(out)
}

/// Parses an environment whose `\begin` starts at `start`; `after` points
/// just past the word `begin`.
fn parse_environment(
    input: &str,
    start: usize,
    after: usize,
    base: usize,
) -> Result<(Environment, usize)> {
    if !input[after..].starts_with('{') {
        return Err(Error::syntax(base + after, "expected `{` after `\\begin`"));
    }
    let name_close = find_matching(input, after, base)?;
    let name = input[after + 1..name_close].trim().to_string();
    let (arguments, content_start) = parse_arguments(input, name_close + 1, base)?;

    let begin_tag = format!("\\begin{{{name}}}");
    let end_tag = format!("\\end{{{name}}}");
    let mut depth = 1usize;
    let mut search = content_start;
    let (content_end, end) = loop {
        let next_begin = input[search..].find(&begin_tag).map(|p| p + search);
        let next_end = input[search..].find(&end_tag).map(|p| p + search);
        match (next_begin, next_end) {
            (_, None) => {
                return Err(Error::syntax(
                    base + start,
                    format!("unterminated environment `{name}`"),
                ))
            }
            (Some(b), Some(e)) if b < e => {
                depth += 1;
                search = b + begin_tag.len();
            }
            (_, Some(e)) => {
                depth -= 1;
                if depth == 0 {
                    break (e, e + end_tag.len());
                }
                search = e + end_tag.len();
            }
        }
    };

    // One newline on each side of the content belongs to the environment
    // frame, not the content.
    let mut inner_start = content_start;
    let mut inner_end = content_end;
    if input[inner_start..inner_end].starts_with('\n') {
        inner_start += 1;
    }
    if inner_end > inner_start && input[inner_start..inner_end].ends_with('\n') {
        inner_end -= 1;
    }
    let content = parse_components(&input[inner_start..inner_end], base + inner_start)?;

    Ok((
        Environment {
            name,
            arguments,
            content,
            bare: false,
        },
        end,
    ))
}
