//! Preamble assembly: collects `\documentclass` and `\usepackage`
//! declarations, folds in the `\weave_preamble{...}` configuration macro,
//! and re-emits a normalized preamble.
//!
//! Declarations are located line by line in the active (uncommented) part
//! of the preamble, parsed with the argument scanner, and removed from
//! their lines. The class line and package lines are then emitted ahead of
//! whatever preamble text remains.

use lazy_static::lazy_static;
use regex::Regex;

use crate::args::{merge_value, ArgValue, KeyVal, KeyValList};
use crate::common::active_len;
use crate::component::{ArgKind, Argument, MacroCall};
use crate::error::{Error, Result};

/// Configuration macro recognized anywhere in the preamble.
pub const CONFIG_MACRO: &str = "\\weave_preamble";

const STANDARD_SET: &[&str] = &[
    "geometry", "amsmath", "amssymb", "xcolor", "graphicx", "hyperref",
];
const TIKZ_SET: &[&str] = &["tikz"];
const TECHNICAL_SET: &[&str] = &["siunitx", "physics", "chemfig", "circuitikz"];

const TIKZ_LIBRARIES: &str = "arrows, arrows.meta, calc, decorations.pathmorphing, positioning";

const DEFAULT_CLASS: &str = "article";
const DEFAULT_CLASS_OPTIONS: &str = "fleqn";

lazy_static! {
    static ref DOCUMENTCLASS: Regex = Regex::new(r"\\documentclass\b").unwrap();
    static ref USEPACKAGE: Regex = Regex::new(r"\\usepackage\b").unwrap();
}

pub struct Preamble {
    /// Working copy of the preamble, one entry per line, with each line's
    /// byte offset in the original text for error reporting.
    lines: Vec<(usize, String)>,
    documentclass: Option<KeyVal>,
    packages: KeyValList,
    config: KeyValList,
    tikz_libraries: Option<&'static str>,
}

impl Preamble {
    /// Rewrites a preamble: extracts declarations, applies the
    /// configuration macro, and re-emits. The output always ends with a
    /// newline so the document body can be appended directly.
    pub fn assemble(preamble: &str) -> Result<String> {
        let mut lines = Vec::new();
        let mut offset = 0;
        for part in preamble.split_inclusive('\n') {
            let line = part.strip_suffix('\n').unwrap_or(part);
            let line = line.strip_suffix('\r').unwrap_or(line);
            lines.push((offset, line.to_string()));
            offset += part.len();
        }
        let mut preamble = Preamble {
            lines,
            documentclass: None,
            packages: KeyValList::default(),
            config: KeyValList::default(),
            tikz_libraries: None,
        };
        preamble.extract_documentclass()?;
        preamble.extract_packages()?;
        preamble.extract_config()?;
        let class = preamble.process_config()?;
        preamble.reconstruct(class)
    }

    /// Removes the first `\documentclass` declaration from the lines and
    /// records it.
    fn extract_documentclass(&mut self) -> Result<()> {
        let mut found = None;
        for (idx, (offset, line)) in self.lines.iter().enumerate() {
            let active = &line[..active_len(line)];
            if let Some(m) = DOCUMENTCLASS.find(active) {
                let (call, end) = MacroCall::parse_at(active, m.start(), *offset)?;
                let class = class_from_macro(&call, *offset + m.start())?;
                found = Some((idx, m.start()..end, class));
                break;
            }
        }
        if let Some((idx, range, class)) = found {
            self.documentclass = Some(class);
            self.lines[idx].1.replace_range(range, "");
        }
        Ok(())
    }

    /// Removes every `\usepackage` declaration and merges it into the
    /// package map. A multi-name declaration shares its options between
    /// all named packages.
    fn extract_packages(&mut self) -> Result<()> {
        for idx in 0..self.lines.len() {
            loop {
                let (offset, line) = &self.lines[idx];
                let active = &line[..active_len(line)];
                let Some(m) = USEPACKAGE.find(active) else { break };
                let (call, end) = MacroCall::parse_at(active, m.start(), *offset)?;
                let (names, options) = packages_from_macro(&call, *offset + m.start())?;
                let range = m.start()..end;
                self.lines[idx].1.replace_range(range, "");
                for name in names {
                    self.packages
                        .merge([KeyVal::new(name, options.clone())].into_iter().collect())?;
                }
            }
        }
        Ok(())
    }

    /// Removes the first configuration macro and keeps its argument list
    /// for [`Preamble::process_config`].
    fn extract_config(&mut self) -> Result<()> {
        let name = &CONFIG_MACRO[1..];
        let mut found = None;
        for (idx, (offset, line)) in self.lines.iter().enumerate() {
            let active = &line[..active_len(line)];
            if let Some(pos) = active.find(CONFIG_MACRO) {
                let (call, end) = MacroCall::parse_at(active, pos, *offset)?;
                if call.name != name {
                    continue;
                }
                let config = config_from_macro(&call, *offset + pos)?;
                found = Some((idx, pos..end, config));
                break;
            }
        }
        if let Some((idx, range, config)) = found {
            self.config = config;
            self.lines[idx].1.replace_range(range, "");
        }
        Ok(())
    }

    /// Applies the configuration keys in their written order: the document
    /// class, the package bundles, then everything left as arbitrary
    /// package declarations. Returns the final class declaration.
    fn process_config(&mut self) -> Result<KeyVal> {
        let mut config = std::mem::take(&mut self.config);
        let mut implied_standard = false;

        if let Some(entry) = config.remove("documentclass") {
            let (name, options) = class_from_config(entry.value)?;
            match &mut self.documentclass {
                Some(existing) => {
                    if existing.key != name {
                        return Err(Error::Conflict(format!(
                            "document class already declared as `{}`; cannot redeclare as `{name}`",
                            existing.key
                        )));
                    }
                    merge_value(&mut existing.value, options)?;
                }
                None => self.documentclass = Some(KeyVal::new(name, options)),
            }
        } else if self.documentclass.is_none() {
            self.documentclass = Some(KeyVal::new(
                DEFAULT_CLASS,
                Some(ArgValue::Scalar(DEFAULT_CLASS_OPTIONS.into())),
            ));
        }

        if let Some(entry) = config.remove("tikz standard") {
            implied_standard = true;
            self.add_bundle(TIKZ_SET)?;
            self.tikz_libraries = Some(TIKZ_LIBRARIES);
            self.apply_bundle_options("tikz standard", entry.value, TIKZ_SET)?;
        }
        if let Some(entry) = config.remove("technical") {
            implied_standard = true;
            self.add_bundle(TECHNICAL_SET)?;
            self.apply_bundle_options("technical", entry.value, TECHNICAL_SET)?;
        }
        if implied_standard {
            self.add_bundle(STANDARD_SET)?;
        }

        if let Some(entry) = config.remove("standard") {
            self.add_bundle(STANDARD_SET)?;
            if let Some(value) = entry.value {
                let options = bundle_option_list("standard", value)?;
                // Keys naming a bundled package configure that package;
                // anything left over is folded into geometry's options.
                let mut geometry = KeyValList::default();
                let mut direct = KeyValList::default();
                for entry in options {
                    if STANDARD_SET.contains(&entry.key.as_str()) {
                        direct.push(entry);
                    } else {
                        geometry.push(entry);
                    }
                }
                if !geometry.is_empty() {
                    self.merge_package_options("geometry", ArgValue::List(geometry))?;
                }
                self.packages.merge(direct)?;
            }
        }

        // Remaining keys are arbitrary packages, options and all.
        self.packages.merge(config)?;

        self.documentclass
            .clone()
            .ok_or_else(|| Error::Conflict("no document class declared".into()))
    }

    fn add_bundle(&mut self, set: &[&str]) -> Result<()> {
        self.packages
            .merge(set.iter().map(|name| KeyVal::flag(*name)).collect())
    }

    /// Validates bundle options against the bundle's package names, then
    /// merges them into the package map.
    fn apply_bundle_options(
        &mut self,
        bundle: &str,
        value: Option<ArgValue>,
        set: &[&str],
    ) -> Result<()> {
        let Some(value) = value else { return Ok(()) };
        let options = bundle_option_list(bundle, value)?;
        for entry in options.iter() {
            if !set.contains(&entry.key.as_str()) {
                return Err(Error::Conflict(format!(
                    "`{}` is not a package of the `{bundle}` set",
                    entry.key
                )));
            }
        }
        self.packages.merge(options)
    }

    fn merge_package_options(&mut self, name: &str, value: ArgValue) -> Result<()> {
        match self.packages.get_mut(name) {
            Some(entry) => merge_value(&mut entry.value, Some(value)),
            None => {
                self.packages.push(KeyVal::new(name, Some(value)));
                Ok(())
            }
        }
    }

    /// Emits the class line, the package lines in first-occurrence order,
    /// the tikz library line when set, and the remaining preamble text.
    fn reconstruct(&self, class: KeyVal) -> Result<String> {
        let mut out = String::new();
        out.push_str(&declaration_line("documentclass", &class));
        out.push('\n');
        for entry in self.packages.iter() {
            out.push_str(&declaration_line("usepackage", entry));
            out.push('\n');
        }
        if let Some(libraries) = self.tikz_libraries {
            let mut call = MacroCall::new("usetikzlibrary");
            call.add_argument(Argument::required(ArgValue::parse(libraries)?));
            out.push_str(&call.render());
            out.push('\n');
        }
        for (_, line) in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Renders `\name[options]{key}` from a declaration entry, dropping an
/// empty options group.
fn declaration_line(name: &str, entry: &KeyVal) -> String {
    let mut call = MacroCall::new(name);
    if let Some(options) = &entry.value {
        if !options.is_empty() {
            call.add_argument(Argument::optional(options.clone()));
        }
    }
    call.add_argument(Argument::required(ArgValue::Scalar(entry.key.clone())));
    call.render()
}

/// Builds the class declaration from a parsed `\documentclass` call.
fn class_from_macro(call: &MacroCall, offset: usize) -> Result<KeyVal> {
    let name = first_required_key(call)
        .ok_or_else(|| Error::syntax(offset, "missing document class name"))?;
    Ok(KeyVal::new(name, first_optional_value(call)))
}

/// Builds `(names, options)` from a parsed `\usepackage` call.
fn packages_from_macro(call: &MacroCall, offset: usize) -> Result<(Vec<String>, Option<ArgValue>)> {
    let names: Vec<String> = call
        .arguments
        .iter()
        .find(|arg| arg.kind == ArgKind::Required)
        .map(|arg| match &arg.value {
            ArgValue::Scalar(s) => vec![s.clone()],
            ArgValue::List(l) => l.iter().map(|kv| kv.key.clone()).collect(),
        })
        .unwrap_or_default();
    if names.is_empty() {
        return Err(Error::syntax(offset, "missing package name"));
    }
    Ok((names, first_optional_value(call)))
}

fn config_from_macro(call: &MacroCall, offset: usize) -> Result<KeyValList> {
    match call
        .arguments
        .iter()
        .find(|arg| arg.kind == ArgKind::Required)
        .map(|arg| &arg.value)
    {
        Some(ArgValue::List(list)) => Ok(list.clone()),
        Some(ArgValue::Scalar(text)) => KeyValList::parse(text),
        None => Err(Error::syntax(
            offset,
            "the configuration macro requires an argument",
        )),
    }
}

fn first_required_key(call: &MacroCall) -> Option<String> {
    call.arguments
        .iter()
        .find(|arg| arg.kind == ArgKind::Required)
        .and_then(|arg| match &arg.value {
            ArgValue::Scalar(s) if !s.is_empty() => Some(s.clone()),
            ArgValue::List(l) => l.iter().next().map(|kv| kv.key.clone()),
            _ => None,
        })
}

fn first_optional_value(call: &MacroCall) -> Option<ArgValue> {
    call.arguments
        .iter()
        .find(|arg| arg.kind == ArgKind::Optional && !arg.value.is_empty())
        .map(|arg| arg.value.clone())
}

/// Interprets the `documentclass` configuration value: a scalar class
/// name, or a single-entry list whose value carries the class options.
fn class_from_config(value: Option<ArgValue>) -> Result<(String, Option<ArgValue>)> {
    match value {
        Some(ArgValue::Scalar(name)) => Ok((name, None)),
        Some(ArgValue::List(list)) => {
            let mut entries = list.into_iter();
            match (entries.next(), entries.next()) {
                (Some(entry), None) => Ok((entry.key, entry.value)),
                _ => Err(Error::Conflict(
                    "the `documentclass` option accepts exactly one class".into(),
                )),
            }
        }
        None => Err(Error::Conflict(
            "the `documentclass` option requires a class name".into(),
        )),
    }
}

fn bundle_option_list(bundle: &str, value: ArgValue) -> Result<KeyValList> {
    match value {
        ArgValue::List(list) => Ok(list),
        ArgValue::Scalar(_) => Err(Error::Conflict(format!(
            "options for the `{bundle}` set must be a key-value list"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(preamble: &str) -> String {
        Preamble::assemble(preamble).expect("assemble error")
    }

    #[test]
    fn default_class_when_nothing_declared() {
        assert_eq!("\\documentclass[fleqn]{article}\n", assemble(""));
    }

    #[test]
    fn existing_class_is_kept() {
        let out = assemble("\\documentclass[a4paper]{report}\n");
        assert!(out.starts_with("\\documentclass[a4paper]{report}\n"), "{out}");
    }

    #[test]
    fn packages_keep_first_occurrence_order() {
        let out = assemble(
            "\\documentclass{article}\n\
             \\usepackage{amsmath}\n\
             \\usepackage[margin = 2cm]{geometry}\n",
        );
        let amsmath = out.find("\\usepackage{amsmath}").unwrap();
        let geometry = out.find("\\usepackage[margin = 2cm]{geometry}").unwrap();
        assert!(amsmath < geometry, "{out}");
    }

    #[test]
    fn multi_name_usepackage_shares_options() {
        let out = assemble("\\usepackage[draft]{graphicx, hyperref}\n");
        assert!(out.contains("\\usepackage[draft]{graphicx}"), "{out}");
        assert!(out.contains("\\usepackage[draft]{hyperref}"), "{out}");
    }

    #[test]
    fn repeated_usepackage_merges_options() {
        let out = assemble(
            "\\usepackage[margin = 2cm]{geometry}\n\
             \\usepackage[landscape]{geometry}\n",
        );
        assert!(
            out.contains("\\usepackage[margin = 2cm, landscape]{geometry}"),
            "{out}"
        );
    }

    #[test]
    fn commented_declarations_are_ignored() {
        let out = assemble("% \\usepackage{amsmath}\n\\usepackage{xcolor}\n");
        assert!(out.contains("\\usepackage{xcolor}"), "{out}");
        assert!(out.contains("% \\usepackage{amsmath}"), "{out}");
        assert!(!out.contains("\\usepackage{amsmath}\n\\usepackage{xcolor}"), "{out}");
    }

    #[test]
    fn standard_bundle_adds_packages() {
        let out = assemble("\\weave_preamble{standard}\n");
        for name in STANDARD_SET {
            assert!(out.contains(&format!("\\usepackage{{{name}}}")), "{out}");
        }
    }

    #[test]
    fn standard_bundle_folds_leftovers_into_geometry() {
        let out = assemble("\\weave_preamble{standard = {margin = 2cm, hyperref = {colorlinks}}}\n");
        assert!(out.contains("\\usepackage[margin = 2cm]{geometry}"), "{out}");
        assert!(out.contains("\\usepackage[colorlinks]{hyperref}"), "{out}");
    }

    #[test]
    fn tikz_standard_implies_standard_and_libraries() {
        let out = assemble("\\weave_preamble{tikz standard}\n");
        assert!(out.contains("\\usepackage{tikz}"), "{out}");
        assert!(out.contains("\\usepackage{geometry}"), "{out}");
        assert!(
            out.contains(
                "\\usetikzlibrary{arrows, arrows.meta, calc, decorations.pathmorphing, positioning}"
            ),
            "{out}"
        );
    }

    #[test]
    fn technical_bundle_implies_standard() {
        let out = assemble("\\weave_preamble{technical}\n");
        assert!(out.contains("\\usepackage{siunitx}"), "{out}");
        assert!(out.contains("\\usepackage{amsmath}"), "{out}");
        assert!(!out.contains("usetikzlibrary"), "{out}");
    }

    #[test]
    fn bundle_option_for_foreign_package_conflicts() {
        let err = Preamble::assemble("\\weave_preamble{technical = {tikz = {x}}}\n").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");
    }

    #[test]
    fn unknown_config_keys_become_packages() {
        let out = assemble("\\weave_preamble{listings, booktabs = {longtable}}\n");
        assert!(out.contains("\\usepackage{listings}"), "{out}");
        assert!(out.contains("\\usepackage[longtable]{booktabs}"), "{out}");
    }

    #[test]
    fn matching_config_class_merges_options() {
        let out = assemble(
            "\\documentclass[a4paper]{article}\n\
             \\weave_preamble{documentclass = {article = {twocolumn}}}\n",
        );
        assert!(
            out.starts_with("\\documentclass[a4paper, twocolumn]{article}\n"),
            "{out}"
        );
    }

    #[test]
    fn conflicting_config_class_fails() {
        let err = Preamble::assemble(
            "\\documentclass{book}\n\\weave_preamble{documentclass = article}\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");
    }

    #[test]
    fn scalar_config_class_is_accepted() {
        let out = assemble("\\weave_preamble{documentclass = beamer}\n");
        assert!(out.starts_with("\\documentclass{beamer}\n"), "{out}");
    }

    #[test]
    fn remaining_preamble_text_is_preserved() {
        let out = assemble(
            "\\documentclass{article}\n\
             \\newcommand{\\foo}{bar}\n\
             \\usepackage{amsmath}\n",
        );
        assert!(out.contains("\\newcommand{\\foo}{bar}"), "{out}");
    }
}
