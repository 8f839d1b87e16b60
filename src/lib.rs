//! texweave transforms a LaTeX document by executing the script regions
//! embedded in its body and splicing their output back in place, while
//! normalizing the preamble's class and package declarations.
//!
//! The document splits at `\begin{document}`. The preamble above it goes
//! through the [`preamble::Preamble`] assembler; the body below runs
//! through the code-region pipeline. Inline regions are written
//! `\py{...}` and block regions `\begin{python}...\end{python}`; all
//! regions execute as one program, in document order, inside a single
//! [`ExecutionContext`].
//!
//! ```
//! let doc = "\\documentclass{article}\n\\begin{document}\nSum: \\py{2 + 3}\n\\end{document}\n";
//! let out = texweave::transform(doc).unwrap();
//! assert!(out.contains("Sum: 5"));
//! ```

pub mod args;
mod common;
pub mod component;
pub mod error;
pub mod pipeline;
pub mod preamble;

pub use crate::common::Span;
pub use crate::error::{Error, Result};
pub use crate::pipeline::script::ExecutionContext;

use crate::common::active_len;

/// Transforms a document with a fresh execution context.
pub fn transform(document: &str) -> Result<String> {
    let mut ctx = ExecutionContext::new();
    transform_with(document, &mut ctx)
}

/// Transforms a document with a caller-provided context, so extra host
/// functions or renderable types can be registered beforehand.
pub fn transform_with(document: &str, ctx: &mut ExecutionContext) -> Result<String> {
    let (preamble_text, body) = split_document(document)?;
    let preamble = preamble::Preamble::assemble(preamble_text)?;
    let body = pipeline::transform_body(body, ctx)?;
    Ok(format!("{preamble}{body}"))
}

/// Splits at the line holding `\begin{document}`; that line starts the
/// body.
fn split_document(document: &str) -> Result<(&str, &str)> {
    let mut offset = 0;
    for part in document.split_inclusive('\n') {
        let line = part.strip_suffix('\n').unwrap_or(part);
        if line[..active_len(line)].contains("\\begin{document}") {
            return Ok((&document[..offset], &document[offset..]));
        }
        offset += part.len();
    }
    Err(Error::syntax(
        0,
        "document has no `\\begin{document}` line",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_full_document() -> anyhow::Result<()> {
        let doc = "\
\\documentclass{article}
\\usepackage[margin = 2cm]{geometry}
\\begin{document}
Value: \\py{let x = 5; x + 1} and \\py{x * 2}.
\\end{document}
";
        let out = transform(doc)?;
        assert!(out.starts_with("\\documentclass{article}\n"), "{out}");
        assert!(out.contains("\\usepackage[margin = 2cm]{geometry}"), "{out}");
        assert!(out.contains("Value: 6 and 10."), "{out}");
        assert!(out.ends_with("\\end{document}\n"), "{out}");
        Ok(())
    }

    #[test]
    fn transform_block_region() -> anyhow::Result<()> {
        let doc = "\
\\documentclass{article}
\\begin{document}
\\begin{python}
  let acc = 0;
  acc += 40;
  acc + 2
\\end{python}
\\end{document}
";
        let out = transform(doc)?;
        assert!(out.contains("\n42\n"), "{out}");
        assert!(!out.contains("python"), "{out}");
        Ok(())
    }

    #[test]
    fn body_outside_regions_is_untouched(){
        let doc = "\
\\documentclass{article}
\\begin{document}
Some % text with \\oddities{a = b} left alone.
\\end{document}
";
        let out = transform(doc).unwrap();
        assert!(
            out.contains("Some % text with \\oddities{a = b} left alone."),
            "{out}"
        );
    }

    #[test]
    fn bindings_flow_between_inline_and_block_regions() -> anyhow::Result<()> {
        let doc = "\
\\documentclass{article}
\\begin{document}
\\begin{python}
  let greeting = \"hi\";
\\end{python}
Say \\py{greeting}.
\\end{document}
";
        let out = transform(doc)?;
        assert!(out.contains("Say hi."), "{out}");
        Ok(())
    }

    #[test]
    fn config_macro_drives_preamble() {
        let doc = "\
\\documentclass{article}
\\weave_preamble{standard = {margin = 2cm}}
\\begin{document}
\\end{document}
";
        let out = transform(doc).unwrap();
        assert!(out.contains("\\usepackage[margin = 2cm]{geometry}"), "{out}");
        assert!(out.contains("\\usepackage{amsmath}"), "{out}");
        let preamble_end = out.find("\\begin{document}").unwrap();
        assert!(!out[..preamble_end].contains("weave_preamble"), "{out}");
    }

    #[test]
    fn missing_begin_document_fails() {
        let err = transform("\\documentclass{article}\njust text\n").unwrap_err();
        assert!(matches!(err, Error::ArgumentSyntax { .. }), "{err:?}");
    }

    #[test]
    fn script_failure_aborts_whole_transform() {
        let doc = "\
\\documentclass{article}
\\begin{document}
ok \\py{1 + 1}
bad \\py{nonexistent}
\\end{document}
";
        let err = transform(doc).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }), "{err:?}");
    }

    #[test]
    fn transform_with_reuses_registrations() {
        let mut ctx = ExecutionContext::new();
        ctx.engine_mut().register_fn("shout", |s: rhai::ImmutableString| {
            s.to_uppercase()
        });
        let doc = "\
\\documentclass{article}
\\begin{document}
\\py{shout(\"loud\")}
\\end{document}
";
        let out = transform_with(doc, &mut ctx).unwrap();
        assert!(out.contains("LOUD"), "{out}");
    }

    #[test]
    fn silent_region_leaves_no_trace() {
        let doc = "\
\\documentclass{article}
\\begin{document}
before\\py{let q = 1;}after
\\end{document}
";
        let out = transform(doc).unwrap();
        assert!(out.contains("beforeafter"), "{out}");
    }
}
