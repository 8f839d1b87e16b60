//! Script execution for code regions.
//!
//! All regions of a document run as one concatenated rhai program inside a
//! single [`ExecutionContext`], so bindings made by an early region are
//! visible to every later one. Host functions route exported fragments
//! into a collector keyed by region identifier:
//!
//! - `region_begin(id)` — emitted by the program builder at the start of
//!   each region's statements; makes `id` the active region.
//! - `emit(value)` — renders a value and appends it to the active
//!   region's fragments.
//! - `suppress_output()` — drops every further export of the active
//!   region.
//!
//! Scripts can also build markup with `latex_macro(name)`,
//! `environment(name)`, and `group()`, and pass the result to `emit`.

use std::cell::RefCell;
use std::rc::Rc;

use linked_hash_map::LinkedHashMap;
use rhai::{CustomType, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, TypeBuilder};

use crate::args::ArgValue;
use crate::component::{Argument, Component, Environment, MacroCall};
use crate::error::{Error, Result};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Exported fragments per region, in registration order.
#[derive(Default)]
struct Collector {
    outputs: LinkedHashMap<String, Vec<String>>,
    current: Option<String>,
    suppressed: bool,
}

impl Collector {
    fn reset(&mut self) {
        self.outputs.clear();
        self.current = None;
        self.suppressed = false;
    }
}

/// The single persistent program state for one document transform.
pub struct ExecutionContext {
    engine: Engine,
    scope: Scope<'static>,
    collector: Rc<RefCell<Collector>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let collector = Rc::new(RefCell::new(Collector::default()));
        let mut engine = Engine::new();
        engine.set_max_expr_depths(1000, 1000);
        register_host_fns(&mut engine, &collector);
        register_components(&mut engine, &collector);
        ExecutionContext {
            engine,
            scope: Scope::new(),
            collector,
        }
    }

    /// The underlying script engine, for registering further renderable
    /// types or host functions before a transform.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Runs the concatenated program once. On failure the error names the
    /// region that was active, and all partial exports are discarded.
    pub(crate) fn run(&mut self, program: &str) -> Result<()> {
        if let Err(e) = self.engine.run_with_scope(&mut self.scope, program) {
            let mut collector = self.collector.borrow_mut();
            let region = collector.current.clone().unwrap_or_default();
            collector.reset();
            return Err(Error::Execution {
                region,
                message: e.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn take_outputs(&mut self) -> LinkedHashMap<String, Vec<String>> {
        std::mem::take(&mut self.collector.borrow_mut().outputs)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

fn push_fragment(collector: &Rc<RefCell<Collector>>, fragment: String) -> ScriptResult<()> {
    let mut collector = collector.borrow_mut();
    if collector.suppressed {
        return Ok(());
    }
    let Some(current) = collector.current.clone() else {
        return Err("emit() called outside a code region".into());
    };
    if let Some(fragments) = collector.outputs.get_mut(&current) {
        fragments.push(fragment);
    }
    Ok(())
}

fn render_dynamic(value: &Dynamic) -> String {
    if value.is::<()>() {
        String::new()
    } else {
        value.to_string()
    }
}

fn register_host_fns(engine: &mut Engine, collector: &Rc<RefCell<Collector>>) {
    let c = collector.clone();
    engine.register_fn("region_begin", move |id: ImmutableString| -> ScriptResult<()> {
        let mut c = c.borrow_mut();
        if c.outputs.contains_key(id.as_str()) {
            return Err(format!("duplicate region identifier `{id}`").into());
        }
        c.outputs.insert(id.to_string(), Vec::new());
        c.current = Some(id.to_string());
        c.suppressed = false;
        Ok(())
    });

    let c = collector.clone();
    engine.register_fn("emit", move |value: Dynamic| -> ScriptResult<()> {
        push_fragment(&c, render_dynamic(&value))
    });

    let c = collector.clone();
    engine.register_fn("suppress_output", move || {
        c.borrow_mut().suppressed = true;
    });
}

fn register_components(engine: &mut Engine, collector: &Rc<RefCell<Collector>>) {
    engine.build_type::<ScriptMacro>();
    engine.build_type::<ScriptEnvironment>();

    let c = collector.clone();
    engine.register_fn("emit", move |value: ScriptMacro| -> ScriptResult<()> {
        push_fragment(&c, value.0.render())
    });
    let c = collector.clone();
    engine.register_fn("emit", move |value: ScriptEnvironment| -> ScriptResult<()> {
        push_fragment(&c, value.0.render())
    });
}

fn parse_argument(text: &str) -> ScriptResult<ArgValue> {
    ArgValue::parse(text).map_err(|e| e.to_string().into())
}

/// A macro call under construction in script code.
#[derive(Debug, Clone)]
pub struct ScriptMacro(MacroCall);

impl CustomType for ScriptMacro {
    fn build(mut builder: TypeBuilder<Self>) {
        builder
            .with_name("Macro")
            .with_fn("latex_macro", |name: ImmutableString| {
                ScriptMacro(MacroCall::new(name.as_str()))
            })
            .with_fn(
                "add_argument",
                |m: &mut Self, text: ImmutableString| -> ScriptResult<()> {
                    m.0.add_argument(Argument::required(parse_argument(&text)?));
                    Ok(())
                },
            )
            .with_fn(
                "add_optional_argument",
                |m: &mut Self, text: ImmutableString| -> ScriptResult<()> {
                    m.0.add_argument(Argument::optional(parse_argument(&text)?));
                    Ok(())
                },
            )
            .with_fn("render", |m: &mut Self| m.0.render());
    }
}

/// An environment (or with `group()`, a bare container) under
/// construction in script code.
#[derive(Debug, Clone)]
pub struct ScriptEnvironment(Environment);

impl CustomType for ScriptEnvironment {
    fn build(mut builder: TypeBuilder<Self>) {
        builder
            .with_name("Environment")
            .with_fn("environment", |name: ImmutableString| {
                ScriptEnvironment(Environment::new(name.as_str()))
            })
            .with_fn("group", || ScriptEnvironment(Environment::group(Vec::new())))
            .with_fn(
                "add_argument",
                |e: &mut Self, text: ImmutableString| -> ScriptResult<()> {
                    e.0.add_argument(Argument::required(parse_argument(&text)?));
                    Ok(())
                },
            )
            .with_fn(
                "add_optional_argument",
                |e: &mut Self, text: ImmutableString| -> ScriptResult<()> {
                    e.0.add_argument(Argument::optional(parse_argument(&text)?));
                    Ok(())
                },
            )
            .with_fn("add_content", |e: &mut Self, text: ImmutableString| {
                e.0.add_content(Component::Plain(text.to_string()));
            })
            .with_fn("add_content", |e: &mut Self, inner: ScriptMacro| {
                e.0.add_content(Component::Macro(inner.0));
            })
            .with_fn("add_content", |e: &mut Self, inner: ScriptEnvironment| {
                e.0.add_content(Component::Environment(inner.0));
            })
            .with_fn("render", |e: &mut Self| e.0.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_collect(program: &str) -> LinkedHashMap<String, Vec<String>> {
        let mut ctx = ExecutionContext::new();
        ctx.run(program).expect("script error");
        ctx.take_outputs()
    }

    #[test]
    fn bindings_persist_across_regions() {
        let outputs = run_collect(
            "region_begin(\"r1\");\nlet x = 5;\nemit(x + 1);\n\
             region_begin(\"r2\");\nemit(x * 2);\n",
        );
        assert_eq!(vec!["6".to_string()], outputs["r1"]);
        assert_eq!(vec!["10".to_string()], outputs["r2"]);
    }

    #[test]
    fn outputs_keep_registration_order() {
        let outputs = run_collect(
            "region_begin(\"a\");\nregion_begin(\"b\");\nregion_begin(\"c\");\n",
        );
        let keys: Vec<&String> = outputs.keys().collect();
        assert_eq!(vec!["a", "b", "c"], keys);
    }

    #[test]
    fn unit_emits_empty_fragment() {
        let outputs = run_collect("region_begin(\"r\");\nemit(());\n");
        assert_eq!(vec![String::new()], outputs["r"]);
    }

    #[test]
    fn suppress_output_drops_later_emits() {
        let outputs = run_collect(
            "region_begin(\"r\");\nemit(1);\nsuppress_output();\nemit(2);\n",
        );
        assert_eq!(vec!["1".to_string()], outputs["r"]);
    }

    #[test]
    fn suppression_ends_with_the_region() {
        let outputs = run_collect(
            "region_begin(\"r1\");\nsuppress_output();\nemit(1);\n\
             region_begin(\"r2\");\nemit(2);\n",
        );
        assert!(outputs["r1"].is_empty());
        assert_eq!(vec!["2".to_string()], outputs["r2"]);
    }

    #[test]
    fn duplicate_region_id_fails() {
        let mut ctx = ExecutionContext::new();
        let err = ctx
            .run("region_begin(\"r\");\nregion_begin(\"r\");\n")
            .unwrap_err();
        assert!(matches!(err, Error::Execution { .. }), "{err:?}");
    }

    #[test]
    fn emit_outside_region_fails() {
        let mut ctx = ExecutionContext::new();
        let err = ctx.run("emit(1);\n").unwrap_err();
        assert!(matches!(err, Error::Execution { .. }), "{err:?}");
    }

    #[test]
    fn failure_names_active_region_and_discards_outputs() {
        let mut ctx = ExecutionContext::new();
        let err = ctx
            .run(
                "region_begin(\"ok\");\nemit(1);\n\
                 region_begin(\"bad\");\nemit(missing_variable);\n",
            )
            .unwrap_err();
        match err {
            Error::Execution { region, .. } => assert_eq!("bad", region),
            other => panic!("expected execution error, got {other:?}"),
        }
        assert!(ctx.take_outputs().is_empty());
    }

    #[test]
    fn script_builds_and_emits_components() {
        let outputs = run_collect(
            "region_begin(\"r\");\n\
             let m = latex_macro(\"textbf\");\n\
             m.add_argument(\"hello\");\n\
             emit(m);\n",
        );
        assert_eq!(vec!["\\textbf{hello}".to_string()], outputs["r"]);
    }

    #[test]
    fn script_builds_environments_with_content() {
        let outputs = run_collect(
            "region_begin(\"r\");\n\
             let env = environment(\"center\");\n\
             let inner = latex_macro(\"large\");\n\
             env.add_content(inner);\n\
             env.add_content(\" title\");\n\
             emit(env);\n",
        );
        assert_eq!(
            vec!["\\begin{center}\n\\large title\n\\end{center}".to_string()],
            outputs["r"]
        );
    }

    #[test]
    fn group_renders_content_only() {
        let outputs = run_collect(
            "region_begin(\"r\");\n\
             let g = group();\n\
             g.add_content(\"a\");\n\
             g.add_content(\"b\");\n\
             emit(g);\n",
        );
        assert_eq!(vec!["ab".to_string()], outputs["r"]);
    }

    #[test]
    fn render_is_also_a_plain_string() {
        let outputs = run_collect(
            "region_begin(\"r\");\n\
             let m = latex_macro(\"item\");\n\
             emit(m.render() + \" text\");\n",
        );
        assert_eq!(vec!["\\item text".to_string()], outputs["r"]);
    }

    #[test]
    fn scope_persists_across_runs() {
        let mut ctx = ExecutionContext::new();
        ctx.run("region_begin(\"r1\");\nlet total = 40;\n").unwrap();
        ctx.take_outputs();
        ctx.run("region_begin(\"r2\");\nemit(total + 2);\n").unwrap();
        let outputs = ctx.take_outputs();
        assert_eq!(vec!["42".to_string()], outputs["r2"]);
    }
}
