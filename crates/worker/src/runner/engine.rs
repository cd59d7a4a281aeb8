//! Script engine construction.
//!
//! Each job gets its own [`Engine`]: module imports resolve to nothing,
//! `eval` is disabled and every `print` / `debug` line goes to the job's
//! [`OutputSink`] instead of the process stdout.

use std::sync::Arc;

use num_bigint::BigInt;
use querylens_core::output::OutputSink;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Engine, EvalAltResult};

use super::RunnerOptions;

pub fn build(options: &RunnerOptions, sink: Arc<dyn OutputSink>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    if options.max_operations > 0 {
        engine.set_max_operations(options.max_operations);
    }
    engine.set_max_call_levels(options.max_call_levels);

    let print_sink = Arc::clone(&sink);
    engine.on_print(move |text| print_sink.write_line(text));
    engine.on_debug(move |text, _source, _pos| sink.write_line(text));

    register_bigint(&mut engine);
    engine
}

macro_rules! bigint_ops {
    ($engine:expr, $($op:tt),+) => {
        $(
            $engine
                .register_fn(stringify!($op), |a: BigInt, b: BigInt| a $op b)
                .register_fn(stringify!($op), |a: BigInt, b: i64| a $op b)
                .register_fn(stringify!($op), |a: i64, b: BigInt| a $op b);
        )+
    };
}

macro_rules! bigint_cmp {
    ($engine:expr, $($op:tt),+) => {
        $(
            $engine
                .register_fn(stringify!($op), |a: BigInt, b: BigInt| a $op b)
                .register_fn(stringify!($op), |a: BigInt, b: i64| a $op BigInt::from(b))
                .register_fn(stringify!($op), |a: i64, b: BigInt| BigInt::from(a) $op b);
        )+
    };
}

/// Arbitrary-precision integers: `bigint("123...")`, `bigint(42)`,
/// arithmetic, comparison and `to_string`.
fn register_bigint(engine: &mut Engine) {
    engine
        .register_type_with_name::<BigInt>("BigInt")
        .register_fn("bigint", |text: &str| -> Result<BigInt, Box<EvalAltResult>> {
            text.trim()
                .parse::<BigInt>()
                .map_err(|e| format!("Invalid integer '{text}': {e}").into())
        })
        .register_fn("bigint", |value: i64| BigInt::from(value))
        .register_fn("to_string", |value: &mut BigInt| value.to_string())
        .register_fn("to_debug", |value: &mut BigInt| value.to_string());

    bigint_ops!(engine, +, -, *);
    bigint_cmp!(engine, ==, !=, <, <=, >, >=);
}

#[cfg(test)]
mod tests {
    use querylens_core::output::BufferSink;

    use super::*;

    fn options() -> RunnerOptions {
        RunnerOptions::default()
    }

    #[test]
    fn print_and_debug_go_to_the_sink() {
        let sink = Arc::new(BufferSink::new());
        let engine = build(&options(), sink.clone());
        engine.run(r#"print("Lewis"); debug("Max");"#).unwrap();
        assert_eq!(sink.contents(), "Lewis\n\"Max\"");
    }

    #[test]
    fn bigint_arithmetic_is_exact() {
        let engine = build(&options(), Arc::new(BufferSink::new()));
        let result: String = engine
            .eval(r#"let a = bigint("9223372036854775807"); (a + 1 + a * 2).to_string()"#)
            .unwrap();
        assert_eq!(result, "27670116110564327422");

        let less: bool = engine.eval(r#"bigint("5") < bigint(7)"#).unwrap();
        assert!(less);
    }

    #[test]
    fn invalid_bigint_is_a_script_error() {
        let engine = build(&options(), Arc::new(BufferSink::new()));
        assert!(engine.eval::<BigInt>(r#"bigint("12ab")"#).is_err());
    }

    #[test]
    fn imports_and_eval_are_unavailable() {
        let engine = build(&options(), Arc::new(BufferSink::new()));
        assert!(engine.run(r#"import "os" as os;"#).is_err());
        assert!(engine.compile(r#"eval("1 + 1")"#).is_err());
    }

    #[test]
    fn operation_cap_stops_runaway_loops() {
        let mut opts = options();
        opts.max_operations = 1_000;
        let engine = build(&opts, Arc::new(BufferSink::new()));
        let err = engine.run("loop {}").unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorTooManyOperations(_)));
    }
}
