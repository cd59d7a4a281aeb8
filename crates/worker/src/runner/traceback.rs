//! Script error messages and tracebacks.

use rhai::{EvalAltResult, ParseError, Position};

use super::{convert, RunError, ScriptSource};

/// Build a [`RunError`] from a runtime error.
///
/// Rhai wraps an error raised inside a script function once per active
/// call, each wrapper carrying the position of the call that entered the
/// next function. Unwinding the wrappers yields the function-call chain,
/// outermost first.
pub fn from_eval_error(script: &ScriptSource, error: &EvalAltResult) -> RunError {
    let mut calls: Vec<&str> = Vec::new();
    let mut positions: Vec<Position> = Vec::new();
    let mut current = error;
    while let EvalAltResult::ErrorInFunctionCall(name, _source, inner, _) = current {
        calls.push(name.as_str());
        current = inner.as_ref();
        positions.push(current.position());
    }

    let message = message(current);
    let mut lines = vec!["Traceback (most recent call last):".to_string()];
    if calls.is_empty() {
        push_frame(&mut lines, script, current.position(), "<main>");
    } else {
        for (name, position) in calls.iter().zip(&positions) {
            push_frame(&mut lines, script, *position, name);
        }
    }
    lines.push(format!("Error: {message}"));

    RunError {
        message,
        traceback: Some(lines.join("\n")),
    }
}

/// Build a [`RunError`] for a script that does not compile.
pub fn from_parse_error(script: &ScriptSource, error: &ParseError) -> RunError {
    let message = format!("Syntax error: {}", error.0);
    let mut lines = vec!["Traceback (most recent call last):".to_string()];
    push_frame(&mut lines, script, error.1, "<main>");
    lines.push(format!("Error: {message}"));
    RunError {
        message,
        traceback: Some(lines.join("\n")),
    }
}

fn push_frame(lines: &mut Vec<String>, script: &ScriptSource, position: Position, function: &str) {
    match position.line() {
        Some(line) => {
            lines.push(format!("  File \"{}\", line {line}, in {function}", script.id));
            if let Some(text) = script.text.lines().nth(line - 1) {
                lines.push(format!("    {}", text.trim()));
            }
        }
        None => lines.push(format!("  File \"{}\", in {function}", script.id)),
    }
}

/// Error text without Rhai's trailing position.
fn message(error: &EvalAltResult) -> String {
    if let EvalAltResult::ErrorRuntime(value, _) = error {
        if !value.is_unit() {
            return convert::display(value);
        }
    }
    let text = error.to_string();
    let position = error.position();
    if position.is_none() {
        return text;
    }
    let suffix = format!(" ({position})");
    match text.strip_suffix(&suffix) {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}
