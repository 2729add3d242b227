//! Prompt template rendering and normalization.
//!
//! Templates are restricted to the safe subset the runtime needs: variable
//! interpolation and simple conditionals/loops, rendered through a shared
//! minijinja environment against a JSON context. After rendering, prompts are
//! normalized: non-ASCII characters are transliterated or dropped and runs of
//! three or more blank lines collapse to one.

use minijinja::Environment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::RuntimeError;

static ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    // Unknown variables render as empty strings; agent configs routinely list
    // context items a given turn does not populate.
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
    env
});

static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// Renders a template string against a JSON object context.
pub fn render(agent: &str, template: &str, context: &Value) -> Result<String, RuntimeError> {
    let ctx = minijinja::Value::from_serialize(context);
    ENV.render_str(template, ctx)
        .map_err(|e| RuntimeError::PromptRender {
            agent: agent.to_string(),
            message: e.to_string(),
        })
}

/// Renders and then normalizes, the shape every outgoing prompt goes through.
pub fn render_normalized(
    agent: &str,
    template: &str,
    context: &Value,
) -> Result<String, RuntimeError> {
    Ok(normalize(&render(agent, template, context)?))
}

/// ASCII normalization plus blank-line collapsing.
pub fn normalize(text: &str) -> String {
    let ascii = normalize_to_ascii(text);
    let collapsed = ascii.replace("\r\n", "\n");
    EXCESS_BLANK_LINES.replace_all(&collapsed, "\n\n").into_owned()
}

/// Maps common typographic characters to ASCII equivalents and drops the rest
/// of the non-ASCII range.
fn normalize_to_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' => out.push('"'),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' => out.push(' '),
            c if c.is_ascii() => out.push(c),
            _ => {}
        }
    }
    out
}

/// True when a state value looks like a template that needs on-demand
/// rendering (used by `resource_*` resolution).
pub fn looks_like_template(value: &str) -> bool {
    value.contains("{{") || value.contains("{%")
}
