//! `${variable}` interpolation for prompts, commands, and branch targets.
//!
//! Supports dotted paths into step outputs (`${build.output}`) and
//! `${name:-fallback}` defaults. Strict mode errors on unresolved
//! references; lenient mode leaves the placeholder in place.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unresolved variable '${{{name}}}' in template")]
    Unresolved { name: String },
}

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    /// Walk a dotted path through the context. `build.output` first looks
    /// for a literal `build.output` key, then for `output` inside `build`.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(path) {
            return Some(value);
        }
        let (head, rest) = path.split_once('.')?;
        let mut value = self.values.get(head)?;
        for segment in rest.split('.') {
            value = value.get(segment)?;
        }
        Some(value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

pub struct TemplateEngine {
    pattern: Regex,
    strict: bool,
}

impl TemplateEngine {
    pub fn new(strict: bool) -> Self {
        Self {
            pattern: Regex::new(r"\$\{([^}]+)\}").expect("Invalid regex pattern"),
            strict,
        }
    }

    pub fn render(
        &self,
        template: &str,
        context: &TemplateContext,
    ) -> Result<String, TemplateError> {
        let mut result = String::with_capacity(template.len());
        let mut last_end = 0;

        for capture in self.pattern.captures_iter(template) {
            let whole = capture.get(0).expect("capture 0 always present");
            let expr = capture
                .get(1)
                .expect("capture 1 always present")
                .as_str()
                .trim();
            result.push_str(&template[last_end..whole.start()]);
            last_end = whole.end();

            let (path, fallback) = match expr.split_once(":-") {
                Some((path, fallback)) => (path.trim(), Some(fallback)),
                None => (expr, None),
            };

            match context.resolve(path) {
                Some(value) => result.push_str(&value_to_string(value)),
                None => match fallback {
                    Some(fallback) => result.push_str(fallback),
                    None if self.strict => {
                        debug!(
                            "template variable '{}' not found; available: [{}]",
                            path,
                            context.keys().collect::<Vec<_>>().join(", ")
                        );
                        return Err(TemplateError::Unresolved {
                            name: path.to_string(),
                        });
                    }
                    None => result.push_str(whole.as_str()),
                },
            }
        }

        result.push_str(&template[last_end..]);
        Ok(result)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
