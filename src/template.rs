//! Payload and response templating
//!
//! Steps describe request bodies as Jinja-style templates rendered against
//! the accumulated execution context. The supported surface is deliberately
//! small: dotted paths (`a.b.c`), integer indexing (`a.0`, `a[0]`), list
//! slicing, and the `tojson` and `length` filters. A missing path is a
//! rendering error, never a silent empty string.

use crate::error::{FlowError, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

/// Renders templates against a JSON context with strict undefined handling.
#[derive(Debug)]
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render `template` against `context`, producing a string.
    ///
    /// The caller decides whether to parse the result as JSON.
    pub fn render(&self, step: &str, template: &str, context: &Value) -> Result<String> {
        self.env
            .render_str(template, context)
            .map_err(|e| FlowError::Template {
                step: step.to_string(),
                message: e.to_string(),
            })
    }

    /// Render `template` and parse the result as JSON.
    ///
    /// Render failures and parse failures surface as distinct errors.
    pub fn render_json(&self, step: &str, template: &str, context: &Value) -> Result<Value> {
        let rendered = self.render(step, template, context)?;
        serde_json::from_str(&rendered).map_err(|e| FlowError::TemplateParse {
            step: step.to_string(),
            message: e.to_string(),
        })
    }

    /// Render a template that may or may not produce JSON.
    ///
    /// Used for `response_transform`: if the rendered text looks like a JSON
    /// object or array it is parsed, otherwise the raw string is returned.
    pub fn render_loose(&self, step: &str, template: &str, context: &Value) -> Result<Value> {
        let rendered = self.render(step, template, context)?;
        let trimmed = rendered.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| FlowError::TemplateParse {
                step: step.to_string(),
                message: e.to_string(),
            })
        } else {
            Ok(Value::String(rendered))
        }
    }
}
