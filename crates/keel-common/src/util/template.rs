//! A tiny `{{ .Field }}` template language.
//!
//! Templates are parsed before they are executed; rendering fails when a
//! placeholder names a field that is not provided.
use std::collections::HashMap;

use crate::error::{KeelError, KeelResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> KeelResult<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| KeelError::BadRequest(format!("unclosed action in template {:?}", raw)))?;
            let inner = after[..end].trim();
            let field = inner.strip_prefix('.').ok_or_else(|| {
                KeelError::BadRequest(format!("unsupported action {:?} in template", inner))
            })?;
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(KeelError::BadRequest(format!(
                    "invalid field {:?} in template",
                    inner
                )));
            }
            segments.push(Segment::Field(field.to_string()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn execute(&self, values: &HashMap<&str, String>) -> KeelResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Field(f) => {
                    let value = values.get(f.as_str()).ok_or_else(|| {
                        KeelError::BadRequest(format!("field {} is not defined", f))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Renders `raw`, falling back to the raw text when it cannot be parsed or executed.
pub fn render_or_literal(raw: &str, values: &HashMap<&str, String>) -> String {
    match Template::parse(raw).and_then(|t| t.execute(values)) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(template = raw, error = %e, "unable to render template, using it as is");
            raw.to_string()
        }
    }
}
