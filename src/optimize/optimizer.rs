//! Query/modify statement pair for one named tunable.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{OptimizeError, Result};
use crate::session::{Row, Session};
use crate::value::{scalar_text, Params};

/// Literal placeholder for the value being written.
pub const VALUE_PLACEHOLDER: &str = "{value}";

/// Positional bind marker understood by [`Session`].
pub const BIND_MARKER: &str = "?";

/// Optimizers bound to one (component, type), keyed by tunable name.
pub type OptimizerSet = HashMap<String, Arc<Optimizer>>;

/// Name of the optimizer used when a tunable has no dedicated one.
pub const DEFAULT_OPTIMIZER: &str = "default";

/// On-disk shape of one optimizer binding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizerDecl {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub modify: Option<String>,
}

#[derive(Debug)]
struct PreparedModify {
    template: String,
    binds_value: bool,
}

/// Reads and writes the live value of one tunable.
///
/// Templates use `{name}` placeholders filled from call parameters.  In the
/// modify template the value placeholder is turned into a bind marker the
/// first time it is used, so the new value always travels as a bound
/// argument rather than as SQL text.
#[derive(Debug)]
pub struct Optimizer {
    name: String,
    query: Option<String>,
    modify: Option<String>,
    prepared: OnceCell<PreparedModify>,
}

impl Optimizer {
    pub fn new(name: impl Into<String>, query: Option<String>, modify: Option<String>) -> Self {
        Self { name: name.into(), query, modify, prepared: OnceCell::new() }
    }

    pub fn from_decl(name: impl Into<String>, decl: OptimizerDecl) -> Self {
        Self::new(name, decl.query, decl.modify)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query_template(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn modify_template(&self) -> Option<&str> {
        self.modify.as_deref()
    }

    /// Read the current value.
    ///
    /// `Ok(None)` means "unknown": either no query template is configured or
    /// the query returned no row.
    pub fn query(&self, session: &mut dyn Session, params: &Params) -> Result<Option<Row>> {
        let Some(template) = &self.query else {
            return Ok(None);
        };
        let sql = render_template(template, params)?;
        debug!(optimizer = %self.name, sql = %sql, "querying current value");
        session.fetch_one(&sql, &[])
    }

    /// Write `value`.
    ///
    /// Returns `Ok(false)` when no modify template is configured and
    /// `Ok(true)` once the statement ran.
    pub fn modify(&self, session: &mut dyn Session, value: &Value, params: &Params) -> Result<bool> {
        let Some(template) = &self.modify else {
            return Ok(false);
        };
        let prepared = self.prepared.get_or_init(|| prepare_modify(template));
        let sql = render_template(&prepared.template, params)?;
        let args = if prepared.binds_value { vec![value.clone()] } else { Vec::new() };
        debug!(optimizer = %self.name, sql = %sql, "modifying value");
        session
            .execute(&sql, &args)
            .map(|_| true)
            .map_err(|e| OptimizeError::Modify { name: self.name.clone(), reason: e.to_string() })
    }
}

/// Swap the value placeholder (bare or quoted) for the bind marker.
///
/// Brace escapes are copied through untouched so `render_template` still sees
/// them; `{{value}}` stays a literal.
fn prepare_modify(template: &str) -> PreparedModify {
    let quoted = ["'{value}'", "\"{value}\"", VALUE_PLACEHOLDER];
    let mut out = String::with_capacity(template.len());
    let mut binds_value = false;
    let mut rest = template;

    while !rest.is_empty() {
        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..2]);
            rest = &rest[2..];
            continue;
        }
        if let Some(found) = quoted.iter().find(|p| rest.starts_with(**p)) {
            out.push_str(BIND_MARKER);
            rest = &rest[found.len()..];
            binds_value = true;
            continue;
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    PreparedModify { template: out, binds_value }
}

/// Fill `{key}` placeholders from `params`; `{{` and `}}` are literal braces.
pub fn render_template(template: &str, params: &Params) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                let missing = || OptimizeError::Template {
                    template: template.to_string(),
                    key: key.clone(),
                };
                if !closed {
                    return Err(missing());
                }
                let value = params.get(key.trim()).ok_or_else(missing)?;
                out.push_str(&scalar_text(value));
            }
            other => out.push(other),
        }
    }

    Ok(out)
}
