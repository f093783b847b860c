//! ERB-style template engine used for template-backed renderers.
//!
//! Supports:
//! - `<%= expr %>` - HTML-escaped output
//! - `<%- expr %>` - Raw/unescaped output (no HTML escaping)
//! - `<% if/elsif/else/for/end %>` - Control flow
//! - `<%= outlet %>` - Where a nested route's output is spliced in
//!
//! Expressions are evaluated against a `serde_json::Value` context, so any
//! `Serialize` view model can drive a template.

pub mod helpers;
pub mod outlet;
pub mod parser;
pub mod renderer;

use std::sync::Arc;

use serde_json::Value;

use crate::error::TemplateError;
use crate::serve::pool::Pool;

pub use outlet::OutletMarker;
pub use renderer::{html_escape, RenderScratch};

/// Initial capacity of pooled output buffers.
const SCRATCH_BYTES: usize = 4096;

/// Default number of idle render contexts kept around.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Compiles templates that share one pool of render contexts.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    scratch: Arc<Pool<RenderScratch>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl TemplateEngine {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            scratch: Arc::new(Pool::new(pool_capacity, || {
                Ok(RenderScratch::with_capacity(SCRATCH_BYTES))
            })),
        }
    }

    /// Parse `source` and locate its outlet.
    pub fn compile(&self, name: &str, source: &str) -> Result<Template, TemplateError> {
        let nodes = parser::parse_template(source)?;
        let outlet = outlet::analyze(&nodes)?;
        Ok(Template {
            name: name.to_string(),
            nodes,
            outlet,
            scratch: Arc::clone(&self.scratch),
        })
    }

    pub fn pool(&self) -> &Arc<Pool<RenderScratch>> {
        &self.scratch
    }
}

/// A compiled template with its statically located outlet.
#[derive(Debug)]
pub struct Template {
    name: String,
    nodes: Vec<parser::TemplateNode>,
    outlet: OutletMarker,
    scratch: Arc<Pool<RenderScratch>>,
}

impl Template {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outlet(&self) -> OutletMarker {
        self.outlet
    }

    /// Render against `context`. `child` replaces the outlet; without it the
    /// outlet renders as an empty placeholder.
    pub fn render(&self, context: &Value, child: Option<&str>) -> Result<String, TemplateError> {
        let mut scratch = self
            .scratch
            .acquire()
            .map_err(|e| TemplateError::render(e.to_string()))?;
        scratch.reset();
        renderer::render_into(&self.nodes, context, child, &mut scratch)
            .map_err(|e| TemplateError::render(format!("{} in {}", e, self.name)))?;
        Ok(scratch.output().to_string())
    }
}
