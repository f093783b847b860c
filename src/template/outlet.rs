//! Static outlet analysis.
//!
//! Runs once when a template is compiled. The result is constant for the life
//! of the template, so rendering never searches for the insertion point.

use crate::error::TemplateError;
use crate::template::parser::TemplateNode;

/// Where a template embeds its child route's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutletMarker {
    pub present: bool,
    /// Byte offset of the outlet tag in the template source.
    pub offset: usize,
    /// Width of the outlet tag in bytes.
    pub len: usize,
}

impl OutletMarker {
    pub const ABSENT: OutletMarker = OutletMarker {
        present: false,
        offset: 0,
        len: 0,
    };
}

/// Find the single outlet in a parsed template.
///
/// Nested blocks are searched too; a second outlet anywhere is an error.
pub fn analyze(nodes: &[TemplateNode]) -> Result<OutletMarker, TemplateError> {
    let mut marker = OutletMarker::ABSENT;
    walk(nodes, &mut marker)?;
    Ok(marker)
}

fn walk(nodes: &[TemplateNode], marker: &mut OutletMarker) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            TemplateNode::Outlet { offset, len, .. } => {
                if marker.present {
                    return Err(TemplateError::DuplicateOutlet {
                        first: marker.offset,
                        second: *offset,
                    });
                }
                *marker = OutletMarker {
                    present: true,
                    offset: *offset,
                    len: *len,
                };
            }
            TemplateNode::If {
                body, else_body, ..
            } => {
                walk(body, marker)?;
                if let Some(else_nodes) = else_body {
                    walk(else_nodes, marker)?;
                }
            }
            TemplateNode::For { body, .. } => walk(body, marker)?,
            TemplateNode::Literal(_) | TemplateNode::Output { .. } => {}
        }
    }
    Ok(())
}
