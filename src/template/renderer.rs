//! Template renderer that executes the template AST against a JSON context.
//!
//! Writes directly into a pooled output buffer; loop variables live on a scope
//! stack that is reused between renders.

use serde_json::Value;

use crate::error::TemplateError;
use crate::template::helpers::call_method;
use crate::template::parser::{CompareOp, Expr, TemplateNode};

/// Reusable per-render state: output buffer and loop scope stack.
#[derive(Debug, Default)]
pub struct RenderScratch {
    output: String,
    scopes: Vec<(String, Value)>,
}

impl RenderScratch {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            output: String::with_capacity(bytes),
            scopes: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.output.clear();
        self.scopes.clear();
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

/// Render nodes into `scratch`, substituting `outlet` at the outlet node.
pub fn render_into(
    nodes: &[TemplateNode],
    root: &Value,
    outlet: Option<&str>,
    scratch: &mut RenderScratch,
) -> Result<(), TemplateError> {
    let RenderScratch { output, scopes } = scratch;
    let mut render = Render {
        root,
        outlet: outlet.unwrap_or(""),
        scopes,
    };
    render.nodes(nodes, output)
}

struct Render<'a> {
    root: &'a Value,
    outlet: &'a str,
    scopes: &'a mut Vec<(String, Value)>,
}

impl Render<'_> {
    fn nodes(&mut self, nodes: &[TemplateNode], out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                TemplateNode::Literal(s) => out.push_str(s),
                TemplateNode::Outlet { .. } => out.push_str(self.outlet),
                TemplateNode::Output {
                    expr,
                    escaped,
                    line,
                } => {
                    let value = self.eval(expr).map_err(|e| at_line(e, *line))?;
                    let text = value_to_string(&value);
                    if *escaped {
                        html_escape_into(&text, out);
                    } else {
                        out.push_str(&text);
                    }
                }
                TemplateNode::If {
                    condition,
                    body,
                    else_body,
                    line,
                } => {
                    let cond = self.eval(condition).map_err(|e| at_line(e, *line))?;
                    if is_truthy(&cond) {
                        self.nodes(body, out)?;
                    } else if let Some(else_nodes) = else_body {
                        self.nodes(else_nodes, out)?;
                    }
                }
                TemplateNode::For {
                    var,
                    index_var,
                    iterable,
                    body,
                    line,
                } => {
                    let items = match self.eval(iterable).map_err(|e| at_line(e, *line))? {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        Value::Object(map) => map
                            .into_iter()
                            .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
                            .collect(),
                        other => {
                            return Err(at_line(
                                format!("Cannot iterate over {}", type_name(&other)),
                                *line,
                            ))
                        }
                    };

                    let depth = self.scopes.len();
                    for (i, item) in items.into_iter().enumerate() {
                        self.scopes.truncate(depth);
                        self.scopes.push((var.clone(), item));
                        if let Some(idx) = index_var {
                            self.scopes.push((idx.clone(), Value::from(i)));
                        }
                        self.nodes(body, out)?;
                    }
                    self.scopes.truncate(depth);
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Value {
        if let Some((_, v)) = self.scopes.iter().rev().find(|(n, _)| n == name) {
            return v.clone();
        }
        self.root.get(name).cloned().unwrap_or(Value::Null)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, String> {
        Ok(match expr {
            Expr::StringLit(s) => Value::String(s.clone()),
            Expr::IntLit(n) => Value::from(*n),
            Expr::FloatLit(n) => Value::from(*n),
            Expr::BoolLit(b) => Value::Bool(*b),
            Expr::Null => Value::Null,
            Expr::Var(name) if name == "self" || name == "." => self.root.clone(),
            Expr::Var(name) => self.lookup(name),
            Expr::Field(base, field) => self.eval(base)?.get(field).cloned().unwrap_or(Value::Null),
            Expr::Index(base, key) => {
                let base = self.eval(base)?;
                match self.eval(key)? {
                    Value::String(k) => base.get(&k).cloned().unwrap_or(Value::Null),
                    Value::Number(n) => n
                        .as_u64()
                        .and_then(|i| base.get(i as usize).cloned())
                        .unwrap_or(Value::Null),
                    other => return Err(format!("Cannot index with {}", type_name(&other))),
                }
            }
            Expr::Compare(left, op, right) => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                Value::Bool(compare(&l, *op, &r)?)
            }
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if is_truthy(&l) {
                    self.eval(right)?
                } else {
                    l
                }
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if is_truthy(&l) {
                    l
                } else {
                    self.eval(right)?
                }
            }
            Expr::Not(inner) => Value::Bool(!is_truthy(&self.eval(inner)?)),
            Expr::Method(base, name) => call_method(&self.eval(base)?, name)?,
        })
    }
}

fn at_line(message: String, line: usize) -> TemplateError {
    TemplateError::render(format!("{} at line {}", message, line))
}

fn compare(l: &Value, op: CompareOp, r: &Value) -> Result<bool, String> {
    if let CompareOp::Eq | CompareOp::Ne = op {
        let equal = match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => l == r,
        };
        return Ok(if op == CompareOp::Eq { equal } else { !equal });
    }

    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            _ => {
                return Err(format!(
                    "Cannot compare {} and {}",
                    type_name(l),
                    type_name(r)
                ))
            }
        },
    };

    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
    })
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    }
}

#[inline]
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Escape HTML special characters into `out`.
pub fn html_escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
}

/// Escape HTML special characters.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    html_escape_into(s, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse_template;
    use serde_json::json;

    fn render(source: &str, ctx: Value, outlet: Option<&str>) -> String {
        let nodes = parse_template(source).unwrap();
        let mut scratch = RenderScratch::default();
        render_into(&nodes, &ctx, outlet, &mut scratch).unwrap();
        scratch.output().to_string()
    }

    #[test]
    fn test_escaped_and_raw_output() {
        let ctx = json!({"html": "<b>&</b>"});
        assert_eq!(
            render("<%= html %>|<%- html %>", ctx, None),
            "&lt;b&gt;&amp;&lt;/b&gt;|<b>&</b>"
        );
    }

    #[test]
    fn test_outlet_substitution_and_placeholder() {
        let src = "<div><%= outlet %></div>";
        assert_eq!(render(src, Value::Null, Some("<span>x</span>")), "<div><span>x</span></div>");
        assert_eq!(render(src, Value::Null, None), "<div></div>");
    }

    #[test]
    fn test_for_loop_with_index_and_nested_fields() {
        let ctx = json!({"users": [{"name": "ann"}, {"name": "bob"}]});
        assert_eq!(
            render("<% for u, i in users %><%= i %>:<%= u.name %> <% end %>", ctx, None),
            "0:ann 1:bob "
        );
    }

    #[test]
    fn test_conditionals_and_comparisons() {
        let ctx = json!({"count": 3, "name": "x"});
        assert_eq!(
            render("<% if count > 2 && name == \"x\" %>big<% else %>small<% end %>", ctx, None),
            "big"
        );
        assert_eq!(
            render("<% if missing %>yes<% elsif count <= 3 %>mid<% end %>", json!({"count": 3}), None),
            "mid"
        );
    }

    #[test]
    fn test_missing_values_render_empty() {
        assert_eq!(render("[<%= a.b.c %>]", json!({}), None), "[]");
    }

    #[test]
    fn test_compare_type_error_reports_line() {
        let nodes = parse_template("\n<% if items > 1 %>x<% end %>").unwrap();
        let mut scratch = RenderScratch::default();
        let err = render_into(&nodes, &json!({"items": []}), None, &mut scratch).unwrap_err();
        assert_eq!(
            err,
            TemplateError::render("Cannot compare array and number at line 2")
        );
    }

    #[test]
    fn test_scopes_do_not_leak_between_loops() {
        let ctx = json!({"a": [1], "item": "root"});
        assert_eq!(
            render("<% for item in a %><%= item %><% end %><%= item %>", ctx, None),
            "1root"
        );
    }
}
