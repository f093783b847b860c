//! ERB-style template parser.
//!
//! Parses templates with syntax like:
//! - `<%= expr %>` - HTML-escaped output
//! - `<%- expr %>` - Raw/unescaped output
//! - `<% code %>` - Control flow (if, elsif, else, for, end)
//! - `<%= outlet %>` - Insertion point for a nested route's rendered output
//!
//! Every tag keeps its byte offset and width in the source so the outlet can
//! be located without re-scanning the text at render time.

use crate::error::TemplateError;

/// Reserved identifier marking the child insertion point.
pub const OUTLET_IDENT: &str = "outlet";

/// Pre-compiled expression for fast evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    StringLit(String),
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    Null,
    /// Variable lookup: scopes first, then the root context
    Var(String),
    /// Field access: expr.field
    Field(Box<Expr>, String),
    /// Index access: expr[key]
    Index(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Built-in property such as `items.length` or `name.upcase`
    Method(Box<Expr>, String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A node in the template AST.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Literal(String),
    Output {
        expr: Expr,
        escaped: bool,
        line: usize,
    },
    If {
        condition: Expr,
        body: Vec<TemplateNode>,
        else_body: Option<Vec<TemplateNode>>,
        line: usize,
    },
    For {
        var: String,
        index_var: Option<String>,
        iterable: Expr,
        body: Vec<TemplateNode>,
        line: usize,
    },
    /// Child insertion point; `offset`/`len` cover the whole `<%= outlet %>` tag.
    Outlet { offset: usize, len: usize, line: usize },
}

/// Location of a tag in the template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    offset: usize,
    len: usize,
    line: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    /// `<%= ... %>` (escaped) or `<%- ... %>` (raw)
    Output { code: String, raw: bool, tag: Tag },
    /// `<% ... %>`
    Code { code: String, tag: Tag },
}

/// Parse an ERB-style template into an AST.
pub fn parse_template(source: &str) -> Result<Vec<TemplateNode>, TemplateError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let (nodes, terminator) = parser.parse_block()?;
    match terminator {
        None => Ok(nodes),
        Some((code, line)) => Err(TemplateError::syntax(
            format!("Unexpected '{}' outside of block", code),
            line,
        )),
    }
}

/// Split the source into literal text and tags, recording byte spans.
fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut line = 1;
    let mut rest = source;
    let mut consumed = 0;

    while let Some(open) = rest.find("<%") {
        let tag_offset = consumed + open;
        if open > 0 {
            let text = &source[literal_start..tag_offset];
            line += text.matches('\n').count();
            tokens.push(Token::Literal(text.to_string()));
        }

        let after_open = &source[tag_offset + 2..];
        let (kind, body_start) = match after_open.as_bytes().first() {
            Some(b'=') => (Some(false), 1),
            Some(b'-') => (Some(true), 1),
            _ => (None, 0),
        };
        let body = &after_open[body_start..];
        let close = body
            .find("%>")
            .ok_or_else(|| TemplateError::syntax("Unclosed template tag", line))?;

        let code = body[..close].trim().to_string();
        let len = 2 + body_start + close + 2;
        let tag = Tag {
            offset: tag_offset,
            len,
            line,
        };
        line += source[tag_offset..tag_offset + len].matches('\n').count();

        tokens.push(match kind {
            Some(raw) => Token::Output { code, raw, tag },
            None => Token::Code { code, tag },
        });

        consumed = tag_offset + len;
        literal_start = consumed;
        rest = &source[consumed..];
    }

    if literal_start < source.len() {
        tokens.push(Token::Literal(source[literal_start..].to_string()));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Parse nodes until end of input or a block keyword (`end`, `else`,
    /// `elsif ...`). The keyword is returned so the caller can decide.
    fn parse_block(&mut self) -> Result<(Vec<TemplateNode>, Option<(String, usize)>), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            match token {
                Token::Literal(s) => nodes.push(TemplateNode::Literal(s)),
                Token::Output { code, raw, tag } => {
                    if code == OUTLET_IDENT {
                        nodes.push(TemplateNode::Outlet {
                            offset: tag.offset,
                            len: tag.len,
                            line: tag.line,
                        });
                    } else {
                        nodes.push(TemplateNode::Output {
                            expr: compile_expr(&code),
                            escaped: !raw,
                            line: tag.line,
                        });
                    }
                }
                Token::Code { code, tag } => {
                    if code == "end" || code == "else" || code.starts_with("elsif ") {
                        return Ok((nodes, Some((code, tag.line))));
                    } else if let Some(cond) = code.strip_prefix("if ") {
                        nodes.push(self.parse_if(compile_expr(cond), tag.line)?);
                    } else if let Some(header) = code.strip_prefix("for ") {
                        nodes.push(self.parse_for(header, tag.line)?);
                    }
                    // Anything else is a statement with no output; templates stay side-effect free.
                }
            }
        }

        Ok((nodes, None))
    }

    fn parse_if(&mut self, condition: Expr, line: usize) -> Result<TemplateNode, TemplateError> {
        let (body, terminator) = self.parse_block()?;
        let else_body = match terminator {
            Some((code, _)) if code == "end" => None,
            Some((code, _)) if code == "else" => {
                let (else_nodes, terminator) = self.parse_block()?;
                match terminator {
                    Some((code, _)) if code == "end" => Some(else_nodes),
                    _ => return Err(TemplateError::syntax("Unclosed else block - missing 'end'", line)),
                }
            }
            Some((code, elsif_line)) => {
                // `elsif` nests a new if in the else branch; it consumes the shared `end`.
                let cond = compile_expr(code.trim_start_matches("elsif "));
                Some(vec![self.parse_if(cond, elsif_line)?])
            }
            None => return Err(TemplateError::syntax("Unclosed if block - missing 'end'", line)),
        };

        Ok(TemplateNode::If {
            condition,
            body,
            else_body,
            line,
        })
    }

    fn parse_for(&mut self, header: &str, line: usize) -> Result<TemplateNode, TemplateError> {
        let (var, index_var, iterable) = parse_for_header(header, line)?;
        let (body, terminator) = self.parse_block()?;
        match terminator {
            Some((code, _)) if code == "end" => Ok(TemplateNode::For {
                var,
                index_var,
                iterable,
                body,
                line,
            }),
            Some((code, other_line)) => Err(TemplateError::syntax(
                format!("Unexpected '{}' inside for block", code),
                other_line,
            )),
            None => Err(TemplateError::syntax("Unclosed for block - missing 'end'", line)),
        }
    }
}

/// Parse "item in items", "(item in items)" or "item, i in items".
fn parse_for_header(s: &str, line: usize) -> Result<(String, Option<String>, Expr), TemplateError> {
    let s = s.trim().trim_start_matches('(').trim_end_matches(')').trim();

    let Some(pos) = s.find(" in ") else {
        return Err(TemplateError::syntax(
            format!("Invalid for statement: expected 'var in iterable', got '{}'", s),
            line,
        ));
    };

    let vars = s[..pos].trim();
    let iterable = s[pos + 4..].trim();
    if vars.is_empty() {
        return Err(TemplateError::syntax("Missing loop variable in for statement", line));
    }
    if iterable.is_empty() {
        return Err(TemplateError::syntax("Missing iterable in for statement", line));
    }

    let (var, index_var) = match vars.split_once(',') {
        Some((v, i)) => (v.trim().to_string(), Some(i.trim().to_string())),
        None => (vars.to_string(), None),
    };

    Ok((var, index_var, compile_expr(iterable)))
}

/// Compile an expression string into a pre-compiled Expr AST.
pub fn compile_expr(expr: &str) -> Expr {
    let expr = expr.trim();

    if let Some(literal) = string_literal(expr) {
        return Expr::StringLit(literal.to_string());
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Expr::IntLit(n);
    }
    if let Ok(n) = expr.parse::<f64>() {
        return Expr::FloatLit(n);
    }
    match expr {
        "true" => return Expr::BoolLit(true),
        "false" => return Expr::BoolLit(false),
        "null" | "nil" => return Expr::Null,
        _ => {}
    }

    // `||` binds looser than `&&`, so split on it first.
    if let Some(pos) = find_top_level(expr, "||") {
        return Expr::Or(
            Box::new(compile_expr(&expr[..pos])),
            Box::new(compile_expr(&expr[pos + 2..])),
        );
    }
    if let Some(pos) = find_top_level(expr, "&&") {
        return Expr::And(
            Box::new(compile_expr(&expr[..pos])),
            Box::new(compile_expr(&expr[pos + 2..])),
        );
    }

    for (op_str, op) in [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ] {
        if let Some(pos) = find_top_level(expr, op_str) {
            return Expr::Compare(
                Box::new(compile_expr(&expr[..pos])),
                op,
                Box::new(compile_expr(&expr[pos + op_str.len()..])),
            );
        }
    }

    if let Some(inner) = expr.strip_prefix('!') {
        return Expr::Not(Box::new(compile_expr(inner)));
    }

    compile_access(expr)
}

/// The body of `expr` when the whole of it is one quoted string.
fn string_literal(expr: &str) -> Option<&str> {
    let bytes = expr.as_bytes();
    let quote = *bytes.first()?;
    if bytes.len() < 2 || !matches!(quote, b'"' | b'\'') {
        return None;
    }
    let close = (1..bytes.len()).find(|&i| bytes[i] == quote && bytes[i - 1] != b'\\')?;
    (close == bytes.len() - 1).then(|| &expr[1..close])
}

/// Find an operator outside of quotes and brackets.
fn find_top_level(expr: &str, op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;

    for i in 0..bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q && (i == 0 || bytes[i - 1] != b'\\') {
                quote = None;
            }
            continue;
        }
        match c {
            b'"' | b'\'' => quote = Some(c),
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth -= 1,
            _ if depth == 0 && bytes[i..].starts_with(op.as_bytes()) => {
                // `!=` must not be read as `!` followed by `=`, and `<=` not as `<`.
                let is_prefix_of_longer = op.len() == 1
                    && matches!(bytes.get(i + 1), Some(b'='));
                let is_suffix_of_longer =
                    op.len() == 1 && i > 0 && matches!(bytes[i - 1], b'!' | b'=' | b'<' | b'>');
                if !is_prefix_of_longer && !is_suffix_of_longer {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Compile `user`, `user.name`, `user["name"]`, `items[0].title` and friends.
fn compile_access(expr: &str) -> Expr {
    let end = expr.find(|c| c == '.' || c == '[').unwrap_or(expr.len());

    let mut current = Expr::Var(expr[..end].trim().to_string());
    let mut rest = &expr[end..];

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let stop = after_dot
                .find(|c| c == '.' || c == '[')
                .unwrap_or(after_dot.len());
            let name = after_dot[..stop].trim();
            current = match name {
                "length" | "len" | "size" | "first" | "last" | "empty" | "upcase"
                | "downcase" | "keys" => Expr::Method(Box::new(current), name.to_string()),
                _ => Expr::Field(Box::new(current), name.to_string()),
            };
            rest = &after_dot[stop..];
        } else if rest.starts_with('[') {
            let Some(close) = matching_bracket(rest) else {
                break;
            };
            let key = compile_expr(&rest[1..close]);
            current = Expr::Index(Box::new(current), Box::new(key));
            rest = &rest[close + 1..];
        } else {
            break;
        }
    }

    current
}

/// Byte index of the bracket closing the one at position 0.
fn matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;

    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
