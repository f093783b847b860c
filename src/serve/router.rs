//! Route patterns.
//!
//! Patterns are `/`-separated segments:
//! - `users` matches literally
//! - `:id` captures one segment
//! - `*rest` captures everything that remains (with a leading `/`), and must
//!   be the last segment
//!
//! Child patterns are written relative to their parent and joined at mount
//! time; an empty or `/` child pattern is an index route.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::error::BindError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Splat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, BindError> {
        let mut segments = Vec::new();
        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();

        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                Segment::Param(capture_name(raw, name)?)
            } else if let Some(name) = part.strip_prefix('*') {
                if i + 1 != parts.len() {
                    return Err(BindError::invalid_pattern(raw, "splat must be the last segment"));
                }
                Segment::Splat(capture_name(raw, name)?)
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// Append a relative child pattern.
    pub fn join(&self, child: &Pattern) -> Result<Pattern, BindError> {
        if matches!(self.segments.last(), Some(Segment::Splat(_))) && !child.is_index() {
            return Err(BindError::invalid_pattern(
                child.to_string(),
                format!("cannot nest under splat route '{}'", self),
            ));
        }
        let mut segments = self.segments.clone();
        segments.extend(child.segments.iter().cloned());
        Ok(Self { segments })
    }

    pub fn is_index(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn splat_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Splat(_)))
            .count()
    }

    /// Match `path`, returning the captured parameters.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Splat(name) => {
                    let rest = format!("/{}", parts.get(i..).unwrap_or_default().join("/"));
                    params.insert(name.clone(), rest);
                    return Some(params);
                }
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(i)?;
                    let decoded = urlencoding::decode(value)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string());
                    params.insert(name.clone(), decoded);
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

fn capture_name(raw: &str, name: &str) -> Result<String, BindError> {
    if name.is_empty() {
        return Err(BindError::invalid_pattern(raw, "capture needs a name"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BindError::invalid_pattern(
            raw,
            format!("invalid capture name '{}'", name),
        ));
    }
    Ok(name.to_string())
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => write!(f, "/{}", s)?,
                Segment::Param(s) => write!(f, "/:{}", s)?,
                Segment::Splat(s) => write!(f, "/*{}", s)?,
            }
        }
        Ok(())
    }
}

/// Routing precedence: more literal segments, then fewer splats, then the
/// deeper node. `Less` sorts first.
pub fn specificity(a: (&Pattern, usize), b: (&Pattern, usize)) -> Ordering {
    b.0.literal_count()
        .cmp(&a.0.literal_count())
        .then_with(|| a.0.splat_count().cmp(&b.0.splat_count()))
        .then_with(|| b.1.cmp(&a.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> Pattern {
        Pattern::parse(raw).unwrap()
    }

    #[test]
    fn test_literal_and_param_matching() {
        let params = p("/users/:id/posts/:post_id").matches("/users/42/posts/7").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["post_id"], "7");
        assert!(p("/users/:id").matches("/users").is_none());
        assert!(p("/users/:id").matches("/users/1/extra").is_none());
        assert!(p("/").matches("/").is_some());
        assert!(p("/about").matches("/about/").is_some());
    }

    #[test]
    fn test_splat_captures_rest() {
        let pat = p("/docs/*path");
        assert_eq!(pat.matches("/docs/guide/intro").unwrap()["path"], "/guide/intro");
        assert_eq!(pat.matches("/docs").unwrap()["path"], "/");
        assert!(pat.matches("/blog/x").is_none());
    }

    #[test]
    fn test_params_are_url_decoded() {
        assert_eq!(p("/tags/:name").matches("/tags/rust%20lang").unwrap()["name"], "rust lang");
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            Pattern::parse("/a/*rest/b"),
            Err(BindError::InvalidPattern { .. })
        ));
        assert!(Pattern::parse("/users/:").is_err());
        assert!(Pattern::parse("/users/:na-me").is_err());
    }

    #[test]
    fn test_join_and_display() {
        let joined = p("/admin").join(&p(":section")).unwrap();
        assert_eq!(joined.to_string(), "/admin/:section");
        assert_eq!(p("/admin").join(&p("/")).unwrap(), p("/admin"));
        assert!(p("/files/*rest").join(&p("x")).is_err());
    }

    #[test]
    fn test_specificity_order() {
        let mut routes = vec![(p("/users/*rest"), 1), (p("/users/:id"), 1), (p("/users/new"), 1)];
        routes.sort_by(|a, b| specificity((&a.0, a.1), (&b.0, b.1)));
        let order: Vec<String> = routes.iter().map(|(pat, _)| pat.to_string()).collect();
        assert_eq!(order, vec!["/users/new", "/users/:id", "/users/*rest"]);

        // Same pattern: the deeper node wins.
        assert_eq!(specificity((&p("/"), 2), (&p("/"), 1)), Ordering::Less);
    }
}
