//! Tree path parsing.
//!
//! Paths are absolute, `/`-separated, with two decorations:
//! - a final `@name` token addresses an attribute of the resolved node;
//! - a `&` suffix on a segment suppresses link redirection for that node.
//!
//! `/` alone addresses the root. Empty segments are rejected.

use arbor_types::{ArborResult, resolve_error};

/// One resolved step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    /// Trailing `&`: resolve the node itself even if it is a link.
    pub suppress_redirect: bool,
}

/// A parsed absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPath {
    pub segments: Vec<PathSegment>,
    /// Set when the path ends in `@name`.
    pub attribute: Option<String>,
}

impl ParsedPath {
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

pub fn parse_path(path: &str) -> ArborResult<ParsedPath> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(resolve_error(path, format!("path {path:?} is not absolute")));
    };

    let mut parsed = ParsedPath::default();
    if rest.is_empty() {
        return Ok(parsed);
    }

    for token in rest.split('/') {
        if parsed.attribute.is_some() {
            return Err(resolve_error(
                path,
                format!("unexpected token after attribute reference in {path:?}"),
            ));
        }
        if token.is_empty() {
            return Err(resolve_error(path, format!("empty segment in path {path:?}")));
        }

        if let Some(attribute) = token.strip_prefix('@') {
            if attribute.is_empty() {
                return Err(resolve_error(path, format!("empty attribute name in {path:?}")));
            }
            parsed.attribute = Some(attribute.to_string());
            continue;
        }

        let (name, suppress_redirect) = match token.strip_suffix('&') {
            Some(stripped) => (stripped, true),
            None => (token, false),
        };
        if name.is_empty() || name.contains('@') || name.contains('&') {
            return Err(resolve_error(path, format!("malformed segment {token:?} in {path:?}")));
        }
        parsed.segments.push(PathSegment {
            name: name.to_string(),
            suppress_redirect,
        });
    }

    Ok(parsed)
}

/// Joins an absolute prefix with a relative remainder.
pub fn join_paths(base: &str, remainder: &str) -> String {
    if remainder.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    let remainder = remainder.trim_start_matches('/');
    if base.is_empty() {
        format!("/{remainder}")
    } else {
        format!("{base}/{remainder}")
    }
}
