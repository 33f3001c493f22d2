//! Property paths.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::GraphError;

/// First segment of every formula pseudo-path.
///
/// `$` cannot start a property name, so a pseudo-path never collides with a
/// real bean path.
pub const FORMULA_PATH_MARKER: &str = "$formula";

/// An immutable, ordered list of property names, e.g. `owner.address.city`.
///
/// Cloning is cheap: segments are shared behind an `Arc`.
///
/// # Examples
///
/// ```
/// # use path_flow::BeanPath;
/// let parent: BeanPath = "b".parse().unwrap();
/// let child: BeanPath = "b.c".parse().unwrap();
/// assert!(parent.is_ancestor_of(&child));
/// assert!(!child.is_ancestor_of(&parent));
/// assert_eq!(child.to_string(), "b.c");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeanPath(Arc<[Arc<str>]>);

impl BeanPath {
    /// Parse a dotted path string.
    pub fn parse(text: &str) -> Result<Self, GraphError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GraphError::InvalidPath(text.to_string()));
        }
        let segments = text
            .split('.')
            .map(|segment| {
                let segment = segment.trim();
                if segment.is_empty() {
                    Err(GraphError::InvalidPath(text.to_string()))
                } else {
                    Ok(Arc::<str>::from(segment))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BeanPath(segments.into()))
    }

    /// Build a path from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<Arc<str>> = segments
            .into_iter()
            .map(|s| Arc::<str>::from(s.as_ref()))
            .collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            let joined = segments
                .iter()
                .map(|s| &**s)
                .collect::<Vec<_>>()
                .join(".");
            return Err(GraphError::InvalidPath(joined));
        }
        Ok(BeanPath(segments.into()))
    }

    /// The pseudo-path under which a formula's result is published.
    pub fn formula(name: &str) -> Self {
        BeanPath(vec![Arc::from(FORMULA_PATH_MARKER), Arc::from(name)].into())
    }

    /// Number of segments (always at least one).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The segment at `depth`.
    pub fn segment(&self, depth: usize) -> &str {
        &self.0[depth]
    }

    /// Iterate over segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(|s| &**s)
    }

    /// The final segment.
    pub fn last(&self) -> &str {
        &self.0[self.0.len() - 1]
    }

    /// The path without its final segment, or `None` for single-segment paths.
    pub fn parent(&self) -> Option<BeanPath> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(BeanPath(self.0[..self.0.len() - 1].into()))
        }
    }

    /// This path extended by one segment.
    pub fn child(&self, segment: &str) -> Result<BeanPath, GraphError> {
        if segment.is_empty() || segment.contains('.') {
            return Err(GraphError::InvalidPath(format!("{self}.{segment}")));
        }
        let mut segments = self.0.to_vec();
        segments.push(Arc::from(segment));
        Ok(BeanPath(segments.into()))
    }

    /// Returns true if `self` is a proper prefix of `other`.
    pub fn is_ancestor_of(&self, other: &BeanPath) -> bool {
        self.0.len() < other.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Returns true if this is a formula pseudo-path.
    pub fn is_formula(&self) -> bool {
        self.0.len() == 2 && &*self.0[0] == FORMULA_PATH_MARKER
    }

    /// The formula name, if this is a formula pseudo-path.
    pub fn formula_name(&self) -> Option<&str> {
        self.is_formula().then(|| &*self.0[1])
    }
}

impl fmt::Display for BeanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BeanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BeanPath({self})")
    }
}

impl FromStr for BeanPath {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BeanPath::parse(s)
    }
}

impl TryFrom<&str> for BeanPath {
    type Error = GraphError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BeanPath::parse(value)
    }
}

impl TryFrom<String> for BeanPath {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BeanPath::parse(&value)
    }
}

/// Anything that names a path: a dotted string or an already-parsed path.
pub trait IntoPath {
    /// Convert into a parsed path.
    fn into_path(self) -> Result<BeanPath, GraphError>;
}

impl IntoPath for BeanPath {
    fn into_path(self) -> Result<BeanPath, GraphError> {
        Ok(self)
    }
}

impl IntoPath for &BeanPath {
    fn into_path(self) -> Result<BeanPath, GraphError> {
        Ok(self.clone())
    }
}

impl IntoPath for &str {
    fn into_path(self) -> Result<BeanPath, GraphError> {
        BeanPath::parse(self)
    }
}

impl IntoPath for String {
    fn into_path(self) -> Result<BeanPath, GraphError> {
        BeanPath::parse(&self)
    }
}

impl IntoPath for &String {
    fn into_path(self) -> Result<BeanPath, GraphError> {
        BeanPath::parse(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = BeanPath::parse("b.c.someString").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.segment(1), "c");
        assert_eq!(path.last(), "someString");
        assert_eq!(path.to_string(), "b.c.someString");
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(matches!(BeanPath::parse(""), Err(GraphError::InvalidPath(_))));
        assert!(matches!(BeanPath::parse("a..b"), Err(GraphError::InvalidPath(_))));
        assert!(matches!(BeanPath::parse("a."), Err(GraphError::InvalidPath(_))));
        assert!(BeanPath::from_segments(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_ancestry() {
        let a = BeanPath::parse("a").unwrap();
        let ab = BeanPath::parse("a.b").unwrap();
        let ac = BeanPath::parse("a.c").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(!ab.is_ancestor_of(&ab));
        assert!(!ab.is_ancestor_of(&ac));
        assert_eq!(ab.parent(), Some(a.clone()));
        assert_eq!(a.parent(), None);
        assert_eq!(a.child("b").unwrap(), ab);
    }

    #[test]
    fn test_formula_paths() {
        let path = BeanPath::formula("total");
        assert!(path.is_formula());
        assert_eq!(path.formula_name(), Some("total"));
        assert_eq!(path.to_string(), "$formula.total");
        assert_eq!(BeanPath::parse("$formula.total").unwrap(), path);
        assert!(!BeanPath::parse("formula.total").unwrap().is_formula());
    }
}
