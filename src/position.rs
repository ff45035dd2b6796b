use serde::{Deserialize, Serialize};
use std::fmt;

/// A JSON-pointer position identifying a node inside a workflow document.
///
/// The root node is the empty pointer `""`; every other node appends
/// `/`-separated segments following the DSL layout, e.g.
/// `/do/0/greet`, `/do/1/guard/try/0/fetch`, `/fork/branches/0/left`.
///
/// Positions are the arena key for the node tree, the `p` field of the wire
/// envelope, the keys of its `s` map, and the `instance` field of workflow
/// errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPointer(String);

impl JsonPointer {
    /// The root position (empty pointer).
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one segment. Segments are validated upstream to never contain
    /// `/` (task names with slashes are rejected at compile time).
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0, segment))
    }

    /// Append an index segment, as used for `do` and `branches` lists.
    #[must_use]
    pub fn indexed(&self, index: usize) -> Self {
        Self(format!("{}/{}", self.0, index))
    }

    /// The parent pointer, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0.get(..idx).unwrap_or_default().to_string())),
            None => None,
        }
    }

    /// The trailing segment, or `None` for the root.
    #[must_use]
    pub fn last_segment(&self) -> Option<&str> {
        if self.0.is_empty() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `self` is `ancestor` itself or lies underneath it.
    #[must_use]
    pub fn is_within(&self, ancestor: &Self) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self == ancestor
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for JsonPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JsonPointer {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JsonPointer {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(JsonPointer::root().parent(), None);
        assert!(JsonPointer::root().is_root());
    }

    #[test]
    fn test_child_and_parent_round_trip() {
        let p = JsonPointer::root().child("do").indexed(0).child("greet");
        assert_eq!(p.as_str(), "/do/0/greet");
        assert_eq!(p.last_segment(), Some("greet"));
        assert_eq!(p.parent().unwrap().as_str(), "/do/0");
        assert_eq!(
            p.parent().unwrap().parent().unwrap().parent().unwrap(),
            JsonPointer::root()
        );
    }

    #[test]
    fn test_is_within() {
        let try_pos = JsonPointer::from("/do/0/guard/try");
        let inner = JsonPointer::from("/do/0/guard/try/0/fetch");
        let sibling = JsonPointer::from("/do/0/guard/tryX");
        assert!(inner.is_within(&try_pos));
        assert!(try_pos.is_within(&try_pos));
        assert!(!sibling.is_within(&try_pos));
        assert!(inner.is_within(&JsonPointer::root()));
    }

    #[test]
    fn test_serde_as_plain_string() {
        let p = JsonPointer::from("/do/0/greet");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"/do/0/greet\"");
        let back: JsonPointer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
