//! Hierarchical object identifiers.
//!
//! An [`Oid`] is a path in the lock hierarchy, e.g. `[db, table, key]`. A
//! lock on a node interacts with locks on its ancestors and descendants, so
//! the lock table needs cheap prefix tests and an ordering under which the
//! descendants of an OID form one contiguous range.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DlmError, DlmResult};

/// An object identifier: a non-empty ordered sequence of opaque tokens.
///
/// Ordering is lexicographic over tokens. Under this ordering every
/// descendant of `p` sorts after `p` and before any non-descendant greater
/// than `p`, so `map.range(p..)` yields `p`'s subtree first.
///
/// # Example
///
/// ```rust
/// use dlm_common::types::Oid;
///
/// let table = Oid::from_strs(&["db", "t1"]).unwrap();
/// let key = Oid::from_strs(&["db", "t1", "k1"]).unwrap();
/// assert!(table.is_prefix_of(&key));
/// assert!(table.overlaps(&key));
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Bytes>", into = "Vec<Bytes>")]
pub struct Oid(Vec<Bytes>);

impl Oid {
    /// Creates an OID from its tokens.
    ///
    /// Returns [`DlmError::EmptyOid`] when `tokens` is empty.
    pub fn new(tokens: Vec<Bytes>) -> DlmResult<Self> {
        if tokens.is_empty() {
            return Err(DlmError::EmptyOid);
        }
        Ok(Self(tokens))
    }

    /// Creates an OID from any iterator of byte-like tokens.
    pub fn from_tokens<I, T>(tokens: I) -> DlmResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::new(tokens.into_iter().map(Into::into).collect())
    }

    /// Creates an OID from string tokens.
    pub fn from_strs(tokens: &[&str]) -> DlmResult<Self> {
        Self::from_tokens(tokens.iter().map(|t| Bytes::copy_from_slice(t.as_bytes())))
    }

    /// Parses a `/`-separated path such as `db/t1/k1`.
    pub fn parse(path: &str) -> DlmResult<Self> {
        Self::from_tokens(
            path.split('/')
                .filter(|t| !t.is_empty())
                .map(|t| Bytes::copy_from_slice(t.as_bytes())),
        )
    }

    /// Returns the tokens.
    #[inline]
    #[must_use]
    pub fn tokens(&self) -> &[Bytes] {
        &self.0
    }

    /// Returns the depth (number of tokens). Always at least one.
    #[inline]
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if `self` equals `other` or is an ancestor of it.
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Oid) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Returns true if either OID is a prefix of the other.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Oid) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Returns the strict ancestors, shortest first.
    pub fn ancestors(&self) -> impl Iterator<Item = Oid> + '_ {
        (1..self.0.len()).map(move |n| Oid(self.0[..n].to_vec()))
    }

    /// Returns the parent, or `None` for a root-level OID.
    #[must_use]
    pub fn parent(&self) -> Option<Oid> {
        if self.0.len() > 1 {
            Some(Oid(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// Returns a child OID with one more token.
    #[must_use]
    pub fn child(&self, token: impl Into<Bytes>) -> Oid {
        let mut tokens = self.0.clone();
        tokens.push(token.into());
        Oid(tokens)
    }
}

impl TryFrom<Vec<Bytes>> for Oid {
    type Error = DlmError;

    fn try_from(tokens: Vec<Bytes>) -> DlmResult<Self> {
        Self::new(tokens)
    }
}

impl From<Oid> for Vec<Bytes> {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", String::from_utf8_lossy(token))?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn oid(path: &str) -> Oid {
        Oid::parse(path).unwrap()
    }

    #[test]
    fn test_empty_oid_rejected() {
        assert!(matches!(Oid::new(Vec::new()), Err(DlmError::EmptyOid)));
        assert!(matches!(Oid::parse(""), Err(DlmError::EmptyOid)));
        assert!(matches!(Oid::from_strs(&[]), Err(DlmError::EmptyOid)));
    }

    #[test]
    fn test_prefix_relation() {
        let db = oid("db");
        let t1 = oid("db/t1");
        let k1 = oid("db/t1/k1");
        let t2 = oid("db/t2");

        assert!(db.is_prefix_of(&k1));
        assert!(t1.is_prefix_of(&t1));
        assert!(!k1.is_prefix_of(&t1));
        assert!(k1.overlaps(&t1));
        assert!(!t1.overlaps(&t2));
        assert!(!oid("db/t").overlaps(&t1));
    }

    #[test]
    fn test_descendants_are_contiguous() {
        let set: BTreeSet<Oid> = ["a", "a/b", "a/b/c", "a/c", "ab", "a/b/d", "b"]
            .iter()
            .map(|p| oid(p))
            .collect();

        let root = oid("a/b");
        let subtree: Vec<String> = set
            .range(root.clone()..)
            .take_while(|k| root.is_prefix_of(k))
            .map(ToString::to_string)
            .collect();

        assert_eq!(subtree, vec!["[a,b]", "[a,b,c]", "[a,b,d]"]);
    }

    #[test]
    fn test_ancestors_and_parent() {
        let k = oid("db/t1/k1");
        let ancestors: Vec<Oid> = k.ancestors().collect();
        assert_eq!(ancestors, vec![oid("db"), oid("db/t1")]);
        assert_eq!(k.parent(), Some(oid("db/t1")));
        assert_eq!(oid("db").parent(), None);
        assert_eq!(oid("db").child("t1"), oid("db/t1"));
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        let ok: Result<Oid, _> = toml::from_str::<Wrapper>("oid = [[100, 98]]").map(|w| w.oid);
        assert_eq!(ok.unwrap(), oid("db"));

        let empty = toml::from_str::<Wrapper>("oid = []");
        assert!(empty.is_err());
    }

    #[derive(Deserialize)]
    struct Wrapper {
        oid: Oid,
    }
}
