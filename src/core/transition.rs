//! Hierarchical transition names.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator used when joining segments into a key.
pub const DELIMITER: &str = "/";

/// Trailing segment that widens an abort to every descendant.
pub const NESTED_MARKER: &str = "*";

/// Prefix of generated sub-branch segments.
pub const SUB_BRANCH_PREFIX: char = '~';

/// Reserved transition that construction failures are attributed to.
pub const BOOTSTRAP: &str = "@@bootstrap";

/// A named, possibly hierarchical unit of work.
///
/// Segments are joined with [`DELIMITER`] to form the string key used by
/// every transition-keyed registry. The transition `["a", "b", "c"]` has the
/// ancestors `["a"]`, `["a", "b"]` and `["a", "b", "c"]`.
///
/// # Example
///
/// ```rust
/// use transit::core::Transition;
///
/// let t = Transition::new(["save", "user"]);
/// assert_eq!(t.key(), "save/user");
/// assert_eq!(t.ancestor_keys(), vec!["save", "save/user"]);
/// assert!(Transition::from("save").is_ancestor_of(&t));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Transition(Vec<String>);

impl Transition {
    /// Build a transition from any primitive-printable segments.
    pub fn new<I, T>(segments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        Self(segments.into_iter().map(|s| s.to_string()).collect())
    }

    /// Parse a joined key back into segments.
    pub fn from_key(key: &str) -> Self {
        if key.is_empty() {
            return Self(Vec::new());
        }
        Self(key.split(DELIMITER).map(str::to_string).collect())
    }

    /// The reserved transition construction errors are attributed to.
    pub fn bootstrap() -> Self {
        Self(vec![BOOTSTRAP.to_string()])
    }

    /// A fresh top-level transition for work dispatched without a name.
    pub fn ephemeral() -> Self {
        Self(vec![generated_segment()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Segments joined with [`DELIMITER`].
    pub fn key(&self) -> String {
        self.0.join(DELIMITER)
    }

    /// Every prefix of this transition, shortest first, including itself.
    pub fn ancestors(&self) -> Vec<Transition> {
        (1..=self.0.len())
            .map(|len| Transition(self.0[..len].to_vec()))
            .collect()
    }

    /// Keys of [`ancestors`](Self::ancestors), shortest first.
    pub fn ancestor_keys(&self) -> Vec<String> {
        (1..=self.0.len())
            .map(|len| self.0[..len].join(DELIMITER))
            .collect()
    }

    pub fn parent(&self) -> Option<Transition> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Transition(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child<T: ToString>(&self, segment: T) -> Transition {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Transition(segments)
    }

    /// A uniquely suffixed child used to isolate asynchronous continuations.
    pub fn sub_branch(&self) -> Transition {
        self.child(generated_segment())
    }

    /// Whether the last segment was generated by [`sub_branch`](Self::sub_branch)
    /// or [`ephemeral`](Self::ephemeral).
    pub fn is_sub_branch(&self) -> bool {
        self.0
            .last()
            .is_some_and(|s| s.starts_with(SUB_BRANCH_PREFIX))
    }

    /// This transition with the [`NESTED_MARKER`] appended.
    pub fn nested(&self) -> Transition {
        self.child(NESTED_MARKER)
    }

    pub fn is_nested(&self) -> bool {
        self.0.last().is_some_and(|s| s == NESTED_MARKER)
    }

    /// Strip a trailing [`NESTED_MARKER`], if any.
    pub fn without_nested_marker(&self) -> Transition {
        if self.is_nested() {
            Transition(self.0[..self.0.len() - 1].to_vec())
        } else {
            self.clone()
        }
    }

    /// Prefix test, inclusive: a transition is its own ancestor.
    pub fn is_ancestor_of(&self, other: &Transition) -> bool {
        !self.0.is_empty() && other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

/// Key-level prefix test matching [`Transition::is_ancestor_of`].
pub fn key_is_ancestor_of(ancestor: &str, key: &str) -> bool {
    key == ancestor
        || (key.len() > ancestor.len()
            && key.starts_with(ancestor)
            && key[ancestor.len()..].starts_with(DELIMITER))
}

fn generated_segment() -> String {
    format!("{}{}", SUB_BRANCH_PREFIX, Uuid::new_v4().simple())
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<&str> for Transition {
    fn from(segment: &str) -> Self {
        Self(vec![segment.to_string()])
    }
}

impl From<String> for Transition {
    fn from(segment: String) -> Self {
        Self(vec![segment])
    }
}

impl<T: ToString, const N: usize> From<[T; N]> for Transition {
    fn from(segments: [T; N]) -> Self {
        Self::new(segments)
    }
}

impl<T: ToString> From<Vec<T>> for Transition {
    fn from(segments: Vec<T>) -> Self {
        Self::new(segments)
    }
}
