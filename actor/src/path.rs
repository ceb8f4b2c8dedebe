// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor path
//!
//! The `path` module provides the `ActorPath` type, the address under which an actor is
//! registered. Paths are hierarchical: `/table/rows/42` is a child of `/table/rows`, which lets
//! an actor hand out handles for namespaced sub-resources through its lookup hook.
//!
//! Paths order segment by segment, which is the order the pub/sub node uses to fan out.
//!

use serde::{Deserialize, Serialize};

use std::fmt::{Error, Formatter};

#[derive(
    Clone, Default, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ActorPath(Vec<String>);

fn tokens(str: &str) -> impl Iterator<Item = String> + '_ {
    str.split('/')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|s| s.to_owned())
}

impl ActorPath {
    /// The path segments, top level first.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn root(&self) -> Self {
        ActorPath(self.0.iter().take(1).cloned().collect())
    }

    pub fn parent(&self) -> Self {
        let mut tokens = self.0.clone();
        tokens.pop();
        ActorPath(tokens)
    }

    /// The last segment, or an empty string for the root path.
    pub fn key(&self) -> String {
        self.0.last().cloned().unwrap_or_default()
    }

    pub fn level(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_top_level(&self) -> bool {
        self.0.len() == 1
    }

    /// Appends one or more segments.
    pub fn child(&self, name: &str) -> Self {
        let mut keys = self.0.clone();
        keys.extend(tokens(name));
        ActorPath(keys)
    }

    pub fn is_ancestor_of(&self, other: &ActorPath) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    pub fn is_descendant_of(&self, other: &ActorPath) -> bool {
        other.is_ancestor_of(self)
    }

    pub fn is_parent_of(&self, other: &ActorPath) -> bool {
        !other.is_empty() && *self == other.parent()
    }

    pub fn is_child_of(&self, other: &ActorPath) -> bool {
        other.is_parent_of(self)
    }

    /// Segments of `self` below `ancestor`, or `None` when `ancestor` is not an ancestor.
    pub fn relative_to(&self, ancestor: &ActorPath) -> Option<&[String]> {
        if ancestor.is_ancestor_of(self) {
            Some(&self.0[ancestor.level()..])
        } else {
            None
        }
    }
}

impl From<&str> for ActorPath {
    fn from(str: &str) -> Self {
        ActorPath(tokens(str).collect())
    }
}

impl From<String> for ActorPath {
    fn from(string: String) -> Self {
        ActorPath::from(string.as_str())
    }
}

impl From<&String> for ActorPath {
    fn from(string: &String) -> Self {
        ActorPath::from(string.as_str())
    }
}

impl From<&ActorPath> for ActorPath {
    fn from(path: &ActorPath) -> Self {
        path.clone()
    }
}

impl std::ops::Div<&str> for ActorPath {
    type Output = ActorPath;

    fn div(mut self, rhs: &str) -> Self::Output {
        self.0.extend(tokens(rhs));
        self
    }
}

impl std::fmt::Display for ActorPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl std::fmt::Debug for ActorPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn parse_empty_string() {
        let path = ActorPath::from("");
        assert!(path.is_empty());
        assert_eq!(path.to_string(), "/");
    }

    #[test]
    fn parse_without_leading_slash() {
        assert_eq!(ActorPath::from("calc"), ActorPath::from("/calc"));
        assert_eq!(ActorPath::from("a//b/"), ActorPath::from("/a/b"));
    }

    #[test]
    fn parse_three_deep() {
        let path = ActorPath::from("/table/rows/42");
        assert_eq!(path.segments(), ["table", "rows", "42"]);
        assert_eq!(path.level(), 3);
        assert_eq!(path.key(), "42");
        assert_eq!(path.to_string(), "/table/rows/42");
    }

    #[test]
    fn test_root_and_parent() {
        let path = ActorPath::from("/table/rows/42");
        assert_eq!(path.root().to_string(), "/table");
        assert_eq!(path.parent().to_string(), "/table/rows");
        assert_eq!(ActorPath::from("/table").parent().to_string(), "/");
        assert!(path.root().is_top_level());
        assert!(!path.is_top_level());
    }

    #[test]
    fn test_family() {
        let path = ActorPath::from("/table/rows/42");
        let parent = path.parent();
        assert!(parent.is_parent_of(&path));
        assert!(path.is_child_of(&parent));
        assert!(path.root().is_ancestor_of(&path));
        assert!(path.is_descendant_of(&path.root()));
        assert!(!path.is_ancestor_of(&path));
        // Prefix of a segment is not an ancestor.
        assert!(!ActorPath::from("/tab").is_ancestor_of(&path));
    }

    #[test]
    fn test_relative_to() {
        let path = ActorPath::from("/table/rows/42");
        let root = path.root();
        assert_eq!(path.relative_to(&root), Some(&path.segments()[1..]));
        assert_eq!(path.relative_to(&path), None);
    }

    #[test]
    fn test_add_path() {
        let path = ActorPath::from("/topic");
        let child = path.clone() / "consumers/a";
        assert_eq!(child.to_string(), "/topic/consumers/a");
        assert_eq!(path.child("b"), ActorPath::from("/topic/b"));
        assert!(path.is_parent_of(&path.child("b")));
    }

    #[test]
    fn test_ordering_is_by_segment() {
        let mut paths = vec![
            ActorPath::from("/b"),
            ActorPath::from("/a/z"),
            ActorPath::from("/a"),
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![
                ActorPath::from("/a"),
                ActorPath::from("/a/z"),
                ActorPath::from("/b")
            ]
        );
    }
}
