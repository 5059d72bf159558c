//! Commit events: the interior nodes of the event graph.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hash::GitHash;
use crate::internal::event::ColorSet;
use crate::internal::event::attribution::Attribution;
use crate::internal::event::fileop::FileOp;
use crate::internal::pathmap::PathMap;

/// A parent edge: either a concrete commit named by mark, or a callout
/// naming an external commit by action stamp (used while a history is
/// split across repositories).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentLink {
    Mark(String),
    Callout(String),
}

impl ParentLink {
    /// The mark, when this edge points inside the repository.
    pub fn mark(&self) -> Option<&str> {
        match self {
            ParentLink::Mark(m) => Some(m),
            ParentLink::Callout(_) => None,
        }
    }

    pub fn is_callout(&self) -> bool {
        matches!(self, ParentLink::Callout(_))
    }
}

/// A commit: branch, comment, attributions, fileops, parent edges and
/// the caches that hang off them.
///
/// Children are a derived projection of parent edges; they are rebuilt
/// by the repository whenever parents change, never edited directly.
#[derive(Debug, Clone)]
pub struct Commit {
    pub mark: String,
    /// Full ref name, e.g. `refs/heads/master`.
    pub branch: String,
    /// Comment bytes; line-ending policy is applied on read and write.
    pub comment: Vec<u8>,
    /// Ordered co-authors; the first is the commit's primary author.
    pub authors: Vec<Attribution>,
    pub committer: Attribution,
    pub fileops: Vec<FileOp>,
    /// Ordered property key/value pairs, emitted only when the output
    /// style supports them.
    pub properties: Vec<(String, Vec<u8>)>,
    pub legacy_id: Option<String>,
    pub original_oid: Option<String>,
    /// Ordered parent edges; `parents[0]` is the manifest-defining
    /// first parent.
    pub parents: Vec<ParentLink>,
    /// Derived: marks of commits listing this one as a parent.
    pub children: Vec<String>,
    /// Memoized full tree state at this commit.
    pub manifest_cache: Option<Arc<PathMap<FileOp>>>,
    pub hash_cache: Option<GitHash>,
    pub color: ColorSet,
    /// Marked for removal by the next delete sweep.
    pub deleteme: bool,
    /// Set by the parser when the first parent was installed from the
    /// branch tip rather than an explicit `from` line. Preserved across
    /// parent edits; the serializer re-checks the other suppression
    /// conditions.
    pub implicit_parent: bool,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.mark == other.mark
    }
}

impl Commit {
    pub fn new(mark: &str, branch: &str, committer: Attribution) -> Commit {
        Commit {
            mark: mark.to_string(),
            branch: branch.to_string(),
            comment: Vec::new(),
            authors: Vec::new(),
            committer,
            fileops: Vec::new(),
            properties: Vec::new(),
            legacy_id: None,
            original_oid: None,
            parents: Vec::new(),
            children: Vec::new(),
            manifest_cache: None,
            hash_cache: None,
            color: ColorSet::default(),
            deleteme: false,
            implicit_parent: false,
        }
    }

    /// First parent edge, the one manifests fold along.
    pub fn first_parent(&self) -> Option<&ParentLink> {
        self.parents.first()
    }

    /// Mark of the first parent when it is a concrete commit.
    pub fn first_parent_mark(&self) -> Option<&str> {
        self.parents.first().and_then(|p| p.mark())
    }

    /// Marks of all concrete (non-callout) parents, in order.
    pub fn parent_marks(&self) -> impl Iterator<Item = &str> {
        self.parents.iter().filter_map(|p| p.mark())
    }

    /// True if `mark` is among this commit's concrete parents.
    pub fn has_parent(&self, mark: &str) -> bool {
        self.parent_marks().any(|m| m == mark)
    }

    /// True for commits with more than one parent edge.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// The attribution used for this commit's action stamp: the first
    /// author when present, the committer otherwise.
    pub fn stamp_attribution(&self) -> &Attribution {
        self.authors.first().unwrap_or(&self.committer)
    }

    /// Action stamp identifying this commit across repositories.
    pub fn action_stamp(&self) -> String {
        self.stamp_attribution().action_stamp()
    }

    /// Drop both caches; call after any mutation that could affect the
    /// manifest or the hash.
    pub fn invalidate_caches(&mut self) {
        self.manifest_cache = None;
        self.hash_cache = None;
    }

    /// True if the commit carries no fileops at all.
    pub fn is_empty(&self) -> bool {
        self.fileops.is_empty()
    }

    /// True if every fileop is a delete (or deleteall): such commits
    /// at a branch tip carry no content of their own.
    pub fn all_deletes(&self) -> bool {
        !self.fileops.is_empty()
            && self.fileops.iter().all(|op| {
                matches!(
                    op.kind,
                    crate::internal::event::fileop::OpKind::Delete
                        | crate::internal::event::fileop::OpKind::Deleteall
                )
            })
    }
}
