//! Annotated tags and resets: the lightweight events that attach to
//! commits. Both follow their target commit under most surgical edits.

use serde::{Deserialize, Serialize};

use crate::internal::event::ColorSet;
use crate::internal::event::attribution::Attribution;

/// An annotated tag pointing at a committish by mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// Mark of the target commit.
    pub committish: String,
    pub tagger: Option<Attribution>,
    pub comment: Vec<u8>,
    pub legacy_id: Option<String>,
    pub color: ColorSet,
    pub deleteme: bool,
}

impl Tag {
    pub fn new(name: &str, committish: &str) -> Tag {
        Tag {
            name: name.to_string(),
            committish: committish.to_string(),
            tagger: None,
            comment: Vec::new(),
            legacy_id: None,
            color: ColorSet::default(),
            deleteme: false,
        }
    }

    /// The full ref name of this tag.
    pub fn refname(&self) -> String {
        format!("refs/tags/{}", self.name)
    }
}

/// A reset: moves (or with `deletes`, removes) a ref. The committish
/// may be empty for a bare branch deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reset {
    /// Full ref name being reset, e.g. `refs/heads/release-1.0`.
    pub refname: String,
    /// Mark of the target commit; empty when only deleting the ref.
    pub committish: String,
    pub legacy_id: Option<String>,
    pub deletes: bool,
    pub color: ColorSet,
    pub deleteme: bool,
}

impl Reset {
    pub fn new(refname: &str, committish: &str) -> Reset {
        Reset {
            refname: refname.to_string(),
            committish: committish.to_string(),
            legacy_id: None,
            deletes: false,
            color: ColorSet::default(),
            deleteme: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_refname() {
        let tag = Tag::new("release-1.0", ":17");
        assert_eq!(tag.refname(), "refs/tags/release-1.0");
        assert_eq!(tag.committish, ":17");
    }

    #[test]
    fn test_bare_reset() {
        let reset = Reset::new("refs/heads/dead", "");
        assert!(reset.committish.is_empty());
        assert!(!reset.deletes);
    }
}
