//! The event model: a history is an ordered sequence of tagged-variant
//! events. Cross-references between events use marks (`:N`), never
//! pointers, so the graph stays acyclic in memory and events can be
//! moved, cloned and partitioned freely.

pub mod attribution;
pub mod blob;
pub mod commit;
pub mod fileop;
pub mod tag;

use serde::{Deserialize, Serialize};

pub use attribution::Attribution;
pub use blob::{Blob, Cookie, OpRef};
pub use commit::{Commit, ParentLink};
pub use fileop::{FileOp, OpKind};
pub use tag::{Reset, Tag};

/// Scratch color bitset used by graph partitioning. A blob may carry
/// both colors; a commit carrying both makes a cut infeasible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSet(u8);

impl ColorSet {
    pub const EARLY: ColorSet = ColorSet(1);
    pub const LATE: ColorSet = ColorSet(2);

    pub fn add(&mut self, color: ColorSet) {
        self.0 |= color.0;
    }

    pub fn has(&self, color: ColorSet) -> bool {
        self.0 & color.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True when both partitions claim this event.
    pub fn is_conflicted(&self) -> bool {
        self.has(ColorSet::EARLY) && self.has(ColorSet::LATE)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A stream line (or line group) the parser preserved verbatim:
/// comments, `feature`/`option`/`progress` lines, and the `done`
/// trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passthrough {
    pub text: Vec<u8>,
    pub deleteme: bool,
}

impl Passthrough {
    pub fn new(text: &[u8]) -> Passthrough {
        Passthrough {
            text: text.to_vec(),
            deleteme: false,
        }
    }

    /// True for the stream-terminating `done` trailer, which must stay
    /// last in the sequence.
    pub fn is_done(&self) -> bool {
        self.text == b"done\n" || self.text == b"done"
    }

    /// True for `feature`/`option` front matter, which graft merges
    /// ahead of the first donor event.
    pub fn is_feature(&self) -> bool {
        self.text.starts_with(b"feature ") || self.text.starts_with(b"option ")
    }
}

/// A stub standing in for a commit that lives in another repository,
/// identified by action stamp. Produced by cut, consumed by graft and
/// unite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callout {
    pub stamp: String,
    pub color: ColorSet,
    pub deleteme: bool,
}

impl Callout {
    pub fn new(stamp: &str) -> Callout {
        Callout {
            stamp: stamp.to_string(),
            color: ColorSet::default(),
            deleteme: false,
        }
    }
}

/// One event of the history. Stored in a single vector on the
/// repository; all cross-references go through marks.
#[derive(Debug, Clone)]
pub enum Event {
    Blob(Blob),
    Commit(Box<Commit>),
    Tag(Tag),
    Reset(Reset),
    Passthrough(Passthrough),
    Callout(Callout),
}

impl Event {
    /// The mark identifying this event, for variants that carry one.
    pub fn mark(&self) -> Option<&str> {
        match self {
            Event::Blob(b) => Some(&b.mark),
            Event::Commit(c) => Some(&c.mark),
            _ => None,
        }
    }

    /// Change the mark on a mark-bearing event. Returns the old mark.
    /// Callers must run the mark-index fixup afterwards.
    pub fn set_mark(&mut self, mark: &str) -> Option<String> {
        match self {
            Event::Blob(b) => Some(std::mem::replace(&mut b.mark, mark.to_string())),
            Event::Commit(c) => Some(std::mem::replace(&mut c.mark, mark.to_string())),
            _ => None,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Event::Commit(_))
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Event::Blob(_))
    }

    /// The comment text for comment-bearing events.
    pub fn comment(&self) -> Option<&[u8]> {
        match self {
            Event::Commit(c) => Some(&c.comment),
            Event::Tag(t) => Some(&t.comment),
            _ => None,
        }
    }

    /// Delete flag used by the sweep phase.
    pub fn deleteme(&self) -> bool {
        match self {
            Event::Blob(b) => b.deleteme,
            Event::Commit(c) => c.deleteme,
            Event::Tag(t) => t.deleteme,
            Event::Reset(r) => r.deleteme,
            Event::Passthrough(p) => p.deleteme,
            Event::Callout(c) => c.deleteme,
        }
    }

    pub fn set_deleteme(&mut self, flag: bool) {
        match self {
            Event::Blob(b) => b.deleteme = flag,
            Event::Commit(c) => c.deleteme = flag,
            Event::Tag(t) => t.deleteme = flag,
            Event::Reset(r) => r.deleteme = flag,
            Event::Passthrough(p) => p.deleteme = flag,
            Event::Callout(c) => c.deleteme = flag,
        }
    }

    /// Scratch color accessors for partitioning traversals.
    pub fn color(&self) -> ColorSet {
        match self {
            Event::Blob(b) => b.color,
            Event::Commit(c) => c.color,
            Event::Tag(t) => t.color,
            Event::Reset(r) => r.color,
            Event::Passthrough(_) => ColorSet::default(),
            Event::Callout(c) => c.color,
        }
    }

    pub fn add_color(&mut self, color: ColorSet) {
        match self {
            Event::Blob(b) => b.color.add(color),
            Event::Commit(c) => c.color.add(color),
            Event::Tag(t) => t.color.add(color),
            Event::Reset(r) => r.color.add(color),
            Event::Passthrough(_) => {}
            Event::Callout(c) => c.color.add(color),
        }
    }

    pub fn clear_color(&mut self) {
        match self {
            Event::Blob(b) => b.color.clear(),
            Event::Commit(c) => c.color.clear(),
            Event::Tag(t) => t.color.clear(),
            Event::Reset(r) => r.color.clear(),
            Event::Passthrough(_) => {}
            Event::Callout(c) => c.color.clear(),
        }
    }

    /// Borrow as a commit, when it is one.
    pub fn as_commit(&self) -> Option<&Commit> {
        match self {
            Event::Commit(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_commit_mut(&mut self) -> Option<&mut Commit> {
        match self {
            Event::Commit(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Event::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_blob_mut(&mut self) -> Option<&mut Blob> {
        match self {
            Event::Blob(b) => Some(b),
            _ => None,
        }
    }
}
