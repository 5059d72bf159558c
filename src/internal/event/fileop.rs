//! Fileop records: the per-commit tree operations of the stream model.
//!
//! A fileop is one `M`/`D`/`R`/`C`/`N`/`deleteall` line of a commit,
//! kept in parsed form so operators can rewrite paths and refs without
//! re-tokenizing. Inline data payloads for `M ... inline` and `N`
//! belong to the op, not to a separate blob.

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::SurgeonError;
use crate::utils::{quote_path, unquote_path};

/// Ref value marking an inline data section.
pub const INLINE_REF: &str = "inline";

/// Mode string of submodule links; their ref is an opaque hash that
/// never resolves to a blob.
pub const SUBMODULE_MODE: &[u8] = b"160000";

/// Operation kind of a fileop line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Modify,
    Delete,
    Rename,
    Copy,
    Note,
    Deleteall,
}

/// One parsed fileop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub kind: OpKind,
    /// Octal mode string; only meaningful for `Modify`.
    pub mode: Vec<u8>,
    /// Blob mark, `inline`, or a bare hash for submodule links; for
    /// `Note` the annotating blob's mark.
    pub committish: String,
    /// Target path (`Modify`/`Delete`/`Note`) or destination (`Rename`/`Copy`).
    pub path: Vec<u8>,
    /// Source path for `Rename`/`Copy`.
    pub source: Vec<u8>,
    /// Payload for inline `Modify`/`Note` ops.
    pub inline: Option<Vec<u8>>,
}

impl FileOp {
    pub fn modify(mode: &[u8], committish: &str, path: &[u8]) -> FileOp {
        FileOp {
            kind: OpKind::Modify,
            mode: mode.to_vec(),
            committish: committish.to_string(),
            path: path.to_vec(),
            source: Vec::new(),
            inline: None,
        }
    }

    pub fn delete(path: &[u8]) -> FileOp {
        FileOp {
            kind: OpKind::Delete,
            mode: Vec::new(),
            committish: String::new(),
            path: path.to_vec(),
            source: Vec::new(),
            inline: None,
        }
    }

    pub fn rename(source: &[u8], path: &[u8]) -> FileOp {
        FileOp {
            kind: OpKind::Rename,
            mode: Vec::new(),
            committish: String::new(),
            path: path.to_vec(),
            source: source.to_vec(),
            inline: None,
        }
    }

    pub fn copy(source: &[u8], path: &[u8]) -> FileOp {
        FileOp {
            kind: OpKind::Copy,
            mode: Vec::new(),
            committish: String::new(),
            path: path.to_vec(),
            source: source.to_vec(),
            inline: None,
        }
    }

    pub fn note(committish: &str, path: &[u8]) -> FileOp {
        FileOp {
            kind: OpKind::Note,
            mode: Vec::new(),
            committish: committish.to_string(),
            path: path.to_vec(),
            source: Vec::new(),
            inline: None,
        }
    }

    pub fn deleteall() -> FileOp {
        FileOp {
            kind: OpKind::Deleteall,
            mode: Vec::new(),
            committish: String::new(),
            path: Vec::new(),
            source: Vec::new(),
            inline: None,
        }
    }

    /// True for `M` ops whose ref is an inline payload.
    pub fn is_inline(&self) -> bool {
        self.committish == INLINE_REF
    }

    /// True for `M` ops carrying a submodule link; their committish is
    /// an opaque hash, never a mark.
    pub fn is_submodule(&self) -> bool {
        self.kind == OpKind::Modify && self.mode == SUBMODULE_MODE
    }

    /// The blob mark this op references, when it references one.
    pub fn blob_mark(&self) -> Option<&str> {
        match self.kind {
            OpKind::Modify if !self.is_inline() && !self.is_submodule() => {
                Some(self.committish.as_str())
            }
            OpKind::Note if !self.committish.is_empty() && self.committish != INLINE_REF => {
                Some(self.committish.as_str())
            }
            _ => None,
        }
    }

    /// Parse a fileop line (without trailing LF and without any inline
    /// data section, which the stream reader attaches afterwards).
    pub fn from_line(line: &[u8], lineno: u64) -> Result<FileOp, SurgeonError> {
        let bad = |what: &str| {
            SurgeonError::parse(
                lineno,
                format!("malformed {what} fileop: {}", line.as_bstr()),
            )
        };
        if line == b"deleteall" {
            return Ok(FileOp::deleteall());
        }
        let (op, rest) = match line.split_first() {
            Some((op, rest)) if rest.first() == Some(&b' ') => (*op, &rest[1..]),
            _ => return Err(bad("fileop")),
        };
        match op {
            b'M' => {
                let sp1 = rest.find_byte(b' ').ok_or_else(|| bad("M"))?;
                let mode = &rest[..sp1];
                let rest = &rest[sp1 + 1..];
                let sp2 = rest.find_byte(b' ').ok_or_else(|| bad("M"))?;
                let committish = rest[..sp2].to_str().map_err(|_| bad("M"))?;
                let (path, _) = unquote_path(&rest[sp2 + 1..]).ok_or_else(|| bad("M"))?;
                Ok(FileOp::modify(mode, committish, &path))
            }
            b'D' => {
                let (path, _) = unquote_path(rest).ok_or_else(|| bad("D"))?;
                Ok(FileOp::delete(&path))
            }
            b'R' | b'C' => {
                let (source, used) = unquote_path(rest).ok_or_else(|| bad("R/C"))?;
                let rest = &rest[used..];
                let rest = rest.strip_prefix(b" ").ok_or_else(|| bad("R/C"))?;
                let (path, _) = unquote_path(rest).ok_or_else(|| bad("R/C"))?;
                Ok(if op == b'R' {
                    FileOp::rename(&source, &path)
                } else {
                    FileOp::copy(&source, &path)
                })
            }
            b'N' => {
                let sp = rest.find_byte(b' ').ok_or_else(|| bad("N"))?;
                let committish = rest[..sp].to_str().map_err(|_| bad("N"))?;
                let (path, _) = unquote_path(&rest[sp + 1..]).ok_or_else(|| bad("N"))?;
                Ok(FileOp::note(committish, &path))
            }
            _ => Err(bad("fileop")),
        }
    }

    /// Serialize this op back to its stream line, including trailing
    /// LF. Inline payload data sections are the writer's concern.
    pub fn to_data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.kind {
            OpKind::Modify => {
                out.extend(b"M ");
                out.extend(&self.mode);
                out.push(b' ');
                out.extend(self.committish.as_bytes());
                out.push(b' ');
                out.extend(quote_path(&self.path));
            }
            OpKind::Delete => {
                out.extend(b"D ");
                out.extend(quote_path(&self.path));
            }
            OpKind::Rename | OpKind::Copy => {
                out.push(if self.kind == OpKind::Rename { b'R' } else { b'C' });
                out.push(b' ');
                out.extend(quote_path(&self.source));
                out.push(b' ');
                out.extend(quote_path(&self.path));
            }
            OpKind::Note => {
                out.extend(b"N ");
                out.extend(self.committish.as_bytes());
                out.push(b' ');
                out.extend(quote_path(&self.path));
            }
            OpKind::Deleteall => out.extend(b"deleteall"),
        }
        out.push(b'\n');
        out
    }
}
