//! Blob events: content-carrying leaves of the event graph.

use std::collections::BTreeSet;
use std::sync::Mutex;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::hash::{GitHash, ObjectKind};
use crate::internal::blobstore::BlobBody;
use crate::internal::event::ColorSet;

/// An embedded VCS cookie found in blob content: the dollar-keyword
/// id some foreign systems expand into checked-out files. Carrying it
/// lets legacy references be correlated after conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub path: Vec<u8>,
    pub revision: String,
}

impl Cookie {
    /// Scan content for `$Id: path revision ... $` or
    /// `$Revision: N $` keyword expansions. Only the first hit counts.
    pub fn sniff(content: &[u8]) -> Option<Cookie> {
        if let Some(start) = content.find(b"$Id: ") {
            let rest = &content[start + 5..];
            let end = rest.find(b"$")?;
            let mut fields = rest[..end].split_str(b" ").filter(|f| !f.is_empty());
            let path = fields.next()?.to_vec();
            let revision = fields.next()?.to_str().ok()?.to_string();
            return Some(Cookie { path, revision });
        }
        if let Some(start) = content.find(b"$Revision: ") {
            let rest = &content[start + 11..];
            let end = rest.find(b"$")?;
            let revision = rest[..end].trim().to_str().ok()?.to_string();
            if revision.is_empty() {
                return None;
            }
            return Some(Cookie {
                path: Vec::new(),
                revision,
            });
        }
        None
    }
}

/// Identifies one fileop using a blob: the owning commit's mark and the
/// path it modifies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpRef {
    pub commit_mark: String,
    pub path: Vec<u8>,
}

/// A blob event. Content lives in the blob store; the opset is the set
/// of fileops referencing this blob, maintained for GC and guarded for
/// concurrent touch-up by parallel walkers.
#[derive(Debug)]
pub struct Blob {
    pub mark: String,
    /// Stable sequence number naming this blob's scratch file slot.
    pub seq: u64,
    pub body: BlobBody,
    pub cookie: Option<Cookie>,
    pub original_oid: Option<String>,
    opset: Mutex<BTreeSet<OpRef>>,
    pub color: ColorSet,
    pub deleteme: bool,
    hash_cache: Option<GitHash>,
}

impl Clone for Blob {
    fn clone(&self) -> Self {
        Blob {
            mark: self.mark.clone(),
            seq: self.seq,
            body: self.body.clone(),
            cookie: self.cookie.clone(),
            original_oid: self.original_oid.clone(),
            opset: Mutex::new(self.opset.lock().expect("opset poisoned").clone()),
            color: self.color,
            deleteme: self.deleteme,
            hash_cache: self.hash_cache,
        }
    }
}

impl Blob {
    pub fn new(mark: &str, seq: u64) -> Blob {
        Blob {
            mark: mark.to_string(),
            seq,
            body: BlobBody::Empty,
            cookie: None,
            original_oid: None,
            opset: Mutex::new(BTreeSet::new()),
            color: ColorSet::default(),
            deleteme: false,
            hash_cache: None,
        }
    }

    /// Fetch the content bytes from the backing storage.
    pub fn content(&self) -> Result<Vec<u8>> {
        self.body.fetch()
    }

    /// Record a fileop as using this blob. Guarded; safe to call from
    /// parallel walkers.
    pub fn add_op(&self, op: OpRef) {
        self.opset.lock().expect("opset poisoned").insert(op);
    }

    /// Forget a fileop reference.
    pub fn remove_op(&self, op: &OpRef) {
        self.opset.lock().expect("opset poisoned").remove(op);
    }

    /// Drop all recorded references.
    pub fn clear_ops(&self) {
        self.opset.lock().expect("opset poisoned").clear();
    }

    /// True when no fileop references this blob; such blobs are
    /// garbage after a delete sweep.
    pub fn is_unreferenced(&self) -> bool {
        self.opset.lock().expect("opset poisoned").is_empty()
    }

    /// Number of referencing fileops.
    pub fn op_count(&self) -> usize {
        self.opset.lock().expect("opset poisoned").len()
    }

    /// Marks of the commits whose fileops reference this blob,
    /// deduplicated.
    pub fn referrer_marks(&self) -> Vec<String> {
        let guard = self.opset.lock().expect("opset poisoned");
        let mut marks: Vec<String> = guard.iter().map(|o| o.commit_mark.clone()).collect();
        marks.dedup();
        marks
    }

    /// Content-addressed id of this blob, cached until content changes.
    pub fn hash(&mut self) -> Result<GitHash> {
        if let Some(h) = self.hash_cache {
            return Ok(h);
        }
        let content = self.content()?;
        let h = GitHash::from_kind_and_data(ObjectKind::Blob, &content);
        self.hash_cache = Some(h);
        Ok(h)
    }

    /// Seed the hash cache, e.g. from an `original-oid` header.
    pub fn set_hash(&mut self, hash: GitHash) {
        self.hash_cache = Some(hash);
    }

    /// Invalidate the cached hash after a content change.
    pub fn invalidate_hash(&mut self) {
        self.hash_cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_sniff_id() {
        let content = b"header\n/* $Id: src/foo.c 1.17 2004/03/01 bob Exp $ */\nbody\n";
        let cookie = Cookie::sniff(content).unwrap();
        assert_eq!(cookie.path, b"src/foo.c".to_vec());
        assert_eq!(cookie.revision, "1.17");
    }

    #[test]
    fn test_cookie_sniff_revision() {
        let content = b"# $Revision: 2331 $\n";
        let cookie = Cookie::sniff(content).unwrap();
        assert_eq!(cookie.revision, "2331");
        assert!(cookie.path.is_empty());
    }

    #[test]
    fn test_cookie_sniff_none() {
        assert!(Cookie::sniff(b"no keywords at all").is_none());
        assert!(Cookie::sniff(b"$Id: unterminated").is_none());
    }

    #[test]
    fn test_opset_tracking() {
        let blob = Blob::new(":1", 1);
        assert!(blob.is_unreferenced());
        let op = OpRef {
            commit_mark: ":2".to_string(),
            path: b"README".to_vec(),
        };
        blob.add_op(op.clone());
        blob.add_op(op.clone());
        assert_eq!(blob.op_count(), 1);
        blob.remove_op(&op);
        assert!(blob.is_unreferenced());
    }

    #[test]
    fn test_hash_cache_seeding() {
        let mut blob = Blob::new(":1", 1);
        let seeded = GitHash::new(b"seed");
        blob.set_hash(seeded);
        assert_eq!(blob.hash().unwrap(), seeded);
        blob.invalidate_hash();
        // empty body hashes as the empty blob
        let h = blob.hash().unwrap();
        assert_eq!(h.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
