//! Content-addressed hashing for the in-memory repository model.
//!
//! Object ids are fixed-width 20-byte SHA-1 values computed over a
//! `"<type> <len>\0<content>"` envelope, matching the dominant VCS
//! object model so that rewritten histories keep recognizable ids.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::SurgeonError;

/// Kinds of hashable objects. The byte name of the kind is the first
/// token of the hash envelope.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

const BLOB_OBJECT_KIND: &[u8] = b"blob";
const TREE_OBJECT_KIND: &[u8] = b"tree";
const COMMIT_OBJECT_KIND: &[u8] = b"commit";
const TAG_OBJECT_KIND: &[u8] = b"tag";

impl ObjectKind {
    /// ASCII name of this kind as used in the hash envelope.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectKind::Blob => BLOB_OBJECT_KIND,
            ObjectKind::Tree => TREE_OBJECT_KIND,
            ObjectKind::Commit => COMMIT_OBJECT_KIND,
            ObjectKind::Tag => TAG_OBJECT_KIND,
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectKind::Blob => write!(f, "blob"),
            ObjectKind::Tree => write!(f, "tree"),
            ObjectKind::Commit => write!(f, "commit"),
            ObjectKind::Tag => write!(f, "tag"),
        }
    }
}

/// A 20-byte content-addressed object id.
///
/// Supports conversion to/from hex strings and byte slices. The inner
/// bytes are the raw digest; `Display` renders lowercase hex.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GitHash(pub [u8; 20]);

impl Display for GitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for GitHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse a 40-character hex string into a `GitHash`.
impl FromStr for GitHash {
    type Err = SurgeonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(SurgeonError::InvalidValue(s.to_string(), "hash value"));
        }
        let bytes = hex::decode(s)
            .map_err(|_| SurgeonError::InvalidValue(s.to_string(), "hash value"))?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(GitHash(h))
    }
}

impl GitHash {
    /// Zero-filled hex string, the null id in stream refs.
    pub fn zero_str() -> String {
        "0000000000000000000000000000000000000000".to_string()
    }

    /// Hash size in bytes.
    pub const fn size() -> usize {
        20
    }

    /// Compute the digest of raw data with no envelope.
    pub fn new(data: &[u8]) -> GitHash {
        let d = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(d.as_ref());
        GitHash(bytes)
    }

    /// Compute the id of an object from its kind and content, wrapping
    /// the content in the `"<kind> <len>\0"` envelope.
    pub fn from_kind_and_data(kind: ObjectKind, data: &[u8]) -> GitHash {
        let mut d: Vec<u8> = Vec::with_capacity(data.len() + 16);
        d.extend(kind.to_bytes());
        d.push(b' ');
        d.extend(data.len().to_string().as_bytes());
        d.push(b'\x00');
        d.extend(data);
        GitHash::new(&d)
    }

    /// Create a `GitHash` from exactly 20 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<GitHash, SurgeonError> {
        if bytes.len() != 20 {
            return Err(SurgeonError::InvalidValue(
                hex::encode(bytes),
                "hash value",
            ));
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(bytes);
        Ok(GitHash(h))
    }

    /// Return raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{GitHash, ObjectKind};

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_new() {
        let data = "Hello, world!".as_bytes();
        let hash = GitHash::new(data);
        assert_eq!(hash.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// Blob envelope hashing matches `git hash-object` output.
    #[test]
    fn test_blob_envelope() {
        // echo -n "what is up, doc?" | git hash-object --stdin
        let hash = GitHash::from_kind_and_data(ObjectKind::Blob, b"what is up, doc?");
        assert_eq!(hash.to_string(), "bd9dbf5aae1a3862dd1526723246b20206e5fc37");
    }

    /// Hex round-trip through FromStr and Display.
    #[test]
    fn test_from_str() {
        let s = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let hash = GitHash::from_str(s).unwrap();
        assert_eq!(hash.to_string(), s);
    }

    /// Wrong-length hex strings are rejected.
    #[test]
    fn test_from_str_invalid() {
        assert!(GitHash::from_str("abcd").is_err());
        assert!(GitHash::from_str("zz").is_err());
    }

    /// Raw-byte construction round-trips.
    #[test]
    fn test_from_bytes() {
        let hash = GitHash::from_bytes(&[
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ])
        .unwrap();
        assert_eq!(hash.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
        assert!(GitHash::from_bytes(&[0u8; 19]).is_err());
    }

    /// Different content yields different ids.
    #[test]
    fn test_content_sensitivity() {
        let a = GitHash::from_kind_and_data(ObjectKind::Blob, b"alpha");
        let b = GitHash::from_kind_and_data(ObjectKind::Blob, b"alphb");
        assert_ne!(a, b);
    }
}
