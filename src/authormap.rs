//! Attribution remapping and legacy-id persistence.
//!
//! An author map translates the short local usernames foreign systems
//! record into full `Name <email>` attributions. A legacy map pairs
//! foreign revision identifiers with action stamps so they survive a
//! round-trip even through operators that renumber everything else.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use bstr::ByteSlice;
use tracing::{debug, info};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::Event;
use crate::internal::repo::Repository;

/// One author-map entry: the replacement identity for a local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorEntry {
    pub name: String,
    pub email: String,
    /// Optional timezone tail, carried verbatim.
    pub timezone: Option<String>,
}

/// Mapping from local usernames to full attributions, in the
/// `local = Full Name <email> [tz]` text format.
#[derive(Debug, Clone, Default)]
pub struct AuthorMap {
    entries: BTreeMap<String, AuthorEntry>,
}

impl AuthorMap {
    pub fn new() -> AuthorMap {
        AuthorMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local: &str) -> Option<&AuthorEntry> {
        self.entries.get(local)
    }

    pub fn insert(&mut self, local: &str, entry: AuthorEntry) {
        self.entries.insert(local.to_string(), entry);
    }

    /// Parse the text format. Blank lines and `#` comments are
    /// skipped; malformed lines are a `Msgbox` error naming the line.
    pub fn read<R: BufRead>(reader: R) -> Result<AuthorMap> {
        let mut map = AuthorMap::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((local, rest)) = trimmed.split_once('=') else {
                return Err(SurgeonError::Msgbox(format!(
                    "author map line {} has no '=': {trimmed}",
                    lineno + 1
                )));
            };
            let rest = rest.trim();
            let bytes = rest.as_bytes();
            let (lt, gt) = match (bytes.find_byte(b'<'), bytes.find_byte(b'>')) {
                (Some(lt), Some(gt)) if lt < gt => (lt, gt),
                _ => {
                    return Err(SurgeonError::Msgbox(format!(
                        "author map line {} has no <email>: {trimmed}",
                        lineno + 1
                    )));
                }
            };
            let name = rest[..lt].trim().to_string();
            let email = rest[lt + 1..gt].to_string();
            let tail = rest[gt + 1..].trim();
            map.insert(
                local.trim(),
                AuthorEntry {
                    name,
                    email,
                    timezone: (!tail.is_empty()).then(|| tail.to_string()),
                },
            );
        }
        Ok(map)
    }

    /// Emit the text format, sorted by local name.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        for (local, entry) in &self.entries {
            match &entry.timezone {
                Some(tz) => writeln!(out, "{local} = {} <{}> {tz}", entry.name, entry.email)?,
                None => writeln!(out, "{local} = {} <{}>", entry.name, entry.email)?,
            }
        }
        Ok(())
    }

    /// Rewrite attributions across the repository: any author,
    /// committer or tagger whose name or email equals a local key
    /// takes on the mapped identity. Returns the number of
    /// attributions rewritten.
    pub fn apply(&self, repo: &mut Repository) -> usize {
        let mut rewritten = 0;
        let remap = |name: &mut String, email: &mut String| -> bool {
            let key = if self.entries.contains_key(name.as_str()) {
                name.clone()
            } else if self.entries.contains_key(email.as_str()) {
                email.clone()
            } else {
                return false;
            };
            let entry = &self.entries[&key];
            *name = entry.name.clone();
            *email = entry.email.clone();
            true
        };
        let mut touched_commits = Vec::new();
        for idx in 0..repo.len() {
            let mut touched = false;
            if let Some(event) = repo.event_mut(idx) {
                match event {
                    Event::Commit(c) => {
                        for a in &mut c.authors {
                            touched |= remap(&mut a.name, &mut a.email);
                        }
                        touched |= remap(&mut c.committer.name, &mut c.committer.email);
                        if touched {
                            c.hash_cache = None;
                            touched_commits.push(idx);
                        }
                    }
                    Event::Tag(t) => {
                        if let Some(tagger) = &mut t.tagger {
                            touched |= remap(&mut tagger.name, &mut tagger.email);
                        }
                    }
                    _ => {}
                }
            }
            if touched {
                rewritten += 1;
            }
        }
        for idx in touched_commits {
            // an attribution feeds the commit hash, which feeds every
            // descendant's hash
            repo.invalidate_hashes(idx);
        }
        if rewritten > 0 {
            // stamps changed, so human-name resolution must rebuild
            repo.declare_sequence_mutation("author map");
        }
        if repo.config.logmask.contains(LogMask::SHOUT) {
            info!(rewritten, "author map applied");
        }
        rewritten
    }
}

impl Repository {
    /// Write the legacy map: one `<legacy-id>\t<action-stamp>` line
    /// per commit carrying a legacy id, in event order.
    pub fn write_legacy_map<W: Write>(&self, out: &mut W) -> Result<()> {
        for event in self.events() {
            if let Event::Commit(c) = event {
                if let Some(lid) = &c.legacy_id {
                    writeln!(out, "{lid}\t{}", c.action_stamp())?;
                }
            }
        }
        Ok(())
    }

    /// Read a legacy map and attach ids to the commits whose action
    /// stamps match. Returns the number of commits annotated.
    pub fn read_legacy_map<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let mut by_stamp: BTreeMap<String, String> = BTreeMap::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((lid, stamp)) = trimmed.split_once('\t') else {
                return Err(SurgeonError::Msgbox(format!(
                    "legacy map line {} is not id<TAB>stamp: {trimmed}",
                    lineno + 1
                )));
            };
            by_stamp.insert(stamp.to_string(), lid.to_string());
        }
        let mut annotated = 0;
        for idx in 0..self.len() {
            let Some(Event::Commit(c)) = self.event_mut(idx) else {
                continue;
            };
            let stamp = c.action_stamp();
            if let Some(lid) = by_stamp.get(&stamp) {
                debug!(mark = %c.mark, legacy = %lid, "legacy id attached");
                c.legacy_id = Some(lid.clone());
                annotated += 1;
            }
        }
        if annotated > 0 {
            self.declare_sequence_mutation("legacy map");
        }
        Ok(annotated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const MAP: &str = "\
# project committers
esr = Eric S. Raymond <esr@thyrsus.com> America/New_York
jrh = J. Random Hacker <jrh@example.com>
";

    #[test]
    fn test_read_and_write_author_map() {
        let map = AuthorMap::read(MAP.as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        let esr = map.get("esr").unwrap();
        assert_eq!(esr.email, "esr@thyrsus.com");
        assert_eq!(esr.timezone.as_deref(), Some("America/New_York"));
        let mut out = Vec::new();
        map.write(&mut out).unwrap();
        let reread = AuthorMap::read(out.as_slice()).unwrap();
        assert_eq!(reread.get("jrh").unwrap().name, "J. Random Hacker");
        assert!(reread.get("jrh").unwrap().timezone.is_none());
    }

    #[test]
    fn test_malformed_map_is_msgbox_error() {
        let err = AuthorMap::read("not a mapping line\n".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Msgbox);
    }

    #[test]
    fn test_apply_rewrites_attributions() {
        let mut repo = Repository::new("am", Config::for_tests()).unwrap();
        repo.read_stream_bytes(
            b"blob\nmark :1\ndata 2\nx\n\ncommit refs/heads/master\nmark :2\nauthor esr <esr> 100 +0000\ncommitter esr <esr> 100 +0000\ndata 2\nc\nM 100644 :1 f\n",
        )
        .unwrap();
        let map = AuthorMap::read(MAP.as_bytes()).unwrap();
        let rewritten = map.apply(&mut repo);
        assert_eq!(rewritten, 1);
        let c = repo.commit_by_mark(":2").unwrap();
        assert_eq!(c.committer.name, "Eric S. Raymond");
        assert_eq!(c.authors[0].email, "esr@thyrsus.com");
    }

    #[test]
    fn test_legacy_map_roundtrip() {
        let mut repo = Repository::new("lm", Config::for_tests()).unwrap();
        repo.read_stream_bytes(
            b"blob\nmark :1\ndata 2\nx\n\ncommit refs/heads/master\nmark :2\n#legacy-id SVN:17\ncommitter A <a@b.c> 100 +0000\ndata 2\nc\nM 100644 :1 f\n",
        )
        .unwrap();
        let mut out = Vec::new();
        repo.write_legacy_map(&mut out).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(text, "SVN:17\t1970-01-01T00:01:40Z!a@b.c\n");
        // strip and reattach
        repo.commit_mut_by_mark(":2").unwrap().legacy_id = None;
        let n = repo.read_legacy_map(out.as_slice()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            repo.commit_by_mark(":2").unwrap().legacy_id.as_deref(),
            Some("SVN:17")
        );
    }
}
