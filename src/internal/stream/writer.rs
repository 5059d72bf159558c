//! Fast-import stream serializer.
//!
//! Emits events in sequence order, tracking per-branch positions so it
//! can choose between incremental branch reintroduction and plain
//! resets, suppress `from` lines the reader would reinstall implicitly,
//! and swap out-of-selection parents for action-stamp callouts.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;

use tracing::{debug, warn};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{Commit, Event, ParentLink};
use crate::internal::repo::Repository;

/// Options controlling one serialization pass.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Never emit the synthetic incremental `reset <branch>^0` header.
    pub noincremental: bool,
    /// Always emit explicit `from` lines, even where the parser would
    /// reinstall the parent from the branch tip.
    pub no_implicit: bool,
    /// Replace parents outside the selection with action-stamp
    /// callouts instead of dangling marks.
    pub callouts: bool,
    /// Capabilities of the output consumer; `commit-properties` gates
    /// property emission.
    pub styles: BTreeSet<String>,
    /// When present, only these event positions are emitted.
    pub selection: Option<BTreeSet<usize>>,
}

struct WriteState {
    /// Branch → mark of the last commit written on it this pass.
    branch_position: HashMap<String, String>,
}

impl Repository {
    /// Serialize the repository (or a selection of it) as a
    /// fast-import stream.
    pub fn write_stream<W: Write>(&self, out: &mut W, options: &WriteOptions) -> Result<()> {
        let mut state = WriteState {
            branch_position: HashMap::new(),
        };
        for (i, event) in self.events.iter().enumerate() {
            if let Some(sel) = &options.selection {
                if !sel.contains(&i) {
                    continue;
                }
            }
            match event {
                Event::Blob(blob) => {
                    out.write_all(b"blob\n")?;
                    writeln!(out, "mark {}", blob.mark)?;
                    if let Some(oid) = &blob.original_oid {
                        writeln!(out, "original-oid {oid}")?;
                    }
                    let content = blob.content()?;
                    writeln!(out, "data {}", content.len())?;
                    out.write_all(&content)?;
                    out.write_all(b"\n")?;
                }
                Event::Commit(commit) => {
                    self.write_commit(out, commit, options, &mut state)?;
                }
                Event::Tag(tag) => {
                    writeln!(out, "tag {}", tag.name)?;
                    if let Some(lid) = &tag.legacy_id {
                        writeln!(out, "#legacy-id {lid}")?;
                    }
                    writeln!(out, "from {}", tag.committish)?;
                    if let Some(tagger) = &tag.tagger {
                        writeln!(out, "tagger {tagger}")?;
                    }
                    self.write_comment(out, &tag.comment)?;
                }
                Event::Reset(reset) => {
                    writeln!(out, "reset {}", reset.refname)?;
                    if !reset.committish.is_empty() {
                        writeln!(out, "from {}", reset.committish)?;
                        state
                            .branch_position
                            .insert(reset.refname.clone(), reset.committish.clone());
                    }
                }
                Event::Passthrough(p) => {
                    out.write_all(&p.text)?;
                    if !p.text.ends_with(b"\n") {
                        out.write_all(b"\n")?;
                    }
                }
                Event::Callout(c) => {
                    // callouts are resolved by graft/unite; an
                    // unresolved one cannot be expressed in a stream
                    if self.config.logmask.contains(LogMask::WARN) {
                        warn!(stamp = %c.stamp, "skipping unresolved callout on write");
                    }
                }
            }
        }
        debug!(repo = %self.name, "stream written");
        Ok(())
    }

    fn write_commit<W: Write>(
        &self,
        out: &mut W,
        commit: &Commit,
        options: &WriteOptions,
        state: &mut WriteState,
    ) -> Result<()> {
        let first_on_branch = !state.branch_position.contains_key(&commit.branch);
        let parents_outside = commit.parent_marks().any(|m| {
            match (&options.selection, self.find_mark(m)) {
                (Some(sel), Some(idx)) => !sel.contains(&idx),
                (_, None) => true,
                _ => false,
            }
        });
        if first_on_branch && !commit.parents.is_empty() && parents_outside {
            if !options.noincremental {
                // reintroduce the branch on top of its existing state
                writeln!(out, "reset {}", commit.branch)?;
                writeln!(out, "from {}^0", commit.branch)?;
                out.write_all(b"\n")?;
            }
        } else if commit.parents.is_empty()
            && state.branch_position.contains_key(&commit.branch)
        {
            // a new root on a branch this pass already wrote
            writeln!(out, "reset {}", commit.branch)?;
        }
        let previous_on_branch = state
            .branch_position
            .insert(commit.branch.clone(), commit.mark.clone());

        writeln!(out, "commit {}", commit.branch)?;
        if let Some(lid) = &commit.legacy_id {
            writeln!(out, "#legacy-id {lid}")?;
        }
        writeln!(out, "mark {}", commit.mark)?;
        if let Some(oid) = &commit.original_oid {
            writeln!(out, "original-oid {oid}")?;
        }
        for author in &commit.authors {
            writeln!(out, "author {author}")?;
        }
        writeln!(out, "committer {}", commit.committer)?;
        self.write_comment(out, &commit.comment)?;

        for (k, parent) in commit.parents.iter().enumerate() {
            let keyword: &[u8] = if k == 0 { b"from" } else { b"merge" };
            if k == 0 {
                let suppress = !options.no_implicit
                    && commit.implicit_parent
                    && commit.parents.len() == 1
                    && previous_on_branch.as_deref() == parent.mark();
                if suppress {
                    continue;
                }
            }
            match parent {
                ParentLink::Callout(stamp) => {
                    out.write_all(keyword)?;
                    writeln!(out, " {stamp}")?;
                }
                ParentLink::Mark(mark) => {
                    let outside = match (&options.selection, self.find_mark(mark)) {
                        (Some(sel), Some(idx)) => !sel.contains(&idx),
                        _ => false,
                    };
                    if outside && options.callouts {
                        let stamp = self
                            .commit_by_mark(mark)
                            .map(|c| c.action_stamp())
                            .ok_or_else(|| {
                                SurgeonError::internal(format!("parent {mark} has no stamp"))
                            })?;
                        out.write_all(keyword)?;
                        writeln!(out, " {stamp}")?;
                    } else {
                        out.write_all(keyword)?;
                        writeln!(out, " {mark}")?;
                    }
                }
            }
        }

        if options.styles.contains("commit-properties") {
            for (name, value) in &commit.properties {
                write!(out, "property {name} {} ", value.len())?;
                out.write_all(value)?;
                out.write_all(b"\n")?;
            }
        }

        for op in &commit.fileops {
            out.write_all(&op.to_data())?;
            if let Some(payload) = &op.inline {
                writeln!(out, "data {}", payload.len())?;
                out.write_all(payload)?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    /// Emit a comment as a counted data section, guaranteeing a
    /// trailing LF; with `crlf` set, comment line endings become CRLF.
    fn write_comment<W: Write>(&self, out: &mut W, comment: &[u8]) -> Result<()> {
        let mut body = if self.config.crlf {
            let mut converted = Vec::with_capacity(comment.len());
            for &b in comment {
                if b == b'\n' {
                    converted.push(b'\r');
                }
                converted.push(b);
            }
            converted
        } else {
            comment.to_vec()
        };
        if !body.ends_with(b"\n") {
            body.push(b'\n');
        }
        writeln!(out, "data {}", body.len())?;
        out.write_all(&body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut repo = Repository::new("rt", Config::for_tests()).unwrap();
        repo.read_stream_bytes(data).unwrap();
        let mut out = Vec::new();
        repo.write_stream(&mut out, &WriteOptions::default()).unwrap();
        out
    }

    const SMALL: &[u8] = b"blob\nmark :1\ndata 7\nhello.\n\ncommit refs/heads/master\nmark :2\ncommitter Ann <ann@example.com> 1319556331 +0000\ndata 6\nstart\nM 100644 :1 README\n";

    #[test]
    fn test_roundtrip_stable() {
        // the second pass over serializer output is byte-identical
        let once = roundtrip(SMALL);
        let twice = roundtrip(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_implicit_from_suppressed() {
        let mut data = SMALL.to_vec();
        data.extend_from_slice(
            b"commit refs/heads/master\nmark :3\ncommitter Ann <ann@example.com> 1319556332 +0000\ndata 5\nnext\nM 100644 :1 OTHER\n",
        );
        let out = roundtrip(&data);
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("from :2"), "implicit from leaked:\n{text}");

        // no_implicit forces it back out
        let mut repo = Repository::new("ni", Config::for_tests()).unwrap();
        repo.read_stream_bytes(&data).unwrap();
        let mut out = Vec::new();
        let options = WriteOptions {
            no_implicit: true,
            ..Default::default()
        };
        repo.write_stream(&mut out, &options).unwrap();
        assert!(String::from_utf8_lossy(&out).contains("from :2"));
    }

    #[test]
    fn test_passthrough_and_done_roundtrip() {
        let data = b"#reposurgeon sourcetype git\nblob\nmark :1\ndata 2\nx\n\ncommit refs/heads/master\nmark :2\ncommitter A <a@b.c> 100 +0000\ndata 2\nc\nM 100644 :1 f\ndone\n";
        let out = roundtrip(data);
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("#reposurgeon sourcetype git\n"));
        assert!(text.ends_with("done\n"));
    }

    #[test]
    fn test_properties_gated_by_style() {
        let data = b"blob\nmark :1\ndata 2\nx\n\ncommit refs/heads/master\nmark :2\ncommitter A <a@b.c> 100 +0000\nproperty svn:log 5\nhello\ndata 2\nc\nM 100644 :1 f\n";
        let mut repo = Repository::new("prop", Config::for_tests()).unwrap();
        repo.read_stream_bytes(data).unwrap();
        let mut plain = Vec::new();
        repo.write_stream(&mut plain, &WriteOptions::default()).unwrap();
        assert!(!String::from_utf8_lossy(&plain).contains("property"));
        let mut with = Vec::new();
        let options = WriteOptions {
            styles: ["commit-properties".to_string()].into_iter().collect(),
            ..Default::default()
        };
        repo.write_stream(&mut with, &options).unwrap();
        assert!(String::from_utf8_lossy(&with).contains("property svn:log 5 hello"));
    }

    #[test]
    fn test_callout_for_out_of_selection_parent() {
        let mut data = SMALL.to_vec();
        data.extend_from_slice(
            b"commit refs/heads/master\nmark :3\ncommitter Bob <bob@example.com> 1319556400 +0000\ndata 5\nnext\nfrom :2\nM 100644 :1 OTHER\n",
        );
        let mut repo = Repository::new("sel", Config::for_tests()).unwrap();
        repo.read_stream_bytes(&data).unwrap();
        // select only blob :1 and commit :3
        let selection: BTreeSet<usize> = [0usize, 2].into_iter().collect();
        let mut out = Vec::new();
        let options = WriteOptions {
            callouts: true,
            noincremental: true,
            selection: Some(selection),
            ..Default::default()
        };
        repo.write_stream(&mut out, &options).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("mark :2\n"));
        assert!(
            text.contains("from 2011-10-25T15:25:31Z!ann@example.com"),
            "callout missing:\n{text}"
        );
    }

    #[test]
    fn test_crlf_comments() {
        let mut config = Config::for_tests();
        config.crlf = true;
        let mut repo = Repository::new("crlf", config).unwrap();
        repo.read_stream_bytes(SMALL).unwrap();
        let mut out = Vec::new();
        repo.write_stream(&mut out, &WriteOptions::default()).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("data 7\nstart\r\n"));
    }

    #[test]
    fn test_incremental_reset_header() {
        // a commit whose parent exists but is outside the selection,
        // on a branch not yet written: incremental reintroduction
        let mut data = SMALL.to_vec();
        data.extend_from_slice(
            b"commit refs/heads/master\nmark :3\ncommitter Ann <ann@example.com> 1319556332 +0000\ndata 5\nnext\nfrom :2\n",
        );
        let mut repo = Repository::new("inc", Config::for_tests()).unwrap();
        repo.read_stream_bytes(&data).unwrap();
        let selection: BTreeSet<usize> = [2usize].into_iter().collect();
        let mut out = Vec::new();
        let options = WriteOptions {
            selection: Some(selection.clone()),
            ..Default::default()
        };
        repo.write_stream(&mut out, &options).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("reset refs/heads/master\nfrom refs/heads/master^0\n"));
        // suppressed under noincremental
        let mut out2 = Vec::new();
        let options2 = WriteOptions {
            noincremental: true,
            selection: Some(selection),
            ..Default::default()
        };
        repo.write_stream(&mut out2, &options2).unwrap();
        assert!(String::from_utf8_lossy(&out2).starts_with("commit refs/heads/master\n"));
    }
}
