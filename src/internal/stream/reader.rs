//! Fast-import stream reader.
//!
//! Line-oriented with binary payloads. Recognized top-level tokens
//! become typed events; anything else is preserved verbatim as a
//! passthrough so unknown exporter extensions survive round-trip.
//! Blob payloads are not copied: each blob records a view into the
//! seekable source it was read from.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::str::FromStr;

use bstr::ByteSlice;
use tracing::{debug, warn};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::hash::GitHash;
use crate::internal::blobstore::{BlobBody, StreamHandle, stream_handle};
use crate::internal::event::{
    Attribution, Blob, Commit, Cookie, Event, FileOp, OpKind, OpRef, ParentLink, Passthrough,
    Reset, Tag,
};
use crate::internal::repo::Repository;
use crate::utils::LineReader;

impl Repository {
    /// Parse a fast-import stream from a file. The file stays open as
    /// the blob content source for the life of the repository.
    pub fn read_stream_file(&mut self, path: &Path) -> Result<()> {
        let parse_side = BufReader::new(File::open(path)?);
        let blob_side = stream_handle(File::open(path)?);
        Parser::new(self, LineReader::new(parse_side), blob_side).run()
    }

    /// Parse a fast-import stream held in memory.
    pub fn read_stream_bytes(&mut self, data: &[u8]) -> Result<()> {
        let parse_side = BufReader::new(Cursor::new(data.to_vec()));
        let blob_side = stream_handle(Cursor::new(data.to_vec()));
        Parser::new(self, LineReader::new(parse_side), blob_side).run()
    }
}

struct Parser<'r, R: BufRead> {
    repo: &'r mut Repository,
    reader: LineReader<R>,
    handle: StreamHandle,
    /// Branch → mark of the last commit or reset target seen, used to
    /// install implicit first parents.
    branch_tips: HashMap<String, String>,
}

/// A `data` payload: the bytes plus their position in the source.
struct DataBlock {
    bytes: Vec<u8>,
    offset: u64,
    size: u64,
}

impl<'r, R: BufRead> Parser<'r, R> {
    fn new(repo: &'r mut Repository, reader: LineReader<R>, handle: StreamHandle) -> Self {
        Parser {
            repo,
            reader,
            handle,
            branch_tips: HashMap::new(),
        }
    }

    fn err(&self, msg: impl Into<String>) -> SurgeonError {
        SurgeonError::parse(self.reader.lineno(), msg.into())
    }

    fn run(mut self) -> Result<()> {
        while let Some(line) = self.reader.read_line()? {
            if line == b"\n" {
                continue;
            }
            if let Some(rest) = line.strip_prefix(b"#reposurgeon sourcetype ") {
                let hint = rest.trim().to_str().unwrap_or_default().to_string();
                debug!(%hint, "source type hint");
                self.repo.source_type = Some(hint);
                self.repo.append(Event::Passthrough(Passthrough::new(&line)));
            } else if line.starts_with(b"#") {
                self.repo.append(Event::Passthrough(Passthrough::new(&line)));
            } else if line.trim_end() == b"blob" {
                self.parse_blob()?;
            } else if let Some(rest) = line.strip_prefix(b"commit ") {
                let branch = token_str(rest);
                self.parse_commit(&branch)?;
            } else if let Some(rest) = line.strip_prefix(b"reset ") {
                let refname = token_str(rest);
                self.parse_reset(&refname)?;
            } else if let Some(rest) = line.strip_prefix(b"tag ") {
                let name = token_str(rest);
                self.parse_tag(&name)?;
            } else {
                // features, options, progress, done, and anything else
                self.repo.append(Event::Passthrough(Passthrough::new(&line)));
            }
        }
        self.repo.rebuild_children();
        self.repo.rebuild_blob_refs();
        debug!(repo = %self.repo.name, events = self.repo.len(), "stream parsed");
        Ok(())
    }

    // --------------------------------------------------------------
    // Data sections

    /// Read a `data` section in either the counted or heredoc form.
    fn parse_data(&mut self) -> Result<DataBlock> {
        let line = self
            .reader
            .read_line()?
            .ok_or_else(|| self.err("expected data section, got end of input"))?;
        let Some(rest) = line.strip_prefix(b"data ") else {
            return Err(self.err(format!(
                "expected data section, got: {}",
                line.as_bstr()
            )));
        };
        let rest = rest.trim_end();
        if let Some(delim) = rest.strip_prefix(b"<<") {
            let delim = delim.to_vec();
            let offset = self.reader.offset();
            let mut bytes = Vec::new();
            loop {
                let body = self
                    .reader
                    .read_line()?
                    .ok_or_else(|| self.err("unterminated heredoc data section"))?;
                if body.trim_end() == delim.as_slice() {
                    break;
                }
                bytes.extend_from_slice(&body);
            }
            let size = bytes.len() as u64;
            Ok(DataBlock {
                bytes,
                offset,
                size,
            })
        } else {
            let count: usize = rest
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.err(format!("malformed data count: {}", rest.as_bstr())))?;
            let offset = self.reader.offset();
            let bytes = self.reader.read_exact(count)?;
            // optional LF after a counted payload
            if let Some(next) = self.reader.read_line()? {
                if next != b"\n" {
                    self.reader.push_back(next);
                }
            }
            Ok(DataBlock {
                bytes,
                offset,
                size: count as u64,
            })
        }
    }

    /// Apply the comment line-ending policy: with `canonicalize`, CRLF
    /// becomes LF and trailing whitespace is stripped per line.
    fn clean_comment(&self, raw: Vec<u8>) -> Vec<u8> {
        if !self.repo.config.canonicalize {
            return raw;
        }
        let mut out = Vec::with_capacity(raw.len());
        for line in raw.split_inclusive(|&b| b == b'\n') {
            let (body, had_lf) = match line.last() {
                Some(b'\n') => (&line[..line.len() - 1], true),
                _ => (line, false),
            };
            let body = body.trim_end_with(|c| c == '\r' || c == ' ' || c == '\t');
            out.extend_from_slice(body);
            if had_lf {
                out.push(b'\n');
            }
        }
        out
    }

    // --------------------------------------------------------------
    // Events

    fn parse_blob(&mut self) -> Result<()> {
        let mut mark = None;
        let mut original_oid = None;
        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| self.err("truncated blob"))?;
            if let Some(rest) = line.strip_prefix(b"mark ") {
                mark = Some(token_str(rest));
            } else if let Some(rest) = line.strip_prefix(b"original-oid ") {
                original_oid = Some(token_str(rest));
            } else {
                self.reader.push_back(line);
                break;
            }
        }
        let mark = mark.ok_or_else(|| self.err("blob without mark"))?;
        let data = self.parse_data()?;
        let seq = self.repo.new_blob_seq();
        let mut blob = Blob::new(&mark, seq);
        blob.body = BlobBody::Stream {
            source: self.handle.clone(),
            offset: data.offset,
            size: data.size,
        };
        blob.cookie = Cookie::sniff(&data.bytes);
        if let Some(oid) = original_oid {
            if let Ok(h) = GitHash::from_str(&oid) {
                blob.set_hash(h);
            }
            blob.original_oid = Some(oid);
        }
        self.repo.append(Event::Blob(blob));
        Ok(())
    }

    fn parse_commit(&mut self, branch: &str) -> Result<()> {
        let mut mark = None;
        let mut original_oid = None;
        let mut legacy_id = None;
        let mut authors: Vec<Attribution> = Vec::new();
        let mut committer: Option<Attribution> = None;
        let mut properties: Vec<(String, Vec<u8>)> = Vec::new();
        // header fields, in any order the exporter chose
        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| self.err("truncated commit"))?;
            if let Some(rest) = line.strip_prefix(b"mark ") {
                mark = Some(token_str(rest));
            } else if let Some(rest) = line.strip_prefix(b"original-oid ") {
                original_oid = Some(token_str(rest));
            } else if let Some(rest) = line.strip_prefix(b"#legacy-id ") {
                legacy_id = Some(token_str(rest));
            } else if let Some(rest) = line.strip_prefix(b"author ") {
                authors.push(
                    Attribution::from_data(rest.trim_end())
                        .map_err(|e| self.err(e.to_string()))?,
                );
            } else if let Some(rest) = line.strip_prefix(b"committer ") {
                committer = Some(
                    Attribution::from_data(rest.trim_end())
                        .map_err(|e| self.err(e.to_string()))?,
                );
            } else if let Some(rest) = line.strip_prefix(b"property ") {
                properties.push(self.parse_property(rest)?);
            } else {
                self.reader.push_back(line);
                break;
            }
        }
        let committer = match committer {
            Some(c) => c,
            None if self.repo.config.relax => {
                if self.repo.config.logmask.contains(LogMask::WARN) {
                    warn!(branch, "commit without committer accepted under relax");
                }
                Attribution::from_data(b"nobody <nobody@nowhere> 0 +0000")
                    .expect("literal attribution parses")
            }
            None => return Err(self.err("commit without committer")),
        };
        let mark = mark.ok_or_else(|| self.err("commit without mark"))?;
        let data = self.parse_data()?.bytes;
        let comment = self.clean_comment(data);

        let mut commit = Commit::new(&mark, branch, committer);
        commit.comment = comment;
        commit.authors = authors;
        commit.original_oid = original_oid;
        commit.legacy_id = legacy_id;
        commit.properties = properties;

        // parent edges
        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| self.err("truncated commit"))?;
            if let Some(rest) = line.strip_prefix(b"from ") {
                commit.parents.push(parse_parent(&token_str(rest)));
            } else if let Some(rest) = line.strip_prefix(b"merge ") {
                commit.parents.push(parse_parent(&token_str(rest)));
            } else {
                self.reader.push_back(line);
                break;
            }
        }
        if commit.parents.is_empty() {
            if let Some(tip) = self.branch_tips.get(branch) {
                commit.parents.push(ParentLink::Mark(tip.clone()));
                commit.implicit_parent = true;
            }
        }

        // fileops
        loop {
            let Some(line) = self.reader.read_line()? else {
                break;
            };
            let trimmed = line.trim_end();
            let is_fileop = trimmed == b"deleteall"
                || matches!(
                    trimmed.first(),
                    Some(b'M' | b'D' | b'R' | b'C' | b'N')
                        if trimmed.get(1) == Some(&b' ')
                );
            if !is_fileop {
                if line != b"\n" {
                    self.reader.push_back(line);
                }
                break;
            }
            let mut op = FileOp::from_line(trimmed, self.reader.lineno())?;
            if op.is_inline() {
                op.inline = Some(self.parse_data()?.bytes);
            }
            if op.kind == OpKind::Modify {
                if let Some(blob_mark) = op.blob_mark().map(|m| m.to_string()) {
                    match self
                        .repo
                        .find_mark(&blob_mark)
                        .and_then(|i| self.repo.event(i))
                    {
                        Some(Event::Blob(blob)) => blob.add_op(OpRef {
                            commit_mark: mark.clone(),
                            path: op.path.clone(),
                        }),
                        _ if self.repo.config.relax => {
                            if self.repo.config.logmask.contains(LogMask::WARN) {
                                warn!(mark = %blob_mark, "unresolved blob ref accepted under relax");
                            }
                        }
                        _ => {
                            return Err(self.err(format!(
                                "M fileop references unknown blob {blob_mark}"
                            )));
                        }
                    }
                }
            }
            commit.fileops.push(op);
        }

        self.branch_tips
            .insert(branch.to_string(), commit.mark.clone());
        self.repo.append(Event::Commit(Box::new(commit)));
        Ok(())
    }

    fn parse_property(&mut self, rest: &[u8]) -> Result<(String, Vec<u8>)> {
        let rest = rest.trim_end();
        let sp1 = rest
            .find_byte(b' ')
            .ok_or_else(|| self.err("malformed property line"))?;
        let name = rest[..sp1].to_str().map_err(|_| self.err("malformed property name"))?;
        let rest2 = &rest[sp1 + 1..];
        let (count, first_chunk) = match rest2.find_byte(b' ') {
            Some(sp2) => {
                let count: usize = rest2[..sp2]
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| self.err("malformed property count"))?;
                (count, rest2[sp2 + 1..].to_vec())
            }
            None => {
                let count: usize = rest2
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| self.err("malformed property count"))?;
                (count, Vec::new())
            }
        };
        let mut value = first_chunk;
        if value.len() < count {
            // the value continues past the line break we consumed
            value.push(b'\n');
            let missing = count - value.len();
            if missing > 0 {
                value.extend(self.reader.read_exact(missing)?);
            }
            if let Some(next) = self.reader.read_line()? {
                if next != b"\n" {
                    self.reader.push_back(next);
                }
            }
        } else {
            value.truncate(count);
        }
        Ok((name.to_string(), value))
    }

    fn parse_reset(&mut self, refname: &str) -> Result<()> {
        let mut reset = Reset::new(refname, "");
        if let Some(line) = self.reader.read_line()? {
            if let Some(rest) = line.strip_prefix(b"from ") {
                reset.committish = token_str(rest);
            } else {
                self.reader.push_back(line);
            }
        }
        if !reset.committish.is_empty() {
            self.branch_tips
                .insert(refname.to_string(), reset.committish.clone());
        }
        self.repo.append(Event::Reset(reset));
        Ok(())
    }

    fn parse_tag(&mut self, name: &str) -> Result<()> {
        let mut tag = Tag::new(name, "");
        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| self.err("truncated tag"))?;
            if let Some(rest) = line.strip_prefix(b"#legacy-id ") {
                tag.legacy_id = Some(token_str(rest));
            } else if let Some(rest) = line.strip_prefix(b"from ") {
                tag.committish = token_str(rest);
            } else if let Some(rest) = line.strip_prefix(b"tagger ") {
                tag.tagger = Some(
                    Attribution::from_data(rest.trim_end())
                        .map_err(|e| self.err(e.to_string()))?,
                );
            } else {
                self.reader.push_back(line);
                break;
            }
        }
        if tag.committish.is_empty() {
            return Err(self.err(format!("tag {name} without target")));
        }
        let data = self.parse_data()?.bytes;
        tag.comment = self.clean_comment(data);
        self.repo.append(Event::Tag(tag));
        Ok(())
    }
}

/// First whitespace-delimited token of a header remainder, as a string.
fn token_str(rest: &[u8]) -> String {
    rest.trim()
        .split(|&b| b == b' ')
        .next()
        .unwrap_or_default()
        .to_str()
        .unwrap_or_default()
        .to_string()
}

/// Classify a `from`/`merge` operand: marks start with `:`, callouts
/// carry a `!`-bearing action stamp.
fn parse_parent(token: &str) -> ParentLink {
    if token.starts_with(':') {
        ParentLink::Mark(token.to_string())
    } else if token.contains('!') {
        ParentLink::Callout(token.to_string())
    } else {
        // a ref name or raw hash; keep it as an opaque mark-like ref
        ParentLink::Mark(token.to_string())
    }
}
