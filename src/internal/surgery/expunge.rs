//! Expunge: erase paths matching (or not matching) a pattern from the
//! whole history, then convert commits left empty into annotated tags.

use regex::bytes::Regex;
use tracing::{debug, info};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{Event, FileOp, OpKind, Tag};
use crate::internal::repo::Repository;
use crate::internal::surgery::squash::SquashPolicy;

/// Branches whose parentless empty commits are preserved rather than
/// tagified.
const MAIN_BRANCHES: [&str; 2] = ["refs/heads/master", "refs/heads/main"];

impl Repository {
    /// Rewrite every commit's fileops so that paths matching `pattern`
    /// disappear from history (or, with `keep_matching`, so that only
    /// matching paths survive). Commits left with no fileops are
    /// tagified; unreferenced blobs are collected.
    pub fn expunge(&mut self, pattern: &Regex, keep_matching: bool) -> Result<()> {
        let hit = |path: &[u8]| -> bool {
            let matched = pattern.is_match(path);
            if keep_matching { !matched } else { matched }
        };
        let mut altered: Vec<usize> = Vec::new();
        for (i, event) in self.events.iter_mut().enumerate() {
            let Event::Commit(commit) = event else {
                continue;
            };
            let mut changed = false;
            let mut rewritten: Vec<FileOp> = Vec::new();
            for op in commit.fileops.drain(..) {
                match op.kind {
                    OpKind::Modify | OpKind::Delete | OpKind::Note => {
                        if hit(&op.path) {
                            changed = true;
                        } else {
                            rewritten.push(op);
                        }
                    }
                    OpKind::Rename | OpKind::Copy => {
                        if hit(&op.source) {
                            // the source never existed in the rewritten
                            // history: a rename decays to a delete of
                            // it, a copy has nothing left to do
                            changed = true;
                            if op.kind == OpKind::Rename {
                                rewritten.push(FileOp::delete(&op.source));
                            }
                        } else if hit(&op.path) {
                            changed = true;
                            if op.kind == OpKind::Rename {
                                rewritten.push(FileOp::delete(&op.path));
                            }
                        } else {
                            rewritten.push(op);
                        }
                    }
                    OpKind::Deleteall => rewritten.push(op),
                }
            }
            if changed {
                commit.invalidate_caches();
                altered.push(i);
            }
            commit.fileops = rewritten;
        }
        for &i in &altered {
            self.invalidate_manifests(i);
        }
        if self.config.logmask.contains(LogMask::SHOUT) {
            info!(
                repo = %self.name,
                altered = altered.len(),
                "expunge rewrote fileops"
            );
        }
        self.rebuild_blob_refs();
        self.tagify_empty(None, false)?;
        self.gc_blobs();
        Ok(())
    }

    /// Convert empty commits (no fileops, or only deletes at a branch
    /// tip) into annotated tags on their first parent, then delete
    /// them with attachments following backwards. Merge commits are
    /// left alone unless `tagify_merges` is set. Parentless empty
    /// commits survive on main branches and are an error elsewhere.
    pub fn tagify_empty(&mut self, sel: Option<&[usize]>, tagify_merges: bool) -> Result<()> {
        let candidates: Vec<usize> = match sel {
            Some(sel) => sel.to_vec(),
            None => (0..self.events.len()).collect(),
        };
        let mut doomed: Vec<usize> = Vec::new();
        let mut new_tags: Vec<Tag> = Vec::new();
        for &i in &candidates {
            let Some(commit) = self.events.get(i).and_then(|e| e.as_commit()) else {
                continue;
            };
            let tip = self.branch_tip(&commit.branch) == Some(i);
            let empty = commit.is_empty() || (tip && commit.all_deletes());
            if !empty {
                continue;
            }
            if commit.parents.len() > 1 && !tagify_merges {
                continue;
            }
            match commit.first_parent_mark() {
                Some(parent) => {
                    let name = tag_name_for(commit);
                    if self.config.logmask.contains(LogMask::TAGFIX) {
                        debug!(mark = %commit.mark, %name, "tagifying empty commit");
                    }
                    let mut tag = Tag::new(&name, parent);
                    tag.tagger = Some(commit.committer.clone());
                    tag.comment = commit.comment.clone();
                    tag.legacy_id = commit.legacy_id.clone();
                    new_tags.push(tag);
                    doomed.push(i);
                }
                None if MAIN_BRANCHES.contains(&commit.branch.as_str()) => {
                    // a parentless empty root on the main line is
                    // normal bootstrap shape; leave it be
                }
                None => {
                    return Err(SurgeonError::command(format!(
                        "empty parentless commit {} on {} cannot be tagified",
                        commit.mark, commit.branch
                    )));
                }
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }
        for tag in new_tags {
            self.append(Event::Tag(tag));
        }
        let policy = SquashPolicy {
            tagback: true,
            ..SquashPolicy::deletion()
        };
        self.squash(&doomed, policy)
    }
}

/// Default tag naming for tagified commits.
fn tag_name_for(commit: &crate::internal::event::Commit) -> String {
    match &commit.legacy_id {
        Some(lid) => format!("emptycommit-{lid}"),
        None => format!(
            "emptycommit-{}",
            commit.mark.trim_start_matches(':')
        ),
    }
}
