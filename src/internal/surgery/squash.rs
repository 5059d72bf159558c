//! Squash and delete: remove commits from the graph while deciding
//! where their content and attachments go.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{Event, FileOp, ParentLink, Reset};
use crate::internal::repo::Repository;

/// Policy flags steering a squash. `delete` marks the selection for
/// removal outright; the push/tag flags choose where fileops and
/// attachments migrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquashPolicy {
    pub delete: bool,
    /// Canonicalize every altered commit afterwards.
    pub coalesce: bool,
    /// Refuse to remove commits that still carry fileops.
    pub empty_only: bool,
    /// Append the removed commit's fileops to its first parent.
    pub pushback: bool,
    /// Prepend the removed commit's fileops to its first-parent
    /// children.
    pub pushforward: bool,
    /// Reattach tags and resets to the first parent.
    pub tagback: bool,
    /// Reattach tags and resets to the first child.
    pub tagforward: bool,
    /// Synthesize a reset when removing a branch tip would orphan the
    /// branch ref.
    pub preserve_refs: bool,
    pub no_preserve_refs: bool,
    pub quiet: bool,
    /// Also remove blobs named in the selection.
    pub blobs: bool,
}

impl SquashPolicy {
    /// The policy `delete` uses: removal with no content migration.
    pub fn deletion() -> SquashPolicy {
        SquashPolicy {
            delete: true,
            quiet: true,
            ..Default::default()
        }
    }
}

impl Repository {
    /// Remove the selected events, migrating content and attachments
    /// according to `policy`. The selection is processed in ascending
    /// event order so pushback is well-defined; all preconditions are
    /// checked before the first mutation.
    pub fn squash(&mut self, sel: &[usize], policy: SquashPolicy) -> Result<()> {
        let mut policy = policy;
        // a squash that is not a deletion coalesces content into the
        // first parent unless the caller chose a direction
        if !policy.delete && !policy.pushback && !policy.pushforward {
            policy.pushback = true;
        }
        let mut selection: Vec<usize> = sel.to_vec();
        selection.sort_unstable();
        selection.dedup();

        let mut commit_marks: Vec<String> = Vec::new();
        let mut flag_directly: Vec<usize> = Vec::new();
        for &i in &selection {
            match self.events.get(i) {
                Some(Event::Commit(c)) => commit_marks.push(c.mark.clone()),
                Some(Event::Blob(_)) => {
                    if policy.blobs {
                        flag_directly.push(i);
                    }
                }
                Some(Event::Tag(_) | Event::Reset(_) | Event::Passthrough(_)) => {
                    flag_directly.push(i)
                }
                Some(Event::Callout(_)) => flag_directly.push(i),
                None => {
                    return Err(SurgeonError::command(format!(
                        "selection index {i} is out of range"
                    )));
                }
            }
        }

        // precondition pass: nothing below may mutate until these hold
        let doomed: BTreeSet<&String> = commit_marks.iter().collect();
        for mark in &commit_marks {
            let commit = self
                .commit_by_mark(mark)
                .ok_or_else(|| SurgeonError::internal("selected commit vanished"))?;
            if policy.empty_only && !commit.fileops.is_empty() {
                return Err(SurgeonError::command(format!(
                    "commit {mark} still has fileops; refusing under empty-only"
                )));
            }
            if policy.pushback {
                if let Some(pmark) = commit.first_parent_mark() {
                    if doomed.contains(&pmark.to_string()) {
                        continue;
                    }
                    let parent = self.commit_by_mark(pmark).ok_or_else(|| {
                        SurgeonError::command(format!("commit {mark} has dangling parent {pmark}"))
                    })?;
                    let first_parent_children = parent
                        .children
                        .iter()
                        .filter(|child| {
                            self.commit_by_mark(child)
                                .is_some_and(|c| c.first_parent_mark() == Some(pmark))
                        })
                        .count();
                    if first_parent_children > 1 {
                        return Err(SurgeonError::command(format!(
                            "cannot push back through {pmark}: it has {first_parent_children} first-parent children"
                        )));
                    }
                }
            }
        }

        let mut altered: BTreeSet<String> = BTreeSet::new();
        for mark in &commit_marks {
            self.squash_one(mark, &policy, &mut altered)?;
        }
        for i in flag_directly {
            self.events[i].set_deleteme(true);
        }

        let removed = commit_marks.len();
        self.sweep_deleted();
        self.gc_blobs();
        if policy.coalesce {
            let marks: Vec<String> = altered.into_iter().collect();
            for mark in marks {
                if let Some(idx) = self.find_mark(&mark) {
                    self.canonicalize(idx)?;
                }
            }
        }
        if !policy.quiet && self.config.logmask.contains(LogMask::SHOUT) {
            info!(repo = %self.name, removed, "squash complete");
        }
        Ok(())
    }

    /// `delete` is squash with the deletion policy merged in.
    pub fn delete_events(&mut self, sel: &[usize], policy: SquashPolicy) -> Result<()> {
        let merged = SquashPolicy {
            delete: true,
            quiet: true,
            ..policy
        };
        self.squash(sel, merged)
    }

    fn squash_one(
        &mut self,
        mark: &str,
        policy: &SquashPolicy,
        altered: &mut BTreeSet<String>,
    ) -> Result<()> {
        let idx = self
            .find_mark(mark)
            .ok_or_else(|| SurgeonError::internal(format!("squash target {mark} vanished")))?;
        let (branch, fileops, comment, children, spliced_parents, first_parent, was_root, was_tip) = {
            let commit = self.events[idx]
                .as_commit()
                .ok_or_else(|| SurgeonError::internal("squash target is not a commit"))?;
            (
                commit.branch.clone(),
                commit.fileops.clone(),
                commit.comment.clone(),
                commit.children.clone(),
                // callout parents do not survive splicing
                commit
                    .parent_marks()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>(),
                commit.first_parent_mark().map(|m| m.to_string()),
                commit.parents.is_empty(),
                self.branch_tip(&branch_of(&self.events[idx])) == Some(idx),
            )
        };

        let new_target: Option<String> = if policy.tagforward {
            children.first().cloned()
        } else {
            first_parent.clone()
        };

        // reparent children, splicing in the removed commit's parents
        for child_mark in &children {
            let Some(child_idx) = self.find_mark(child_mark) else {
                continue;
            };
            let (old_parents, child_first) = {
                let child = self.events[child_idx].as_commit().expect("child is commit");
                (
                    child.parents.clone(),
                    child.first_parent_mark().map(|m| m.to_string()),
                )
            };
            let mut new_parents: Vec<ParentLink> = Vec::new();
            for p in old_parents {
                if p.mark() == Some(mark) {
                    for grand in &spliced_parents {
                        let link = ParentLink::Mark(grand.clone());
                        if grand != child_mark && !new_parents.contains(&link) {
                            new_parents.push(link);
                        }
                    }
                } else if !new_parents.contains(&p) {
                    new_parents.push(p);
                }
            }
            if policy.pushforward && child_first.as_deref() == Some(mark) {
                let mut inherited = fileops.clone();
                if was_root {
                    // the child now starts from an empty tree
                    inherited.insert(0, FileOp::deleteall());
                }
                let child = self.events[child_idx]
                    .as_commit_mut()
                    .expect("child is commit");
                child.fileops.splice(0..0, inherited);
                child.invalidate_caches();
            }
            self.set_parents(child_idx, new_parents)?;
            altered.insert(child_mark.clone());
        }

        // push content back into the first parent
        if policy.pushback {
            if let Some(pmark) = &first_parent {
                if let Some(pidx) = self.find_mark(pmark) {
                    {
                        let parent = self.events[pidx]
                            .as_commit_mut()
                            .expect("parent is commit");
                        parent.fileops.extend(fileops.iter().cloned());
                        parent.comment = join_comments(&parent.comment, &comment);
                        parent.invalidate_caches();
                    }
                    self.invalidate_manifests(pidx);
                    altered.insert(pmark.clone());
                    // slide the parent down next to the removed commit
                    // so blob references stay ahead of their users
                    let didx = self.find_mark(mark).expect("still present");
                    if pidx + 1 < didx {
                        let event = self.events.remove(pidx);
                        self.events.insert(didx - 1, event);
                        self.declare_sequence_mutation("pushback slide");
                    }
                }
            }
        }

        // move or drop attachments
        let mut synth_reset = None;
        if policy.preserve_refs && !policy.no_preserve_refs && was_tip {
            if let Some(target) = &new_target {
                let target_branch = self
                    .commit_by_mark(target)
                    .map(|c| c.branch.clone())
                    .unwrap_or_default();
                if target_branch != branch {
                    synth_reset = Some(Reset::new(&branch, target));
                }
            }
        }
        let tagfix = self.config.logmask.contains(LogMask::TAGFIX);
        for event in &mut self.events {
            match event {
                Event::Tag(t) if t.committish == mark => match &new_target {
                    Some(target) => {
                        if tagfix {
                            debug!(tag = %t.name, %target, "reattached tag");
                        }
                        t.committish = target.clone();
                    }
                    None => t.deleteme = true,
                },
                Event::Reset(r) if r.committish == mark => match &new_target {
                    Some(target) => r.committish = target.clone(),
                    None => r.deleteme = true,
                },
                _ => {}
            }
        }
        if let Some(reset) = synth_reset {
            if tagfix {
                debug!(branch = %reset.refname, "synthesized reset for preserved ref");
            }
            self.append(Event::Reset(reset));
        }

        let idx = self.find_mark(mark).expect("still present");
        self.events[idx].set_deleteme(true);
        if self.config.logmask.contains(LogMask::DELETE) && !policy.quiet {
            debug!(%mark, branch = %branch, "deleted commit");
        }
        Ok(())
    }
}

fn branch_of(event: &Event) -> String {
    event
        .as_commit()
        .map(|c| c.branch.clone())
        .unwrap_or_default()
}

/// Concatenate comments, skipping empty halves.
fn join_comments(first: &[u8], second: &[u8]) -> Vec<u8> {
    let first_empty = first.iter().all(|b| b.is_ascii_whitespace());
    let second_empty = second.iter().all(|b| b.is_ascii_whitespace());
    match (first_empty, second_empty) {
        (true, _) => second.to_vec(),
        (_, true) => first.to_vec(),
        (false, false) => {
            let mut out = first.to_vec();
            if !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            out.extend_from_slice(second);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::internal::stream::WriteOptions;

    fn three_commit_repo() -> Repository {
        let mut repo = Repository::new("sq", Config::for_tests()).unwrap();
        repo.read_stream_bytes(
            b"blob\nmark :1\ndata 3\nv1\n\nblob\nmark :3\ndata 3\nv2\n\nblob\nmark :5\ndata 3\nv3\n\ncommit refs/heads/master\nmark :2\ncommitter A <a@b.c> 100 +0000\ndata 4\none\nM 100644 :1 README\ncommit refs/heads/master\nmark :4\ncommitter A <a@b.c> 200 +0000\ndata 4\ntwo\nM 100644 :3 README\ncommit refs/heads/master\nmark :6\ncommitter A <a@b.c> 300 +0000\ndata 6\nthree\nM 100644 :5 README\ntag v3\nfrom :6\ntagger A <a@b.c> 300 +0000\ndata 3\nv3\n",
        )
        .unwrap();
        repo
    }

    #[test]
    fn test_delete_middle_commit() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":4").unwrap();
        repo.delete_events(&[idx], SquashPolicy::default()).unwrap();
        assert!(repo.find_mark(":4").is_none());
        // :6 reparented onto :2
        let c6 = repo.commit_by_mark(":6").unwrap();
        assert_eq!(c6.first_parent_mark(), Some(":2"));
        assert_eq!(repo.commit_by_mark(":2").unwrap().children, vec![":6"]);
        // the middle blob lost its only referrer
        assert!(repo.find_mark(":3").is_none());
        // tip content survives
        let tip = repo.find_mark(":6").unwrap();
        let manifest = repo.manifest(tip).unwrap();
        assert_eq!(manifest.get(b"README").unwrap().committish, ":5");
    }

    #[test]
    fn test_delete_tip_reattaches_tag_to_parent() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":6").unwrap();
        repo.delete_events(&[idx], SquashPolicy::default()).unwrap();
        let tag = repo
            .events()
            .iter()
            .find_map(|e| match e {
                Event::Tag(t) => Some(t),
                _ => None,
            })
            .unwrap();
        assert_eq!(tag.committish, ":4");
        assert!(repo.find_mark(":5").is_none());
    }

    #[test]
    fn test_pushforward_preserves_tip_content() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":4").unwrap();
        let policy = SquashPolicy {
            pushforward: true,
            tagforward: true,
            ..SquashPolicy::deletion()
        };
        repo.squash(&[idx], policy).unwrap();
        let c6 = repo.commit_by_mark(":6").unwrap();
        // inherited op first, own op second
        assert_eq!(c6.fileops.len(), 2);
        assert_eq!(c6.fileops[0].committish, ":3");
        let tip = repo.find_mark(":6").unwrap();
        let manifest = repo.manifest(tip).unwrap();
        assert_eq!(manifest.get(b"README").unwrap().committish, ":5");
    }

    #[test]
    fn test_pushback_merges_content_and_comment() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":6").unwrap();
        let policy = SquashPolicy {
            pushback: true,
            ..SquashPolicy::deletion()
        };
        repo.squash(&[idx], policy).unwrap();
        let c4 = repo.commit_by_mark(":4").unwrap();
        assert_eq!(c4.fileops.len(), 2);
        assert_eq!(c4.comment, b"two\nthree\n".to_vec());
        let tip = repo.find_mark(":4").unwrap();
        let manifest = repo.manifest(tip).unwrap();
        assert_eq!(manifest.get(b"README").unwrap().committish, ":5");
    }

    #[test]
    fn test_empty_only_refuses_content() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":4").unwrap();
        let policy = SquashPolicy {
            empty_only: true,
            ..SquashPolicy::deletion()
        };
        let err = repo.squash(&[idx], policy).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Command);
        // untouched on failure
        assert!(repo.find_mark(":4").is_some());
    }

    #[test]
    fn test_delete_root_with_pushforward_gets_deleteall() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":2").unwrap();
        let policy = SquashPolicy {
            pushforward: true,
            tagforward: true,
            ..SquashPolicy::deletion()
        };
        repo.squash(&[idx], policy).unwrap();
        let c4 = repo.commit_by_mark(":4").unwrap();
        assert!(c4.parents.is_empty());
        assert_eq!(
            c4.fileops[0].kind,
            crate::internal::event::OpKind::Deleteall
        );
    }

    #[test]
    fn test_squash_result_still_serializes() {
        let mut repo = three_commit_repo();
        let idx = repo.find_mark(":4").unwrap();
        repo.delete_events(&[idx], SquashPolicy::default()).unwrap();
        let mut out = Vec::new();
        repo.write_stream(&mut out, &WriteOptions::default()).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("mark :4"));
        // the reattachment survives a parse of the written stream
        let mut reread = Repository::new("sq2", Config::for_tests()).unwrap();
        reread.read_stream_bytes(&out).unwrap();
        let c6 = reread.commit_by_mark(":6").unwrap();
        assert_eq!(c6.first_parent_mark(), Some(":2"));
    }
}
