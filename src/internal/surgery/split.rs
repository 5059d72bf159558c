//! Commit-shape surgery: splitting one commit into two, regex path
//! renames, and lifting a subdirectory of one branch out into a
//! parallel branch of its own.

use std::collections::HashMap;

use regex::bytes::Regex;
use tracing::{debug, info};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{Commit, Event, FileOp, OpKind, ParentLink};
use crate::internal::repo::Repository;

fn under_prefix(path: &[u8], prefix: &[u8]) -> bool {
    path.starts_with(prefix)
}

fn op_under_prefix(op: &FileOp, prefix: &[u8]) -> bool {
    match op.kind {
        OpKind::Rename | OpKind::Copy => {
            under_prefix(&op.path, prefix) || under_prefix(&op.source, prefix)
        }
        OpKind::Deleteall => false,
        _ => under_prefix(&op.path, prefix),
    }
}

fn strip_prefix_from(op: &mut FileOp, prefix: &[u8]) {
    if under_prefix(&op.path, prefix) {
        op.path.drain(..prefix.len());
    }
    if under_prefix(&op.source, prefix) {
        op.source.drain(..prefix.len());
    }
}

impl Repository {
    /// Split the commit at `idx` at fileop boundary `opindex`. The
    /// first half keeps the original mark and the ops before the
    /// boundary; the second half gets a fresh mark, the remaining ops,
    /// the original's children (reparented onto it), and the original
    /// as its only parent. Returns the new mark. Canonicalization is
    /// the caller's responsibility.
    pub fn split_commit_at(&mut self, idx: usize, opindex: usize) -> Result<String> {
        let nops = self
            .events
            .get(idx)
            .and_then(|e| e.as_commit())
            .map(|c| c.fileops.len())
            .ok_or_else(|| SurgeonError::command(format!("event {idx} is not a commit")))?;
        if opindex == 0 || opindex >= nops {
            return Err(SurgeonError::command(format!(
                "split boundary {opindex} out of range 1..{nops}"
            )));
        }
        let new_mark = self.new_mark();
        let original_mark;
        let mut second;
        {
            let commit = self.events[idx].as_commit_mut().expect("checked above");
            original_mark = commit.mark.clone();
            second = commit.clone();
            second.fileops = commit.fileops.split_off(opindex);
            commit.children = Vec::new();
            commit.invalidate_caches();
        }
        second.mark = new_mark.clone();
        second.parents = vec![ParentLink::Mark(original_mark.clone())];
        second.implicit_parent = false;
        second.invalidate_caches();
        // the original's children move onto the second half
        let heirs = second.children.clone();
        second.children = Vec::new();
        self.insert(idx + 1, Event::Commit(Box::new(second)));
        for heir in heirs {
            if let Some(child_idx) = self.find_mark(&heir) {
                let parents = {
                    let child = self.events[child_idx].as_commit().expect("child is commit");
                    child
                        .parents
                        .iter()
                        .map(|p| {
                            if p.mark() == Some(original_mark.as_str()) {
                                ParentLink::Mark(new_mark.clone())
                            } else {
                                p.clone()
                            }
                        })
                        .collect()
                };
                self.set_parents(child_idx, parents)?;
            }
        }
        self.rebuild_children();
        self.invalidate_manifests(idx);
        if self.config.logmask.contains(LogMask::SHOUT) {
            info!(original = %original_mark, second = %new_mark, "split commit");
        }
        Ok(new_mark)
    }

    /// Split the commit at `idx` by path prefix: ops outside the
    /// prefix stay on the original, prefix-bearing ops move to the new
    /// second commit. Returns the new mark.
    pub fn split_commit_by_prefix(&mut self, idx: usize, prefix: &[u8]) -> Result<String> {
        let commit = self
            .events
            .get(idx)
            .and_then(|e| e.as_commit())
            .ok_or_else(|| SurgeonError::command(format!("event {idx} is not a commit")))?;
        let (outside, inside): (Vec<FileOp>, Vec<FileOp>) = commit
            .fileops
            .iter()
            .cloned()
            .partition(|op| !op_under_prefix(op, prefix));
        if outside.is_empty() || inside.is_empty() {
            return Err(SurgeonError::command(format!(
                "prefix {} does not split commit {}",
                String::from_utf8_lossy(prefix),
                commit.mark
            )));
        }
        let boundary = outside.len();
        {
            let commit = self.events[idx].as_commit_mut().expect("checked above");
            let mut reordered = outside;
            reordered.extend(inside);
            commit.fileops = reordered;
        }
        self.split_commit_at(idx, boundary)
    }

    /// Rename paths across the selected commits by regex substitution.
    /// Every planned rename is verified first: the new path must not
    /// collide with an existing fileop target in the same commit nor
    /// with a path visible in the first parent's manifest, unless
    /// `force`. Only after all checks pass is anything written.
    pub fn path_rename(
        &mut self,
        sel: &[usize],
        pattern: &Regex,
        replacement: &[u8],
        force: bool,
    ) -> Result<()> {
        struct Planned {
            idx: usize,
            opindex: usize,
            new_path: Option<Vec<u8>>,
            new_source: Option<Vec<u8>>,
        }
        let mut plan: Vec<Planned> = Vec::new();
        for &idx in sel {
            let commit = self
                .events
                .get(idx)
                .and_then(|e| e.as_commit())
                .ok_or_else(|| {
                    SurgeonError::command(format!("path rename selection {idx} is not a commit"))
                })?;
            for (opindex, op) in commit.fileops.iter().enumerate() {
                let new_path = substitute(pattern, &op.path, replacement);
                let new_source = match op.kind {
                    OpKind::Rename | OpKind::Copy => substitute(pattern, &op.source, replacement),
                    _ => None,
                };
                if new_path.is_some() || new_source.is_some() {
                    plan.push(Planned {
                        idx,
                        opindex,
                        new_path,
                        new_source,
                    });
                }
            }
        }
        if plan.is_empty() {
            return Ok(());
        }
        if !force {
            for p in &plan {
                let Some(new_path) = &p.new_path else { continue };
                let commit = self.events[p.idx].as_commit().expect("validated");
                let clash_in_commit = commit
                    .fileops
                    .iter()
                    .enumerate()
                    .any(|(k, op)| k != p.opindex && op.path == *new_path);
                if clash_in_commit {
                    return Err(SurgeonError::command(format!(
                        "path rename target {} collides inside commit {}",
                        String::from_utf8_lossy(new_path),
                        commit.mark
                    )));
                }
                let parent = commit.first_parent_mark().map(|m| m.to_string());
                if let Some(pidx) = parent.and_then(|m| self.find_mark(&m)) {
                    if self.manifest(pidx)?.get(new_path).is_some() {
                        let mark = self.events[p.idx]
                            .as_commit()
                            .map(|c| c.mark.clone())
                            .unwrap_or_default();
                        return Err(SurgeonError::command(format!(
                            "path rename target {} already visible in ancestors of {}",
                            String::from_utf8_lossy(new_path),
                            mark
                        )));
                    }
                }
            }
        }
        // all checks passed: commit atomically
        let mut touched: Vec<usize> = Vec::new();
        for p in plan {
            let commit = self.events[p.idx].as_commit_mut().expect("validated");
            let op = &mut commit.fileops[p.opindex];
            if let Some(path) = p.new_path {
                op.path = path;
            }
            if let Some(source) = p.new_source {
                op.source = source;
            }
            commit.invalidate_caches();
            touched.push(p.idx);
        }
        touched.dedup();
        for idx in touched {
            self.invalidate_manifests(idx);
        }
        Ok(())
    }

    /// Lift the history under `prefix` on `source_branch` onto a new
    /// parallel branch. Commits entirely under the prefix move whole;
    /// mixed commits are split and their prefix fragment moves. The
    /// source-side chain is restitched around the lifted commits, and
    /// merge edges into the source side stay there.
    pub fn branch_lift(
        &mut self,
        source_branch: &str,
        prefix: &[u8],
        new_branch: &str,
    ) -> Result<()> {
        if self.branches().contains(new_branch) {
            return Err(SurgeonError::command(format!(
                "branch {new_branch} already exists"
            )));
        }
        let source_marks: Vec<String> = self
            .events
            .iter()
            .filter_map(|e| e.as_commit())
            .filter(|c| c.branch == source_branch)
            .map(|c| c.mark.clone())
            .collect();
        if source_marks.is_empty() {
            return Err(SurgeonError::command(format!(
                "no commits on branch {source_branch}"
            )));
        }
        let mut last_lifted: Option<String> = None;
        // lifted mark → its source-side predecessor at lift time
        let mut lifted_pred: HashMap<String, Option<String>> = HashMap::new();
        for mark in &source_marks {
            let idx = self
                .find_mark(mark)
                .ok_or_else(|| SurgeonError::internal("source commit vanished"))?;
            let (ops, first_parent) = {
                let c = self.events[idx].as_commit().expect("source is commit");
                (
                    c.fileops.clone(),
                    c.first_parent_mark().map(|m| m.to_string()),
                )
            };
            // a parent that was itself lifted resolves through to its
            // source predecessor
            let source_pred = match &first_parent {
                Some(p) => match lifted_pred.get(p) {
                    Some(pred) => pred.clone(),
                    None => Some(p.clone()),
                },
                None => None,
            };
            let lifted_count = ops.iter().filter(|op| op_under_prefix(op, prefix)).count();
            if lifted_count == 0 {
                continue;
            }
            if lifted_count == ops.len() {
                // move the whole commit
                lifted_pred.insert(mark.clone(), source_pred);
                let parents = match &last_lifted {
                    Some(prev) => vec![ParentLink::Mark(prev.clone())],
                    None => Vec::new(),
                };
                {
                    let c = self.events[idx].as_commit_mut().expect("source is commit");
                    c.branch = new_branch.to_string();
                    for op in &mut c.fileops {
                        strip_prefix_from(op, prefix);
                    }
                    c.implicit_parent = false;
                    c.invalidate_caches();
                }
                self.set_parents(idx, parents)?;
                last_lifted = Some(mark.clone());
            } else if lifted_count > 0 {
                // mixed: the prefix fragment becomes a fresh commit on
                // the new branch; the remainder keeps the source shape
                let fragment_mark = self.new_mark();
                let mut fragment;
                {
                    let c = self.events[idx].as_commit_mut().expect("source is commit");
                    fragment = Commit::new(&fragment_mark, new_branch, c.committer.clone());
                    fragment.authors = c.authors.clone();
                    fragment.comment = c.comment.clone();
                    fragment.fileops = c
                        .fileops
                        .iter()
                        .filter(|op| op_under_prefix(op, prefix))
                        .cloned()
                        .collect();
                    for op in &mut fragment.fileops {
                        strip_prefix_from(op, prefix);
                    }
                    c.fileops.retain(|op| !op_under_prefix(op, prefix));
                    c.invalidate_caches();
                }
                if let Some(prev) = &last_lifted {
                    fragment.parents = vec![ParentLink::Mark(prev.clone())];
                }
                self.insert(idx + 1, Event::Commit(Box::new(fragment)));
                self.invalidate_manifests(idx);
                last_lifted = Some(fragment_mark);
            }
        }
        // restitch everything that still points at a lifted commit
        let fixups: Vec<(usize, Vec<ParentLink>)> = self
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let c = e.as_commit()?;
                if c.branch == new_branch {
                    return None;
                }
                let needs = c
                    .parent_marks()
                    .any(|m| lifted_pred.contains_key(m));
                if !needs {
                    return None;
                }
                let mut parents: Vec<ParentLink> = Vec::new();
                for p in &c.parents {
                    match p.mark().and_then(|m| lifted_pred.get(m)) {
                        Some(Some(pred)) => {
                            let link = ParentLink::Mark(pred.clone());
                            if !parents.contains(&link) {
                                parents.push(link);
                            }
                        }
                        Some(None) => {}
                        None => parents.push(p.clone()),
                    }
                }
                Some((i, parents))
            })
            .collect();
        for (idx, parents) in fixups {
            self.set_parents(idx, parents)?;
        }
        self.rebuild_children();
        self.resort()?;
        debug!(source = source_branch, new = new_branch, "branch lift complete");
        Ok(())
    }
}

/// Apply the regex substitution to a path, returning the new path only
/// if it changed.
fn substitute(pattern: &Regex, path: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if path.is_empty() || !pattern.is_match(path) {
        return None;
    }
    let new = pattern.replace_all(path, replacement).into_owned();
    if new == path { None } else { Some(new) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn mixed_repo() -> Repository {
        let mut repo = Repository::new("sp", Config::for_tests()).unwrap();
        repo.read_stream_bytes(
            b"blob\nmark :1\ndata 2\na\n\nblob\nmark :2\ndata 2\nb\n\ncommit refs/heads/master\nmark :3\ncommitter A <a@b.c> 100 +0000\ndata 6\nmixed\nM 100644 :1 src/a.c\nM 100644 :2 doc/a.txt\ncommit refs/heads/master\nmark :4\ncommitter A <a@b.c> 200 +0000\ndata 6\nafter\nM 100644 :1 src/b.c\n",
        )
        .unwrap();
        repo
    }

    #[test]
    fn test_split_by_prefix() {
        let mut repo = mixed_repo();
        let idx = repo.find_mark(":3").unwrap();
        let new_mark = repo.split_commit_by_prefix(idx, b"src/").unwrap();
        // original keeps the non-prefix op and its mark
        let first = repo.commit_by_mark(":3").unwrap();
        assert_eq!(first.fileops.len(), 1);
        assert_eq!(first.fileops[0].path, b"doc/a.txt".to_vec());
        // second is consecutive, fresh-marked, prefix-bearing
        let second_idx = repo.find_mark(&new_mark).unwrap();
        assert_eq!(second_idx, repo.find_mark(":3").unwrap() + 1);
        let second = repo.commit_by_mark(&new_mark).unwrap();
        assert_eq!(second.fileops[0].path, b"src/a.c".to_vec());
        assert_eq!(second.first_parent_mark(), Some(":3"));
        // the original's child now hangs off the second half
        assert_eq!(second.children, vec![":4"]);
        assert!(repo.commit_by_mark(":3").unwrap().children == vec![new_mark.clone()]);
        let c4 = repo.commit_by_mark(":4").unwrap();
        assert_eq!(c4.first_parent_mark(), Some(new_mark.as_str()));
    }

    #[test]
    fn test_split_out_of_range() {
        let mut repo = mixed_repo();
        let idx = repo.find_mark(":3").unwrap();
        assert!(repo.split_commit_at(idx, 0).is_err());
        assert!(repo.split_commit_at(idx, 2).is_err());
        assert!(repo.split_commit_at(idx, 1).is_ok());
    }

    #[test]
    fn test_path_rename() {
        let mut repo = mixed_repo();
        let sel: Vec<usize> = (0..repo.len())
            .filter(|&i| repo.events()[i].is_commit())
            .collect();
        let pattern = Regex::new("^src/").unwrap();
        repo.path_rename(&sel, &pattern, b"lib/", false).unwrap();
        let c3 = repo.commit_by_mark(":3").unwrap();
        assert!(c3.fileops.iter().any(|op| op.path == b"lib/a.c".to_vec()));
        let tip = repo.find_mark(":4").unwrap();
        let manifest = repo.manifest(tip).unwrap();
        assert!(manifest.get(b"lib/b.c").is_some());
        assert!(manifest.get(b"src/b.c").is_none());
    }

    #[test]
    fn test_path_rename_collision_rejected() {
        let mut repo = mixed_repo();
        let sel: Vec<usize> = (0..repo.len())
            .filter(|&i| repo.events()[i].is_commit())
            .collect();
        // renaming src/a.c onto doc/a.txt collides inside :3
        let pattern = Regex::new("^src/a\\.c$").unwrap();
        let err = repo
            .path_rename(&sel, &pattern, b"doc/a.txt", false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Command);
        // untouched
        assert!(
            repo.commit_by_mark(":3")
                .unwrap()
                .fileops
                .iter()
                .any(|op| op.path == b"src/a.c".to_vec())
        );
        // force pushes it through
        repo.path_rename(&sel, &pattern, b"doc/a.txt", true).unwrap();
    }

    #[test]
    fn test_path_rename_ancestor_visibility_rejected() {
        let mut repo = mixed_repo();
        let idx = repo.find_mark(":4").unwrap();
        // :4 touches src/b.c; renaming it to src/a.c collides with the
        // entry already visible in :3's manifest... via the fragment
        let pattern = Regex::new("^src/b\\.c$").unwrap();
        let err = repo
            .path_rename(&[idx], &pattern, b"src/a.c", false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Command);
    }

    #[test]
    fn test_branch_lift_whole_and_mixed() {
        let mut repo = mixed_repo();
        repo.branch_lift("refs/heads/master", b"src/", "refs/heads/src-only")
            .unwrap();
        // :3 was mixed: its remainder stays, a fragment lifted
        let c3 = repo.commit_by_mark(":3").unwrap();
        assert_eq!(c3.branch, "refs/heads/master");
        assert_eq!(c3.fileops.len(), 1);
        // :4 was entirely under src/: lifted whole, prefix stripped
        let c4 = repo.commit_by_mark(":4").unwrap();
        assert_eq!(c4.branch, "refs/heads/src-only");
        assert_eq!(c4.fileops[0].path, b"b.c".to_vec());
        // the lifted chain is parallel: fragment → :4
        let frag_mark = c4.first_parent_mark().unwrap().to_string();
        let frag = repo.commit_by_mark(&frag_mark).unwrap();
        assert_eq!(frag.branch, "refs/heads/src-only");
        assert_eq!(frag.fileops[0].path, b"a.c".to_vec());
        assert!(frag.parents.is_empty());
    }
}
