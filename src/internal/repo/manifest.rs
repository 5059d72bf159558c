//! The manifest engine: folds fileop lists along first-parent chains
//! into full tree states, memoizing per commit, and derives the
//! content-addressed tree and commit hashes from the result.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::errors::{Result, SurgeonError};
use crate::hash::{GitHash, ObjectKind};
use crate::internal::event::{Event, FileOp, OpKind};
use crate::internal::pathmap::PathMap;
use crate::internal::repo::Repository;

/// Fold a fileop list over a parent manifest. Only the ops after the
/// *last* deleteall have effect; the effective parent for them is the
/// empty tree. With `keep_unresolved`, a rename whose source is absent
/// is kept as an entry at its destination; otherwise it is dropped.
pub fn apply_fileops(
    parent: &PathMap<FileOp>,
    ops: &[FileOp],
    keep_unresolved: bool,
) -> PathMap<FileOp> {
    let start = ops
        .iter()
        .rposition(|op| op.kind == OpKind::Deleteall)
        .map(|i| i + 1);
    let (mut manifest, ops) = match start {
        Some(i) => (PathMap::new(), &ops[i..]),
        None => (parent.snapshot(), ops),
    };
    for op in ops {
        match op.kind {
            OpKind::Modify => manifest.set(&op.path, op.clone()),
            OpKind::Delete => manifest.remove(&op.path),
            OpKind::Rename => match manifest.get(&op.source).cloned() {
                Some(entry) => {
                    manifest.remove(&op.source);
                    let mut moved = entry;
                    moved.path = op.path.clone();
                    manifest.set(&op.path, moved);
                }
                None if keep_unresolved => manifest.set(&op.path, op.clone()),
                None => {}
            },
            OpKind::Copy => {
                if let Some(entry) = manifest.get(&op.source).cloned() {
                    let mut copied = entry;
                    copied.path = op.path.clone();
                    manifest.set(&op.path, copied);
                }
            }
            // Notes annotate; they are not part of the main tree.
            OpKind::Note => {}
            OpKind::Deleteall => {}
        }
    }
    manifest
}

/// Compare paths for emission order: inside a shared prefix, the deeper
/// path sorts first so files under a directory are emitted before the
/// directory can be replaced by a file of the same name.
pub fn emission_path_cmp(a: &[u8], b: &[u8]) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if is_path_prefix(b, a) {
        return Ordering::Less;
    }
    if is_path_prefix(a, b) {
        return Ordering::Greater;
    }
    a.cmp(b)
}

fn is_path_prefix(prefix: &[u8], path: &[u8]) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path[prefix.len()] == b'/'
}

/// Remake a fileop list in canonical emission order: deleteall first,
/// then renames/copies (their sources reference pre-commit state), then
/// modifies/deletes in emission path order, then notes.
pub fn reorder_fileops(ops: Vec<FileOp>) -> Vec<FileOp> {
    let mut deleteall = Vec::new();
    let mut moves = Vec::new();
    let mut edits = Vec::new();
    let mut notes = Vec::new();
    for op in ops {
        match op.kind {
            OpKind::Deleteall => deleteall.push(op),
            OpKind::Rename | OpKind::Copy => moves.push(op),
            OpKind::Modify | OpKind::Delete => edits.push(op),
            OpKind::Note => notes.push(op),
        }
    }
    edits.sort_by(|a, b| emission_path_cmp(&a.path, &b.path));
    deleteall.truncate(1);
    let mut out = deleteall;
    out.extend(moves);
    out.extend(edits);
    out.extend(notes);
    out
}

/// Same tree content as another M entry, ignoring the recorded path.
fn same_entry(a: &FileOp, b: &FileOp) -> bool {
    a.mode == b.mode && a.committish == b.committish && a.inline == b.inline
}

impl Repository {
    /// The full tree state at a commit, computed lazily: climb the
    /// first-parent chain to the nearest cached ancestor, then fold
    /// back down caching each step.
    pub fn manifest(&mut self, idx: usize) -> Result<Arc<PathMap<FileOp>>> {
        let mut chain = Vec::new();
        let mut base: Option<Arc<PathMap<FileOp>>> = None;
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let commit = self.events[i]
                .as_commit()
                .ok_or_else(|| SurgeonError::internal(format!("event {i} is not a commit")))?;
            if let Some(cached) = &commit.manifest_cache {
                base = Some(Arc::clone(cached));
                break;
            }
            chain.push(i);
            if chain.len() > self.events.len() {
                return Err(SurgeonError::internal("ancestry cycle while building manifest"));
            }
            cur = commit
                .first_parent_mark()
                .map(|m| m.to_string())
                .and_then(|m| self.find_mark(&m));
        }
        let mut current = base.unwrap_or_default();
        for &i in chain.iter().rev() {
            let ops = self.events[i].as_commit().expect("checked above").fileops.clone();
            let folded = Arc::new(apply_fileops(&current, &ops, true));
            self.events[i]
                .as_commit_mut()
                .expect("checked above")
                .manifest_cache = Some(Arc::clone(&folded));
            current = folded;
        }
        Ok(current)
    }

    /// Replace a commit's fileops with the minimal D/M set producing
    /// the identical manifest relative to its first parent. A leading
    /// deleteall is preserved when the commit had one.
    pub fn canonicalize(&mut self, idx: usize) -> Result<()> {
        let own = self.manifest(idx)?;
        let (had_deleteall, first_parent) = {
            let commit = self.events[idx]
                .as_commit()
                .ok_or_else(|| SurgeonError::internal("canonicalize on non-commit"))?;
            (
                commit.fileops.iter().any(|op| op.kind == OpKind::Deleteall),
                commit.first_parent_mark().map(|m| m.to_string()),
            )
        };
        let parent = match first_parent {
            Some(m) if !had_deleteall => {
                let p = self.find_mark(&m).ok_or_else(|| {
                    SurgeonError::internal(format!("dangling first parent {m}"))
                })?;
                self.manifest(p)?
            }
            _ => Arc::new(PathMap::new()),
        };
        let mut ops: Vec<FileOp> = Vec::new();
        if had_deleteall {
            ops.push(FileOp::deleteall());
        }
        own.iter(|path, entry| {
            let unchanged = parent.get(path).is_some_and(|prior| same_entry(prior, entry));
            if !unchanged {
                let mut op = entry.clone();
                op.path = path.to_vec();
                ops.push(op);
            }
        });
        parent.iter(|path, _| {
            if own.get(path).is_none() {
                ops.push(FileOp::delete(path));
            }
        });
        let ops = reorder_fileops(ops);
        debug!(mark = %self.events[idx].mark().unwrap_or(""), nops = ops.len(), "canonicalized");
        let commit = self.events[idx].as_commit_mut().expect("checked above");
        commit.fileops = ops;
        // the manifest is unchanged by construction; the cache stays
        Ok(())
    }

    /// Remove intra-commit redundancy without reference to the parent:
    /// keeps the last effective deleteall first, drops M/D pairs that
    /// cancel, keeps the final op per path.
    pub fn simplify_fileops(&mut self, idx: usize) -> Result<()> {
        let commit = self.events[idx]
            .as_commit_mut()
            .ok_or_else(|| SurgeonError::internal("simplify on non-commit"))?;
        let start = commit
            .fileops
            .iter()
            .rposition(|op| op.kind == OpKind::Deleteall)
            .map(|i| i + 1);
        let (had_deleteall, tail) = match start {
            Some(i) => (true, &commit.fileops[i..]),
            None => (false, &commit.fileops[..]),
        };
        let mut moves = Vec::new();
        let mut notes = Vec::new();
        let mut last_per_path: Vec<FileOp> = Vec::new();
        for op in tail {
            match op.kind {
                OpKind::Rename | OpKind::Copy => moves.push(op.clone()),
                OpKind::Note => notes.push(op.clone()),
                OpKind::Modify | OpKind::Delete => {
                    last_per_path.retain(|prior| prior.path != op.path);
                    // with a clean starting tree, a delete of an
                    // untouched path is a no-op
                    if op.kind == OpKind::Delete && had_deleteall {
                        continue;
                    }
                    last_per_path.push(op.clone());
                }
                OpKind::Deleteall => {}
            }
        }
        let mut ops = Vec::new();
        if had_deleteall {
            ops.push(FileOp::deleteall());
        }
        ops.extend(moves);
        last_per_path.sort_by(|a, b| emission_path_cmp(&a.path, &b.path));
        ops.extend(last_per_path);
        ops.extend(notes);
        commit.fileops = ops;
        commit.invalidate_caches();
        let mark_idx = idx;
        self.invalidate_manifests(mark_idx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hashing

    /// Content hash of the blob at `idx`, cached on the blob.
    pub fn blob_hash(&mut self, idx: usize) -> Result<GitHash> {
        match self.events.get_mut(idx) {
            Some(Event::Blob(b)) => b.hash(),
            _ => Err(SurgeonError::internal("blob_hash on non-blob")),
        }
    }

    /// Tree hash of a commit's manifest. Blob refs resolve through the
    /// mark index; submodule entries contribute their recorded hash;
    /// inline and unresolvable entries hash by their payload or are
    /// skipped.
    pub fn tree_hash_of(&mut self, idx: usize) -> Result<GitHash> {
        let manifest = self.manifest(idx)?;
        // Pre-resolve blob hashes: tree_hash's resolver cannot reach
        // back into the repository mutably.
        let mut blob_hashes: HashMap<String, GitHash> = HashMap::new();
        let mut marks = Vec::new();
        manifest.iter(|_, op| {
            if let Some(mark) = op.blob_mark() {
                marks.push(mark.to_string());
            }
        });
        for mark in marks {
            if blob_hashes.contains_key(&mark) {
                continue;
            }
            if let Some(i) = self.find_mark(&mark) {
                if self.events[i].is_blob() {
                    let h = self.blob_hash(i)?;
                    blob_hashes.insert(mark, h);
                }
            }
        }
        let resolve = move |op: &FileOp| -> Option<(Vec<u8>, GitHash)> {
            if op.kind != OpKind::Modify {
                return None;
            }
            if op.is_submodule() {
                let h = GitHash::from_str(&op.committish).ok()?;
                return Some((op.mode.clone(), h));
            }
            if op.is_inline() {
                let payload = op.inline.as_deref().unwrap_or(b"");
                return Some((
                    op.mode.clone(),
                    GitHash::from_kind_and_data(ObjectKind::Blob, payload),
                ));
            }
            blob_hashes
                .get(&op.committish)
                .map(|h| (op.mode.clone(), *h))
        };
        Ok(manifest.tree_hash(&resolve))
    }

    /// Commit hash: tree line, parent lines (callouts skipped), author
    /// lines, committer line, blank line, comment. Cached per commit;
    /// parents are resolved iteratively so long chains do not recurse.
    pub fn commit_hash(&mut self, idx: usize) -> Result<GitHash> {
        let mut stack = vec![idx];
        while let Some(&top) = stack.last() {
            let commit = self.events[top]
                .as_commit()
                .ok_or_else(|| SurgeonError::internal("commit_hash on non-commit"))?;
            if commit.hash_cache.is_some() {
                stack.pop();
                continue;
            }
            let parent_marks: Vec<String> =
                commit.parent_marks().map(|m| m.to_string()).collect();
            let mut pending = Vec::new();
            for mark in &parent_marks {
                let p = self.find_mark(mark).ok_or_else(|| {
                    SurgeonError::internal(format!("dangling parent {mark}"))
                })?;
                if self.events[p]
                    .as_commit()
                    .is_some_and(|c| c.hash_cache.is_none())
                {
                    pending.push(p);
                }
            }
            if !pending.is_empty() {
                if stack.len() > self.events.len() + 1 {
                    return Err(SurgeonError::internal("ancestry cycle while hashing"));
                }
                stack.extend(pending);
                continue;
            }
            let tree = self.tree_hash_of(top)?;
            let mut header = Vec::new();
            header.extend(b"tree ");
            header.extend(tree.to_string().as_bytes());
            header.push(b'\n');
            for mark in &parent_marks {
                let p = self.find_mark(mark).expect("resolved above");
                let phash = self.events[p]
                    .as_commit()
                    .and_then(|c| c.hash_cache)
                    .expect("parent hashed above");
                header.extend(b"parent ");
                header.extend(phash.to_string().as_bytes());
                header.push(b'\n');
            }
            let commit = self.events[top].as_commit().expect("checked above");
            for author in &commit.authors {
                header.extend(b"author ");
                header.extend(author.to_data());
                header.push(b'\n');
            }
            header.extend(b"committer ");
            header.extend(commit.committer.to_data());
            header.push(b'\n');
            header.push(b'\n');
            header.extend(&commit.comment);
            let hash = GitHash::from_kind_and_data(ObjectKind::Commit, &header);
            self.events[top]
                .as_commit_mut()
                .expect("checked above")
                .hash_cache = Some(hash);
            stack.pop();
        }
        self.events[idx]
            .as_commit()
            .and_then(|c| c.hash_cache)
            .ok_or_else(|| SurgeonError::internal("hash computation fell through"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::internal::event::{Attribution, Blob, Commit, ParentLink};

    fn committer() -> Attribution {
        Attribution::from_data(b"C <c@example.com> 1000 +0000").unwrap()
    }

    fn repo_with_chain() -> Repository {
        let mut repo = Repository::new("m", Config::for_tests()).unwrap();
        repo.append(Event::Blob(Blob::new(":1", 1)));
        let mut c1 = Commit::new(":2", "refs/heads/master", committer());
        c1.fileops.push(FileOp::modify(b"100644", ":1", b"README"));
        repo.append(Event::Commit(Box::new(c1)));
        let mut c2 = Commit::new(":3", "refs/heads/master", committer());
        c2.parents.push(ParentLink::Mark(":2".to_string()));
        c2.fileops.push(FileOp::modify(b"100644", ":1", b"src/lib.rs"));
        repo.append(Event::Commit(Box::new(c2)));
        repo.rebuild_children();
        repo
    }

    #[test]
    fn test_apply_modify_delete() {
        let mut parent: PathMap<FileOp> = PathMap::new();
        parent.set(b"a", FileOp::modify(b"100644", ":1", b"a"));
        let ops = vec![
            FileOp::modify(b"100644", ":2", b"b"),
            FileOp::delete(b"a"),
        ];
        let out = apply_fileops(&parent, &ops, true);
        assert!(out.get(b"a").is_none());
        assert_eq!(out.get(b"b").unwrap().committish, ":2");
    }

    #[test]
    fn test_apply_last_deleteall_wins() {
        let mut parent: PathMap<FileOp> = PathMap::new();
        parent.set(b"keep", FileOp::modify(b"100644", ":1", b"keep"));
        let ops = vec![
            FileOp::modify(b"100644", ":2", b"early"),
            FileOp::deleteall(),
            FileOp::modify(b"100644", ":3", b"late"),
        ];
        let out = apply_fileops(&parent, &ops, true);
        assert!(out.get(b"keep").is_none());
        assert!(out.get(b"early").is_none());
        assert!(out.get(b"late").is_some());
    }

    #[test]
    fn test_apply_rename_and_copy() {
        let mut parent: PathMap<FileOp> = PathMap::new();
        parent.set(b"old", FileOp::modify(b"100755", ":1", b"old"));
        let out = apply_fileops(&parent, &[FileOp::rename(b"old", b"new")], true);
        assert!(out.get(b"old").is_none());
        let moved = out.get(b"new").unwrap();
        assert_eq!(moved.mode, b"100755".to_vec());
        assert_eq!(moved.path, b"new".to_vec());

        let out2 = apply_fileops(&parent, &[FileOp::copy(b"old", b"dup")], true);
        assert!(out2.get(b"old").is_some());
        assert!(out2.get(b"dup").is_some());
    }

    #[test]
    fn test_emission_path_cmp() {
        // files under a directory come before the directory name itself
        assert_eq!(emission_path_cmp(b"dir/file", b"dir"), Ordering::Less);
        assert_eq!(emission_path_cmp(b"dir", b"dir/file"), Ordering::Greater);
        assert_eq!(emission_path_cmp(b"a", b"b"), Ordering::Less);
        assert_eq!(emission_path_cmp(b"same", b"same"), Ordering::Equal);
        // "dirx" is not under "dir"
        assert_eq!(emission_path_cmp(b"dirx", b"dir"), Ordering::Greater);
    }

    #[test]
    fn test_reorder_groups() {
        let ops = vec![
            FileOp::modify(b"100644", ":1", b"zz"),
            FileOp::rename(b"a", b"b"),
            FileOp::deleteall(),
            FileOp::delete(b"aa"),
        ];
        let out = reorder_fileops(ops);
        assert_eq!(out[0].kind, OpKind::Deleteall);
        assert_eq!(out[1].kind, OpKind::Rename);
        assert_eq!(out[2].path, b"aa".to_vec());
        assert_eq!(out[3].path, b"zz".to_vec());
    }

    #[test]
    fn test_manifest_chain_and_memoization() {
        let mut repo = repo_with_chain();
        let tip = repo.manifest(2).unwrap();
        assert!(tip.get(b"README").is_some());
        assert!(tip.get(b"src/lib.rs").is_some());
        // both commits now carry caches
        assert!(repo.commit_by_mark(":2").unwrap().manifest_cache.is_some());
        assert!(repo.commit_by_mark(":3").unwrap().manifest_cache.is_some());
        // invalidation clears the changed commit and descendants
        repo.invalidate_manifests(1);
        assert!(repo.commit_by_mark(":2").unwrap().manifest_cache.is_none());
        assert!(repo.commit_by_mark(":3").unwrap().manifest_cache.is_none());
    }

    #[test]
    fn test_canonicalize_preserves_manifest() {
        let mut repo = repo_with_chain();
        // make the tip redundant: modify then delete the same path
        {
            let c = repo.commit_mut_by_mark(":3").unwrap();
            c.fileops.push(FileOp::modify(b"100644", ":1", b"tmp"));
            c.fileops.push(FileOp::delete(b"tmp"));
            c.invalidate_caches();
        }
        repo.invalidate_manifests(2);
        let before = repo.manifest(2).unwrap().entries();
        repo.canonicalize(2).unwrap();
        let after = repo.manifest(2).unwrap().entries();
        let key = |entries: &[(Vec<u8>, FileOp)]| {
            entries
                .iter()
                .map(|(p, op)| (p.clone(), op.mode.clone(), op.committish.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(key(&before), key(&after));
        let c = repo.commit_by_mark(":3").unwrap();
        assert!(c.fileops.iter().all(|op| op.path != b"tmp".to_vec()));
    }

    #[test]
    fn test_commit_hash_sensitivity() {
        let mut repo = repo_with_chain();
        let h1 = repo.commit_hash(2).unwrap();
        assert_eq!(repo.commit_hash(2).unwrap(), h1);
        {
            let c = repo.commit_mut_by_mark(":3").unwrap();
            c.comment = b"changed\n".to_vec();
            c.invalidate_caches();
        }
        let h2 = repo.commit_hash(2).unwrap();
        assert_ne!(h1, h2);
        // parent change propagates: editing :2's comment shifts :3
        {
            let c = repo.commit_mut_by_mark(":2").unwrap();
            c.comment = b"root changed\n".to_vec();
            c.invalidate_caches();
        }
        repo.invalidate_hashes(1);
        let h3 = repo.commit_hash(2).unwrap();
        assert_ne!(h2, h3);
    }

    #[test]
    fn test_simplify_drops_overwritten_ops() {
        let mut repo = repo_with_chain();
        {
            let c = repo.commit_mut_by_mark(":3").unwrap();
            c.fileops = vec![
                FileOp::modify(b"100644", ":1", b"x"),
                FileOp::modify(b"100644", ":1", b"x"),
                FileOp::delete(b"x"),
                FileOp::modify(b"100644", ":1", b"y"),
            ];
        }
        repo.simplify_fileops(2).unwrap();
        let c = repo.commit_by_mark(":3").unwrap();
        assert_eq!(c.fileops.len(), 2);
        assert_eq!(c.fileops[0].path, b"x".to_vec());
        assert_eq!(c.fileops[0].kind, OpKind::Delete);
        assert_eq!(c.fileops[1].path, b"y".to_vec());
    }
}
