//! The in-memory repository: an ordered event sequence plus the
//! indices and caches that make mark lookup, manifest folding and the
//! surgical operators tractable.
//!
//! Mutating operators run single-threaded and assume exclusive access.
//! Read-mostly traversal can fan out over a worker pool; hooks may
//! mutate only what they exclusively own, except blob back-reference
//! sets which carry their own lock.

pub mod manifest;
pub mod topo;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tempfile::TempDir;
use threadpool::ThreadPool;
use tracing::debug;

use crate::config::Config;
use crate::errors::{Result, SurgeonError};
use crate::internal::blobstore::BlobStore;
use crate::internal::event::{Blob, Commit, Event, OpRef};

/// An in-memory repository model.
#[derive(Debug)]
pub struct Repository {
    pub name: String,
    pub config: Config,
    pub(crate) events: Vec<Event>,
    /// Hint recorded from a `#reposurgeon sourcetype` passthrough.
    pub source_type: Option<String>,
    scratch: Option<TempDir>,
    store: BlobStore,
    mark_index: DashMap<String, usize>,
    mark_index_valid: AtomicBool,
    name_index: Mutex<Option<HashMap<String, usize>>>,
    next_seq: u64,
    mark_ceiling: u64,
}

impl Repository {
    /// Create an empty repository with its own scratch directory. The
    /// scratch directory is destroyed when the repository is dropped,
    /// including on unwind from a fatal error.
    pub fn new(name: &str, config: Config) -> Result<Repository> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("stream-surgeon-{name}-"))
            .tempdir()?;
        let store = BlobStore::new(scratch.path(), config.compress, config.logmask);
        Ok(Repository {
            name: name.to_string(),
            config,
            events: Vec::new(),
            source_type: None,
            scratch: Some(scratch),
            store,
            mark_index: DashMap::new(),
            mark_index_valid: AtomicBool::new(false),
            name_index: Mutex::new(None),
            next_seq: 0,
            mark_ceiling: 0,
        })
    }

    /// Read access to the event sequence.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, idx: usize) -> Option<&Event> {
        self.events.get(idx)
    }

    pub(crate) fn event_mut(&mut self, idx: usize) -> Option<&mut Event> {
        self.events.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The blob content store under this repository's scratch dir.
    pub(crate) fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Allocate a scratch-file sequence slot for a new blob.
    pub(crate) fn new_blob_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Allocate a fresh mark above every mark seen so far.
    pub fn new_mark(&mut self) -> String {
        self.mark_ceiling += 1;
        format!(":{}", self.mark_ceiling)
    }

    fn note_mark(&mut self, mark: &str) {
        if let Some(n) = mark.strip_prefix(':').and_then(|m| m.parse::<u64>().ok()) {
            self.mark_ceiling = self.mark_ceiling.max(n);
        }
    }

    /// Raise the allocation floor for fresh marks, e.g. after a
    /// renumber assigned marks without going through `append`.
    pub(crate) fn raise_mark_ceiling(&mut self, n: u64) {
        self.mark_ceiling = self.mark_ceiling.max(n);
    }

    // ------------------------------------------------------------------
    // Sequence mutation

    /// Append an event, keeping any trailing `done` passthrough last.
    pub fn append(&mut self, event: Event) -> usize {
        if let Some(mark) = event.mark() {
            let mark = mark.to_string();
            self.note_mark(&mark);
            if self.mark_index_valid.load(Ordering::Acquire) {
                self.mark_index.insert(mark, self.events.len());
            }
        }
        let done_last = matches!(
            self.events.last(),
            Some(Event::Passthrough(p)) if p.is_done()
        );
        if done_last && !matches!(&event, Event::Passthrough(p) if p.is_done()) {
            let pos = self.events.len() - 1;
            self.events.insert(pos, event);
            // positions shifted under the index
            self.invalidate_mark_index();
            self.invalidate_name_index();
            pos
        } else {
            self.events.push(event);
            self.invalidate_name_index();
            self.events.len() - 1
        }
    }

    /// Insert at an arbitrary position; invalidates positional indices.
    pub fn insert(&mut self, pos: usize, event: Event) {
        if let Some(mark) = event.mark() {
            let mark = mark.to_string();
            self.note_mark(&mark);
        }
        self.events.insert(pos, event);
        self.declare_sequence_mutation("insert");
    }

    /// The single hook every sequence-shape mutation goes through:
    /// drops the mark and name indices.
    pub fn declare_sequence_mutation(&self, reason: &str) {
        debug!(repo = %self.name, reason, "sequence mutation declared");
        self.invalidate_mark_index();
        self.invalidate_name_index();
    }

    /// Remove all delete-flagged events, then rederive children and
    /// positional indices.
    pub fn sweep_deleted(&mut self) {
        let before = self.events.len();
        self.events.retain(|e| !e.deleteme());
        if self.events.len() != before {
            debug!(
                repo = %self.name,
                removed = before - self.events.len(),
                "delete sweep"
            );
            self.declare_sequence_mutation("sweep");
            self.rebuild_children();
        }
    }

    // ------------------------------------------------------------------
    // Mark index

    fn invalidate_mark_index(&self) {
        self.mark_index_valid.store(false, Ordering::Release);
        self.mark_index.clear();
    }

    fn build_mark_index(&self) {
        self.mark_index.clear();
        for (i, event) in self.events.iter().enumerate() {
            if let Some(mark) = event.mark() {
                if !mark.is_empty() {
                    self.mark_index.insert(mark.to_string(), i);
                }
            }
        }
        self.mark_index_valid.store(true, Ordering::Release);
    }

    /// Look up an event position by mark. Amortized O(1): the index is
    /// built lazily on first use and extended as events append.
    pub fn find_mark(&self, mark: &str) -> Option<usize> {
        if mark.is_empty() {
            return None;
        }
        if !self.mark_index_valid.load(Ordering::Acquire) {
            self.build_mark_index();
        }
        self.mark_index.get(mark).map(|entry| *entry.value())
    }

    /// Repair the index after a mark string changed in place on an
    /// existing event, without a full rebuild.
    pub fn fixup_mark(&self, old: &str, new: &str) {
        if self.mark_index_valid.load(Ordering::Acquire) {
            if let Some((_, idx)) = self.mark_index.remove(old) {
                self.mark_index.insert(new.to_string(), idx);
            }
        }
    }

    /// Borrow the commit with the given mark.
    pub fn commit_by_mark(&self, mark: &str) -> Option<&Commit> {
        self.find_mark(mark)
            .and_then(|i| self.events[i].as_commit())
    }

    pub(crate) fn commit_mut_by_mark(&mut self, mark: &str) -> Option<&mut Commit> {
        let idx = self.find_mark(mark)?;
        self.events[idx].as_commit_mut()
    }

    pub fn blob_by_mark(&self, mark: &str) -> Option<&Blob> {
        self.find_mark(mark).and_then(|i| self.events[i].as_blob())
    }

    // ------------------------------------------------------------------
    // Name index

    fn invalidate_name_index(&self) {
        *self.name_index.lock().expect("name index poisoned") = None;
    }

    /// Resolve a human reference to an event position: tag name,
    /// branch name (its tip), legacy id, or action stamp. Cached after
    /// the first resolution; any sequence or attribution mutation
    /// rebuilds the cache.
    pub fn named(&self, name: &str) -> Option<usize> {
        {
            let guard = self.name_index.lock().expect("name index poisoned");
            if let Some(index) = guard.as_ref() {
                return index.get(name).copied();
            }
        }
        let built = self.build_name_index();
        let hit = built.get(name).copied();
        *self.name_index.lock().expect("name index poisoned") = Some(built);
        hit
    }

    fn build_name_index(&self) -> HashMap<String, usize> {
        let mut index = HashMap::new();
        let mut ordinal = 0usize;
        for (i, event) in self.events.iter().enumerate() {
            match event {
                Event::Tag(t) => {
                    index.insert(t.name.clone(), i);
                    if let Some(ref lid) = t.legacy_id {
                        index.insert(lid.clone(), i);
                    }
                }
                Event::Commit(c) => {
                    ordinal += 1;
                    index.insert(format!("#{ordinal}"), i);
                    // branch name resolves to its tip: the latest wins
                    index.insert(c.branch.clone(), i);
                    if let Some(short) = c.branch.strip_prefix("refs/heads/") {
                        index.insert(short.to_string(), i);
                    }
                    if let Some(ref lid) = c.legacy_id {
                        index.insert(lid.clone(), i);
                    }
                    index.insert(c.action_stamp(), i);
                }
                _ => {}
            }
        }
        index
    }

    // ------------------------------------------------------------------
    // Graph derivation and cache invalidation

    /// Recompute every commit's children list from the parent edges.
    /// Children are strictly derived state; this is the only writer.
    pub fn rebuild_children(&mut self) {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for event in &self.events {
            if let Event::Commit(c) = event {
                for parent in c.parent_marks() {
                    children
                        .entry(parent.to_string())
                        .or_default()
                        .push(c.mark.clone());
                }
            }
        }
        for event in &mut self.events {
            if let Event::Commit(c) = event {
                c.children = children.remove(&c.mark).unwrap_or_default();
            }
        }
    }

    /// Invalidate the manifest cache of a commit and iteratively of its
    /// descendants, stopping at any commit whose cache is already
    /// absent: nothing below it can hold a stale manifest either.
    /// Commit hashes are dropped along the way since a manifest change
    /// changes them too.
    pub fn invalidate_manifests(&mut self, idx: usize) {
        let Some(start_mark) = self.events[idx].as_commit().map(|c| c.mark.clone()) else {
            return;
        };
        let mut stack = vec![start_mark];
        let mut first = true;
        while let Some(mark) = stack.pop() {
            let Some(pos) = self.find_mark(&mark) else {
                continue;
            };
            let Some(commit) = self.events[pos].as_commit_mut() else {
                continue;
            };
            if !first && commit.manifest_cache.is_none() && commit.hash_cache.is_none() {
                continue;
            }
            first = false;
            commit.manifest_cache = None;
            commit.hash_cache = None;
            stack.extend(commit.children.iter().cloned());
        }
    }

    /// Invalidate the cached hash of a commit and all its descendants;
    /// a parent hash feeds every descendant's hash.
    pub fn invalidate_hashes(&mut self, idx: usize) {
        let Some(start_mark) = self.events[idx].as_commit().map(|c| c.mark.clone()) else {
            return;
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start_mark];
        while let Some(mark) = stack.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            let Some(pos) = self.find_mark(&mark) else {
                continue;
            };
            if let Some(commit) = self.events[pos].as_commit_mut() {
                commit.hash_cache = None;
                stack.extend(commit.children.iter().cloned());
            }
        }
    }

    /// Replace a commit's parent edges through the single mutator that
    /// keeps children and caches consistent.
    pub fn set_parents(
        &mut self,
        idx: usize,
        parents: Vec<crate::internal::event::ParentLink>,
    ) -> Result<()> {
        {
            let mark = {
                let commit = self.events[idx]
                    .as_commit()
                    .ok_or_else(|| SurgeonError::internal("set_parents on non-commit"))?;
                commit.mark.clone()
            };
            for p in &parents {
                if p.mark() == Some(mark.as_str()) {
                    return Err(SurgeonError::command(format!(
                        "commit {mark} cannot be its own parent"
                    )));
                }
            }
            let commit = self.events[idx].as_commit_mut().expect("checked above");
            commit.parents = parents;
        }
        self.rebuild_children();
        self.invalidate_manifests(idx);
        self.invalidate_hashes(idx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Branch geometry

    /// All branch names appearing on commits, in sorted order.
    pub fn branches(&self) -> BTreeSet<String> {
        self.events
            .iter()
            .filter_map(|e| e.as_commit().map(|c| c.branch.clone()))
            .collect()
    }

    /// Position of the tip (latest in event order) commit of a branch.
    pub fn branch_tip(&self, branch: &str) -> Option<usize> {
        self.events
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.as_commit().is_some_and(|c| c.branch == branch))
            .map(|(i, _)| i)
    }

    /// Position of the earliest commit in event order.
    pub fn earliest_commit(&self) -> Option<usize> {
        self.events.iter().position(|e| e.is_commit())
    }

    // ------------------------------------------------------------------
    // Blob back-references and GC

    /// Recompute every blob's opset from the commits' fileops.
    pub fn rebuild_blob_refs(&mut self) {
        for event in &self.events {
            if let Event::Blob(b) = event {
                b.clear_ops();
            }
        }
        let mut refs: Vec<(String, OpRef)> = Vec::new();
        for event in &self.events {
            if let Event::Commit(c) = event {
                for op in &c.fileops {
                    if let Some(mark) = op.blob_mark() {
                        refs.push((
                            mark.to_string(),
                            OpRef {
                                commit_mark: c.mark.clone(),
                                path: op.path.clone(),
                            },
                        ));
                    }
                }
            }
        }
        for (mark, opref) in refs {
            if let Some(blob) = self.find_mark(&mark).and_then(|i| self.events[i].as_blob()) {
                blob.add_op(opref);
            }
        }
    }

    /// Delete blobs whose back-reference set is empty, after refreshing
    /// the back-references. Returns the number collected.
    pub fn gc_blobs(&mut self) -> usize {
        self.rebuild_blob_refs();
        let mut count = 0;
        for event in &mut self.events {
            if let Event::Blob(b) = event {
                if b.is_unreferenced() && !b.deleteme {
                    b.deleteme = true;
                    count += 1;
                }
            }
        }
        if count > 0 {
            self.sweep_deleted();
        }
        count
    }

    // ------------------------------------------------------------------
    // Parallel traversal

    /// Visit `(index, event)` pairs with a bounded worker pool. The
    /// hook must not alter the event list, marks, or manifest caches it
    /// does not exclusively own; blob opsets carry their own lock. With
    /// `serial` set, runs in the calling thread in index order.
    pub fn walk_events<F>(&mut self, hook: F)
    where
        F: Fn(usize, &Event) + Send + Sync + 'static,
    {
        if self.config.serial || self.config.max_parallelism <= 1 {
            for (i, event) in self.events.iter().enumerate() {
                hook(i, event);
            }
            return;
        }
        let workers = self.config.max_parallelism;
        let events = Arc::new(std::mem::take(&mut self.events));
        let hook = Arc::new(hook);
        let pool = ThreadPool::new(workers);
        let (tx, rx) = mpsc::channel::<usize>();
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers {
            let events = Arc::clone(&events);
            let hook = Arc::clone(&hook);
            let rx = Arc::clone(&rx);
            pool.execute(move || {
                loop {
                    let next = rx.lock().expect("walk channel poisoned").recv();
                    match next {
                        Ok(i) => hook(i, &events[i]),
                        Err(_) => break,
                    }
                }
            });
        }
        for i in 0..events.len() {
            tx.send(i).expect("walk channel closed early");
        }
        drop(tx);
        pool.join();
        self.events = Arc::try_unwrap(events)
            .unwrap_or_else(|_| panic!("walker leaked an event reference"));
    }

    /// True while the scratch directory is alive; it is destroyed with
    /// the repository, including on unwind.
    pub fn has_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}
