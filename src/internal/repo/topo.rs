//! Graph-shape operations over the event sequence: stable topological
//! re-sort, contiguous-chain reorder, reachability accumulation, and
//! the interesting-commit reduction.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use tracing::debug;

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{Event, ParentLink};
use crate::internal::repo::Repository;

impl Repository {
    /// Re-sort the event sequence topologically: parents precede
    /// children, blobs precede the commits referencing them, tags and
    /// resets follow their targets. Stable: ties resolve by original
    /// index. A trailing `done` passthrough keeps its place at the end.
    pub fn resort(&mut self) -> Result<()> {
        let done_last = matches!(
            self.events.last(),
            Some(Event::Passthrough(p)) if p.is_done()
        );
        let done = if done_last { self.events.pop() } else { None };
        let n = self.events.len();
        let mark_at: HashMap<String, usize> = self
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.mark().map(|m| (m.to_string(), i)))
            .collect();
        let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree: Vec<usize> = vec![0; n];
        let mut add_edge = |from: usize, to: usize, in_degree: &mut Vec<usize>| {
            out_edges[from].push(to);
            in_degree[to] += 1;
        };
        for (i, event) in self.events.iter().enumerate() {
            match event {
                Event::Commit(c) => {
                    for parent in c.parent_marks() {
                        if let Some(&p) = mark_at.get(parent) {
                            add_edge(p, i, &mut in_degree);
                        }
                    }
                    for op in &c.fileops {
                        if let Some(mark) = op.blob_mark() {
                            if let Some(&b) = mark_at.get(mark) {
                                add_edge(b, i, &mut in_degree);
                            }
                        }
                    }
                }
                Event::Tag(t) => {
                    if let Some(&target) = mark_at.get(&t.committish) {
                        add_edge(target, i, &mut in_degree);
                    }
                }
                Event::Reset(r) => {
                    if let Some(&target) = mark_at.get(&r.committish) {
                        add_edge(target, i, &mut in_degree);
                    }
                }
                _ => {}
            }
        }
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &next in &out_edges[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        if order.len() != n {
            if let Some(done) = done {
                self.events.push(done);
            }
            return Err(SurgeonError::command(
                "topological sort failed: the event graph has a cycle",
            ));
        }
        let mut old: Vec<Option<Event>> = self.events.drain(..).map(Some).collect();
        self.events = order
            .into_iter()
            .map(|i| old[i].take().expect("each index placed once"))
            .collect();
        if let Some(done) = done {
            self.events.push(done);
        }
        self.declare_sequence_mutation("resort");
        if self.config.logmask.contains(LogMask::TOPOLOGY) {
            debug!(repo = %self.name, "resorted event sequence");
        }
        Ok(())
    }

    /// Rewire a contiguous chain of commits into the order given by
    /// `sel`. Each selected commit must have exactly one parent and one
    /// child inside the repository's commit graph, and the selection
    /// must form one contiguous chain. All checks run before any edge
    /// is touched.
    pub fn reorder_commits(&mut self, sel: &[usize]) -> Result<()> {
        if sel.len() < 2 {
            return Err(SurgeonError::command("reorder needs at least two commits"));
        }
        let mut marks = Vec::new();
        for &i in sel {
            let commit = self.events.get(i).and_then(|e| e.as_commit()).ok_or_else(|| {
                SurgeonError::command(format!("reorder selection {i} is not a commit"))
            })?;
            if commit.parents.len() != 1 {
                return Err(SurgeonError::command(format!(
                    "commit {} has {} parents; reorder requires exactly one",
                    commit.mark,
                    commit.parents.len()
                )));
            }
            if commit.children.len() != 1 {
                return Err(SurgeonError::command(format!(
                    "commit {} has {} children; reorder requires exactly one",
                    commit.mark,
                    commit.children.len()
                )));
            }
            marks.push(commit.mark.clone());
        }
        let selected: BTreeSet<&String> = marks.iter().collect();
        // contiguity: exactly one selected commit's parent is outside,
        // and the chain threads through the rest
        let mut head = None;
        for &i in sel {
            let commit = self.events[i].as_commit().expect("checked above");
            let parent = commit.first_parent_mark().expect("checked above");
            if !selected.contains(&parent.to_string()) {
                if head.is_some() {
                    return Err(SurgeonError::command(
                        "reorder selection is not a contiguous chain",
                    ));
                }
                head = Some((i, parent.to_string()));
            }
        }
        let (_, outside_parent) =
            head.ok_or_else(|| SurgeonError::command("reorder selection forms a cycle"))?;
        let mut tail = None;
        for &i in sel {
            let commit = self.events[i].as_commit().expect("checked above");
            let child = &commit.children[0];
            if !selected.contains(child) {
                if tail.is_some() {
                    return Err(SurgeonError::command(
                        "reorder selection is not a contiguous chain",
                    ));
                }
                tail = Some(child.clone());
            }
        }
        let outside_child =
            tail.ok_or_else(|| SurgeonError::command("reorder selection forms a cycle"))?;
        // all checks passed; rewire in the order given
        let mut prev = outside_parent;
        for mark in &marks {
            let idx = self.find_mark(mark).expect("selection resolved");
            self.set_parents(idx, vec![ParentLink::Mark(prev.clone())])?;
            prev = mark.clone();
        }
        let child_idx = self
            .find_mark(&outside_child)
            .ok_or_else(|| SurgeonError::internal("outside child vanished"))?;
        let mut parents = self.events[child_idx]
            .as_commit()
            .expect("child is a commit")
            .parents
            .clone();
        for p in &mut parents {
            if selected.contains(&p.mark().unwrap_or_default().to_string()) {
                *p = ParentLink::Mark(prev.clone());
            }
        }
        self.set_parents(child_idx, parents)?;
        self.resort()
    }

    /// Accumulate the marks of all ancestors of a commit through
    /// concrete parent edges.
    pub fn ancestors(&self, idx: usize) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self.events[idx]
            .as_commit()
            .map(|c| c.parent_marks().map(|m| m.to_string()).collect())
            .unwrap_or_default();
        while let Some(mark) = stack.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            if let Some(commit) = self.commit_by_mark(&mark) {
                stack.extend(commit.parent_marks().map(|m| m.to_string()));
            }
        }
        seen
    }

    /// Accumulate the marks of all descendants through children links.
    pub fn descendants(&self, idx: usize) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self.events[idx]
            .as_commit()
            .map(|c| c.children.clone())
            .unwrap_or_default();
        while let Some(mark) = stack.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            if let Some(commit) = self.commit_by_mark(&mark) {
                stack.extend(commit.children.iter().cloned());
            }
        }
        seen
    }

    /// Marks reachable from `start` following both parent and child
    /// links, with one directed edge (`early` → `late`) removed. Used
    /// to test whether severing that edge separates the graph.
    pub fn closure_without_edge(
        &self,
        start: &str,
        early: &str,
        late: &str,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(mark) = stack.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            let Some(commit) = self.commit_by_mark(&mark) else {
                continue;
            };
            for parent in commit.parent_marks() {
                if mark == late && parent == early {
                    continue;
                }
                stack.push(parent.to_string());
            }
            for child in &commit.children {
                if mark == early && child == late {
                    continue;
                }
                stack.push(child.clone());
            }
        }
        seen
    }

    /// Mark uninteresting commits for deletion: a commit is interesting
    /// when it is a branch tip, a merge or fork point, a root, or
    /// changes something its first parent's manifest does not already
    /// hold. Boring commits adjacent to interesting ones are retained
    /// to keep the visible shape. Returns positions of commits to drop,
    /// in ascending order.
    pub fn reduce_selection(&mut self) -> Result<Vec<usize>> {
        let commit_positions: Vec<usize> = (0..self.events.len())
            .filter(|&i| self.events[i].is_commit())
            .collect();
        let mut interesting: BTreeSet<String> = BTreeSet::new();
        for &i in &commit_positions {
            let (mark, parents, children, branch) = {
                let c = self.events[i].as_commit().expect("filtered");
                (
                    c.mark.clone(),
                    c.parents.len(),
                    c.children.len(),
                    c.branch.clone(),
                )
            };
            let is_tip = self.branch_tip(&branch) == Some(i);
            if is_tip || parents != 1 || children != 1 {
                interesting.insert(mark);
                continue;
            }
            let parent_manifest = {
                let pmark = self.events[i]
                    .as_commit()
                    .and_then(|c| c.first_parent_mark())
                    .map(|m| m.to_string());
                match pmark.and_then(|m| self.find_mark(&m)) {
                    Some(p) => self.manifest(p)?,
                    None => Default::default(),
                }
            };
            let c = self.events[i].as_commit().expect("filtered");
            let effective = c.fileops.iter().any(|op| {
                match parent_manifest.get(&op.path) {
                    Some(prior) => {
                        prior.mode != op.mode || prior.committish != op.committish
                    }
                    None => true,
                }
            });
            if effective {
                interesting.insert(c.mark.clone());
            }
        }
        // retain boring neighbors of interesting commits
        let mut keep = interesting.clone();
        for mark in &interesting {
            if let Some(c) = self.commit_by_mark(mark) {
                keep.extend(c.parent_marks().map(|m| m.to_string()));
                keep.extend(c.children.iter().cloned());
            }
        }
        let drop: Vec<usize> = commit_positions
            .into_iter()
            .filter(|&i| {
                self.events[i]
                    .as_commit()
                    .is_some_and(|c| !keep.contains(&c.mark))
            })
            .collect();
        Ok(drop)
    }
}
