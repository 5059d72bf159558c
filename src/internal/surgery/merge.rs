//! Multi-repository surgery: renumbering mark spaces, grafting one
//! repository into another, cutting a repository in two at an edge,
//! and uniting several repositories into one.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::config::LogMask;
use crate::errors::{Result, SurgeonError};
use crate::internal::event::{ColorSet, Event, FileOp, ParentLink};
use crate::internal::repo::Repository;

impl Repository {
    /// Reassign all marks contiguously starting at `origin`, rewriting
    /// every cross-reference: commit parents, tag and reset targets,
    /// and fileop refs. Relative event order is preserved; surplus
    /// `done` trailers are dropped.
    pub fn renumber(&mut self, origin: u64) -> Result<()> {
        let mut map: HashMap<String, String> = HashMap::new();
        let mut next = origin;
        for event in &self.events {
            if let Some(mark) = event.mark() {
                map.insert(mark.to_string(), format!(":{next}"));
                next += 1;
            }
        }
        let remap = |committish: &mut String| {
            if let Some(new) = map.get(committish.as_str()) {
                *committish = new.clone();
            }
        };
        for event in &mut self.events {
            match event {
                Event::Blob(b) => remap(&mut b.mark),
                Event::Commit(c) => {
                    remap(&mut c.mark);
                    for parent in &mut c.parents {
                        if let ParentLink::Mark(m) = parent {
                            remap(m);
                        }
                    }
                    for child in &mut c.children {
                        remap(child);
                    }
                    for op in &mut c.fileops {
                        if op.committish.starts_with(':') {
                            remap(&mut op.committish);
                        }
                    }
                }
                Event::Tag(t) => remap(&mut t.committish),
                Event::Reset(r) => remap(&mut r.committish),
                _ => {}
            }
        }
        // at most one done trailer survives, and it stays last
        let done_count = self
            .events
            .iter()
            .filter(|e| matches!(e, Event::Passthrough(p) if p.is_done()))
            .count();
        if done_count > 1 {
            let mut seen = 0;
            self.events.retain(|e| {
                if matches!(e, Event::Passthrough(p) if p.is_done()) {
                    seen += 1;
                    seen == done_count
                } else {
                    true
                }
            });
        }
        self.declare_sequence_mutation("renumber");
        self.rebuild_blob_refs();
        self.raise_mark_ceiling(next.saturating_sub(1));
        if self.config.logmask.contains(LogMask::SHOUT) {
            info!(repo = %self.name, origin, assigned = next - origin, "renumbered marks");
        }
        Ok(())
    }

    /// Resolve callout parent edges (and callout stub events) against
    /// the commits now present, matching by action stamp.
    pub fn resolve_callouts(&mut self) {
        let stamps: HashMap<String, String> = self
            .events
            .iter()
            .filter_map(|e| e.as_commit())
            .map(|c| (c.action_stamp(), c.mark.clone()))
            .collect();
        for event in &mut self.events {
            match event {
                Event::Commit(c) => {
                    let mut changed = false;
                    for parent in &mut c.parents {
                        if let ParentLink::Callout(stamp) = parent {
                            if let Some(mark) = stamps.get(stamp.as_str()) {
                                debug!(stamp = %stamp, mark = %mark, "resolved callout");
                                *parent = ParentLink::Mark(mark.clone());
                                changed = true;
                            }
                        }
                    }
                    if changed {
                        c.invalidate_caches();
                    }
                }
                Event::Callout(stub) => {
                    if stamps.contains_key(stub.stamp.as_str()) {
                        stub.deleteme = true;
                    }
                }
                _ => {}
            }
        }
        self.sweep_deleted();
        self.rebuild_children();
    }

    /// Rename donor branches and tags that collide with this
    /// repository's, and move the donor mark space above ours.
    fn uniquify_against(&mut self, donor: &mut Repository) -> Result<()> {
        donor.renumber(self.highest_mark() + 1)?;
        let our_branches = self.branches();
        let our_tags: BTreeSet<String> = self
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Tag(t) => Some(t.name.clone()),
                _ => None,
            })
            .collect();
        let suffix = donor.name.clone();
        let warn_enabled = self.config.logmask.contains(LogMask::WARN);
        for event in &mut donor.events {
            match event {
                Event::Commit(c) if our_branches.contains(&c.branch) => {
                    c.branch = format!("{}-{}", c.branch, suffix);
                }
                Event::Tag(t) if our_tags.contains(&t.name) => {
                    if warn_enabled {
                        warn!(tag = %t.name, "renaming colliding donor tag");
                    }
                    t.name = format!("{}-{}", t.name, suffix);
                }
                Event::Reset(r) if our_branches.contains(&r.refname) => {
                    r.refname = format!("{}-{}", r.refname, suffix);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn highest_mark(&self) -> u64 {
        self.events
            .iter()
            .filter_map(|e| e.mark())
            .filter_map(|m| m.strip_prefix(':').and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0)
    }

    /// Absorb all donor events, re-homing blob backing files into our
    /// scratch store. Front features merge ahead of our first
    /// non-feature event; a trailing donor `done` is dropped.
    fn absorb(&mut self, mut donor: Repository) -> Result<()> {
        let events = std::mem::take(&mut donor.events);
        let mut front = Vec::new();
        let mut body = Vec::new();
        let mut in_front = true;
        for mut event in events {
            let (front_feature, done) = match &event {
                Event::Passthrough(p) => (in_front && p.is_feature(), p.is_done()),
                _ => (false, false),
            };
            if front_feature {
                front.push(event);
                continue;
            }
            if done {
                continue;
            }
            in_front = false;
            if let Event::Blob(blob) = &mut event {
                let seq = self.new_blob_seq();
                let rehomed = self.store().clone_body(&blob.body, seq)?;
                blob.body = rehomed;
                blob.seq = seq;
            }
            body.push(event);
        }
        // dedupe features we already carry
        let existing: BTreeSet<Vec<u8>> = self
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Passthrough(p) if p.is_feature() => Some(p.text.clone()),
                _ => None,
            })
            .collect();
        let insert_at = self
            .events
            .iter()
            .position(|e| !matches!(e, Event::Passthrough(p) if p.is_feature()))
            .unwrap_or(self.events.len());
        let mut offset = 0;
        for event in front {
            if let Event::Passthrough(p) = &event {
                if existing.contains(&p.text) {
                    continue;
                }
            }
            self.events.insert(insert_at + offset, event);
            offset += 1;
        }
        for event in body {
            self.append(event);
        }
        self.declare_sequence_mutation("absorb");
        Ok(())
    }

    /// Graft a donor repository into this one, optionally anchoring the
    /// donor's roots onto the commit at `anchor`. With `prune`, each
    /// donor root starts from an empty tree. Callouts are resolved by
    /// action stamp and the mark space renumbered contiguously.
    pub fn graft(
        &mut self,
        mut donor: Repository,
        anchor: Option<usize>,
        prune: bool,
    ) -> Result<()> {
        let anchor_mark = match anchor {
            Some(i) => Some(
                self.events
                    .get(i)
                    .and_then(|e| e.as_commit())
                    .map(|c| c.mark.clone())
                    .ok_or_else(|| {
                        SurgeonError::command(format!("graft anchor {i} is not a commit"))
                    })?,
            ),
            None => None,
        };
        self.uniquify_against(&mut donor)?;
        let donor_roots: Vec<String> = donor
            .events
            .iter()
            .filter_map(|e| e.as_commit())
            .filter(|c| c.parents.is_empty())
            .map(|c| c.mark.clone())
            .collect();
        let donor_name = donor.name.clone();
        self.absorb(donor)?;
        for root in &donor_roots {
            let Some(idx) = self.find_mark(root) else {
                continue;
            };
            if prune {
                let commit = self.events[idx].as_commit_mut().expect("root is commit");
                commit.fileops.insert(0, FileOp::deleteall());
                commit.invalidate_caches();
            }
            if let Some(anchor_mark) = &anchor_mark {
                self.set_parents(idx, vec![ParentLink::Mark(anchor_mark.clone())])?;
            }
        }
        self.resolve_callouts();
        self.rebuild_children();
        self.rebuild_blob_refs();
        self.renumber(1)?;
        if self.config.logmask.contains(LogMask::SHOUT) {
            info!(donor = %donor_name, roots = donor_roots.len(), "graft complete");
        }
        Ok(())
    }

    /// Cut the repository in two at the parent edge `early` → `late`.
    /// On success returns the (early, late) partitions and leaves this
    /// repository untouched; an infeasible cut (some event reachable
    /// from both sides) fails without modifying anything.
    pub fn cut(&mut self, early: usize, late: usize) -> Result<(Repository, Repository)> {
        let early_mark = self
            .events
            .get(early)
            .and_then(|e| e.as_commit())
            .map(|c| c.mark.clone())
            .ok_or_else(|| SurgeonError::command(format!("cut point {early} is not a commit")))?;
        let (late_mark, early_stamp_target) = {
            let late_commit = self
                .events
                .get(late)
                .and_then(|e| e.as_commit())
                .ok_or_else(|| {
                    SurgeonError::command(format!("cut point {late} is not a commit"))
                })?;
            if !late_commit.has_parent(&early_mark) {
                return Err(SurgeonError::command(format!(
                    "{} is not a parent of {}",
                    early_mark, late_commit.mark
                )));
            }
            (
                late_commit.mark.clone(),
                self.events[early].as_commit().expect("checked").action_stamp(),
            )
        };
        self.rebuild_children();
        self.rebuild_blob_refs();
        let early_set = self.closure_without_edge(&early_mark, &early_mark, &late_mark);
        let late_set = self.closure_without_edge(&late_mark, &early_mark, &late_mark);
        if early_set.intersection(&late_set).next().is_some() {
            return Err(SurgeonError::command(format!(
                "cut at {early_mark} -> {late_mark} is infeasible: the halves stay connected"
            )));
        }

        let mut early_repo = Repository::new(&format!("{}-early", self.name), self.config.clone())?;
        let mut late_repo = Repository::new(&format!("{}-late", self.name), self.config.clone())?;
        let commit_color = |mark: &str| -> ColorSet {
            if early_set.contains(mark) {
                ColorSet::EARLY
            } else if late_set.contains(mark) {
                ColorSet::LATE
            } else {
                ColorSet::EARLY
            }
        };
        // branch homes decide where resets land
        let mut early_branches: BTreeSet<String> = BTreeSet::new();
        for event in &self.events {
            if let Event::Commit(c) = event {
                if commit_color(&c.mark).has(ColorSet::EARLY) {
                    early_branches.insert(c.branch.clone());
                }
            }
        }
        // paint the scratch colors: commits by closure membership,
        // blobs by their referrers (possibly both), tags and resets by
        // their targets
        let mut paint: Vec<ColorSet> = Vec::with_capacity(self.events.len());
        for event in &self.events {
            let color = match event {
                Event::Commit(c) => commit_color(&c.mark),
                Event::Blob(blob) => {
                    let mut colors = ColorSet::default();
                    for commit_mark in blob.referrer_marks() {
                        colors.add(commit_color(&commit_mark));
                    }
                    if colors.is_empty() {
                        colors.add(ColorSet::EARLY);
                    }
                    colors
                }
                Event::Tag(t) => self
                    .commit_by_mark(&t.committish)
                    .map(|c| commit_color(&c.mark))
                    .unwrap_or(ColorSet::EARLY),
                Event::Reset(r) => {
                    if early_branches.contains(&r.refname) {
                        ColorSet::EARLY
                    } else {
                        ColorSet::LATE
                    }
                }
                _ => ColorSet::default(),
            };
            paint.push(color);
        }
        for (i, color) in paint.iter().enumerate() {
            self.events[i].clear_color();
            self.events[i].add_color(*color);
        }
        for event in &self.events {
            match event {
                Event::Passthrough(p) => {
                    if p.is_feature() || p.is_done() {
                        early_repo.append(event.clone());
                        late_repo.append(event.clone());
                    } else {
                        early_repo.append(event.clone());
                    }
                }
                Event::Blob(blob) => {
                    if blob.color.has(ColorSet::EARLY) {
                        let mut copy = blob.clone();
                        copy.seq = early_repo.new_blob_seq();
                        copy.body = early_repo.store().clone_body(&blob.body, copy.seq)?;
                        copy.color.clear();
                        early_repo.append(Event::Blob(copy));
                    }
                    if blob.color.has(ColorSet::LATE) {
                        let mut copy = blob.clone();
                        copy.seq = late_repo.new_blob_seq();
                        copy.body = late_repo.store().clone_body(&blob.body, copy.seq)?;
                        copy.color.clear();
                        late_repo.append(Event::Blob(copy));
                    }
                }
                Event::Commit(c) => {
                    let mut copy = c.clone();
                    copy.manifest_cache = None;
                    copy.hash_cache = None;
                    copy.color.clear();
                    if c.color.has(ColorSet::EARLY) {
                        early_repo.append(Event::Commit(copy));
                    } else {
                        if copy.mark == late_mark {
                            // sever the cut edge into a callout
                            for parent in &mut copy.parents {
                                if parent.mark() == Some(early_mark.as_str()) {
                                    *parent = ParentLink::Callout(early_stamp_target.clone());
                                }
                            }
                            copy.invalidate_caches();
                        }
                        late_repo.append(Event::Commit(copy));
                    }
                }
                Event::Tag(t) => {
                    if t.color.has(ColorSet::EARLY) {
                        early_repo.append(event.clone());
                    } else {
                        late_repo.append(event.clone());
                    }
                }
                Event::Reset(r) => {
                    if r.color.has(ColorSet::EARLY) {
                        early_repo.append(event.clone());
                    } else {
                        late_repo.append(event.clone());
                    }
                }
                Event::Callout(_) => {
                    early_repo.append(event.clone());
                }
            }
        }
        // the colors were scratch; leave the source repository clean
        for event in &mut self.events {
            event.clear_color();
        }
        for repo in [&mut early_repo, &mut late_repo] {
            for event in &mut repo.events {
                event.clear_color();
            }
            repo.rebuild_children();
            repo.rebuild_blob_refs();
            repo.declare_sequence_mutation("cut partition");
        }
        if self.config.logmask.contains(LogMask::SHOUT) {
            info!(
                early = early_repo.len(),
                late = late_repo.len(),
                "cut partitioned repository"
            );
        }
        Ok((early_repo, late_repo))
    }

    /// Unite several repositories into one. Donors are absorbed oldest
    /// first; each donor root gains the most recent earlier commit of
    /// the accumulated history as a synthetic parent. With `prune`,
    /// grafted roots start from an empty tree. Marks come out
    /// contiguous and 1-origin.
    pub fn unite(mut repos: Vec<Repository>, prune: bool) -> Result<Repository> {
        if repos.is_empty() {
            return Err(SurgeonError::command("unite needs at least one repository"));
        }
        repos.sort_by_key(|repo| {
            repo.events
                .iter()
                .filter_map(|e| e.as_commit())
                .map(|c| c.committer.timestamp())
                .min()
                .unwrap_or(i64::MAX)
        });
        let names: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
        let config = repos[0].config.clone();
        let mut union = Repository::new(&names.join("+"), config)?;
        for mut donor in repos {
            union.uniquify_against(&mut donor)?;
            let donor_roots: Vec<String> = donor
                .events
                .iter()
                .filter_map(|e| e.as_commit())
                .filter(|c| c.parents.is_empty())
                .map(|c| c.mark.clone())
                .collect();
            union.absorb(donor)?;
            union.rebuild_children();
            for root in donor_roots {
                let Some(idx) = union.find_mark(&root) else {
                    continue;
                };
                let root_when = union.events[idx]
                    .as_commit()
                    .expect("root is commit")
                    .committer
                    .timestamp();
                // most recent accumulated commit strictly earlier
                let synthetic = union
                    .events
                    .iter()
                    .filter_map(|e| e.as_commit())
                    .filter(|c| c.mark != root && c.committer.timestamp() < root_when)
                    .max_by_key(|c| c.committer.timestamp())
                    .map(|c| c.mark.clone());
                if prune {
                    let commit = union.events[idx].as_commit_mut().expect("root is commit");
                    commit.fileops.insert(0, FileOp::deleteall());
                    commit.invalidate_caches();
                }
                if let Some(parent) = synthetic {
                    union.set_parents(idx, vec![ParentLink::Mark(parent)])?;
                }
            }
        }
        union.resolve_callouts();
        union.resort()?;
        union.renumber(1)?;
        if union.config.logmask.contains(LogMask::SHOUT) {
            info!(union = %union.name, events = union.len(), "unite complete");
        }
        Ok(union)
    }
}
