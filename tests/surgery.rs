//! End-to-end operator scenarios: delete, split, graft, cut, expunge,
//! with the graph invariants re-checked after every operation.

use std::collections::{BTreeSet, HashMap};

use regex::bytes::Regex;
use stream_surgeon::{Config, Event, Repository, SquashPolicy, WriteOptions};

fn load(name: &str, data: &[u8]) -> Repository {
    let mut repo = Repository::new(name, Config::for_tests()).unwrap();
    repo.read_stream_bytes(data).unwrap();
    repo
}

/// Graph invariants: mark uniqueness, children as the exact inverse of
/// parents, and acyclic ancestry.
fn assert_invariants(repo: &Repository) {
    let mut seen_marks = BTreeSet::new();
    for event in repo.events() {
        if let Some(mark) = event.mark() {
            assert!(seen_marks.insert(mark.to_string()), "duplicate mark {mark}");
        }
    }
    let mut expected_children: HashMap<String, Vec<String>> = HashMap::new();
    for event in repo.events() {
        if let Event::Commit(c) = event {
            for parent in c.parent_marks() {
                expected_children
                    .entry(parent.to_string())
                    .or_default()
                    .push(c.mark.clone());
            }
        }
    }
    for (i, event) in repo.events().iter().enumerate() {
        if let Event::Commit(c) = event {
            let expected = expected_children.remove(&c.mark).unwrap_or_default();
            assert_eq!(c.children, expected, "stale children on {}", c.mark);
            assert!(
                !repo.ancestors(i).contains(&c.mark),
                "{} is its own ancestor",
                c.mark
            );
        }
    }
}

fn history() -> Vec<u8> {
    let mut s = Vec::new();
    for (blob, content) in [(1, "v1"), (3, "v2"), (5, "v3")] {
        s.extend_from_slice(format!("blob\nmark :{blob}\ndata 3\n{content}\n\n").as_bytes());
    }
    s.extend_from_slice(
        b"commit refs/heads/master\nmark :2\ncommitter Ann <ann@example.com> 100 +0000\ndata 4\none\nM 100644 :1 README\n",
    );
    s.extend_from_slice(
        b"commit refs/heads/master\nmark :4\ncommitter Ann <ann@example.com> 200 +0000\ndata 4\ntwo\nM 100644 :3 README\n",
    );
    s.extend_from_slice(
        b"commit refs/heads/master\nmark :6\ncommitter Ann <ann@example.com> 300 +0000\ndata 6\nthree\nM 100644 :5 README\n",
    );
    s.extend_from_slice(
        b"tag tip\nfrom :6\ntagger Ann <ann@example.com> 300 +0000\ndata 4\ntip\n",
    );
    s
}

#[test]
fn delete_commit_reattaches_and_preserves_tip() {
    let mut repo = load("delete", &history());
    let idx = repo.find_mark(":6").unwrap();
    repo.delete_events(&[idx], SquashPolicy::default()).unwrap();
    assert!(repo.find_mark(":6").is_none());
    // attachments land on the parent
    let tag = repo
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Tag(t) => Some(t),
            _ => None,
        })
        .unwrap();
    assert_eq!(tag.committish, ":4");
    // branch tip content equals the state after :4
    let tip = repo.find_mark(":4").unwrap();
    let manifest = repo.manifest(tip).unwrap();
    assert_eq!(manifest.get(b"README").unwrap().committish, ":3");
    assert_invariants(&repo);
}

#[test]
fn split_by_prefix_keeps_mark_and_rewires_children() {
    let mut repo = load(
        "split",
        b"blob\nmark :1\ndata 2\na\n\nblob\nmark :2\ndata 2\nb\n\ncommit refs/heads/master\nmark :3\ncommitter A <a@b.c> 100 +0000\ndata 6\nmixed\nM 100644 :1 src/a.c\nM 100644 :2 doc/a.txt\ncommit refs/heads/master\nmark :4\ncommitter A <a@b.c> 200 +0000\ndata 5\nnext\nM 100644 :1 src/b.c\n",
    );
    let idx = repo.find_mark(":3").unwrap();
    let new_mark = repo.split_commit_by_prefix(idx, b"src/").unwrap();
    let first_idx = repo.find_mark(":3").unwrap();
    let second_idx = repo.find_mark(&new_mark).unwrap();
    assert_eq!(second_idx, first_idx + 1, "halves must be consecutive");
    let second = repo.commit_by_mark(&new_mark).unwrap();
    assert_eq!(second.first_parent_mark(), Some(":3"));
    assert_eq!(second.children, vec![":4"]);
    assert_eq!(
        repo.commit_by_mark(":4").unwrap().first_parent_mark(),
        Some(new_mark.as_str())
    );
    // the combined tree state is unchanged at the tip
    let tip = repo.find_mark(":4").unwrap();
    let manifest = repo.manifest(tip).unwrap();
    assert!(manifest.get(b"src/a.c").is_some());
    assert!(manifest.get(b"doc/a.txt").is_some());
    assert_invariants(&repo);
}

#[test]
fn graft_resolves_callout_and_renumbers() {
    let mut receiver = load(
        "receiver",
        b"blob\nmark :1\ndata 2\nr\n\ncommit refs/heads/master\nmark :2\ncommitter R <r@x.y> 100 +0000\ndata 5\nbase\nM 100644 :1 base.txt\n",
    );
    let donor = load(
        "donor",
        b"blob\nmark :1\ndata 2\nd\n\ncommit refs/heads/topic\nmark :2\ncommitter D <d@x.y> 500 +0000\ndata 6\ndonor\nfrom 1970-01-01T00:01:40Z!r@x.y\nM 100644 :1 donor.txt\n",
    );
    receiver.graft(donor, None, false).unwrap();
    // contiguous 1-origin mark space
    let marked = receiver
        .events()
        .iter()
        .filter(|e| e.mark().is_some())
        .count();
    for n in 1..=marked {
        assert!(receiver.find_mark(&format!(":{n}")).is_some());
    }
    // the callout became a concrete edge
    let topic = receiver
        .events()
        .iter()
        .filter_map(|e| e.as_commit())
        .find(|c| c.branch == "refs/heads/topic")
        .unwrap();
    let parent = topic.first_parent().unwrap();
    assert!(!parent.is_callout());
    // and the whole thing still streams out and back
    let mut out = Vec::new();
    receiver
        .write_stream(&mut out, &WriteOptions::default())
        .unwrap();
    let reread = load("reread", &out);
    assert_eq!(reread.events().len(), receiver.events().len());
    assert_invariants(&receiver);
}

fn five_chain() -> Vec<u8> {
    let mut s = Vec::new();
    for (i, (blob, commit)) in [(1, 2), (3, 4), (5, 6), (7, 8), (9, 10)].iter().enumerate() {
        s.extend_from_slice(format!("blob\nmark :{blob}\ndata 3\nv{i}\n\n").as_bytes());
        s.extend_from_slice(
            format!(
                "commit refs/heads/master\nmark :{commit}\ncommitter A <a@b.c> {} +0000\ndata 3\nc{i}\nM 100644 :{blob} file{i}\n",
                (i + 1) * 100
            )
            .as_bytes(),
        );
    }
    s
}

#[test]
fn cut_at_edge_partitions_commits_and_blobs() {
    let mut repo = load("cut", &five_chain());
    let c = repo.find_mark(":6").unwrap();
    let d = repo.find_mark(":8").unwrap();
    let (early, late) = repo.cut(c, d).unwrap();
    let marks = |r: &Repository| -> BTreeSet<String> {
        r.events()
            .iter()
            .filter_map(|e| e.as_commit())
            .map(|c| c.mark.clone())
            .collect()
    };
    let early_marks = marks(&early);
    let late_marks = marks(&late);
    // the union is the original commit set and the halves are disjoint
    let original = marks(&repo);
    let union: BTreeSet<String> = early_marks.union(&late_marks).cloned().collect();
    assert_eq!(union, original);
    assert!(early_marks.is_disjoint(&late_marks));
    // every blob a partition's commits reference is present in it
    for part in [&early, &late] {
        for commit in part.events().iter().filter_map(|e| e.as_commit()) {
            for op in &commit.fileops {
                if let Some(mark) = op.blob_mark() {
                    assert!(
                        part.find_mark(mark).is_some(),
                        "blob {mark} missing from partition"
                    );
                }
            }
        }
    }
    // and neither partition carries the other's blobs
    assert!(early.find_mark(":7").is_none());
    assert!(late.find_mark(":1").is_none());
    assert_invariants(&early);
    assert_invariants(&late);
}

#[test]
fn cut_at_merge_reports_infeasible_and_leaves_repo_alone() {
    let mut repo = load(
        "uncut",
        b"blob\nmark :1\ndata 2\nx\n\ncommit refs/heads/master\nmark :2\ncommitter A <a@b.c> 100 +0000\ndata 2\na\nM 100644 :1 f\ncommit refs/heads/side\nmark :3\ncommitter A <a@b.c> 150 +0000\ndata 2\nb\nfrom :2\nM 100644 :1 g\ncommit refs/heads/master\nmark :4\ncommitter A <a@b.c> 200 +0000\ndata 2\nm\nfrom :2\nmerge :3\n",
    );
    let before: Vec<u8> = {
        let mut out = Vec::new();
        repo.write_stream(&mut out, &WriteOptions::default()).unwrap();
        out
    };
    let e = repo.find_mark(":2").unwrap();
    let l = repo.find_mark(":4").unwrap();
    let err = repo.cut(e, l).unwrap_err();
    assert_eq!(err.kind(), stream_surgeon::ErrorKind::Command);
    let after: Vec<u8> = {
        let mut out = Vec::new();
        repo.write_stream(&mut out, &WriteOptions::default()).unwrap();
        out
    };
    assert_eq!(before, after, "failed cut must not change the repository");
}

#[test]
fn expunge_secrets_tagifies_and_collects() {
    let mut repo = load(
        "expunge",
        b"blob\nmark :1\ndata 5\ncode\n\nblob\nmark :2\ndata 5\nhush\n\ncommit refs/heads/master\nmark :3\ncommitter A <a@b.c> 100 +0000\ndata 5\nboth\nM 100644 :1 src/main.c\nM 100644 :2 secrets/key\ncommit refs/heads/master\nmark :4\ncommitter A <a@b.c> 200 +0000\ndata 5\nonly\nM 100644 :2 secrets/other\n",
    );
    let pattern = Regex::new("^secrets/").unwrap();
    repo.expunge(&pattern, false).unwrap();
    // the all-secrets commit became a tag named for its mark
    assert!(repo.find_mark(":4").is_none());
    let tag = repo
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Tag(t) => Some(t),
            _ => None,
        })
        .unwrap();
    assert_eq!(tag.name, "emptycommit-4");
    assert_eq!(tag.committish, ":3");
    // the secrets blob is gone, the code blob survives
    assert!(repo.find_mark(":2").is_none());
    assert!(repo.find_mark(":1").is_some());
    // no path under secrets/ anywhere in surviving history
    for commit in repo.events().iter().filter_map(|e| e.as_commit()) {
        for op in &commit.fileops {
            assert!(!op.path.starts_with(b"secrets/"));
        }
    }
    assert_invariants(&repo);
}

#[test]
fn resort_orders_parents_and_blobs_before_users() {
    let mut repo = load("resort", &five_chain());
    // delete+renumber churn then resort keeps dependencies ordered
    let idx = repo.find_mark(":6").unwrap();
    repo.delete_events(&[idx], SquashPolicy::default()).unwrap();
    repo.renumber(1).unwrap();
    repo.resort().unwrap();
    let mut position: HashMap<String, usize> = HashMap::new();
    for (i, event) in repo.events().iter().enumerate() {
        if let Some(mark) = event.mark() {
            position.insert(mark.to_string(), i);
        }
    }
    for (i, event) in repo.events().iter().enumerate() {
        if let Event::Commit(c) = event {
            for parent in c.parent_marks() {
                assert!(position[parent] < i, "parent after child");
            }
            for op in &c.fileops {
                if let Some(mark) = op.blob_mark() {
                    assert!(position[mark] < i, "blob after referencing commit");
                }
            }
        }
    }
    assert_invariants(&repo);
}
