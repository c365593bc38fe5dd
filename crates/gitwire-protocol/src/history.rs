//! Commit histories queued for a push.
//!
//! A [`History`] is a rootless chain of commits supplied by the caller.
//! Before packing, the chain is spliced onto the ref's current tip: the old
//! tip becomes the parent of the oldest commit, and every commit id is
//! computed from there.

use gitwire_objects::{GitObject, ObjectId};

/// A commit waiting to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    /// Root tree of the commit.
    pub tree: ObjectId,
    /// Author line (`Name <email> <time> <tz>`).
    pub author: String,
    /// Committer line.
    pub committer: String,
    /// Commit message.
    pub message: String,
    /// Trees and blobs introduced by this commit.
    pub objects: Vec<GitObject>,
}

impl PendingCommit {
    /// Creates a commit with the same author and committer.
    pub fn new(tree: ObjectId, signature: impl Into<String>, message: impl Into<String>) -> Self {
        let signature = signature.into();
        Self {
            tree,
            committer: signature.clone(),
            author: signature,
            message: message.into(),
            objects: Vec::new(),
        }
    }

    /// Adds an object the commit introduces.
    pub fn with_object(mut self, object: GitObject) -> Self {
        self.objects.push(object);
        self
    }
}

/// An ordered chain of commits, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    commits: Vec<PendingCommit>,
}

/// A history whose commits have been hashed against a base.
#[derive(Debug, Clone)]
pub struct SplicedHistory {
    /// Id of the newest commit.
    pub tip: ObjectId,
    /// Every object to pack, commits included.
    pub objects: Vec<GitObject>,
}

impl History {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a commit on top of the chain.
    pub fn commit(mut self, commit: PendingCommit) -> Self {
        self.commits.push(commit);
        self
    }

    /// Number of commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Returns true if there are no commits.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Hashes the chain on top of `base`. Returns None for an empty history.
    ///
    /// A zero or absent base yields a root commit.
    pub fn splice_onto(&self, base: Option<ObjectId>) -> Option<SplicedHistory> {
        let mut parent = base.filter(|id| !id.is_zero());
        let mut objects = Vec::new();

        for pending in &self.commits {
            objects.extend(pending.objects.iter().cloned());
            let parents: Vec<ObjectId> = parent.into_iter().collect();
            let commit = GitObject::commit(
                &pending.tree,
                &parents,
                &pending.author,
                &pending.committer,
                &pending.message,
            );
            parent = Some(commit.id);
            objects.push(commit);
        }

        parent
            .filter(|_| !self.commits.is_empty())
            .map(|tip| SplicedHistory { tip, objects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: &str = "Alice <alice@example.com> 1700000000 +0000";

    fn one_file_commit(content: &str, message: &str) -> PendingCommit {
        let blob = GitObject::blob(content.as_bytes().to_vec());
        let tree = GitObject::tree([("100644", "file.txt", blob.id)]);
        PendingCommit::new(tree.id, SIG, message)
            .with_object(blob)
            .with_object(tree)
    }

    #[test]
    fn test_empty_history() {
        assert!(History::new().is_empty());
        assert!(History::new()
            .splice_onto(Some(ObjectId::from_bytes([1; 20])))
            .is_none());
    }

    #[test]
    fn test_splice_sets_base_parent() {
        let base = ObjectId::from_bytes([7; 20]);
        let history = History::new()
            .commit(one_file_commit("one", "first"))
            .commit(one_file_commit("two", "second"));
        assert_eq!(history.len(), 2);

        let spliced = history.splice_onto(Some(base)).unwrap();
        let commits: Vec<&GitObject> = spliced
            .objects
            .iter()
            .filter(|o| o.object_type == gitwire_objects::ObjectType::Commit)
            .collect();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].parents(), vec![base]);
        assert_eq!(commits[1].parents(), vec![commits[0].id]);
        assert_eq!(spliced.tip, commits[1].id);
        // blob + tree + commit per pending commit
        assert_eq!(spliced.objects.len(), 6);
    }

    #[test]
    fn test_zero_base_is_root() {
        let history = History::new().commit(one_file_commit("x", "root"));
        let rooted = history.splice_onto(Some(ObjectId::zero())).unwrap();
        let unrooted = history.splice_onto(None).unwrap();
        assert_eq!(rooted.tip, unrooted.tip);
        let tip = rooted.objects.iter().find(|o| o.id == rooted.tip).unwrap();
        assert!(tip.parents().is_empty());
    }

    #[test]
    fn test_tip_depends_on_base() {
        let history = History::new().commit(one_file_commit("x", "m"));
        let a = history.splice_onto(Some(ObjectId::from_bytes([1; 20]))).unwrap();
        let b = history.splice_onto(Some(ObjectId::from_bytes([2; 20]))).unwrap();
        assert_ne!(a.tip, b.tip);
    }
}
