//! Content-hash trees for incremental reindexing.
//!
//! A [`MerkleTree`] is an arena of nodes addressed by index; node 0 is the
//! snapshot root. Leaves hash file bytes with SHA-256. A directory hashes the
//! sorted manifest of its children, one `type:name:hash` line each, so equal
//! directory hashes imply identical subtrees and [`find_changed_files`] can
//! skip them without descending.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Directory names never descended into.
const EXCLUDED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "__pycache__",
    "build",
    "dist",
    "venv",
];

/// Digest given to entries that must diff as changed against any real snapshot.
const STALE_HASH: &str = "stale";

/// Whether a directory entry is skipped when walking a source tree.
#[must_use]
pub fn is_ignored(name: &str, is_dir: bool) -> bool {
    name.starts_with('.') || (is_dir && EXCLUDED_DIRS.contains(&name))
}

/// One file or directory in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    /// Entry name (empty for the root)
    pub name: String,
    /// Path relative to the snapshot root, `/`-separated
    pub rel_path: String,
    /// Hex SHA-256 digest
    pub hash: String,
    /// Whether this node is a directory
    pub is_dir: bool,
    /// Arena indexes of the children, sorted by name
    pub children: Vec<usize>,
}

/// Arena-backed content-hash tree of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
}

impl MerkleTree {
    /// Snapshot `root` recursively.
    ///
    /// Hidden entries, excluded build directories, and symlinks are skipped.
    pub fn build_from_directory(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let mut tree = Self { nodes: Vec::new() };
        tree.build_dir(root, String::new(), String::new())?;
        tracing::debug!(
            root = %root.display(),
            nodes = tree.nodes.len(),
            "Built merkle snapshot"
        );
        Ok(tree)
    }

    fn build_dir(&mut self, dir: &Path, name: String, rel_path: String) -> Result<usize> {
        let index = self.nodes.len();
        self.nodes.push(MerkleNode {
            name,
            rel_path: rel_path.clone(),
            hash: String::new(),
            is_dir: true,
            children: Vec::new(),
        });

        let mut entries: Vec<(String, std::path::PathBuf, bool)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if is_ignored(&entry_name, file_type.is_dir()) {
                continue;
            }
            entries.push((entry_name, entry.path(), file_type.is_dir()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut children = Vec::with_capacity(entries.len());
        for (entry_name, path, is_dir) in entries {
            let child_rel = if rel_path.is_empty() {
                entry_name.clone()
            } else {
                format!("{rel_path}/{entry_name}")
            };
            let child = if is_dir {
                self.build_dir(&path, entry_name, child_rel)?
            } else {
                let hash = hash_file(&path)?;
                self.push_leaf(entry_name, child_rel, hash)
            };
            children.push(child);
        }

        let hash = directory_hash(children.iter().map(|&c| &self.nodes[c]));
        let node = &mut self.nodes[index];
        node.children = children;
        node.hash = hash;
        Ok(index)
    }

    fn push_leaf(&mut self, name: String, rel_path: String, hash: String) -> usize {
        self.nodes.push(MerkleNode {
            name,
            rel_path,
            hash,
            is_dir: false,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// The snapshot root.
    #[must_use]
    pub fn root(&self) -> Option<&MerkleNode> {
        self.nodes.first()
    }

    /// Digest of the whole snapshot.
    #[must_use]
    pub fn root_hash(&self) -> Option<&str> {
        self.root().map(|n| n.hash.as_str())
    }

    /// Node at an arena index.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&MerkleNode> {
        self.nodes.get(index)
    }

    /// Node at a relative path (`""` is the root).
    #[must_use]
    pub fn get(&self, rel_path: &str) -> Option<&MerkleNode> {
        let mut current = self.root()?;
        if rel_path.is_empty() {
            return Some(current);
        }
        for part in rel_path.split('/') {
            current = current
                .children
                .iter()
                .map(|&c| &self.nodes[c])
                .find(|n| n.name == part)?;
        }
        Some(current)
    }

    /// Number of nodes, directories included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Relative paths of every file under the node at `index`.
    fn leaves_under(&self, index: usize, out: &mut Vec<String>) {
        let node = &self.nodes[index];
        if node.is_dir {
            for &child in &node.children {
                self.leaves_under(child, out);
            }
        } else {
            out.push(node.rel_path.clone());
        }
    }

    /// Every file path in the snapshot.
    #[must_use]
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.nodes.is_empty() {
            self.leaves_under(0, &mut out);
        }
        out
    }

    /// Persist the snapshot as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Load a snapshot written by [`MerkleTree::save`].
    ///
    /// Returns `None` if the file does not exist. A snapshot whose child
    /// links do not form a tree is rejected with [`Error::Config`].
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tree: Self = serde_json::from_slice(&bytes)?;
        tree.validate().map_err(|reason| {
            Error::Config(format!("corrupt merkle snapshot {}: {reason}", path.display()))
        })?;
        Ok(Some(tree))
    }

    /// Children must point forward into the arena and only directories
    /// may have them, so every walk terminates in bounds.
    fn validate(&self) -> std::result::Result<(), String> {
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.is_dir && !node.children.is_empty() {
                return Err(format!("file node {index} has children"));
            }
            if let Some(&child) = node
                .children
                .iter()
                .find(|&&c| c <= index || c >= self.nodes.len())
            {
                return Err(format!("node {index} links to invalid child {child}"));
            }
        }
        Ok(())
    }

    /// Force the listed entries to compare as changed on the next diff.
    ///
    /// A listed directory marks every file under it. Ancestors of marked
    /// files are marked too, so the diff descends to them. Returns the
    /// number of files marked.
    pub fn mark_stale(&mut self, rel_paths: &HashSet<String>) -> usize {
        if self.nodes.is_empty() || rel_paths.is_empty() {
            return 0;
        }
        self.mark_stale_from(0, false, rel_paths)
    }

    fn mark_stale_from(&mut self, index: usize, inherited: bool, rel_paths: &HashSet<String>) -> usize {
        let forced = inherited || rel_paths.contains(&self.nodes[index].rel_path);
        let marked = if self.nodes[index].is_dir {
            let children = self.nodes[index].children.clone();
            children
                .into_iter()
                .map(|child| self.mark_stale_from(child, forced, rel_paths))
                .sum()
        } else {
            usize::from(forced)
        };
        if marked > 0 {
            self.nodes[index].hash = STALE_HASH.to_string();
        }
        marked
    }
}

/// Files that differ between two snapshots, sorted.
///
/// Missing snapshots count as empty. Subtrees with equal hashes are skipped.
/// Nodes present in only one snapshot contribute all of their files.
#[must_use]
pub fn find_changed_files(old: Option<&MerkleTree>, new: Option<&MerkleTree>) -> Vec<String> {
    let old_root = old.filter(|t| !t.is_empty()).map(|t| (t, 0));
    let new_root = new.filter(|t| !t.is_empty()).map(|t| (t, 0));
    let mut changed = Vec::new();
    diff_nodes(old_root, new_root, &mut changed);
    changed.sort();
    changed.dedup();
    changed
}

type NodeRef<'a> = Option<(&'a MerkleTree, usize)>;

fn diff_nodes(old: NodeRef<'_>, new: NodeRef<'_>, out: &mut Vec<String>) {
    match (old, new) {
        (None, None) => {}
        (Some((tree, i)), None) | (None, Some((tree, i))) => tree.leaves_under(i, out),
        (Some((old_tree, oi)), Some((new_tree, ni))) => {
            let o = &old_tree.nodes[oi];
            let n = &new_tree.nodes[ni];
            if o.is_dir == n.is_dir && o.hash == n.hash {
                return;
            }
            match (o.is_dir, n.is_dir) {
                (true, true) => {
                    let mut oc = o.children.iter().map(|&c| (&old_tree.nodes[c].name, c)).peekable();
                    let mut nc = n.children.iter().map(|&c| (&new_tree.nodes[c].name, c)).peekable();
                    loop {
                        match (oc.peek().copied(), nc.peek().copied()) {
                            (None, None) => break,
                            (Some((_, c)), None) => {
                                oc.next();
                                diff_nodes(Some((old_tree, c)), None, out);
                            }
                            (None, Some((_, c))) => {
                                nc.next();
                                diff_nodes(None, Some((new_tree, c)), out);
                            }
                            (Some((on, o_idx)), Some((nn, n_idx))) => match on.cmp(nn) {
                                std::cmp::Ordering::Less => {
                                    oc.next();
                                    diff_nodes(Some((old_tree, o_idx)), None, out);
                                }
                                std::cmp::Ordering::Greater => {
                                    nc.next();
                                    diff_nodes(None, Some((new_tree, n_idx)), out);
                                }
                                std::cmp::Ordering::Equal => {
                                    oc.next();
                                    nc.next();
                                    diff_nodes(Some((old_tree, o_idx)), Some((new_tree, n_idx)), out);
                                }
                            },
                        }
                    }
                }
                (false, false) => out.push(n.rel_path.clone()),
                _ => {
                    old_tree.leaves_under(oi, out);
                    new_tree.leaves_under(ni, out);
                }
            }
        }
    }
}

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

/// Hex SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> Result<String> {
    Ok(hash_bytes(&fs::read(path)?))
}

fn directory_hash<'a>(children: impl Iterator<Item = &'a MerkleNode>) -> String {
    let mut manifest: Vec<String> = children
        .map(|c| format!("{}:{}:{}\n", if c.is_dir { 'd' } else { 'f' }, c.name, c.hash))
        .collect();
    manifest.sort();
    hash_bytes(manifest.concat().as_bytes())
}

/// Digest of a directory from `(name, is_dir, hash)` entries.
///
/// Produces the same value as a snapshot of the same children.
#[must_use]
pub fn manifest_hash<'a>(entries: impl IntoIterator<Item = (&'a str, bool, &'a str)>) -> String {
    let nodes: Vec<MerkleNode> = entries
        .into_iter()
        .map(|(name, is_dir, hash)| MerkleNode {
            name: name.to_string(),
            rel_path: String::new(),
            hash: hash.to_string(),
            is_dir,
            children: Vec::new(),
        })
        .collect();
    directory_hash(nodes.iter())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write file");
    }

    fn sample() -> TempDir {
        let dir = tempfile::tempdir().expect("create temp dir");
        write(dir.path(), "a.rs", "fn a() {}");
        write(dir.path(), "src/b.rs", "fn b() {}");
        write(dir.path(), "src/deep/c.rs", "fn c() {}");
        dir
    }

    #[test]
    fn identical_snapshots_have_no_changes() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        assert!(find_changed_files(Some(&tree), Some(&tree)).is_empty());

        let again = MerkleTree::build_from_directory(dir.path()).expect("rebuild");
        assert_eq!(tree.root_hash(), again.root_hash());
    }

    #[test]
    fn rewriting_same_bytes_is_not_a_change() {
        let dir = sample();
        let before = MerkleTree::build_from_directory(dir.path()).expect("build");
        write(dir.path(), "src/b.rs", "fn b() {}");
        let after = MerkleTree::build_from_directory(dir.path()).expect("rebuild");

        assert!(find_changed_files(Some(&before), Some(&after)).is_empty());
    }

    #[test]
    fn modified_added_and_removed_files_are_reported() {
        let dir = sample();
        let before = MerkleTree::build_from_directory(dir.path()).expect("build");

        write(dir.path(), "src/deep/c.rs", "fn c() { changed() }");
        write(dir.path(), "src/new.rs", "fn n() {}");
        fs::remove_file(dir.path().join("a.rs")).expect("remove a.rs");
        let after = MerkleTree::build_from_directory(dir.path()).expect("rebuild");

        assert_eq!(
            find_changed_files(Some(&before), Some(&after)),
            vec!["a.rs", "src/deep/c.rs", "src/new.rs"]
        );
    }

    #[test]
    fn missing_snapshot_reports_every_file() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");

        let all = vec!["a.rs", "src/b.rs", "src/deep/c.rs"];
        assert_eq!(find_changed_files(None, Some(&tree)), all);
        assert_eq!(find_changed_files(Some(&tree), None), all);
        assert!(find_changed_files(None, None).is_empty());
    }

    #[test]
    fn hidden_and_build_dirs_are_skipped() {
        let dir = sample();
        write(dir.path(), ".git/HEAD", "ref");
        write(dir.path(), "target/debug/out", "bin");

        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        assert!(tree.get(".git").is_none());
        assert!(tree.get("target").is_none());
        assert!(tree.get("src/deep/c.rs").is_some());
    }

    #[test]
    fn directory_hash_matches_manifest_hash() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        let src = tree.get("src").expect("src node");

        let entries: Vec<(&str, bool, &str)> = src
            .children
            .iter()
            .filter_map(|&c| tree.node(c))
            .map(|n| (n.name.as_str(), n.is_dir, n.hash.as_str()))
            .collect();
        assert_eq!(manifest_hash(entries), src.hash);
    }

    #[test]
    fn load_rejects_out_of_range_children() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        let snapshot = dir.path().join(".strata/merkle.json");
        tree.save(&snapshot).expect("save");

        let mut raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&snapshot).expect("read")).expect("parse");
        raw["nodes"][0]["children"] = serde_json::json!([99]);
        fs::write(&snapshot, serde_json::to_vec(&raw).expect("encode")).expect("write");

        let err = MerkleTree::load(&snapshot).expect_err("corrupt snapshot");
        assert!(matches!(err, Error::Config(_)), "unexpected error: {err}");
    }

    #[test]
    fn load_rejects_backward_links() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        let snapshot = dir.path().join(".strata/merkle.json");
        tree.save(&snapshot).expect("save");

        let mut raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&snapshot).expect("read")).expect("parse");
        let src = tree
            .root()
            .expect("root")
            .children
            .iter()
            .copied()
            .find(|&c| tree.node(c).is_some_and(|n| n.is_dir))
            .expect("src dir");
        raw["nodes"][src]["children"] = serde_json::json!([0]);
        fs::write(&snapshot, serde_json::to_vec(&raw).expect("encode")).expect("write");

        assert!(MerkleTree::load(&snapshot).is_err());
    }

    #[test]
    fn stale_files_diff_as_changed() {
        let dir = sample();
        let fresh = MerkleTree::build_from_directory(dir.path()).expect("build");
        let mut saved = fresh.clone();

        let stale = HashSet::from(["src/deep/c.rs".to_string()]);
        assert_eq!(saved.mark_stale(&stale), 1);
        assert_ne!(saved.root_hash(), fresh.root_hash());
        assert_eq!(find_changed_files(Some(&saved), Some(&fresh)), vec!["src/deep/c.rs"]);
    }

    #[test]
    fn stale_directory_marks_every_file_under_it() {
        let dir = sample();
        let fresh = MerkleTree::build_from_directory(dir.path()).expect("build");
        let mut saved = fresh.clone();

        assert_eq!(saved.mark_stale(&HashSet::from(["src".to_string()])), 2);
        assert_eq!(
            find_changed_files(Some(&saved), Some(&fresh)),
            vec!["src/b.rs", "src/deep/c.rs"]
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = sample();
        let tree = MerkleTree::build_from_directory(dir.path()).expect("build");
        let snapshot = dir.path().join(".strata/merkle.json");

        tree.save(&snapshot).expect("save");
        let loaded = MerkleTree::load(&snapshot).expect("load").expect("exists");
        assert_eq!(loaded, tree);
        assert!(MerkleTree::load(&dir.path().join("missing.json")).expect("load").is_none());
    }
}
