//! Translation between source directories and their index databases.
//!
//! Every indexed source directory `D` owns one database at
//! `{index_root}/{components of D}/_index.db`. On Windows the drive prefix
//! becomes a plain component (`C:\src\app` maps to `{index_root}/C/src/app`).
//!
//! Paths are canonicalized once, when they are written. Registry lookups then
//! compare [`path_key`] strings by plain equality, case-folded only when the
//! mapper is configured for a case-insensitive filesystem.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf, Prefix};

use thiserror::Error;

/// File name of every per-directory index database.
pub const INDEX_DB_NAME: &str = "_index.db";

/// Whether path comparisons fold case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    /// Paths differing only in case are different directories
    Sensitive,
    /// Paths differing only in case name the same directory
    Insensitive,
}

impl CaseSensitivity {
    /// The usual behaviour of the host platform's default filesystem.
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            Self::Insensitive
        } else {
            Self::Sensitive
        }
    }
}

/// Why a candidate path was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPath {
    /// The path contains a NUL byte
    #[error("path contains a null byte")]
    NullByte,
    /// The path is on another drive or filesystem root
    #[error("path is on a different filesystem root than {0}")]
    DifferentRoot(String),
    /// The path resolves outside the project
    #[error("path resolves outside project root {0}")]
    OutsideProject(String),
}

/// Maps source directories to index locations and back.
#[derive(Debug, Clone)]
pub struct PathMapper {
    index_root: PathBuf,
    case: CaseSensitivity,
}

impl PathMapper {
    /// Create a mapper rooted at `index_root` using the platform's case rule.
    #[must_use]
    pub fn new(index_root: impl Into<PathBuf>) -> Self {
        Self {
            index_root: lexical_absolute(&index_root.into()),
            case: CaseSensitivity::platform_default(),
        }
    }

    /// Override the case rule.
    #[must_use]
    pub fn with_case_sensitivity(mut self, case: CaseSensitivity) -> Self {
        self.case = case;
        self
    }

    /// Root directory holding every index database.
    #[must_use]
    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    /// Case rule used for comparison keys.
    #[must_use]
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case
    }

    /// Index directory for a source directory.
    #[must_use]
    pub fn source_to_index_dir(&self, source_dir: &Path) -> PathBuf {
        let source_dir = canonicalize_path(source_dir);
        let mut out = self.index_root.clone();
        for component in source_dir.components() {
            match component {
                Component::Prefix(prefix) => out.push(prefix_component(prefix.kind())),
                Component::Normal(name) => out.push(name),
                Component::RootDir | Component::CurDir | Component::ParentDir => {}
            }
        }
        out
    }

    /// Index database for a source directory.
    #[must_use]
    pub fn source_to_index_db(&self, source_dir: &Path) -> PathBuf {
        self.source_to_index_dir(source_dir).join(INDEX_DB_NAME)
    }

    /// Index directory of a project root.
    #[must_use]
    pub fn get_index_root(&self, source_root: &Path) -> PathBuf {
        self.source_to_index_dir(source_root)
    }

    /// Source directory for an index directory or `_index.db` path.
    ///
    /// Returns `None` for paths outside the index root.
    #[must_use]
    pub fn index_to_source(&self, index_path: &Path) -> Option<PathBuf> {
        let dir = if index_path.file_name() == Some(OsStr::new(INDEX_DB_NAME)) {
            index_path.parent()?
        } else {
            index_path
        };
        let relative = dir.strip_prefix(&self.index_root).ok()?;
        Some(rebuild_source(relative))
    }

    /// Comparison key for `path` under this mapper's case rule.
    #[must_use]
    pub fn key(&self, path: &Path) -> String {
        path_key(path, self.case)
    }

    /// Like [`PathMapper::key`] for a path already passed through
    /// [`canonicalize_path`], without filesystem access.
    #[must_use]
    pub fn canonical_key(&self, canonical: &Path) -> String {
        lexical_key(canonical, self.case)
    }

    /// Check that a stored file path is safe to return for `project_root`.
    ///
    /// Relative candidates are resolved against the project root.
    pub fn validate_candidate_path(
        &self,
        candidate: &str,
        project_root: &Path,
    ) -> Result<PathBuf, InvalidPath> {
        if candidate.contains('\0') {
            return Err(InvalidPath::NullByte);
        }
        let root_text = project_root.to_string_lossy();
        if filesystem_root(candidate) != filesystem_root(&root_text)
            && is_rooted_text(candidate)
        {
            return Err(InvalidPath::DifferentRoot(root_text.into_owned()));
        }

        let candidate_path = Path::new(candidate);
        let resolved = if candidate_path.is_absolute() {
            canonicalize_path(candidate_path)
        } else {
            canonicalize_path(&project_root.join(candidate_path))
        };

        let root_key = self.key(project_root);
        let candidate_key = self.key(&resolved);
        let inside = candidate_key == root_key
            || candidate_key
                .strip_prefix(root_key.trim_end_matches('/'))
                .is_some_and(|rest| rest.starts_with('/'));
        if inside {
            Ok(resolved)
        } else {
            Err(InvalidPath::OutsideProject(root_text.into_owned()))
        }
    }
}

/// Resolve a path to its canonical absolute form.
///
/// The longest existing ancestor is resolved through the filesystem
/// (following symlinks); the remaining components are appended lexically.
#[must_use]
pub fn canonicalize_path(path: &Path) -> PathBuf {
    let absolute = lexical_absolute(path);
    let mut existing = absolute.as_path();
    let mut suffix = Vec::new();
    loop {
        if let Ok(resolved) = std::fs::canonicalize(existing) {
            let mut out = strip_verbatim(resolved);
            for name in suffix.iter().rev() {
                out.push(name);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                suffix.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Comparison key: canonical path with forward slashes, case-folded when
/// `case` is [`CaseSensitivity::Insensitive`].
#[must_use]
pub fn path_key(path: &Path, case: CaseSensitivity) -> String {
    lexical_key(&canonicalize_path(path), case)
}

/// Comparison key for a path that is already canonical.
///
/// Does not touch the filesystem.
#[must_use]
pub fn lexical_key(path: &Path, case: CaseSensitivity) -> String {
    let key = normalize_separators(path);
    match case {
        CaseSensitivity::Sensitive => key,
        CaseSensitivity::Insensitive => key.to_lowercase(),
    }
}

/// Render a path with forward slashes.
#[must_use]
pub fn normalize_separators(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Make a path absolute and resolve `.` and `..` without touching the disk.
#[must_use]
pub fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn prefix_component(prefix: Prefix<'_>) -> String {
    match prefix {
        Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
            char::from(letter).to_ascii_uppercase().to_string()
        }
        Prefix::UNC(server, share) | Prefix::VerbatimUNC(server, share) => format!(
            "UNC/{}/{}",
            server.to_string_lossy(),
            share.to_string_lossy()
        ),
        Prefix::Verbatim(name) | Prefix::DeviceNS(name) => name.to_string_lossy().into_owned(),
    }
}

#[cfg(windows)]
fn rebuild_source(relative: &Path) -> PathBuf {
    let mut components = relative.components();
    let Some(first) = components.next() else {
        return PathBuf::new();
    };
    let first = first.as_os_str().to_string_lossy();
    let mut out = if first == "UNC" {
        let server = components.next().map(|c| c.as_os_str().to_string_lossy().into_owned());
        let share = components.next().map(|c| c.as_os_str().to_string_lossy().into_owned());
        PathBuf::from(format!(
            r"\\{}\{}\",
            server.unwrap_or_default(),
            share.unwrap_or_default()
        ))
    } else {
        PathBuf::from(format!("{first}:\\"))
    };
    out.push(components.as_path());
    out
}

#[cfg(not(windows))]
fn rebuild_source(relative: &Path) -> PathBuf {
    Path::new("/").join(relative)
}

fn strip_verbatim(path: PathBuf) -> PathBuf {
    let stripped = {
        let text = path.to_string_lossy();
        match text.strip_prefix(r"\\?\UNC\") {
            Some(rest) => Some(PathBuf::from(format!(r"\\{rest}"))),
            None => text.strip_prefix(r"\\?\").map(PathBuf::from),
        }
    };
    stripped.unwrap_or(path)
}

/// Drive letter or UNC host of a textual path, upper-cased.
fn filesystem_root(text: &str) -> Option<String> {
    let normalized = text.replace('\\', "/");
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some(normalized[..1].to_ascii_uppercase());
    }
    if let Some(rest) = normalized.strip_prefix("//") {
        let host = rest.split('/').next().unwrap_or_default();
        return Some(format!("//{}", host.to_ascii_uppercase()));
    }
    None
}

/// Whether the text names an absolute location (drive, UNC, or root slash).
fn is_rooted_text(text: &str) -> bool {
    filesystem_root(text).is_some() || text.starts_with('/') || text.starts_with('\\')
}
