use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use crate::config::FolderOverride;
use crate::source::{GraphClient, SourceError, SourceFolder};

/// Hard cap on folder recursion, download and upload alike.
pub const MAX_DEPTH: usize = 10;

/// One ancestor display name as a local path component: ASCII spaces become
/// underscores.
pub fn folder_component(display_name: &str) -> String {
    display_name.trim().replace(' ', "_")
}

/// Local relative path of a folder: ancestor components joined by `/`, with
/// `//` collapsed and any trailing `/` removed. A pure function of the
/// ancestor display names.
pub fn local_folder_path<S: AsRef<str>>(ancestors: &[S]) -> String {
    let joined = ancestors
        .iter()
        .map(|name| folder_component(name.as_ref()))
        .collect::<Vec<_>>()
        .join("/");

    let mut collapsed = String::with_capacity(joined.len());
    let mut previous_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        collapsed.push(c);
    }
    collapsed.trim_end_matches('/').to_string()
}

/// Ordered display-name rewrites from the account configuration; the first
/// matching entry wins.
#[derive(Debug, Clone, Default)]
pub struct FolderOverrides {
    entries: Vec<(String, String)>,
}

impl FolderOverrides {
    pub fn new(overrides: &[FolderOverride]) -> Self {
        Self {
            entries: overrides
                .iter()
                .map(|entry| (entry.source.clone(), entry.dest.clone()))
                .collect(),
        }
    }

    pub fn apply<'a>(&'a self, display_name: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(source, _)| source == display_name)
            .map(|(_, dest)| dest.as_str())
            .unwrap_or(display_name)
    }
}

/// A source folder scheduled for download, with its resolved local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFolder {
    pub id: String,
    pub display_name: String,
    pub local_path: String,
    pub depth: usize,
}

/// Folder enumeration seam; the production implementation is the Graph
/// client, tests use an in-memory tree.
#[async_trait]
pub trait FolderSource {
    async fn roots(&self) -> Result<Vec<SourceFolder>, SourceError>;
    async fn children(&self, parent_id: &str) -> Result<Vec<SourceFolder>, SourceError>;
}

#[async_trait]
impl FolderSource for GraphClient {
    async fn roots(&self) -> Result<Vec<SourceFolder>, SourceError> {
        self.list_root_folders().await
    }

    async fn children(&self, parent_id: &str) -> Result<Vec<SourceFolder>, SourceError> {
        self.list_child_folders(parent_id).await
    }
}

/// Depth-first enumeration of the source hierarchy, parents before children.
/// Overrides rewrite display names before path construction; excluded
/// folders are skipped with their subtrees; listing calls after the first
/// are paced by `request_delay`.
pub async fn walk_source_folders<S: FolderSource + Sync>(
    source: &S,
    overrides: &FolderOverrides,
    excluded: &[String],
    request_delay: Duration,
) -> Result<Vec<DownloadFolder>, SourceError> {
    let mut result = Vec::new();
    // LIFO of (folder, ancestor components, depth); children pushed in
    // reverse so siblings come off in listing order.
    let mut pending: Vec<(SourceFolder, Vec<String>, usize)> = Vec::new();

    let roots = source.roots().await?;
    for folder in roots.into_iter().rev() {
        pending.push((folder, Vec::new(), 1));
    }

    let mut first_listing = true;
    while let Some((folder, ancestors, depth)) = pending.pop() {
        if is_excluded(&folder.display_name, excluded) {
            continue;
        }

        let name = overrides.apply(&folder.display_name).to_string();
        let mut path_components = ancestors.clone();
        path_components.push(name.clone());
        let local_path = local_folder_path(&path_components);

        result.push(DownloadFolder {
            id: folder.id.clone(),
            display_name: name,
            local_path,
            depth,
        });

        if folder.child_count <= 0 {
            continue;
        }
        if depth >= MAX_DEPTH {
            warn!(
                folder = %folder.display_name,
                depth,
                "maximum folder depth reached, not descending"
            );
            continue;
        }

        if !first_listing {
            sleep(request_delay).await;
        }
        first_listing = false;

        let children = source.children(&folder.id).await?;
        for child in children.into_iter().rev() {
            pending.push((child, path_components.clone(), depth + 1));
        }
    }

    Ok(result)
}

fn is_excluded(display_name: &str, excluded: &[String]) -> bool {
    let name = display_name.trim();
    excluded
        .iter()
        .any(|entry| entry.trim().eq_ignore_ascii_case(name))
}

/// A local folder of downloaded messages, relative to the account directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFolder {
    pub local_path: String,
    pub dir: PathBuf,
    pub messages: Vec<PathBuf>,
}

/// Enumerate the downloaded tree for upload: parents before children, entries
/// sorted by name, recursion capped at the same depth as the source walk.
pub fn walk_local_folders(account_dir: &Path) -> Result<Vec<LocalFolder>, std::io::Error> {
    let mut result = Vec::new();
    if !account_dir.is_dir() {
        return Ok(result);
    }
    walk_local_dir(account_dir, account_dir, 1, &mut result)?;
    Ok(result)
}

fn walk_local_dir(
    base: &Path,
    dir: &Path,
    depth: usize,
    out: &mut Vec<LocalFolder>,
) -> Result<(), std::io::Error> {
    let mut subdirs = Vec::new();
    let mut messages = Vec::new();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.extension().is_some_and(|ext| ext == "eml") {
            messages.push(path);
        }
    }

    if dir != base {
        let local_path = dir
            .strip_prefix(base)
            .map_err(|_| std::io::Error::other("local folder outside account dir"))?
            .to_string_lossy()
            .replace('\\', "/");
        out.push(LocalFolder {
            local_path,
            dir: dir.to_path_buf(),
            messages,
        });
    }

    if depth >= MAX_DEPTH {
        if !subdirs.is_empty() {
            warn!(dir = %dir.display(), depth, "maximum folder depth reached, not descending");
        }
        return Ok(());
    }
    for subdir in subdirs {
        walk_local_dir(base, &subdir, depth + 1, out)?;
    }
    Ok(())
}
