use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::ast::Ast;
use crate::backend::BackendFileId;
use crate::error::{ErrorReport, ParseError};

/// Stable identity of one script file. Assigned when the scanner first
/// sees the file and kept across every reload until the file disappears
/// from disk. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Why a file currently has no fresh compiled version. The previous good
/// version, if any, keeps serving calls while this is set.
#[derive(Debug, Clone)]
pub struct FileError {
    pub message: String,
    pub line: Option<u32>,
}

impl From<ParseError> for FileError {
    fn from(err: ParseError) -> Self {
        let line = err.line;
        FileError { message: err.to_string(), line: Some(line) }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One script in the mod tree.
#[derive(Debug)]
pub struct ModFile {
    pub(crate) name: String,
    pub(crate) rel_path: String,
    pub(crate) entity_name: String,
    pub(crate) entity_type: String,
    pub(crate) id: FileId,
    pub(crate) mtime: Option<SystemTime>,
    /// Resources the script references, with the mtime each had when the
    /// script last loaded. Drift in any of them re-loads the script.
    pub(crate) resources: Vec<(String, Option<SystemTime>)>,
    pub(crate) error: Option<FileError>,
    pub(crate) ast: Option<Ast>,
    pub(crate) unit: Option<BackendFileId>,
    pub(crate) member_count: usize,
    marked: bool,
}

impl ModFile {
    fn new(listing: &FileListing, id: FileId) -> Self {
        ModFile {
            name: listing.name.clone(),
            rel_path: listing.rel_path.clone(),
            entity_name: listing.entity_name.clone(),
            entity_type: listing.entity_type.clone(),
            id,
            mtime: None,
            resources: Vec::new(),
            error: None,
            ast: None,
            unit: None,
            member_count: 0,
            marked: true,
        }
    }

    /// File name, e.g. `labrador-Dog.grug`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the mods folder, with forward slashes.
    pub fn path(&self) -> &str {
        &self.rel_path
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn error(&self) -> Option<&FileError> {
        self.error.as_ref()
    }

    /// The most recent tree that parsed and resolved successfully.
    pub fn ast(&self) -> Option<&Ast> {
        self.ast.as_ref()
    }

    /// True when some compiled version is live, even if the latest edit
    /// failed to load.
    pub fn is_loaded(&self) -> bool {
        self.unit.is_some()
    }
}

/// One directory in the mod tree. Nodes persist across update cycles;
/// only additions and removals on disk change the set.
#[derive(Debug, Default)]
pub struct ModDir {
    pub(crate) name: String,
    pub(crate) dirs: Vec<ModDir>,
    pub(crate) files: Vec<ModFile>,
    marked: bool,
}

impl ModDir {
    pub(crate) fn root(name: impl Into<String>) -> Self {
        ModDir { name: name.into(), dirs: Vec::new(), files: Vec::new(), marked: true }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dirs(&self) -> &[ModDir] {
        &self.dirs
    }

    pub fn files(&self) -> &[ModFile] {
        &self.files
    }

    pub(crate) fn file(&self, rel_path: &str) -> Option<&ModFile> {
        let (dir, name) = self.descend(rel_path)?;
        dir.files.iter().find(|f| f.name == name)
    }

    pub(crate) fn file_mut(&mut self, rel_path: &str) -> Option<&mut ModFile> {
        let mut dir = self;
        let mut segments = rel_path.split('/').peekable();
        loop {
            let segment = segments.next()?;
            if segments.peek().is_none() {
                return dir.files.iter_mut().find(|f| f.name == segment);
            }
            dir = dir.dirs.iter_mut().find(|d| d.name == segment)?;
        }
    }

    fn descend<'a>(&self, rel_path: &'a str) -> Option<(&ModDir, &'a str)> {
        let mut dir = self;
        let mut segments = rel_path.split('/').peekable();
        loop {
            let segment = segments.next()?;
            if segments.peek().is_none() {
                return Some((dir, segment));
            }
            dir = dir.dirs.iter().find(|d| d.name == segment)?;
        }
    }

    pub(crate) fn for_each_file(&self, f: &mut impl FnMut(&ModFile)) {
        for file in &self.files {
            f(file);
        }
        for dir in &self.dirs {
            dir.for_each_file(f);
        }
    }
}

/// A point-in-time picture of the mods folder: names, scripts and mtimes,
/// nothing else. Reading it is the only part of the scan that touches the
/// filesystem; the diff against the live tree is a pure function.
#[derive(Debug, Default)]
pub(crate) struct DirListing {
    pub name: String,
    pub dirs: Vec<DirListing>,
    pub files: Vec<FileListing>,
}

#[derive(Debug)]
pub(crate) struct FileListing {
    pub name: String,
    pub rel_path: String,
    pub entity_name: String,
    pub entity_type: String,
    pub mtime: Option<SystemTime>,
}

/// Splits `labrador-Dog.grug` into `(labrador, Dog)`. Files that do not
/// fit the `<entity_name>-<EntityType>.grug` shape are not scripts.
pub(crate) fn split_script_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(".grug")?;
    let (entity_name, entity_type) = stem.rsplit_once('-')?;
    if entity_name.is_empty() || entity_type.is_empty() {
        return None;
    }
    Some((entity_name, entity_type))
}

/// Reads the folder recursively, name-sorted for a deterministic walk.
/// An unreadable directory is reported and listed as empty, which sweeps
/// its files out of the tree until it becomes readable again.
pub(crate) fn read_listing(
    root: &Path,
    report: &mut impl FnMut(ErrorReport),
) -> DirListing {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mods".into());
    read_dir_listing(root, name, "", report)
}

fn read_dir_listing(
    path: &Path,
    name: String,
    rel: &str,
    report: &mut impl FnMut(ErrorReport),
) -> DirListing {
    let mut listing = DirListing { name, dirs: Vec::new(), files: Vec::new() };
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            // A mods root that does not exist yet is an empty tree, not
            // an error condition.
            if !rel.is_empty() || err.kind() != std::io::ErrorKind::NotFound {
                report(ErrorReport::Io { path: path.to_path_buf(), error: err.to_string() });
            }
            return listing;
        }
    };
    let mut names: Vec<(String, bool)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let is_dir = entry.file_type().ok()?.is_dir();
            Some((entry.file_name().to_string_lossy().into_owned(), is_dir))
        })
        .filter(|(name, _)| !name.starts_with('.'))
        .collect();
    names.sort();
    for (entry_name, is_dir) in names {
        let entry_rel = if rel.is_empty() {
            entry_name.clone()
        } else {
            format!("{rel}/{entry_name}")
        };
        if is_dir {
            let sub = read_dir_listing(&path.join(&entry_name), entry_name, &entry_rel, report);
            listing.dirs.push(sub);
        } else if let Some((entity_name, entity_type)) = split_script_name(&entry_name) {
            let mtime = fs::metadata(path.join(&entry_name)).and_then(|m| m.modified()).ok();
            listing.files.push(FileListing {
                entity_name: entity_name.to_string(),
                entity_type: entity_type.to_string(),
                name: entry_name,
                rel_path: entry_rel,
                mtime,
            });
        }
    }
    listing
}

/// What one scan found, as mods-relative paths in walk order.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TreeDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Added and changed paths interleaved as the walk met them; the
    /// loader processes files in exactly this order.
    pub pending: Vec<String>,
}

/// Compares the live tree against a fresh listing. Pure: the only inputs
/// are the two structures and the current mtimes of tracked resources.
pub(crate) fn diff(
    tree: &ModDir,
    disk: &DirListing,
    resource_mtimes: &HashMap<String, Option<SystemTime>>,
) -> TreeDiff {
    let mut out = TreeDiff::default();
    diff_dir(Some(tree), disk, resource_mtimes, &mut out);
    out
}

fn diff_dir(
    tree: Option<&ModDir>,
    disk: &DirListing,
    resource_mtimes: &HashMap<String, Option<SystemTime>>,
    out: &mut TreeDiff,
) {
    for file in &disk.files {
        match tree.and_then(|t| t.files.iter().find(|f| f.name == file.name)) {
            None => {
                out.added.push(file.rel_path.clone());
                out.pending.push(file.rel_path.clone());
            }
            Some(existing) => {
                let resource_drift = existing.resources.iter().any(|(path, recorded)| {
                    let current = resource_mtimes.get(path).copied().flatten();
                    current != *recorded
                });
                if existing.mtime != file.mtime || resource_drift {
                    out.changed.push(file.rel_path.clone());
                    out.pending.push(file.rel_path.clone());
                } else {
                    out.unchanged.push(file.rel_path.clone());
                }
            }
        }
    }
    for sub in &disk.dirs {
        let tree_sub = tree.and_then(|t| t.dirs.iter().find(|d| d.name == sub.name));
        diff_dir(tree_sub, sub, resource_mtimes, out);
    }
    if let Some(tree) = tree {
        for file in &tree.files {
            if !disk.files.iter().any(|f| f.name == file.name) {
                out.removed.push(file.rel_path.clone());
            }
        }
        for dir in &tree.dirs {
            if !disk.dirs.iter().any(|d| d.name == dir.name) {
                dir.for_each_file(&mut |f| out.removed.push(f.rel_path.clone()));
            }
        }
    }
}

/// A file swept out of the tree, with what the state must clean up.
#[derive(Debug)]
pub(crate) struct RemovedFile {
    pub id: FileId,
    pub rel_path: String,
    pub unit: Option<BackendFileId>,
}

/// Mark-and-sweep reconciliation: every node found on disk is marked
/// (created first if new, taking the next file id), then unmarked nodes
/// are swept. Surviving nodes keep their identity, ids and loaded state.
pub(crate) fn reconcile(
    tree: &mut ModDir,
    disk: &DirListing,
    next_file_id: &mut u64,
) -> Vec<RemovedFile> {
    clear_marks(tree);
    mark_from_disk(tree, disk, next_file_id);
    let mut removed = Vec::new();
    sweep(tree, &mut removed);
    removed
}

fn clear_marks(dir: &mut ModDir) {
    dir.marked = false;
    for file in &mut dir.files {
        file.marked = false;
    }
    for sub in &mut dir.dirs {
        clear_marks(sub);
    }
}

fn mark_from_disk(dir: &mut ModDir, disk: &DirListing, next_file_id: &mut u64) {
    dir.marked = true;
    for listing in &disk.files {
        match dir.files.iter_mut().find(|f| f.name == listing.name) {
            Some(file) => file.marked = true,
            None => {
                let id = FileId(*next_file_id);
                *next_file_id += 1;
                dir.files.push(ModFile::new(listing, id));
            }
        }
    }
    for sub_listing in &disk.dirs {
        let position = dir.dirs.iter().position(|d| d.name == sub_listing.name);
        let sub = match position {
            Some(i) => &mut dir.dirs[i],
            None => {
                dir.dirs.push(ModDir::root(sub_listing.name.clone()));
                let last = dir.dirs.len() - 1;
                &mut dir.dirs[last]
            }
        };
        mark_from_disk(sub, sub_listing, next_file_id);
    }
}

fn sweep(dir: &mut ModDir, removed: &mut Vec<RemovedFile>) {
    for file in std::mem::take(&mut dir.files) {
        if file.marked {
            dir.files.push(file);
        } else {
            removed.push(RemovedFile { id: file.id, rel_path: file.rel_path, unit: file.unit });
        }
    }
    for mut sub in std::mem::take(&mut dir.dirs) {
        if sub.marked {
            sweep(&mut sub, removed);
            dir.dirs.push(sub);
        } else {
            drain_all(sub, removed);
        }
    }
}

fn drain_all(dir: ModDir, removed: &mut Vec<RemovedFile>) {
    for file in dir.files {
        removed.push(RemovedFile { id: file.id, rel_path: file.rel_path, unit: file.unit });
    }
    for sub in dir.dirs {
        drain_all(sub, removed);
    }
}

/// Every resource path any loaded script references.
pub(crate) fn tracked_resources(tree: &ModDir) -> Vec<String> {
    let mut out = Vec::new();
    tree.for_each_file(&mut |file| {
        for (path, _) in &file.resources {
            if !out.contains(path) {
                out.push(path.clone());
            }
        }
    });
    out
}
