//! File tree model for a workspace.
//!
//! A `Workspace` is constructed once by the caller and never mutated; edits
//! produce a superseding tree with the same name.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Files and directories skipped when loading a workspace from disk.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "target"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Leaf name; the full path is derived from the enclosing directories.
    pub name: String,
    pub language: String,
    pub content: String,
    /// Tutorial mode pairs the initial content with a solution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

impl File {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let language = language_for_path(&name).to_string();
        Self {
            name,
            language,
            content: content.into(),
            solution: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = Some(solution.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub children: Vec<Node>,
}

impl Directory {
    pub fn new(name: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Directory(Directory),
    File(File),
}

impl From<File> for Node {
    fn from(file: File) -> Self {
        Node::File(file)
    }
}

impl From<Directory> for Node {
    fn from(dir: Directory) -> Self {
        Node::Directory(dir)
    }
}

/// A file paired with its full `/`-separated path inside the tree.
#[derive(Debug, Clone, Copy)]
pub struct FileEntry<'a> {
    pub path: &'a str,
    pub file: &'a File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    name: String,
    tree: Vec<Node>,
    initial_file: Option<String>,
    shells: Vec<String>,
    /// Flattened file paths, computed once at construction.
    paths: Vec<String>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, tree: Vec<Node>) -> Self {
        let mut paths = Vec::new();
        collect_paths(&tree, "", &mut paths);
        Self {
            name: name.into(),
            tree,
            initial_file: None,
            shells: Vec::new(),
            paths,
        }
    }

    /// Build a nested tree from flat `(path, language, content)` entries.
    /// Entry order is preserved within each directory. Entries whose path
    /// fails [`is_tree_path`] are skipped.
    pub fn from_entries<I>(name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        let mut tree = Vec::new();
        for (path, language, content) in entries {
            if !is_tree_path(&path) {
                tracing::debug!(path = %path, "skipping entry with unsafe path");
                continue;
            }
            let path = normalize_path(&path);
            let segments: Vec<&str> = path.split('/').collect();
            let Some((leaf, dirs)) = segments.split_last() else {
                continue;
            };
            let file = File::new(*leaf, content).with_language(language);
            insert_file(&mut tree, dirs, file);
        }
        Self::new(name, tree)
    }

    /// Load every file under `root` into a workspace. Binary files are
    /// skipped with a warning.
    pub fn load_dir(name: impl Into<String>, root: &Path) -> std::io::Result<Self> {
        let mut entries = Vec::new();
        walk_dir(root, root, &mut entries)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::from_entries(name, entries))
    }

    pub fn with_initial_file(mut self, path: impl Into<String>) -> Self {
        self.initial_file = Some(normalize_path(&path.into()));
        self
    }

    pub fn with_shells(mut self, shells: Vec<String>) -> Self {
        self.shells = shells;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &[Node] {
        &self.tree
    }

    pub fn initial_file(&self) -> Option<&str> {
        self.initial_file.as_deref()
    }

    /// Startup commands, one per shell slot.
    pub fn shells(&self) -> &[String] {
        &self.shells
    }

    /// All file paths in depth-first tree order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn files(&self) -> Vec<FileEntry<'_>> {
        self.paths
            .iter()
            .filter_map(|path| {
                self.file(path).map(|file| FileEntry {
                    path: path.as_str(),
                    file,
                })
            })
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<&File> {
        let path = normalize_path(path);
        let mut segments = path.split('/').peekable();
        let mut nodes = self.tree.as_slice();
        while let Some(segment) = segments.next() {
            let last = segments.peek().is_none();
            let found = nodes.iter().find(|node| match node {
                Node::File(f) => last && f.name == segment,
                Node::Directory(d) => !last && d.name == segment,
            })?;
            match found {
                Node::File(f) => return Some(f),
                Node::Directory(d) => nodes = d.children.as_slice(),
            }
        }
        None
    }

    pub fn contains(&self, path: &str) -> bool {
        self.file(path).is_some()
    }

    /// Declared dependencies from a root `package.json`: `dependencies`
    /// merged with `devDependencies`. Malformed manifests yield an empty map.
    pub fn dependencies(&self) -> BTreeMap<String, String> {
        let Some(manifest) = self.file("package.json") else {
            return BTreeMap::new();
        };
        let value: serde_json::Value = match serde_json::from_str(&manifest.content) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(workspace = %self.name, error = %e, "unparseable package.json");
                return BTreeMap::new();
            }
        };
        let mut deps = BTreeMap::new();
        for section in ["dependencies", "devDependencies"] {
            if let Some(map) = value.get(section).and_then(|v| v.as_object()) {
                for (name, version) in map {
                    let version = version.as_str().unwrap_or("*").to_string();
                    deps.entry(name.clone()).or_insert(version);
                }
            }
        }
        deps
    }

    /// Hash over paths and languages only. Content is deliberately excluded:
    /// this is a shape fingerprint, not a version.
    pub fn structure_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name.hash(&mut hasher);
        for entry in self.files() {
            entry.path.hash(&mut hasher);
            entry.file.language.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Superseding workspace where every file that carries a solution shows
    /// it as its content. Files without one are unchanged.
    pub fn solved(&self) -> Workspace {
        let mut next = self.clone();
        apply_solutions(&mut next.tree);
        next
    }

    /// Returns a superseding workspace with `path` replaced by `content`.
    /// Unknown paths leave the tree unchanged.
    pub fn with_file_content(&self, path: &str, content: impl Into<String>) -> Workspace {
        let mut next = self.clone();
        let path = normalize_path(path);
        let segments: Vec<&str> = path.split('/').collect();
        if let Some(file) = file_mut(&mut next.tree, &segments) {
            file.content = content.into();
        }
        next
    }
}

/// Strip leading `/` and `./` so that `"/src/a.ts"`, `"./src/a.ts"` and
/// `"src/a.ts"` name the same file.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    p.to_string()
}

/// True if `path`, once normalized, is a plain relative path: no empty,
/// `.` or `..` segment and no backslash or drive prefix.
pub fn is_tree_path(path: &str) -> bool {
    let path = normalize_path(path);
    !path.is_empty()
        && !path.contains(['\\', ':', '\0'])
        && path.split('/').all(|seg| !matches!(seg, "" | "." | ".."))
}

/// Language tag for the editor, derived from the file extension.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "json" => "json",
        "css" => "css",
        "html" | "htm" => "html",
        "md" => "markdown",
        "rs" => "rust",
        "py" => "python",
        "sh" => "shell",
        _ => "plaintext",
    }
}

fn collect_paths(nodes: &[Node], prefix: &str, out: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::File(f) => out.push(join(prefix, &f.name)),
            Node::Directory(d) => collect_paths(&d.children, &join(prefix, &d.name), out),
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn insert_file(nodes: &mut Vec<Node>, dirs: &[&str], file: File) {
    let Some((first, rest)) = dirs.split_first() else {
        match nodes
            .iter_mut()
            .find(|n| matches!(n, Node::File(f) if f.name == file.name))
        {
            Some(existing) => *existing = Node::File(file),
            None => nodes.push(Node::File(file)),
        }
        return;
    };
    let idx = match nodes
        .iter()
        .position(|n| matches!(n, Node::Directory(d) if d.name == *first))
    {
        Some(idx) => idx,
        None => {
            nodes.push(Node::Directory(Directory::new(*first, Vec::new())));
            nodes.len() - 1
        }
    };
    if let Node::Directory(d) = &mut nodes[idx] {
        insert_file(&mut d.children, rest, file);
    }
}

fn apply_solutions(nodes: &mut [Node]) {
    for node in nodes {
        match node {
            Node::File(f) => {
                if let Some(solution) = &f.solution {
                    f.content = solution.clone();
                }
            }
            Node::Directory(d) => apply_solutions(&mut d.children),
        }
    }
}

fn file_mut<'a>(nodes: &'a mut [Node], segments: &[&str]) -> Option<&'a mut File> {
    let (first, rest) = segments.split_first()?;
    for node in nodes.iter_mut() {
        match node {
            Node::File(f) if rest.is_empty() && f.name == *first => return Some(f),
            Node::Directory(d) if !rest.is_empty() && d.name == *first => {
                return file_mut(&mut d.children, rest);
            }
            _ => {}
        }
    }
    None
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String, String)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_dir() {
            if IGNORED_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk_dir(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let language = language_for_path(&rel).to_string();
                out.push((rel, language, content));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
            }
        }
    }
    Ok(())
}
