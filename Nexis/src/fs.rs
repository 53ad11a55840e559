// Nexis/src/fs.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use spin::Mutex;

pub const MAX_FILENAME_LENGTH: usize = 255;
/// First descriptor handed out; 0-2 are the standard streams.
pub const FIRST_FD: Fd = 3;

pub type Fd = u32;

const INVALID_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

const SAMPLE_DIRS: [&str; 8] = [
    "/home",
    "/home/user",
    "/home/user/documents",
    "/home/user/pictures",
    "/bin",
    "/etc",
    "/var",
    "/tmp",
];
const SAMPLE_FILES: [(&str, &str); 6] = [
    ("/home/user/readme.txt", "Welcome to Nexis!\nThis is a sample text file.\n"),
    (
        "/home/user/documents/note.txt",
        "Important notes:\n- Remember to save your work\n- Use ls to navigate\n",
    ),
    ("/etc/config.conf", "# Nexis configuration\nversion=1.0\ndebug=false\n"),
    ("/bin/calculator", "Calculator executable"),
    ("/bin/editor", "Text editor executable"),
    ("/bin/filemanager", "File manager executable"),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
}

bitflags::bitflags! {
    pub struct Permissions: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

#[derive(Clone, Debug)]
pub struct FileAttributes {
    pub kind: FileType,
    pub size: usize,
    pub created: DateTime<Local>,
    pub modified: DateTime<Local>,
    pub accessed: DateTime<Local>,
    pub permissions: Permissions,
    pub owner: u32,
}

impl FileAttributes {
    fn new(kind: FileType) -> Self {
        let now = Local::now();
        Self {
            kind,
            size: 0,
            created: now,
            modified: now,
            accessed: now,
            permissions: Permissions::READ | Permissions::WRITE,
            owner: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub attributes: FileAttributes,
}

struct Node {
    attributes: FileAttributes,
    content: Vec<u8>,
    children: Vec<String>,
}

impl Node {
    fn new(kind: FileType) -> Self {
        Self {
            attributes: FileAttributes::new(kind),
            content: Vec::new(),
            children: Vec::new(),
        }
    }

    fn is_dir(&self) -> bool {
        self.attributes.kind == FileType::Directory
    }
}

struct OpenFile {
    path: String,
    position: usize,
}

/// Resolve `.`/`..`, collapse repeated slashes, and anchor relative paths at `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

fn is_valid_filename(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_FILENAME_LENGTH && !name.contains(INVALID_CHARS)
}

struct FsState {
    nodes: BTreeMap<String, Node>,
    open: BTreeMap<Fd, OpenFile>,
    next_fd: Fd,
}

impl FsState {
    fn add_node(&mut self, path: &str, kind: FileType) -> bool {
        if path == "/" || self.nodes.contains_key(path) {
            warn!(target: "fs", "already exists: {}", path);
            return false;
        }
        let parent = parent_of(path).to_string();
        let name = file_name(path).to_string();
        if !is_valid_filename(&name) {
            warn!(target: "fs", "invalid file name: {:?}", name);
            return false;
        }
        match self.nodes.get_mut(&parent) {
            Some(dir) if dir.is_dir() => dir.children.push(name),
            _ => {
                warn!(target: "fs", "parent directory does not exist: {}", parent);
                return false;
            }
        }
        self.nodes.insert(path.to_string(), Node::new(kind));
        debug!(target: "fs", "created {:?} {}", kind, path);
        true
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        let name = file_name(path);
        if let Some(dir) = self.nodes.get_mut(parent_of(path)) {
            dir.children.retain(|c| c != name);
        }
    }

    fn write(&mut self, path: &str, content: &[u8]) -> bool {
        if !self.nodes.contains_key(path) && !self.add_node(path, FileType::Regular) {
            return false;
        }
        match self.nodes.get_mut(path) {
            Some(node) if !node.is_dir() => {
                node.content = content.to_vec();
                node.attributes.size = content.len();
                node.attributes.modified = Local::now();
                true
            }
            _ => {
                warn!(target: "fs", "cannot write to directory: {}", path);
                false
            }
        }
    }
}

/// In-memory path/attribute map standing in for a real filesystem.
pub struct FileSystem {
    state: Mutex<FsState>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    /// An empty tree holding only `/`.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(FileType::Directory));
        Self {
            state: Mutex::new(FsState {
                nodes,
                open: BTreeMap::new(),
                next_fd: FIRST_FD,
            }),
        }
    }

    /// A tree pre-populated with the sample directories and files.
    pub fn initialize() -> Self {
        let fs = Self::new();
        {
            let mut state = fs.state.lock();
            for dir in SAMPLE_DIRS.iter() {
                state.add_node(dir, FileType::Directory);
            }
            for (path, content) in SAMPLE_FILES.iter() {
                state.write(path, content.as_bytes());
            }
        }
        info!(target: "fs", "file system initialized with {} entries", fs.entry_count());
        fs
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(&normalize_path(path))
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(&normalize_path(path))
            .map_or(false, Node::is_dir)
    }

    pub fn create_file(&self, path: &str) -> bool {
        self.state.lock().add_node(&normalize_path(path), FileType::Regular)
    }

    pub fn create_directory(&self, path: &str) -> bool {
        self.state.lock().add_node(&normalize_path(path), FileType::Directory)
    }

    pub fn delete_file(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(node) if !node.is_dir() => {
                state.remove_node(&path);
                debug!(target: "fs", "deleted file {}", path);
                true
            }
            Some(_) => {
                warn!(target: "fs", "cannot delete directory with delete_file: {}", path);
                false
            }
            None => {
                warn!(target: "fs", "file does not exist: {}", path);
                false
            }
        }
    }

    /// Remove an empty directory. `/` can never be removed.
    pub fn delete_directory(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(node) if node.is_dir() && node.children.is_empty() && path != "/" => {
                state.remove_node(&path);
                true
            }
            _ => {
                warn!(target: "fs", "cannot delete directory {}", path);
                false
            }
        }
    }

    pub fn list_directory(&self, path: &str) -> Option<Vec<DirEntry>> {
        let path = normalize_path(path);
        let state = self.state.lock();
        let dir = state.nodes.get(&path).filter(|n| n.is_dir())?;
        let entries = dir
            .children
            .iter()
            .filter_map(|name| {
                let full = if path == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", path, name)
                };
                let attributes = state.nodes.get(&full)?.attributes.clone();
                Some(DirEntry {
                    name: name.clone(),
                    path: full,
                    attributes,
                })
            })
            .collect();
        Some(entries)
    }

    pub fn read_file(&self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        let mut state = self.state.lock();
        match state.nodes.get_mut(&path) {
            Some(node) if !node.is_dir() => {
                node.attributes.accessed = Local::now();
                Some(String::from_utf8_lossy(&node.content).into_owned())
            }
            _ => {
                warn!(target: "fs", "cannot read {}", path);
                None
            }
        }
    }

    /// Replace the contents of `path`, creating the file if needed.
    pub fn write_file(&self, path: &str, content: &str) -> bool {
        self.state.lock().write(&normalize_path(path), content.as_bytes())
    }

    pub fn attributes(&self, path: &str) -> Option<FileAttributes> {
        let state = self.state.lock();
        state.nodes.get(&normalize_path(path)).map(|n| n.attributes.clone())
    }

    /// Open a regular file, creating it first when `create` is set.
    pub fn open(&self, path: &str, create: bool) -> Option<Fd> {
        let path = normalize_path(path);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&path) && !(create && state.add_node(&path, FileType::Regular)) {
            return None;
        }
        if state.nodes.get(&path).map_or(true, Node::is_dir) {
            return None;
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open.insert(fd, OpenFile { path, position: 0 });
        Some(fd)
    }

    pub fn close(&self, fd: Fd) -> bool {
        self.state.lock().open.remove(&fd).is_some()
    }

    /// Read up to `count` bytes from the descriptor's position and advance it.
    pub fn read_fd(&self, fd: Fd, count: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let FsState { nodes, open, .. } = &mut *state;
        let handle = open.get_mut(&fd)?;
        let node = nodes.get_mut(&handle.path)?;
        let start = handle.position.min(node.content.len());
        let end = start.saturating_add(count).min(node.content.len());
        handle.position = end;
        node.attributes.accessed = Local::now();
        Some(node.content[start..end].to_vec())
    }

    /// Write `bytes` at the descriptor's position, growing the file as needed.
    pub fn write_fd(&self, fd: Fd, bytes: &[u8]) -> Option<usize> {
        let mut state = self.state.lock();
        let FsState { nodes, open, .. } = &mut *state;
        let handle = open.get_mut(&fd)?;
        let node = nodes.get_mut(&handle.path)?;
        let start = handle.position.min(node.content.len());
        let end = start + bytes.len();
        if node.content.len() < end {
            node.content.resize(end, 0);
        }
        node.content[start..end].copy_from_slice(bytes);
        handle.position = end;
        node.attributes.size = node.content.len();
        node.attributes.modified = Local::now();
        Some(bytes.len())
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Close every open descriptor.
    pub fn shutdown(&self) {
        self.state.lock().open.clear();
        info!(target: "fs", "file system shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("//home///user/"), "/home/user");
        assert_eq!(normalize_path("/home/./user/../user/docs"), "/home/user/docs");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("tmp/x"), "/tmp/x");
    }

    #[test]
    fn sample_tree_is_present() {
        let fs = FileSystem::initialize();
        assert!(fs.is_directory("/home/user/documents"));
        assert_eq!(fs.read_file("/etc/config.conf").unwrap().lines().nth(1), Some("version=1.0"));
        let names: Vec<_> = fs.list_directory("/bin").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["calculator", "editor", "filemanager"]);
    }

    #[test]
    fn create_requires_existing_parent() {
        let fs = FileSystem::new();
        assert!(!fs.create_file("/missing/file.txt"));
        assert!(fs.create_directory("/missing"));
        assert!(fs.create_file("/missing/file.txt"));
        assert!(!fs.create_file("/missing/file.txt"));
        assert!(!fs.create_file("/missing/bad:name"));
    }

    #[test]
    fn write_creates_and_updates_size() {
        let fs = FileSystem::new();
        assert!(fs.write_file("/hello.txt", "hi there"));
        assert_eq!(fs.attributes("/hello.txt").unwrap().size, 8);
        assert_eq!(fs.read_file("hello.txt").as_deref(), Some("hi there"));
        assert!(!fs.write_file("/", "nope"));
    }

    #[test]
    fn delete_rules() {
        let fs = FileSystem::initialize();
        assert!(!fs.delete_file("/home"));
        assert!(!fs.delete_directory("/home/user"));
        assert!(!fs.delete_directory("/"));
        assert!(fs.delete_directory("/tmp"));
        assert!(fs.delete_file("/bin/editor"));
        assert!(!fs.exists("/bin/editor"));
        assert_eq!(fs.list_directory("/bin").unwrap().len(), 2);
    }

    #[test]
    fn descriptors_track_position() {
        let fs = FileSystem::new();
        let fd = fs.open("/log.txt", true).unwrap();
        assert_eq!(fd, FIRST_FD);
        assert_eq!(fs.write_fd(fd, b"abc"), Some(3));
        assert_eq!(fs.write_fd(fd, b"def"), Some(3));
        assert_eq!(fs.read_file("/log.txt").as_deref(), Some("abcdef"));

        let rd = fs.open("/log.txt", false).unwrap();
        assert_eq!(fs.read_fd(rd, 4).unwrap(), b"abcd");
        assert_eq!(fs.read_fd(rd, 4).unwrap(), b"ef");
        assert!(fs.read_fd(rd, 4).unwrap().is_empty());
        assert!(fs.close(rd));
        assert!(!fs.close(rd));
        assert_eq!(fs.read_fd(rd, 1), None);
        assert_eq!(fs.open("/nothing", false), None);
        assert_eq!(fs.open("/", true), None);
    }
}
