//! Filesystem capability layer.
//!
//! Every disk access in the provisioner goes through [`Vfs`] so archive
//! extraction, config merging, and cache bookkeeping can run against an
//! in-memory tree in tests. [`OsFs`] is the production implementation.
//! [`MemFs`] backs unit tests and reports symlinks as unsupported, which
//! also exercises the skip path of the version-link step.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Readable, seekable handle returned by [`Vfs::open`].
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Kind of a directory entry or statted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// Subset of file metadata the provisioner acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Permission bits, no file-type bits.
    pub mode: u32,
    pub len: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// Single entry returned by [`Vfs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Filesystem operations the provisioner needs.
///
/// Mirrors the POSIX calls used in production closely enough that [`OsFs`]
/// is a thin shim. Implementations must be safe to share across tasks.
pub trait Vfs: Send + Sync {
    /// Open an existing file for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Create or truncate a file with the given permission bits.
    ///
    /// The mode must stick even under a restrictive umask; extracted agent
    /// config files rely on exact permissions.
    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>>;

    /// Create a directory and any missing ancestors.
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Remove a file, symlink, or empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a path and all its children. Missing paths are not an error.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Stat following symlinks.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Stat without following symlinks.
    fn lstat(&self, path: &Path) -> io::Result<FileStat>;

    /// Atomically move `from` onto `to`.
    ///
    /// When `to` is a non-empty directory this fails with `AlreadyExists`
    /// or `DirectoryNotEmpty` depending on the platform; callers treat both
    /// as losing a benign race.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// List the immediate children of a directory, sorted by name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Change permission bits on an existing path.
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create a symlink at `link` pointing at `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Read the target of a symlink.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create a hard link at `link` referring to `original`.
    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Whether this filesystem can represent symlinks at all.
    fn symlinks_supported(&self) -> bool {
        true
    }

    /// Convenience stat-success check, following symlinks.
    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }
}

fn kind_of(meta: &fs::Metadata) -> FileKind {
    if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Dir
    } else {
        FileKind::File
    }
}

fn stat_of(meta: &fs::Metadata) -> FileStat {
    use std::os::unix::fs::PermissionsExt;

    FileStat {
        kind: kind_of(meta),
        mode: meta.permissions().mode() & 0o7777,
        len: meta.len(),
    }
}

/// Production filesystem backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl OsFs {
    pub fn new() -> Self {
        OsFs
    }
}

impl Vfs for OsFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        // The open mode is masked by the process umask; reassert the exact
        // bits so 0666 config files really are world-writable.
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        Ok(Box::new(file))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;

        fs::DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if meta.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        Ok(stat_of(&fs::metadata(path)?))
    }

    fn lstat(&self, path: &Path) -> io::Result<FileStat> {
        Ok(stat_of(&fs::symlink_metadata(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(original, link)
    }
}

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
}

impl Node {
    fn kind(&self) -> FileKind {
        match self {
            Node::File { .. } => FileKind::File,
            Node::Dir { .. } => FileKind::Dir,
        }
    }

    fn stat(&self) -> FileStat {
        match self {
            Node::File { data, mode } => FileStat {
                kind: FileKind::File,
                mode: *mode,
                len: data.len() as u64,
            },
            Node::Dir { mode } => FileStat {
                kind: FileKind::Dir,
                mode: *mode,
                len: 0,
            },
        }
    }
}

/// In-memory filesystem for tests.
///
/// Paths are normalized to absolute form, so relative inputs resolve
/// against the root. Symlinks and hard links are not representable; the
/// symlink operations report `Unsupported` and hard links copy the bytes.
#[derive(Clone, Default)]
pub struct MemFs {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl MemFs {
    pub fn new() -> Self {
        let fs = MemFs {
            nodes: Arc::new(Mutex::new(BTreeMap::new())),
        };
        fs.lock().insert(PathBuf::from("/"), Node::Dir { mode: 0o755 });
        fs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn normalize(path: &Path) -> PathBuf {
        let mut out = PathBuf::from("/");
        for component in path.components() {
            match component {
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                Component::Normal(part) => out.push(part),
            }
        }
        out
    }

    fn children_of(nodes: &BTreeMap<PathBuf, Node>, dir: &Path) -> Vec<PathBuf> {
        nodes
            .keys()
            .filter(|key| key.parent() == Some(dir))
            .cloned()
            .collect()
    }

    /// Snapshot of a file's bytes, for assertions.
    pub fn read_to_vec(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = Self::normalize(path);
        match self.lock().get(&path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }
}

struct MemWriter {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
    path: PathBuf,
    mode: u32,
    buf: Vec<u8>,
}

impl MemWriter {
    fn commit(&mut self) {
        let mut nodes = match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        nodes.insert(
            self.path.clone(),
            Node::File {
                data: self.buf.clone(),
                mode: self.mode,
            },
        );
    }
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        self.commit();
    }
}

impl Vfs for MemFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        let data = self.read_to_vec(path)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        let path = Self::normalize(path);
        let mut nodes = self.lock();
        if let Some(Node::Dir { .. }) = nodes.get(&path) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            match nodes.get(parent) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("{} is not a directory", parent.display()),
                    ));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} not found", parent.display()),
                    ));
                }
            }
        }
        nodes.insert(path.clone(), Node::File { data: Vec::new(), mode });
        Ok(Box::new(MemWriter {
            nodes: Arc::clone(&self.nodes),
            path,
            mode,
            buf: Vec::new(),
        }))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.lock();
        let mut current = PathBuf::from("/");
        nodes.entry(current.clone()).or_insert(Node::Dir { mode: 0o755 });
        for component in path.components() {
            if let Component::Normal(part) = component {
                current.push(part);
                match nodes.get(&current) {
                    Some(Node::Dir { .. }) => {}
                    Some(Node::File { .. }) => {
                        return Err(io::Error::new(
                            io::ErrorKind::NotADirectory,
                            format!("{} is not a directory", current.display()),
                        ));
                    }
                    None => {
                        nodes.insert(current.clone(), Node::Dir { mode });
                    }
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                if !Self::children_of(&nodes, &path).is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("{} is not empty", path.display()),
                    ));
                }
            }
            Some(Node::File { .. }) => {}
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ));
            }
        }
        nodes.remove(&path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.lock();
        let doomed: Vec<PathBuf> = nodes
            .keys()
            .filter(|key| *key == &path || key.starts_with(&path))
            .cloned()
            .collect();
        for key in doomed {
            nodes.remove(&key);
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let path = Self::normalize(path);
        self.lock()
            .get(&path)
            .map(Node::stat)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
            })
    }

    fn lstat(&self, path: &Path) -> io::Result<FileStat> {
        self.stat(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        let mut nodes = self.lock();
        if !nodes.contains_key(&from) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", from.display()),
            ));
        }
        match nodes.get(&to) {
            Some(Node::Dir { .. }) if !Self::children_of(&nodes, &to).is_empty() => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ));
            }
            Some(_) => {
                nodes.remove(&to);
            }
            None => {}
        }
        let moved: Vec<(PathBuf, Node)> = nodes
            .iter()
            .filter(|(key, _)| *key == &from || key.starts_with(&from))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect();
        for (key, node) in moved {
            nodes.remove(&key);
            let suffix = key.strip_prefix(&from).unwrap_or(Path::new(""));
            nodes.insert(to.join(suffix), node);
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let path = Self::normalize(path);
        let nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("{} is not a directory", path.display()),
                ));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ));
            }
        }
        let entries = Self::children_of(&nodes, &path)
            .into_iter()
            .filter_map(|child| {
                let kind = nodes.get(&child)?.kind();
                let name = child.file_name()?.to_string_lossy().into_owned();
                Some(DirEntry { name, kind })
            })
            .collect();
        Ok(entries)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.lock();
        match nodes.get_mut(&path) {
            Some(Node::File { mode: slot, .. }) | Some(Node::Dir { mode: slot }) => {
                *slot = mode;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }

    fn symlink(&self, _target: &Path, link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("symlinks not supported: {}", link.display()),
        ))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("symlinks not supported: {}", path.display()),
        ))
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        let data = self.read_to_vec(original)?;
        let mode = self.stat(original)?.mode;
        let mut writer = self.create(link, mode)?;
        writer.write_all(&data)?;
        writer.flush()
    }

    fn symlinks_supported(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_create_and_read_back() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/data/agent"), 0o755).unwrap();
        let mut writer = fs.create(Path::new("/data/agent/file.txt"), 0o644).unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);

        assert_eq!(fs.read_to_vec(Path::new("/data/agent/file.txt")).unwrap(), b"hello");
        let stat = fs.stat(Path::new("/data/agent/file.txt")).unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.len, 5);
    }

    #[test]
    fn test_memfs_create_requires_parent() {
        let fs = MemFs::new();
        let err = fs.create(Path::new("/missing/file.txt"), 0o644).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memfs_rename_moves_subtree() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/tmp/scratch/agent/conf"), 0o755).unwrap();
        fs.create(Path::new("/tmp/scratch/agent/conf/a.conf"), 0o666)
            .unwrap()
            .flush()
            .unwrap();
        fs.mkdir_all(Path::new("/codemodules"), 0o755).unwrap();

        fs.rename(Path::new("/tmp/scratch"), Path::new("/codemodules/1.2.3")).unwrap();

        assert!(fs.exists(Path::new("/codemodules/1.2.3/agent/conf/a.conf")));
        assert!(!fs.exists(Path::new("/tmp/scratch")));
    }

    #[test]
    fn test_memfs_rename_into_populated_dir_fails() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/src"), 0o755).unwrap();
        fs.mkdir_all(Path::new("/dst"), 0o755).unwrap();
        fs.create(Path::new("/dst/present"), 0o644).unwrap().flush().unwrap();

        let err = fs.rename(Path::new("/src"), Path::new("/dst")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_memfs_remove_refuses_populated_dir() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/dir"), 0o755).unwrap();
        fs.create(Path::new("/dir/file"), 0o644).unwrap().flush().unwrap();

        let err = fs.remove(Path::new("/dir")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);

        fs.remove(Path::new("/dir/file")).unwrap();
        fs.remove(Path::new("/dir")).unwrap();
        assert!(!fs.exists(Path::new("/dir")));
    }

    #[test]
    fn test_memfs_remove_all_missing_is_ok() {
        let fs = MemFs::new();
        fs.remove_all(Path::new("/never/created")).unwrap();
    }

    #[test]
    fn test_memfs_read_dir_sorted_with_kinds() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/root/b-dir"), 0o755).unwrap();
        fs.create(Path::new("/root/a-file"), 0o644).unwrap().flush().unwrap();

        let entries = fs.read_dir(Path::new("/root")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a-file");
        assert_eq!(entries[0].kind, FileKind::File);
        assert_eq!(entries[1].name, "b-dir");
        assert_eq!(entries[1].kind, FileKind::Dir);
    }

    #[test]
    fn test_memfs_symlinks_unsupported() {
        let fs = MemFs::new();
        assert!(!fs.symlinks_supported());
        let err = fs.symlink(Path::new("1.2.3"), Path::new("/current")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_memfs_set_mode() {
        let fs = MemFs::new();
        fs.create(Path::new("/f"), 0o600).unwrap().flush().unwrap();
        fs.set_mode(Path::new("/f"), 0o666).unwrap();
        assert_eq!(fs.stat(Path::new("/f")).unwrap().mode, 0o666);
    }

    #[test]
    fn test_osfs_create_applies_exact_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.properties");
        let fs = OsFs;
        let mut writer = fs.create(&path, 0o666).unwrap();
        writer.write_all(b"x y\n").unwrap();
        drop(writer);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
    }

    #[test]
    fn test_osfs_remove_all_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs;
        fs.remove_all(&dir.path().join("no-such-tree")).unwrap();
    }
}
