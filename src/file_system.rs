//! File access handed down to every component.
//!
//! Nothing in the crate touches `std::fs` directly: the
//! [`StorageEngine`](crate::engine::StorageEngine) owns one [`FileSystem`] and passes it to
//! the files it opens. [`DiskFileSystem`] is the real thing; [`MemoryFileSystem`] keeps
//! everything in memory and counts how often each file is opened, which is how tests prove
//! a code path never touched a file.

use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only. The file must exist.
    Read,
    /// Read and write. The file is created when missing.
    ReadWrite,
}

/// An open file handle.
pub trait StorageFile: Read + Write + Seek + Send {
    /// Current length of the file in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Forces written data down to the storage medium.
    fn sync(&mut self) -> io::Result<()>;
}

/// The file operations the store needs.
pub trait FileSystem: Send + Sync + fmt::Debug {
    fn open(&self, path: &Path, access: Access) -> io::Result<Box<dyn StorageFile>>;

    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Moves `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Reads a whole file.
pub(crate) fn read_file(fs: &dyn FileSystem, path: &Path) -> io::Result<Vec<u8>> {
    let mut file = fs.open(path, Access::Read)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Replaces the contents of `path` by writing a sibling temp file and renaming it over.
pub(crate) fn replace_file(
    fs: &dyn FileSystem,
    path: &Path,
    bytes: &[u8],
    sync: bool,
) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    if fs.exists(&temp) {
        fs.remove(&temp)?;
    }
    {
        let mut file = fs.open(&temp, Access::ReadWrite)?;
        file.write_all(bytes)?;
        file.flush()?;
        if sync {
            file.sync()?;
        }
    }
    fs.rename(&temp, path)
}

/// [`FileSystem`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFileSystem;

struct DiskFile {
    file: File,
}

impl Read for DiskFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DiskFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for DiskFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StorageFile for DiskFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

impl FileSystem for DiskFileSystem {
    fn open(&self, path: &Path, access: Access) -> io::Result<Box<dyn StorageFile>> {
        let file = match access {
            Access::Read => OpenOptions::new().read(true).open(path)?,
            Access::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        Ok(Box::new(DiskFile { file }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}

type SharedBytes = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct MemoryState {
    files: HashMap<PathBuf, SharedBytes>,
    opens: HashMap<PathBuf, usize>,
}

/// In-memory [`FileSystem`]. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for MemoryFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFileSystem").finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "Failed to acquire lock on memory file."))
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `path` has been opened, in any mode.
    pub fn open_count(&self, path: &Path) -> usize {
        lock(&self.state)
            .map(|state| state.opens.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// A copy of the current contents of `path`.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let state = lock(&self.state).ok()?;
        let bytes = state.files.get(path)?;
        let bytes = lock(bytes).ok()?;
        Some(bytes.clone())
    }
}

struct MemoryFile {
    cursor: Cursor<Vec<u8>>,
    shared: SharedBytes,
    dirty: bool,
}

impl MemoryFile {
    /// Writes go straight to the shared buffer so other handles see them.
    fn publish(&mut self) -> io::Result<()> {
        if self.dirty {
            let mut shared = lock(&self.shared)?;
            shared.clone_from(self.cursor.get_ref());
            self.dirty = false;
        }
        Ok(())
    }
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.cursor.write(buf)?;
        self.dirty = true;
        self.publish()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.publish()
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageFile for MemoryFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.publish()
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path, access: Access) -> io::Result<Box<dyn StorageFile>> {
        let mut state = lock(&self.state)?;
        *state.opens.entry(path.to_path_buf()).or_insert(0) += 1;

        let shared = match (state.files.get(path), access) {
            (Some(shared), _) => Arc::clone(shared),
            (None, Access::ReadWrite) => {
                let shared = SharedBytes::default();
                state.files.insert(path.to_path_buf(), Arc::clone(&shared));
                shared
            }
            (None, Access::Read) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                ))
            }
        };

        let bytes = lock(&shared)?.clone();
        Ok(Box::new(MemoryFile {
            cursor: Cursor::new(bytes),
            shared,
            dirty: false,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.state)
            .map(|state| state.files.contains_key(path))
            .unwrap_or(false)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        lock(&self.state)?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                )
            })
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        let bytes = state.files.remove(from).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", from.display()),
            )
        })?;
        state.files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let state = lock(&self.state)?;
        Ok(state
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }
}
