//! Filesystem access for OS metrics, so collectors run against fixtures in tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

/// Capacity of the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub bytes_total: u64,
    pub bytes_available: u64,
}

/// The filesystem operations OS metrics need.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Size and free space of the filesystem containing `path`.
    fn usage(&self, path: &Path) -> io::Result<FsUsage>;
}

/// Delegates to `std::fs` and `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    #[cfg(unix)]
    fn usage(&self, path: &Path) -> io::Result<FsUsage> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: statvfs only writes into the zeroed struct we own, and
        // c_path is a valid NUL terminated string for the whole call.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        // Block counts are in fragment size units.
        let fragment_size = stat.f_frsize as u64;
        Ok(FsUsage {
            bytes_total: fragment_size * stat.f_blocks as u64,
            bytes_available: fragment_size * stat.f_bavail as u64,
        })
    }

    #[cfg(not(unix))]
    fn usage(&self, _path: &Path) -> io::Result<FsUsage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "statvfs is not available on this platform",
        ))
    }
}

/// In-memory filesystem for tests.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    usage: HashMap<PathBuf, FsUsage>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Registers capacity for the filesystem holding `path`.
    pub fn set_usage(&mut self, path: impl AsRef<Path>, usage: FsUsage) {
        self.usage.insert(path.as_ref().to_path_buf(), usage);
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }

    fn usage(&self, path: &Path) -> io::Result<FsUsage> {
        self.usage.get(path).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no usage for {:?}", path))
        })
    }
}
