//! File abstraction shared by the builder, reader and deployer.
//!
//! A [`File`] is a capability set, not an owned handle: implementations open
//! a fresh stream on every [`File::open`] and hold nothing in between.

use std::fmt;
use std::fs::{self, Metadata};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// A named blob of bytes with an executable bit.
pub trait File {
    /// Slash-separated path relative to the package root.
    fn name(&self) -> &str;

    /// Length in bytes.
    fn size(&self) -> u64;

    /// Whether the file should be installed executable.
    fn executable(&self) -> bool;

    /// Open a fresh reader over the contents.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing storage cannot be opened.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

impl fmt::Debug for dyn File + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name())
            .field("size", &self.size())
            .field("executable", &self.executable())
            .finish()
    }
}

/// A file on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsFile {
    path: PathBuf,
    name: String,
    size: u64,
    executable: bool,
}

impl FsFile {
    /// Describe the regular file at `path`, named relative to `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is not under `root`, cannot be stat'ed, or
    /// has a non UTF-8 name.
    pub fn new(root: &Path, path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Self::with_metadata(root, path, &metadata)
    }

    fn with_metadata(root: &Path, path: &Path, metadata: &Metadata) -> io::Result<Self> {
        let relative = path.strip_prefix(root).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not under {}", path.display(), root.display()),
            )
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            name: slash_name(relative)?,
            size: metadata.len(),
            executable: metadata.permissions().mode() & 0o111 != 0,
        })
    }

    /// Absolute (or root-relative) path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl File for FsFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn executable(&self) -> bool {
        self.executable
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }
}

/// A file held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    name: String,
    data: Vec<u8>,
    executable: bool,
}

impl MemoryFile {
    /// Create an in-memory file.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>, executable: bool) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            executable,
        }
    }
}

impl File for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn executable(&self) -> bool {
        self.executable
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }
}

/// Collect every regular file under `root`.
///
/// Results are ordered by slash-separated relative name. Directories
/// contribute no entries of their own and symbolic links are neither followed
/// nor recorded. The first I/O error aborts the scan.
///
/// # Errors
///
/// Returns the first error hit while walking or stat'ing entries.
pub fn scan_file_system(root: &Path) -> io::Result<Vec<Box<dyn File>>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        files.push(FsFile::with_metadata(root, entry.path(), &metadata)?);
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    tracing::debug!("Scanned {} files under {}", files.len(), root.display());
    Ok(files
        .into_iter()
        .map(|f| Box::new(f) as Box<dyn File>)
        .collect())
}

/// Join the components of a relative path with `/`.
fn slash_name(relative: &Path) -> io::Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non UTF-8 file name: {}", relative.display()),
                )
            })?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unexpected path component in {}", relative.display()),
                ));
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, name: &str, data: &str) {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn names(files: &[Box<dyn File>]) -> Vec<&str> {
        files.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn test_scan_orders_by_relative_name() {
        let tmp = tempdir().unwrap();
        for name in ["a", "b", "1/a", "1/b", "1/2/a"] {
            write(tmp.path(), name, name);
        }
        fs::create_dir_all(tmp.path().join("empty/nested")).unwrap();

        let files = scan_file_system(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["1/2/a", "1/a", "1/b", "a", "b"]);
    }

    #[test]
    fn test_scan_empty_directory_tree() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("x/y/z")).unwrap();
        assert!(scan_file_system(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_skips_symlinks() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "real", "data");
        std::os::unix::fs::symlink("real", tmp.path().join("link")).unwrap();
        fs::create_dir_all(tmp.path().join("dir")).unwrap();
        std::os::unix::fs::symlink("../dir", tmp.path().join("dir/loop")).unwrap();

        let files = scan_file_system(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["real"]);
    }

    #[test]
    fn test_scan_reports_size_and_exec_bit() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "tool", "#!/bin/sh\n");
        write(tmp.path(), "data", "12345");
        fs::set_permissions(tmp.path().join("tool"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(tmp.path().join("data"), fs::Permissions::from_mode(0o640)).unwrap();

        let files = scan_file_system(tmp.path()).unwrap();
        let data = &files[0];
        let tool = &files[1];
        assert_eq!(data.name(), "data");
        assert_eq!(data.size(), 5);
        assert!(!data.executable());
        assert!(tool.executable());

        let mut contents = String::new();
        tool.open().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "#!/bin/sh\n");
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let tmp = tempdir().unwrap();
        assert!(scan_file_system(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_memory_file_reads_back() {
        let file = MemoryFile::new("dir/file", "hello", true);
        assert_eq!(file.size(), 5);
        let mut buf = Vec::new();
        file.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        // Every open starts from the beginning.
        let mut again = Vec::new();
        file.open().unwrap().read_to_end(&mut again).unwrap();
        assert_eq!(again, b"hello");
    }
}
