//! Deterministic package builder.
//!
//! Turns a list of [`File`]s and a package name into a zip archive whose
//! bytes depend only on the logical inputs: names, contents, executable bits
//! and order. Every entry is Deflate-compressed, stamped with the zip epoch
//! (1980-01-01 00:00:00) and carries Unix permissions `0700` or `0600` as the
//! only attribute. The manifest is appended as the last entry under
//! [`MANIFEST_NAME`].
//!
//! Hashing and signing are not done here; they operate on the finished bytes
//! (see [`crate::signing`]).

use std::collections::HashSet;
use std::io::{self, Seek, Write};

use cipd_schema::{
    MANIFEST_NAME, Manifest, ManifestError, PACKAGE_SERVICE_DIR, PackageName, is_under_dir,
};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::files::{File, MemoryFile};
use crate::reporter::Reporter;

/// Permissions stored for executable entries.
const EXECUTABLE_MODE: u32 = 0o700;

/// Permissions stored for all other entries.
const REGULAR_MODE: u32 = 0o600;

/// Errors that can occur while building a package.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Reading an input or writing the output failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The archive writer failed.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The package name is invalid or the manifest could not be serialized.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// An input file lies under the reserved package metadata directory.
    #[error("File '{name}' is under the reserved directory '{dir}'", dir = PACKAGE_SERVICE_DIR)]
    ReservedName {
        /// The offending file name.
        name: String,
    },

    /// Two inputs share a name.
    #[error("Duplicate file name '{name}'")]
    DuplicateName {
        /// The repeated file name.
        name: String,
    },

    /// A file changed size between being listed and being copied.
    #[error("File '{name}' changed during the build: expected {expected} bytes, copied {actual}")]
    SizeMismatch {
        /// The file name.
        name: String,
        /// Size declared by the file.
        expected: u64,
        /// Bytes actually copied.
        actual: u64,
    },
}

/// Build a package from `files` and write the archive to `output`.
///
/// Inputs are validated before anything is written: the package name must
/// be valid, no input may live under `.cipdpkg/`, and names must be unique
/// (the synthesized manifest included).
///
/// # Errors
///
/// Returns a [`BuildError`] on validation failure, when an input's copied
/// length differs from its declared size, or on any I/O failure. The output
/// must be discarded after an error.
pub fn build_package<W, R>(
    files: &[Box<dyn File>],
    package_name: &str,
    output: W,
    reporter: &R,
) -> Result<(), BuildError>
where
    W: Write + Seek,
    R: Reporter + ?Sized,
{
    let name = PackageName::new(package_name)?;

    if let Some(file) = files
        .iter()
        .find(|f| is_under_dir(f.name(), PACKAGE_SERVICE_DIR))
    {
        return Err(BuildError::ReservedName {
            name: file.name().to_string(),
        });
    }

    let manifest = Manifest::new(name);
    let manifest_file = MemoryFile::new(MANIFEST_NAME, manifest.to_json()?, false);

    let mut inputs: Vec<&dyn File> = files.iter().map(|f| &**f).collect();
    inputs.push(&manifest_file);

    let mut seen = HashSet::with_capacity(inputs.len());
    for file in &inputs {
        if !seen.insert(file.name()) {
            return Err(BuildError::DuplicateName {
                name: file.name().to_string(),
            });
        }
    }

    reporter.section("Building");
    let mut zip = ZipWriter::new(output);
    for file in inputs {
        reporter.adding(file.name(), file.size());
        zip.start_file(file.name(), entry_options(file.executable()))?;

        // The reader is dropped at the end of each iteration, closing the
        // underlying handle before the next file is opened.
        let mut reader = file.open()?;
        let copied = io::copy(&mut reader, &mut zip)?;
        if copied != file.size() {
            return Err(BuildError::SizeMismatch {
                name: file.name().to_string(),
                expected: file.size(),
                actual: copied,
            });
        }
    }
    zip.finish()?;

    tracing::debug!("Built package {}", manifest.package_name);
    Ok(())
}

fn entry_options(executable: bool) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(if executable {
            EXECUTABLE_MODE
        } else {
            REGULAR_MODE
        })
}
