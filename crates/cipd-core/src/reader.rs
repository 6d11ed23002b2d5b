//! Opening package files.
//!
//! A package file is the deterministic zip payload followed by zero or more
//! `CIPD SIGNATURE` PEM blocks. Opening one splits the two, hashes the
//! payload into an [`InstanceId`], checks the embedded manifest and verifies
//! signatures against the caller's trusted keys.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;

use cipd_schema::{
    InstanceId, MANIFEST_NAME, Manifest, ManifestError, PACKAGE_SERVICE_DIR, SignatureBlock,
    SignatureError, is_under_dir, parse_signature_blocks,
};
use rsa::RsaPublicKey;
use flate2::CrcReader;
use flate2::read::DeflateDecoder;
use thiserror::Error;
use zip::{CompressionMethod, ZipArchive};

use crate::files::File;
use crate::package::Package;
use crate::signing::verify_signature;

/// Zip end-of-central-directory signature.
const EOCD_SIGNATURE: &[u8; 4] = b"PK\x05\x06";

/// Fixed size of the end-of-central-directory record, comment excluded.
const EOCD_LEN: usize = 22;

/// Errors that can occur while opening a package file.
#[derive(Error, Debug)]
pub enum ReadError {
    /// Reading the package file failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The payload is not a readable zip archive.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The manifest is missing fields, malformed or of an unknown version.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The signature tail is malformed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// No end-of-central-directory record was found.
    #[error("Not a package file: no zip payload found")]
    NotAZip,

    /// An entry name is absolute or escapes the package root.
    #[error("Unsafe entry name '{name}'")]
    UnsafePath {
        /// The offending entry name.
        name: String,
    },

    /// The archive has no manifest entry.
    #[error("Package has no '{manifest}'", manifest = MANIFEST_NAME)]
    MissingManifest,

    /// Two entries share a name.
    #[error("Duplicate entry '{name}'")]
    DuplicateName {
        /// The repeated entry name.
        name: String,
    },

    /// An entry uses a compression method other than Deflate or Store.
    #[error("Entry '{name}' uses unsupported compression {method:?}")]
    UnsupportedCompression {
        /// The entry name.
        name: String,
        /// The method found.
        method: CompressionMethod,
    },
}

/// An opened package file.
pub struct PackageInstance {
    manifest: Manifest,
    instance_id: InstanceId,
    files: Vec<Box<dyn File>>,
    signatures: Vec<SignatureBlock>,
    signed: bool,
    payload: Arc<[u8]>,
}

impl PackageInstance {
    /// The manifest embedded in the payload.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The deterministic zip bytes, without signatures.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for PackageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageInstance")
            .field("name", &self.manifest.package_name)
            .field("instance_id", &self.instance_id)
            .field("files", &self.files.len())
            .field("signatures", &self.signatures.len())
            .field("signed", &self.signed)
            .finish_non_exhaustive()
    }
}

impl Package for PackageInstance {
    fn name(&self) -> &str {
        self.manifest.package_name.as_str()
    }

    fn instance_id(&self) -> &str {
        self.instance_id.as_str()
    }

    fn files(&self) -> &[Box<dyn File>] {
        &self.files
    }

    fn signed(&self) -> bool {
        self.signed
    }

    fn signatures(&self) -> &[SignatureBlock] {
        &self.signatures
    }

    fn data_reader(&self) -> Box<dyn Read + '_> {
        Box::new(&self.payload[..])
    }
}

/// One entry of an opened archive.
///
/// Each [`File::open`] streams the entry's compressed bytes straight out of
/// the shared payload and checks the CRC once the stream is exhausted.
struct ArchiveFile {
    payload: Arc<[u8]>,
    data: std::ops::Range<usize>,
    deflated: bool,
    crc32: u32,
    name: String,
    size: u64,
    executable: bool,
}

impl File for ArchiveFile {
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
        let raw = &self.payload[self.data.clone()];
        let inner: Box<dyn Read + '_> = if self.deflated {
            Box::new(DeflateDecoder::new(raw))
        } else {
            Box::new(raw)
        };
        Ok(Box::new(CheckedReader {
            inner: CrcReader::new(inner),
            expected_crc: self.crc32,
            name: &self.name,
        }))
    }
}

/// Fails the final read if the data's CRC-32 differs from the archive's.
struct CheckedReader<'a, R> {
    inner: CrcReader<R>,
    expected_crc: u32,
    name: &'a str,
}

impl<R: Read> Read for CheckedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.inner.crc().sum() != self.expected_crc {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("CRC mismatch in '{}'", self.name),
            ));
        }
        Ok(n)
    }
}

/// Open a package from its full bytes (payload plus signature tail).
///
/// # Errors
///
/// Returns a [`ReadError`] if the payload is not a zip archive, the
/// signature tail is malformed, an entry name is unsafe or repeated, or the
/// manifest is missing or unsupported. Signatures that fail to verify are
/// not an error; they leave [`Package::signed`] false.
pub fn open_package(
    data: &[u8],
    trusted_keys: &[RsaPublicKey],
) -> Result<PackageInstance, ReadError> {
    let end = find_payload_end(data).ok_or(ReadError::NotAZip)?;
    let payload: Arc<[u8]> = Arc::from(&data[..end]);
    let signatures = parse_signature_blocks(&data[end..])?;
    let instance_id = InstanceId::compute(&payload);

    let mut archive = ZipArchive::new(Cursor::new(Arc::clone(&payload)))?;
    let mut manifest = None;
    let mut files: Vec<Box<dyn File>> = Vec::with_capacity(archive.len());
    let mut seen = HashSet::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() || name.starts_with('/') {
            return Err(ReadError::UnsafePath { name });
        }
        if !seen.insert(name.clone()) {
            return Err(ReadError::DuplicateName { name });
        }
        if entry.is_dir() {
            continue;
        }

        if name == MANIFEST_NAME {
            let parsed = Manifest::read_from(&mut entry)?;
            parsed.ensure_supported()?;
            manifest = Some(parsed);
            continue;
        }
        if is_under_dir(&name, PACKAGE_SERVICE_DIR) {
            continue;
        }

        let deflated = match entry.compression() {
            CompressionMethod::Deflated => true,
            CompressionMethod::Stored => false,
            method => return Err(ReadError::UnsupportedCompression { name, method }),
        };
        let data = entry_range(entry.data_start(), entry.compressed_size(), payload.len())
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidData, format!("entry '{name}' out of bounds"))
            })?;
        files.push(Box::new(ArchiveFile {
            payload: Arc::clone(&payload),
            data,
            deflated,
            crc32: entry.crc32(),
            name,
            size: entry.size(),
            executable: entry.unix_mode().is_some_and(|mode| mode & 0o111 != 0),
        }));
    }
    let manifest = manifest.ok_or(ReadError::MissingManifest)?;

    let signed = signatures.iter().any(|block| {
        verify_signature(block, &payload, trusted_keys)
            .inspect_err(|e| tracing::debug!("Signature by {} rejected: {e}", block.signature_key))
            .is_ok()
    });

    tracing::debug!(
        "Opened {} ({}): {} files, {} signatures, signed={signed}",
        manifest.package_name,
        instance_id,
        files.len(),
        signatures.len()
    );
    Ok(PackageInstance {
        manifest,
        instance_id,
        files,
        signatures,
        signed,
        payload,
    })
}

/// Read and open the package file at `path`.
///
/// # Errors
///
/// Returns [`ReadError::Io`] if the file cannot be read, otherwise the same
/// errors as [`open_package`].
pub fn open_package_file(
    path: &Path,
    trusted_keys: &[RsaPublicKey],
) -> Result<PackageInstance, ReadError> {
    let data = fs::read(path)?;
    open_package(&data, trusted_keys)
}

/// Byte range of an entry's compressed data, if it lies inside the payload.
fn entry_range(start: u64, len: u64, payload_len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(start).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= payload_len).then_some(start..end)
}

/// Offset just past the zip payload: the last end-of-central-directory record
/// plus its comment.
fn find_payload_end(data: &[u8]) -> Option<usize> {
    let last_start = data.len().checked_sub(EOCD_LEN)?;
    (0..=last_start).rev().find_map(|start| {
        if &data[start..start + 4] != EOCD_SIGNATURE {
            return None;
        }
        let comment_len = usize::from(u16::from_le_bytes([data[start + 20], data[start + 21]]));
        let end = start + EOCD_LEN + comment_len;
        (end <= data.len()).then_some(end)
    })
}
