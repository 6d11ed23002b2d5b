//! Package manifest and package name validation.
//!
//! Every package carries a small JSON manifest under the reserved
//! [`PACKAGE_SERVICE_DIR`]. The builder synthesizes it, the reader requires
//! it, and the deployer copies it into each installed instance.

use std::io::{Read, Write};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Current manifest format version written by the builder.
pub const MANIFEST_FORMAT_VERSION: &str = "1";

/// Reserved directory inside a package for package metadata.
pub const PACKAGE_SERVICE_DIR: &str = ".cipdpkg";

/// Path of the manifest inside a package.
pub const MANIFEST_NAME: &str = ".cipdpkg/manifest.json";

/// Reserved directory at a site root for installation metadata.
pub const SITE_SERVICE_DIR: &str = ".cipd";

/// Errors that can occur when validating, reading or writing a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// An I/O error occurred while reading or writing the manifest.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest is not valid JSON or does not match the schema.
    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The package name violates the naming rules.
    #[error("Invalid package name '{name}': {reason}")]
    InvalidPackageName {
        /// The offending name.
        name: String,
        /// Which rule was violated.
        reason: &'static str,
    },

    /// The manifest declares a format version this code does not understand.
    #[error("Unsupported manifest format version '{found}', expected '{expected}'")]
    UnsupportedFormat {
        /// Version found in the manifest.
        found: String,
        /// Version this code writes and reads.
        expected: &'static str,
    },
}

/// Returns `true` if `name` is `dir` itself or lies anywhere below it.
pub fn is_under_dir(name: &str, dir: &str) -> bool {
    name == dir
        || name
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Check that `name` is usable as a package name.
///
/// A package name is non-empty, does not contain `..` and is not absolute.
/// Nested names such as `infra/tools/foo` are allowed.
///
/// # Errors
///
/// Returns [`ManifestError::InvalidPackageName`] describing the violated rule.
pub fn validate_package_name(name: &str) -> Result<(), ManifestError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains("..") {
        "name must not contain '..'"
    } else if name.starts_with('/') {
        "name must not start with '/'"
    } else {
        return Ok(());
    };
    Err(ManifestError::InvalidPackageName {
        name: name.to_string(),
        reason,
    })
}

/// A validated package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Create a package name, validating it with [`validate_package_name`].
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::InvalidPackageName`] if the name is rejected.
    pub fn new(name: &str) -> Result<Self, ManifestError> {
        validate_package_name(name)?;
        Ok(Self(name.to_string()))
    }

    /// Return the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The manifest stored at [`MANIFEST_NAME`] inside every package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    /// Manifest format version, currently [`MANIFEST_FORMAT_VERSION`].
    pub format_version: String,
    /// Name of the package this manifest belongs to.
    pub package_name: PackageName,
}

impl Manifest {
    /// Create a manifest for `package_name` with the current format version.
    pub fn new(package_name: PackageName) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION.to_string(),
            package_name,
        }
    }

    /// Serialize the manifest as indented JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Write the manifest as indented JSON into `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying write fails.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), ManifestError> {
        writer.write_all(&self.to_json()?)?;
        Ok(())
    }

    /// Read a manifest from `reader`.
    ///
    /// Only decodes; use [`Manifest::ensure_supported`] to check the format
    /// version.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be read, is not valid JSON, or
    /// carries an invalid package name.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, ManifestError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Reject manifests written in a format version other than the current one.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnsupportedFormat`] on a version mismatch.
    pub fn ensure_supported(&self) -> Result<(), ManifestError> {
        if self.format_version == MANIFEST_FORMAT_VERSION {
            Ok(())
        } else {
            Err(ManifestError::UnsupportedFormat {
                found: self.format_version.clone(),
                expected: MANIFEST_FORMAT_VERSION,
            })
        }
    }
}
