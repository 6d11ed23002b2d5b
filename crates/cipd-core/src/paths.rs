//! Site root configuration and on-disk layout.
//!
//! ```text
//! <site root>/
//!   .cipd/pkgs/<package name>/<instance id>/...   extracted instance
//!   .cipd/pkgs/<package name>/_current -> <instance id>
//!   <file name> -> .cipd/pkgs/<package name>/_current/<file name>
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use cipd_schema::{InstanceId, PackageName, SITE_SERVICE_DIR};
use rsa::RsaPublicKey;

use crate::keys::{self, KeyError};

/// Environment variable overriding the site root.
pub const SITE_ROOT_ENV: &str = "CIPD_SITE_ROOT";

/// Environment variable naming a directory of trusted `*.pem` public keys.
pub const TRUSTED_KEYS_ENV: &str = "CIPD_TRUSTED_KEYS";

/// Name of the per-package symlink pointing at the active instance.
pub const CURRENT_LINK: &str = "_current";

/// Returns the default site root (`~/.cipd-site`), or None if the user's home
/// cannot be resolved.
pub fn default_site_root() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".cipd-site"))
}

/// Where packages get deployed and which keys are trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    /// Directory packages are deployed into.
    pub site_root: PathBuf,
    /// Directory of trusted public keys, if any.
    pub trusted_keys_dir: Option<PathBuf>,
}

impl SiteConfig {
    /// Load configuration from environment variables.
    ///
    /// Falls back to [`default_site_root`] when [`SITE_ROOT_ENV`] is unset.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let site_root = lookup(SITE_ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(default_site_root)?;
        let trusted_keys_dir = lookup(TRUSTED_KEYS_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Some(Self {
            site_root,
            trusted_keys_dir,
        })
    }

    /// Layout helper for the configured site root.
    pub fn layout(&self) -> SiteLayout {
        SiteLayout::new(&self.site_root)
    }

    /// Load every `*.pem` public key from the trusted keys directory.
    ///
    /// Keys are loaded in file name order. No directory means no keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or any key file
    /// cannot be read or parsed.
    pub fn load_trusted_keys(&self) -> Result<Vec<RsaPublicKey>, KeyError> {
        let Some(dir) = &self.trusted_keys_dir else {
            return Ok(Vec::new());
        };

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        paths.retain(|p| p.extension().is_some_and(|ext| ext == "pem"));
        paths.sort();

        paths
            .iter()
            .map(|path| {
                tracing::debug!("Loading trusted key {}", path.display());
                keys::public_key_from_pem(&fs::read(path)?)
            })
            .collect()
    }
}

/// Path computations for one site root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The site root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/.cipd/pkgs`
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join(SITE_SERVICE_DIR).join("pkgs")
    }

    /// `<root>/.cipd/pkgs/<name>`
    pub fn package_dir(&self, name: &PackageName) -> PathBuf {
        self.packages_dir().join(name.as_str())
    }

    /// `<root>/.cipd/pkgs/<name>/<instance id>`
    pub fn instance_dir(&self, name: &PackageName, instance_id: &InstanceId) -> PathBuf {
        self.package_dir(name).join(instance_id.as_str())
    }

    /// `<root>/.cipd/pkgs/<name>/_current`
    pub fn current_link(&self, name: &PackageName) -> PathBuf {
        self.package_dir(name).join(CURRENT_LINK)
    }

    /// `<root>/<file name>`
    pub fn file_link(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Relative symlink target for the top-level link of `file_name`.
    ///
    /// The target goes through `_current` so repointing `_current` switches
    /// every link at once.
    pub fn link_target(&self, name: &PackageName, file_name: &str) -> PathBuf {
        let link = self.file_link(file_name);
        let through_current = self.current_link(name).join(file_name);
        let link_dir = link.parent().unwrap_or(&self.root);
        relative_path(link_dir, &through_current)
    }
}

/// Compute a relative path from `from_dir` to `to_path`.
///
/// Both paths must share the same base (both absolute, or both relative to
/// the same directory). The function walks up from `from_dir` to the common
/// ancestor and then descends into `to_path`.
///
/// Example: `relative_path("/a/b/c", "/a/b/d/e")` returns `"../d/e"`.
pub fn relative_path(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from_components: Vec<Component<'_>> = from_dir.components().collect();
    let to_components: Vec<Component<'_>> = to_path.components().collect();

    let common_len = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for part in &to_components[common_len..] {
        result.push(part);
    }
    result
}
