//! Deploying packages into a site root.
//!
//! Every instance is extracted under `.cipd/pkgs/<name>/<instance id>` and
//! made active by pointing `.cipd/pkgs/<name>/_current` at it. Top-level
//! symlinks go through `_current`, so switching instances is a single
//! `rename(2)` of that link; the per-file links only need touching when the
//! set of file names changes.
//!
//! No lock is taken: concurrent deploys of the same package name into the
//! same site root must be serialized by the caller.

use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use cipd_schema::{
    InstanceId, InvalidInstanceId, MANIFEST_NAME, Manifest, ManifestError, PACKAGE_SERVICE_DIR,
    PackageName, SITE_SERVICE_DIR, is_under_dir,
};
use thiserror::Error;

use crate::files::{File, scan_file_system};
use crate::package::{DeployedPackageInfo, Package};
use crate::paths::{CURRENT_LINK, SiteLayout};
use crate::reporter::Reporter;

/// Errors that can occur while deploying or removing a package.
#[derive(Error, Debug)]
pub enum DeployError {
    /// A filesystem operation failed. Earlier steps are not rolled back.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The package name is invalid or a deployed manifest is unreadable.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The instance ID is malformed.
    #[error(transparent)]
    InstanceId(#[from] InvalidInstanceId),

    /// The package carries no signature verified against a trusted key.
    #[error("Package '{name}' is not signed by a trusted key")]
    Unsigned {
        /// The package name.
        name: String,
    },

    /// A file would land in the site's reserved directory.
    #[error("File '{name}' is under the reserved directory '{dir}'", dir = SITE_SERVICE_DIR)]
    ReservedName {
        /// The offending file name.
        name: String,
    },

    /// A file name is absolute, empty or escapes the site root.
    #[error("Unsafe file name '{name}'")]
    UnsafePath {
        /// The offending file name.
        name: String,
    },

    /// Two package files share a name.
    #[error("Duplicate file name '{name}'")]
    DuplicateName {
        /// The repeated file name.
        name: String,
    },

    /// A top-level path is occupied by something the deployer does not manage.
    #[error("Path '{name}' is occupied by a file or link not managed by cipd")]
    PathConflict {
        /// Site-relative path of the obstruction.
        name: String,
    },

    /// A file's contents did not match its declared size.
    #[error("File '{name}' is truncated or oversized: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The file name.
        name: String,
        /// Size declared by the package.
        expected: u64,
        /// Bytes actually extracted.
        actual: u64,
    },
}

/// Deploy `package` into `site_root`, making it the current instance.
///
/// The package is validated before anything is written: it must be signed,
/// its name and instance ID must be well formed, and every file name must be
/// a safe relative path outside `.cipd/`. Files under `.cipdpkg/` are
/// skipped; the deployer writes the manifest itself.
///
/// Deploying an instance that is already extracted only refreshes the
/// links, so re-running a failed or completed deploy is safe.
///
/// # Errors
///
/// Returns a [`DeployError`] on validation failure or on the first
/// filesystem error. Filesystem errors leave whatever was done so far in
/// place.
pub fn deploy<P, R>(
    site_root: &Path,
    package: &P,
    reporter: &R,
) -> Result<DeployedPackageInfo, DeployError>
where
    P: Package + ?Sized,
    R: Reporter + ?Sized,
{
    let name = PackageName::new(package.name())?;
    let instance_id = InstanceId::new(package.instance_id())?;
    if !package.signed() {
        return Err(DeployError::Unsigned {
            name: name.to_string(),
        });
    }
    let files = deployable_files(package.files())?;

    reporter.section("Deploying");
    let layout = SiteLayout::new(site_root);
    let package_dir = layout.package_dir(&name);
    let instance_dir = layout.instance_dir(&name, &instance_id);
    fs::create_dir_all(&package_dir)?;

    let manifest = Manifest::new(name.clone());
    if is_extracted(&instance_dir, &name) {
        reporter.info(&format!("{name} {instance_id} is already extracted"));
    } else {
        extract_instance(
            &files,
            &manifest,
            &package_dir,
            &instance_dir,
            &instance_id,
            reporter,
        )?;
    }

    // Obstructions are cleared before `_current` moves, so a conflict
    // leaves the previous instance active.
    for file in &files {
        clear_link_path(&layout, file.name())?;
    }
    set_current(&layout, &name, &instance_id)?;

    for file in &files {
        let link = layout.file_link(file.name());
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        replace_symlink(&layout.link_target(&name, file.name()), &link)?;
    }

    // Every other instance goes, not just the one `_current` pointed at:
    // an earlier deploy may have failed after switching.
    let keep: HashSet<&str> = files.iter().map(|f| f.name()).collect();
    for old in stale_instances(&package_dir, &instance_id)? {
        retire_instance(&layout, &name, &old, &keep, reporter)?;
    }

    reporter.done(name.as_str(), instance_id.as_str(), "deployed");
    Ok(DeployedPackageInfo {
        instance_id,
        manifest,
    })
}

/// Report what is currently deployed for `package_name`, if anything.
///
/// # Errors
///
/// Returns an error if the name is invalid, `_current` points at something
/// other than an instance ID, or the instance's manifest cannot be read.
pub fn check_deployed(
    site_root: &Path,
    package_name: &str,
) -> Result<Option<DeployedPackageInfo>, DeployError> {
    let name = PackageName::new(package_name)?;
    let layout = SiteLayout::new(site_root);

    let target = match fs::read_link(layout.current_link(&name)) {
        Ok(target) => target,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let instance_id = InstanceId::new(&target.to_string_lossy())?;

    let manifest_path = layout.instance_dir(&name, &instance_id).join(MANIFEST_NAME);
    let manifest = match fs::File::open(&manifest_path) {
        Ok(file) => Manifest::read_from(file)?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(DeployedPackageInfo {
        instance_id,
        manifest,
    }))
}

/// Remove the deployed instance of `package_name` and its top-level links.
///
/// Links since taken over by another package are left alone. Returns what
/// was removed, or `None` if the package was not deployed.
///
/// # Errors
///
/// Returns an error if the name is invalid or a filesystem operation fails.
pub fn remove_deployed<R>(
    site_root: &Path,
    package_name: &str,
    reporter: &R,
) -> Result<Option<DeployedPackageInfo>, DeployError>
where
    R: Reporter + ?Sized,
{
    let Some(info) = check_deployed(site_root, package_name)? else {
        return Ok(None);
    };
    let name = PackageName::new(package_name)?;
    let layout = SiteLayout::new(site_root);

    reporter.section("Removing");
    let package_dir = layout.package_dir(&name);
    let keep = HashSet::new();
    for old in stale_instances(&package_dir, &info.instance_id)? {
        retire_instance(&layout, &name, &old, &keep, reporter)?;
    }
    retire_instance(&layout, &name, &info.instance_id, &keep, reporter)?;
    remove_if_exists(&layout.current_link(&name))?;
    prune_empty_dirs(&package_dir, &layout.packages_dir());

    reporter.done(name.as_str(), info.instance_id.as_str(), "removed");
    Ok(Some(info))
}

/// Validate file names and drop package metadata entries.
fn deployable_files(files: &[Box<dyn File>]) -> Result<Vec<&dyn File>, DeployError> {
    let mut seen = HashSet::with_capacity(files.len());
    let mut result = Vec::with_capacity(files.len());
    for file in files {
        let name = file.name();
        if !is_safe_relative(name) {
            return Err(DeployError::UnsafePath {
                name: name.to_string(),
            });
        }
        if is_under_dir(name, SITE_SERVICE_DIR) {
            return Err(DeployError::ReservedName {
                name: name.to_string(),
            });
        }
        if !seen.insert(name) {
            return Err(DeployError::DuplicateName {
                name: name.to_string(),
            });
        }
        if is_under_dir(name, PACKAGE_SERVICE_DIR) {
            continue;
        }
        result.push(&**file);
    }
    Ok(result)
}

/// Non-empty, relative, and made only of normal components.
fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// True if `instance_dir` holds a manifest naming `name`.
fn is_extracted(instance_dir: &Path, name: &PackageName) -> bool {
    fs::File::open(instance_dir.join(MANIFEST_NAME))
        .ok()
        .and_then(|file| Manifest::read_from(file).ok())
        .is_some_and(|manifest| manifest.package_name == *name)
}

/// Extract into a staging directory next to `instance_dir`, then move it
/// into place.
fn extract_instance<R: Reporter + ?Sized>(
    files: &[&dyn File],
    manifest: &Manifest,
    package_dir: &Path,
    instance_dir: &Path,
    instance_id: &InstanceId,
    reporter: &R,
) -> Result<(), DeployError> {
    // A directory without a valid manifest is a leftover from an
    // interrupted deploy.
    if fs::symlink_metadata(instance_dir).is_ok() {
        reporter.warning(&format!(
            "Replacing incomplete instance {}",
            instance_dir.display()
        ));
        fs::remove_dir_all(instance_dir)?;
    }

    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(package_dir)?;
    let total = files.len() as u64;
    for (done, file) in (1..).zip(files) {
        reporter.extracting(
            manifest.package_name.as_str(),
            instance_id.as_str(),
            done,
            total,
        );
        extract_file(*file, staging.path())?;
    }

    let manifest_path = staging.path().join(MANIFEST_NAME);
    if let Some(parent) = manifest_path.parent() {
        fs::create_dir_all(parent)?;
    }
    manifest.write_to(fs::File::create(&manifest_path)?)?;

    // Once renamed, dropping `staging` finds nothing left to clean up.
    fs::rename(staging.path(), instance_dir)?;
    tracing::debug!("Extracted {} files into {}", files.len(), instance_dir.display());
    Ok(())
}

fn extract_file(file: &dyn File, dest_root: &Path) -> Result<(), DeployError> {
    let dest = dest_root.join(file.name());
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    // One byte past the declared size is enough to detect an oversized file.
    let mut out = fs::File::create(&dest)?;
    let mut reader = file.open()?.take(file.size().saturating_add(1));
    let copied = io::copy(&mut reader, &mut out)?;
    if copied != file.size() {
        return Err(DeployError::SizeMismatch {
            name: file.name().to_string(),
            expected: file.size(),
            actual: copied,
        });
    }

    let mode = if file.executable() { 0o755 } else { 0o644 };
    fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Instance directories under `package_dir` other than `keep`.
///
/// Directories of nested packages (those holding their own `_current`) are
/// not instances even when their name looks like one.
fn stale_instances(package_dir: &Path, keep: &InstanceId) -> io::Result<Vec<InstanceId>> {
    let mut stale = Vec::new();
    for entry in fs::read_dir(package_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|n| InstanceId::new(n).ok())
        else {
            continue;
        };
        if id != *keep && fs::symlink_metadata(entry.path().join(CURRENT_LINK)).is_err() {
            stale.push(id);
        }
    }
    stale.sort();
    Ok(stale)
}

/// Make room for the top-level link of `file_name`.
///
/// Deployer-managed symlinks sitting where a parent directory is needed are
/// removed, as is a real directory at the link path that holds nothing but
/// deployer-managed links. Anything else in the way is a conflict. Parent
/// directories are never entered through a symlink.
fn clear_link_path(layout: &SiteLayout, file_name: &str) -> Result<(), DeployError> {
    for (end, _) in file_name.match_indices('/') {
        let prefix = &file_name[..end];
        let path = layout.file_link(prefix);
        match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() && is_managed_link(&path) => {
                fs::remove_file(&path)?;
                tracing::debug!("Removed {} to make room for {file_name}", path.display());
                return Ok(());
            }
            Ok(_) => {
                return Err(DeployError::PathConflict {
                    name: prefix.to_string(),
                });
            }
        }
    }

    let link = layout.file_link(file_name);
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.is_dir() => {
            if !holds_only_managed_links(&link)? {
                return Err(DeployError::PathConflict {
                    name: file_name.to_string(),
                });
            }
            fs::remove_dir_all(&link)?;
            tracing::debug!("Removed directory {} to make room for a file", link.display());
        }
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    Ok(())
}

/// True if `path` is a symlink into some package's `.cipd/pkgs` tree.
fn is_managed_link(path: &Path) -> bool {
    fs::read_link(path).is_ok_and(|target| {
        target
            .components()
            .any(|c| c.as_os_str() == SITE_SERVICE_DIR)
    })
}

fn holds_only_managed_links(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let managed = if file_type.is_symlink() {
            is_managed_link(&entry.path())
        } else if file_type.is_dir() {
            holds_only_managed_links(&entry.path())?
        } else {
            false
        };
        if !managed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Atomically point `_current` at `instance_id`.
fn set_current(
    layout: &SiteLayout,
    name: &PackageName,
    instance_id: &InstanceId,
) -> io::Result<()> {
    let current = layout.current_link(name);
    let tmp = layout
        .package_dir(name)
        .join(format!(".current-{instance_id}.tmp"));
    remove_if_exists(&tmp)?;
    symlink(instance_id.as_str(), &tmp)?;
    fs::rename(&tmp, &current)?;
    tracing::debug!("{} -> {instance_id}", current.display());
    Ok(())
}

/// Make `link` a symlink to `target`, replacing whatever is there.
///
/// Returns `false` if the link was already correct.
fn replace_symlink(target: &Path, link: &Path) -> io::Result<bool> {
    if fs::read_link(link).is_ok_and(|existing| existing == target) {
        return Ok(false);
    }

    let file_name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = link.with_file_name(format!(".{file_name}.cipd-tmp"));
    remove_if_exists(&tmp)?;
    symlink(target, &tmp)?;
    fs::rename(&tmp, link)?;
    tracing::debug!("Linked {} -> {}", link.display(), target.display());
    Ok(true)
}

/// Unlink the top-level files of `instance_id` not in `keep`, then delete
/// its directory.
fn retire_instance<R: Reporter + ?Sized>(
    layout: &SiteLayout,
    name: &PackageName,
    instance_id: &InstanceId,
    keep: &HashSet<&str>,
    reporter: &R,
) -> Result<(), DeployError> {
    let instance_dir = layout.instance_dir(name, instance_id);
    if fs::symlink_metadata(&instance_dir).is_err() {
        return Ok(());
    }
    reporter.removing(name.as_str(), instance_id.as_str());

    for file in scan_file_system(&instance_dir)? {
        let file_name = file.name();
        if is_under_dir(file_name, PACKAGE_SERVICE_DIR)
            || is_under_dir(file_name, SITE_SERVICE_DIR)
            || keep.contains(file_name)
        {
            continue;
        }
        remove_stale_link(layout, name, file_name)?;
    }

    fs::remove_dir_all(&instance_dir)?;
    Ok(())
}

/// Remove the top-level link for `file_name` if it still belongs to `name`.
fn remove_stale_link(
    layout: &SiteLayout,
    name: &PackageName,
    file_name: &str,
) -> io::Result<()> {
    let link = layout.file_link(file_name);
    let ours = fs::read_link(&link)
        .is_ok_and(|target| target == layout.link_target(name, file_name));
    if !ours {
        tracing::debug!("Leaving {} alone", link.display());
        return Ok(());
    }

    fs::remove_file(&link)?;
    tracing::debug!("Unlinked {}", link.display());
    if let Some(parent) = link.parent() {
        prune_empty_dirs(parent, layout.root());
    }
    Ok(())
}

/// Remove `dir` and its ancestors while they are empty, stopping at `stop`.
fn prune_empty_dirs(dir: &Path, stop: &Path) {
    let mut current: Option<PathBuf> = Some(dir.to_path_buf());
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) || fs::remove_dir(&dir).is_err() {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
