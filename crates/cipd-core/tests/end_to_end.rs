//! Build, sign, open and deploy a package through the public API.

use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use cipd_core::{
    DeployError, Package, SITE_ROOT_ENV, SiteConfig, TRUSTED_KEYS_ENV, TracingReporter,
    append_signature, build_package, check_deployed, deploy, open_package_file, public_key_to_pem,
    remove_deployed, scan_file_system, sign_payload,
};
use cipd_schema::InstanceId;
use rsa::RsaPrivateKey;
use tempfile::TempDir;

/// A scratch source tree, key directory and site root.
struct TestContext {
    temp_dir: TempDir,
    key: RsaPrivateKey,
    config: SiteConfig,
}

impl TestContext {
    fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let temp_dir = TempDir::new()?;
        let keys_dir = temp_dir.path().join("keys");
        let site_root = temp_dir.path().join("site");
        fs::create_dir_all(&keys_dir)?;
        fs::create_dir_all(&site_root)?;

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024)?;
        fs::write(keys_dir.join("release.pem"), public_key_to_pem(&key.to_public_key())?)?;

        let config = SiteConfig::from_lookup(|name| match name {
            SITE_ROOT_ENV => Some(site_root.display().to_string()),
            TRUSTED_KEYS_ENV => Some(keys_dir.display().to_string()),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("no site root"))?;

        Ok(Self {
            temp_dir,
            key,
            config,
        })
    }

    fn site(&self) -> &Path {
        &self.config.site_root
    }

    fn write_source(&self, tree: &str, files: &[(&str, &str, u32)]) -> Result<PathBuf> {
        let root = self.temp_dir.path().join(tree);
        for (name, data, mode) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap_or(&root))?;
            fs::write(&path, data)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode))?;
        }
        Ok(root)
    }

    /// Build and sign the tree at `source`, returning the package file path.
    fn package(&self, source: &Path, name: &str, key: &RsaPrivateKey) -> Result<PathBuf> {
        let files = scan_file_system(source)?;
        let mut payload = Cursor::new(Vec::new());
        build_package(&files, name, &mut payload, &TracingReporter)?;
        let mut data = payload.into_inner();

        let block = sign_payload(&data, key)?;
        append_signature(&mut data, &block)?;

        let path = source.with_extension("cipd");
        fs::write(&path, data)?;
        Ok(path)
    }
}

#[test]
fn test_build_sign_deploy_roundtrip() -> Result<()> {
    let ctx = TestContext::new()?;
    let source = ctx.write_source(
        "v1",
        &[("bin/tool", "#!/bin/sh\necho v1\n", 0o755), ("share/doc.txt", "docs", 0o644)],
    )?;
    let path = ctx.package(&source, "infra/tool", &ctx.key)?;

    let keys = ctx.config.load_trusted_keys()?;
    assert_eq!(keys.len(), 1);
    let pkg = open_package_file(&path, &keys)?;
    assert!(pkg.signed());
    assert_eq!(pkg.name(), "infra/tool");
    assert_eq!(pkg.instance_id(), InstanceId::compute(pkg.payload()).as_str());
    let names: Vec<&str> = pkg.files().iter().map(|f| f.name()).collect();
    assert_eq!(names, vec!["bin/tool", "share/doc.txt"]);

    let info = deploy(ctx.site(), &pkg, &TracingReporter)?;
    assert_eq!(info.instance_id.as_str(), pkg.instance_id());

    let tool = ctx.site().join("bin/tool");
    assert_eq!(fs::read_to_string(&tool)?, "#!/bin/sh\necho v1\n");
    assert_ne!(fs::metadata(&tool)?.permissions().mode() & 0o111, 0);
    assert_eq!(fs::read_to_string(ctx.site().join("share/doc.txt"))?, "docs");
    assert_eq!(check_deployed(ctx.site(), "infra/tool")?, Some(info));
    Ok(())
}

#[test]
fn test_rebuild_is_reproducible() -> Result<()> {
    let ctx = TestContext::new()?;
    let source = ctx.write_source("src", &[("a", "a", 0o644), ("b/c", "c", 0o755)])?;
    let keys = ctx.config.load_trusted_keys()?;

    let first = open_package_file(&ctx.package(&source, "pkg", &ctx.key)?, &keys)?;
    let second = open_package_file(&ctx.package(&source, "pkg", &ctx.key)?, &keys)?;
    assert_eq!(first.instance_id(), second.instance_id());
    assert_eq!(first.payload(), second.payload());
    Ok(())
}

#[test]
fn test_upgrade_and_remove() -> Result<()> {
    let ctx = TestContext::new()?;
    let keys = ctx.config.load_trusted_keys()?;

    let v1 = ctx.write_source("v1", &[("tool", "v1", 0o755), ("legacy", "old", 0o644)])?;
    let v2 = ctx.write_source("v2", &[("tool", "v2", 0o644), ("fresh", "new", 0o644)])?;
    let pkg_v1 = open_package_file(&ctx.package(&v1, "pkg", &ctx.key)?, &keys)?;
    let pkg_v2 = open_package_file(&ctx.package(&v2, "pkg", &ctx.key)?, &keys)?;

    deploy(ctx.site(), &pkg_v1, &TracingReporter)?;
    deploy(ctx.site(), &pkg_v2, &TracingReporter)?;

    let site = ctx.site();
    assert_eq!(fs::read_to_string(site.join("tool"))?, "v2");
    assert_eq!(fs::metadata(site.join("tool"))?.permissions().mode() & 0o111, 0);
    assert_eq!(fs::read_to_string(site.join("fresh"))?, "new");
    assert!(fs::symlink_metadata(site.join("legacy")).is_err());
    assert!(!site.join(".cipd/pkgs/pkg").join(pkg_v1.instance_id()).exists());

    let removed = remove_deployed(site, "pkg", &TracingReporter)?;
    assert_eq!(
        removed.map(|info| info.instance_id.as_str().to_string()),
        Some(pkg_v2.instance_id().to_string())
    );
    assert!(fs::symlink_metadata(site.join("tool")).is_err());
    assert!(check_deployed(site, "pkg")?.is_none());
    Ok(())
}

#[test]
fn test_untrusted_signature_is_refused() -> Result<()> {
    let ctx = TestContext::new()?;
    let stranger = RsaPrivateKey::new(&mut rand::thread_rng(), 1024)?;
    let source = ctx.write_source("src", &[("f", "x", 0o644)])?;
    let path = ctx.package(&source, "pkg", &stranger)?;

    let pkg = open_package_file(&path, &ctx.config.load_trusted_keys()?)?;
    assert!(!pkg.signed());
    assert_eq!(pkg.signatures().len(), 1);
    assert!(matches!(
        deploy(ctx.site(), &pkg, &TracingReporter),
        Err(DeployError::Unsigned { .. })
    ));
    assert_eq!(fs::read_dir(ctx.site())?.count(), 0);
    Ok(())
}
