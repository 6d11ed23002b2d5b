//! Package capability set consumed by the deployer.

use std::io::Read;

use cipd_schema::{InstanceId, Manifest, SignatureBlock};

use crate::files::File;

/// A read-only view of one package instance.
///
/// Implementations are created by whoever opens or fetches a package and are
/// discarded after a single deploy.
pub trait Package {
    /// Package name as declared by the manifest.
    fn name(&self) -> &str;

    /// 40-character lowercase hex content hash of the payload.
    fn instance_id(&self) -> &str;

    /// Package files in archive order, excluding package metadata.
    fn files(&self) -> &[Box<dyn File>];

    /// Whether at least one signature was verified against a trusted key.
    fn signed(&self) -> bool;

    /// All signature blocks attached to the package, verified or not.
    fn signatures(&self) -> &[SignatureBlock];

    /// Reader over the raw archive payload.
    fn data_reader(&self) -> Box<dyn Read + '_>;
}

/// What [`deploy`](crate::deployer::deploy) installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedPackageInfo {
    /// Instance now pointed to by `_current`.
    pub instance_id: InstanceId,
    /// Manifest written into the instance directory.
    pub manifest: Manifest,
}
