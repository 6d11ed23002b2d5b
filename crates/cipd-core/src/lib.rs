//! Building, reading and deploying cipd packages.
//!
//! A package travels as a deterministic zip payload followed by signature
//! blocks. [`builder`] produces the payload from a list of [`File`]s,
//! [`signing`] signs it, [`reader`] opens a package file back into a
//! [`Package`], and [`deployer`] installs a signed package into a site root.

pub mod builder;
pub mod deployer;
pub mod files;
pub mod keys;
pub mod package;
pub mod paths;
pub mod reader;
pub mod signing;

pub mod reporter;

pub use builder::{BuildError, build_package};
pub use deployer::{DeployError, check_deployed, deploy, remove_deployed};
pub use files::{File, FsFile, MemoryFile, scan_file_system};
pub use keys::{KeyError, public_key_fingerprint, public_key_from_pem, public_key_to_pem};
pub use package::{DeployedPackageInfo, Package};
pub use paths::*;
pub use reader::{PackageInstance, ReadError, open_package, open_package_file};
pub use reporter::{NullReporter, Reporter, TracingReporter};
pub use signing::{append_signature, sign_payload, verify_signature};
