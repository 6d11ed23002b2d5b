//! Reporter trait for dependency injection
//!
//! The builder and deployer report progress through an explicit handle
//! rather than a process-wide logger, so callers decide where events go.

/// Sink for progress and status events emitted by the builder and deployer.
pub trait Reporter: Send + Sync {
    /// Indicates a new phase has started (e.g. "Building", "Deploying").
    fn section(&self, title: &str);

    /// A file is being added to an archive.
    fn adding(&self, file: &str, size: u64);

    /// Updates the progress of an extraction.
    fn extracting(&self, package: &str, instance_id: &str, current: u64, total: u64);

    /// A previously deployed instance is being retired.
    fn removing(&self, package: &str, instance_id: &str);

    /// Marks a package operation as successfully completed.
    fn done(&self, package: &str, instance_id: &str, detail: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn adding(&self, file: &str, size: u64) {
        (**self).adding(file, size);
    }
    fn extracting(&self, package: &str, instance_id: &str, current: u64, total: u64) {
        (**self).extracting(package, instance_id, current, total);
    }
    fn removing(&self, package: &str, instance_id: &str) {
        (**self).removing(package, instance_id);
    }
    fn done(&self, package: &str, instance_id: &str, detail: &str) {
        (**self).done(package, instance_id, detail);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn adding(&self, _: &str, _: u64) {}
    fn extracting(&self, _: &str, _: &str, _: u64, _: u64) {}
    fn removing(&self, _: &str, _: &str) {}
    fn done(&self, _: &str, _: &str, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
}

/// Forwards every event to `tracing` with structured fields.
///
/// Per-file events go out at `debug`, phase and completion events at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn section(&self, title: &str) {
        tracing::info!(section = title);
    }

    fn adding(&self, file: &str, size: u64) {
        tracing::debug!(file, size, "adding file");
    }

    fn extracting(&self, package: &str, instance_id: &str, current: u64, total: u64) {
        tracing::debug!(package, instance_id, current, total, "extracting");
    }

    fn removing(&self, package: &str, instance_id: &str) {
        tracing::info!(package, instance_id, "removing instance");
    }

    fn done(&self, package: &str, instance_id: &str, detail: &str) {
        tracing::info!(package, instance_id, detail);
    }

    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
}
