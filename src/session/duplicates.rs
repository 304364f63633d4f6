//! Duplicate guard: keeps concurrent and historical jobs from fetching
//! the same artifact twice.
//!
//! Three layers, cheapest first: the in-process job cache, the on-disk
//! artifact (when skipping existing files is enabled), and the
//! persistent duplicate index. Any hit unwinds with [`JobSignal::Skip`]
//! naming the competing source.

use tracing::debug;

use crate::signal::JobSignal;

use super::JobSession;

/// A historical job recorded under the same folder and name.
#[derive(Debug, Clone)]
pub struct DuplicateRecord {
    /// Identifier of the recorded job.
    pub job_id: u64,
    /// Source that produced it.
    pub source: String,
}

/// Persistent duplicate lookup collaborator.
pub trait DuplicateIndex: Send + Sync {
    /// Jobs other than `job_id` recorded with this folder and name.
    fn find_duplicates(&self, job_id: u64, folder: &str, name: &str) -> Vec<DuplicateRecord>;
}

/// Index that knows no duplicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDuplicateIndex;

impl DuplicateIndex for NullDuplicateIndex {
    fn find_duplicates(&self, _job_id: u64, _folder: &str, _name: &str) -> Vec<DuplicateRecord> {
        Vec::new()
    }
}

impl JobSession {
    /// Skips this job when another job already owns its artifact.
    ///
    /// A tracked job with the same name and folder triggers a skip when
    /// it is finished or mid-transfer; one that is merely waiting or
    /// starting only counts with `starting` set, where arrival order
    /// decides ownership. With `starting` and the skip-existing option,
    /// an on-disk artifact of at least the expected size also skips. A
    /// persistent index hit skips only while its artifact still exists.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Skip`] carrying the competing source name, or
    /// `"File exists"` for an on-disk hit.
    pub fn check_for_same_files(&mut self, starting: bool) -> Result<(), JobSignal> {
        let folder = self.job.package().folder.clone();
        let name = self.job.name();

        for other in self.ctx.jobs.snapshot() {
            if other.id() == self.job.id()
                || other.name() != name
                || other.package().folder != folder
            {
                continue;
            }
            let status = other.status();
            if status.is_active_transfer() || (starting && status.is_pending_start()) {
                return Err(JobSignal::skip(other.source()));
            }
        }

        let location = self.ctx.config.download_root.join(&folder).join(&name);

        if starting && self.ctx.config.skip_existing && location.is_file() {
            let on_disk = std::fs::metadata(&location).map(|m| m.len()).unwrap_or(0);
            if on_disk >= self.job.size() {
                return Err(JobSignal::skip("File exists"));
            }
        }

        let records = self
            .ctx
            .duplicates
            .find_duplicates(self.job.id(), &folder, &name);
        if let Some(record) = records.first() {
            if location.is_file() {
                return Err(JobSignal::skip(record.source.clone()));
            }
            debug!(
                job = self.job.id(),
                name = %name,
                "duplicate recorded but artifact missing, not skipping"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus, Package};
    use crate::testutil::{TestHarness, TransportScript};
    use std::sync::Arc;

    fn competitor(id: u64, name: &str, folder: &str, status: JobStatus) -> Arc<Job> {
        let job = Arc::new(Job::new(
            id,
            "https://mirror.example.com/file",
            name,
            0,
            "OtherSource",
            Arc::new(Package::new(folder)),
        ));
        job.set_status(status);
        job
    }

    struct FixedIndex(Vec<DuplicateRecord>);

    impl DuplicateIndex for FixedIndex {
        fn find_duplicates(&self, _job_id: u64, _folder: &str, _name: &str) -> Vec<DuplicateRecord> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_active_transfer_always_skips() {
        let harness = TestHarness::new(TransportScript::default());
        harness
            .ctx()
            .jobs
            .insert(competitor(2, "archive.bin", "pkg", JobStatus::Downloading));
        let mut session = harness.session();

        let signal = session.check_for_same_files(false).unwrap_err();
        assert_eq!(signal, JobSignal::skip("OtherSource"));
    }

    #[tokio::test]
    async fn test_pending_competitor_only_counts_when_starting() {
        let harness = TestHarness::new(TransportScript::default());
        harness
            .ctx()
            .jobs
            .insert(competitor(2, "archive.bin", "pkg", JobStatus::Waiting));
        let mut session = harness.session();

        session.check_for_same_files(false).unwrap();
        let signal = session.check_for_same_files(true).unwrap_err();
        assert_eq!(signal, JobSignal::skip("OtherSource"));
    }

    #[tokio::test]
    async fn test_different_name_or_folder_never_collides() {
        let harness = TestHarness::new(TransportScript::default());
        harness
            .ctx()
            .jobs
            .insert(competitor(2, "other.bin", "pkg", JobStatus::Downloading));
        harness
            .ctx()
            .jobs
            .insert(competitor(3, "archive.bin", "elsewhere", JobStatus::Downloading));
        let mut session = harness.session();

        session.check_for_same_files(true).unwrap();
    }

    #[tokio::test]
    async fn test_skip_existing_requires_full_size_on_disk() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.configure(|c| c.skip_existing = true);
        harness.job.set_size(1000);
        let location = harness.ctx().config.download_root.join("pkg");
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(location.join("archive.bin"), vec![0u8; 400]).unwrap();
        let mut session = harness.session();

        // Partial artifact on disk does not skip.
        session.check_for_same_files(true).unwrap();

        std::fs::write(location.join("archive.bin"), vec![0u8; 1000]).unwrap();
        let signal = session.check_for_same_files(true).unwrap_err();
        assert_eq!(signal, JobSignal::skip("File exists"));
    }

    #[tokio::test]
    async fn test_skip_existing_ignored_when_not_starting() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.configure(|c| c.skip_existing = true);
        let location = harness.ctx().config.download_root.join("pkg");
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(location.join("archive.bin"), vec![0u8; 10]).unwrap();
        let mut session = harness.session();

        session.check_for_same_files(false).unwrap();
    }

    #[tokio::test]
    async fn test_index_hit_skips_only_while_artifact_exists() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.set_duplicates(Arc::new(FixedIndex(vec![DuplicateRecord {
            job_id: 7,
            source: "RecordedSource".to_string(),
        }])));
        let mut session = harness.session();

        // Recorded duplicate whose artifact is gone: no skip.
        session.check_for_same_files(false).unwrap();

        let location = harness.ctx().config.download_root.join("pkg");
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(location.join("archive.bin"), b"x").unwrap();
        let signal = session.check_for_same_files(false).unwrap_err();
        assert_eq!(signal, JobSignal::skip("RecordedSource"));
    }
}
