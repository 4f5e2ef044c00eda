// Copyright 2024-2025 Joblet Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The upload pipeline: session validation, fifo transport and the
//! streamer task feeding the sandboxed child before exec.

pub mod framing;

use crate::metrics;
use crate::platform::Platform;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::limits::MemorySize;
use joblet_common::model::{JobId, UploadEntry, UploadKind};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the fifo inside the sandbox root; the child sees it at
/// `/.upload.pipe` after chroot.
pub const PIPE_NAME: &str = ".upload.pipe";

/// A validated set of uploads bound to one job.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub job_id: JobId,
    /// Directories in dependency order, then files in client order.
    pub entries: Vec<UploadEntry>,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

/// Owns the fifo path; removal is guaranteed on close (or drop).
pub struct UploadTransport {
    platform: Arc<dyn Platform>,
    path: PathBuf,
    closed: AtomicBool,
}

impl UploadTransport {
    pub fn pipe_path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.platform.remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "Failed to remove upload pipe");
            }
        }
    }
}

impl Drop for UploadTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_relative_path(path: &str) -> Result<(), JobletError> {
    if path.is_empty() || path.len() > 4096 {
        return Err(JobletError::validation(format!(
            "upload path must be 1..=4096 characters: {path:?}"
        )));
    }
    if path.contains('\0') {
        return Err(JobletError::validation("upload path contains NUL"));
    }
    let parsed = Path::new(path);
    if parsed.is_absolute() {
        return Err(JobletError::validation(format!(
            "upload path must be relative: {path:?}"
        )));
    }
    for component in parsed.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(JobletError::validation(format!(
                "upload path escapes the workspace: {path:?}"
            )));
        }
    }
    Ok(())
}

#[async_trait]
pub trait UploadService: Send + Sync {
    /// Validates entries against the job's memory-derived byte bound
    /// and orders them so parents exist before their contents.
    fn prepare(
        &self,
        job_id: JobId,
        entries: Vec<UploadEntry>,
        memory_limit: MemorySize,
    ) -> Result<UploadSession, JobletError>;

    /// Creates the named pipe inside the sandbox root.
    fn provision(
        &self,
        session: &UploadSession,
        root_dir: &Path,
    ) -> Result<UploadTransport, JobletError>;

    /// Writes the framed stream; blocks until the child has opened the
    /// reader, so it runs on a blocking worker. Returns payload bytes.
    async fn stream(
        &self,
        session: UploadSession,
        transport: Arc<UploadTransport>,
    ) -> Result<u64, JobletError>;
}

pub struct UploadServiceDefault {
    platform: Arc<dyn Platform>,
}

impl UploadServiceDefault {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        UploadServiceDefault { platform }
    }
}

#[async_trait]
impl UploadService for UploadServiceDefault {
    fn prepare(
        &self,
        job_id: JobId,
        entries: Vec<UploadEntry>,
        memory_limit: MemorySize,
    ) -> Result<UploadSession, JobletError> {
        let max_bytes = if memory_limit.is_unlimited() {
            u64::MAX
        } else {
            memory_limit.as_bytes()
        };

        let mut total_bytes = 0u64;
        for entry in &entries {
            validate_relative_path(&entry.relative_path)
                .map_err(|err| err.with_context("job_id", job_id))?;
            total_bytes += entry.data.len() as u64;
        }
        if total_bytes > max_bytes {
            return Err(JobletError::validation(format!(
                "uploads total {total_bytes} bytes, exceeding the {max_bytes} byte bound"
            ))
            .with_context("job_id", job_id));
        }

        // Directories first, shallow to deep, so every file write finds
        // its parent; files keep the client's order.
        let mut directories: Vec<UploadEntry> = entries
            .iter()
            .filter(|e| e.kind == UploadKind::Directory)
            .cloned()
            .collect();
        directories.sort_by_key(|e| Path::new(&e.relative_path).components().count());
        let files = entries
            .into_iter()
            .filter(|e| e.kind == UploadKind::File);
        let ordered: Vec<UploadEntry> = directories.into_iter().chain(files).collect();

        Ok(UploadSession {
            job_id,
            entries: ordered,
            total_bytes,
            max_bytes,
        })
    }

    fn provision(
        &self,
        session: &UploadSession,
        root_dir: &Path,
    ) -> Result<UploadTransport, JobletError> {
        let path = root_dir.join(PIPE_NAME);
        self.platform
            .create_fifo(&path, 0o600)
            .map_err(|err| JobletError::from(err).with_context("job_id", session.job_id))?;
        Ok(UploadTransport {
            platform: self.platform.clone(),
            path,
            closed: AtomicBool::new(false),
        })
    }

    async fn stream(
        &self,
        session: UploadSession,
        transport: Arc<UploadTransport>,
    ) -> Result<u64, JobletError> {
        let platform = self.platform.clone();
        let path = transport.pipe_path().to_path_buf();
        let job_id = session.job_id;
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = platform.open_fifo_writer(&path)?;
            framing::write_frames(&mut writer, &session.entries)
        })
        .await
        .map_err(|err| JobletError::infrastructure(format!("upload streamer panicked: {err}")))?;

        match result {
            Ok(bytes) => {
                metrics::record_upload_bytes(bytes);
                debug!(job_id = %job_id, bytes, "Upload stream complete");
                transport.close();
                Ok(bytes)
            }
            Err(err) => {
                transport.close();
                Err(JobletError::from(err)
                    .with_context("job_id", job_id)
                    .with_context("operation", "upload_stream"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use joblet_common::error::ErrorKind;
    use test_r::test;

    fn service() -> (Arc<FakePlatform>, UploadServiceDefault) {
        let platform = Arc::new(FakePlatform::new());
        (platform.clone(), UploadServiceDefault::new(platform))
    }

    #[test]
    fn traversal_and_absolute_paths_are_rejected() {
        let (_, service) = service();
        for bad in ["../evil", "a/../../b", "/etc/passwd", ""] {
            let result = service.prepare(
                JobId::new_v4(),
                vec![UploadEntry::file(bad, 0o644, b"x".to_vec())],
                MemorySize(0),
            );
            assert_eq!(result.unwrap_err().kind, ErrorKind::Validation, "{bad:?}");
        }
    }

    #[test]
    fn total_size_is_bounded_by_the_memory_limit() {
        let (_, service) = service();
        let entries = vec![UploadEntry::file("big.bin", 0o644, vec![0u8; 128])];
        let result = service.prepare(JobId::new_v4(), entries.clone(), MemorySize(64));
        assert_eq!(result.unwrap_err().kind, ErrorKind::Validation);

        let session = service
            .prepare(JobId::new_v4(), entries, MemorySize(256))
            .unwrap();
        assert_eq!(session.total_bytes, 128);
    }

    #[test]
    fn directories_are_ordered_before_files_shallow_first() {
        let (_, service) = service();
        let session = service
            .prepare(
                JobId::new_v4(),
                vec![
                    UploadEntry::file("a/b/file.txt", 0o644, b"x".to_vec()),
                    UploadEntry::directory("a/b", 0o755),
                    UploadEntry::directory("a", 0o755),
                ],
                MemorySize(0),
            )
            .unwrap();
        let order: Vec<&str> = session
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(order, vec!["a", "a/b", "a/b/file.txt"]);
    }

    #[test]
    async fn streamer_frames_the_session_through_the_fifo() {
        let (platform, service) = service();
        let root = Path::new("/var/lib/joblet/jobs/j1");
        platform.create_dir_all(root).unwrap();

        let session = service
            .prepare(
                JobId::new_v4(),
                vec![UploadEntry::file("hello.txt", 0o644, b"hello".to_vec())],
                MemorySize(0),
            )
            .unwrap();
        let transport = Arc::new(service.provision(&session, root).unwrap());
        let entries = session.entries.clone();
        let bytes = service.stream(session, transport.clone()).await.unwrap();
        assert_eq!(bytes, 5);

        let wire = platform.fifo_contents(&root.join(PIPE_NAME));
        let parsed = framing::read_frames(&mut wire.as_slice()).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    async fn transport_removes_the_pipe_on_close() {
        let (platform, service) = service();
        let root = Path::new("/var/lib/joblet/jobs/j2");
        platform.create_dir_all(root).unwrap();
        let session = service
            .prepare(JobId::new_v4(), vec![], MemorySize(0))
            .unwrap();
        let transport = service.provision(&session, root).unwrap();
        assert!(platform.exists(&root.join(PIPE_NAME)));
        transport.close();
        assert!(!platform.exists(&root.join(PIPE_NAME)));
    }
}
