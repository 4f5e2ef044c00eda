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

pub mod fake;
pub mod linux;

use joblet_common::model::{JobId, JobNetworkAllocation};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// How a job's network namespace is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Share the host network namespace.
    Host,
    /// Fresh namespace with no interfaces at all.
    None,
    /// Fresh namespace with only loopback up.
    Isolated,
    /// Fresh namespace joined to a bridge through a veth pair.
    Bridged {
        bridge: String,
        allocation: JobNetworkAllocation,
    },
}

impl NetworkAttachment {
    pub fn needs_namespace(&self) -> bool {
        !matches!(self, NetworkAttachment::Host)
    }
}

/// Everything the child needs to enter its sandbox and exec.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub job_id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Prepared host directory that becomes the chroot root. Contains
    /// `work/` (cwd), `volumes/` and `runtime/` mount points.
    pub root_dir: PathBuf,
    /// Host paths bind-mounted read-write at `/volumes/<name>`.
    pub volume_mounts: Vec<(String, PathBuf)>,
    /// Host path bind-mounted read-only at `/runtime`.
    pub runtime_mount: Option<PathBuf>,
    pub network: NetworkAttachment,
    /// Fifo inside `root_dir`; the child drains it into `/work`
    /// before signalling readiness.
    pub upload_pipe: Option<PathBuf>,
    /// Drop privileges to this uid/gid after entering the sandbox.
    pub run_as: Option<(u32, u32)>,
}

/// Parent side of the ready/go handshake around cgroup placement.
pub trait Handshake: Send {
    /// Blocks until the child reports that its sandbox is set up.
    fn wait_ready(&mut self) -> io::Result<()>;
    /// Releases the child into exec.
    fn send_go(&mut self) -> io::Result<()>;
}

pub struct SpawnedChild {
    pub pid: u32,
    pub stdout: Box<dyn io::Read + Send>,
    pub stderr: Box<dyn io::Read + Send>,
    pub handshake: Box<dyn Handshake>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Shell-style exit code: signal deaths map to 128 + signo.
    pub fn code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

/// The single capability set the core depends on. Everything that
/// touches the kernel goes through this trait; tests swap in
/// [`fake::FakePlatform`].
pub trait Platform: Send + Sync {
    // Filesystem
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Non-recursive rmdir; the only removal cgroupfs accepts.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn exists(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn create_sparse_file(&self, path: &Path, size_bytes: u64) -> io::Result<()>;
    fn create_fifo(&self, path: &Path, mode: u32) -> io::Result<()>;
    /// Opens the writer end of a fifo; on Linux this blocks until the
    /// reader side is opened, so call it from a blocking worker.
    fn open_fifo_writer(&self, path: &Path) -> io::Result<Box<dyn io::Write + Send>>;
    fn fs_usage(&self, path: &Path) -> io::Result<FsUsage>;

    // Mounts
    fn mount_tmpfs(&self, target: &Path, size_bytes: u64) -> io::Result<()>;
    fn mount_device(&self, device: &Path, target: &Path) -> io::Result<()>;
    fn unmount(&self, target: &Path, force: bool) -> io::Result<()>;
    fn mounted_targets(&self) -> io::Result<Vec<PathBuf>>;

    // Loop devices
    fn attach_loop_device(&self, backing_file: &Path) -> io::Result<PathBuf>;
    fn detach_loop_device(&self, device: &Path) -> io::Result<()>;
    fn make_ext4(&self, device: &Path) -> io::Result<()>;

    // Topology
    fn online_cpus(&self) -> io::Result<Vec<u32>>;
    fn block_devices(&self) -> io::Result<Vec<BlockDevice>>;

    // Processes
    fn spawn_sandboxed(&self, spec: &SandboxSpec) -> io::Result<SpawnedChild>;
    fn kill_process_group(&self, pid: u32, force: bool) -> io::Result<()>;
    /// Blocks until the child exits; run it on a blocking worker.
    fn wait_child(&self, pid: u32) -> io::Result<ChildExit>;
    fn process_exists(&self, pid: u32) -> bool;

    // Network plumbing for bridged attachments
    fn setup_job_network(&self, pid: u32, attachment: &NetworkAttachment) -> io::Result<()>;
    fn teardown_job_network(&self, attachment: &NetworkAttachment) -> io::Result<()>;
}
