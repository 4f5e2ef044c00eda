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

//! Recording in-memory implementation of [`Platform`] used by tests.

use super::{
    BlockDevice, ChildExit, FsUsage, Handshake, NetworkAttachment, Platform, SandboxSpec,
    SpawnedChild,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Scripted behavior of the next spawned child.
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `Some` exits immediately with that status; `None` runs until
    /// killed.
    pub exit: Option<ChildExit>,
    /// When set, graceful stop is ignored and only SIGKILL ends the
    /// child.
    pub ignore_sigterm: bool,
}

impl Default for ChildPlan {
    fn default() -> Self {
        ChildPlan {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: Some(ChildExit {
                exit_code: Some(0),
                signal: None,
            }),
            ignore_sigterm: false,
        }
    }
}

impl ChildPlan {
    pub fn succeeding_with_stdout(stdout: impl Into<Vec<u8>>) -> Self {
        ChildPlan {
            stdout: stdout.into(),
            ..ChildPlan::default()
        }
    }

    pub fn exiting_with(code: i32) -> Self {
        ChildPlan {
            exit: Some(ChildExit {
                exit_code: Some(code),
                signal: None,
            }),
            ..ChildPlan::default()
        }
    }

    pub fn running_until_killed() -> Self {
        ChildPlan {
            exit: None,
            ..ChildPlan::default()
        }
    }
}

struct FakeChild {
    exit_tx: mpsc::Sender<ChildExit>,
    exit_rx: Option<mpsc::Receiver<ChildExit>>,
    ignore_sigterm: bool,
    done: bool,
}

#[derive(Default)]
struct FakeState {
    files: HashMap<PathBuf, Vec<u8>>,
    dirs: HashSet<PathBuf>,
    modes: HashMap<PathBuf, u32>,
    mounts: HashSet<PathBuf>,
    fifos: HashSet<PathBuf>,
    fifo_writes: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    loop_devices: HashMap<PathBuf, PathBuf>,
    next_loop: u32,
    operations: Vec<String>,
    fail_ops: HashSet<String>,
    spawned: Vec<SandboxSpec>,
    plans: VecDeque<ChildPlan>,
    children: HashMap<u32, FakeChild>,
    next_pid: u32,
}

pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        let mut state = FakeState {
            next_pid: 1000,
            ..FakeState::default()
        };
        state.dirs.insert(PathBuf::from("/"));
        FakePlatform {
            state: Mutex::new(state),
        }
    }

    /// Scripts the behavior of the next spawned child.
    pub fn queue_child(&self, plan: ChildPlan) {
        self.state.lock().unwrap().plans.push_back(plan);
    }

    /// Forces every future call of the named operation to fail.
    pub fn fail_operation(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_ops.clear();
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn spawned_specs(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn file_contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn mode_of(&self, path: &Path) -> Option<u32> {
        self.state.lock().unwrap().modes.get(path).copied()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().unwrap().mounts.contains(path)
    }

    pub fn loop_device_count(&self) -> usize {
        self.state.lock().unwrap().loop_devices.len()
    }

    /// Everything written through the fifo writer for `path`.
    pub fn fifo_contents(&self, path: &Path) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .fifo_writes
            .get(path)
            .map(|buf| buf.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn record(&self, op: &str, detail: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(format!("{op} {detail}"));
        if state.fail_ops.contains(op) {
            Err(io::Error::other(format!("forced failure of {op}")))
        } else {
            Ok(())
        }
    }
}

struct ImmediateHandshake;

impl Handshake for ImmediateHandshake {
    fn wait_ready(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn send_go(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ancestors_present(dirs: &HashSet<PathBuf>, path: &Path) -> bool {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => true,
        Some(parent) => dirs.contains(parent),
        None => true,
    }
}

impl Platform for FakePlatform {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.record("create_dir_all", &path.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.record("remove_dir", &path.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        if !state.dirs.remove(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.record("remove_dir_all", &path.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        state.dirs.retain(|dir| !dir.starts_with(path));
        state.files.retain(|file, _| !file.starts_with(path));
        state.fifos.retain(|fifo| !fifo.starts_with(path));
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.record("remove_file", &path.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        if state.files.remove(path).is_none() && !state.fifos.remove(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.record("write_file", &path.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        if !ancestors_present(&state.dirs, path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent directory does not exist",
            ));
        }
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.record("read_file", &path.display().to_string())?;
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.dirs.contains(path) || state.fifos.contains(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.record("list_dir", &path.display().to_string())?;
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        let mut entries: Vec<PathBuf> = state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|entry| entry.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.record("set_mode", &format!("{} {mode:o}", path.display()))?;
        let mut state = self.state.lock().unwrap();
        state.modes.insert(path.to_path_buf(), mode);
        Ok(())
    }

    fn create_sparse_file(&self, path: &Path, size_bytes: u64) -> io::Result<()> {
        self.record(
            "create_sparse_file",
            &format!("{} {size_bytes}", path.display()),
        )?;
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    fn create_fifo(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.record("create_fifo", &format!("{} {mode:o}", path.display()))?;
        let mut state = self.state.lock().unwrap();
        state.fifos.insert(path.to_path_buf());
        state
            .fifo_writes
            .insert(path.to_path_buf(), Arc::new(Mutex::new(Vec::new())));
        Ok(())
    }

    fn open_fifo_writer(&self, path: &Path) -> io::Result<Box<dyn io::Write + Send>> {
        self.record("open_fifo_writer", &path.display().to_string())?;
        let state = self.state.lock().unwrap();
        let buffer = state
            .fifo_writes
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such fifo"))?;
        Ok(Box::new(SharedVecWriter(buffer)))
    }

    fn fs_usage(&self, path: &Path) -> io::Result<FsUsage> {
        self.record("fs_usage", &path.display().to_string())?;
        Ok(FsUsage {
            total_bytes: 1024 * 1024 * 1024,
            available_bytes: 512 * 1024 * 1024,
        })
    }

    fn mount_tmpfs(&self, target: &Path, size_bytes: u64) -> io::Result<()> {
        self.record("mount_tmpfs", &format!("{} {size_bytes}", target.display()))?;
        let mut state = self.state.lock().unwrap();
        state.mounts.insert(target.to_path_buf());
        Ok(())
    }

    fn mount_device(&self, device: &Path, target: &Path) -> io::Result<()> {
        self.record(
            "mount_device",
            &format!("{} {}", device.display(), target.display()),
        )?;
        let mut state = self.state.lock().unwrap();
        state.mounts.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool) -> io::Result<()> {
        self.record("unmount", &format!("{} force={force}", target.display()))?;
        let mut state = self.state.lock().unwrap();
        if !state.mounts.remove(target) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not mounted"));
        }
        Ok(())
    }

    fn mounted_targets(&self) -> io::Result<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        Ok(state.mounts.iter().cloned().collect())
    }

    fn attach_loop_device(&self, backing_file: &Path) -> io::Result<PathBuf> {
        self.record("attach_loop_device", &backing_file.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state
            .loop_devices
            .insert(device.clone(), backing_file.to_path_buf());
        Ok(device)
    }

    fn detach_loop_device(&self, device: &Path) -> io::Result<()> {
        self.record("detach_loop_device", &device.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        if state.loop_devices.remove(device).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such loop device"));
        }
        Ok(())
    }

    fn make_ext4(&self, device: &Path) -> io::Result<()> {
        self.record("make_ext4", &device.display().to_string())
    }

    fn online_cpus(&self) -> io::Result<Vec<u32>> {
        Ok((0..8).collect())
    }

    fn block_devices(&self) -> io::Result<Vec<BlockDevice>> {
        Ok(vec![BlockDevice {
            name: "sda".to_string(),
            major: 8,
            minor: 0,
        }])
    }

    fn spawn_sandboxed(&self, spec: &SandboxSpec) -> io::Result<SpawnedChild> {
        self.record("spawn_sandboxed", &spec.job_id.to_string())?;
        let mut state = self.state.lock().unwrap();
        let plan = state.plans.pop_front().unwrap_or_default();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.spawned.push(spec.clone());

        let (exit_tx, exit_rx) = mpsc::channel();
        if let Some(exit) = plan.exit {
            let _ = exit_tx.send(exit);
        }
        state.children.insert(
            pid,
            FakeChild {
                exit_tx,
                exit_rx: Some(exit_rx),
                ignore_sigterm: plan.ignore_sigterm,
                done: plan.exit.is_some(),
            },
        );

        Ok(SpawnedChild {
            pid,
            stdout: Box::new(Cursor::new(plan.stdout)),
            stderr: Box::new(Cursor::new(plan.stderr)),
            handshake: Box::new(ImmediateHandshake),
        })
    }

    fn kill_process_group(&self, pid: u32, force: bool) -> io::Result<()> {
        self.record("kill_process_group", &format!("{pid} force={force}"))?;
        let mut state = self.state.lock().unwrap();
        let child = state
            .children
            .get_mut(&pid)
            .ok_or_else(|| io::Error::other("no such process"))?;
        if child.done {
            return Ok(());
        }
        if !force && child.ignore_sigterm {
            return Ok(());
        }
        child.done = true;
        let _ = child.exit_tx.send(ChildExit {
            exit_code: None,
            signal: Some(if force { 9 } else { 15 }),
        });
        Ok(())
    }

    fn wait_child(&self, pid: u32) -> io::Result<ChildExit> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            let child = state
                .children
                .get_mut(&pid)
                .ok_or_else(|| io::Error::other("no such child"))?;
            child
                .exit_rx
                .take()
                .ok_or_else(|| io::Error::other("child already waited on"))?
        };
        let exit = rx
            .recv()
            .map_err(|_| io::Error::other("child channel closed"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(child) = state.children.get_mut(&pid) {
            child.done = true;
        }
        Ok(exit)
    }

    fn process_exists(&self, pid: u32) -> bool {
        let state = self.state.lock().unwrap();
        state
            .children
            .get(&pid)
            .map(|child| !child.done)
            .unwrap_or(false)
    }

    fn setup_job_network(&self, pid: u32, attachment: &NetworkAttachment) -> io::Result<()> {
        self.record("setup_job_network", &format!("{pid} {attachment:?}"))
    }

    fn teardown_job_network(&self, attachment: &NetworkAttachment) -> io::Result<()> {
        self.record("teardown_job_network", &format!("{attachment:?}"))
    }
}
