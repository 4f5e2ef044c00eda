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

use super::{
    BlockDevice, ChildExit, FsUsage, Handshake, NetworkAttachment, Platform, SandboxSpec,
    SpawnedChild,
};
use crate::services::upload::framing;
use nix::fcntl;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::stat::Mode;
use nix::sys::statvfs::statvfs;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, close, dup2, execvpe, mkfifo, setgid, setsid, sethostname, setuid, Gid, Pid, Uid};
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

/// Host directories bind-mounted read-only into every sandbox so that
/// ordinary binaries resolve.
const SYSTEM_MOUNTS: &[&str] = &["bin", "sbin", "usr", "lib", "lib64", "etc"];

const CHILD_STACK_SIZE: usize = 1024 * 1024;

const FIFO_OPEN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        LinuxPlatform
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn nix_err(error: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(error as i32)
}

fn run_command(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(io::Error::other(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

struct PipeHandshake {
    ready_read: File,
    go_write: File,
}

impl Handshake for PipeHandshake {
    fn wait_ready(&mut self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        let n = self.ready_read.read(&mut byte)?;
        if n == 1 {
            Ok(())
        } else {
            Err(io::Error::other("child exited before signalling readiness"))
        }
    }

    fn send_go(&mut self) -> io::Result<()> {
        self.go_write.write_all(&[b'g'])?;
        self.go_write.flush()
    }
}

struct ChildFds {
    stdout_write: RawFd,
    stderr_write: RawFd,
    ready_write: RawFd,
    go_read: RawFd,
    parent_ends: Vec<RawFd>,
}

fn bind_mount(source: &Path, target: &Path, read_only: bool) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
    }
    Ok(())
}

/// Runs inside the cloned child, in fresh mount/pid/uts (and possibly
/// net) namespaces. Never returns on success: it execs the job.
fn setup_and_exec(spec: &SandboxSpec, fds: &ChildFds) -> io::Result<Infallible> {
    setsid().map_err(nix_err)?;

    // stdin from /dev/null, stdout/stderr into the captured pipes.
    let devnull = OpenOptions::new().read(true).open("/dev/null")?;
    dup2(devnull.as_raw_fd(), 0).map_err(nix_err)?;
    dup2(fds.stdout_write, 1).map_err(nix_err)?;
    dup2(fds.stderr_write, 2).map_err(nix_err)?;
    let _ = close(fds.stdout_write);
    let _ = close(fds.stderr_write);
    for fd in &fds.parent_ends {
        let _ = close(*fd);
    }

    // Stop mount events from propagating back to the host, then turn
    // the prepared root into a mount point of its own.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(nix_err)?;
    bind_mount(&spec.root_dir, &spec.root_dir, false).map_err(nix_err)?;

    for dir in SYSTEM_MOUNTS {
        let source = Path::new("/").join(dir);
        if !source.exists() {
            continue;
        }
        let target = spec.root_dir.join(dir);
        std::fs::create_dir_all(&target)?;
        bind_mount(&source, &target, true).map_err(nix_err)?;
    }

    if let Some(runtime) = &spec.runtime_mount {
        let target = spec.root_dir.join("runtime");
        std::fs::create_dir_all(&target)?;
        bind_mount(runtime, &target, true).map_err(nix_err)?;
    }

    for (name, source) in &spec.volume_mounts {
        let target = spec.root_dir.join("volumes").join(name);
        std::fs::create_dir_all(&target)?;
        bind_mount(source, &target, false).map_err(nix_err)?;
    }

    let short_id = spec.job_id.0.simple().to_string();
    sethostname(format!("joblet-{}", &short_id[..8])).map_err(nix_err)?;

    chroot(&spec.root_dir).map_err(nix_err)?;
    chdir("/work").map_err(nix_err)?;

    std::fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(nix_err)?;
    std::fs::create_dir_all("/tmp")?;
    mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(nix_err)?;

    // Drain the upload stream into the workspace before reporting
    // readiness; the streamer on the parent side unblocks the open.
    if spec.upload_pipe.is_some() {
        let mut reader = OpenOptions::new().read(true).open("/.upload.pipe")?;
        framing::apply_frames(&mut reader, Path::new("/work"))?;
        drop(reader);
        let _ = std::fs::remove_file("/.upload.pipe");
    }

    if let Some((uid, gid)) = spec.run_as {
        setgid(Gid::from_raw(gid)).map_err(nix_err)?;
        setuid(Uid::from_raw(uid)).map_err(nix_err)?;
    }

    // Ready/go handshake: the parent places us into the cgroup between
    // these two bytes.
    let mut ready_file = unsafe { File::from_raw_fd(fds.ready_write) };
    ready_file.write_all(b"r")?;
    ready_file.flush()?;
    let mut go_file = unsafe { File::from_raw_fd(fds.go_read) };
    let mut go = [0u8; 1];
    if go_file.read(&mut go)? != 1 {
        return Err(io::Error::other("parent closed the go pipe"));
    }
    drop(go_file);
    drop(ready_file);

    let mut env: Vec<(String, String)> = spec.env.clone().into_iter().collect();
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push((
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
        ));
    }
    if spec.runtime_mount.is_some() {
        for (key, value) in env.iter_mut() {
            if key == "PATH" {
                *value = format!("/runtime/bin:{value}");
            }
        }
        env.push(("JOBLET_RUNTIME".to_string(), "/runtime".to_string()));
    }
    env.push(("JOBLET_JOB_ID".to_string(), spec.job_id.to_string()));

    let command = CString::new(spec.command.as_str())?;
    let mut argv = vec![CString::new(spec.command.as_str())?];
    for arg in &spec.args {
        argv.push(CString::new(arg.as_str())?);
    }
    let envp: Vec<CString> = env
        .into_iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()?;

    execvpe(&command, &argv, &envp).map_err(nix_err)?;
    unreachable!("execvpe returned without an error")
}

fn child_main(spec: &SandboxSpec, fds: &ChildFds) -> isize {
    match setup_and_exec(spec, fds) {
        Ok(never) => match never {},
        Err(err) => {
            // stderr is already wired to the captured pipe.
            eprintln!("sandbox setup failed: {err}");
            127
        }
    }
}

impl Platform for LinuxPlatform {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn create_sparse_file(&self, path: &Path, size_bytes: u64) -> io::Result<()> {
        let file = File::create(path)?;
        file.set_len(size_bytes)
    }

    fn create_fifo(&self, path: &Path, mode: u32) -> io::Result<()> {
        mkfifo(path, Mode::from_bits_truncate(mode)).map_err(nix_err)
    }

    fn open_fifo_writer(&self, path: &Path) -> io::Result<Box<dyn io::Write + Send>> {
        use std::os::unix::fs::OpenOptionsExt;
        // A plain open would block until the reader side appears; if
        // the child died during sandbox setup that is forever. Poll
        // with O_NONBLOCK under a deadline instead.
        let deadline = std::time::Instant::now() + FIFO_OPEN_TIMEOUT;
        let file = loop {
            match OpenOptions::new()
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => break file,
                Err(err) if err.raw_os_error() == Some(nix::libc::ENXIO) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no reader opened the upload pipe",
                        ));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(err) => return Err(err),
            }
        };
        // Writes must block again once the reader is attached.
        fcntl::fcntl(file.as_raw_fd(), fcntl::FcntlArg::F_SETFL(fcntl::OFlag::empty()))
            .map_err(nix_err)?;
        Ok(Box::new(file))
    }

    fn fs_usage(&self, path: &Path) -> io::Result<FsUsage> {
        let stat = statvfs(path).map_err(nix_err)?;
        let fragment = stat.fragment_size() as u64;
        Ok(FsUsage {
            total_bytes: stat.blocks() as u64 * fragment,
            available_bytes: stat.blocks_available() as u64 * fragment,
        })
    }

    fn mount_tmpfs(&self, target: &Path, size_bytes: u64) -> io::Result<()> {
        let data = format!("size={size_bytes}");
        mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(nix_err)
    }

    fn mount_device(&self, device: &Path, target: &Path) -> io::Result<()> {
        mount(
            Some(device),
            target,
            Some("ext4"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(nix_err)
    }

    fn unmount(&self, target: &Path, force: bool) -> io::Result<()> {
        let flags = if force {
            MntFlags::MNT_FORCE | MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(target, flags).map_err(nix_err)
    }

    fn mounted_targets(&self) -> io::Result<Vec<PathBuf>> {
        let contents = std::fs::read_to_string("/proc/mounts")?;
        Ok(contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(PathBuf::from)
            .collect())
    }

    fn attach_loop_device(&self, backing_file: &Path) -> io::Result<PathBuf> {
        let device = run_command(
            "losetup",
            &["--find", "--show", &backing_file.to_string_lossy()],
        )?;
        if device.is_empty() {
            return Err(io::Error::other("losetup returned no device"));
        }
        Ok(PathBuf::from(device))
    }

    fn detach_loop_device(&self, device: &Path) -> io::Result<()> {
        run_command("losetup", &["-d", &device.to_string_lossy()]).map(|_| ())
    }

    fn make_ext4(&self, device: &Path) -> io::Result<()> {
        run_command("mkfs.ext4", &["-q", "-F", &device.to_string_lossy()]).map(|_| ())
    }

    fn online_cpus(&self) -> io::Result<Vec<u32>> {
        let contents = std::fs::read_to_string("/sys/devices/system/cpu/online")?;
        let cores = joblet_common::model::limits::CpuCoreSet::from_str(contents.trim())
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(cores.iter().collect())
    }

    fn block_devices(&self) -> io::Result<Vec<BlockDevice>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir("/sys/block")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                continue;
            }
            let dev = std::fs::read_to_string(entry.path().join("dev"))?;
            if let Some((major, minor)) = dev.trim().split_once(':') {
                if let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) {
                    devices.push(BlockDevice { name, major, minor });
                }
            }
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    fn spawn_sandboxed(&self, spec: &SandboxSpec) -> io::Result<SpawnedChild> {
        let (stdout_read, stdout_write) = nix::unistd::pipe().map_err(nix_err)?;
        let (stderr_read, stderr_write) = nix::unistd::pipe().map_err(nix_err)?;
        let (ready_read, ready_write) = nix::unistd::pipe().map_err(nix_err)?;
        let (go_read, go_write) = nix::unistd::pipe().map_err(nix_err)?;

        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS;
        if spec.network.needs_namespace() {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let fds = ChildFds {
            stdout_write: stdout_write.as_raw_fd(),
            stderr_write: stderr_write.as_raw_fd(),
            ready_write: ready_write.as_raw_fd(),
            go_read: go_read.as_raw_fd(),
            parent_ends: vec![
                stdout_read.as_raw_fd(),
                stderr_read.as_raw_fd(),
                ready_read.as_raw_fd(),
                go_write.as_raw_fd(),
            ],
        };

        let spec_for_child = spec.clone();
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let cb: Box<dyn FnMut() -> isize> =
            Box::new(move || child_main(&spec_for_child, &fds));

        let pid = unsafe {
            nix::sched::clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32))
        }
        .map_err(nix_err)?;

        // Parent: close the child's ends so EOF propagates.
        close_owned(stdout_write);
        close_owned(stderr_write);
        close_owned(ready_write);
        close_owned(go_read);

        Ok(SpawnedChild {
            pid: pid.as_raw() as u32,
            stdout: Box::new(File::from(stdout_read)),
            stderr: Box::new(File::from(stderr_read)),
            handshake: Box::new(PipeHandshake {
                ready_read: File::from(ready_read),
                go_write: File::from(go_write),
            }),
        })
    }

    fn kill_process_group(&self, pid: u32, force: bool) -> io::Result<()> {
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        killpg(Pid::from_raw(pid as i32), signal).map_err(nix_err)
    }

    fn wait_child(&self, pid: u32) -> io::Result<ChildExit> {
        loop {
            match waitpid(Pid::from_raw(pid as i32), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return Ok(ChildExit {
                        exit_code: Some(code),
                        signal: None,
                    })
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ChildExit {
                        exit_code: None,
                        signal: Some(signal as i32),
                    })
                }
                Ok(_) => continue,
                Err(nix::Error::EINTR) => continue,
                Err(err) => return Err(nix_err(err)),
            }
        }
    }

    fn process_exists(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn setup_job_network(&self, pid: u32, attachment: &NetworkAttachment) -> io::Result<()> {
        let pid_str = pid.to_string();
        match attachment {
            NetworkAttachment::Host | NetworkAttachment::None => Ok(()),
            NetworkAttachment::Isolated => {
                run_command(
                    "nsenter",
                    &["-t", &pid_str, "-n", "ip", "link", "set", "lo", "up"],
                )
                .map(|_| ())
            }
            NetworkAttachment::Bridged { bridge, allocation } => {
                let peer = format!("{}p", allocation.veth_host);
                run_command(
                    "ip",
                    &[
                        "link", "add", &allocation.veth_host, "type", "veth", "peer", "name",
                        &peer,
                    ],
                )?;
                run_command(
                    "ip",
                    &["link", "set", &allocation.veth_host, "master", bridge, "up"],
                )?;
                run_command("ip", &["link", "set", &peer, "netns", &pid_str])?;
                let ns = ["-t", pid_str.as_str(), "-n"];
                run_command(
                    "nsenter",
                    &[&ns[..], &["ip", "link", "set", &peer, "name", "eth0"]].concat(),
                )?;
                run_command(
                    "nsenter",
                    &[
                        &ns[..],
                        &[
                            "ip",
                            "link",
                            "set",
                            "eth0",
                            "address",
                            allocation.mac.as_str(),
                        ],
                    ]
                    .concat(),
                )?;
                let cidr = format!("{}/{}", allocation.ip, allocation.prefix_len);
                run_command(
                    "nsenter",
                    &[&ns[..], &["ip", "addr", "add", &cidr, "dev", "eth0"]].concat(),
                )?;
                run_command(
                    "nsenter",
                    &[&ns[..], &["ip", "link", "set", "eth0", "up"]].concat(),
                )?;
                run_command(
                    "nsenter",
                    &[&ns[..], &["ip", "link", "set", "lo", "up"]].concat(),
                )?;
                if let Some(gateway) = allocation.gateway {
                    let gw = gateway.to_string();
                    run_command(
                        "nsenter",
                        &[&ns[..], &["ip", "route", "add", "default", "via", &gw]].concat(),
                    )?;
                }
                Ok(())
            }
        }
    }

    fn teardown_job_network(&self, attachment: &NetworkAttachment) -> io::Result<()> {
        match attachment {
            NetworkAttachment::Bridged { allocation, .. } => {
                // The peer end disappears with the namespace; only the
                // host side can be left behind.
                match run_command("ip", &["link", "del", &allocation.veth_host]) {
                    Ok(_) => Ok(()),
                    Err(err) if err.to_string().contains("Cannot find device") => Ok(()),
                    Err(err) => Err(err),
                }
            }
            _ => Ok(()),
        }
    }
}

fn close_owned(fd: OwnedFd) {
    let raw = fd.into_raw_fd();
    let _ = close(raw);
}
