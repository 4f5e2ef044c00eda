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

//! Pipe framing between the upload streamer and the sandboxed child:
//! `(kind:u8, path_len:u16, path, mode:u32, length:u64, data)` records,
//! little-endian, terminated by a `kind=END` record.

use joblet_common::model::{UploadEntry, UploadKind};
use std::io;
use std::io::{Read, Write};
use std::path::{Component, Path};

pub const KIND_END: u8 = 0;
pub const KIND_FILE: u8 = 1;
pub const KIND_DIRECTORY: u8 = 2;

const MAX_PATH_LEN: usize = u16::MAX as usize;

pub fn write_frame<W: Write>(writer: &mut W, entry: &UploadEntry) -> io::Result<()> {
    let path = entry.relative_path.as_bytes();
    if path.len() > MAX_PATH_LEN {
        return Err(io::Error::other("upload path too long for framing"));
    }
    let kind = match entry.kind {
        UploadKind::File => KIND_FILE,
        UploadKind::Directory => KIND_DIRECTORY,
    };
    writer.write_all(&[kind])?;
    writer.write_all(&(path.len() as u16).to_le_bytes())?;
    writer.write_all(path)?;
    writer.write_all(&entry.mode.to_le_bytes())?;
    writer.write_all(&(entry.data.len() as u64).to_le_bytes())?;
    writer.write_all(&entry.data)?;
    Ok(())
}

/// Writes every entry followed by the END record and flushes.
pub fn write_frames<W: Write>(writer: &mut W, entries: &[UploadEntry]) -> io::Result<u64> {
    let mut payload_bytes = 0u64;
    for entry in entries {
        write_frame(writer, entry)?;
        payload_bytes += entry.data.len() as u64;
    }
    writer.write_all(&[KIND_END])?;
    writer.write_all(&0u16.to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(&0u64.to_le_bytes())?;
    writer.flush()?;
    Ok(payload_bytes)
}

fn read_header<R: Read>(reader: &mut R) -> io::Result<Option<(u8, String, u32, u64)>> {
    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    let mut path_len = [0u8; 2];
    reader.read_exact(&mut path_len)?;
    let path_len = u16::from_le_bytes(path_len) as usize;
    let mut path = vec![0u8; path_len];
    reader.read_exact(&mut path)?;
    let mut mode = [0u8; 4];
    reader.read_exact(&mut mode)?;
    let mut length = [0u8; 8];
    reader.read_exact(&mut length)?;
    if kind[0] == KIND_END {
        return Ok(None);
    }
    let path = String::from_utf8(path)
        .map_err(|_| io::Error::other("upload path is not valid UTF-8"))?;
    Ok(Some((
        kind[0],
        path,
        u32::from_le_bytes(mode),
        u64::from_le_bytes(length),
    )))
}

/// Parses a full stream back into entries; the test-facing inverse of
/// [`write_frames`].
pub fn read_frames<R: Read>(reader: &mut R) -> io::Result<Vec<UploadEntry>> {
    let mut entries = Vec::new();
    while let Some((kind, path, mode, length)) = read_header(reader)? {
        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data)?;
        let entry = match kind {
            KIND_FILE => UploadEntry::file(path, mode, data),
            KIND_DIRECTORY => UploadEntry::directory(path, mode),
            other => {
                return Err(io::Error::other(format!(
                    "unknown upload frame kind {other}"
                )))
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn safe_join(root: &Path, relative: &str) -> io::Result<std::path::PathBuf> {
    let relative = Path::new(relative);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(io::Error::other(format!(
                    "upload path escapes the workspace: {relative:?}"
                )))
            }
        }
    }
    Ok(root.join(relative))
}

/// Child-side ingest: applies records to `root` strictly in stream
/// order, setting each entry's permissions before the next one starts.
pub fn apply_frames<R: Read>(reader: &mut R, root: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    while let Some((kind, path, mode, length)) = read_header(reader)? {
        let target = safe_join(root, &path)?;
        match kind {
            KIND_DIRECTORY => {
                std::fs::create_dir_all(&target)?;
                let mut remaining = length;
                let mut sink = [0u8; 4096];
                while remaining > 0 {
                    let chunk = remaining.min(sink.len() as u64) as usize;
                    reader.read_exact(&mut sink[..chunk])?;
                    remaining -= chunk as u64;
                }
            }
            KIND_FILE => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::File::create(&target)?;
                let mut remaining = length;
                let mut buf = [0u8; 8192];
                while remaining > 0 {
                    let chunk = remaining.min(buf.len() as u64) as usize;
                    reader.read_exact(&mut buf[..chunk])?;
                    file.write_all(&buf[..chunk])?;
                    remaining -= chunk as u64;
                }
                file.flush()?;
            }
            other => {
                return Err(io::Error::other(format!(
                    "unknown upload frame kind {other}"
                )))
            }
        }
        if mode != 0 {
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn sample_entries() -> Vec<UploadEntry> {
        vec![
            UploadEntry::directory("scripts", 0o755),
            UploadEntry::file("scripts/run.sh", 0o755, b"#!/bin/sh\necho hi\n".to_vec()),
            UploadEntry::file("empty.txt", 0o644, Vec::new()),
        ]
    }

    #[test]
    fn frames_round_trip() {
        let entries = sample_entries();
        let mut wire = Vec::new();
        write_frames(&mut wire, &entries).unwrap();
        let parsed = read_frames(&mut wire.as_slice()).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn byte_layout_is_little_endian_with_end_record() {
        let entry = UploadEntry::file("a", 0o600, b"x".to_vec());
        let mut wire = Vec::new();
        write_frames(&mut wire, std::slice::from_ref(&entry)).unwrap();
        let expected: Vec<u8> = [
            &[KIND_FILE][..],
            &1u16.to_le_bytes(),
            b"a",
            &0o600u32.to_le_bytes(),
            &1u64.to_le_bytes(),
            b"x",
            &[KIND_END],
            &0u16.to_le_bytes(),
            &0u32.to_le_bytes(),
            &0u64.to_le_bytes(),
        ]
        .concat();
        assert_eq!(wire, expected);
    }

    #[test]
    fn apply_writes_files_with_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut wire = Vec::new();
        write_frames(&mut wire, &sample_entries()).unwrap();
        apply_frames(&mut wire.as_slice(), dir.path()).unwrap();

        let script = dir.path().join("scripts/run.sh");
        assert_eq!(
            std::fs::read(&script).unwrap(),
            b"#!/bin/sh\necho hi\n".to_vec()
        );
        assert_eq!(
            std::fs::metadata(&script).unwrap().permissions().mode() & 0o777,
            0o755
        );
        // Zero-byte uploads are created with their mode and size 0.
        let empty = dir.path().join("empty.txt");
        assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);
        assert_eq!(
            std::fs::metadata(&empty).unwrap().permissions().mode() & 0o777,
            0o644
        );
    }

    #[test]
    fn traversal_is_rejected_at_apply_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut wire = Vec::new();
        write_frames(
            &mut wire,
            &[UploadEntry::file("../escape", 0o644, b"x".to_vec())],
        )
        .unwrap();
        assert!(apply_frames(&mut wire.as_slice(), dir.path()).is_err());
    }

    #[test]
    fn truncated_streams_error_out() {
        let mut wire = Vec::new();
        write_frames(&mut wire, &sample_entries()).unwrap();
        wire.truncate(wire.len() - 4);
        assert!(read_frames(&mut wire.as_slice()).is_err());
    }
}
