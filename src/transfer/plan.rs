//! Transfer planning.
//!
//! Walks the requested paths into an ordered plan of [`File`] entries with
//! stable hexadecimal ids, then runs two post-passes: hard-link groups
//! (same device and inode) keep their first member as the data carrier and
//! rewrite the rest to links, and symlinks resolve to either a planned
//! file's id (`fid:`) or a literal target (`path:`).
//!
//! The plan is immutable in shape after this module returns; the manager
//! only mutates per-file transfer state.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::Instant;

use bytes::Bytes;

use crate::cli::Mode;
use crate::error::{Result, SendError};
use crate::transfer::compress::{should_be_compressed, Compressor};
use crate::transfer::protocol::{Action, Compression, FileKind, FileTransmissionCommand, TransmissionType};

use std::os::unix::fs::MetadataExt;

/// Raw bytes read from disk per chunk production.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Per-file transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Metadata sent, no STARTED from the receiver yet.
    WaitingForStart,
    /// STARTED received for a delta-mode file; parked until the delta
    /// exchange (not produced by this sender) takes over.
    WaitingForData,
    /// STARTED received, chunks may be produced.
    Transmitting,
    /// All payload bytes produced, awaiting the terminal status.
    Finished,
    /// Terminal status received.
    Acknowledged,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub mode: Mode,
    pub transmit_deltas: bool,
}

/// One plan entry. Created by the planner, mutated only by the send manager
/// through acknowledgement intake and chunk production.
pub struct File {
    /// Path as given by the user, control-code sanitized for display.
    pub local_path: String,
    pub display_name: String,
    /// Home-expanded path used for disk I/O.
    pub expanded_local_path: PathBuf,
    /// Lowercase hex, unique within the plan, assigned in walk order from 1.
    pub file_id: String,
    pub kind: FileKind,
    pub ttype: TransmissionType,
    pub state: FileState,
    pub permissions: u32,
    /// Nanoseconds since the epoch.
    pub mtime: i64,
    pub file_size: i64,
    pub bytes_to_transmit: i64,
    /// (device, inode) identity for hard-link grouping.
    pub file_hash: (u64, u64),
    /// Forward-slash separated destination path.
    pub remote_path: String,
    /// Resolved by the receiver's STARTED response.
    pub remote_final_path: String,
    /// Existing size on the receiver; -1 means a new file.
    pub remote_initial_size: i64,
    /// File id of the link target, for `kind == Link`.
    pub hard_link_target: String,
    /// `fid:<id>` or `path:<literal>`, for `kind == Symlink`.
    pub symbolic_link_target: String,
    pub compression: Compression,
    pub err_msg: String,
    pub transmitted_bytes: u64,
    pub transmit_started_at: Option<Instant>,
    pub transmit_ended_at: Option<Instant>,
    reader: Option<std::fs::File>,
    compressor: Option<Compressor>,
    bytes_read: u64,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.display_name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl File {
    fn new(
        local_path: &str,
        expanded_local_path: PathBuf,
        file_id: u32,
        meta: &std::fs::Metadata,
        remote_base: &str,
        kind: FileKind,
        ttype: TransmissionType,
    ) -> Self {
        let size = meta.len() as i64;
        let compression = if kind == FileKind::Regular
            && size > 4096
            && should_be_compressed(&expanded_local_path)
        {
            Compression::Zlib
        } else {
            Compression::None
        };
        File {
            local_path: local_path.to_string(),
            display_name: sanitize_control_codes(local_path),
            file_id: format!("{file_id:x}"),
            kind,
            ttype,
            state: FileState::WaitingForStart,
            permissions: meta.mode() & 0o7777,
            mtime: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            file_size: size,
            bytes_to_transmit: size,
            file_hash: (meta.dev(), meta.ino()),
            remote_path: get_remote_path(local_path, remote_base),
            remote_final_path: String::new(),
            remote_initial_size: -1,
            hard_link_target: String::new(),
            symbolic_link_target: String::new(),
            compression,
            err_msg: String::new(),
            transmitted_bytes: 0,
            transmit_started_at: None,
            transmit_ended_at: None,
            reader: None,
            compressor: None,
            bytes_read: 0,
            expanded_local_path,
        }
    }

    /// The `file` metadata frame announcing this entry to the receiver.
    pub fn metadata_command(&self) -> FileTransmissionCommand {
        let mut cmd = FileTransmissionCommand::new(Action::File);
        cmd.file_id = self.file_id.clone();
        cmd.name = self.remote_path.clone();
        cmd.size = self.file_size;
        cmd.mtime = self.mtime;
        cmd.permissions = i64::from(self.permissions);
        cmd.compression = self.compression;
        cmd.ftype = self.kind;
        cmd.ttype = self.ttype;
        cmd
    }

    /// Produce the next compressed chunk and the number of raw bytes it
    /// consumed. Link targets are the whole payload; regular files read up
    /// to `max_sz` bytes through the compressor. Reaching the end of input
    /// transitions the file to [`FileState::Finished`] and releases the file
    /// handle and compressor.
    pub fn next_chunk(&mut self, max_sz: usize) -> Result<(Bytes, usize)> {
        match self.kind {
            FileKind::Symlink => {
                self.state = FileState::Finished;
                let payload = Bytes::from(self.symbolic_link_target.clone().into_bytes());
                let len = payload.len();
                Ok((payload, len))
            }
            FileKind::Link => {
                self.state = FileState::Finished;
                let payload = Bytes::from(self.hard_link_target.clone().into_bytes());
                let len = payload.len();
                Ok((payload, len))
            }
            FileKind::Directory => {
                // directories carry no payload; the receiver finishes them
                // on STARTED
                self.state = FileState::Finished;
                Ok((Bytes::new(), 0))
            }
            FileKind::Regular => {
                if self.reader.is_none() {
                    self.reader = Some(std::fs::File::open(&self.expanded_local_path)?);
                    self.compressor = Some(match self.compression {
                        Compression::Zlib => Compressor::zlib(),
                        Compression::None => Compressor::identity(),
                    });
                }
                let mut buf = vec![0u8; max_sz];
                let n = match self.reader.as_mut() {
                    Some(reader) => reader.read(&mut buf)?,
                    None => 0,
                };
                self.bytes_read += n as u64;
                let is_last = n == 0 || self.bytes_read >= self.file_size.max(0) as u64;
                let payload = match self.compressor.as_mut() {
                    Some(compressor) => {
                        let mut payload = compressor.compress(&buf[..n])?;
                        if is_last {
                            payload.extend(compressor.flush()?);
                        }
                        payload
                    }
                    None => buf[..n].to_vec(),
                };
                if is_last {
                    self.state = FileState::Finished;
                    self.reader = None;
                    self.compressor = None;
                }
                Ok((Bytes::from(payload), n))
            }
        }
    }
}

// =============================================================================
// Path helpers
// =============================================================================

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn abspath(path: &str) -> PathBuf {
    let p = expand_home(path);
    if p.is_absolute() {
        p
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(p),
            Err(_) => p,
        }
    }
}

/// Replace control characters in a user-visible name.
fn sanitize_control_codes(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { '\u{fffd}' } else { c })
        .collect()
}

/// Map a local path onto the remote namespace. An empty base mirrors the
/// local path; a base ending in `/` is a directory to place the basename
/// under; anything else is the literal destination.
fn get_remote_path(local_path: &str, remote_base: &str) -> String {
    if remote_base.is_empty() {
        return local_path.replace(MAIN_SEPARATOR, "/");
    }
    if remote_base.ends_with('/') {
        return format!("{}{}", remote_base, basename(local_path));
    }
    remote_base.to_string()
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Longest common path prefix, component-wise.
fn common_path(paths: &[PathBuf]) -> Option<PathBuf> {
    let first = paths.first()?;
    let mut common: Vec<_> = first.components().collect();
    for path in &paths[1..] {
        let components: Vec<_> = path.components().collect();
        let shared = common
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
    }
    if common.is_empty() {
        None
    } else {
        Some(common.iter().collect())
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Build the transfer plan for the given arguments.
pub fn files_for_send(opts: &PlanOptions, args: &[String]) -> Result<Vec<File>> {
    let mut files = Vec::new();
    let mut counter = 0u32;
    match opts.mode {
        Mode::Mirror => {
            let paths = mirrored_paths(args);
            process(&paths, "", &mut counter, opts.transmit_deltas, &mut files)?;
        }
        Mode::Normal => {
            if args.len() < 2 {
                return Err(SendError::Usage(
                    "must specify at least one local path and one remote path".to_string(),
                ));
            }
            let mut sources = args.to_vec();
            let mut remote_base = sources
                .pop()
                .unwrap_or_default()
                .replace(MAIN_SEPARATOR, "/");
            if sources.len() > 1 && !remote_base.ends_with('/') {
                remote_base.push('/');
            }
            process(&sources, &remote_base, &mut counter, opts.transmit_deltas, &mut files)?;
        }
    }
    apply_hard_links(&mut files);
    resolve_symlinks(&mut files);
    Ok(files)
}

/// Absolutize the arguments; if they all live under the home directory,
/// rewrite them `~`-relative so the receiver mirrors them under its own home.
fn mirrored_paths(args: &[String]) -> Vec<String> {
    let abs: Vec<PathBuf> = args.iter().map(|a| abspath(a)).collect();
    if let (Some(common), Some(home)) = (common_path(&abs), dirs::home_dir()) {
        match common.strip_prefix(&home) {
            Ok(rel) if !rel.as_os_str().is_empty() => {
                return abs
                    .iter()
                    .map(|p| match p.strip_prefix(&home) {
                        Ok(rel) => format!("~/{}", rel.display()),
                        Err(_) => p.display().to_string(),
                    })
                    .collect();
            }
            _ => {}
        }
    }
    abs.iter().map(|p| p.display().to_string()).collect()
}

fn process(
    paths: &[String],
    remote_base: &str,
    counter: &mut u32,
    transmit_deltas: bool,
    out: &mut Vec<File>,
) -> Result<()> {
    for local_path in paths {
        let expanded = expand_home(local_path);
        let meta = std::fs::symlink_metadata(&expanded).map_err(|source| SendError::Setup {
            path: local_path.clone(),
            source,
        })?;
        let file_type = meta.file_type();
        if file_type.is_dir() {
            *counter += 1;
            out.push(File::new(
                local_path,
                expanded.clone(),
                *counter,
                &meta,
                remote_base,
                FileKind::Directory,
                TransmissionType::Simple,
            ));
            let child_base = if remote_base.is_empty() {
                format!(
                    "{}/",
                    local_path.replace(MAIN_SEPARATOR, "/").trim_end_matches('/')
                )
            } else {
                format!(
                    "{}/{}/",
                    remote_base.trim_end_matches('/'),
                    basename(local_path)
                )
            };
            let mut children = Vec::new();
            let entries = std::fs::read_dir(&expanded).map_err(|source| SendError::Setup {
                path: local_path.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| SendError::Setup {
                    path: local_path.clone(),
                    source,
                })?;
                children.push(
                    Path::new(local_path)
                        .join(entry.file_name())
                        .to_string_lossy()
                        .into_owned(),
                );
            }
            process(&children, &child_base, counter, transmit_deltas, out)?;
        } else if file_type.is_symlink() {
            *counter += 1;
            out.push(File::new(
                local_path,
                expanded,
                *counter,
                &meta,
                remote_base,
                FileKind::Symlink,
                TransmissionType::Simple,
            ));
        } else if file_type.is_file() {
            *counter += 1;
            let ttype = if transmit_deltas {
                TransmissionType::Rsync
            } else {
                TransmissionType::Simple
            };
            out.push(File::new(
                local_path,
                expanded,
                *counter,
                &meta,
                remote_base,
                FileKind::Regular,
                ttype,
            ));
        }
        // sockets, fifos and devices are skipped
    }
    Ok(())
}

/// Within each (device, inode) group the first entry in walk order keeps its
/// type; later ones become links carrying the first's id.
fn apply_hard_links(files: &mut [File]) {
    let mut groups: HashMap<(u64, u64), Vec<usize>> = HashMap::new();
    for (idx, file) in files.iter().enumerate() {
        groups.entry(file.file_hash).or_default().push(idx);
    }
    for group in groups.values() {
        if group.len() < 2 {
            continue;
        }
        let target_id = files[group[0]].file_id.clone();
        for &idx in &group[1..] {
            files[idx].kind = FileKind::Link;
            files[idx].hard_link_target = target_id.clone();
        }
    }
}

/// Read each symlink's target. Targets resolving to a planned file become
/// `fid:<id>` references, others stay literal; unreadable links are dropped
/// from the plan with a warning.
fn resolve_symlinks(files: &mut Vec<File>) {
    let mut hash_to_first: HashMap<(u64, u64), usize> = HashMap::new();
    for (idx, file) in files.iter().enumerate() {
        hash_to_first.entry(file.file_hash).or_insert(idx);
    }
    let mut dropped = Vec::new();
    for idx in 0..files.len() {
        if files[idx].kind != FileKind::Symlink {
            continue;
        }
        let target = match std::fs::read_link(&files[idx].expanded_local_path) {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!(
                    path = %files[idx].display_name,
                    %error,
                    "dropping unreadable symlink from the plan"
                );
                dropped.push(idx);
                continue;
            }
        };
        files[idx].symbolic_link_target = format!("path:{}", target.display());
        let resolved = if target.is_absolute() {
            target
        } else {
            files[idx]
                .expanded_local_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(target)
        };
        if let Ok(meta) = std::fs::metadata(&resolved) {
            if let Some(&first) = hash_to_first.get(&(meta.dev(), meta.ino())) {
                files[idx].symbolic_link_target = format!("fid:{}", files[first].file_id);
            }
        }
    }
    for idx in dropped.into_iter().rev() {
        files.remove(idx);
    }
}

// =============================================================================
// Tests
// =============================================================================
