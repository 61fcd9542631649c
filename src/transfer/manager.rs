//! Session state and outbound frame production.
//!
//! The manager owns the plan, the active file, and both state machines: the
//! session-global [`SendState`] and the per-file [`FileState`] lifecycle.
//! It consumes receiver status frames and produces protocol commands; the
//! driver decides when to write them.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Result;
use crate::transfer::plan::{File, FileState, CHUNK_SIZE};
use crate::transfer::progress::ProgressTracker;
use crate::transfer::protocol::{
    encode_password, Action, FileKind, FileTransmissionCommand, TransmissionType, FRAME_DATA_SIZE,
};

/// Session-global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    WaitingForPermission,
    PermissionGranted,
    /// Terminal: the receiver refused the session.
    PermissionDenied,
    /// Terminal: the sender aborted; only `cancel` may still be written.
    Canceled,
}

pub struct SendManager {
    pub request_id: String,
    password: String,
    pub files: Vec<File>,
    fid_map: HashMap<String, usize>,
    pub state: SendState,
    pub all_acknowledged: bool,
    pub all_started: bool,
    pub active_idx: Option<usize>,
    /// Raw bytes consumed by the chunk group currently being written; `None`
    /// means no unacknowledged write is in flight.
    pub current_chunk_uncompressed_sz: Option<u64>,
    pub progress: ProgressTracker,
}

impl SendManager {
    pub fn new(request_id: String, files: Vec<File>, password: Option<&str>) -> Self {
        let password = match password {
            Some(pw) if !pw.is_empty() => encode_password(&request_id, pw),
            _ => String::new(),
        };
        let fid_map = files
            .iter()
            .enumerate()
            .map(|(idx, file)| (file.file_id.clone(), idx))
            .collect();
        let total: u64 = files.iter().map(|f| f.file_size.max(0) as u64).sum();
        Self {
            request_id,
            password,
            files,
            fid_map,
            state: SendState::WaitingForPermission,
            all_acknowledged: false,
            all_started: false,
            active_idx: None,
            current_chunk_uncompressed_sz: None,
            progress: ProgressTracker::new(total),
        }
    }

    /// The session-opening frame, carrying the encoded password if any.
    pub fn start_transfer_command(&self) -> FileTransmissionCommand {
        let mut cmd = FileTransmissionCommand::new(Action::Send);
        cmd.password = self.password.clone();
        cmd
    }

    /// One `file` frame per plan entry, in plan order.
    pub fn metadata_commands(&self) -> Vec<FileTransmissionCommand> {
        self.files.iter().map(File::metadata_command).collect()
    }

    pub fn cancel_command() -> FileTransmissionCommand {
        FileTransmissionCommand::new(Action::Cancel)
    }

    pub fn finish_command() -> FileTransmissionCommand {
        FileTransmissionCommand::new(Action::Finish)
    }

    /// Index of the file currently allowed to produce data frames.
    pub fn active_file_idx(&self) -> Option<usize> {
        self.active_idx
            .filter(|&idx| self.files[idx].state == FileState::Transmitting)
    }

    /// Finalize the previous active file, then pick the first plan entry in
    /// `Transmitting` state. Finalized indices are appended to `finalized`
    /// for the driver's done/failed bookkeeping.
    pub fn activate_next_ready_file(&mut self, finalized: &mut Vec<usize>) -> Option<usize> {
        if let Some(prev) = self.active_idx {
            self.files[prev].transmit_ended_at = Some(Instant::now());
            finalized.push(prev);
        }
        let next = self
            .files
            .iter()
            .position(|file| file.state == FileState::Transmitting);
        self.active_idx = next;
        self.update_collective_statuses();
        if let Some(idx) = next {
            self.files[idx].transmit_started_at = Some(Instant::now());
            self.progress.active_idx = Some(idx);
        }
        next
    }

    /// Recompute `all_started` and `all_acknowledged` with a single scan.
    pub fn update_collective_statuses(&mut self) {
        let mut found_not_started = false;
        let mut found_not_done = false;
        for file in &self.files {
            if file.state != FileState::Acknowledged {
                found_not_done = true;
            }
            if file.state == FileState::WaitingForStart {
                found_not_started = true;
            }
            if found_not_started && found_not_done {
                break;
            }
        }
        self.all_acknowledged = !found_not_done;
        self.all_started = !found_not_started;
    }

    /// Produce the next group of `data`/`end_data` frames for the active
    /// file, splitting the compressed chunk into wire-sized pieces. Returns
    /// an empty group when no file is ready.
    pub fn next_chunks(
        &mut self,
        finalized: &mut Vec<usize>,
    ) -> Result<Vec<FileTransmissionCommand>> {
        if self.active_file_idx().is_none() {
            self.activate_next_ready_file(finalized);
        }
        let idx = match self.active_file_idx() {
            Some(idx) => idx,
            None => return Ok(Vec::new()),
        };

        let mut uncompressed = 0u64;
        let mut chunk = bytes::Bytes::new();
        while self.files[idx].state != FileState::Finished && chunk.is_empty() {
            let (produced, consumed) = self.files[idx].next_chunk(CHUNK_SIZE)?;
            uncompressed += consumed as u64;
            chunk = produced;
        }
        self.current_chunk_uncompressed_sz = Some(uncompressed);

        let is_last = self.files[idx].state == FileState::Finished;
        let file_id = self.files[idx].file_id.clone();
        let mut cmds = Vec::new();
        let mut pos = 0;
        while pos < chunk.len() {
            let end = (pos + FRAME_DATA_SIZE).min(chunk.len());
            let final_frame = is_last && end == chunk.len();
            let mut cmd = FileTransmissionCommand::new(if final_frame {
                Action::EndData
            } else {
                Action::Data
            });
            cmd.file_id = file_id.clone();
            cmd.data = chunk.slice(pos..end);
            cmds.push(cmd);
            pos = end;
        }
        if cmds.is_empty() && is_last {
            // zero-byte output (an empty file under identity compression)
            // still owes the receiver its terminal frame
            let mut cmd = FileTransmissionCommand::new(Action::EndData);
            cmd.file_id = file_id;
            cmds.push(cmd);
        }
        Ok(cmds)
    }

    /// Attribute acknowledged raw bytes to the active file and the session
    /// totals.
    pub fn record_transfer(&mut self, amt: u64) {
        if let Some(idx) = self.progress.active_idx {
            self.files[idx].transmitted_bytes += amt;
        }
        self.progress.on_transfer(amt);
    }

    /// Consume one inbound frame. Session-level status grants or denies
    /// permission; per-file status drives the file lifecycle.
    pub fn on_file_transfer_response(
        &mut self,
        ftc: &FileTransmissionCommand,
        finalized: &mut Vec<usize>,
    ) {
        if ftc.action != Action::Status {
            return;
        }
        if !ftc.file_id.is_empty() {
            self.on_file_status_update(ftc, finalized);
        } else if self.state == SendState::WaitingForPermission {
            self.state = if ftc.status == "OK" {
                SendState::PermissionGranted
            } else {
                SendState::PermissionDenied
            };
        }
    }

    fn on_file_status_update(
        &mut self,
        ftc: &FileTransmissionCommand,
        finalized: &mut Vec<usize>,
    ) {
        let idx = match self.fid_map.get(&ftc.file_id) {
            Some(&idx) => idx,
            None => {
                tracing::debug!(file_id = %ftc.file_id, "status for unknown file id");
                return;
            }
        };
        let file = &mut self.files[idx];
        if ftc.status == "STARTED" {
            file.remote_final_path = ftc.name.clone();
            file.remote_initial_size = ftc.size;
            file.state = if file.kind == FileKind::Directory {
                FileState::Finished
            } else if file.ttype == TransmissionType::Rsync {
                FileState::WaitingForData
            } else {
                FileState::Transmitting
            };
        } else {
            if !ftc.name.is_empty() && file.remote_final_path.is_empty() {
                file.remote_final_path = ftc.name.clone();
            }
            file.state = FileState::Acknowledged;
            if ftc.status != "OK" {
                file.err_msg = ftc.status.clone();
            }
            if self.active_idx == Some(idx) {
                finalized.push(idx);
                self.active_idx = None;
            }
        }
        self.update_collective_statuses();
    }
}
