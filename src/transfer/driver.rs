//! The send loop.
//!
//! Single-threaded cooperative driver around the manager. One iteration
//! flushes whatever frames were queued, runs at most one scheduled tick,
//! then suspends on the input-event channel or the cancel deadline. Chunk
//! production is gated on the previous group being fully written, so memory
//! stays bounded to one compressed chunk.
//!
//! ```text
//! +----------+  events   +--------+  frames   +----------+
//! | terminal | --------> | driver | --------> | terminal |
//! |  input   |           |        |  (OSC)    |  output  |
//! +----------+           +--------+           +----------+
//!                            |
//!                            v
//!                       SendManager
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::transfer::manager::{SendManager, SendState};
use crate::transfer::protocol::{wrap_envelope, FileTransmissionCommand};

/// Input events delivered by the terminal layer.
#[derive(Debug)]
pub enum Event {
    /// A parsed inbound protocol frame.
    Command(FileTransmissionCommand),
    /// Printable text typed by the user.
    Text(String),
    Key(Key),
    /// Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
}

/// What the session ended with; the binary turns this into an exit code and
/// a failure summary.
#[derive(Debug)]
pub struct SendOutcome {
    pub exit_code: i32,
    pub total_files: usize,
    /// (display name, receiver error message) per failed file.
    pub failed_files: Vec<(String, String)>,
}

pub struct Driver<W> {
    pub manager: SendManager,
    events: mpsc::Receiver<Event>,
    writer: W,
    confirm_paths: bool,
    password_supplied: bool,
    transmit_started: bool,
    file_metadata_sent: bool,
    check_paths_printed: bool,
    quit_after_write_code: Option<i32>,
    quit_deadline: Option<tokio::time::Instant>,
    tick_soon: bool,
    out: String,
    bar: Option<ProgressBar>,
}

impl<W: AsyncWrite + Unpin> Driver<W> {
    pub fn new(
        manager: SendManager,
        events: mpsc::Receiver<Event>,
        writer: W,
        confirm_paths: bool,
        password_supplied: bool,
    ) -> Self {
        Self {
            manager,
            events,
            writer,
            confirm_paths,
            password_supplied,
            transmit_started: false,
            file_metadata_sent: false,
            check_paths_printed: false,
            quit_after_write_code: None,
            quit_deadline: None,
            tick_soon: false,
            out: String::new(),
            bar: None,
        }
    }

    /// Run the session to completion and report the outcome.
    pub async fn run(mut self) -> Result<SendOutcome> {
        self.out.push_str("\x1b[?25l");
        let result = self.run_loop().await;
        // put the cursor back whatever happened to the session
        let _ = self.writer.write_all(b"\x1b[?25h").await;
        let _ = self.writer.flush().await;
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        result
    }

    async fn run_loop(&mut self) -> Result<SendOutcome> {
        let start = self.manager.start_transfer_command();
        self.queue_payload(&start);
        if self.password_supplied {
            // a password pre-authorizes the transfer, so the metadata does
            // not have to wait for the permission round-trip
            self.send_file_metadata();
        }
        loop {
            if !self.out.is_empty() {
                let buf = std::mem::take(&mut self.out);
                self.writer
                    .write_all(buf.as_bytes())
                    .await
                    .context("writing to the terminal channel")?;
                self.writer
                    .flush()
                    .await
                    .context("flushing the terminal channel")?;
                self.on_writing_finished();
            }
            if self.tick_soon {
                self.tick_soon = false;
                self.loop_tick()?;
                continue;
            }
            if !self.out.is_empty() {
                continue;
            }
            if let Some(code) = self.quit_after_write_code {
                return Ok(self.outcome(code));
            }
            match self.quit_deadline {
                Some(deadline) => tokio::select! {
                    ev = self.events.recv() => self.dispatch(ev)?,
                    _ = tokio::time::sleep_until(deadline) => {
                        // the receiver never acknowledged our cancel
                        return Ok(self.outcome(1));
                    }
                },
                None => {
                    let ev = self.events.recv().await;
                    self.dispatch(ev)?;
                }
            }
        }
    }

    fn dispatch(&mut self, ev: Option<Event>) -> Result<()> {
        match ev {
            Some(Event::Command(ftc)) => self.on_command(ftc),
            Some(Event::Text(text)) => self.on_text(&text),
            Some(Event::Key(Key::Escape)) => self.on_escape(),
            Some(Event::Interrupt) => {
                self.on_interrupt();
                Ok(())
            }
            Some(Event::Terminate) => {
                self.on_terminate();
                Ok(())
            }
            None => {
                // terminal input is gone; nothing sensible can follow
                self.quit_after_write_code = Some(1);
                Ok(())
            }
        }
    }

    fn queue_payload(&mut self, cmd: &FileTransmissionCommand) {
        self.out
            .push_str(&wrap_envelope(&self.manager.request_id, &cmd.serialize()));
    }

    fn send_file_metadata(&mut self) {
        if self.file_metadata_sent {
            return;
        }
        for cmd in self.manager.metadata_commands() {
            self.queue_payload(&cmd);
        }
        self.file_metadata_sent = true;
    }

    fn on_command(&mut self, ftc: FileTransmissionCommand) -> Result<()> {
        if self.quit_after_write_code.is_some() {
            return Ok(());
        }
        if ftc.id != self.manager.request_id {
            tracing::debug!(id = %ftc.id, "ignoring frame for another session");
            return Ok(());
        }
        if ftc.status == "CANCELED" && ftc.file_id.is_empty() {
            self.quit_after_write_code = Some(1);
            return Ok(());
        }
        if self.manager.state == SendState::Canceled {
            return Ok(());
        }
        let before = self.manager.state;
        let mut finalized = Vec::new();
        self.manager.on_file_transfer_response(&ftc, &mut finalized);
        self.note_finalized(&finalized);
        if before == SendState::WaitingForPermission {
            match self.manager.state {
                SendState::PermissionDenied => {
                    eprintln!("{}", "Permission denied for this transfer".red());
                    self.quit_after_write_code = Some(1);
                    return Ok(());
                }
                SendState::PermissionGranted => {
                    eprintln!("{}", "Permission granted for this transfer".green());
                    self.send_file_metadata();
                }
                _ => {}
            }
        }
        self.tick_soon = true;
        Ok(())
    }

    fn loop_tick(&mut self) -> Result<()> {
        if self.quit_after_write_code.is_some() {
            return Ok(());
        }
        match self.manager.state {
            // keep waiting for the receiver
            SendState::WaitingForPermission => Ok(()),
            // nothing but the cancel frame goes out any more
            SendState::Canceled => Ok(()),
            _ => {
                if self.transmit_started {
                    self.transmit_next_chunk()?;
                    self.refresh_progress();
                } else {
                    self.check_for_transmit_ok()?;
                }
                Ok(())
            }
        }
    }

    fn check_for_transmit_ok(&mut self) -> Result<()> {
        if self.manager.state != SendState::PermissionGranted {
            return Ok(());
        }
        if self.confirm_paths {
            // every destination has to be resolved before the listing is
            // worth showing
            if self.manager.all_started {
                self.print_check_paths();
            }
            return Ok(());
        }
        self.start_transfer()
    }

    fn start_transfer(&mut self) -> Result<()> {
        let mut finalized = Vec::new();
        if self.manager.active_file_idx().is_none() {
            self.manager.activate_next_ready_file(&mut finalized);
        }
        self.note_finalized(&finalized);
        if self.manager.active_file_idx().is_some() {
            self.transmit_started = true;
            self.manager.progress.start_transfer();
            self.init_progress_bar();
            self.transmit_next_chunk()?;
        } else if self.manager.all_acknowledged {
            // a plan of directories only produces no data frames at all
            self.transfer_finished();
        }
        Ok(())
    }

    fn transmit_next_chunk(&mut self) -> Result<()> {
        let mut finalized = Vec::new();
        let cmds = self.manager.next_chunks(&mut finalized)?;
        self.note_finalized(&finalized);
        for cmd in &cmds {
            self.queue_payload(cmd);
        }
        if self.manager.all_acknowledged {
            self.transfer_finished();
        }
        Ok(())
    }

    fn transfer_finished(&mut self) {
        if self.quit_after_write_code.is_some() {
            return;
        }
        let finish = SendManager::finish_command();
        self.queue_payload(&finish);
        let failed = self.manager.files.iter().any(|f| !f.err_msg.is_empty());
        self.quit_after_write_code = Some(i32::from(failed));
    }

    fn on_writing_finished(&mut self) {
        let chunk_transmitted = self.manager.current_chunk_uncompressed_sz.is_some();
        if let Some(amt) = self.manager.current_chunk_uncompressed_sz.take() {
            self.manager.record_transfer(amt);
            self.refresh_progress();
        }
        if self.quit_after_write_code.is_some() {
            return;
        }
        if self.manager.state == SendState::PermissionGranted
            && (!self.transmit_started || chunk_transmitted)
        {
            self.tick_soon = true;
        }
    }

    fn on_text(&mut self, text: &str) -> Result<()> {
        if self.quit_after_write_code.is_some() {
            return Ok(());
        }
        if self.check_paths_printed && !self.transmit_started {
            match text.to_lowercase().as_str() {
                "y" => return self.start_transfer(),
                "n" => {
                    self.abort_transfer(Duration::from_secs(5));
                    eprintln!("Sending cancel request to terminal");
                }
                _ => self.print_continue_msg(),
            }
        }
        Ok(())
    }

    fn on_escape(&mut self) -> Result<()> {
        if self.quit_after_write_code.is_some() {
            return Ok(());
        }
        if self.check_paths_printed && !self.transmit_started {
            self.abort_transfer(Duration::from_secs(5));
            eprintln!("Sending cancel request to terminal");
        } else {
            self.on_interrupt();
        }
        Ok(())
    }

    fn on_interrupt(&mut self) {
        if self.quit_after_write_code.is_some() {
            return;
        }
        if self.manager.state == SendState::Canceled {
            eprintln!(
                "Waiting for canceled acknowledgement from terminal, \
                 will abort in a few seconds if no response received"
            );
            return;
        }
        eprintln!(
            "{}",
            "Interrupt requested, cancelling transfer, transferred files are in undefined state"
                .red()
        );
        self.abort_transfer(Duration::from_secs(5));
    }

    fn on_terminate(&mut self) {
        if self.quit_after_write_code.is_some() {
            return;
        }
        eprintln!(
            "{}",
            "Terminate requested, cancelling transfer, transferred files are in undefined state"
                .red()
        );
        self.abort_transfer(Duration::from_secs(2));
    }

    fn abort_transfer(&mut self, delay: Duration) {
        let cancel = SendManager::cancel_command();
        self.queue_payload(&cancel);
        self.manager.state = SendState::Canceled;
        self.quit_deadline = Some(tokio::time::Instant::now() + delay);
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn print_check_paths(&mut self) {
        if self.check_paths_printed {
            return;
        }
        self.check_paths_printed = true;
        eprintln!(
            "The following file transfers will be performed. \
             A red destination means an existing file will be overwritten."
        );
        for file in &self.manager.files {
            let dest = if file.remote_initial_size > -1 {
                file.remote_final_path.red().to_string()
            } else {
                file.remote_final_path.clone()
            };
            eprintln!(
                "{} {} → {}",
                file.kind.short_text().cyan(),
                file.display_name,
                dest
            );
        }
        eprintln!(
            "Transferring {} files of total size: {}",
            self.manager.files.len(),
            HumanBytes(self.manager.progress.total_bytes_to_transfer)
        );
        self.print_continue_msg();
    }

    fn print_continue_msg(&self) {
        eprintln!(
            "Press {} to continue or {} to abort",
            "y".green().bold(),
            "n".red().bold()
        );
    }

    fn note_finalized(&mut self, finalized: &[usize]) {
        for &idx in finalized {
            let file = &self.manager.files[idx];
            let line = if file.err_msg.is_empty() {
                format!("{} {}", "✔".green(), file.display_name)
            } else {
                format!("{} {}: {}", "✘".red(), file.display_name, file.err_msg)
            };
            match &self.bar {
                Some(bar) => bar.println(line),
                None => eprintln!("{line}"),
            }
        }
    }

    fn init_progress_bar(&mut self) {
        let bar = ProgressBar::new(self.manager.progress.total_bytes_to_transfer);
        let style = ProgressStyle::with_template("{bar:30} {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        self.bar = Some(bar);
    }

    fn refresh_progress(&mut self) {
        if let Some(bar) = &self.bar {
            bar.set_position(self.manager.progress.total_transferred);
            bar.set_message(format!(
                "{}/s",
                HumanBytes(self.manager.progress.rate() as u64)
            ));
        }
    }

    fn outcome(&self, exit_code: i32) -> SendOutcome {
        let failed_files = self
            .manager
            .files
            .iter()
            .filter(|f| !f.err_msg.is_empty())
            .map(|f| (f.display_name.clone(), f.err_msg.clone()))
            .collect();
        SendOutcome {
            exit_code,
            total_files: self.manager.files.len(),
            failed_files,
        }
    }
}
