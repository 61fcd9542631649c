//! Thin terminal collaborator.
//!
//! Owns the pieces of terminal plumbing the send loop should not care
//! about: putting stdin into raw mode (restored on drop), turning the raw
//! byte stream into [`Event`]s, and forwarding SIGTERM. Inbound protocol
//! frames arrive interleaved with keystrokes on the same stream; the parser
//! peels OSC 5113 envelopes out and hands everything else over as key
//! events.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::transfer::driver::{Event, Key};
use crate::transfer::protocol::{parse_envelope_payload, FILE_TRANSFER_CODE};

/// Time to wait for a follow-up byte before a lone ESC counts as the Escape
/// key rather than the start of a control sequence.
const ESC_TIMEOUT: Duration = Duration::from_millis(50);

// =============================================================================
// Raw mode
// =============================================================================

/// Raw-mode guard for stdin. Echo, canonical mode and signal generation are
/// disabled so keystrokes and protocol responses arrive as plain bytes;
/// the original settings come back on drop.
pub struct RawMode {
    fd: libc::c_int,
    original: libc::termios,
}

impl RawMode {
    /// Returns `None` when stdin is not a tty (tests, pipes).
    pub fn enable() -> std::io::Result<Option<Self>> {
        let fd = libc::STDIN_FILENO;
        if unsafe { libc::isatty(fd) } == 0 {
            return Ok(None);
        }
        let mut original = std::mem::MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, original.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let original = unsafe { original.assume_init() };
        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Some(RawMode { fd, original }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.original);
        }
    }
}

// =============================================================================
// Input parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Esc,
    Osc,
    /// Inside an OSC payload, after an ESC, expecting `\` (ST).
    OscEsc,
}

/// Incremental scanner over terminal input bytes.
#[derive(Debug)]
pub struct InputParser {
    state: State,
    osc: Vec<u8>,
}

impl Default for InputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InputParser {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            osc: Vec::new(),
        }
    }

    /// True while the scanner has consumed an ESC it cannot classify yet.
    pub fn in_escape(&self) -> bool {
        self.state == State::Esc
    }

    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Event>) {
        let mut idx = 0;
        while idx < bytes.len() {
            let byte = bytes[idx];
            match self.state {
                State::Ground => {
                    match byte {
                        0x1b => self.state = State::Esc,
                        0x03 => out.push(Event::Interrupt),
                        0x20..=0x7e => out.push(Event::Text((byte as char).to_string())),
                        _ => {}
                    }
                    idx += 1;
                }
                State::Esc => {
                    if byte == b']' {
                        self.state = State::Osc;
                        self.osc.clear();
                        idx += 1;
                    } else {
                        // ESC followed by anything that does not open an OSC
                        // is the Escape key; rescan the byte from the ground
                        // state
                        out.push(Event::Key(Key::Escape));
                        self.state = State::Ground;
                    }
                }
                State::Osc => {
                    match byte {
                        0x1b => self.state = State::OscEsc,
                        0x07 => self.finish_osc(out),
                        _ => self.osc.push(byte),
                    }
                    idx += 1;
                }
                State::OscEsc => {
                    if byte == b'\\' {
                        self.finish_osc(out);
                        idx += 1;
                    } else {
                        // malformed terminator; drop the sequence and rescan
                        tracing::debug!("discarding unterminated control sequence");
                        self.osc.clear();
                        self.state = State::Ground;
                    }
                }
            }
        }
    }

    /// Resolve a pending lone ESC as the Escape key. Called when no
    /// follow-up byte arrived in time.
    pub fn flush_pending(&mut self, out: &mut Vec<Event>) {
        if self.state == State::Esc {
            out.push(Event::Key(Key::Escape));
            self.state = State::Ground;
        }
    }

    fn finish_osc(&mut self, out: &mut Vec<Event>) {
        self.state = State::Ground;
        let payload = String::from_utf8_lossy(&self.osc).into_owned();
        self.osc.clear();
        let prefix = format!("{FILE_TRANSFER_CODE};");
        if let Some(rest) = payload.strip_prefix(&prefix) {
            match parse_envelope_payload(rest) {
                Ok(cmd) => out.push(Event::Command(cmd)),
                Err(error) => tracing::debug!(%error, "ignoring unparseable transfer frame"),
            }
        }
        // other OSC traffic is none of our business
    }
}

// =============================================================================
// Event sources
// =============================================================================

/// Spawn the stdin reader and the SIGTERM watcher; the returned channel is
/// the driver's sole input.
pub fn spawn_event_sources() -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(read_terminal_input(tx.clone()));
    tokio::spawn(watch_terminate(tx));
    rx
}

async fn read_terminal_input(tx: mpsc::Sender<Event>) {
    let mut stdin = tokio::io::stdin();
    let mut parser = InputParser::new();
    let mut buf = [0u8; 8192];
    'outer: loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut events = Vec::new();
        parser.feed(&buf[..n], &mut events);
        while parser.in_escape() {
            match tokio::time::timeout(ESC_TIMEOUT, stdin.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    parser.flush_pending(&mut events);
                    deliver(&tx, events).await;
                    break 'outer;
                }
                Ok(Ok(n)) => parser.feed(&buf[..n], &mut events),
                Err(_) => parser.flush_pending(&mut events),
            }
        }
        if !deliver(&tx, events).await {
            return;
        }
    }
}

async fn deliver(tx: &mpsc::Sender<Event>, events: Vec<Event>) -> bool {
    for ev in events {
        if tx.send(ev).await.is_err() {
            return false;
        }
    }
    true
}

async fn watch_terminate(tx: mpsc::Sender<Event>) {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(term) => term,
        Err(_) => return,
    };
    while term.recv().await.is_some() {
        if tx.send(Event::Terminate).await.is_err() {
            return;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::{Action, FileTransmissionCommand};

    fn feed_all(bytes: &[u8]) -> Vec<Event> {
        let mut parser = InputParser::new();
        let mut out = Vec::new();
        parser.feed(bytes, &mut out);
        parser.flush_pending(&mut out);
        out
    }

    #[test]
    fn test_plain_text_keys() {
        let events = feed_all(b"yn");
        assert!(matches!(&events[0], Event::Text(t) if t == "y"));
        assert!(matches!(&events[1], Event::Text(t) if t == "n"));
    }

    #[test]
    fn test_interrupt_byte() {
        let events = feed_all(&[0x03]);
        assert!(matches!(events[0], Event::Interrupt));
    }

    #[test]
    fn test_lone_escape_key() {
        let events = feed_all(&[0x1b]);
        assert!(matches!(events[0], Event::Key(Key::Escape)));
    }

    #[test]
    fn test_envelope_parsed_to_command() {
        let mut status = FileTransmissionCommand::new(Action::Status);
        status.status = "OK".to_string();
        let wire = format!("\x1b]5113;id=req1;{}\x1b\\", status.serialize());

        let events = feed_all(wire.as_bytes());
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Command(cmd) => {
                assert_eq!(cmd.id, "req1");
                assert_eq!(cmd.status, "OK");
            }
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_split_across_reads() {
        let mut status = FileTransmissionCommand::new(Action::Status);
        status.status = "STARTED".to_string();
        status.file_id = "1".to_string();
        let wire = format!("\x1b]5113;id=req1;{}\x1b\\", status.serialize());
        let bytes = wire.as_bytes();

        let mut parser = InputParser::new();
        let mut out = Vec::new();
        for half in bytes.chunks(7) {
            parser.feed(half, &mut out);
        }
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Event::Command(cmd) if cmd.file_id == "1"));
    }

    #[test]
    fn test_bel_terminated_envelope() {
        let wire = "\x1b]5113;id=r;action=status\x07";
        let events = feed_all(wire.as_bytes());
        assert!(matches!(&events[0], Event::Command(_)));
    }

    #[test]
    fn test_unrelated_osc_ignored() {
        let events = feed_all(b"\x1b]0;window title\x1b\\y");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Text(t) if t == "y"));
    }

    #[test]
    fn test_text_interleaved_with_frames() {
        let wire = "y\x1b]5113;id=r;action=status\x1b\\n";
        let events = feed_all(wire.as_bytes());
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::Text(t) if t == "y"));
        assert!(matches!(&events[1], Event::Command(_)));
        assert!(matches!(&events[2], Event::Text(t) if t == "n"));
    }
}
