//! Protocol command codec for the terminal file-transfer channel.
//!
//! Every message is a `FileTransmissionCommand`: a flat record serialized as
//! comma-separated `key=value` pairs. Byte-valued fields (`name`, `status`,
//! `data`, `password`) are base64-coded so arbitrary bytes survive the text
//! grammar. On the wire each outbound command is wrapped in an OSC envelope:
//!
//! ```text
//! ESC ] 5113 ; id=<request_id> ; <serialized command> ESC \
//! ```
//!
//! Inbound frames arrive with the same payload shape; frames whose id does
//! not match the session's request id are dropped by the driver.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Result, SendError};

/// OSC code identifying file-transfer frames.
pub const FILE_TRANSFER_CODE: u32 = 5113;

/// Maximum compressed payload carried by a single `data`/`end_data` frame.
pub const FRAME_DATA_SIZE: usize = 4096;

// =============================================================================
// Wire enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start of session, carries the encoded password.
    Send,
    /// Metadata for one plan entry.
    File,
    /// A non-terminal payload chunk.
    Data,
    /// The terminal payload chunk for a file.
    EndData,
    /// Receiver-side status report (session or per-file).
    Status,
    /// Sender aborts the session.
    Cancel,
    /// Sender completed all files.
    Finish,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Send => "send",
            Action::File => "file",
            Action::Data => "data",
            Action::EndData => "end_data",
            Action::Status => "status",
            Action::Cancel => "cancel",
            Action::Finish => "finish",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Action::Send),
            "file" => Some(Action::File),
            "data" => Some(Action::Data),
            "end_data" => Some(Action::EndData),
            "status" => Some(Action::Status),
            "cancel" => Some(Action::Cancel),
            "finish" => Some(Action::Finish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Compression::None),
            "zlib" => Some(Compression::Zlib),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Regular,
    Directory,
    Symlink,
    /// Hard link to another planned file; its payload is the target's id.
    Link,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Regular => "regular",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
            FileKind::Link => "link",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(FileKind::Regular),
            "directory" => Some(FileKind::Directory),
            "symlink" => Some(FileKind::Symlink),
            "link" => Some(FileKind::Link),
            _ => None,
        }
    }

    /// Short marker used in the confirm-paths listing.
    pub fn short_text(self) -> &'static str {
        match self {
            FileKind::Regular => "file",
            FileKind::Directory => "dir ",
            FileKind::Symlink => "sym ",
            FileKind::Link => "link",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionType {
    /// Bytes are sent verbatim after compression.
    #[default]
    Simple,
    /// Delta-transfer handshake hook; no payload is produced by the sender.
    Rsync,
}

impl TransmissionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransmissionType::Simple => "simple",
            TransmissionType::Rsync => "rsync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(TransmissionType::Simple),
            "rsync" => Some(TransmissionType::Rsync),
            _ => None,
        }
    }
}

// =============================================================================
// FileTransmissionCommand
// =============================================================================

/// One protocol message. Fields left at their defaults are omitted from the
/// serialized form; `-1` marks unset numeric fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransmissionCommand {
    pub action: Action,
    pub id: String,
    pub file_id: String,
    pub status: String,
    pub name: String,
    pub size: i64,
    pub mtime: i64,
    pub permissions: i64,
    pub compression: Compression,
    pub ftype: FileKind,
    pub ttype: TransmissionType,
    pub data: Bytes,
    pub password: String,
}

impl FileTransmissionCommand {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: String::new(),
            file_id: String::new(),
            status: String::new(),
            name: String::new(),
            size: -1,
            mtime: -1,
            permissions: -1,
            compression: Compression::default(),
            ftype: FileKind::default(),
            ttype: TransmissionType::default(),
            data: Bytes::new(),
            password: String::new(),
        }
    }

    /// Serialize to the key=value wire form. The request id is normally
    /// carried by the envelope, not the command body.
    pub fn serialize(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(format!("action={}", self.action.as_str()));
        if !self.id.is_empty() {
            parts.push(format!("id={}", self.id));
        }
        if !self.file_id.is_empty() {
            parts.push(format!("file_id={}", self.file_id));
        }
        if !self.status.is_empty() {
            parts.push(format!("status={}", BASE64.encode(&self.status)));
        }
        if !self.name.is_empty() {
            parts.push(format!("name={}", BASE64.encode(&self.name)));
        }
        if self.size >= 0 {
            parts.push(format!("size={}", self.size));
        }
        if self.mtime >= 0 {
            parts.push(format!("mtime={}", self.mtime));
        }
        if self.permissions >= 0 {
            parts.push(format!("permissions={}", self.permissions));
        }
        if self.compression != Compression::None {
            parts.push(format!("compression={}", self.compression.as_str()));
        }
        if self.ftype != FileKind::Regular {
            parts.push(format!("ftype={}", self.ftype.as_str()));
        }
        if self.ttype != TransmissionType::Simple {
            parts.push(format!("ttype={}", self.ttype.as_str()));
        }
        if !self.data.is_empty() {
            parts.push(format!("data={}", BASE64.encode(&self.data)));
        }
        if !self.password.is_empty() {
            parts.push(format!("password={}", BASE64.encode(&self.password)));
        }
        parts.join(",")
    }

    /// Parse the key=value wire form. Unknown keys are ignored; a missing
    /// `action` is an error.
    pub fn parse(input: &str) -> Result<Self> {
        let mut cmd = FileTransmissionCommand::new(Action::Status);
        let mut saw_action = false;
        for pair in input.split(',') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| SendError::Protocol(format!("field without '=': {pair:?}")))?;
            match key {
                "action" => {
                    cmd.action = Action::from_str(value)
                        .ok_or_else(|| SendError::Protocol(format!("unknown action {value:?}")))?;
                    saw_action = true;
                }
                "id" => cmd.id = value.to_string(),
                "file_id" => cmd.file_id = value.to_string(),
                "status" => cmd.status = decode_text(key, value)?,
                "name" => cmd.name = decode_text(key, value)?,
                "size" => cmd.size = decode_int(key, value)?,
                "mtime" => cmd.mtime = decode_int(key, value)?,
                "permissions" => cmd.permissions = decode_int(key, value)?,
                "compression" => {
                    cmd.compression = Compression::from_str(value).ok_or_else(|| {
                        SendError::Protocol(format!("unknown compression {value:?}"))
                    })?;
                }
                "ftype" => {
                    cmd.ftype = FileKind::from_str(value)
                        .ok_or_else(|| SendError::Protocol(format!("unknown ftype {value:?}")))?;
                }
                "ttype" => {
                    cmd.ttype = TransmissionType::from_str(value)
                        .ok_or_else(|| SendError::Protocol(format!("unknown ttype {value:?}")))?;
                }
                "data" => {
                    cmd.data = Bytes::from(decode_bytes(key, value)?);
                }
                "password" => cmd.password = decode_text(key, value)?,
                _ => {}
            }
        }
        if !saw_action {
            return Err(SendError::Protocol("command without action".to_string()));
        }
        Ok(cmd)
    }
}

fn decode_bytes(key: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| SendError::Protocol(format!("bad base64 in {key}: {e}")))
}

fn decode_text(key: &str, value: &str) -> Result<String> {
    let raw = decode_bytes(key, value)?;
    String::from_utf8(raw).map_err(|e| SendError::Protocol(format!("bad utf-8 in {key}: {e}")))
}

fn decode_int(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| SendError::Protocol(format!("bad integer in {key}: {e}")))
}

// =============================================================================
// Envelope
// =============================================================================

/// Wrap a serialized command for transmission to the terminal.
pub fn wrap_envelope(request_id: &str, serialized: &str) -> String {
    format!("\x1b]{FILE_TRANSFER_CODE};id={request_id};{serialized}\x1b\\")
}

/// Parse the payload of an already-unwrapped inbound envelope, which carries
/// `id=<request_id>;<serialized command>`.
pub fn parse_envelope_payload(payload: &str) -> Result<FileTransmissionCommand> {
    let (id_part, rest) = payload
        .split_once(';')
        .ok_or_else(|| SendError::Protocol("envelope payload without id".to_string()))?;
    let id = id_part
        .strip_prefix("id=")
        .ok_or_else(|| SendError::Protocol(format!("envelope payload starts with {id_part:?}")))?;
    let mut cmd = FileTransmissionCommand::parse(rest)?;
    cmd.id = id.to_string();
    Ok(cmd)
}

/// Encode the shared-secret password for the start frame, bound to this
/// session's request id.
pub fn encode_password(request_id: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let mut cmd = FileTransmissionCommand::new(Action::File);
        cmd.file_id = "a".to_string();
        cmd.name = "~/a/hello.txt".to_string();
        cmd.size = 12;
        cmd.mtime = 1_700_000_000_000_000_000;
        cmd.permissions = 0o644;
        cmd.compression = Compression::Zlib;
        cmd.ftype = FileKind::Regular;

        let parsed = FileTransmissionCommand::parse(&cmd.serialize()).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_data_roundtrip_with_nul_bytes() {
        let mut cmd = FileTransmissionCommand::new(Action::Data);
        cmd.file_id = "1f".to_string();
        cmd.data = Bytes::from(vec![0u8, 1, 2, 0, 255, 0]);

        let wire = cmd.serialize();
        let parsed = FileTransmissionCommand::parse(&wire).unwrap();
        assert_eq!(parsed.data.as_ref(), &[0u8, 1, 2, 0, 255, 0]);
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_name_with_separator_bytes() {
        let mut cmd = FileTransmissionCommand::new(Action::File);
        cmd.file_id = "2".to_string();
        cmd.name = "dir,with=odd;chars/file".to_string();

        let parsed = FileTransmissionCommand::parse(&cmd.serialize()).unwrap();
        assert_eq!(parsed.name, "dir,with=odd;chars/file");
    }

    #[test]
    fn test_defaults_omitted() {
        let cmd = FileTransmissionCommand::new(Action::Finish);
        assert_eq!(cmd.serialize(), "action=finish");
    }

    #[test]
    fn test_parse_rejects_missing_action() {
        assert!(FileTransmissionCommand::parse("file_id=1").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert!(FileTransmissionCommand::parse("action=explode").is_err());
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let cmd = FileTransmissionCommand::parse("action=status,future_field=1").unwrap();
        assert_eq!(cmd.action, Action::Status);
    }

    #[test]
    fn test_envelope_wrap_shape() {
        let wire = wrap_envelope("abc123", "action=finish");
        assert_eq!(wire, "\x1b]5113;id=abc123;action=finish\x1b\\");
    }

    #[test]
    fn test_envelope_payload_parse() {
        let mut status = FileTransmissionCommand::new(Action::Status);
        status.status = "OK".to_string();
        let payload = format!("id=req9;{}", status.serialize());

        let parsed = parse_envelope_payload(&payload).unwrap();
        assert_eq!(parsed.id, "req9");
        assert_eq!(parsed.status, "OK");
    }

    #[test]
    fn test_encode_password_binds_request_id() {
        let a = encode_password("req1", "secret");
        let b = encode_password("req2", "secret");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), 7 + 64);
        assert_ne!(a, b);
    }
}
