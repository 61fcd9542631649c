//! Sender side of the in-band terminal file-transfer protocol.
//!
//! A session walks the requested paths into a plan, asks the terminal for
//! permission, streams per-file metadata and compressed data chunks inside
//! escape-sequence envelopes, and tracks receiver acknowledgements until
//! every file reaches a terminal state.
//!
//! # Architecture
//!
//! ```text
//! +---------+     +-------------+     +----------+
//! | Planner | --> | SendManager | --> |  Driver  | <--> terminal
//! | (walk)  |     | (state)     |     | (loop)   |
//! +---------+     +-------------+     +----------+
//!                       |
//!                 ProgressTracker
//! ```
//!
//! Three-phase protocol: permission (`send` + session status), metadata
//! (`file` per entry), data (`data`/`end_data` chunks), closed by `finish`
//! or `cancel`.

pub mod compress;
pub mod driver;
pub mod manager;
pub mod plan;
pub mod progress;
pub mod protocol;

pub use compress::{should_be_compressed, Compressor};
pub use driver::{Driver, Event, Key, SendOutcome};
pub use manager::{SendManager, SendState};
pub use plan::{files_for_send, File, FileState, PlanOptions, CHUNK_SIZE};
pub use progress::ProgressTracker;
pub use protocol::{
    encode_password, parse_envelope_payload, wrap_envelope, Action, Compression, FileKind,
    FileTransmissionCommand, TransmissionType, FILE_TRANSFER_CODE, FRAME_DATA_SIZE,
};
