//! Per-file streaming compression.
//!
//! Two variants behind one contract: an identity passthrough and a zlib
//! deflate stream with a single terminating flush. The variant is chosen at
//! plan time; large regular files whose name does not look like an
//! already-compressed format get zlib.

use std::path::Path;

use flate2::{Compress, Compression as Level, FlushCompress, Status};

use crate::error::{Result, SendError};

/// Extensions of formats that are already entropy-coded; recompressing them
/// wastes cycles for no gain.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "7z", "apk", "avi", "br", "bz2", "deb", "docx", "epub", "flac", "gif", "gz", "heic", "jar",
    "jpeg", "jpg", "lz4", "mkv", "mov", "mp3", "mp4", "odt", "ogg", "opus", "png", "pptx", "rar",
    "rpm", "tbz2", "tgz", "txz", "webm", "webp", "whl", "xlsx", "xz", "zip", "zst",
];

/// Filename heuristic for the compression decision.
pub fn should_be_compressed(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            !COMPRESSED_EXTENSIONS.contains(&ext.as_str())
        }
        None => true,
    }
}

pub enum Compressor {
    Identity,
    Zlib(Box<Compress>),
}

impl Compressor {
    pub fn identity() -> Self {
        Compressor::Identity
    }

    pub fn zlib() -> Self {
        Compressor::Zlib(Box::new(Compress::new(Level::default(), true)))
    }

    /// Feed one chunk of raw bytes, returning whatever compressed output the
    /// stream produces now. The stream may buffer; the remainder comes out
    /// of [`Compressor::flush`].
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Identity => Ok(data.to_vec()),
            Compressor::Zlib(stream) => deflate(stream, data, FlushCompress::None),
        }
    }

    /// Terminate the stream. Identity has nothing buffered; zlib emits the
    /// remaining window plus the stream trailer.
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        match self {
            Compressor::Identity => Ok(Vec::new()),
            Compressor::Zlib(stream) => deflate(stream, &[], FlushCompress::Finish),
        }
    }
}

fn deflate(stream: &mut Compress, mut input: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    loop {
        if out.len() == out.capacity() {
            out.reserve(8 * 1024);
        }
        let before = stream.total_in();
        let status = stream
            .compress_vec(input, &mut out, flush)
            .map_err(|e| SendError::Compress(e.to_string()))?;
        let consumed = (stream.total_in() - before) as usize;
        input = &input[consumed..];
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if matches!(flush, FlushCompress::Finish) {
                    continue;
                }
                if input.is_empty() && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }
    Ok(out)
}
