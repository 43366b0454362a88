//! Payload compression (`zlib`, `zlib@openssh.com`).
//!
//! Each direction keeps one long-lived zlib stream and flushes it with
//! `Z_SYNC_FLUSH` after every packet, as RFC 4253 Section 6.2 requires.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use latch_platform::{LatchError, LatchResult};

/// Compresses outbound payloads or decompresses inbound ones.
pub trait Compressor: Send {
    /// Compresses one payload.
    fn compress(&mut self, data: &[u8]) -> LatchResult<Vec<u8>>;

    /// Decompresses one payload, failing once the output would exceed `limit`.
    fn decompress(&mut self, data: &[u8], limit: usize) -> LatchResult<Vec<u8>>;
}

/// Streaming zlib state for one direction.
pub struct Zlib {
    deflate: Compress,
    inflate: Decompress,
}

impl Zlib {
    /// Creates a fresh stream pair at the default compression level.
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }
}

impl Default for Zlib {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Zlib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zlib")
            .field("total_in", &self.deflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .finish()
    }
}

impl Compressor for Zlib {
    fn compress(&mut self, data: &[u8]) -> LatchResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let mut input = data;
        loop {
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| LatchError::Other(Box::new(e)))?;
            let consumed = (self.deflate.total_in() - before) as usize;
            input = &input[consumed..];
            // Flush is complete once zlib stops filling the buffer
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(256));
        }
        Ok(out)
    }

    fn decompress(&mut self, data: &[u8], limit: usize) -> LatchResult<Vec<u8>> {
        let mut out = Vec::with_capacity((data.len() * 4).clamp(256, limit.max(256)));
        let mut input = data;
        loop {
            let before = self.inflate.total_in();
            let status = self
                .inflate
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| LatchError::Protocol(format!("Decompression failed: {}", e)))?;
            let consumed = (self.inflate.total_in() - before) as usize;
            input = &input[consumed..];
            if out.len() > limit {
                return Err(LatchError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    limit
                )));
            }
            if status == Status::StreamEnd || (input.is_empty() && out.len() < out.capacity()) {
                break;
            }
            if consumed == 0 && out.len() < out.capacity() {
                return Err(LatchError::Protocol(
                    "Truncated compressed payload".to_string(),
                ));
            }
            out.reserve(out.capacity().max(256));
        }
        Ok(out)
    }
}

/// Constructor for `zlib` and `zlib@openssh.com`.
pub fn new_zlib() -> LatchResult<Box<dyn Compressor>> {
    Ok(Box::new(Zlib::new()))
}
