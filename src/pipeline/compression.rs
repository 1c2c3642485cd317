//! Streaming zstd compression stage.

use crate::error::CompressionError;
use bytes::Bytes;
use std::io::Write;
use zstd::stream::write::Encoder;

/// Content-Encoding value for compressed exports.
pub const CONTENT_ENCODING: &str = "zstd";

/// Key suffix appended after `.csv` for compressed exports.
pub const FILE_SUFFIX: &str = ".zst";

/// Valid zstd levels (0 selects the library default).
pub const LEVEL_RANGE: std::ops::RangeInclusive<i32> = 0..=22;

/// Incremental zstd encoder.
///
/// Each call to [`compress`](Self::compress) returns whatever compressed bytes
/// the encoder has produced so far, which may be empty while zstd fills its
/// window. [`finish`](Self::finish) writes the frame epilogue.
pub struct StreamCompressor {
    encoder: Encoder<'static, Vec<u8>>,
}

impl StreamCompressor {
    pub fn new(level: i32) -> Result<Self, CompressionError> {
        Ok(Self {
            encoder: Encoder::new(Vec::new(), level)?,
        })
    }

    /// Compress one chunk and drain the produced output.
    pub fn compress(&mut self, input: &[u8]) -> Result<Bytes, CompressionError> {
        self.encoder.write_all(input)?;
        Ok(Bytes::from(std::mem::take(self.encoder.get_mut())))
    }

    /// Finish the frame and return the remaining output.
    pub fn finish(self) -> Result<Bytes, CompressionError> {
        Ok(Bytes::from(self.encoder.finish()?))
    }
}
