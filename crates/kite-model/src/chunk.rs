use serde::{Deserialize, Serialize};

/// A bounded slice of a job's combined output stream.
///
/// Chunks may arrive at the control plane in any order; `sequence` and
/// `offset` are what the receiving side uses to reassemble the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Position of this chunk in the stream, starting at 0.
    pub sequence: u64,
    /// Byte offset of the first byte of `data` within the logical stream.
    pub offset: u64,
    /// Length of `data` in bytes.
    pub size: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl LogChunk {
    pub fn new(sequence: u64, offset: u64, data: Vec<u8>) -> Self {
        Self {
            sequence,
            offset,
            size: data.len() as u64,
            data,
        }
    }

    /// Offset one past the last byte of this chunk.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}
