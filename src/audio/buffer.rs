//! Audio chunk buffering between flush ticks

use std::sync::{Arc, Mutex, MutexGuard};

/// Sample blocks collected since the last drain, in arrival order
#[derive(Debug, Default)]
pub(crate) struct ChunkBuffer {
    blocks: Vec<Vec<i16>>,
}

impl ChunkBuffer {
    pub(crate) fn push(&mut self, block: Vec<i16>) {
        if !block.is_empty() {
            self.blocks.push(block);
        }
    }

    /// Concatenate every pending block into one payload and reset to empty
    pub(crate) fn drain(&mut self) -> Vec<i16> {
        let total = self.blocks.iter().map(Vec::len).sum();
        let mut combined = Vec::with_capacity(total);
        for block in self.blocks.drain(..) {
            combined.extend_from_slice(&block);
        }
        combined
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// Buffer shared between the capture callback and the flush loop
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedChunkBuffer {
    inner: Arc<Mutex<ChunkBuffer>>,
}

impl SharedChunkBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChunkBuffer> {
        // A panicking audio callback must not wedge the recorder
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn push(&self, block: Vec<i16>) {
        self.lock().push(block);
    }

    pub(crate) fn drain(&self) -> Vec<i16> {
        self.lock().drain()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// Serialize samples as little-endian 16-bit PCM
pub(crate) fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_concatenates_in_order() {
        let mut buffer = ChunkBuffer::default();
        buffer.push(vec![1, 2, 3, 4]);
        buffer.push(vec![5, 6, 7, 8]);
        buffer.push(vec![9, 10]);

        let payload = buffer.drain();
        assert_eq!(payload, (1..=10).collect::<Vec<i16>>());
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_empty_blocks_are_ignored() {
        let mut buffer = ChunkBuffer::default();
        buffer.push(Vec::new());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_shared_buffer_clear() {
        let shared = SharedChunkBuffer::new();
        shared.push(vec![1, 2]);
        shared.clone().clear();
        assert!(shared.lock().is_empty());
    }

    #[test]
    fn test_pcm_bytes_little_endian() {
        assert_eq!(pcm_bytes(&[1, -2, 0x1234]), vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert!(pcm_bytes(&[]).is_empty());
    }
}
