//! Audio frame types and fixed-size chunking for the recognizer feed path.

use bytes::{Bytes, BytesMut};

/// Sample rate the recognizer backends expect (Hz).
pub const SAMPLE_RATE: u32 = 16_000;
/// Channel count the recognizer backends expect.
pub const NUM_CHANNELS: u16 = 1;
/// Sample width the recognizer backends expect (linear16 PCM).
pub const BITS_PER_SAMPLE: u16 = 16;
/// Duration of one recognizer chunk in milliseconds.
pub const CHUNK_DURATION_MS: u32 = 50;

/// Samples per channel in one 50 ms chunk at the given rate.
#[inline]
pub fn samples_per_chunk(sample_rate: u32) -> usize {
    (sample_rate / (1000 / CHUNK_DURATION_MS)) as usize
}

/// Declared PCM layout of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// The reference configuration: 16 kHz mono linear16.
    pub fn linear16() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: NUM_CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
        }
    }

    /// Size in bytes of one sample across all channels.
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// One frame of PCM audio pushed into a stream.
///
/// The payload is opaque to the bridge; the format fields describe what the
/// caller claims the bytes contain. Frames whose format differs from the
/// stream's fixed format are rejected at ingest.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFrame {
    pub fn new(
        data: impl Into<Bytes>,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    ) -> Self {
        Self {
            data: data.into(),
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Frame in the reference configuration (16 kHz mono linear16).
    pub fn linear16(data: impl Into<Bytes>) -> Self {
        let format = AudioFormat::linear16();
        Self::new(
            data,
            format.sample_rate,
            format.channels,
            format.bits_per_sample,
        )
    }

    #[inline]
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }

    /// Samples per channel carried by this frame.
    #[inline]
    pub fn samples_per_channel(&self) -> usize {
        let bytes_per_sample = self.format().bytes_per_sample();
        if bytes_per_sample == 0 {
            return 0;
        }
        self.data.len() / bytes_per_sample
    }
}

/// Accumulates arbitrary-size writes and emits fixed-size chunks.
///
/// `write` only ever yields full chunks; a trailing remainder stays buffered
/// until more bytes arrive or `flush` is called. Byte order is preserved
/// exactly and no byte is emitted twice.
#[derive(Debug)]
pub struct AudioChunker {
    buffer: BytesMut,
    chunk_size: usize,
}

impl AudioChunker {
    /// # Arguments
    /// * `channels` - Interleaved channel count
    /// * `samples_per_chunk` - Samples per channel in one emitted chunk
    pub fn new(channels: u16, samples_per_chunk: usize) -> Self {
        let bytes_per_sample = channels as usize * (BITS_PER_SAMPLE as usize / 8);
        Self {
            buffer: BytesMut::new(),
            chunk_size: samples_per_chunk * bytes_per_sample,
        }
    }

    /// Chunker emitting 50 ms chunks for the given format; in the reference
    /// configuration (16 kHz mono linear16) that is 1600 bytes per chunk.
    pub fn for_format(format: AudioFormat) -> Self {
        Self::new(format.channels, samples_per_chunk(format.sample_rate))
    }

    /// Size in bytes of one emitted chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes currently buffered below one chunk.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `data` and return every full chunk now available, in order.
    pub fn write(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut chunks = Vec::with_capacity(self.buffer.len() / self.chunk_size);
        while self.buffer.len() >= self.chunk_size {
            chunks.push(self.buffer.split_to(self.chunk_size).freeze());
        }
        chunks
    }

    /// Emit the buffered remainder as one short chunk, or `None` when the
    /// buffer is empty.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_constants_give_1600_byte_chunks() {
        let chunker = AudioChunker::for_format(AudioFormat::linear16());
        assert_eq!(chunker.chunk_size(), 1600);
        assert_eq!(samples_per_chunk(SAMPLE_RATE), 800);
    }

    #[test]
    fn test_write_emits_only_full_chunks() {
        let mut chunker = AudioChunker::new(NUM_CHANNELS, 800);

        // 2.5 chunks in: exactly two chunks out, half a chunk retained.
        let input = pattern(4000);
        let chunks = chunker.write(&input);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 1600));
        assert_eq!(chunker.buffered(), 800);

        let tail = chunker.flush().unwrap();
        assert_eq!(tail.len(), 800);

        // Byte order preserved across write and flush.
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            reassembled.extend_from_slice(chunk);
        }
        reassembled.extend_from_slice(&tail);
        assert_eq!(reassembled, input);
    }

    #[test]
    fn test_small_writes_accumulate() {
        let mut chunker = AudioChunker::new(NUM_CHANNELS, 800);

        let input = pattern(1600);
        // Feed one byte short of a chunk, then the last byte.
        assert!(chunker.write(&input[..1599]).is_empty());
        assert_eq!(chunker.buffered(), 1599);

        let chunks = chunker.write(&input[1599..]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], &input[..]);
        assert_eq!(chunker.buffered(), 0);
    }

    #[test]
    fn test_exact_multiple_leaves_nothing_buffered() {
        let mut chunker = AudioChunker::new(NUM_CHANNELS, 800);

        let chunks = chunker.write(&pattern(3200));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunker.buffered(), 0);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn test_flush_on_empty_buffer_is_none() {
        let mut chunker = AudioChunker::new(NUM_CHANNELS, 800);
        assert!(chunker.flush().is_none());

        // Flushing twice does not invent data.
        chunker.write(&pattern(100));
        assert!(chunker.flush().is_some());
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn test_chunker_continues_after_flush() {
        let mut chunker = AudioChunker::new(NUM_CHANNELS, 800);
        chunker.write(&pattern(200));
        chunker.flush();

        let chunks = chunker.write(&pattern(1600));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1600);
    }

    #[test]
    fn test_frame_format_helpers() {
        let frame = AudioFrame::linear16(pattern(3200));
        assert_eq!(frame.format(), AudioFormat::linear16());
        assert_eq!(frame.samples_per_channel(), 1600);
        assert_eq!(frame.format().bytes_per_sample(), 2);
    }
}
