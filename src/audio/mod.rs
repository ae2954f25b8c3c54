//! # Audio Pipeline
//!
//! Everything that touches raw audio on its way between the client and the
//! conversational endpoint.
//!
//! ## Components:
//! - **codec**: pure format conversions (resampling, PCM16, base64)
//! - **capture**: the capture source feeding fixed-size chunks into a session
//! - **playback**: the FIFO sink that paces endpoint audio back to the client

pub mod capture;
pub mod codec;
pub mod playback;

use serde::{Deserialize, Serialize};

/// One block of raw PCM16 audio travelling in a single direction.
///
/// Sequence numbers are assigned by the producer and strictly increase per
/// direction within a session. They are used for echo/diagnostics only.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Little-endian signed 16-bit PCM, interleaved when `channels > 1`
    pub payload: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sequence_number: u64,
    /// Milliseconds since the Unix epoch, as stamped by the producer
    pub capture_timestamp: i64,
}

impl AudioChunk {
    pub fn new(payload: Vec<u8>, sample_rate: u32, channels: u16, sequence_number: u64, capture_timestamp: i64) -> Self {
        Self {
            payload,
            sample_rate,
            channels,
            sequence_number,
            capture_timestamp,
        }
    }

    /// Number of frames (samples per channel) carried by this chunk.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.payload.len() / 2 / usize::from(self.channels)
    }

    pub fn stamp(&self) -> EchoStamp {
        EchoStamp {
            timestamp: self.capture_timestamp,
            sequence_number: self.sequence_number,
        }
    }
}

/// Timestamp and sequence number a sender attached to an outbound message,
/// returned unchanged on the correlated inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoStamp {
    pub timestamp: i64,
    pub sequence_number: u64,
}

/// Sample format of an audio stream: rate and interleaved channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count_accounts_for_channels() {
        let chunk = AudioChunk::new(vec![0u8; 3200], 16000, 2, 1, 0);
        assert_eq!(chunk.frame_count(), 800);

        let broken = AudioChunk::new(vec![0u8; 10], 16000, 0, 1, 0);
        assert_eq!(broken.frame_count(), 0);
    }
}
