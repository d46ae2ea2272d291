//! Codec session capability.
//!
//! The harness never encodes or decodes anything itself. A [`SessionFactory`]
//! opens a [`CodecSession`] for a test; frames are submitted through the
//! session and results come back asynchronously as [`CodecEvent`]s on the
//! completion channel handed to `open`. Events may arrive in any order.
//! Closing the session must drop its completion sender so the stream ends.

use crate::definition::{
    Bitrate, BitrateMode, Parameter, ParameterValue, PixelFormat, Resolution, TestDefinition,
};
use crate::result::BenchResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Sender half of a session's completion stream
pub type CompletionSender = mpsc::UnboundedSender<CodecEvent>;

/// Receiver half of a session's completion stream
pub type CompletionReceiver = mpsc::UnboundedReceiver<CodecEvent>;

/// An open session
pub type SessionHandle = Box<dyn CodecSession>;

/// Create a completion channel
#[must_use]
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Encode or decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Raw frames in, bitstream out
    Encode,
    /// Bitstream in, raw frames out
    Decode,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => f.write_str("encode"),
            Self::Decode => f.write_str("decode"),
        }
    }
}

/// A frame handed to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Input frame index
    pub index: u64,
    /// Frame bytes
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds
    pub pts_usec: i64,
    /// Frame duration in microseconds
    pub duration_usec: i64,
}

/// A unit of codec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    /// Presentation timestamp reported by the codec
    pub pts_usec: i64,
    /// Output bytes
    pub data: Vec<u8>,
    /// Sync frame flag
    pub is_key_frame: bool,
}

impl EncodedSample {
    /// Output size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Asynchronous result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    /// Encoder produced a sample
    Encoded(EncodedSample),
    /// Decoder produced a frame
    Decoded {
        /// Presentation timestamp reported by the codec
        pts_usec: i64,
    },
    /// Codec discarded a submitted frame
    Dropped {
        /// Presentation timestamp reported by the codec
        pts_usec: i64,
    },
    /// Codec failed; the test cannot continue
    Error {
        /// Error message
        message: String,
    },
}

/// Everything a factory needs to open a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Codec identity
    pub codec: String,
    /// Encode or decode
    pub direction: Direction,
    /// Frame dimensions
    pub resolution: Resolution,
    /// Raw pixel layout
    pub pixel_format: PixelFormat,
    /// Initial target bitrate
    pub bitrate: Option<Bitrate>,
    /// Rate control mode
    pub bitrate_mode: BitrateMode,
    /// Output frame rate
    pub frame_rate: f64,
    /// Seconds between sync frames
    pub i_frame_interval: Option<u32>,
    /// Configure-time parameters
    pub parameters: Vec<Parameter>,
}

impl SessionConfig {
    /// Derive the session configuration for a test at the given output rate
    #[must_use]
    pub fn from_test(test: &TestDefinition, frame_rate: f64) -> Self {
        let configure = &test.configure;
        Self {
            codec: configure.codec.clone(),
            direction: if configure.encode {
                Direction::Encode
            } else {
                Direction::Decode
            },
            resolution: configure.resolution.unwrap_or(test.input.resolution),
            pixel_format: test.input.pixel_format,
            bitrate: configure.bitrate,
            bitrate_mode: configure.bitrate_mode,
            frame_rate,
            i_frame_interval: configure.i_frame_interval,
            parameters: configure.parameters.clone(),
        }
    }
}

/// A live codec session owned by one executor
#[async_trait]
pub trait CodecSession: Send {
    /// Codec name for reports
    fn name(&self) -> &str;

    /// Queue a frame; the result arrives later on the completion channel
    async fn submit_frame(&mut self, frame: RawFrame) -> BenchResult<()>;

    /// Request a sync frame at the next submission
    async fn force_keyframe(&mut self) -> BenchResult<()>;

    /// Change the target bitrate
    async fn set_bitrate(&mut self, bps: u64, constant_rate: bool) -> BenchResult<()>;

    /// Set a codec parameter
    async fn set_property(&mut self, key: &str, value: &ParameterValue) -> BenchResult<()>;

    /// Return once every frame submitted up to `until_pts_usec` has a result
    async fn flush(&mut self, until_pts_usec: i64) -> BenchResult<()>;

    /// Release the session and end its completion stream
    async fn close(&mut self) -> BenchResult<()>;
}

/// Opens codec sessions by codec identity
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session that reports to `completions`
    async fn open(
        &self,
        config: &SessionConfig,
        completions: CompletionSender,
    ) -> BenchResult<SessionHandle>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::definition::{Bitrate, BitrateMode};

    #[test]
    fn test_config_from_encode_test() {
        let test = crate::definition::TestDefinition::new("t", "hevc", "clip.yuv")
            .with_resolution(640, 480)
            .with_bitrate(Bitrate::from_bps(750_000), BitrateMode::Cbr);
        let config = SessionConfig::from_test(&test, 25.0);
        assert_eq!(config.codec, "hevc");
        assert_eq!(config.direction, Direction::Encode);
        assert_eq!(config.resolution, Resolution::new(640, 480));
        assert_eq!(config.bitrate, Some(Bitrate::from_bps(750_000)));
        assert!(config.bitrate_mode.is_constant());
        assert_eq!(config.frame_rate, 25.0);
    }

    #[test]
    fn test_config_output_resolution_and_direction() {
        let mut test = crate::definition::TestDefinition::new("t", "h264", "clip.h264").decode_only();
        test.configure.resolution = Some(Resolution::new(320, 240));
        let config = SessionConfig::from_test(&test, 30.0);
        assert_eq!(config.direction, Direction::Decode);
        assert_eq!(config.resolution, Resolution::new(320, 240));
        assert_eq!(config.direction.to_string(), "decode");
    }

    #[test]
    fn test_sample_size() {
        let sample = EncodedSample {
            pts_usec: 0,
            data: vec![0; 42],
            is_key_frame: true,
        };
        assert_eq!(sample.size(), 42);
    }

    #[tokio::test]
    async fn test_completion_channel_ends_when_sender_drops() {
        let (tx, mut rx) = completion_channel();
        tx.send(CodecEvent::Decoded { pts_usec: 5 }).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Some(CodecEvent::Decoded { pts_usec: 5 }));
        assert_eq!(rx.recv().await, None);
    }
}
