//! Test definitions.
//!
//! In-memory form of a test suite: an ordered list of tests, each with an
//! input description, an encoder configuration, frame-indexed runtime events
//! and optional parallel sub-tests. Everything here is immutable once built;
//! the types derive serde so an external parser can produce them.

use crate::result::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Magnitudes
// =============================================================================

/// Parse a magnitude string such as `"500k"`, `"2M"`, `"2 Mbps"` or `"800"`.
///
/// `k` multiplies by 10³ and `M` by 10⁶; a trailing `bps` and spaces are
/// ignored.
pub fn parse_magnitude(text: &str) -> BenchResult<i64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let body = compact.strip_suffix("bps").unwrap_or(&compact);
    let (digits, scale) = if let Some(head) = body.strip_suffix('k') {
        (head, 1_000)
    } else if let Some(head) = body.strip_suffix('M') {
        (head, 1_000_000)
    } else {
        (body, 1)
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| BenchError::configuration(format!("invalid magnitude '{text}'")))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| BenchError::configuration(format!("magnitude '{text}' overflows")))
}

/// Target bitrate in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "BitrateRepr", into = "u64")]
pub struct Bitrate(u64);

impl Bitrate {
    /// Create from bits per second
    #[must_use]
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    /// Bits per second
    #[must_use]
    pub const fn bps(self) -> u64 {
        self.0
    }
}

impl FromStr for Bitrate {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse_magnitude(s)?;
        u64::try_from(value)
            .map(Self)
            .map_err(|_| BenchError::configuration(format!("negative bitrate '{s}'")))
    }
}

impl From<Bitrate> for u64 {
    fn from(bitrate: Bitrate) -> Self {
        bitrate.0
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bps", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BitrateRepr {
    Bps(u64),
    Text(String),
}

impl TryFrom<BitrateRepr> for Bitrate {
    type Error = BenchError;

    fn try_from(repr: BitrateRepr) -> Result<Self, Self::Error> {
        match repr {
            BitrateRepr::Bps(bps) => Ok(Self(bps)),
            BitrateRepr::Text(text) => text.parse(),
        }
    }
}

// =============================================================================
// Frame geometry
// =============================================================================

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a resolution
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels
    #[must_use]
    pub const fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl FromStr for Resolution {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BenchError::configuration(format!("invalid resolution '{s}'"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse().map_err(|_| invalid())?;
        let height = h.trim().parse().map_err(|_| invalid())?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = BenchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(resolution: Resolution) -> Self {
        resolution.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Raw pixel layout of the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0, 8 bit
    #[default]
    Yuv420p,
    /// Semi-planar 4:2:0, 8 bit
    Nv12,
    /// Semi-planar 4:2:0 with swapped chroma, 8 bit
    Nv21,
    /// Packed RGBA, 8 bit per channel
    Rgba,
    /// Semi-planar 4:2:0, 10 bit in 16 bit words
    P010,
}

impl PixelFormat {
    /// Fixed byte size of one frame at `resolution`
    #[must_use]
    pub const fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixels();
        match self {
            Self::Yuv420p | Self::Nv12 | Self::Nv21 => pixels * 3 / 2,
            Self::Rgba => pixels * 4,
            Self::P010 => pixels * 3,
        }
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Declared type of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataValueType {
    /// 32-bit style integer, magnitude suffixes allowed
    Int,
    /// 64-bit integer
    Long,
    /// Floating point
    Float,
    /// Free text
    String,
    /// Boolean flag
    Bool,
}

/// A value the codec session understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Text(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// A typed key/value codec parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter key as the codec names it
    pub key: String,
    /// Declared value type
    #[serde(rename = "type")]
    pub value_type: DataValueType,
    /// Value as authored
    pub value: String,
}

impl Parameter {
    /// Create a parameter
    pub fn new(key: impl Into<String>, value_type: DataValueType, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_type,
            value: value.into(),
        }
    }

    /// The value to hand to a session, if the type is numeric or text and parses.
    #[must_use]
    pub fn session_value(&self) -> Option<ParameterValue> {
        match self.value_type {
            DataValueType::Int => parse_magnitude(&self.value).ok().map(ParameterValue::Int),
            DataValueType::Long => self.value.trim().parse().ok().map(ParameterValue::Int),
            DataValueType::Float => self.value.trim().parse().ok().map(ParameterValue::Float),
            DataValueType::String => Some(ParameterValue::Text(self.value.clone())),
            DataValueType::Bool => None,
        }
    }
}

// =============================================================================
// Runtime events
// =============================================================================

/// What a runtime event does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    /// Change the target bitrate
    Bitrate {
        /// New target
        bitrate: Bitrate,
    },
    /// Request a sync frame
    ForceKeyframe,
    /// Set a codec parameter
    Parameter(Parameter),
    /// Change the output frame rate
    DynamicFramerate {
        /// New output rate in frames per second
        framerate: f64,
    },
    /// Drop this frame regardless of rate conversion
    Drop,
}

impl RuntimeEventKind {
    /// Application priority within one frame (lower runs first)
    #[must_use]
    pub const fn priority(&self) -> u8 {
        match self {
            Self::Bitrate { .. } => 0,
            Self::ForceKeyframe => 1,
            Self::Parameter(_) => 2,
            Self::DynamicFramerate { .. } => 3,
            Self::Drop => 4,
        }
    }

    /// Short name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bitrate { .. } => "bitrate",
            Self::ForceKeyframe => "force_keyframe",
            Self::Parameter(_) => "parameter",
            Self::DynamicFramerate { .. } => "dynamic_framerate",
            Self::Drop => "drop",
        }
    }
}

/// A configuration change scheduled at an input frame index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Input frame index the event applies at
    pub frame: u64,
    /// The change
    pub kind: RuntimeEventKind,
}

impl RuntimeEvent {
    /// Bitrate change at `frame`
    #[must_use]
    pub const fn bitrate(frame: u64, bitrate: Bitrate) -> Self {
        Self {
            frame,
            kind: RuntimeEventKind::Bitrate { bitrate },
        }
    }

    /// Keyframe request at `frame`
    #[must_use]
    pub const fn force_keyframe(frame: u64) -> Self {
        Self {
            frame,
            kind: RuntimeEventKind::ForceKeyframe,
        }
    }

    /// Parameter change at `frame`
    #[must_use]
    pub const fn parameter(frame: u64, parameter: Parameter) -> Self {
        Self {
            frame,
            kind: RuntimeEventKind::Parameter(parameter),
        }
    }

    /// Output frame rate change at `frame`
    #[must_use]
    pub const fn dynamic_framerate(frame: u64, framerate: f64) -> Self {
        Self {
            frame,
            kind: RuntimeEventKind::DynamicFramerate { framerate },
        }
    }

    /// Explicit drop of `frame`
    #[must_use]
    pub const fn drop_frame(frame: u64) -> Self {
        Self {
            frame,
            kind: RuntimeEventKind::Drop,
        }
    }
}

// =============================================================================
// Tests and suites
// =============================================================================

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    /// Constant quality
    Cq,
    /// Variable bitrate
    #[default]
    Vbr,
    /// Constant bitrate
    Cbr,
}

impl BitrateMode {
    /// Whether bitrate changes should be constant-rate
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        matches!(self, Self::Cbr)
    }
}

/// Where frames come from and when a test stops reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Source locator (path, relative to the work directory unless absolute)
    pub source: String,
    /// Source frame dimensions
    pub resolution: Resolution,
    /// Source pixel layout
    #[serde(default)]
    pub pixel_format: PixelFormat,
    /// Source frame rate
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Stop after this many input frames
    #[serde(default)]
    pub playout_frames: Option<u64>,
    /// Stop once this much presentation time has been read
    #[serde(default)]
    pub stop_time_sec: Option<f64>,
    /// Pace submissions to the output frame rate
    #[serde(default)]
    pub realtime: bool,
    /// Keep starting instances of the test: a positive count, or a negative
    /// value for no count. 0 or absent runs it once.
    #[serde(default)]
    pub pursuit: Option<i64>,
}

/// How many instances of a test the orchestrator starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pursuit {
    /// One instance, awaited
    Single,
    /// Up to this many instances, stopping at the first failure
    Count(u64),
    /// Instances until one fails
    UntilFailure,
}

impl Pursuit {
    /// Whether another instance may start after `started` instances
    #[must_use]
    pub const fn allows(&self, started: u64) -> bool {
        match self {
            Self::Single => started < 1,
            Self::Count(count) => started < *count,
            Self::UntilFailure => true,
        }
    }
}

impl InputSpec {
    /// Frame-count termination limit, if one is configured
    #[must_use]
    pub fn frame_limit(&self) -> Option<u64> {
        self.playout_frames.filter(|&n| n > 0)
    }

    /// Elapsed-time termination limit in seconds, if one is configured
    #[must_use]
    pub fn time_limit_sec(&self) -> Option<f64> {
        self.stop_time_sec.filter(|&s| s.is_finite() && s > 0.0)
    }

    /// Instance mode of the test
    #[must_use]
    pub fn pursuit(&self) -> Pursuit {
        match self.pursuit {
            None | Some(0) => Pursuit::Single,
            Some(n) if n > 0 => Pursuit::Count(n as u64),
            Some(_) => Pursuit::UntilFailure,
        }
    }

    /// Byte size of one raw source frame
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.resolution)
    }
}

/// Codec identity and configure-time settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSpec {
    /// Codec identity the session factory resolves
    pub codec: String,
    /// Encode (true) or decode-only (false)
    #[serde(default = "default_encode")]
    pub encode: bool,
    /// Output resolution, defaults to the input resolution
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Target bitrate
    #[serde(default)]
    pub bitrate: Option<Bitrate>,
    /// Rate control mode
    #[serde(default)]
    pub bitrate_mode: BitrateMode,
    /// Output frame rate, defaults to the input frame rate
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Seconds between sync frames
    #[serde(default)]
    pub i_frame_interval: Option<u32>,
    /// Additional configure-time parameters
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

const fn default_encode() -> bool {
    true
}

/// One test: input, codec configuration, runtime events, parallel sub-tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Test identifier
    pub id: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Input description
    pub input: InputSpec,
    /// Codec configuration
    pub configure: EncoderSpec,
    /// Frame-indexed runtime events
    #[serde(default)]
    pub runtime: Vec<RuntimeEvent>,
    /// Sub-tests started alongside this one and not waited on
    #[serde(default)]
    pub parallel: Vec<TestDefinition>,
}

impl TestDefinition {
    /// Create a test reading `source` at 1280x720 yuv420p with no limits
    pub fn new(id: impl Into<String>, codec: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            input: InputSpec {
                source: source.into(),
                resolution: Resolution::new(1280, 720),
                pixel_format: PixelFormat::Yuv420p,
                frame_rate: None,
                playout_frames: None,
                stop_time_sec: None,
                realtime: false,
                pursuit: None,
            },
            configure: EncoderSpec {
                codec: codec.into(),
                encode: true,
                resolution: None,
                bitrate: None,
                bitrate_mode: BitrateMode::Vbr,
                frame_rate: None,
                i_frame_interval: None,
                parameters: Vec::new(),
            },
            runtime: Vec::new(),
            parallel: Vec::new(),
        }
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the source resolution
    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.input.resolution = Resolution::new(width, height);
        self
    }

    /// Set the source pixel format
    #[must_use]
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.input.pixel_format = format;
        self
    }

    /// Set the input frame rate
    #[must_use]
    pub fn with_input_frame_rate(mut self, fps: f64) -> Self {
        self.input.frame_rate = Some(fps);
        self
    }

    /// Set the output frame rate
    #[must_use]
    pub fn with_output_frame_rate(mut self, fps: f64) -> Self {
        self.configure.frame_rate = Some(fps);
        self
    }

    /// Stop after `frames` input frames
    #[must_use]
    pub fn with_playout_frames(mut self, frames: u64) -> Self {
        self.input.playout_frames = Some(frames);
        self
    }

    /// Stop after `seconds` of presentation time
    #[must_use]
    pub fn with_stop_time_sec(mut self, seconds: f64) -> Self {
        self.input.stop_time_sec = Some(seconds);
        self
    }

    /// Enable/disable real-time pacing
    #[must_use]
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.input.realtime = enabled;
        self
    }

    /// Start `instances` copies of the test (negative: until one fails)
    #[must_use]
    pub fn with_pursuit(mut self, instances: i64) -> Self {
        self.input.pursuit = Some(instances);
        self
    }

    /// Set the target bitrate and mode
    #[must_use]
    pub fn with_bitrate(mut self, bitrate: Bitrate, mode: BitrateMode) -> Self {
        self.configure.bitrate = Some(bitrate);
        self.configure.bitrate_mode = mode;
        self
    }

    /// Make this a decode-only test
    #[must_use]
    pub fn decode_only(mut self) -> Self {
        self.configure.encode = false;
        self
    }

    /// Add a configure-time parameter
    #[must_use]
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.configure.parameters.push(parameter);
        self
    }

    /// Add a runtime event
    #[must_use]
    pub fn with_runtime_event(mut self, event: RuntimeEvent) -> Self {
        self.runtime.push(event);
        self
    }

    /// Add a parallel sub-test
    #[must_use]
    pub fn with_parallel(mut self, test: TestDefinition) -> Self {
        self.parallel.push(test);
        self
    }

    /// Check the fields a run cannot start without
    pub fn validate(&self) -> BenchResult<()> {
        if self.configure.codec.trim().is_empty() {
            return Err(BenchError::configuration(format!(
                "test '{}' has no codec identity",
                self.id
            )));
        }
        if self.input.source.trim().is_empty() {
            return Err(BenchError::configuration(format!(
                "test '{}' has no source",
                self.id
            )));
        }
        if self.input.resolution.is_empty() {
            return Err(BenchError::configuration(format!(
                "test '{}' has an empty resolution {}",
                self.id, self.input.resolution
            )));
        }
        Ok(())
    }
}

/// An ordered list of tests
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestSuite {
    /// Suite name
    #[serde(default)]
    pub name: String,
    /// Tests in execution order
    pub tests: Vec<TestDefinition>,
}

impl TestSuite {
    /// Create an empty suite
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tests: Vec::new(),
        }
    }

    /// Append a test
    #[must_use]
    pub fn with_test(mut self, test: TestDefinition) -> Self {
        self.tests.push(test);
        self
    }

    /// Number of tests including nested parallel sub-tests
    #[must_use]
    pub fn total_tests(&self) -> usize {
        fn count(test: &TestDefinition) -> usize {
            1 + test.parallel.iter().map(count).sum::<usize>()
        }
        self.tests.iter().map(count).sum()
    }
}
