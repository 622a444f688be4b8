use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fmt, fmt::Display};

use crate::convert::BlitAccelerator;
use crate::drm::DrmPrimeFrame;
use crate::engine::{MppCodingType, MppError};
use crate::pool::PlanarFrame;

pub const DEFAULT_DRM_NODE: &str = "/dev/dri/card0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
    Vp8,
    Vp9,
}

impl Codec {
    pub(crate) fn coding_type(self) -> MppCodingType {
        match self {
            Self::H264 => MppCodingType::Avc,
            Self::Hevc => MppCodingType::Hevc,
            Self::Vp8 => MppCodingType::Vp8,
            Self::Vp9 => MppCodingType::Vp9,
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
            Self::Vp8 => f.write_str("vp8"),
            Self::Vp9 => f.write_str("vp9"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Presentation timestamp in the caller's time base, carried through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pts={}", self.0)
    }
}

/// Output path, chosen once when the session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Zero-copy export of the engine's dma-buf.
    DrmPrime,
    /// Software conversion into pooled fully-planar 4:2:0 buffers.
    Yuv420p,
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DrmPrime => f.write_str("drm_prime"),
            Self::Yuv420p => f.write_str("yuv420p"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorMetadata {
    pub color_range: i32,
    pub color_primaries: i32,
    pub transfer_function: i32,
    pub ycbcr_matrix: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interlace {
    pub interlaced: bool,
    pub top_field_first: bool,
}

#[derive(Debug)]
pub enum FramePayload {
    DrmPrime(DrmPrimeFrame),
    Yuv420p(PlanarFrame),
}

#[derive(Debug)]
pub struct DecodedFrame {
    pub dims: Dimensions,
    pub pts: Timestamp,
    pub color: ColorMetadata,
    pub interlace: Interlace,
    pub payload: FramePayload,
}

impl DecodedFrame {
    pub fn drm_prime(&self) -> Option<&DrmPrimeFrame> {
        match &self.payload {
            FramePayload::DrmPrime(frame) => Some(frame),
            FramePayload::Yuv420p(_) => None,
        }
    }

    pub fn planar(&self) -> Option<&PlanarFrame> {
        match &self.payload {
            FramePayload::Yuv420p(frame) => Some(frame),
            FramePayload::DrmPrime(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Backpressure: nothing was consumed, send the same data again later.
    TryAgain,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(DecodedFrame),
    TryAgain,
    EndOfStream,
}

impl ReceiveOutcome {
    pub fn into_frame(self) -> Option<DecodedFrame> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::TryAgain | Self::EndOfStream => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub codec: Codec,
    pub output: OutputFormat,
    /// Out-of-band stream header, submitted once ahead of the first packet.
    pub extradata: Option<Vec<u8>>,
    /// Overrides `MPP_DECODE_LOG_FPS` when set.
    pub report_fps: Option<bool>,
    pub accelerator: Option<Arc<dyn BlitAccelerator>>,
    pub device_node: PathBuf,
}

impl DecoderConfig {
    #[must_use]
    pub fn new(codec: Codec, output: OutputFormat) -> Self {
        Self {
            codec,
            output,
            extradata: None,
            report_fps: None,
            accelerator: None,
            device_node: PathBuf::from(DEFAULT_DRM_NODE),
        }
    }

    #[must_use]
    pub fn with_extradata(mut self, extradata: impl Into<Vec<u8>>) -> Self {
        self.extradata = Some(extradata.into());
        self
    }

    #[must_use]
    pub fn with_report_fps(mut self, enabled: bool) -> Self {
        self.report_fps = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Arc<dyn BlitAccelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }
}

impl Display for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoderConfig(codec={}, output={}, extradata_bytes={}, report_fps={:?})",
            self.codec,
            self.output,
            self.extradata.as_ref().map_or(0, Vec::len),
            self.report_fps
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeSummary {
    pub decoded_frames: usize,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub pixel_format: Option<u32>,
}

impl Display for DecodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecodeSummary(decoded_frames={}, width={:?}, height={:?}, pixel_format={:?})",
            self.decoded_frames, self.width, self.height, self.pixel_format
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub codec: Codec,
    pub decode_supported: bool,
    pub encode_supported: bool,
    pub hardware_acceleration: bool,
}

impl Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapabilityReport(codec={}, decode_supported={}, encode_supported={}, hardware_acceleration={})",
            self.codec, self.decode_supported, self.encode_supported, self.hardware_acceleration
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(Codec),
    #[error("decoder init failed: {0}")]
    Init(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("corrupt frame (errinfo={errinfo:#x}, pts={pts})")]
    CorruptFrame { errinfo: u32, pts: i64 },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid frame layout: {0}")]
    InvalidLayout(String),
    #[error("flush failed: {0}")]
    Flush(MppError),
}

impl DecodeError {
    /// Whether the stream is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Flush(_) | Self::ResourceExhausted(_) | Self::InvalidLayout(_)
        )
    }

    pub(crate) fn engine(context: &str, err: MppError) -> Self {
        Self::Engine(format!("{context}: {err}"))
    }
}
