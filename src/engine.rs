//! Capability contract of the external MPP decode engine.
//!
//! The engine's internal decode algorithm, allocator and driver are opaque;
//! the adapter only talks to it through [`MppEngine`]. Native objects handed
//! back by the engine ([`MppFrame`], [`MppBuffer`]) are plain data here and are
//! returned to the engine through [`MppEngine::release_frame`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Field-order bits of [`MppFrame::mode`].
pub const MPP_FRAME_FLAG_FIELD_ORDER_MASK: u32 = 0x0000_000C;
pub const MPP_FRAME_FLAG_TOP_FIRST: u32 = 0x0000_0004;
pub const MPP_FRAME_FLAG_BOT_FIRST: u32 = 0x0000_0008;
pub const MPP_FRAME_FLAG_DEINTERLACED: u32 = MPP_FRAME_FLAG_TOP_FIRST | MPP_FRAME_FLAG_BOT_FIRST;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MppError {
    #[error("input buffer full")]
    BufferFull,
    #[error("timeout")]
    Timeout,
    #[error("mpp error code {0}")]
    Code(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MppCodingType {
    Avc,
    Hevc,
    Vp8,
    Vp9,
}

impl fmt::Display for MppCodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avc => f.write_str("avc"),
            Self::Hevc => f.write_str("hevc"),
            Self::Vp8 => f.write_str("vp8"),
            Self::Vp9 => f.write_str("vp9"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MppFrameFormat {
    Yuv420sp,
    Yuv420sp10bit,
    Other(u32),
}

/// Handle to the frame buffer group the engine decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGroup {
    pub id: u32,
    pub max_frames: usize,
}

/// Commands accepted by [`MppEngine::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MppControl {
    /// Number of compressed packets queued inside the engine.
    GetStreamCount,
    /// Acknowledge an info-change notice; decoding stays stalled until sent.
    InfoChangeReady,
    SetOutputTimeout(Duration),
    SetExtBufGroup(FrameGroup),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MppControlReply {
    Done,
    StreamCount(u32),
}

/// Compressed input handed to the engine. An `eos` packet carries no data.
#[derive(Debug, Clone, Copy)]
pub struct MppPacket<'a> {
    pub data: &'a [u8],
    pub pts: i64,
    pub eos: bool,
}

impl<'a> MppPacket<'a> {
    pub fn new(data: &'a [u8], pts: i64) -> Self {
        Self {
            data,
            pts,
            eos: false,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            data: &[],
            pts: 0,
            eos: true,
        }
    }
}

/// Engine-owned buffer backing a decoded frame.
///
/// `data` is the CPU mapping; `fd` is the dma-buf handle used for zero-copy
/// export. Both stay valid until the owning frame is released.
#[derive(Debug, Clone)]
pub struct MppBuffer {
    pub fd: i32,
    pub data: Arc<[u8]>,
}

impl MppBuffer {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MppColorInfo {
    pub range: i32,
    pub primaries: i32,
    pub trc: i32,
    pub space: i32,
}

#[derive(Debug, Clone)]
pub struct MppFrame {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub buf_size: usize,
    pub format: MppFrameFormat,
    pub pts: i64,
    pub color: MppColorInfo,
    pub mode: u32,
    pub info_change: bool,
    pub eos: bool,
    pub discard: bool,
    pub errinfo: u32,
    pub buffer: Option<MppBuffer>,
}

impl MppFrame {
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            hor_stride: 0,
            ver_stride: 0,
            buf_size: 0,
            format: MppFrameFormat::Yuv420sp,
            pts: 0,
            color: MppColorInfo::default(),
            mode: 0,
            info_change: false,
            eos: false,
            discard: false,
            errinfo: 0,
            buffer: None,
        }
    }
}

/// The decode engine capability contract.
///
/// All calls either complete immediately or, for [`MppEngine::get_frame`],
/// wait at most the timeout configured with [`MppControl::SetOutputTimeout`].
pub trait MppEngine: Send {
    fn check_support(&self, coding: MppCodingType) -> Result<(), MppError>;

    fn init(&mut self, coding: MppCodingType) -> Result<(), MppError>;

    fn frame_group(&mut self, max_frames: usize) -> Result<FrameGroup, MppError>;

    /// Fails with [`MppError::BufferFull`] when the input queue cannot take
    /// the packet right now.
    fn put_packet(&mut self, packet: &MppPacket<'_>) -> Result<(), MppError>;

    /// `Ok(None)` means the engine answered without an object.
    fn get_frame(&mut self) -> Result<Option<MppFrame>, MppError>;

    fn control(&mut self, command: MppControl) -> Result<MppControlReply, MppError>;

    fn reset(&mut self) -> Result<(), MppError>;

    /// Hands a frame object, and the buffer reference it holds, back.
    fn release_frame(&mut self, frame: MppFrame);

    /// Tears down the context and its frame group. Called exactly once.
    fn destroy(&mut self);
}
