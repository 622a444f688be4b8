//! In-process stand-in for the MPP engine.
//!
//! `SimulatedEngine` decodes a tiny tagged bitstream (see [`SimUnit`]) so that
//! every kind of engine response can be produced on demand. A [`SimProbe`]
//! shares its state for inspection after the engine has been boxed into a
//! session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::engine::{
    FrameGroup, MppBuffer, MppCodingType, MppColorInfo, MppControl, MppControlReply, MppEngine,
    MppError, MppFrame, MppFrameFormat, MppPacket,
};

/// Polls at or above this timeout are treated as blocking waits that let the
/// pending decode finish.
const BLOCKING_POLL: Duration = Duration::from_millis(100);
const STRIDE_ALIGN: u32 = 16;
const SIM_ERROR_CODE: i32 = -1;

/// One compressed unit of the simulated bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimUnit {
    /// Parameter sets; consumed without output.
    Header,
    Frame,
    Discard,
    Error,
    /// A frame whose buffer allocation failed inside the engine.
    NoBuffer,
    /// Resolution change, followed by a frame at the new size.
    InfoChange { width: u16, height: u16 },
}

impl SimUnit {
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::Header => vec![b'H'],
            Self::Frame => vec![b'F'],
            Self::Discard => vec![b'D'],
            Self::Error => vec![b'E'],
            Self::NoBuffer => vec![b'N'],
            Self::InfoChange { width, height } => {
                let mut out = vec![b'C'];
                out.extend_from_slice(&width.to_le_bytes());
                out.extend_from_slice(&height.to_le_bytes());
                out
            }
        }
    }

    fn decode(data: &[u8]) -> Self {
        match data {
            [b'H', ..] => Self::Header,
            [b'D', ..] => Self::Discard,
            [b'E', ..] => Self::Error,
            [b'N', ..] => Self::NoBuffer,
            [b'C', w0, w1, h0, h1, ..] => Self::InfoChange {
                width: u16::from_le_bytes([*w0, *w1]),
                height: u16::from_le_bytes([*h0, *h1]),
            },
            _ => Self::Frame,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    /// Packets the engine queues before answering `BufferFull`.
    pub input_capacity: usize,
    /// Non-blocking polls needed before a queued packet decodes.
    pub decode_latency_polls: u32,
    pub color: MppColorInfo,
    pub mode: u32,
    pub format: MppFrameFormat,
    pub supported: Vec<MppCodingType>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 32,
            input_capacity: 8,
            decode_latency_polls: 0,
            color: MppColorInfo::default(),
            mode: 0,
            format: MppFrameFormat::Yuv420sp,
            supported: vec![
                MppCodingType::Avc,
                MppCodingType::Hevc,
                MppCodingType::Vp8,
                MppCodingType::Vp9,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum QueuedInput {
    Unit { unit: SimUnit, pts: i64 },
    Eos,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    coding: Option<MppCodingType>,
    group: Option<FrameGroup>,
    input: VecDeque<QueuedInput>,
    width: u32,
    height: u32,
    announced: bool,
    awaiting_ack: bool,
    head_polls: u32,
    timeout: Duration,
    next_fd: i32,
    fail_stream_count: bool,
    fail_reset: bool,
    fail_set_timeout: bool,
    peak_in_flight: usize,
    outstanding: usize,
    released: usize,
    info_change_acks: usize,
    resets: usize,
    packets_accepted: usize,
    destroyed: bool,
}

impl SimState {
    fn build_frame(&mut self, pts: i64) -> MppFrame {
        let (hor_stride, ver_stride) = (
            align(self.width, STRIDE_ALIGN),
            align(self.height, STRIDE_ALIGN),
        );
        let data = nv12_pattern(hor_stride, ver_stride, pts);
        let fd = self.next_fd;
        self.next_fd += 1;
        MppFrame {
            width: self.width,
            height: self.height,
            hor_stride,
            ver_stride,
            buf_size: data.len(),
            format: self.config.format,
            pts,
            color: self.config.color,
            mode: self.config.mode,
            buffer: Some(MppBuffer {
                fd,
                data: data.into(),
            }),
            ..MppFrame::empty()
        }
    }

    fn info_change_notice(&self) -> MppFrame {
        MppFrame {
            width: self.width,
            height: self.height,
            hor_stride: align(self.width, STRIDE_ALIGN),
            ver_stride: align(self.height, STRIDE_ALIGN),
            format: self.config.format,
            info_change: true,
            ..MppFrame::empty()
        }
    }

    /// Decodes queued input until one output object is produced.
    fn decode_next(&mut self) -> Option<MppFrame> {
        loop {
            let head = *self.input.front()?;
            if let QueuedInput::Unit {
                unit: SimUnit::Header,
                ..
            } = head
            {
                self.input.pop_front();
                continue;
            }

            if self.timeout < BLOCKING_POLL && self.head_polls < self.config.decode_latency_polls {
                self.head_polls += 1;
                return None;
            }
            self.head_polls = 0;
            self.input.pop_front();

            let (unit, pts) = match head {
                QueuedInput::Eos => {
                    return Some(MppFrame {
                        eos: true,
                        ..MppFrame::empty()
                    });
                }
                QueuedInput::Unit { unit, pts } => (unit, pts),
            };

            if let SimUnit::InfoChange { width, height } = unit {
                let (width, height) = (u32::from(width), u32::from(height));
                if !self.announced || width != self.width || height != self.height {
                    self.width = width;
                    self.height = height;
                    self.input.push_front(QueuedInput::Unit {
                        unit: SimUnit::Frame,
                        pts,
                    });
                    return Some(self.announce());
                }
            } else if !self.announced {
                self.input.push_front(QueuedInput::Unit { unit, pts });
                return Some(self.announce());
            }

            let mut frame = self.build_frame(pts);
            match unit {
                SimUnit::Discard => frame.discard = true,
                SimUnit::Error => frame.errinfo = 1,
                SimUnit::NoBuffer => frame.buffer = None,
                SimUnit::Header | SimUnit::Frame | SimUnit::InfoChange { .. } => {}
            }
            return Some(frame);
        }
    }

    fn announce(&mut self) -> MppFrame {
        self.announced = true;
        self.awaiting_ack = true;
        self.info_change_notice()
    }
}

pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedEngine {
    pub fn new(config: SimConfig) -> (Self, SimProbe) {
        let state = Arc::new(Mutex::new(SimState {
            width: config.width,
            height: config.height,
            config,
            coding: None,
            group: None,
            input: VecDeque::new(),
            announced: false,
            awaiting_ack: false,
            head_polls: 0,
            timeout: BLOCKING_POLL,
            next_fd: 100,
            fail_stream_count: false,
            fail_reset: false,
            fail_set_timeout: false,
            peak_in_flight: 0,
            outstanding: 0,
            released: 0,
            info_change_acks: 0,
            resets: 0,
            packets_accepted: 0,
            destroyed: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimProbe { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MppEngine for SimulatedEngine {
    fn check_support(&self, coding: MppCodingType) -> Result<(), MppError> {
        if self.state().config.supported.contains(&coding) {
            Ok(())
        } else {
            Err(MppError::Code(SIM_ERROR_CODE))
        }
    }

    fn init(&mut self, coding: MppCodingType) -> Result<(), MppError> {
        self.check_support(coding)?;
        self.state().coding = Some(coding);
        Ok(())
    }

    fn frame_group(&mut self, max_frames: usize) -> Result<FrameGroup, MppError> {
        Ok(FrameGroup { id: 1, max_frames })
    }

    fn put_packet(&mut self, packet: &MppPacket<'_>) -> Result<(), MppError> {
        let mut state = self.state();
        if state.input.len() >= state.config.input_capacity {
            return Err(MppError::BufferFull);
        }
        let queued = if packet.eos {
            QueuedInput::Eos
        } else {
            QueuedInput::Unit {
                unit: SimUnit::decode(packet.data),
                pts: packet.pts,
            }
        };
        state.input.push_back(queued);
        state.packets_accepted += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.input.len());
        Ok(())
    }

    fn get_frame(&mut self) -> Result<Option<MppFrame>, MppError> {
        let mut state = self.state();
        let frame = if state.awaiting_ack {
            None
        } else {
            state.decode_next()
        };
        match frame {
            Some(frame) => {
                state.outstanding += 1;
                Ok(Some(frame))
            }
            None => Err(MppError::Timeout),
        }
    }

    fn control(&mut self, command: MppControl) -> Result<MppControlReply, MppError> {
        let mut state = self.state();
        match command {
            MppControl::GetStreamCount => {
                if state.fail_stream_count {
                    return Err(MppError::Code(SIM_ERROR_CODE));
                }
                let queued = state.input.len();
                Ok(MppControlReply::StreamCount(
                    u32::try_from(queued).unwrap_or(u32::MAX),
                ))
            }
            MppControl::InfoChangeReady => {
                state.awaiting_ack = false;
                state.info_change_acks += 1;
                Ok(MppControlReply::Done)
            }
            MppControl::SetOutputTimeout(timeout) => {
                if state.fail_set_timeout {
                    return Err(MppError::Code(SIM_ERROR_CODE));
                }
                state.timeout = timeout;
                Ok(MppControlReply::Done)
            }
            MppControl::SetExtBufGroup(group) => {
                state.group = Some(group);
                Ok(MppControlReply::Done)
            }
        }
    }

    fn reset(&mut self) -> Result<(), MppError> {
        let mut state = self.state();
        if state.fail_reset {
            return Err(MppError::Code(SIM_ERROR_CODE));
        }
        state.input.clear();
        state.awaiting_ack = false;
        state.head_polls = 0;
        state.resets += 1;
        Ok(())
    }

    fn release_frame(&mut self, _frame: MppFrame) {
        let mut state = self.state();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.released += 1;
    }

    fn destroy(&mut self) {
        self.state().destroyed = true;
    }
}

/// Read/inject access to a [`SimulatedEngine`]'s state.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.state().input.len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state().peak_in_flight
    }

    pub fn packets_accepted(&self) -> usize {
        self.state().packets_accepted
    }

    /// Frame objects handed out by `get_frame` and not yet released.
    pub fn outstanding_frames(&self) -> usize {
        self.state().outstanding
    }

    pub fn released_frames(&self) -> usize {
        self.state().released
    }

    pub fn info_change_acks(&self) -> usize {
        self.state().info_change_acks
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub fn coding(&self) -> Option<MppCodingType> {
        self.state().coding
    }

    pub fn frame_group(&self) -> Option<FrameGroup> {
        self.state().group
    }

    pub fn output_timeout(&self) -> Duration {
        self.state().timeout
    }

    pub fn set_fail_stream_count(&self, fail: bool) {
        self.state().fail_stream_count = fail;
    }

    pub fn set_fail_reset(&self, fail: bool) {
        self.state().fail_reset = fail;
    }

    pub fn set_fail_set_timeout(&self, fail: bool) {
        self.state().fail_set_timeout = fail;
    }

    pub fn set_input_capacity(&self, capacity: usize) {
        self.state().config.input_capacity = capacity;
    }

    /// Builds a frame at the current geometry as if `get_frame` returned it.
    pub fn fabricate_frame(&self, width: u32, height: u32, pts: i64) -> MppFrame {
        let mut state = self.state();
        let (saved_width, saved_height) = (state.width, state.height);
        state.width = width;
        state.height = height;
        let frame = state.build_frame(pts);
        state.width = saved_width;
        state.height = saved_height;
        state.outstanding += 1;
        frame
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Deterministic NV12 contents: luma bytes derive from position and `seed`,
/// chroma pairs hold distinct U and V ramps.
pub fn nv12_pattern(hor_stride: u32, ver_stride: u32, seed: i64) -> Vec<u8> {
    let (hs, vs) = (hor_stride as usize, ver_stride as usize);
    let luma_size = hs * vs;
    let mut data = vec![0_u8; luma_size + luma_size / 2];
    let seed = seed as u8;
    for y in 0..vs {
        for x in 0..hs {
            data[y * hs + x] = (x as u8).wrapping_add((3 * y) as u8).wrapping_add(seed);
        }
    }
    for y in 0..vs / 2 {
        for pair in 0..hs / 2 {
            let base = luma_size + y * hs + pair * 2;
            let ramp = (pair as u8).wrapping_add(y as u8).wrapping_add(seed);
            data[base] = ramp.wrapping_add(64);
            data[base + 1] = ramp.wrapping_add(pair as u8).wrapping_add(160);
        }
    }
    data
}
