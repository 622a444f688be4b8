//! Poll-and-classify loop turning engine output into caller frames.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::admission::Admission;
use crate::contract::{
    ColorMetadata, DecodeError, DecodeSummary, DecodedFrame, Dimensions, FramePayload, Interlace,
    OutputFormat, ReceiveOutcome, Timestamp,
};
use crate::convert::{AcceleratorGate, SoftwareConverter};
use crate::drm::{DrmFrameDescriptor, DrmPrimeFrame, drm_format};
use crate::engine::{
    MPP_FRAME_FLAG_DEINTERLACED, MPP_FRAME_FLAG_FIELD_ORDER_MASK, MPP_FRAME_FLAG_TOP_FIRST,
    MppBuffer, MppError, MppFrame,
};
use crate::handle::{EngineHandle, FrameLease};
use crate::metrics::FpsMeter;
use crate::reconfig::{Reconfigurator, StreamGeometry};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetrieveStats {
    pub frames: u64,
    pub info_changes: u64,
    pub discarded: u64,
    pub unbacked: u64,
    pub corrupt: u64,
    pub slow_conversions: u64,
    /// Buffer size of the software output pool, once one exists.
    pub pool_buffer_size: Option<usize>,
    pub pool_buffers: usize,
    pub pool_reallocations: u64,
    /// Latest throughput sample, when FPS logging is on.
    pub last_fps: Option<f64>,
}

/// One engine response, in classification priority order.
enum Polled {
    InfoChange(MppFrame),
    EndOfStream(MppFrame),
    Discard(MppFrame),
    Corrupt(MppFrame),
    Unbacked(MppFrame),
    Output(MppFrame, MppBuffer),
}

impl Polled {
    fn classify(frame: MppFrame) -> Self {
        if frame.info_change {
            return Self::InfoChange(frame);
        }
        if frame.eos {
            return Self::EndOfStream(frame);
        }
        if frame.discard {
            return Self::Discard(frame);
        }
        if frame.errinfo != 0 {
            return Self::Corrupt(frame);
        }
        match frame.buffer.clone() {
            Some(buffer) => Self::Output(frame, buffer),
            None => Self::Unbacked(frame),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Retry {
    Reconfigured,
    Discarded,
    Unbacked,
}

enum Step {
    Continue(Retry),
    Return(ReceiveOutcome),
}

pub(crate) struct FrameRetriever {
    output: OutputFormat,
    reconfig: Reconfigurator,
    converter: SoftwareConverter,
    fps: FpsMeter,
    summary: DecodeSummary,
    stats: RetrieveStats,
    drained: bool,
}

impl FrameRetriever {
    pub(crate) fn new(
        output: OutputFormat,
        reconfig: Reconfigurator,
        converter: SoftwareConverter,
        fps: FpsMeter,
    ) -> Self {
        Self {
            output,
            reconfig,
            converter,
            fps,
            summary: DecodeSummary::default(),
            stats: RetrieveStats::default(),
            drained: false,
        }
    }

    /// End of stream has been returned; nothing more will come out.
    pub(crate) fn drained(&self) -> bool {
        self.drained
    }

    pub(crate) fn geometry(&self) -> Option<StreamGeometry> {
        self.reconfig.geometry().copied()
    }

    pub(crate) fn summary(&self) -> DecodeSummary {
        self.summary.clone()
    }

    pub(crate) fn stats(&self) -> RetrieveStats {
        let pool = self.converter.pool();
        RetrieveStats {
            slow_conversions: self.converter.slow_frames(),
            pool_buffer_size: pool.current_size(),
            pool_buffers: pool.allocated(),
            pool_reallocations: pool.reallocations(),
            info_changes: self.reconfig.changes(),
            last_fps: self.fps.last_fps(),
            ..self.stats
        }
    }

    pub(crate) fn gate(&self) -> &'static AcceleratorGate {
        self.converter.gate()
    }

    pub(crate) fn reset(&mut self) {
        self.drained = false;
        self.fps.reset();
    }

    /// Polls until a frame, end of stream, a retryable stall or an error.
    ///
    /// The loop only spins on responses that consumed engine input, so it
    /// ends once the engine has nothing left within the poll timeout.
    pub(crate) fn retrieve(
        &mut self,
        handle: &Arc<EngineHandle>,
        admission: &mut Admission,
        eos_reached: bool,
    ) -> Result<ReceiveOutcome, DecodeError> {
        if self.drained {
            return Ok(ReceiveOutcome::EndOfStream);
        }
        loop {
            let polled = handle.engine().get_frame();
            let frame = match polled {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(MppError::Timeout) if eos_reached => {
                    debug!("decoder drained");
                    self.drained = true;
                    return Ok(ReceiveOutcome::EndOfStream);
                }
                Ok(None) | Err(MppError::Timeout) => {
                    debug!("timeout when trying to get a frame from decoder");
                    return Ok(ReceiveOutcome::TryAgain);
                }
                Err(err) => {
                    error!(%err, "failed to get a frame from decoder");
                    return Err(DecodeError::engine("get frame", err));
                }
            };

            match self.step(handle, admission, Polled::classify(frame))? {
                Step::Continue(reason) => trace!(?reason, "polling decoder again"),
                Step::Return(outcome) => return Ok(outcome),
            }
        }
    }

    fn step(
        &mut self,
        handle: &Arc<EngineHandle>,
        admission: &mut Admission,
        polled: Polled,
    ) -> Result<Step, DecodeError> {
        match polled {
            Polled::InfoChange(notice) => {
                let applied = self.reconfig.apply(&mut **handle.engine(), &notice);
                handle.release_frame(notice);
                applied?;
                Ok(Step::Continue(Retry::Reconfigured))
            }
            Polled::EndOfStream(frame) => {
                debug!("received an EOS frame");
                handle.release_frame(frame);
                self.drained = true;
                Ok(Step::Return(ReceiveOutcome::EndOfStream))
            }
            Polled::Discard(frame) => {
                debug!(pts = frame.pts, "received a discard frame");
                self.stats.discarded += 1;
                handle.release_frame(frame);
                Ok(retry_if_pending(handle, admission, Retry::Discarded))
            }
            Polled::Corrupt(frame) => {
                let (errinfo, pts) = (frame.errinfo, frame.pts);
                error!(errinfo, pts, "received an errinfo frame");
                self.stats.corrupt += 1;
                handle.release_frame(frame);
                Err(DecodeError::CorruptFrame { errinfo, pts })
            }
            Polled::Unbacked(frame) => {
                error!(pts = frame.pts, "failed to retrieve the frame buffer, frame is dropped");
                self.stats.unbacked += 1;
                handle.release_frame(frame);
                Ok(retry_if_pending(handle, admission, Retry::Unbacked))
            }
            Polled::Output(frame, buffer) => self
                .output(handle, frame, buffer)
                .map(|frame| Step::Return(ReceiveOutcome::Frame(frame))),
        }
    }

    fn output(
        &mut self,
        handle: &Arc<EngineHandle>,
        frame: MppFrame,
        buffer: MppBuffer,
    ) -> Result<DecodedFrame, DecodeError> {
        let Some(dims) = Dimensions::new(frame.width, frame.height) else {
            let msg = format!("frame with empty geometry {}x{}", frame.width, frame.height);
            handle.release_frame(frame);
            return Err(DecodeError::InvalidLayout(msg));
        };
        let pts = Timestamp(frame.pts);
        let color = color_metadata(&frame);
        let interlace = interlace(frame.mode);
        let pixel_format = drm_format(frame.format);

        let payload = match self.output {
            OutputFormat::DrmPrime => {
                let descriptor = DrmFrameDescriptor::from_frame(&frame, &buffer);
                let frames = self.reconfig.frames_context(&frame);
                let lease = FrameLease::new(frame, Arc::clone(handle));
                FramePayload::DrmPrime(DrmPrimeFrame::new(descriptor, frames, lease))
            }
            OutputFormat::Yuv420p => {
                let converted = self.converter.convert(&frame, &buffer);
                handle.release_frame(frame);
                FramePayload::Yuv420p(converted?)
            }
        };

        self.stats.frames += 1;
        self.summary.decoded_frames += 1;
        self.summary.width = Some(dims.width.get() as usize);
        self.summary.height = Some(dims.height.get() as usize);
        self.summary.pixel_format = Some(pixel_format);
        self.fps.frame();
        debug!(%pts, %dims, "received a frame");

        Ok(DecodedFrame {
            dims,
            pts,
            color,
            interlace,
            payload,
        })
    }
}

fn retry_if_pending(handle: &EngineHandle, admission: &mut Admission, reason: Retry) -> Step {
    if admission.has_pending(&mut **handle.engine()) {
        Step::Continue(reason)
    } else {
        Step::Return(ReceiveOutcome::TryAgain)
    }
}

fn color_metadata(frame: &MppFrame) -> ColorMetadata {
    ColorMetadata {
        color_range: frame.color.range,
        color_primaries: frame.color.primaries,
        transfer_function: frame.color.trc,
        ycbcr_matrix: frame.color.space,
    }
}

fn interlace(mode: u32) -> Interlace {
    let field_order = mode & MPP_FRAME_FLAG_FIELD_ORDER_MASK;
    Interlace {
        interlaced: field_order == MPP_FRAME_FLAG_DEINTERLACED,
        top_field_first: field_order == MPP_FRAME_FLAG_TOP_FIRST,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::admission::INPUT_MAX_PACKETS;
    use crate::engine::{MPP_FRAME_FLAG_BOT_FIRST, MppEngine, MppPacket};
    use crate::handle::DrmDevice;
    use crate::sim::{SimConfig, SimProbe, SimUnit, SimulatedEngine};

    fn fixture(output: OutputFormat) -> (FrameRetriever, Arc<EngineHandle>, Admission, SimProbe) {
        let (mut engine, probe) = SimulatedEngine::new(SimConfig::default());
        let group = engine.frame_group(16).unwrap();
        let device = DrmDevice::new("/dev/dri/card0");
        let handle = EngineHandle::new(Box::new(engine), group, Arc::clone(&device));
        let gate: &'static AcceleratorGate = Box::leak(Box::new(AcceleratorGate::new()));
        let retriever = FrameRetriever::new(
            output,
            Reconfigurator::new(device),
            SoftwareConverter::new(None, gate),
            FpsMeter::new(false),
        );
        (retriever, handle, Admission::new(INPUT_MAX_PACKETS), probe)
    }

    fn put(handle: &EngineHandle, unit: SimUnit, pts: i64) {
        handle
            .engine()
            .put_packet(&MppPacket::new(&unit.encode(), pts))
            .unwrap();
    }

    #[rstest]
    #[case(0, false, false)]
    #[case(MPP_FRAME_FLAG_TOP_FIRST, false, true)]
    #[case(MPP_FRAME_FLAG_BOT_FIRST, false, false)]
    #[case(MPP_FRAME_FLAG_DEINTERLACED, true, false)]
    #[case(0x10 | MPP_FRAME_FLAG_DEINTERLACED, true, false)]
    fn interlace_flags_follow_field_order(
        #[case] mode: u32,
        #[case] interlaced: bool,
        #[case] top_field_first: bool,
    ) {
        assert_eq!(
            interlace(mode),
            Interlace {
                interlaced,
                top_field_first
            }
        );
    }

    #[test]
    fn info_change_is_consumed_before_first_frame() {
        let (mut retriever, handle, mut admission, probe) = fixture(OutputFormat::DrmPrime);
        put(&handle, SimUnit::Frame, 40);

        let frame = retriever
            .retrieve(&handle, &mut admission, false)
            .unwrap()
            .into_frame()
            .unwrap();
        assert_eq!(frame.pts, Timestamp(40));
        assert_eq!(probe.info_change_acks(), 1);
        assert_eq!(retriever.stats().info_changes, 1);
        assert_eq!(probe.outstanding_frames(), 1);
        drop(frame);
        assert_eq!(probe.outstanding_frames(), 0);
    }

    #[test]
    fn discard_with_nothing_pending_asks_to_try_again() {
        let (mut retriever, handle, mut admission, probe) = fixture(OutputFormat::DrmPrime);
        put(&handle, SimUnit::Discard, 1);

        let outcome = retriever.retrieve(&handle, &mut admission, false).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::TryAgain));
        assert_eq!(retriever.stats().discarded, 1);
        assert_eq!(probe.outstanding_frames(), 0);
    }

    #[test]
    fn discard_with_pending_input_keeps_polling() {
        let (mut retriever, handle, mut admission, _probe) = fixture(OutputFormat::DrmPrime);
        put(&handle, SimUnit::Discard, 1);
        put(&handle, SimUnit::NoBuffer, 2);
        put(&handle, SimUnit::Frame, 3);

        let frame = retriever
            .retrieve(&handle, &mut admission, false)
            .unwrap()
            .into_frame()
            .unwrap();
        assert_eq!(frame.pts, Timestamp(3));
        let stats = retriever.stats();
        assert_eq!((stats.discarded, stats.unbacked, stats.frames), (1, 1, 1));
    }

    #[test]
    fn corrupt_frame_is_an_error_and_released() {
        let (mut retriever, handle, mut admission, probe) = fixture(OutputFormat::Yuv420p);
        put(&handle, SimUnit::Error, 9);

        let err = retriever
            .retrieve(&handle, &mut admission, false)
            .unwrap_err();
        assert!(matches!(err, DecodeError::CorruptFrame { pts: 9, .. }));
        assert!(err.is_fatal());
        assert_eq!(probe.outstanding_frames(), 0);
    }

    #[test]
    fn timeout_after_end_of_stream_is_terminal() {
        let (mut retriever, handle, mut admission, _probe) = fixture(OutputFormat::DrmPrime);
        let outcome = retriever.retrieve(&handle, &mut admission, false).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::TryAgain));

        for _ in 0..3 {
            let outcome = retriever.retrieve(&handle, &mut admission, true).unwrap();
            assert!(matches!(outcome, ReceiveOutcome::EndOfStream));
        }
        assert!(retriever.drained());
        retriever.reset();
        assert!(!retriever.drained());
    }

    #[test]
    fn software_frames_go_back_to_engine_immediately() {
        let (mut retriever, handle, mut admission, probe) = fixture(OutputFormat::Yuv420p);
        put(&handle, SimUnit::Frame, 5);

        let frame = retriever
            .retrieve(&handle, &mut admission, false)
            .unwrap()
            .into_frame()
            .unwrap();
        assert!(frame.planar().is_some());
        assert_eq!(probe.outstanding_frames(), 0);
        let summary = retriever.summary();
        assert_eq!(summary.decoded_frames, 1);
        assert_eq!(summary.width, Some(64));
        assert_eq!(summary.height, Some(32));
    }
}
