use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

mod admission;
mod contract;
mod convert;
mod drm;
mod engine;
mod handle;
mod metrics;
mod pool;
mod reconfig;
mod retrieve;
mod sim;
mod submit;

pub use admission::{AdmissionStats, INPUT_MAX_PACKETS};
pub use contract::{
    CapabilityReport, Codec, ColorMetadata, DEFAULT_DRM_NODE, DecodeError, DecodeSummary,
    DecodedFrame, DecoderConfig, Dimensions, FramePayload, Interlace, OutputFormat,
    ReceiveOutcome, SendOutcome, Timestamp,
};
pub use convert::{
    AcceleratorGate, BlitAccelerator, BlitError, BlitRect, BlitSource, Nv12Source,
    deinterleave_nv12,
};
pub use drm::{
    DRM_FORMAT_NV12, DRM_FORMAT_NV12_10, DrmFrameDescriptor, DrmLayer, DrmObject, DrmPlane,
    DrmPrimeFrame, drm_format,
};
pub use engine::{
    FrameGroup, MPP_FRAME_FLAG_BOT_FIRST, MPP_FRAME_FLAG_DEINTERLACED,
    MPP_FRAME_FLAG_FIELD_ORDER_MASK, MPP_FRAME_FLAG_TOP_FIRST, MppBuffer, MppCodingType,
    MppColorInfo, MppControl, MppControlReply, MppEngine, MppError, MppFrame, MppFrameFormat,
    MppPacket,
};
pub use handle::DrmDevice;
pub use metrics::{FPS_SAMPLE_INTERVAL, should_report_fps};
pub use pool::{PlanarFrame, PlanarLayout, PooledBuffer};
pub use reconfig::{CODED_ALIGNMENT, HwFramesContext, StreamGeometry, SwFormat, align_up};
pub use retrieve::RetrieveStats;
pub use sim::{SimConfig, SimProbe, SimUnit, SimulatedEngine, nv12_pattern};

use admission::Admission;
use convert::SoftwareConverter;
use handle::EngineHandle;
use metrics::FpsMeter;
use reconfig::Reconfigurator;
use retrieve::FrameRetriever;
use submit::PacketSubmitter;

/// Frames in the engine's output buffer group.
pub const FRAME_GROUP_MAX_FRAMES: usize = 16;
/// Poll timeout while waiting for output.
pub const RECEIVE_FRAME_TIMEOUT: Duration = Duration::from_millis(100);
/// Poll timeout when the engine would rather take more input first.
pub const NONBLOCKING_TIMEOUT: Duration = Duration::from_millis(1);

/// One compressed stream decoded on an MPP engine.
///
/// The caller drives everything: [`send`](Self::send) pushes compressed
/// units, [`receive`](Self::receive) pumps the engine for the next frame.
/// Zero-copy frames keep the engine alive on their own, so the session can
/// be closed while they are still in use.
pub struct DecodeSession {
    config: DecoderConfig,
    handle: Arc<EngineHandle>,
    admission: Admission,
    submitter: PacketSubmitter,
    retriever: FrameRetriever,
}

impl DecodeSession {
    pub fn open(
        mut engine: Box<dyn MppEngine>,
        config: DecoderConfig,
    ) -> Result<Self, DecodeError> {
        let coding = config.codec.coding_type();
        if let Err(err) = engine.check_support(coding) {
            error!(codec = %config.codec, %err, "codec is not supported by the decoder");
            return Err(DecodeError::UnsupportedCodec(config.codec));
        }
        engine.init(coding).map_err(|err| {
            error!(%coding, %err, "failed to initialize decoder");
            DecodeError::Init(format!("init {coding}: {err}"))
        })?;

        let group = match attach_frame_group(engine.as_mut()) {
            Ok(group) => group,
            Err(err) => {
                engine.destroy();
                return Err(err);
            }
        };

        let device = DrmDevice::new(&config.device_node);
        let handle = EngineHandle::new(engine, group, Arc::clone(&device));
        let retriever = FrameRetriever::new(
            config.output,
            Reconfigurator::new(device),
            SoftwareConverter::new(config.accelerator.clone(), AcceleratorGate::process()),
            FpsMeter::new(should_report_fps(config.report_fps)),
        );
        info!(%config, group = group.id, "decoder initialized");

        Ok(Self {
            admission: Admission::new(INPUT_MAX_PACKETS),
            submitter: PacketSubmitter::new(config.extradata.clone()),
            retriever,
            handle,
            config,
        })
    }

    /// Submits one compressed unit; an empty `packet` ends the stream.
    ///
    /// Returns [`SendOutcome::TryAgain`] without consuming anything when the
    /// engine already holds [`INPUT_MAX_PACKETS`] packets or reports its
    /// input queue full.
    pub fn send(
        &mut self,
        packet: &[u8],
        pts: Option<Timestamp>,
    ) -> Result<SendOutcome, DecodeError> {
        let mut engine = self.handle.engine();
        if !packet.is_empty() && !self.admission.can_submit(&mut **engine) {
            debug!(size = packet.len(), "decoder input is full");
            return Ok(SendOutcome::TryAgain);
        }
        self.submitter.submit(&mut **engine, packet, pts)
    }

    pub fn receive(&mut self) -> Result<ReceiveOutcome, DecodeError> {
        if self.retriever.drained() {
            return Ok(ReceiveOutcome::EndOfStream);
        }
        self.prepare_poll()?;

        let outcome = self.retriever.retrieve(
            &self.handle,
            &mut self.admission,
            self.submitter.eos_reached(),
        )?;
        match &outcome {
            ReceiveOutcome::Frame(frame) => self.submitter.note_pts(frame.pts.0),
            ReceiveOutcome::EndOfStream => self.submitter.mark_eos(),
            ReceiveOutcome::TryAgain => {}
        }
        Ok(outcome)
    }

    /// Re-sends end of stream until the engine has taken it, then picks the
    /// poll timeout.
    fn prepare_poll(&mut self) -> Result<(), DecodeError> {
        let mut engine = self.handle.engine();
        let admit = self.admission.can_submit(&mut **engine);
        if admit && self.submitter.eos_reached() {
            self.submitter.send_eos(&mut **engine)?;
        }

        let timeout = if !self.submitter.eos_reached() && admit {
            NONBLOCKING_TIMEOUT
        } else {
            RECEIVE_FRAME_TIMEOUT
        };
        if let Err(err) = engine.control(MppControl::SetOutputTimeout(timeout)) {
            error!(%err, "failed to set timeout on decoder");
        }
        Ok(())
    }

    /// Resets the engine. On failure the session keeps its previous state.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        let reset = self.handle.engine().reset();
        match reset {
            Ok(()) => {
                self.submitter.reset();
                self.retriever.reset();
                info!("decoder flushed");
                Ok(())
            }
            Err(err) => {
                error!(%err, "failed to reset decoder");
                Err(DecodeError::Flush(err))
            }
        }
    }

    /// Gives up this session's share of the engine. Teardown happens once the
    /// last zero-copy frame from it is dropped, which may be right away.
    pub fn close(self) {
        drop(self);
    }

    pub fn summary(&self) -> DecodeSummary {
        self.retriever.summary()
    }

    pub fn query_capability(&self, codec: Codec) -> CapabilityReport {
        let decode_supported = self
            .handle
            .engine()
            .check_support(codec.coding_type())
            .is_ok();
        CapabilityReport {
            codec,
            decode_supported,
            encode_supported: false,
            hardware_acceleration: true,
        }
    }

    pub fn geometry(&self) -> Option<StreamGeometry> {
        self.retriever.geometry()
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    pub fn retrieve_stats(&self) -> RetrieveStats {
        self.retriever.stats()
    }

    pub fn accelerator_gate(&self) -> &'static AcceleratorGate {
        self.retriever.gate()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<DrmDevice> {
        self.handle.device()
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        let outstanding = Arc::strong_count(&self.handle) - 1;
        debug!(
            outstanding,
            group = self.handle.frame_group().id,
            "closing decoder session"
        );
    }
}

fn attach_frame_group(engine: &mut dyn MppEngine) -> Result<FrameGroup, DecodeError> {
    let group = engine
        .frame_group(FRAME_GROUP_MAX_FRAMES)
        .map_err(|err| DecodeError::Init(format!("frame group: {err}")))?;
    engine
        .control(MppControl::SetExtBufGroup(group))
        .map_err(|err| DecodeError::Init(format!("attach frame group: {err}")))?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(config: SimConfig, output: OutputFormat) -> (DecodeSession, SimProbe) {
        let (engine, probe) = SimulatedEngine::new(config);
        let session =
            DecodeSession::open(Box::new(engine), DecoderConfig::new(Codec::H264, output)).unwrap();
        (session, probe)
    }

    #[test]
    fn open_attaches_limited_frame_group() {
        let (session, probe) = session(SimConfig::default(), OutputFormat::DrmPrime);
        assert_eq!(probe.coding(), Some(MppCodingType::Avc));
        assert_eq!(
            probe.frame_group().map(|group| group.max_frames),
            Some(FRAME_GROUP_MAX_FRAMES)
        );
        assert_eq!(session.device().node(), std::path::Path::new(DEFAULT_DRM_NODE));
        assert!(session.geometry().is_none());
    }

    #[test]
    fn unsupported_codec_is_rejected_without_init() {
        let (engine, probe) = SimulatedEngine::new(SimConfig {
            supported: vec![MppCodingType::Avc],
            ..SimConfig::default()
        });
        let result = DecodeSession::open(
            Box::new(engine),
            DecoderConfig::new(Codec::Vp9, OutputFormat::DrmPrime),
        );
        assert!(matches!(result, Err(DecodeError::UnsupportedCodec(Codec::Vp9))));
        assert_eq!(probe.coding(), None);
    }

    #[test]
    fn capability_reflects_engine_support() {
        let (session, _probe) = session(
            SimConfig {
                supported: vec![MppCodingType::Avc, MppCodingType::Hevc],
                ..SimConfig::default()
            },
            OutputFormat::DrmPrime,
        );
        let hevc = session.query_capability(Codec::Hevc);
        assert!(hevc.decode_supported && hevc.hardware_acceleration);
        assert!(!hevc.encode_supported);
        assert!(!session.query_capability(Codec::Vp8).decode_supported);
    }

    #[test]
    fn poll_timeout_tracks_input_demand() {
        let (mut session, probe) = session(SimConfig::default(), OutputFormat::DrmPrime);
        session.receive().unwrap();
        assert_eq!(probe.output_timeout(), NONBLOCKING_TIMEOUT);

        let frame = SimUnit::Frame.encode();
        for pts in 0..4 {
            session.send(&frame, Some(Timestamp(pts))).unwrap();
        }
        session.prepare_poll().unwrap();
        assert_eq!(probe.output_timeout(), RECEIVE_FRAME_TIMEOUT);
    }

    #[test]
    fn timeout_control_failure_is_not_fatal() {
        let (mut session, probe) = session(SimConfig::default(), OutputFormat::DrmPrime);
        probe.set_fail_set_timeout(true);
        session
            .send(&SimUnit::Frame.encode(), Some(Timestamp(7)))
            .unwrap();
        let frame = session.receive().unwrap().into_frame().unwrap();
        assert_eq!(frame.pts, Timestamp(7));
    }

    #[test]
    fn send_is_refused_at_admission_limit() {
        let (mut session, probe) = session(SimConfig::default(), OutputFormat::DrmPrime);
        let frame = SimUnit::Frame.encode();
        for pts in 0..i64::from(INPUT_MAX_PACKETS) {
            assert_eq!(
                session.send(&frame, Some(Timestamp(pts))).unwrap(),
                SendOutcome::Accepted
            );
        }
        assert_eq!(
            session.send(&frame, Some(Timestamp(99))).unwrap(),
            SendOutcome::TryAgain
        );
        assert_eq!(probe.in_flight(), INPUT_MAX_PACKETS as usize);
        assert_eq!(session.admission_stats().denied, 1);
    }
}
