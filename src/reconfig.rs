use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::contract::DecodeError;
use crate::drm::{DRM_FORMAT_NV12, drm_format};
use crate::engine::{MppControl, MppEngine, MppFrame, MppFrameFormat};
use crate::handle::DrmDevice;

/// Coded dimensions are padded to this so that the planes of one buffer stay
/// contiguous for consumers that align to 32.
pub const CODED_ALIGNMENT: u32 = 64;

pub fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub format: MppFrameFormat,
    /// DRM fourcc of `format`, 0 when it has none.
    pub drm_format: u32,
}

impl StreamGeometry {
    pub fn new(width: u32, height: u32, format: MppFrameFormat) -> Self {
        Self {
            width,
            height,
            coded_width: align_up(width, CODED_ALIGNMENT),
            coded_height: align_up(height, CODED_ALIGNMENT),
            format,
            drm_format: drm_format(format),
        }
    }

    fn from_frame(frame: &MppFrame) -> Self {
        Self::new(frame.width, frame.height, frame.format)
    }
}

impl fmt::Display for StreamGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} (coded {}x{}, format={:?})",
            self.width, self.height, self.coded_width, self.coded_height, self.format
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwFormat {
    Nv12,
}

/// Hardware frames context bound to one stream geometry. Exported frames keep
/// the context they were decoded under.
#[derive(Debug)]
pub struct HwFramesContext {
    device: Arc<DrmDevice>,
    pub sw_format: Option<SwFormat>,
    pub width: u32,
    pub height: u32,
}

impl HwFramesContext {
    fn new(device: Arc<DrmDevice>, geometry: &StreamGeometry) -> Self {
        Self {
            device,
            sw_format: (geometry.drm_format == DRM_FORMAT_NV12).then_some(SwFormat::Nv12),
            width: geometry.width,
            height: geometry.height,
        }
    }

    pub fn device(&self) -> &Arc<DrmDevice> {
        &self.device
    }
}

/// Owns the stream geometry and the output frames context derived from it.
#[derive(Debug)]
pub(crate) struct Reconfigurator {
    device: Arc<DrmDevice>,
    geometry: Option<StreamGeometry>,
    frames: Option<Arc<HwFramesContext>>,
    changes: u64,
}

impl Reconfigurator {
    pub(crate) fn new(device: Arc<DrmDevice>) -> Self {
        Self {
            device,
            geometry: None,
            frames: None,
            changes: 0,
        }
    }

    pub(crate) fn geometry(&self) -> Option<&StreamGeometry> {
        self.geometry.as_ref()
    }

    pub(crate) fn changes(&self) -> u64 {
        self.changes
    }

    /// Applies an info-change notice: new geometry, acknowledgement to the
    /// engine, fresh frames context. Never yields a frame.
    pub(crate) fn apply(
        &mut self,
        engine: &mut dyn MppEngine,
        notice: &MppFrame,
    ) -> Result<StreamGeometry, DecodeError> {
        info!(
            width = notice.width,
            height = notice.height,
            format = ?notice.format,
            "decoder noticed an info change"
        );
        let geometry = StreamGeometry::from_frame(notice);
        self.geometry = Some(geometry);

        if let Err(err) = engine.control(MppControl::InfoChangeReady) {
            error!(%err, "failed to acknowledge info change");
            return Err(DecodeError::engine("acknowledge info change", err));
        }

        self.frames = Some(Arc::new(HwFramesContext::new(
            Arc::clone(&self.device),
            &geometry,
        )));
        self.changes += 1;
        Ok(geometry)
    }

    /// Frames context for `frame`; built from the frame itself when no notice
    /// has been seen yet.
    pub(crate) fn frames_context(&mut self, frame: &MppFrame) -> Arc<HwFramesContext> {
        let device = &self.device;
        let geometry = *self
            .geometry
            .get_or_insert_with(|| StreamGeometry::from_frame(frame));
        let frames = self.frames.get_or_insert_with(|| {
            debug!(%geometry, "frames context created without info change");
            Arc::new(HwFramesContext::new(Arc::clone(device), &geometry))
        });
        Arc::clone(frames)
    }
}
