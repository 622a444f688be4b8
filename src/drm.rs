//! Zero-copy export of engine buffers as DRM PRIME descriptors.

use std::sync::Arc;

use crate::engine::{MppBuffer, MppFrame, MppFrameFormat};
use crate::handle::{DrmDevice, FrameLease};
use crate::reconfig::HwFramesContext;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32)
        | ((code[1] as u32) << 8)
        | ((code[2] as u32) << 16)
        | ((code[3] as u32) << 24)
}

pub const DRM_FORMAT_NV12: u32 = fourcc(b"NV12");
pub const DRM_FORMAT_NV12_10: u32 = fourcc(b"NA12");

pub fn drm_format(format: MppFrameFormat) -> u32 {
    match format {
        MppFrameFormat::Yuv420sp => DRM_FORMAT_NV12,
        MppFrameFormat::Yuv420sp10bit => DRM_FORMAT_NV12_10,
        MppFrameFormat::Other(_) => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmObject {
    pub fd: i32,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmPlane {
    pub object_index: usize,
    pub offset: usize,
    pub pitch: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmLayer {
    pub format: u32,
    pub planes: Vec<DrmPlane>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmFrameDescriptor {
    pub objects: Vec<DrmObject>,
    pub layers: Vec<DrmLayer>,
}

impl DrmFrameDescriptor {
    /// Single object, single semi-planar layer: luma at 0, interleaved chroma
    /// right after `ver_stride` rows, both at the engine's horizontal stride.
    pub(crate) fn from_frame(frame: &MppFrame, buffer: &MppBuffer) -> Self {
        let pitch = frame.hor_stride as usize;
        Self {
            objects: vec![DrmObject {
                fd: buffer.fd,
                size: buffer.size(),
            }],
            layers: vec![DrmLayer {
                format: drm_format(frame.format),
                planes: vec![
                    DrmPlane {
                        object_index: 0,
                        offset: 0,
                        pitch,
                    },
                    DrmPlane {
                        object_index: 0,
                        offset: pitch * frame.ver_stride as usize,
                        pitch,
                    },
                ],
            }],
        }
    }
}

/// A decoded frame still owned by the engine.
///
/// Holds the native frame and a reference to the engine context; both are
/// given back when this is dropped, so the engine outlives every exported
/// frame even after the session is closed.
#[derive(Debug)]
pub struct DrmPrimeFrame {
    descriptor: DrmFrameDescriptor,
    frames: Arc<HwFramesContext>,
    lease: FrameLease,
}

impl DrmPrimeFrame {
    pub(crate) fn new(
        descriptor: DrmFrameDescriptor,
        frames: Arc<HwFramesContext>,
        lease: FrameLease,
    ) -> Self {
        Self {
            descriptor,
            frames,
            lease,
        }
    }

    pub fn descriptor(&self) -> &DrmFrameDescriptor {
        &self.descriptor
    }

    pub fn frames_context(&self) -> &Arc<HwFramesContext> {
        &self.frames
    }

    pub fn device(&self) -> &Arc<DrmDevice> {
        self.frames.device()
    }

    /// CPU view of the exported buffer.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.lease
            .frame()
            .and_then(|frame| frame.buffer.as_ref())
            .map(|buffer| &buffer.data[..])
    }
}
