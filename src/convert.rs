//! NV12 to fully planar 4:2:0 conversion for the software output path.
//!
//! An optional 2D blitter can do the conversion straight from the engine's
//! dma-buf. It is initialised at most once per process and is switched off
//! for good after its first failure; every frame it cannot handle goes
//! through [`deinterleave_nv12`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::contract::DecodeError;
use crate::engine::{MppBuffer, MppFrame};
use crate::pool::{PlanarFrame, PlanarLayout, PoolSlot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("blit failed: {0}")]
pub struct BlitError(pub String);

/// Rectangle plus the strides of the surface it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRect {
    pub width: usize,
    pub height: usize,
    pub wstride: usize,
    pub hstride: usize,
}

/// Semi-planar source, addressed by dma-buf handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitSource {
    pub fd: i32,
    pub rect: BlitRect,
}

pub trait BlitAccelerator: Send + Sync + fmt::Debug {
    fn init(&self) -> Result<(), BlitError>;

    /// Writes a contiguous three-plane image of `dst_rect` into `dst`.
    fn blit_nv12_to_i420(
        &self,
        src: &BlitSource,
        dst: &mut [u8],
        dst_rect: &BlitRect,
    ) -> Result<(), BlitError>;
}

/// Lazily initialised, permanently disabled on failure.
#[derive(Debug)]
pub struct AcceleratorGate {
    init: OnceLock<bool>,
    supported: AtomicBool,
    blits: AtomicU64,
}

static PROCESS_GATE: AcceleratorGate = AcceleratorGate::new();

impl AcceleratorGate {
    pub const fn new() -> Self {
        Self {
            init: OnceLock::new(),
            supported: AtomicBool::new(true),
            blits: AtomicU64::new(0),
        }
    }

    /// The gate shared by every session in this process.
    pub fn process() -> &'static Self {
        &PROCESS_GATE
    }

    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    pub fn blits(&self) -> u64 {
        self.blits.load(Ordering::Relaxed)
    }

    /// Concurrent first callers block on the same initialisation.
    fn ready(&self, accelerator: &dyn BlitAccelerator) -> bool {
        if !self.is_supported() {
            return false;
        }
        let inited = *self.init.get_or_init(|| match accelerator.init() {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "blit accelerator not available");
                false
            }
        });
        if !inited {
            self.disable();
        }
        inited && self.is_supported()
    }

    fn disable(&self) {
        self.supported.store(false, Ordering::Release);
    }
}

impl Default for AcceleratorGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanarLayout {
    /// Planes packed back to back with chroma pitches exactly half the luma
    /// pitch, which is all the blitter can address.
    pub fn is_contiguous(&self) -> bool {
        let [y_pitch, u_pitch, v_pitch] = self.pitches;
        if y_pitch == 0 || u_pitch != y_pitch / 2 || v_pitch != y_pitch / 2 {
            return false;
        }
        let [y_offset, u_offset, v_offset] = self.offsets;
        let Some(luma_size) = u_offset.checked_sub(y_offset) else {
            return false;
        };
        let dst_height = luma_size / y_pitch;
        luma_size == y_pitch * dst_height
            && v_offset.checked_sub(u_offset) == Some(u_pitch * dst_height / 2)
    }
}

/// Semi-planar 4:2:0 source in CPU memory.
#[derive(Debug, Clone, Copy)]
pub struct Nv12Source<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub hor_stride: usize,
    pub ver_stride: usize,
}

/// Copies luma row by row and splits the interleaved chroma into separate
/// half-resolution U and V planes.
pub fn deinterleave_nv12(
    src: &Nv12Source<'_>,
    dst: &mut [u8],
    layout: &PlanarLayout,
) -> Result<(), DecodeError> {
    let Nv12Source {
        data,
        width,
        height,
        hor_stride,
        ver_stride,
    } = *src;
    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidLayout(
            "nv12 frame dimensions must be positive".to_string(),
        ));
    }
    let chroma_width = width.div_ceil(2);
    let chroma_height = height.div_ceil(2);
    if chroma_width * 2 > hor_stride || height > ver_stride {
        return Err(DecodeError::InvalidLayout(format!(
            "nv12 {width}x{height} exceeds stride {hor_stride}x{ver_stride}"
        )));
    }
    let luma_size = hor_stride
        .checked_mul(ver_stride)
        .ok_or_else(|| DecodeError::InvalidLayout("nv12 luma size overflow".to_string()))?;
    if data.len() < luma_size + hor_stride * chroma_height {
        return Err(DecodeError::InvalidLayout(
            "nv12 data is smaller than expected".to_string(),
        ));
    }

    let [y_offset, u_offset, v_offset] = layout.offsets;
    let [y_pitch, u_pitch, v_pitch] = layout.pitches;
    if y_pitch < width || u_pitch < chroma_width || v_pitch < chroma_width {
        return Err(DecodeError::InvalidLayout(
            "planar pitch narrower than the image".to_string(),
        ));
    }
    let dst_end = [
        y_offset + y_pitch * (height - 1) + width,
        u_offset + u_pitch * (chroma_height - 1) + chroma_width,
        v_offset + v_pitch * (chroma_height - 1) + chroma_width,
    ];
    if dst_end.iter().any(|&end| end > dst.len()) {
        return Err(DecodeError::InvalidLayout(
            "planar destination is smaller than expected".to_string(),
        ));
    }

    for y in 0..height {
        let src_row = &data[y * hor_stride..y * hor_stride + width];
        let dst_start = y_offset + y * y_pitch;
        dst[dst_start..dst_start + width].copy_from_slice(src_row);
    }

    for y in 0..chroma_height {
        let row_start = luma_size + y * hor_stride;
        let src_row = &data[row_start..row_start + chroma_width * 2];
        let u_row = u_offset + y * u_pitch;
        let v_row = v_offset + y * v_pitch;
        for (x, pair) in src_row.chunks_exact(2).enumerate() {
            dst[u_row + x] = pair[0];
            dst[v_row + x] = pair[1];
        }
    }

    Ok(())
}

/// Produces pooled planar frames from engine frames.
pub(crate) struct SoftwareConverter {
    accelerator: Option<Arc<dyn BlitAccelerator>>,
    gate: &'static AcceleratorGate,
    pool: PoolSlot,
    slow_frames: u64,
}

impl SoftwareConverter {
    pub(crate) fn new(
        accelerator: Option<Arc<dyn BlitAccelerator>>,
        gate: &'static AcceleratorGate,
    ) -> Self {
        Self {
            accelerator,
            gate,
            pool: PoolSlot::default(),
            slow_frames: 0,
        }
    }

    pub(crate) fn pool(&self) -> &PoolSlot {
        &self.pool
    }

    pub(crate) fn slow_frames(&self) -> u64 {
        self.slow_frames
    }

    pub(crate) fn gate(&self) -> &'static AcceleratorGate {
        self.gate
    }

    pub(crate) fn convert(
        &mut self,
        frame: &MppFrame,
        buffer: &MppBuffer,
    ) -> Result<PlanarFrame, DecodeError> {
        let (hor_stride, ver_stride) = (frame.hor_stride as usize, frame.ver_stride as usize);
        let layout = PlanarLayout::from_strides(hor_stride, ver_stride);
        let size = if frame.buf_size > 0 {
            frame.buf_size
        } else {
            buffer.size()
        };
        if layout.required_size() > size {
            return Err(DecodeError::InvalidLayout(format!(
                "engine buffer of {size} bytes cannot hold {hor_stride}x{ver_stride} planar"
            )));
        }

        let mut out = self.pool.ensure(size).acquire()?;
        let (width, height) = (frame.width as usize, frame.height as usize);

        if !self.try_blit(frame, buffer, out.as_mut_slice(), &layout) {
            if self.slow_frames == 0 {
                warn!("doing slow software conversion");
            }
            self.slow_frames += 1;
            deinterleave_nv12(
                &Nv12Source {
                    data: &buffer.data,
                    width,
                    height,
                    hor_stride,
                    ver_stride,
                },
                out.as_mut_slice(),
                &layout,
            )?;
        }

        Ok(PlanarFrame::new(out, layout, width, height))
    }

    fn try_blit(
        &self,
        frame: &MppFrame,
        buffer: &MppBuffer,
        dst: &mut [u8],
        layout: &PlanarLayout,
    ) -> bool {
        let Some(accelerator) = self.accelerator.as_deref() else {
            return false;
        };
        if !self.gate.ready(accelerator) || !layout.is_contiguous() {
            return false;
        }

        let src = BlitSource {
            fd: buffer.fd,
            rect: BlitRect {
                width: frame.width as usize,
                height: frame.height as usize,
                wstride: frame.hor_stride as usize,
                hstride: frame.ver_stride as usize,
            },
        };
        let [y_pitch, ..] = layout.pitches;
        let dst_rect = BlitRect {
            width: frame.width as usize,
            height: frame.height as usize,
            wstride: y_pitch,
            hstride: layout.offsets[1] / y_pitch,
        };
        match accelerator.blit_nv12_to_i420(&src, dst, &dst_rect) {
            Ok(()) => {
                self.gate.blits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                debug!(%err, "blit failed, disabling accelerator");
                self.gate.disable();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::sim::nv12_pattern;

    #[derive(Debug, Default)]
    struct FakeBlitter {
        fail_init: bool,
        fail_blit: bool,
        inits: AtomicUsize,
        blits: AtomicUsize,
    }

    impl BlitAccelerator for FakeBlitter {
        fn init(&self) -> Result<(), BlitError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(BlitError("no rga device".to_string()))
            } else {
                Ok(())
            }
        }

        fn blit_nv12_to_i420(
            &self,
            _src: &BlitSource,
            dst: &mut [u8],
            _dst_rect: &BlitRect,
        ) -> Result<(), BlitError> {
            self.blits.fetch_add(1, Ordering::SeqCst);
            if self.fail_blit {
                return Err(BlitError("bad rect".to_string()));
            }
            dst.fill(0xAB);
            Ok(())
        }
    }

    fn leaked_gate() -> &'static AcceleratorGate {
        Box::leak(Box::new(AcceleratorGate::new()))
    }

    fn frame(width: u32, height: u32) -> MppFrame {
        let (hs, vs) = (width.div_ceil(16) * 16, height.div_ceil(16) * 16);
        let data = nv12_pattern(hs, vs, 3);
        MppFrame {
            width,
            height,
            hor_stride: hs,
            ver_stride: vs,
            buf_size: data.len(),
            buffer: Some(MppBuffer {
                fd: 42,
                data: data.into(),
            }),
            ..MppFrame::empty()
        }
    }

    #[test]
    fn deinterleave_matches_source_planes() {
        let (width, height, hs, vs) = (6, 4, 8, 4);
        let mut src = vec![0_u8; hs * vs * 3 / 2];
        for (i, byte) in src.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let layout = PlanarLayout::from_strides(hs, vs);
        let mut dst = vec![0_u8; layout.required_size()];
        deinterleave_nv12(
            &Nv12Source {
                data: &src,
                width,
                height,
                hor_stride: hs,
                ver_stride: vs,
            },
            &mut dst,
            &layout,
        )
        .unwrap();

        for y in 0..height {
            assert_eq!(&dst[y * hs..y * hs + width], &src[y * hs..y * hs + width]);
        }
        let luma = hs * vs;
        for y in 0..height / 2 {
            for x in 0..width / 2 {
                let pair = luma + y * hs + 2 * x;
                assert_eq!(dst[layout.offsets[1] + y * hs / 2 + x], src[pair]);
                assert_eq!(dst[layout.offsets[2] + y * hs / 2 + x], src[pair + 1]);
            }
        }
    }

    #[test]
    fn deinterleave_rejects_short_source() {
        let layout = PlanarLayout::from_strides(16, 16);
        let mut dst = vec![0_u8; layout.required_size()];
        let result = deinterleave_nv12(
            &Nv12Source {
                data: &[0_u8; 16],
                width: 16,
                height: 16,
                hor_stride: 16,
                ver_stride: 16,
            },
            &mut dst,
            &layout,
        );
        assert!(matches!(result, Err(DecodeError::InvalidLayout(_))));
    }

    #[test]
    fn software_path_without_accelerator() {
        let mut converter = SoftwareConverter::new(None, leaked_gate());
        let frame = frame(40, 20);
        let buffer = frame.buffer.clone().unwrap();
        let planar = converter.convert(&frame, &buffer).unwrap();

        assert_eq!(planar.pitch(0), Some(48));
        assert_eq!(planar.pitch(1), Some(24));
        for y in 0..20 {
            assert_eq!(planar.row(0, y).unwrap(), &buffer.data[y * 48..y * 48 + 40]);
        }
        assert_eq!(converter.slow_frames(), 1);
        assert_eq!(converter.pool().current_size(), Some(frame.buf_size));
    }

    #[test]
    fn accelerator_handles_contiguous_layout() {
        let blitter = Arc::new(FakeBlitter::default());
        let gate = leaked_gate();
        let accelerator: Arc<dyn BlitAccelerator> = blitter.clone();
        let mut converter = SoftwareConverter::new(Some(accelerator), gate);
        let frame = frame(32, 32);
        let buffer = frame.buffer.clone().unwrap();

        for _ in 0..3 {
            let planar = converter.convert(&frame, &buffer).unwrap();
            assert!(planar.plane(0).unwrap().iter().all(|&b| b == 0xAB));
        }
        assert_eq!(blitter.inits.load(Ordering::SeqCst), 1);
        assert_eq!(blitter.blits.load(Ordering::SeqCst), 3);
        assert_eq!(gate.blits(), 3);
        assert_eq!(converter.slow_frames(), 0);
    }

    #[test]
    fn failed_init_disables_accelerator_for_good() {
        let blitter = Arc::new(FakeBlitter {
            fail_init: true,
            ..FakeBlitter::default()
        });
        let gate = leaked_gate();
        let accelerator: Arc<dyn BlitAccelerator> = blitter.clone();
        let mut converter = SoftwareConverter::new(Some(accelerator), gate);
        let frame = frame(32, 16);
        let buffer = frame.buffer.clone().unwrap();

        for _ in 0..4 {
            converter.convert(&frame, &buffer).unwrap();
        }
        assert!(!gate.is_supported());
        assert_eq!(blitter.inits.load(Ordering::SeqCst), 1);
        assert_eq!(blitter.blits.load(Ordering::SeqCst), 0);
        assert_eq!(converter.slow_frames(), 4);
    }

    #[test]
    fn failed_blit_falls_back_and_stops_trying() {
        let blitter = Arc::new(FakeBlitter {
            fail_blit: true,
            ..FakeBlitter::default()
        });
        let gate = leaked_gate();
        let accelerator: Arc<dyn BlitAccelerator> = blitter.clone();
        let mut converter = SoftwareConverter::new(Some(accelerator), gate);
        let frame = frame(32, 16);
        let buffer = frame.buffer.clone().unwrap();

        let planar = converter.convert(&frame, &buffer).unwrap();
        assert_eq!(planar.row(0, 1).unwrap(), &buffer.data[32..64]);
        converter.convert(&frame, &buffer).unwrap();

        assert_eq!(blitter.blits.load(Ordering::SeqCst), 1);
        assert!(!gate.is_supported());
        assert_eq!(converter.slow_frames(), 2);
    }

    #[test]
    fn padded_layout_is_not_contiguous() {
        let mut layout = PlanarLayout::from_strides(64, 32);
        assert!(layout.is_contiguous());
        layout.pitches[1] = 40;
        assert!(!layout.is_contiguous());
        let mut layout = PlanarLayout::from_strides(64, 32);
        layout.offsets[2] += 64;
        assert!(!layout.is_contiguous());
    }

    #[test]
    fn reversed_planes_are_not_contiguous() {
        let mut layout = PlanarLayout::from_strides(64, 32);
        layout.offsets = [64 * 32, 0, 64 * 32 + 32 * 16];
        assert!(!layout.is_contiguous());
        layout.offsets = [0, 64 * 32, 0];
        assert!(!layout.is_contiguous());
    }
}
