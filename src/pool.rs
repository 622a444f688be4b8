//! Reusable CPU buffers for the software output path.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use crate::contract::DecodeError;

type FreeList = Mutex<Vec<Vec<u8>>>;

/// Fixed-size buffers handed out by a [`BufferPool`]. Dropping one returns
/// it to its pool, or frees it if the pool has since been replaced.
pub struct PooledBuffer {
    data: Vec<u8>,
    home: Weak<FreeList>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("pooled", &(self.home.strong_count() > 0))
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            let data = std::mem::take(&mut self.data);
            home.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(data);
        }
    }
}

#[derive(Debug)]
pub(crate) struct BufferPool {
    size: usize,
    free: Arc<FreeList>,
    allocated: usize,
}

impl BufferPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            free: Arc::new(Mutex::new(Vec::new())),
            allocated: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn acquire(&mut self) -> Result<PooledBuffer, DecodeError> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                let mut data = Vec::new();
                data.try_reserve_exact(self.size).map_err(|err| {
                    DecodeError::ResourceExhausted(format!(
                        "pool buffer of {} bytes: {err}",
                        self.size
                    ))
                })?;
                data.resize(self.size, 0);
                self.allocated += 1;
                data
            }
        };
        Ok(PooledBuffer {
            data,
            home: Arc::downgrade(&self.free),
        })
    }
}

/// At most one pool alive, sized to the latest requirement.
#[derive(Debug, Default)]
pub(crate) struct PoolSlot {
    pool: Option<BufferPool>,
    reallocations: u64,
}

impl PoolSlot {
    pub(crate) fn ensure(&mut self, size: usize) -> &mut BufferPool {
        if self.pool.as_ref().is_some_and(|pool| pool.size() != size) {
            debug!(size, "buffer size changed, reallocating pool");
            self.pool = None;
            self.reallocations += 1;
        }
        self.pool.get_or_insert_with(|| BufferPool::new(size))
    }

    pub(crate) fn current_size(&self) -> Option<usize> {
        self.pool.as_ref().map(BufferPool::size)
    }

    pub(crate) fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Buffers allocated by the live pool.
    pub(crate) fn allocated(&self) -> usize {
        self.pool.as_ref().map_or(0, BufferPool::allocated)
    }
}

/// Offsets and pitches of a fully planar 4:2:0 image inside one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanarLayout {
    pub offsets: [usize; 3],
    pub pitches: [usize; 3],
}

impl PlanarLayout {
    /// Y, U, V back to back: luma spans `ver_stride` rows of `hor_stride`,
    /// each chroma plane a quarter of that.
    pub fn from_strides(hor_stride: usize, ver_stride: usize) -> Self {
        let luma = hor_stride * ver_stride;
        Self {
            offsets: [0, luma, luma + luma / 4],
            pitches: [hor_stride, hor_stride / 2, hor_stride / 2],
        }
    }

    pub fn required_size(&self) -> usize {
        self.offsets[2] + self.offsets[2] - self.offsets[1]
    }
}

/// Software-converted frame backed by a pooled buffer.
#[derive(Debug)]
pub struct PlanarFrame {
    buffer: PooledBuffer,
    layout: PlanarLayout,
    width: usize,
    height: usize,
}

impl PlanarFrame {
    pub(crate) fn new(
        buffer: PooledBuffer,
        layout: PlanarLayout,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            buffer,
            layout,
            width,
            height,
        }
    }

    pub fn layout(&self) -> &PlanarLayout {
        &self.layout
    }

    /// Row pitch of `plane`, or `None` past the third plane.
    pub fn pitch(&self, plane: usize) -> Option<usize> {
        self.layout.pitches.get(plane).copied()
    }

    /// Bytes of `plane` from its offset up to the next plane, or `None` past
    /// the third plane.
    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        let start = *self.layout.offsets.get(plane)?;
        let end = match plane {
            0 | 1 => self.layout.offsets[plane + 1],
            _ => self.layout.required_size(),
        };
        self.buffer.as_slice().get(start..end)
    }

    /// Visible bytes of row `y` of `plane`, or `None` outside the picture.
    pub fn row(&self, plane: usize, y: usize) -> Option<&[u8]> {
        let (width, height) = if plane == 0 {
            (self.width, self.height)
        } else {
            (self.width.div_ceil(2), self.height.div_ceil(2))
        };
        if y >= height {
            return None;
        }
        let start = y * self.pitch(plane)?;
        self.plane(plane)?.get(start..start + width)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_recycled() {
        let mut pool = BufferPool::new(1024);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        drop(first);
        let third = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(third.len(), 1024);
        drop(second);
    }

    #[test]
    fn size_change_replaces_pool_and_orphans_old_buffers() {
        let mut slot = PoolSlot::default();
        let old = slot.ensure(64).acquire().unwrap();
        assert_eq!(slot.ensure(64).allocated(), 1);

        let fresh = slot.ensure(128).acquire().unwrap();
        assert_eq!(slot.current_size(), Some(128));
        assert_eq!(slot.reallocations(), 1);
        assert_eq!(fresh.len(), 128);

        drop(old);
        assert_eq!(slot.ensure(128).allocated(), 1);
        let again = slot.ensure(128).acquire().unwrap();
        assert_eq!(again.len(), 128);
    }

    #[test]
    fn planar_layout_is_contiguous() {
        let layout = PlanarLayout::from_strides(64, 48);
        assert_eq!(layout.offsets, [0, 64 * 48, 64 * 48 + 64 * 48 / 4]);
        assert_eq!(layout.pitches, [64, 32, 32]);
        assert_eq!(layout.required_size(), 64 * 48 * 3 / 2);
    }
}
