//! Shared ownership of the engine context.
//!
//! The session holds one `Arc<EngineHandle>` and every zero-copy frame holds
//! another through its [`FrameLease`]. Teardown runs in `Drop`, i.e. when the
//! last of those references goes away, whichever side that is.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::engine::{FrameGroup, MppEngine, MppFrame};

/// DRM device context that exported frames are importable on.
#[derive(Debug)]
pub struct DrmDevice {
    node: PathBuf,
}

impl DrmDevice {
    pub(crate) fn new(node: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { node: node.into() })
    }

    pub fn node(&self) -> &Path {
        &self.node
    }
}

pub(crate) struct EngineHandle {
    engine: Mutex<Box<dyn MppEngine>>,
    frame_group: FrameGroup,
    device: Arc<DrmDevice>,
}

impl EngineHandle {
    pub(crate) fn new(
        engine: Box<dyn MppEngine>,
        frame_group: FrameGroup,
        device: Arc<DrmDevice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(engine),
            frame_group,
            device,
        })
    }

    /// Engine calls are serialized here; the adapter is single-threaded but
    /// frame leases may be dropped from any thread.
    pub(crate) fn engine(&self) -> MutexGuard<'_, Box<dyn MppEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_frame(&self, frame: MppFrame) {
        self.engine().release_frame(frame);
    }

    pub(crate) fn frame_group(&self) -> FrameGroup {
        self.frame_group
    }

    pub(crate) fn device(&self) -> &Arc<DrmDevice> {
        &self.device
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let engine = self
            .engine
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = engine.reset() {
            debug!(%err, "engine reset during teardown failed");
        }
        engine.destroy();
        debug!(group = self.frame_group.id, "engine context destroyed");
    }
}

/// Keeps one native frame checked out of the engine.
///
/// Dropping the lease returns the frame to the engine and then drops the
/// engine reference it pins.
pub(crate) struct FrameLease {
    frame: Option<MppFrame>,
    engine: Arc<EngineHandle>,
}

impl FrameLease {
    pub(crate) fn new(frame: MppFrame, engine: Arc<EngineHandle>) -> Self {
        Self {
            frame: Some(frame),
            engine,
        }
    }

    pub(crate) fn frame(&self) -> Option<&MppFrame> {
        self.frame.as_ref()
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("pts", &self.frame.as_ref().map(|frame| frame.pts))
            .field("frame_group", &self.engine.frame_group.id)
            .finish()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.engine.release_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedEngine};

    fn handle() -> (Arc<EngineHandle>, crate::sim::SimProbe) {
        let (mut engine, probe) = SimulatedEngine::new(SimConfig::default());
        let group = engine.frame_group(16).unwrap();
        (
            EngineHandle::new(Box::new(engine), group, DrmDevice::new("/dev/dri/card0")),
            probe,
        )
    }

    #[test]
    fn teardown_waits_for_last_lease() {
        let (handle, probe) = handle();
        let leases = (0..3)
            .map(|_| FrameLease::new(probe.fabricate_frame(64, 32, 7), Arc::clone(&handle)))
            .collect::<Vec<_>>();

        drop(handle);
        assert!(!probe.destroyed());

        let mut leases = leases;
        leases.swap(0, 2);
        while let Some(lease) = leases.pop() {
            assert!(!probe.destroyed());
            drop(lease);
        }
        assert!(probe.destroyed());
        assert_eq!(probe.outstanding_frames(), 0);
    }

    #[test]
    fn lease_returns_frame_before_releasing_engine() {
        let (handle, probe) = handle();
        let lease = FrameLease::new(probe.fabricate_frame(64, 32, 7), Arc::clone(&handle));
        assert_eq!(probe.outstanding_frames(), 1);
        drop(lease);
        assert_eq!(probe.outstanding_frames(), 0);
        assert!(!probe.destroyed());
        drop(handle);
        assert!(probe.destroyed());
    }
}
