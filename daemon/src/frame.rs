//! Camera frames from the glasses
//!
//! The glasses-side client pushes the most recent still over IPC; the state
//! machine only ever asks for whatever frame is current when a turn begins.

use std::sync::{Arc, RwLock};

use tracing::debug;

/// An encoded still image (JPEG or PNG bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Arc<[u8]>,
}

impl Frame {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("len", &self.len()).finish()
    }
}

/// Source of the current camera frame
pub trait FrameProvider: Send + Sync {
    /// The latest frame, if the camera is streaming
    fn current_frame(&self) -> Option<Frame>;
}

/// Holds the latest frame pushed by the client
#[derive(Debug, Default, Clone)]
pub struct FrameStore {
    latest: Arc<RwLock<Option<Frame>>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame
    pub fn submit(&self, frame: Frame) {
        debug!(len = frame.len(), "frame submitted");
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(frame);
        }
    }

    /// Forget the current frame (stream stopped)
    pub fn clear(&self) {
        if let Ok(mut latest) = self.latest.write() {
            *latest = None;
        }
    }
}

impl FrameProvider for FrameStore {
    fn current_frame(&self) -> Option<Frame> {
        self.latest.read().ok().and_then(|latest| latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_empty() {
        let store = FrameStore::new();
        assert!(store.current_frame().is_none());
    }

    #[test]
    fn test_submit_replaces_and_clear_forgets() {
        let store = FrameStore::new();
        store.submit(Frame::new(vec![1u8, 2, 3]));
        store.submit(Frame::new(vec![4u8]));
        assert_eq!(store.current_frame().unwrap().bytes(), &[4u8]);

        // Clones share the same slot
        let view = store.clone();
        store.clear();
        assert!(view.current_frame().is_none());
    }
}
