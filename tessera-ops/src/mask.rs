//! Masks rendered on worker threads ahead of a flush.
//!
//! A [`PendingMask`] is produced on the rayon pool and consumed exactly once,
//! by the prepare step that uploads it; that step blocks until the pixels are
//! ready.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::{
    flush_state::{DeferredUpload, WritePixels},
    rect::IRect,
    resource::ProxyId,
};

enum MaskState {
    Pending,
    Ready(Option<Arc<[u8]>>),
}

struct MaskSlot {
    state: Mutex<MaskState>,
    ready: Condvar,
}

/// A mask whose pixels are being rendered in the background.
#[derive(Clone)]
pub struct PendingMask {
    width: u32,
    height: u32,
    slot: Arc<MaskSlot>,
}

impl PendingMask {
    /// Starts rendering a `width` x `height` mask on the rayon pool.
    ///
    /// `render` returns the mask's pixels, or `None` if it could not be
    /// produced.
    pub fn spawn<F>(width: u32, height: u32, render: F) -> Self
    where
        F: FnOnce(u32, u32) -> Option<Vec<u8>> + Send + 'static,
    {
        let slot = Arc::new(MaskSlot {
            state: Mutex::new(MaskState::Pending),
            ready: Condvar::new(),
        });
        let worker_slot = Arc::clone(&slot);
        rayon::spawn(move || {
            let pixels = render(width, height).map(Arc::from);
            trace!("Mask {}x{} rendered", width, height);
            *worker_slot.state.lock() = MaskState::Ready(pixels);
            worker_slot.ready.notify_all();
        });
        Self {
            width,
            height,
            slot,
        }
    }

    /// Mask width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Mask height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns true once the worker has finished.
    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.state.lock(), MaskState::Ready(_))
    }

    /// Blocks until the worker finishes and returns the pixels.
    pub fn wait(&self) -> Option<Arc<[u8]>> {
        let mut state = self.slot.state.lock();
        while matches!(*state, MaskState::Pending) {
            self.slot.ready.wait(&mut state);
        }
        match &*state {
            MaskState::Ready(pixels) => pixels.clone(),
            MaskState::Pending => None,
        }
    }

    /// Wraps the mask into an upload that waits for the pixels and writes
    /// them to `proxy`.
    pub fn into_upload(self, proxy: ProxyId) -> DeferredUpload {
        Box::new(move |writer: &mut WritePixels<'_>| {
            let region = IRect::from_size(
                i32::try_from(self.width).unwrap_or(i32::MAX),
                i32::try_from(self.height).unwrap_or(i32::MAX),
            );
            match self.wait() {
                Some(pixels) => {
                    writer.write(proxy, region, &pixels);
                }
                None => warn!("Mask for {:?} was not produced", proxy),
            }
        })
    }
}
