//! Single-slot "latest frame wins" mailbox between capture and display.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replicator_platform::screen::PixelBuffer;
use tracing::{debug, warn};

/// Where the capture loop delivers frames.
pub trait FrameSink {
    /// Replace whatever was published before. `None` means "no frame".
    fn publish(&self, frame: Option<PixelBuffer>) -> std::io::Result<()>;

    fn is_stop_requested(&self) -> bool;
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<PixelBuffer>>,
    stop: bool,
    fault: Option<String>,
    publishes: u64,
}

/// Latest captured frame plus the stop flag, behind one lock.
///
/// Every publish overwrites the stored frame; nothing is queued. A reader
/// sees either nothing yet or the frame of the most recent completed
/// publish. Frames are shared out as `Arc`s so the display never holds the
/// lock while it copies pixels, and never aliases a buffer the capture side
/// is still writing.
#[derive(Default)]
pub struct SharedFrameSlot {
    state: Mutex<SlotState>,
}

impl SharedFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, frame: Option<PixelBuffer>) {
        let frame = frame.map(Arc::new);
        let mut state = self.state();
        state.frame = frame;
        state.publishes += 1;
    }

    pub fn read_latest(&self) -> Option<Arc<PixelBuffer>> {
        self.state().frame.clone()
    }

    /// Raise the stop flag. Returns `true` only for the call that raised it.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state();
        if state.stop {
            return false;
        }
        state.stop = true;
        debug!("stop requested");
        true
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state().stop
    }

    /// Record a pipeline failure. Only the first one is kept.
    pub fn report_fault(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state();
        if state.fault.is_none() {
            warn!("capture pipeline fault: {}", message);
            state.fault = Some(message);
        }
    }

    /// The recorded fault, handed out once.
    pub fn take_fault(&self) -> Option<String> {
        self.state().fault.take()
    }

    /// Number of completed publishes, frames and "no frame" alike.
    pub fn publish_count(&self) -> u64 {
        self.state().publishes
    }
}

impl FrameSink for SharedFrameSlot {
    fn publish(&self, frame: Option<PixelBuffer>) -> std::io::Result<()> {
        SharedFrameSlot::publish(self, frame);
        Ok(())
    }

    fn is_stop_requested(&self) -> bool {
        SharedFrameSlot::is_stop_requested(self)
    }
}
