//! Producer side: capture as fast as the platform allows, publish each
//! result, stop when asked.

use replicator_platform::screen::{CaptureError, CaptureRegion};
use thiserror::Error;
use tracing::{debug, info};

use crate::capture::FrameCapture;
use crate::slot::FrameSink;

#[derive(Debug, Error)]
pub enum CaptureLoopError {
    #[error("capture unavailable: {0}")]
    Unavailable(#[source] CaptureError),
    #[error("frame sink closed")]
    SinkClosed(#[from] std::io::Error),
}

/// Counters reported when the loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Cycles that published a frame.
    pub frames: u64,
    /// Cycles that published "no frame".
    pub misses: u64,
}

/// Run the capture loop until `sink` reports a stop request.
///
/// `open` builds the capture; if it fails the loop ends at once with
/// [`CaptureLoopError::Unavailable`]. The stop flag is checked after each
/// capture and before its publish, so once stop is raised at most one more
/// publish can happen.
pub fn run_capture_loop<O, S>(
    open: O,
    region: Option<CaptureRegion>,
    sink: &S,
) -> Result<LoopStats, CaptureLoopError>
where
    O: FnOnce() -> Result<FrameCapture, CaptureError>,
    S: FrameSink + ?Sized,
{
    let mut capture = open().map_err(CaptureLoopError::Unavailable)?;
    info!(
        "capture loop started for window {} (region={})",
        capture.handle(),
        region.map_or_else(|| "client area".to_string(), |r| r.to_string())
    );

    let mut stats = LoopStats::default();
    loop {
        let frame = capture.capture_frame(region);

        if sink.is_stop_requested() {
            debug!("stop signal received");
            break;
        }

        if frame.is_some() {
            stats.frames += 1;
        } else {
            stats.misses += 1;
        }
        sink.publish(frame)?;
    }

    info!(
        "capture loop stopped after {} frames ({} cycles without a frame)",
        stats.frames, stats.misses
    );
    Ok(stats)
}
