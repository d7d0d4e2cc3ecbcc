//! Consumer side: a timer-driven loop that moves the latest frame onto the
//! host's bitmap and keeps a moving-average frame rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replicator_platform::screen::PixelBuffer;
use tracing::{debug, info};

use crate::slot::SharedFrameSlot;

/// What the display loop needs from the widget toolkit.
///
/// The host delivers tick and paint callbacks; its paint handler only blits
/// the current bitmap.
pub trait HostSurface {
    /// Resize the hosting window to `width` x `height`.
    fn set_size(&mut self, width: u32, height: u32);
    /// Replace the bitmap with a newly allocated one.
    fn set_bitmap(&mut self, pixels: &[u8], width: u32, height: u32);
    /// Overwrite the current bitmap's pixels; dimensions are unchanged.
    fn update_bitmap_in_place(&mut self, pixels: &[u8]);
    fn set_rate_label(&mut self, text: &str);
    fn request_repaint(&mut self);
}

/// Ring of the most recent instantaneous frame-rate samples.
#[derive(Debug, Clone)]
pub struct FpsWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest once full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Arithmetic mean of the retained samples, `0.0` when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Tunables for the display loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    pub target_fps: u32,
    pub fps_window: usize,
    /// The rate label is refreshed on every n-th tick.
    pub label_every: u64,
    /// Subtracted from every re-arm delay on top of the measured tick time.
    pub pacing_correction: Duration,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            target_fps: 60,
            fps_window: 30,
            label_every: 10,
            pacing_correction: Duration::from_micros(571),
        }
    }
}

impl DisplaySettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }
}

/// Delay until the next tick: one period minus the time this tick took and
/// the fixed correction, never negative.
pub fn next_delay(period: Duration, tick_time: Duration, correction: Duration) -> Duration {
    period.saturating_sub(tick_time).saturating_sub(correction)
}

pub fn rate_label(rate: f64) -> String {
    format!("FPS: {:.1}", rate)
}

pub struct DisplayLoop {
    slot: Arc<SharedFrameSlot>,
    settings: DisplaySettings,
    fps: FpsWindow,
    ticks: u64,
    /// `(width, height)` of the bitmap on screen.
    displayed: (u32, u32),
    last_tick: Instant,
}

impl DisplayLoop {
    /// Size the host and allocate its bitmap from the first available frame.
    pub fn start(
        slot: Arc<SharedFrameSlot>,
        settings: DisplaySettings,
        first: &PixelBuffer,
        surface: &mut dyn HostSurface,
        now: Instant,
    ) -> Self {
        let (width, height) = (first.width(), first.height());
        surface.set_size(width, height);
        surface.set_bitmap(first.data(), width, height);
        surface.set_rate_label(&rate_label(0.0));

        info!(
            "display started at {}x{} (target {} fps)",
            width, height, settings.target_fps
        );

        Self {
            slot,
            fps: FpsWindow::new(settings.fps_window),
            settings,
            ticks: 0,
            displayed: (width, height),
            last_tick: now,
        }
    }

    /// One timer tick, begun at `started`. Returns how long the host should
    /// wait before the next one.
    pub fn tick(&mut self, surface: &mut dyn HostSurface, started: Instant) -> Duration {
        if let Some(frame) = self.slot.read_latest() {
            self.show(&frame, surface);
        }

        let elapsed = started.saturating_duration_since(self.last_tick);
        if !elapsed.is_zero() {
            let current = 1.0 / elapsed.as_secs_f64();
            self.fps.push(current);
            debug!("cur_fps: {:.2}, moving_avg_fps: {:.2}", current, self.fps.mean());
        }
        self.last_tick = started;

        if self.ticks % self.settings.label_every.max(1) == 0 {
            surface.set_rate_label(&rate_label(self.fps.mean()));
        }
        self.ticks += 1;

        surface.request_repaint();

        let taken = Instant::now().saturating_duration_since(started);
        next_delay(self.settings.period(), taken, self.settings.pacing_correction)
    }

    fn show(&mut self, frame: &PixelBuffer, surface: &mut dyn HostSurface) {
        let size = (frame.width(), frame.height());
        if size != self.displayed {
            info!(
                "source resized from {}x{} to {}x{}",
                self.displayed.0, self.displayed.1, size.0, size.1
            );
            self.displayed = size;
            surface.set_size(size.0, size.1);
            surface.set_bitmap(frame.data(), size.0, size.1);
        } else {
            surface.update_bitmap_in_place(frame.data());
        }
    }

    /// Current moving-average frame rate.
    pub fn rate(&self) -> f64 {
        self.fps.mean()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// `(width, height)` of the bitmap on screen.
    pub fn displayed_size(&self) -> (u32, u32) {
        self.displayed
    }
}
