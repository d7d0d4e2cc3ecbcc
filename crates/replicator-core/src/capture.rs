//! Single-frame capture of a window's client area.

use replicator_platform::screen::{CaptureBackend, CaptureError, CaptureRegion, PixelBuffer};
use replicator_platform::window::WindowHandle;
use tracing::debug;

use crate::registry::WindowRegistry;

/// Swap the first and third sample of every pixel (BGR <-> RGB).
pub fn swap_red_blue(buf: &mut [u8]) {
    for px in buf.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// Captures one window, bound at construction.
pub struct FrameCapture {
    backend: Box<dyn CaptureBackend>,
}

impl FrameCapture {
    pub fn bind(backend: Box<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    /// Resolve `title` to a unique visible window and bind to it.
    pub fn open<F>(registry: &WindowRegistry, title: &str, open_backend: F) -> Result<Self, CaptureError>
    where
        F: FnOnce(WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError>,
    {
        let handle = registry.resolve_handle(title).map_err(|e| {
            debug!("cannot bind capture: {}", e);
            CaptureError::WindowNotFound
        })?;
        Ok(Self::bind(open_backend(handle)?))
    }

    pub fn handle(&self) -> WindowHandle {
        self.backend.handle()
    }

    /// Region that a capture of `requested` would read right now.
    pub fn effective_region(&self, requested: Option<CaptureRegion>) -> Result<CaptureRegion, CaptureError> {
        let (width, height) = self.backend.client_size()?;
        let region = requested.unwrap_or_else(|| CaptureRegion::full(width, height));
        Ok(region.aligned())
    }

    /// Capture `region` (whole client area when `None`) as an RGB buffer.
    pub fn try_capture(&mut self, region: Option<CaptureRegion>) -> Result<PixelBuffer, CaptureError> {
        let region = self.effective_region(region)?;
        if region.is_empty() {
            return Err(CaptureError::EmptyRegion {
                width: region.width,
                height: region.height,
            });
        }

        let mut buf = vec![0u8; region.buffer_len()];
        let lines = self.backend.copy_region(&region, &mut buf)?;
        let expected = region.height as u32;
        if lines != expected {
            return Err(CaptureError::Incomplete {
                expected,
                actual: lines,
            });
        }

        swap_red_blue(&mut buf);

        PixelBuffer::from_raw(region.width as u32, expected, buf).ok_or(CaptureError::Incomplete {
            expected,
            actual: lines,
        })
    }

    /// Like [`try_capture`](Self::try_capture), but every failure is "no
    /// frame this cycle".
    pub fn capture_frame(&mut self, region: Option<CaptureRegion>) -> Option<PixelBuffer> {
        match self.try_capture(region) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("no frame from window {}: {}", self.handle(), e);
                None
            }
        }
    }
}
