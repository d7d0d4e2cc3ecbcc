use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::window::WindowHandle;

/// Samples per pixel in a [`PixelBuffer`] (8-bit R, G, B).
pub const BYTES_PER_PIXEL: usize = 3;

/// Blit width alignment required by the 24-bit DIB path.
pub const WIDTH_ALIGNMENT: i32 = 8;

/// Round a requested capture width down to a multiple of
/// [`WIDTH_ALIGNMENT`]. Never rounds up, never goes below zero.
pub fn align_width(width: i32) -> i32 {
    if width <= 0 {
        return 0;
    }
    width - width % WIDTH_ALIGNMENT
}

/// Rectangle inside a window's client area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl CaptureRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The whole client area of a `width` x `height` window.
    pub fn full(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Same origin and height, width rounded down to the blit alignment.
    pub fn aligned(self) -> Self {
        Self {
            width: align_width(self.width),
            height: self.height.max(0),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Byte length of a top-down 24-bit buffer for this region.
    pub fn buffer_len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for CaptureRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid capture region {0:?}, expected x,y,width,height")]
pub struct ParseRegionError(pub String);

impl std::str::FromStr for CaptureRegion {
    type Err = ParseRegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i32> = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseRegionError(s.to_string()))?;

        match parts.as_slice() {
            [x, y, w, h] if *w >= 0 && *h >= 0 => Ok(Self::new(*x, *y, *w, *h)),
            _ => Err(ParseRegionError(s.to_string())),
        }
    }
}

/// Dense `height x width x 3` RGB image, row-major, origin top-left.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGB samples. Returns `None` when the length does not match
    /// the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// A buffer where every sample equals `value`.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            data: vec![value; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(height, width)`, the order image arrays are usually described in.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// `(height, width, channels)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, BYTES_PER_PIXEL)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no unique window to capture")]
    WindowNotFound,
    #[error("window no longer exists")]
    WindowGone,
    #[error("capture region is empty ({width}x{height})")]
    EmptyRegion { width: i32, height: i32 },
    #[error("incomplete capture: {actual} of {expected} scanlines")]
    Incomplete { expected: u32, actual: u32 },
    #[error("{context} failed (os error {code})")]
    Os { context: &'static str, code: u32 },
    #[error("window capture is not supported on this platform")]
    Unsupported,
}

/// OS-specific pixel source bound to one window.
pub trait CaptureBackend: Send {
    fn handle(&self) -> WindowHandle;

    /// Current client area `(width, height)`. A minimized window reports
    /// `(0, 0)`; a destroyed one reports [`CaptureError::WindowGone`].
    fn client_size(&self) -> Result<(i32, i32), CaptureError>;

    /// Copy `region` of the live window into `dest`, top-down, 24 bits per
    /// pixel in the platform's native BGR order. `dest` is exactly
    /// `region.buffer_len()` bytes. Returns the number of scanlines written.
    ///
    /// Everything acquired during the call is released before it returns,
    /// on success and on failure.
    fn copy_region(&mut self, region: &CaptureRegion, dest: &mut [u8]) -> Result<u32, CaptureError>;
}
