use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier of a top-level window.
///
/// Carries the raw OS handle value as an integer so it can be handed to a
/// worker process on its command line. It is only a reference: the window may
/// be destroyed at any time, and capture against a stale handle must fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub isize);

impl WindowHandle {
    pub fn raw(self) -> isize {
        self.0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl std::str::FromStr for WindowHandle {
    type Err = std::num::ParseIntError;

    /// Accepts decimal or `0x`-prefixed hexadecimal. Hex is read as the
    /// unsigned bit pattern, the form [`Display`](fmt::Display) prints.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => usize::from_str_radix(hex, 16).map(|bits| WindowHandle(bits as isize)),
            None => s.parse::<isize>().map(WindowHandle),
        }
    }
}

/// A visible top-level window as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    /// Title text; may be empty and is neither unique nor stable.
    pub title: String,
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("window enumeration failed: {context} (os error {code})")]
    Os { context: &'static str, code: u32 },
    #[error("window enumeration is not supported on this platform")]
    Unsupported,
}

pub trait WindowEnumerator: Send + Sync {
    /// Snapshot of all top-level windows currently marked visible, in
    /// platform enumeration order.
    fn visible_windows(&self) -> Result<Vec<WindowInfo>, EnumerateError>;
}
