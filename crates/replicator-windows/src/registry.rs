//! Top-level window enumeration via `EnumWindows`.

use anyhow::Result;
use replicator_platform::window::{EnumerateError, WindowEnumerator, WindowHandle, WindowInfo};
use tracing::debug;

use windows::Win32::Foundation::{BOOL, HWND, LPARAM, TRUE};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextLengthW, GetWindowTextW, IsWindowVisible,
};

/// Reconstruct an HWND from the raw value carried in a [`WindowHandle`].
#[inline]
pub(crate) fn hwnd(handle: WindowHandle) -> HWND {
    HWND(handle.raw() as *mut std::ffi::c_void)
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let handles = &mut *(lparam.0 as *mut Vec<isize>);
    handles.push(hwnd.0 as isize);
    TRUE
}

/// Read a window title; windows without a title yield an empty string.
unsafe fn window_title(hwnd: HWND) -> String {
    let len = GetWindowTextLengthW(hwnd);
    if len <= 0 {
        return String::new();
    }
    let mut buf = vec![0u16; len as usize + 1];
    let copied = GetWindowTextW(hwnd, &mut buf);
    String::from_utf16_lossy(&buf[..copied.max(0) as usize])
}

pub struct Win32WindowEnumerator;

impl WindowEnumerator for Win32WindowEnumerator {
    fn visible_windows(&self) -> Result<Vec<WindowInfo>, EnumerateError> {
        let mut raw: Vec<isize> = Vec::new();
        unsafe {
            EnumWindows(Some(collect_window), LPARAM(&mut raw as *mut Vec<isize> as isize))
                .map_err(|e| EnumerateError::Os {
                    context: "EnumWindows",
                    code: e.code().0 as u32,
                })?;
        }

        let mut windows = Vec::new();
        for value in raw {
            let handle = WindowHandle(value);
            unsafe {
                let hwnd = hwnd(handle);
                if !IsWindowVisible(hwnd).as_bool() {
                    continue;
                }
                windows.push(WindowInfo {
                    handle,
                    title: window_title(hwnd),
                });
            }
        }

        debug!("enumerated {} visible top-level windows", windows.len());
        Ok(windows)
    }
}

/// Factory function for the window enumerator on Windows
pub fn create_window_enumerator() -> Result<Box<dyn WindowEnumerator>> {
    Ok(Box::new(Win32WindowEnumerator))
}
