//! Window client-area capture through GDI.
//!
//! Every capture acquires the window DC, a compatible memory DC and a
//! compatible bitmap, stretch-copies the requested region into the bitmap and
//! reads it back as a top-down 24-bit DIB. Each handle is owned by a guard so
//! it is released on every exit path.

use std::ffi::c_void;
use std::mem::size_of;

use replicator_platform::screen::{CaptureBackend, CaptureError, CaptureRegion};
use replicator_platform::window::WindowHandle;
use tracing::debug;

use windows::Win32::Foundation::{GetLastError, HWND, RECT};
use windows::Win32::Graphics::Gdi::{
    CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    ReleaseDC, SelectObject, SetStretchBltMode, StretchBlt, BITMAPINFO, BITMAPINFOHEADER, BI_RGB,
    COLORONCOLOR, DIB_RGB_COLORS, HBITMAP, HDC, HGDIOBJ, SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{GetClientRect, IsWindow};

use crate::registry::hwnd;

fn last_os_error(context: &'static str) -> CaptureError {
    CaptureError::Os {
        context,
        code: unsafe { GetLastError().0 },
    }
}

struct WindowDcGuard {
    hwnd: HWND,
    dc: HDC,
}

impl WindowDcGuard {
    unsafe fn new(hwnd: HWND) -> Result<Self, CaptureError> {
        let dc = GetDC(hwnd);
        if dc.0.is_null() {
            return Err(last_os_error("GetDC"));
        }
        Ok(Self { hwnd, dc })
    }
}

impl Drop for WindowDcGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = ReleaseDC(self.hwnd, self.dc);
        }
    }
}

struct MemoryDcGuard {
    dc: HDC,
}

impl MemoryDcGuard {
    unsafe fn new(source: HDC) -> Result<Self, CaptureError> {
        let dc = CreateCompatibleDC(source);
        if dc.0.is_null() {
            return Err(last_os_error("CreateCompatibleDC"));
        }
        Ok(Self { dc })
    }
}

impl Drop for MemoryDcGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteDC(self.dc);
        }
    }
}

struct BitmapGuard {
    bitmap: HBITMAP,
}

impl BitmapGuard {
    unsafe fn new(source: HDC, width: i32, height: i32) -> Result<Self, CaptureError> {
        let bitmap = CreateCompatibleBitmap(source, width, height);
        if bitmap.0.is_null() {
            return Err(last_os_error("CreateCompatibleBitmap"));
        }
        Ok(Self { bitmap })
    }
}

impl Drop for BitmapGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteObject(HGDIOBJ(self.bitmap.0));
        }
    }
}

/// Keeps a bitmap selected into a DC; restores the previous object on drop.
struct SelectionGuard {
    dc: HDC,
    previous: HGDIOBJ,
}

impl SelectionGuard {
    unsafe fn new(dc: HDC, bitmap: HBITMAP) -> Result<Self, CaptureError> {
        let previous = SelectObject(dc, HGDIOBJ(bitmap.0));
        if previous.0.is_null() {
            return Err(last_os_error("SelectObject"));
        }
        Ok(Self { dc, previous })
    }
}

impl Drop for SelectionGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = SelectObject(self.dc, self.previous);
        }
    }
}

/// GDI capture backend bound to one window.
pub struct GdiWindowCapture {
    handle: WindowHandle,
}

impl GdiWindowCapture {
    /// Bind to `handle`. Fails when it no longer names a window.
    pub fn open(handle: WindowHandle) -> Result<Self, CaptureError> {
        if !unsafe { IsWindow(hwnd(handle)).as_bool() } {
            return Err(CaptureError::WindowNotFound);
        }
        Ok(Self { handle })
    }
}

impl CaptureBackend for GdiWindowCapture {
    fn handle(&self) -> WindowHandle {
        self.handle
    }

    fn client_size(&self) -> Result<(i32, i32), CaptureError> {
        let hwnd = hwnd(self.handle);
        unsafe {
            if !IsWindow(hwnd).as_bool() {
                return Err(CaptureError::WindowGone);
            }
            let mut rect = RECT::default();
            GetClientRect(hwnd, &mut rect).map_err(|_| CaptureError::WindowGone)?;
            debug!(
                "client rect (l, r, t, b): {}, {}, {}, {}",
                rect.left, rect.right, rect.top, rect.bottom
            );
            Ok((rect.right - rect.left, rect.bottom - rect.top))
        }
    }

    fn copy_region(&mut self, region: &CaptureRegion, dest: &mut [u8]) -> Result<u32, CaptureError> {
        if region.is_empty() {
            return Err(CaptureError::EmptyRegion {
                width: region.width,
                height: region.height,
            });
        }
        debug_assert_eq!(dest.len(), region.buffer_len());

        let hwnd = hwnd(self.handle);
        let (w, h) = (region.width, region.height);

        unsafe {
            let window_dc = WindowDcGuard::new(hwnd)?;
            let memory_dc = MemoryDcGuard::new(window_dc.dc)?;
            let _ = SetStretchBltMode(memory_dc.dc, COLORONCOLOR);

            let bitmap = BitmapGuard::new(window_dc.dc, w, h)?;
            {
                let _selected = SelectionGuard::new(memory_dc.dc, bitmap.bitmap)?;
                let blitted = StretchBlt(
                    memory_dc.dc,
                    0,
                    0,
                    w,
                    h,
                    window_dc.dc,
                    region.x,
                    region.y,
                    w,
                    h,
                    SRCCOPY,
                );
                debug!("StretchBlt: {}", blitted.as_bool());
                if !blitted.as_bool() {
                    return Err(last_os_error("StretchBlt"));
                }
            }

            // Negative height requests a top-down scan. A width that is a
            // multiple of 8 keeps each 24-bit row DWORD-aligned, so the rows
            // are packed with no padding.
            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: w,
                    biHeight: -h,
                    biPlanes: 1,
                    biBitCount: 24,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };

            let lines = GetDIBits(
                memory_dc.dc,
                bitmap.bitmap,
                0,
                h as u32,
                Some(dest.as_mut_ptr() as *mut c_void),
                &mut info,
                DIB_RGB_COLORS,
            );
            debug!("GetDIBits: {} of {} scanlines", lines, h);

            Ok(lines.max(0) as u32)
        }
    }
}

/// Factory function for creating a window capture backend on Windows
pub fn open_window_capture(handle: WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Ok(Box::new(GdiWindowCapture::open(handle)?))
}
