//! Win32 window probe.

use std::time::Duration;

use winapi::shared::basetsd::DWORD_PTR;
use winapi::shared::minwindef::{BOOL, DWORD, LPARAM, TRUE, UINT};
use winapi::shared::windef::HWND;
use winapi::um::winuser::{
    EnumWindows, GetParent, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId,
    IsWindowVisible, SendMessageTimeoutW, SMTO_ABORTIFHUNG, WM_NULL,
};

use super::{WindowHandle, WindowProbe};

struct EnumState {
    pid: u32,
    found: Vec<WindowHandle>,
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: lparam is the &mut EnumState passed to EnumWindows below,
    // alive for the whole enumeration.
    let state = &mut *(lparam as *mut EnumState);
    let mut owner: DWORD = 0;
    GetWindowThreadProcessId(hwnd, &mut owner);
    if owner == state.pid && IsWindowVisible(hwnd) != 0 && GetParent(hwnd).is_null() {
        state.found.push(WindowHandle(hwnd as usize as u64));
    }
    TRUE
}

fn hwnd(window: WindowHandle) -> HWND {
    window.0 as usize as HWND
}

/// Probes windows with `SendMessageTimeoutW(WM_NULL, SMTO_ABORTIFHUNG)`.
#[derive(Debug, Default)]
pub struct Win32WindowProbe;

impl Win32WindowProbe {
    pub fn new() -> Self {
        Win32WindowProbe
    }
}

impl WindowProbe for Win32WindowProbe {
    fn enumerate_top_level_windows(&self, pid: u32) -> Vec<WindowHandle> {
        let mut state = EnumState {
            pid,
            found: Vec::new(),
        };
        unsafe {
            EnumWindows(Some(collect_window), &mut state as *mut EnumState as LPARAM);
        }
        state.found
    }

    fn probe_responsive(&self, window: WindowHandle, timeout: Duration) -> bool {
        let timeout_ms = UINT::try_from(timeout.as_millis()).unwrap_or(UINT::MAX);
        let mut result: DWORD_PTR = 0;
        let sent = unsafe {
            SendMessageTimeoutW(
                hwnd(window),
                WM_NULL,
                0,
                0,
                SMTO_ABORTIFHUNG,
                timeout_ms,
                &mut result,
            )
        };
        sent != 0
    }

    fn window_title(&self, window: WindowHandle) -> String {
        let hwnd = hwnd(window);
        let len = unsafe { GetWindowTextLengthW(hwnd) };
        if len <= 0 {
            return String::new();
        }
        let mut buf = vec![0u16; len as usize + 1];
        let copied = unsafe { GetWindowTextW(hwnd, buf.as_mut_ptr(), buf.len() as i32) };
        String::from_utf16_lossy(&buf[..copied.max(0) as usize])
    }
}
