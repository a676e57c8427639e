// courier.rs — Borrowing the game's UI thread.
//
// The game owns the message loop of its top-level window. Subclassing that
// window's procedure gives us a way to run the targeting orchestrator on
// the UI thread within one frame of a request (~16 ms), instead of waiting
// for the XTEA hook's next firing. Attack requests from the pipe thread
// post a private message; everything else is forwarded to the original
// procedure untouched.
//
// The subclass is never removed — see the concurrency notes in lib.rs.

use crate::targeting;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use winapi::shared::minwindef::{BOOL, FALSE, LPARAM, LRESULT, TRUE, UINT, WPARAM};
use winapi::shared::windef::HWND;
use winapi::um::processthreadsapi::{GetCurrentProcessId, GetCurrentThreadId};
use winapi::um::winuser::{
    CallWindowProcA, EnumWindows, GetWindowTextLengthA, GetWindowThreadProcessId,
    IsWindowVisible, PostMessageA, SetWindowLongA, GWL_WNDPROC, WM_APP, WNDPROC,
};

/// Private message id dispatched to the replacement procedure.
pub const WM_COURIER_EXEC: UINT = WM_APP + 0x5C4;

static ORIGINAL_WNDPROC: AtomicUsize = AtomicUsize::new(0);
static HOOKED_HWND: AtomicUsize = AtomicUsize::new(0);
static UI_THREAD_ID: AtomicU32 = AtomicU32::new(0);

pub fn installed() -> bool {
    HOOKED_HWND.load(Ordering::Acquire) != 0
}

/// Thread id observed handling our message; 0 until the first delivery.
pub fn ui_thread_id() -> u32 {
    UI_THREAD_ID.load(Ordering::Relaxed)
}

/// Find the host's top-level window and swap in our procedure. Idempotent.
pub fn install() -> Result<usize, &'static str> {
    let hooked = HOOKED_HWND.load(Ordering::Acquire);
    if hooked != 0 {
        return Ok(hooked);
    }
    let mut found: usize = 0;
    unsafe {
        EnumWindows(Some(enum_proc), &mut found as *mut usize as LPARAM);
    }
    if found == 0 {
        return Err("no visible titled window owned by this process");
    }
    let old = unsafe { SetWindowLongA(found as HWND, GWL_WNDPROC, courier_proc as usize as i32) };
    if old == 0 {
        return Err("SetWindowLong failed");
    }
    ORIGINAL_WNDPROC.store(old as usize, Ordering::Release);
    HOOKED_HWND.store(found, Ordering::Release);
    log::info!("wndproc subclass installed on hwnd=0x{:08X}", found);
    Ok(found)
}

/// First visible window with a non-empty title that belongs to us.
unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let mut pid: u32 = 0;
    GetWindowThreadProcessId(hwnd, &mut pid);
    if pid != GetCurrentProcessId() {
        return TRUE;
    }
    if IsWindowVisible(hwnd) == 0 || GetWindowTextLengthA(hwnd) == 0 {
        return TRUE;
    }
    *(lparam as *mut usize) = hwnd as usize;
    FALSE // stop enumeration
}

unsafe extern "system" fn courier_proc(
    hwnd: HWND,
    msg: UINT,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_COURIER_EXEC {
        UI_THREAD_ID.store(GetCurrentThreadId(), Ordering::Relaxed);
        targeting::execute_pending();
        return 0;
    }
    let original: WNDPROC = std::mem::transmute(ORIGINAL_WNDPROC.load(Ordering::Acquire));
    CallWindowProcA(original, hwnd, msg, wparam, lparam)
}

/// Ask the UI thread to run the orchestrator. Returns false when the
/// subclass is not installed or the post fails.
pub fn post_execute() -> bool {
    let hwnd = HOOKED_HWND.load(Ordering::Acquire);
    if hwnd == 0 {
        return false;
    }
    unsafe { PostMessageA(hwnd as HWND, WM_COURIER_EXEC, 0, 0) != 0 }
}
