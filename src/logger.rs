// logger.rs — The three append-only log files next to the DLL.
//
//   otcbot_debug.log — main debug log, via the `log` facade (WriteLogger)
//   otcbot_crash.log — register dumps written by the exception handler
//   otcbot_xtea.log  — caller RVAs drained from the XTEA capture ring
//
// None of these are part of the pipe contract; they exist for offline
// post-mortem.

use once_cell::sync::OnceCell;
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use winapi::um::libloaderapi::GetModuleFileNameA;

/// Directory the DLL was loaded from.
static INSTALL_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Resolve and remember the DLL's own directory (called from DllMain).
pub fn set_install_dir(hinst: usize) {
    let mut buf = [0u8; 512];
    let len = unsafe {
        GetModuleFileNameA(hinst as _, buf.as_mut_ptr() as _, buf.len() as u32)
    } as usize;
    let dir = std::str::from_utf8(&buf[..len])
        .ok()
        .and_then(|s| Path::new(s).parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = INSTALL_DIR.set(dir);
}

pub fn install_dir() -> PathBuf {
    INSTALL_DIR.get().cloned().unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize the `log` facade into otcbot_debug.log. Called once from the
/// worker thread; a second call (or an unwritable directory) is a no-op and
/// the macros simply discard.
pub fn init() {
    let path = install_dir().join("otcbot_debug.log");
    if let Ok(file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = WriteLogger::init(LevelFilter::Debug, Config::default(), file);
    }
}

fn append_line(file_name: &str, line: &str) {
    let path = install_dir().join(file_name);
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Append one line to the crash log. Used only by the exception handler on
/// the pass-through path (the process is about to die anyway) — never on
/// the resume path.
pub fn crash_line(line: &str) {
    append_line("otcbot_crash.log", line);
}

/// Append drained XTEA capture-ring entries: one `(caller, grand_caller)`
/// RVA pair per line.
pub fn xtea_callers(entries: &[(u32, u32)]) {
    if entries.is_empty() {
        return;
    }
    let path = install_dir().join("otcbot_xtea.log");
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        for (caller, grand) in entries {
            let _ = writeln!(f, "caller=0x{:08X} grand=0x{:08X}", caller, grand);
        }
    }
}
