// pipe.rs — The named-pipe command/event channel and the scanner loop.
//
// One duplex byte-mode pipe, one connection at a time. The server thread
// doubles as the scanner: between non-blocking command reads it walks the
// creature map (or runs the heap-scan fallback), publishes the snapshot,
// streams it as one JSON object per line at ~60 Hz, and drains the XTEA
// capture ring into its log.
//
// On disconnect, per-session state (player id, scan caches, counters) is
// reset and the listener accepts a new connection; the discovered map
// address survives for the life of the process.

use crate::fault::{self, Region};
use crate::heapscan::HeapScanner;
use crate::hooks;
use crate::locator;
use crate::logger;
use crate::offsets::{self, OFFSETS};
use crate::snapshot::{self, Row, MAX_CREATURES};
use crate::stability;
use crate::targeting;
use crate::courier;
use crate::diag;
use crate::walker;
use serde_json::{json, Value};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use winapi::shared::winerror::{ERROR_NO_DATA, ERROR_PIPE_CONNECTED};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{ReadFile, WriteFile};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::namedpipeapi::{ConnectNamedPipe, DisconnectNamedPipe, SetNamedPipeHandleState};
use winapi::um::sysinfoapi::GetTickCount;
use winapi::um::winbase::{
    CreateNamedPipeA, PIPE_ACCESS_DUPLEX, PIPE_NOWAIT, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
    PIPE_WAIT,
};
use winapi::um::winnt::HANDLE;

const PIPE_PATH: &[u8] = b"\\\\.\\pipe\\otcbot\0";
const PIPE_BUF_SIZE: u32 = 65536;
const LINE_MAX: usize = 8192;

/// Scan/send cadence. Tree-walk mode targets one frame (~60 Hz); the
/// fallback mode re-reads cheaply at 200 ms and sweeps the heap at 5 s.
const WALK_INTERVAL_MS: u32 = 16;
const SEND_INTERVAL_MS: u32 = 16;
const FAST_SCAN_INTERVAL_MS: u32 = 200;
const FULL_SCAN_INTERVAL_MS: u32 = 5000;
const RING_DRAIN_INTERVAL_MS: u32 = 500;
const LOOP_SLEEP_MS: u64 = 4;

/// Tree-walk mode toggle; survives reconnects alongside the map address
/// so a returning consumer resumes without a second `scan_gmap`.
static MAP_SCAN_ENABLED: AtomicBool = AtomicBool::new(false);

struct Session {
    player_id: u32,
    heap: HeapScanner,
    staging: Vec<Row>,
    ring_buf: Vec<(u32, u32)>,
    last_walk: u32,
    last_fast: u32,
    last_full: u32,
    last_send: u32,
    last_drain: u32,
    stopping: bool,
}

impl Session {
    fn new() -> Session {
        Session {
            player_id: 0,
            heap: HeapScanner::new(),
            staging: Vec::with_capacity(MAX_CREATURES),
            ring_buf: Vec::with_capacity(256),
            last_walk: 0,
            last_fast: 0,
            last_full: 0,
            last_send: 0,
            last_drain: 0,
            stopping: false,
        }
    }
}

/// Listener loop: create pipe, wait for the single consumer, serve the
/// session, reset, repeat. Runs until the DLL detaches.
pub fn serve(running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        let pipe = unsafe {
            CreateNamedPipeA(
                PIPE_PATH.as_ptr() as _,
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUF_SIZE,
                PIPE_BUF_SIZE,
                0,
                ptr::null_mut(),
            )
        };
        if pipe == INVALID_HANDLE_VALUE {
            log::error!("CreateNamedPipe failed: {}", unsafe { GetLastError() });
            std::thread::sleep(Duration::from_secs(1));
            continue;
        }

        log::info!("waiting for pipe client");
        let connected = unsafe {
            ConnectNamedPipe(pipe, ptr::null_mut()) != 0
                || GetLastError() == ERROR_PIPE_CONNECTED
        };
        if !connected {
            log::warn!("ConnectNamedPipe failed: {}", unsafe { GetLastError() });
            unsafe { CloseHandle(pipe) };
            continue;
        }
        log::info!("client connected");

        // Reads must not stall the scan loop.
        unsafe {
            let mut mode = PIPE_READMODE_BYTE | PIPE_NOWAIT;
            SetNamedPipeHandleState(pipe, &mut mode, ptr::null_mut(), ptr::null_mut());
        }

        run_session(pipe, running);

        unsafe {
            DisconnectNamedPipe(pipe);
            CloseHandle(pipe);
        }
        // Per-session reset; the located map address is retained.
        snapshot::reset_session();
        stability::reset_session();
        targeting::reset_session();
        log::info!("session ended");
    }
}

fn run_session(pipe: HANDLE, running: &AtomicBool) {
    let mut session = Session::new();
    let mut read_buf = [0u8; 4096];
    let mut line = Vec::with_capacity(LINE_MAX);

    while running.load(Ordering::Acquire) && !session.stopping {
        // ── inbound commands ───────────────────────────────────────
        let mut nread: u32 = 0;
        let ok = unsafe {
            ReadFile(
                pipe,
                read_buf.as_mut_ptr() as _,
                read_buf.len() as u32,
                &mut nread,
                ptr::null_mut(),
            )
        };
        if ok != 0 && nread > 0 {
            for &byte in &read_buf[..nread as usize] {
                if byte == b'\n' {
                    handle_line(&line, &mut session, pipe);
                    line.clear();
                } else if line.len() < LINE_MAX {
                    line.push(byte);
                }
            }
        } else if ok == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_NO_DATA {
                log::info!("pipe read failed ({err}), client gone");
                return;
            }
        }

        // ── scan + publish ─────────────────────────────────────────
        let now = unsafe { GetTickCount() };
        scan_tick(&mut session, now);

        // ── outbound stream ────────────────────────────────────────
        if now.wrapping_sub(session.last_send) >= SEND_INTERVAL_MS {
            session.last_send = now;
            if !write_line(pipe, &snapshot::frame_json()) {
                log::info!("pipe write failed, client gone");
                return;
            }
            targeting::retransmit_check();
        }

        if now.wrapping_sub(session.last_drain) >= RING_DRAIN_INTERVAL_MS {
            session.last_drain = now;
            session.ring_buf.clear();
            hooks::drain_ring(&mut session.ring_buf);
            logger::xtea_callers(&session.ring_buf);
        }

        std::thread::sleep(Duration::from_millis(LOOP_SLEEP_MS));
    }
}

/// One cadence step of whichever scan mode is active.
fn scan_tick(session: &mut Session, now: u32) {
    let map_addr = if MAP_SCAN_ENABLED.load(Ordering::Relaxed) {
        locator::map_addr()
    } else {
        None
    };

    if let Some(map) = map_addr {
        if now.wrapping_sub(session.last_walk) < WALK_INTERVAL_MS {
            return;
        }
        session.last_walk = now;
        let player_id = session.player_id;
        let staging = &mut session.staging;
        let walked = fault::with_recovery(Region::Scanner, || {
            walker::walk_into(map, player_id, staging)
        });
        match walked {
            Some(true) => snapshot::publish(&session.staging),
            Some(false) => {} // header failed validation; skip this cycle
            None => {
                // Fault mid-walk, already recorded. Repeated faults mean
                // the tree is gone (relog, client rebuild): drop back to
                // heap scanning until an explicit scan_gmap.
                if stability::take_revert_signal() {
                    log::warn!("tree walk faulting repeatedly; reverting to heap-scan mode");
                    locator::clear_map_addr();
                }
            }
        }
    } else {
        if now.wrapping_sub(session.last_full) >= FULL_SCAN_INTERVAL_MS {
            session.last_full = now;
            session.last_fast = now;
            session.heap.full_scan(session.player_id);
            snapshot::publish(session.heap.rows());
        } else if now.wrapping_sub(session.last_fast) >= FAST_SCAN_INTERVAL_MS {
            session.last_fast = now;
            session.heap.fast_rescan(session.player_id);
            snapshot::publish(session.heap.rows());
        }
    }
}

fn handle_line(line: &[u8], session: &mut Session, pipe: HANDLE) {
    let text = match std::str::from_utf8(line) {
        Ok(t) => t.trim(),
        Err(_) => return,
    };
    if text.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return, // malformed JSON is ignored
    };
    let cmd = match value.get("cmd").and_then(Value::as_str) {
        Some(c) => c,
        None => return,
    };

    let response = match cmd {
        "init" => {
            session.player_id = value
                .get("player_id")
                .and_then(offsets::parse_u32)
                .unwrap_or(0);
            log::info!("init: player_id=0x{:08X}", session.player_id);
            Some(json!({"resp": "init", "ok": true, "player_id": session.player_id}))
        }
        "set_offsets" => {
            let updated = OFFSETS.apply(&value);
            log::info!("set_offsets: {updated} fields");
            Some(json!({"resp": "set_offsets", "ok": true, "updated": updated}))
        }
        "scan_gmap" => Some(match locator::locate() {
            Ok(addr) => json!({"resp": "scan_gmap", "ok": true, "addr": addr}),
            Err(e) => {
                log::warn!("scan_gmap: {e}");
                json!({"resp": "scan_gmap", "ok": false, "error": e.to_string()})
            }
        }),
        "use_map_scan" => {
            let enabled = value
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            MAP_SCAN_ENABLED.store(enabled, Ordering::Relaxed);
            log::info!("use_map_scan: {enabled}");
            Some(json!({"resp": "use_map_scan", "ok": true, "enabled": enabled}))
        }
        "hook_wndproc" => Some(match courier::install() {
            Ok(hwnd) => json!({"resp": "hook_wndproc", "ok": true, "hwnd": hwnd}),
            Err(e) => {
                log::warn!("hook_wndproc: {e}");
                json!({"resp": "hook_wndproc", "ok": false, "error": e})
            }
        }),
        "hook_attack" => Some(match hooks::install_attack_hook() {
            Ok(()) => json!({"resp": "hook_attack", "ok": true}),
            Err(e) => {
                log::warn!("hook_attack: {e}");
                json!({"resp": "hook_attack", "ok": false, "error": e.to_string()})
            }
        }),
        "hook_xtea" => Some(match hooks::install_xtea_hook() {
            Ok(()) => json!({"resp": "hook_xtea", "ok": true}),
            Err(e) => {
                log::warn!("hook_xtea: {e}");
                json!({"resp": "hook_xtea", "ok": false, "error": e.to_string()})
            }
        }),
        "unhook_xtea" => {
            hooks::disarm_xtea();
            Some(json!({"resp": "unhook_xtea", "ok": true}))
        }
        "reset_xtea" => {
            hooks::reset_ring();
            Some(json!({"resp": "reset_xtea", "ok": true}))
        }
        "game_attack" => {
            let id = value
                .get("creature_id")
                .and_then(offsets::parse_u32)
                .unwrap_or(0);
            let status = targeting::request_game_attack(id);
            log::debug!("game_attack 0x{id:08X}: {status}");
            Some(json!({"resp": "game_attack", "ok": status == "ok", "status": status}))
        }
        "stop" => {
            session.stopping = true;
            Some(json!({"resp": "stop", "ok": true}))
        }
        other => diag::handle(other, &value), // unknown commands are ignored
    };

    if let Some(resp) = response {
        if let Ok(text) = serde_json::to_string(&resp) {
            let _ = write_line(pipe, &text);
        }
    }
}

/// Write one newline-terminated JSON object. Best-effort, no queueing; a
/// failure tears the session down at the caller.
fn write_line(pipe: HANDLE, text: &str) -> bool {
    let mut written: u32 = 0;
    let payload = text.as_bytes();
    unsafe {
        if WriteFile(
            pipe,
            payload.as_ptr() as _,
            payload.len() as u32,
            &mut written,
            ptr::null_mut(),
        ) == 0
        {
            return false;
        }
        WriteFile(pipe, b"\n".as_ptr() as _, 1, &mut written, ptr::null_mut()) != 0
    }
}
