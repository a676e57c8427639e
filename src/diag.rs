// diag.rs — Introspection commands served over the pipe.
//
// Operator-facing probes of host memory and core state. Everything reads
// through Safe-Read; the single write primitive (`write_mem`) is the only
// pipe-gated mutation of host memory besides hook installation.

use crate::hooks;
use crate::locator;
use crate::offsets::{self, OFFSETS};
use crate::process;
use crate::saferead::{self, read_u32};
use crate::targeting;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::ptr;
use std::sync::atomic::Ordering;
use winapi::um::memoryapi::VirtualProtect;
use winapi::um::winnt::PAGE_EXECUTE_READWRITE;

const DUMP_MEM_MAX: usize = 4096;
const DUMP_CODE_MAX: usize = 1024;
const XREFS_MAX: usize = 64;
const XTEA_SITES_MAX: usize = 16;

/// XTEA's delta constant; any real implementation of the cipher
/// references it from its round loop.
const XTEA_DELTA: u32 = 0x9E37_79B9;

/// Dispatch one diagnostic command. Returns None for commands this module
/// does not own.
pub fn handle(cmd: &str, v: &Value) -> Option<Value> {
    match cmd {
        "dump_mem" => Some(dump_mem(v)),
        "read_mem" => Some(read_mem(v)),
        "write_mem" => Some(write_mem(v)),
        "deref" => Some(deref(v)),
        "find_xrefs" => Some(find_xrefs(v)),
        "dump_code" => Some(dump_code(v)),
        "query_attack" => Some(query_attack()),
        "query_game" => Some(query_game()),
        "scan_game_attack" => Some(scan_game_attack()),
        "scan_xtea" => Some(scan_xtea()),
        _ => None,
    }
}

fn arg_u32(v: &Value, key: &str) -> Option<u32> {
    v.get(key).and_then(offsets::parse_u32)
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02X}", b);
    }
    s
}

fn dump_mem(v: &Value) -> Value {
    let addr = match arg_u32(v, "addr") {
        Some(a) => a as usize,
        None => return json!({"resp": "dump_mem", "ok": false, "error": "missing addr"}),
    };
    let len = (arg_u32(v, "len").unwrap_or(64) as usize).min(DUMP_MEM_MAX);
    let mut buf = vec![0u8; len];
    if saferead::read_bytes(addr, &mut buf) {
        json!({"resp": "dump_mem", "ok": true, "addr": addr, "bytes": hex_string(&buf)})
    } else {
        json!({"resp": "dump_mem", "ok": false, "addr": addr, "error": "unreadable"})
    }
}

fn read_mem(v: &Value) -> Value {
    let addr = match arg_u32(v, "addr") {
        Some(a) => a as usize,
        None => return json!({"resp": "read_mem", "ok": false, "error": "missing addr"}),
    };
    match read_u32(addr) {
        Some(word) => json!({"resp": "read_mem", "ok": true, "addr": addr, "value": word}),
        None => json!({"resp": "read_mem", "ok": false, "addr": addr, "error": "unreadable"}),
    }
}

/// The one write lever. Transient protection change, single word.
fn write_mem(v: &Value) -> Value {
    let addr = match arg_u32(v, "addr") {
        Some(a) => a as usize,
        None => return json!({"resp": "write_mem", "ok": false, "error": "missing addr"}),
    };
    let value = match arg_u32(v, "value") {
        Some(w) => w,
        None => return json!({"resp": "write_mem", "ok": false, "error": "missing value"}),
    };
    if !saferead::in_user_range(addr) || read_u32(addr).is_none() {
        return json!({"resp": "write_mem", "ok": false, "addr": addr, "error": "unreadable"});
    }
    let ok = unsafe {
        let mut old: u32 = 0;
        if VirtualProtect(addr as *mut _, 4, PAGE_EXECUTE_READWRITE, &mut old) == 0 {
            false
        } else {
            ptr::write_unaligned(addr as *mut u32, value);
            VirtualProtect(addr as *mut _, 4, old, &mut old);
            true
        }
    };
    json!({"resp": "write_mem", "ok": ok, "addr": addr})
}

/// Follow a pointer chain `times` hops from `addr`.
fn deref(v: &Value) -> Value {
    let addr = match arg_u32(v, "addr") {
        Some(a) => a as usize,
        None => return json!({"resp": "deref", "ok": false, "error": "missing addr"}),
    };
    let times = arg_u32(v, "times").unwrap_or(1).min(8);
    let mut chain = Vec::new();
    let mut cur = addr;
    for _ in 0..times {
        match read_u32(cur) {
            Some(next) => {
                chain.push(next);
                cur = next as usize;
            }
            None => break,
        }
    }
    json!({"resp": "deref", "ok": !chain.is_empty(), "addr": addr, "chain": chain})
}

/// Absolute imm32 references to `addr` anywhere in the host code section.
fn find_xrefs(v: &Value) -> Value {
    let needle = match arg_u32(v, "addr") {
        Some(a) => a,
        None => return json!({"resp": "find_xrefs", "ok": false, "error": "missing addr"}),
    };
    let rvas = scan_code_for_imm(needle, XREFS_MAX);
    json!({"resp": "find_xrefs", "ok": true, "addr": needle, "rvas": rvas})
}

fn dump_code(v: &Value) -> Value {
    let rva = match arg_u32(v, "rva") {
        Some(r) => r,
        None => return json!({"resp": "dump_code", "ok": false, "error": "missing rva"}),
    };
    let len = (arg_u32(v, "len").unwrap_or(64) as usize).min(DUMP_CODE_MAX);
    let addr = process::from_rva(rva);
    let mut buf = vec![0u8; len];
    if saferead::read_bytes(addr, &mut buf) {
        json!({"resp": "dump_code", "ok": true, "rva": rva, "bytes": hex_string(&buf)})
    } else {
        json!({"resp": "dump_code", "ok": false, "rva": rva, "error": "unreadable"})
    }
}

fn query_attack() -> Value {
    let (last_id, caller_rva) = hooks::last_attack_seen();
    json!({
        "resp": "query_attack",
        "protocol_ptr": hooks::protocol_ptr(),
        "last_creature_id": last_id,
        "caller_rva": caller_rva,
        "trampoline": hooks::attack_trampoline().unwrap_or(0),
        "xtea_installed": hooks::xtea_installed(),
        "xtea_send_done": hooks::xtea_mailbox_done(),
    })
}

fn query_game() -> Value {
    let game = targeting::game_addr();
    let seq = read_u32(game + OFFSETS.seq_counter.load(Ordering::Relaxed) as usize);
    json!({
        "resp": "query_game",
        "game_addr": game,
        "captured_game": hooks::game_ptr(),
        "attacking_creature": targeting::game_attacking(),
        "seq_counter": seq,
        "last_attacked": targeting::last_attacked(),
        "map_addr": locator::map_addr().unwrap_or(0),
        "ui_thread": crate::courier::ui_thread_id(),
    })
}

/// Re-run the prologue operand harvest on the attack function and report
/// what it references — the raw material `scan_gmap` works from.
fn scan_game_attack() -> Value {
    let attack = process::from_rva(OFFSETS.game_attack_rva.load(Ordering::Relaxed));
    let mut prologue = [0u8; 256];
    if !saferead::read_bytes(attack, &mut prologue) {
        return json!({"resp": "scan_game_attack", "ok": false, "error": "prologue unreadable"});
    }
    let candidates = locator::extract_absolute_operands(&prologue);
    let validated: Vec<u32> = candidates
        .iter()
        .copied()
        .filter(|&c| {
            locator::is_creature_map(c as usize)
                || read_u32(c as usize)
                    .map(|inner| locator::is_creature_map(inner as usize))
                    .unwrap_or(false)
        })
        .collect();
    json!({
        "resp": "scan_game_attack",
        "ok": true,
        "candidates": candidates,
        "validated": validated,
    })
}

/// Signature-scan the code section for the XTEA delta constant: candidate
/// sites for a shifted `xtea_encrypt_rva` after a client rebuild.
fn scan_xtea() -> Value {
    let rvas = scan_code_for_imm(XTEA_DELTA, XTEA_SITES_MAX);
    json!({"resp": "scan_xtea", "ok": !rvas.is_empty(), "rvas": rvas})
}

/// Page-buffered sweep of the code section for a little-endian imm32.
fn scan_code_for_imm(needle: u32, cap: usize) -> Vec<u32> {
    let mut rvas = Vec::new();
    let (start, end) = match process::code_section() {
        Some(bounds) => bounds,
        None => return rvas,
    };
    let pattern = needle.to_le_bytes();
    const PAGE: usize = 4096;
    // Overlap pages by 3 bytes so a straddling match is not missed.
    let mut buf = [0u8; PAGE + 3];
    let mut page = start;
    while page < end && rvas.len() < cap {
        let span = (end - page).min(PAGE + 3);
        if saferead::read_bytes(page, &mut buf[..span]) {
            for i in 0..span.saturating_sub(3) {
                if buf[i..i + 4] == pattern {
                    rvas.push(process::to_rva(page + i));
                    if rvas.len() >= cap {
                        break;
                    }
                }
            }
        }
        page += PAGE;
    }
    rvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_commands_are_not_ours() {
        assert!(handle("fly_to_moon", &json!({})).is_none());
    }

    #[test]
    fn dump_mem_reads_own_memory() {
        let data: [u8; 8] = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let resp = handle(
            "dump_mem",
            &json!({"addr": data.as_ptr() as usize, "len": 8}),
        )
        .unwrap();
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["bytes"], "DEADBEEF01020304");
    }

    #[test]
    fn read_mem_reports_unreadable() {
        let resp = handle("read_mem", &json!({"addr": 0x40})).unwrap();
        assert_eq!(resp["ok"], false);
    }

    #[test]
    fn deref_follows_chain() {
        let target: u32 = 0x1234_5678;
        let mid: u32 = &target as *const u32 as u32;
        let resp = handle(
            "deref",
            &json!({"addr": &mid as *const u32 as usize, "times": 2}),
        )
        .unwrap();
        let chain = resp["chain"].as_array().unwrap();
        assert_eq!(chain[0].as_u64().unwrap(), mid as u64);
        assert_eq!(chain[1].as_u64().unwrap(), 0x1234_5678);
    }

    #[test]
    fn hex_addrs_accepted() {
        let data: u32 = 0xAABB_CCDD;
        let addr_hex = format!("0x{:X}", &data as *const u32 as usize);
        let resp = handle("read_mem", &json!({"addr": addr_hex})).unwrap();
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["value"].as_u64().unwrap(), 0xAABB_CCDD);
    }
}
