// locator.rs — One-shot discovery of the creature map header.
//
// The map's address is not baked in: client rebuilds shift globals around.
// What stays put is the attack function's habit of referencing the map (or
// the game singleton holding it) through absolute-memory operands in its
// prologue. Strategy: harvest every absolute address the prologue
// references, try each as a map header directly and through one
// dereference, and only if that comes up dry fall back to a word-aligned
// sweep of the host's writable data sections.
//
// The discovered address lives for the life of the process (it survives
// pipe reconnects); only fault-driven auto-revert or a fresh `scan_gmap`
// replaces it.

use crate::offsets::OFFSETS;
use crate::process;
use crate::saferead::{self, in_user_range, read_u32};
use crate::walker;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Bytes of the attack-function prologue harvested for operands.
const PROLOGUE_WINDOW: usize = 256;
/// In-order keys that must validate on a candidate header.
const KEY_PROBES: usize = 3;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("attack function prologue is unreadable")]
    PrologueUnreadable,
    #[error("no candidate validated as a creature map")]
    NotFound,
}

/// Discovered map header address; 0 = not located.
static MAP_ADDR: AtomicUsize = AtomicUsize::new(0);

pub fn map_addr() -> Option<usize> {
    match MAP_ADDR.load(Ordering::Relaxed) {
        0 => None,
        addr => Some(addr),
    }
}

pub fn clear_map_addr() {
    MAP_ADDR.store(0, Ordering::Relaxed);
}

/// Run the discovery and record the result. Always re-runs, even when an
/// address is already held — the command is the operator's explicit
/// "rediscover" lever.
pub fn locate() -> Result<usize, LocateError> {
    let attack = process::from_rva(OFFSETS.game_attack_rva.load(Ordering::Relaxed));
    let mut prologue = [0u8; PROLOGUE_WINDOW];
    if !saferead::read_bytes(attack, &mut prologue) {
        return Err(LocateError::PrologueUnreadable);
    }

    let candidates = extract_absolute_operands(&prologue);
    log::debug!(
        "locator: {} absolute operands in attack prologue at 0x{:08X}",
        candidates.len(),
        attack
    );

    // Pass 1: each referenced address, as-is and once-dereferenced.
    for &cand in &candidates {
        let cand = cand as usize;
        if is_creature_map(cand) {
            return found(cand);
        }
        if let Some(inner) = read_u32(cand) {
            let inner = inner as usize;
            if in_user_range(inner) && is_creature_map(inner) {
                return found(inner);
            }
        }
    }

    // Pass 2: word-aligned sweep of the writable data sections.
    for (start, end) in process::writable_data_sections() {
        if let Some(addr) = scan_range_for_header(start, end) {
            return found(addr);
        }
    }

    Err(LocateError::NotFound)
}

fn found(addr: usize) -> Result<usize, LocateError> {
    MAP_ADDR.store(addr, Ordering::Relaxed);
    log::info!("locator: creature map header at 0x{:08X}", addr);
    Ok(addr)
}

/// Full candidate validation: structural header check plus the first few
/// in-order keys landing in the creature-id window.
pub fn is_creature_map(addr: usize) -> bool {
    walker::validate_header(addr).is_some() && walker::first_keys_in_window(addr, KEY_PROBES)
}

/// Sweep `[start, end)` word-aligned for a plausible (sentinel, count)
/// pair, fully validating each hit. Reads through page-sized copies so a
/// decommitted page costs one failed read, not a fault.
fn scan_range_for_header(start: usize, end: usize) -> Option<usize> {
    const PAGE: usize = 4096;
    let mut buf = [0u8; PAGE];
    let mut page = start & !(PAGE - 1);
    while page < end {
        let span = (end - page).min(PAGE);
        if saferead::read_bytes(page, &mut buf[..span]) {
            let words = span / 4;
            for i in 0..words.saturating_sub(1) {
                let addr = page + i * 4;
                if addr < start {
                    continue;
                }
                let sentinel = u32::from_le_bytes([
                    buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3],
                ]) as usize;
                let count = u32::from_le_bytes([
                    buf[i * 4 + 4], buf[i * 4 + 5], buf[i * 4 + 6], buf[i * 4 + 7],
                ]);
                if !in_user_range(sentinel) || count == 0 || count > walker::MAX_MAP_COUNT {
                    continue;
                }
                if is_creature_map(addr) {
                    return Some(addr);
                }
            }
        }
        page += PAGE;
    }
    None
}

/// Harvest 32-bit absolute addresses referenced by MOV/LEA/PUSH forms with
/// absolute-memory operands (plus pushed/stored address immediates) in a
/// code window. Sliding-window matching: a misparse just yields an operand
/// that fails validation later; deduplicated, filtered to the user range.
pub fn extract_absolute_operands(code: &[u8]) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::new();
    let mut push = |imm: u32| {
        if in_user_range(imm as usize) && !out.contains(&imm) {
            out.push(imm);
        }
    };
    let imm_at = |i: usize| {
        u32::from_le_bytes([code[i], code[i + 1], code[i + 2], code[i + 3]])
    };

    let mut i = 0;
    while i + 5 <= code.len() {
        match code[i] {
            // mov eax, [imm32] / mov [imm32], eax
            0xA1 | 0xA3 => push(imm_at(i + 1)),
            // push imm32 (address immediates)
            0x68 => push(imm_at(i + 1)),
            // mov r32,[imm32] / mov [imm32],r32 / lea r32,[imm32]
            0x8B | 0x89 | 0x8D if i + 6 <= code.len() && code[i + 1] & 0xC7 == 0x05 => {
                push(imm_at(i + 2));
            }
            // push dword [imm32]
            0xFF if i + 6 <= code.len() && code[i + 1] == 0x35 => push(imm_at(i + 2)),
            // mov dword [imm32], imm32
            0xC7 if i + 10 <= code.len() && code[i + 1] == 0x05 => push(imm_at(i + 2)),
            _ => {}
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mov_lea_push_operands() {
        // push ebp; mov ebp,esp; mov eax,[0xB2E970]; mov ecx,[0x4A0010];
        // push dword [0x4B0020]; push 0x4C0030; lea edx,[0x4D0040]; ret
        let mut code = vec![0x55, 0x8B, 0xEC];
        code.push(0xA1);
        code.extend_from_slice(&0x00B2_E970u32.to_le_bytes());
        code.extend_from_slice(&[0x8B, 0x0D]);
        code.extend_from_slice(&0x004A_0010u32.to_le_bytes());
        code.extend_from_slice(&[0xFF, 0x35]);
        code.extend_from_slice(&0x004B_0020u32.to_le_bytes());
        code.push(0x68);
        code.extend_from_slice(&0x004C_0030u32.to_le_bytes());
        code.extend_from_slice(&[0x8D, 0x15]);
        code.extend_from_slice(&0x004D_0040u32.to_le_bytes());
        code.push(0xC3);

        let ops = extract_absolute_operands(&code);
        for expected in [0x00B2_E970, 0x004A_0010, 0x004B_0020, 0x004C_0030, 0x004D_0040] {
            assert!(ops.contains(&expected), "missing 0x{expected:08X}");
        }
    }

    #[test]
    fn ignores_register_forms_and_dedups() {
        // mov eax, ecx (8B C1) has mod=11: no operand extracted
        let code = [0x8B, 0xC1, 0x90, 0x90, 0x90, 0x90];
        assert!(extract_absolute_operands(&code).is_empty());

        let mut code = Vec::new();
        for _ in 0..3 {
            code.push(0xA1);
            code.extend_from_slice(&0x0050_0000u32.to_le_bytes());
        }
        assert_eq!(extract_absolute_operands(&code), vec![0x0050_0000]);
    }

    #[test]
    fn filters_non_address_immediates() {
        // push 0x10 — far below the user range
        let mut code = vec![0x68];
        code.extend_from_slice(&0x10u32.to_le_bytes());
        code.push(0x90);
        assert!(extract_absolute_operands(&code).is_empty());
    }

    // ── candidate validation on a synthetic map ─────────────────────

    #[repr(C)]
    #[derive(Copy, Clone)]
    struct RawNode {
        left: u32,
        parent: u32,
        right: u32,
        color: u8,
        isnil: u8,
        pad: [u8; 2],
        key: u32,
        value: u32,
    }

    fn tiny_map(keys: [u32; 3]) -> (Vec<Box<RawNode>>, Box<[u32; 2]>) {
        let mut nodes: Vec<Box<RawNode>> = (0..4)
            .map(|_| Box::new(RawNode {
                left: 0, parent: 0, right: 0,
                color: 1, isnil: 0, pad: [0; 2],
                key: 0, value: 0x20_0000,
            }))
            .collect();
        let addr = |n: &RawNode| n as *const RawNode as u32;
        let (s, a, b, c) = (addr(&nodes[0]), addr(&nodes[1]), addr(&nodes[2]), addr(&nodes[3]));
        *nodes[0] = RawNode { left: a, parent: b, right: c, color: 1, isnil: 1, pad: [0; 2], key: 0, value: 0 };
        *nodes[1] = RawNode { left: s, parent: b, right: s, color: 0, isnil: 0, pad: [0; 2], key: keys[0], value: 0x20_0000 };
        *nodes[2] = RawNode { left: a, parent: s, right: c, color: 1, isnil: 0, pad: [0; 2], key: keys[1], value: 0x20_0000 };
        *nodes[3] = RawNode { left: s, parent: b, right: s, color: 0, isnil: 0, pad: [0; 2], key: keys[2], value: 0x20_0000 };
        let header = Box::new([s, 3u32]);
        (nodes, header)
    }

    #[test]
    fn validates_real_looking_map() {
        let (nodes, header) = tiny_map([0x4000_0001, 0x4000_0002, 0x4000_0003]);
        assert!(is_creature_map(header.as_ptr() as usize));
        drop(nodes);
    }

    #[test]
    fn rejects_map_with_foreign_keys() {
        // A std::map whose keys are small integers is not the creature map.
        let (nodes, header) = tiny_map([1, 2, 3]);
        assert!(!is_creature_map(header.as_ptr() as usize));
        drop(nodes);
    }

    #[test]
    fn section_sweep_finds_header_among_noise() {
        let (nodes, header) = tiny_map([0x4000_0001, 0x4000_0002, 0x4000_0003]);
        // Plant the header words inside a larger noisy buffer.
        let mut region = vec![0u32; 256];
        for (i, w) in region.iter_mut().enumerate() {
            *w = 0x1234 + i as u32; // below user range, never a candidate
        }
        region[77] = header[0];
        region[78] = header[1];
        let start = region.as_ptr() as usize;
        let end = start + region.len() * 4;
        let hit = scan_range_for_header(start, end);
        assert_eq!(hit, Some(start + 77 * 4));
        drop(nodes);
    }
}
