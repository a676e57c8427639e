// targeting.rs — Attack orchestration across the pipe and UI threads.
//
// The pipe thread validates a request and parks it in the one-slot
// PendingAttack mailbox; the UI thread (courier message) or a game thread
// (XTEA cave keepalive) consumes it, re-validates against live memory on
// its own thread, and drives the game's own attack pathway: the Game
// attack method for UI state (red square, battle list, Lua callbacks) and
// the protocol send-attack for the wire packet — in this fork the former
// does not emit the packet itself.
//
// Raw creature pointers are borrow-without-lifetime tokens: every hop
// re-validates via Safe-Read, and the actual game-code calls run inside
// the armed targeting fault context.

use crate::courier;
use crate::fault::{self, Region};
use crate::heapscan::HeapScanner;
use crate::hooks;
use crate::locator;
use crate::offsets::OFFSETS;
use crate::process;
use crate::saferead::{in_user_range, read_u32};
use crate::snapshot;
use crate::stability;
use crate::walker;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

type GameAttackFn = unsafe extern "thiscall" fn(*mut c_void, *mut usize);

/// Minimum gap between automatic re-issues after the game drops a target.
const RETRANSMIT_GAP_MS: u32 = 500;

// ── PendingAttack mailbox ───────────────────────────────────────────
// One slot; a second request before consumption overwrites the first.
// The pointer is advisory only — the consumer re-looks-up on its thread.

static PENDING: AtomicBool = AtomicBool::new(false);
static PENDING_ID: AtomicU32 = AtomicU32::new(0);
static PENDING_PTR: AtomicUsize = AtomicUsize::new(0);

/// Creature we last commanded the game to attack; 0 = none.
static LAST_ATTACKED: AtomicU32 = AtomicU32::new(0);
static LAST_RETRANSMIT_AT: AtomicU32 = AtomicU32::new(0);

pub fn last_attacked() -> u32 {
    LAST_ATTACKED.load(Ordering::Relaxed)
}

pub fn reset_session() {
    PENDING.store(false, Ordering::Release);
    PENDING_ID.store(0, Ordering::Relaxed);
    PENDING_PTR.store(0, Ordering::Relaxed);
    LAST_ATTACKED.store(0, Ordering::Relaxed);
}

// ── Pipe-thread entry ───────────────────────────────────────────────

/// Handle a `game_attack` command. Returns a status token for the
/// command response.
pub fn request_game_attack(creature_id: u32) -> &'static str {
    if !snapshot::id_in_window(creature_id) {
        return "rejected_id";
    }
    // The command has already stuck: don't spam the pathway.
    if creature_id == LAST_ATTACKED.load(Ordering::Relaxed) && game_attacking() != 0 {
        return "already_attacking";
    }
    let base = match lookup_creature(creature_id) {
        Some(b) => b,
        None => return "not_found",
    };
    if !validate_creature(base, creature_id) {
        return "invalid";
    }
    PENDING_PTR.store(base, Ordering::Relaxed);
    PENDING_ID.store(creature_id, Ordering::Relaxed);
    PENDING.store(true, Ordering::Release);

    if courier::installed() {
        courier::post_execute();
    } else if hooks::xtea_installed() {
        // No courier: the XTEA cave's mailbox resends the packet and its
        // keepalive tick consumes the pending slot for the visual side.
        hooks::set_xtea_mailbox(creature_id);
    }
    "ok"
}

/// Pipe-thread lookup order: live map (O(log n)), last published
/// snapshot, full heap sweep as a last resort.
fn lookup_creature(id: u32) -> Option<usize> {
    if let Some(map) = locator::map_addr() {
        if let Some(base) = walker::find_creature_ptr(map, id) {
            return Some(base);
        }
    }
    let id_off = OFFSETS.creature_id.load(Ordering::Relaxed) as usize;
    let cached = snapshot::with_published(|rows| {
        rows.iter().find(|r| r.id == id).map(|r| r.addr)
    });
    if let Some(id_addr) = cached {
        return Some(id_addr - id_off);
    }
    let mut scanner = HeapScanner::new();
    scanner.full_scan(0);
    scanner
        .rows()
        .iter()
        .find(|r| r.id == id)
        .map(|r| r.addr - id_off)
}

// ── Consumer entries ────────────────────────────────────────────────

/// Game-thread entry, invoked by the XTEA cave on every encrypt.
pub extern "C" fn on_game_tick() {
    execute_pending();
}

/// The only consumer of the mailbox. Runs on whichever thread the courier
/// or the XTEA cave lends us.
pub fn execute_pending() {
    // Fast path first: one atomic exchange when nothing is queued.
    if !PENDING.swap(false, Ordering::AcqRel) {
        return;
    }
    let id = PENDING_ID.load(Ordering::Relaxed);

    if !stability::targeting_allowed() {
        // Map is settling (fault or population jump); drop the request and
        // forget the target so the next request re-issues cleanly.
        LAST_ATTACKED.store(0, Ordering::Relaxed);
        return;
    }

    // Re-look-up on this thread: the pipe thread's pointer may be stale.
    let base = match locator::map_addr().and_then(|m| walker::find_creature_ptr(m, id)) {
        Some(fresh) => fresh,
        None => {
            let advisory = PENDING_PTR.load(Ordering::Relaxed);
            if advisory == 0 {
                return;
            }
            advisory
        }
    };

    match fault::with_recovery(Region::Targeting, || unsafe { attack_creature(base, id) }) {
        Some(true) => {
            LAST_ATTACKED.store(id, Ordering::Relaxed);
        }
        Some(false) => {} // validated away or already stuck; keep state
        None => {
            // Faulted inside the game's attack path; handler resumed us.
            LAST_ATTACKED.store(0, Ordering::Relaxed);
        }
    }
}

/// Steps 4–7: validation and both game calls, armed context only.
unsafe fn attack_creature(base: usize, id: u32) -> bool {
    if !validate_creature(base, id) {
        return false;
    }
    // Idempotence: the previous command is still in force.
    if id == LAST_ATTACKED.load(Ordering::Relaxed) && game_attacking() != 0 {
        return false;
    }
    let game = game_addr();
    if game == 0 {
        return false;
    }

    // Game::attack(Creature**) — updates UI state and fires Lua callbacks.
    let attack: GameAttackFn = std::mem::transmute(process::from_rva(
        OFFSETS.game_attack_rva.load(Ordering::Relaxed),
    ));
    let mut creature_word: usize = base;
    attack(game as *mut c_void, &mut creature_word);

    // ProtocolGame::sendAttack(id, seq) — the wire packet. The sequence
    // counter lives on the game singleton; bump it with a locked add.
    let proto = protocol_addr(game);
    if proto != 0 {
        let seq_addr = game + OFFSETS.seq_counter.load(Ordering::Relaxed) as usize;
        let seq = (*(seq_addr as *const AtomicU32)).fetch_add(1, Ordering::Relaxed);
        hooks::call_send_attack(proto, id, seq);
    }
    true
}

/// Re-issue the last target if the game cleared its attacking field
/// (floor change, target momentarily lost). Called from the scan loop.
pub fn retransmit_check() {
    let last = LAST_ATTACKED.load(Ordering::Relaxed);
    if last == 0 || PENDING.load(Ordering::Acquire) {
        return;
    }
    if !stability::targeting_allowed() || game_attacking() != 0 {
        return;
    }
    let now = stability::now_ms();
    let prev = LAST_RETRANSMIT_AT.load(Ordering::Relaxed);
    if prev != 0 && now.wrapping_sub(prev) < RETRANSMIT_GAP_MS {
        return;
    }
    LAST_RETRANSMIT_AT.store(now.max(1), Ordering::Relaxed);
    if request_game_attack(last) != "ok" {
        // Target is gone; stop chasing it.
        LAST_ATTACKED.store(0, Ordering::Relaxed);
    }
}

// ── Shared validation / game-object helpers ─────────────────────────

fn validate_creature(base: usize, id: u32) -> bool {
    let vtable = match read_u32(base) {
        Some(v) => v as usize,
        None => return false,
    };
    if !OFFSETS.vtable_in_window(vtable) {
        return false;
    }
    let id_addr = base + OFFSETS.creature_id.load(Ordering::Relaxed) as usize;
    if read_u32(id_addr) != Some(id) {
        return false;
    }
    let hp = read_u32(base + OFFSETS.creature_hp.load(Ordering::Relaxed) as usize);
    matches!(hp, Some(h) if h >= 1 && h <= 100)
}

/// Game singleton: the pointer captured by the attack cave when we have
/// one, the compiled-in RVA otherwise.
pub fn game_addr() -> usize {
    let captured = hooks::game_ptr();
    if captured != 0 {
        return captured;
    }
    OFFSETS.game_singleton_addr()
}

/// The game's attacking-creature field; 0 when it has no target (or the
/// singleton is unreadable).
pub fn game_attacking() -> u32 {
    let game = game_addr();
    if game == 0 {
        return 0;
    }
    read_u32(game + OFFSETS.attacking_creature.load(Ordering::Relaxed) as usize).unwrap_or(0)
}

fn protocol_addr(game: usize) -> usize {
    let captured = hooks::protocol_ptr();
    if captured != 0 {
        return captured;
    }
    read_u32(game + OFFSETS.protocol_game.load(Ordering::Relaxed) as usize)
        .map(|p| p as usize)
        .filter(|p| in_user_range(*p))
        .unwrap_or(0)
}
