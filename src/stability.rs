// stability.rs — Suppresses targeting while the creature map is unstable.
//
// During floor transitions the game tears down and rebuilds its creature
// set; an attack call racing that rebuild tends to fault inside game code.
// Three signals gate targeting: a recent scanner fault, a recent targeting
// fault, and a sudden population change. Timestamps are GetTickCount
// milliseconds; wrapping_sub keeps the arithmetic correct across the
// 49-day wrap.

use crate::fault::Region;
use std::sync::atomic::{AtomicU32, Ordering};
use winapi::um::sysinfoapi::GetTickCount;

/// Cooldown after a recovered fault (either thread).
const FAULT_COOLDOWN_MS: u32 = 2000;
/// Cooldown after a large population change.
const COUNT_COOLDOWN_MS: u32 = 1000;
/// Population delta considered "large".
const COUNT_DELTA: u32 = 5;

/// Scanner-fault streak that triggers auto-revert to heap-scan mode.
const REVERT_FAULTS: u32 = 3;
const REVERT_WINDOW_MS: u32 = 10_000;

static SCAN_FAULT_AT: AtomicU32 = AtomicU32::new(0);
static ATTACK_FAULT_AT: AtomicU32 = AtomicU32::new(0);
static COUNT_CHANGE_AT: AtomicU32 = AtomicU32::new(0);
static PREV_COUNT: AtomicU32 = AtomicU32::new(0);

static FAULT_STREAK: AtomicU32 = AtomicU32::new(0);
static STREAK_STARTED_AT: AtomicU32 = AtomicU32::new(0);

/// Total recovered faults, per region (crash-log counters).
pub static SCAN_FAULT_TOTAL: AtomicU32 = AtomicU32::new(0);
pub static ATTACK_FAULT_TOTAL: AtomicU32 = AtomicU32::new(0);

#[inline]
pub fn now_ms() -> u32 {
    unsafe { GetTickCount() }
}

/// Record a recovered fault. Called from the exception handler: atomics
/// and GetTickCount only, nothing that allocates or locks.
pub fn record_fault(region: Region) {
    let now = now_ms();
    match region {
        Region::Scanner => {
            SCAN_FAULT_AT.store(now.max(1), Ordering::Relaxed);
            SCAN_FAULT_TOTAL.fetch_add(1, Ordering::Relaxed);
            // Streak bookkeeping for auto-revert
            let started = STREAK_STARTED_AT.load(Ordering::Relaxed);
            if started == 0 || now.wrapping_sub(started) > REVERT_WINDOW_MS {
                STREAK_STARTED_AT.store(now.max(1), Ordering::Relaxed);
                FAULT_STREAK.store(1, Ordering::Relaxed);
            } else {
                FAULT_STREAK.fetch_add(1, Ordering::Relaxed);
            }
        }
        Region::Targeting => {
            ATTACK_FAULT_AT.store(now.max(1), Ordering::Relaxed);
            ATTACK_FAULT_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Feed the population of the latest scan cycle.
pub fn record_count(count: u32) {
    record_count_at(count, now_ms())
}

fn record_count_at(count: u32, now: u32) {
    let prev = PREV_COUNT.swap(count, Ordering::Relaxed);
    if prev > 0 && prev.abs_diff(count) >= COUNT_DELTA {
        COUNT_CHANGE_AT.store(now.max(1), Ordering::Relaxed);
    }
}

/// Whether targeting may proceed right now.
pub fn targeting_allowed() -> bool {
    targeting_allowed_at(now_ms())
}

fn targeting_allowed_at(now: u32) -> bool {
    !within(SCAN_FAULT_AT.load(Ordering::Relaxed), now, FAULT_COOLDOWN_MS)
        && !within(ATTACK_FAULT_AT.load(Ordering::Relaxed), now, FAULT_COOLDOWN_MS)
        && !within(COUNT_CHANGE_AT.load(Ordering::Relaxed), now, COUNT_COOLDOWN_MS)
}

fn within(stamp: u32, now: u32, cooldown: u32) -> bool {
    stamp != 0 && now.wrapping_sub(stamp) < cooldown
}

/// Whether the scanner-fault streak warrants dropping out of tree-walk
/// mode. Consuming the answer resets the streak.
pub fn take_revert_signal() -> bool {
    if FAULT_STREAK.load(Ordering::Relaxed) >= REVERT_FAULTS {
        FAULT_STREAK.store(0, Ordering::Relaxed);
        STREAK_STARTED_AT.store(0, Ordering::Relaxed);
        return true;
    }
    false
}

/// Per-session reset (new pipe connection). Fault timestamps are kept —
/// a fault just before a reconnect is still a reason to hold fire.
pub fn reset_session() {
    PREV_COUNT.store(0, Ordering::Relaxed);
}

/// Serializes tests that touch the process-global heuristic state.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
