// heapscan.rs — Fallback creature scanner (no map address required).
//
// Before `scan_gmap` has found the creature map — or after tree-walk mode
// auto-reverts — creatures are found the brute-force way: a full
// VirtualQuery sweep over committed read-write regions looking for the
// id-field byte pattern (~5 s cadence), with a cheap re-read of the cached
// addresses in between (~200 ms cadence) to refresh health and position.

use crate::offsets::OFFSETS;
use crate::saferead::{read_bytes, read_u32, USER_MAX, USER_MIN};
use crate::snapshot::{self, Row, MAX_CREATURES, NAME_BUF};
use crate::walker;
use std::mem;
use std::sync::atomic::Ordering;
use winapi::um::memoryapi::VirtualQuery;
use winapi::um::winnt::{
    MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
};

const PAGE: usize = 4096;

pub struct HeapScanner {
    /// Creatures found by the last full sweep, re-read by fast_rescan.
    cached: Vec<Row>,
    pub full_scans: u32,
}

impl HeapScanner {
    pub fn new() -> HeapScanner {
        HeapScanner {
            cached: Vec::with_capacity(MAX_CREATURES),
            full_scans: 0,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.cached
    }

    /// Re-read every cached address; drop entries whose id no longer
    /// matches (the object was freed or reused).
    pub fn fast_rescan(&mut self, player_id: u32) {
        let hp_off = OFFSETS.hp_from_id() as i64;
        self.cached.retain_mut(|row| {
            let id = match read_u32(row.addr) {
                Some(v) => v,
                None => return false,
            };
            if id != row.id {
                return false;
            }
            let hp = match read_u32((row.addr as i64 + hp_off) as usize) {
                Some(v) => v,
                None => return false,
            };
            if hp == 0 || hp > 100 {
                return false;
            }
            row.hp = hp as u8;
            // Position refresh is best-effort; a failed read keeps the
            // last known coordinates.
            if let Some((x, y, z)) = walker::read_position(row.addr, row.id, player_id) {
                row.x = x;
                row.y = y;
                row.z = z;
            }
            true
        });
    }

    /// Full sweep: walk every committed RW region of the address space and
    /// pattern-match creature id fields. Replaces the address cache.
    pub fn full_scan(&mut self, player_id: u32) {
        self.full_scans += 1;
        let name_off = OFFSETS.name_from_id() as i64;
        let hp_off = OFFSETS.hp_from_id() as i64;

        let mut found: Vec<Row> = Vec::with_capacity(MAX_CREATURES);
        let mut page_buf = [0u8; PAGE];
        let mut addr = USER_MIN;

        while addr < USER_MAX && found.len() < MAX_CREATURES {
            let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
            let got = unsafe {
                VirtualQuery(addr as *const _, &mut mbi, mem::size_of::<MEMORY_BASIC_INFORMATION>())
            };
            if got == 0 {
                break;
            }
            let region_start = mbi.BaseAddress as usize;
            let region_end = region_start.saturating_add(mbi.RegionSize).min(USER_MAX);

            let scannable = mbi.State == MEM_COMMIT
                && (mbi.Protect == PAGE_READWRITE || mbi.Protect == PAGE_EXECUTE_READWRITE)
                && mbi.RegionSize >= 32;
            if scannable {
                let mut page = region_start;
                while page < region_end && found.len() < MAX_CREATURES {
                    let span = (region_end - page).min(PAGE);
                    if span >= 32 && read_bytes(page, &mut page_buf[..span]) {
                        scan_page(&page_buf[..span], page, name_off, hp_off, player_id, &mut found);
                    }
                    page += PAGE;
                }
            }
            addr = region_end.max(addr + PAGE);
        }

        self.cached = found;
        log::debug!(
            "full_scan#{}: {} creatures cached",
            self.full_scans,
            self.cached.len()
        );
    }
}

/// Scan one copied page for the creature id-field pattern.
fn scan_page(
    buf: &[u8],
    page_addr: usize,
    name_off: i64,
    hp_off: i64,
    player_id: u32,
    found: &mut Vec<Row>,
) {
    let words = buf.len() / 4;
    if words < 8 {
        return;
    }
    let at = |i: usize| {
        u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]])
    };

    // Leave room for the in-page string header peek below.
    for i in 0..words.saturating_sub(8) {
        if found.len() >= MAX_CREATURES {
            return;
        }
        let id = at(i);
        if !snapshot::id_in_window(id) {
            continue;
        }
        // Cheap in-page pre-checks on the default layout (string size/cap
        // at id+20/id+24, health at id+28) before paying for full reads.
        let str_size = at(i + 5);
        if str_size == 0 || str_size > 30 {
            continue;
        }
        let str_cap = at(i + 6);
        if str_cap < str_size || str_cap >= 256 {
            continue;
        }
        let hp = at(i + 7);
        if hp == 0 || hp > 100 {
            continue;
        }

        let id_addr = page_addr + i * 4;
        if found.iter().any(|r| r.id == id) {
            continue;
        }

        // Authoritative reads through the registry offsets.
        let hp = match read_u32((id_addr as i64 + hp_off) as usize) {
            Some(v) if v > 0 && v <= 100 => v,
            _ => continue,
        };
        let mut name = [0u8; NAME_BUF];
        let name_len = match walker::read_name((id_addr as i64 + name_off) as usize, &mut name) {
            Some(n) => n,
            None => continue,
        };
        let (x, y, z) = match walker::read_position(id_addr, id, player_id) {
            Some(p) => p,
            None => continue,
        };
        found.push(Row::new(id, &name[..name_len], hp as u8, x, y, z, id_addr));
    }
}
