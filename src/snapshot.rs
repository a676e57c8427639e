// snapshot.rs — Creature rows and the staged publish buffer.
//
// Rows are plain Copy data with a fixed-size name buffer so that the
// scanner can fill them inside an armed fault region without touching the
// allocator. The scanner stages a full cycle into its own buffer and then
// publishes it wholesale under the mutex shared with the serializer, so a
// reader never observes half a cycle.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::stability;

/// Hard cap on rows per cycle.
pub const MAX_CREATURES: usize = 200;
/// Name buffer size; validated names are at most 30 bytes.
pub const NAME_BUF: usize = 32;

/// Creature-id window handed out by the game server.
pub const MIN_CREATURE_ID: u32 = 0x1000_0000;
pub const MAX_CREATURE_ID: u32 = 0x8000_0000;

#[inline]
pub fn id_in_window(id: u32) -> bool {
    (MIN_CREATURE_ID..MAX_CREATURE_ID).contains(&id)
}

/// One creature as observed in the last scan cycle. `addr` is the host
/// address of the creature's identifier field — the fast re-read path's
/// stability token, never serialized onto the pipe.
#[derive(Copy, Clone)]
pub struct Row {
    pub id: u32,
    pub name: [u8; NAME_BUF],
    pub name_len: u8,
    pub hp: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub addr: usize,
}

impl Row {
    pub fn new(id: u32, name: &[u8], hp: u8, x: u32, y: u32, z: u32, addr: usize) -> Row {
        let mut buf = [0u8; NAME_BUF];
        let len = name.len().min(NAME_BUF - 1);
        buf[..len].copy_from_slice(&name[..len]);
        Row { id, name: buf, name_len: len as u8, hp, x, y, z, addr }
    }

    pub fn name_str(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

#[derive(Serialize)]
struct RowJson<'a> {
    id: u32,
    name: &'a str,
    hp: u8,
    x: u32,
    y: u32,
    z: u32,
}

#[derive(Serialize)]
struct Frame<'a> {
    creatures: Vec<RowJson<'a>>,
}

static PUBLISHED: Mutex<Vec<Row>> = Mutex::new(Vec::new());
static CYCLE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Replace the published snapshot with a full new cycle.
pub fn publish(rows: &[Row]) {
    {
        let mut published = PUBLISHED.lock().unwrap();
        published.clear();
        published.extend_from_slice(rows);
    }
    CYCLE_COUNT.fetch_add(1, Ordering::Relaxed);
    stability::record_count(rows.len() as u32);
}

/// Number of publish cycles since attach (crash-log counter).
pub fn cycle_count() -> u32 {
    CYCLE_COUNT.load(Ordering::Relaxed)
}

/// Run `f` over the current snapshot without copying it out.
pub fn with_published<R>(f: impl FnOnce(&[Row]) -> R) -> R {
    let published = PUBLISHED.lock().unwrap();
    f(&published)
}

/// Serialize the current snapshot as one JSON object (no trailing newline).
pub fn frame_json() -> String {
    let published = PUBLISHED.lock().unwrap();
    let frame = Frame {
        creatures: published
            .iter()
            .map(|r| RowJson {
                id: r.id,
                name: r.name_str(),
                hp: r.hp,
                x: r.x,
                y: r.y,
                z: r.z,
            })
            .collect(),
    };
    serde_json::to_string(&frame).unwrap_or_else(|_| "{\"creatures\":[]}".to_string())
}

/// Per-session reset (new pipe connection).
pub fn reset_session() {
    PUBLISHED.lock().unwrap().clear();
    CYCLE_COUNT.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_single_line_json() {
        // publish() feeds the stability heuristic's population tracking.
        let _g = crate::stability::TEST_LOCK.lock().unwrap();
        publish(&[
            Row::new(0x4000_0042, b"Rotworm", 83, 1021, 998, 7, 0x20_0000),
            Row::new(0x1000_0001, b"Avar Tar", 100, 1020, 997, 7, 0x20_0100),
        ]);
        let line = frame_json();
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        let creatures = parsed["creatures"].as_array().unwrap();
        assert_eq!(creatures.len(), 2);
        assert_eq!(creatures[0]["name"], "Rotworm");
        assert_eq!(creatures[0]["hp"], 83);
        // the raw host address never leaves the process
        assert!(creatures[0].get("addr").is_none());
        reset_session();
    }

    #[test]
    fn long_name_is_clamped() {
        let long = [b'A'; 64];
        let row = Row::new(1, &long, 1, 0, 0, 0, 0);
        assert_eq!(row.name_len as usize, NAME_BUF - 1);
    }
}
