// walker.rs — In-order traversal of the game's creature map.
//
// The game keeps its creatures in an MSVC std::map<uint32, Creature*>:
// a sentinel-anchored red-black tree whose node layout is a fixed binary
// contract (left/parent/right pointers, color byte, is-nil byte, then the
// key/value pair at +16). The walker reads the live tree through the
// Safe-Read primitive, validates every node and every pointed-to creature,
// and fills a preallocated row buffer. The whole walk runs inside the
// scanner's armed fault context — a mid-walk mutation by the game thread
// aborts the cycle, it never aborts the process.

use crate::offsets::OFFSETS;
use crate::saferead::{self, in_user_range, read_bytes, read_u32};
use crate::snapshot::{self, Row, MAX_CREATURES};
use std::sync::atomic::Ordering;

/// Hard cap on node visits per walk; guarantees termination on a
/// corrupted or cyclic tree.
pub const WALK_CAP: usize = 500;
/// Element counts outside [1, 500] fail header validation.
pub const MAX_MAP_COUNT: u32 = 500;

// MSVC std::map node record (24 bytes).
const NODE_LEFT: usize = 0;
const NODE_PARENT: usize = 4;
const NODE_RIGHT: usize = 8;
const NODE_ISNIL: usize = 13;
const NODE_KEY: usize = 16;
const NODE_VALUE: usize = 20;

#[derive(Copy, Clone)]
#[repr(C)]
struct Node {
    left: u32,
    parent: u32,
    right: u32,
    color: u8,
    isnil: u8,
    _pad: [u8; 2],
    key: u32,
    value: u32,
}

fn read_node(addr: usize) -> Option<Node> {
    if !in_user_range(addr) {
        return None;
    }
    let node: Node = saferead::read(addr)?;
    // Anything but 0/1 in the flag bytes means we are not looking at a node.
    if node.isnil > 1 {
        return None;
    }
    Some(node)
}

/// Validate `addr` as a map header. Returns (sentinel, element count).
pub fn validate_header(addr: usize) -> Option<(usize, u32)> {
    let sentinel = read_u32(addr)? as usize;
    let count = read_u32(addr + 4)?;
    if count == 0 || count > MAX_MAP_COUNT {
        return None;
    }
    if !in_user_range(sentinel) {
        return None;
    }
    let node = read_node(sentinel)?;
    if node.isnil != 1 {
        return None;
    }
    if !in_user_range(node.left as usize)
        || !in_user_range(node.parent as usize)
        || !in_user_range(node.right as usize)
    {
        return None;
    }
    Some((sentinel, count))
}

/// Walk the creature map at `map_addr` and fill `out` (cleared first) with
/// validated rows. Returns false if the header fails structural validation;
/// the caller wraps the call in the scanner fault context, so a mid-walk
/// fault surfaces as `None` there instead.
pub fn walk_into(map_addr: usize, player_id: u32, out: &mut Vec<Row>) -> bool {
    out.clear();
    let (sentinel, _count) = match validate_header(map_addr) {
        Some(h) => h,
        None => return false,
    };
    let sentinel_node = match read_node(sentinel) {
        Some(n) => n,
        None => return false,
    };

    let mut visits = 0usize;
    let mut cur = match leftmost(sentinel_node.left as usize, &mut visits) {
        Some(addr) => addr,
        None => return true, // empty or exhausted straight away
    };

    while visits < WALK_CAP && out.len() < MAX_CREATURES {
        visits += 1;
        let node = match read_node(cur) {
            Some(n) => n,
            None => break,
        };
        if node.isnil != 0 {
            break;
        }
        if let Some(row) = extract_row(&node, player_id) {
            out.push(row);
        }
        cur = match successor(cur, &node, &mut visits) {
            Some(next) => next,
            None => break,
        };
    }
    true
}

/// Descend to the leftmost node of the subtree rooted at `addr`.
fn leftmost(addr: usize, visits: &mut usize) -> Option<usize> {
    let mut cur = addr;
    loop {
        *visits += 1;
        if *visits >= WALK_CAP {
            return None;
        }
        let node = read_node(cur)?;
        if node.isnil != 0 {
            return None;
        }
        let left = node.left as usize;
        match read_node(left) {
            Some(child) if child.isnil == 0 => cur = left,
            _ => return Some(cur),
        }
    }
}

/// In-order successor: leftmost of the right subtree, else climb parents
/// while arriving from the right child. Reaching the sentinel ends the walk.
fn successor(addr: usize, node: &Node, visits: &mut usize) -> Option<usize> {
    let right = read_node(node.right as usize)?;
    if right.isnil == 0 {
        return leftmost(node.right as usize, visits);
    }
    let mut child = addr;
    let mut parent_addr = node.parent as usize;
    loop {
        *visits += 1;
        if *visits >= WALK_CAP {
            return None;
        }
        let parent = read_node(parent_addr)?;
        if parent.isnil != 0 {
            return None; // climbed back to the sentinel
        }
        if child == parent.right as usize {
            child = parent_addr;
            parent_addr = parent.parent as usize;
        } else {
            return Some(parent_addr);
        }
    }
}

/// Validate one (key, Creature*) pair and read it into a row.
fn extract_row(node: &Node, player_id: u32) -> Option<Row> {
    if !snapshot::id_in_window(node.key) {
        return None;
    }
    let base = node.value as usize;
    if !in_user_range(base) {
        return None;
    }
    // A live creature's first word is a vtable inside the configured window.
    let vtable = read_u32(base)? as usize;
    if !OFFSETS.vtable_in_window(vtable) {
        return None;
    }
    let id_addr = base + OFFSETS.creature_id.load(Ordering::Relaxed) as usize;
    if read_u32(id_addr)? != node.key {
        return None;
    }
    let hp = read_u32(base + OFFSETS.creature_hp.load(Ordering::Relaxed) as usize)?;
    if hp == 0 || hp > 100 {
        return None;
    }
    let mut name = [0u8; snapshot::NAME_BUF];
    let name_len = read_name(
        base + OFFSETS.creature_name.load(Ordering::Relaxed) as usize,
        &mut name,
    )?;
    let (x, y, z) = read_position(id_addr, node.key, player_id)?;
    Some(Row::new(node.key, &name[..name_len], hp as u8, x, y, z, id_addr))
}

/// Check that the first `n` in-order keys of the map at `map_addr` fall in
/// the creature-id window (fewer if the tree holds fewer). Used by the map
/// locator to tell a real creature map from a lookalike header.
pub fn first_keys_in_window(map_addr: usize, n: usize) -> bool {
    let (sentinel, count) = match validate_header(map_addr) {
        Some(h) => h,
        None => return false,
    };
    let sentinel_node = match read_node(sentinel) {
        Some(node) => node,
        None => return false,
    };
    let want = n.min(count as usize);
    let mut visits = 0usize;
    let mut cur = match leftmost(sentinel_node.left as usize, &mut visits) {
        Some(addr) => addr,
        None => return false,
    };
    let mut seen = 0usize;
    while seen < want && visits < WALK_CAP {
        visits += 1;
        let node = match read_node(cur) {
            Some(node) => node,
            None => return false,
        };
        if node.isnil != 0 {
            break;
        }
        if !snapshot::id_in_window(node.key) {
            return false;
        }
        seen += 1;
        cur = match successor(cur, &node, &mut visits) {
            Some(next) => next,
            None => break,
        };
    }
    seen > 0
}

/// O(log n) lookup of a creature pointer by id, using the same node layout.
pub fn find_creature_ptr(map_addr: usize, id: u32) -> Option<usize> {
    let (sentinel, _count) = validate_header(map_addr)?;
    let mut cur = read_u32(sentinel + NODE_PARENT)? as usize;
    for _ in 0..64 {
        let node = read_node(cur)?;
        if node.isnil != 0 {
            return None;
        }
        cur = if id < node.key {
            node.left as usize
        } else if id > node.key {
            node.right as usize
        } else {
            return Some(node.value as usize);
        };
    }
    None
}

// ── Name reader ─────────────────────────────────────────────────────

/// Read an MSVC small-string-optimized std::string at `str_base` into
/// `out`, applying the name grammar. Returns the name length.
pub fn read_name(str_base: usize, out: &mut [u8; snapshot::NAME_BUF]) -> Option<usize> {
    let size = read_u32(str_base + 16)?;
    let cap = read_u32(str_base + 20)?;
    if size == 0 || size > 30 || cap < size || cap >= 256 {
        return None;
    }
    let data_addr = if cap < 16 {
        str_base // inline buffer
    } else {
        let heap = read_u32(str_base)? as usize;
        if !in_user_range(heap) {
            return None;
        }
        heap
    };
    let len = size as usize;
    if !read_bytes(data_addr, &mut out[..len]) {
        return None;
    }
    if !validate_name(&out[..len]) {
        return None;
    }
    Some(len)
}

fn is_name_char(c: u8) -> bool {
    matches!(c, b' ' | b'\'' | b'-' | b'.')
        || c.is_ascii_alphanumeric()
}

/// The restrictive creature-name grammar. Filters interned symbol text and
/// pointer-like byte runs that pass the numeric checks: 3..=30 chars,
/// leading capital, at least one lowercase, no lowercase-to-uppercase
/// transition.
pub fn validate_name(s: &[u8]) -> bool {
    if s.len() < 3 || s.len() > 30 {
        return false;
    }
    if !s[0].is_ascii_uppercase() {
        return false;
    }
    let mut has_lower = false;
    for i in 0..s.len() {
        if !is_name_char(s[i]) {
            return false;
        }
        if s[i].is_ascii_lowercase() {
            has_lower = true;
        }
        if i > 0 && s[i - 1].is_ascii_lowercase() && s[i].is_ascii_uppercase() {
            return false;
        }
    }
    has_lower
}

// ── Position reader ─────────────────────────────────────────────────

/// Read the three position words relative to the creature's id field. The
/// local player stores its position at a different (negative) offset than
/// every other creature.
pub fn read_position(id_addr: usize, id: u32, player_id: u32) -> Option<(u32, u32, u32)> {
    let off = if player_id != 0 && id == player_id {
        OFFSETS.player_pos_from_id.load(Ordering::Relaxed)
    } else {
        OFFSETS.npc_pos_from_id.load(Ordering::Relaxed)
    };
    let pos_addr = (id_addr as i64 + off as i64) as usize;
    let words: [u32; 3] = saferead::read(pos_addr)?;
    let (x, y, z) = (words[0], words[1], words[2]);
    if x > 65535 || y > 65535 || z > 15 {
        return None;
    }
    Some((x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NAME_BUF;

    // ── name grammar ────────────────────────────────────────────────

    #[test]
    fn accepts_real_creature_names() {
        for name in [
            "Rotworm",
            "Orc Shaman",
            "Gamel's Henchman",
            "Two-Headed Turtle",
            "Mr. Punish",
            "Ratter 2",
        ] {
            assert!(validate_name(name.as_bytes()), "rejected {name}");
        }
    }

    #[test]
    fn rejects_symbolish_text() {
        for name in [
            "rotworm",        // no leading capital
            "ROT",            // no lowercase at all
            "OnLogin",        // lowercase-to-uppercase transition
            "Ab",             // too short
            "Rot_worm",       // bad char
            "Rot\tworm",      // control char
            "Orc\u{e9}",      // non-ascii byte
        ] {
            assert!(!validate_name(name.as_bytes()), "accepted {name:?}");
        }
        assert!(!validate_name(&[b'A'; 31])); // too long
        assert!(!validate_name(b"Abc\xFFd")); // pointer-like bytes
    }

    // ── MSVC string reader ──────────────────────────────────────────

    #[repr(C)]
    struct MsvcString {
        data: [u8; 16],
        size: u32,
        cap: u32,
    }

    #[test]
    fn reads_inline_string() {
        let mut s = MsvcString { data: [0; 16], size: 6, cap: 15 };
        s.data[..6].copy_from_slice(b"Dragon");
        let mut out = [0u8; NAME_BUF];
        let len = read_name(&s as *const _ as usize, &mut out).unwrap();
        assert_eq!(&out[..len], b"Dragon");
    }

    #[test]
    fn reads_heap_string() {
        let heap = b"Ancient Scarab".to_vec();
        let mut s = MsvcString { data: [0; 16], size: 14, cap: 31 };
        s.data[..4].copy_from_slice(&(heap.as_ptr() as u32).to_le_bytes());
        let mut out = [0u8; NAME_BUF];
        let len = read_name(&s as *const _ as usize, &mut out).unwrap();
        assert_eq!(&out[..len], b"Ancient Scarab");
    }

    #[test]
    fn rejects_inconsistent_string_header() {
        let mut out = [0u8; NAME_BUF];
        // size > cap
        let s = MsvcString { data: [0; 16], size: 20, cap: 15 };
        assert!(read_name(&s as *const _ as usize, &mut out).is_none());
        // absurd capacity
        let s = MsvcString { data: [0; 16], size: 5, cap: 512 };
        assert!(read_name(&s as *const _ as usize, &mut out).is_none());
        // empty
        let s = MsvcString { data: [0; 16], size: 0, cap: 15 };
        assert!(read_name(&s as *const _ as usize, &mut out).is_none());
    }

    // ── synthetic tree walking ──────────────────────────────────────
    //
    // Build a real MSVC-shaped tree in our own memory and walk it through
    // the actual Safe-Read path. The creature objects use the registry's
    // default field offsets; the vtable window is pointed at a static
    // inside this test binary so the window check passes.

    use crate::offsets::OFFSETS;
    use std::sync::atomic::Ordering;

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

    const CREATURE_BYTES: usize = 0x34 + 600 + 16;
    const ID_SLACK: usize = 64; // room below the struct for the player offset

    struct Arena {
        nodes: Vec<Box<RawNode>>,
        creatures: Vec<Box<[u8; CREATURE_BYTES + ID_SLACK]>>,
        header: Box<[u32; 2]>,
    }

    static FAKE_VTABLE: [u32; 4] = [0xDEAD_0001, 0xDEAD_0002, 0xDEAD_0003, 0xDEAD_0004];

    fn point_vtable_window_at_fake() {
        let base = crate::process::module_base() as u32;
        let vt = FAKE_VTABLE.as_ptr() as u32;
        let rva = vt.wrapping_sub(base);
        OFFSETS.vtable_rva_min.store(rva.saturating_sub(0x100), Ordering::Relaxed);
        OFFSETS.vtable_rva_max.store(rva.wrapping_add(0x100), Ordering::Relaxed);
    }

    fn make_creature(id: u32, name: &str, hp: u32, pos: (u32, u32, u32)) -> Box<[u8; CREATURE_BYTES + ID_SLACK]> {
        let mut buf = Box::new([0u8; CREATURE_BYTES + ID_SLACK]);
        let b = ID_SLACK; // creature struct starts here
        buf[b..b + 4].copy_from_slice(&(FAKE_VTABLE.as_ptr() as u32).to_le_bytes());
        buf[b + 0x34..b + 0x38].copy_from_slice(&id.to_le_bytes());
        // inline MSVC string at +0x38
        buf[b + 0x38..b + 0x38 + name.len()].copy_from_slice(name.as_bytes());
        buf[b + 0x48..b + 0x4C].copy_from_slice(&(name.len() as u32).to_le_bytes());
        buf[b + 0x4C..b + 0x50].copy_from_slice(&15u32.to_le_bytes());
        buf[b + 0x50..b + 0x54].copy_from_slice(&hp.to_le_bytes());
        // NPC position at id_addr + 576 = b + 0x34 + 576
        let p = b + 0x34 + 576;
        buf[p..p + 4].copy_from_slice(&pos.0.to_le_bytes());
        buf[p + 4..p + 8].copy_from_slice(&pos.1.to_le_bytes());
        buf[p + 8..p + 12].copy_from_slice(&pos.2.to_le_bytes());
        buf
    }

    /// Build a three-node tree:        (B)
    ///                               /     \
    ///                             (A)     (C)
    fn build_tree(specs: &[(u32, &str, u32)]) -> Arena {
        assert_eq!(specs.len(), 3);
        let creatures: Vec<_> = specs
            .iter()
            .map(|(id, name, hp)| make_creature(*id, name, *hp, (1000 + id % 50, 900, 7)))
            .collect();
        let mut nodes: Vec<Box<RawNode>> = (0..4)
            .map(|_| {
                Box::new(RawNode {
                    left: 0, parent: 0, right: 0,
                    color: 1, isnil: 0, pad: [0; 2],
                    key: 0, value: 0,
                })
            })
            .collect();
        let addr = |n: &Box<RawNode>| &**n as *const RawNode as u32;
        let (s, a, b, c) = (addr(&nodes[0]), addr(&nodes[1]), addr(&nodes[2]), addr(&nodes[3]));
        let cval = |i: usize| (creatures[i].as_ptr() as usize + ID_SLACK) as u32;

        *nodes[0] = RawNode { left: a, parent: b, right: c, color: 1, isnil: 1, pad: [0; 2], key: 0, value: 0 };
        *nodes[1] = RawNode { left: s, parent: b, right: s, color: 0, isnil: 0, pad: [0; 2], key: specs[0].0, value: cval(0) };
        *nodes[2] = RawNode { left: a, parent: s, right: c, color: 1, isnil: 0, pad: [0; 2], key: specs[1].0, value: cval(1) };
        *nodes[3] = RawNode { left: s, parent: b, right: s, color: 0, isnil: 0, pad: [0; 2], key: specs[2].0, value: cval(2) };

        let header = Box::new([s, 3u32]);
        Arena { nodes, creatures, header }
    }

    #[test]
    fn walks_tree_in_key_order() {
        point_vtable_window_at_fake();
        let arena = build_tree(&[
            (0x4000_0001, "Cyclops", 55),
            (0x4000_0002, "Dwarf Guard", 100),
            (0x4000_0003, "Minotaur", 3),
        ]);
        let map_addr = arena.header.as_ptr() as usize;
        let mut rows = Vec::with_capacity(MAX_CREATURES);
        assert!(walk_into(map_addr, 0, &mut rows));
        let ids: Vec<u32> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0x4000_0001, 0x4000_0002, 0x4000_0003]);
        assert_eq!(rows[0].name_str(), "Cyclops");
        assert_eq!(rows[1].hp, 100);
        for row in &rows {
            assert!(crate::snapshot::id_in_window(row.id));
            assert!(row.hp > 0 && row.hp <= 100);
            assert!(validate_name(&row.name[..row.name_len as usize]));
            assert!(row.x <= 65535 && row.y <= 65535 && row.z <= 15);
        }
        drop(arena.nodes);
        drop(arena.creatures);
    }

    #[test]
    fn rejects_row_with_wrong_back_id() {
        point_vtable_window_at_fake();
        let arena = build_tree(&[
            (0x4000_0001, "Cyclops", 55),
            (0x4000_0002, "Dwarf Guard", 100),
            (0x4000_0003, "Minotaur", 3),
        ]);
        // Corrupt the middle creature's own id field: key no longer matches
        let c1 = arena.creatures[1].as_ptr() as usize + ID_SLACK;
        unsafe {
            std::ptr::write((c1 + 0x34) as *mut u32, 0x4000_9999);
        }
        let mut rows = Vec::new();
        assert!(walk_into(arena.header.as_ptr() as usize, 0, &mut rows));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn header_validation_rejects_garbage() {
        // count out of range
        let bogus = Box::new([0x20_0000u32, 0u32]);
        assert!(validate_header(bogus.as_ptr() as usize).is_none());
        let bogus = Box::new([0x20_0000u32, 100_000u32]);
        assert!(validate_header(bogus.as_ptr() as usize).is_none());
        // sentinel pointer outside the user range
        let bogus = Box::new([0x10u32, 5u32]);
        assert!(validate_header(bogus.as_ptr() as usize).is_none());
    }

    #[test]
    fn cyclic_tree_terminates_within_cap() {
        point_vtable_window_at_fake();
        // A node whose right child is itself: the visit cap must end the walk.
        let node = Box::new(RawNode {
            left: 0, parent: 0, right: 0,
            color: 0, isnil: 0, pad: [0; 2],
            key: 0x4000_0010, value: 0,
        });
        let sentinel = Box::new(RawNode {
            left: 0, parent: 0, right: 0,
            color: 1, isnil: 1, pad: [0; 2],
            key: 0, value: 0,
        });
        let naddr = &*node as *const RawNode as u32;
        let saddr = &*sentinel as *const RawNode as u32;
        unsafe {
            let n = &*node as *const RawNode as *mut RawNode;
            (*n).left = saddr;
            (*n).parent = naddr; // parent loop
            (*n).right = naddr;  // right-child loop
            let s = &*sentinel as *const RawNode as *mut RawNode;
            (*s).left = naddr;
            (*s).parent = naddr;
            (*s).right = naddr;
        }
        let header = Box::new([saddr, 1u32]);
        let mut rows = Vec::new();
        // Must return (cap-bounded), not hang.
        assert!(walk_into(header.as_ptr() as usize, 0, &mut rows));
    }

    #[test]
    fn binary_search_finds_and_misses() {
        point_vtable_window_at_fake();
        let arena = build_tree(&[
            (0x4000_0001, "Cyclops", 55),
            (0x4000_0002, "Dwarf Guard", 100),
            (0x4000_0003, "Minotaur", 3),
        ]);
        let map_addr = arena.header.as_ptr() as usize;
        let hit = find_creature_ptr(map_addr, 0x4000_0002).unwrap();
        assert_eq!(hit, arena.creatures[1].as_ptr() as usize + ID_SLACK);
        assert!(find_creature_ptr(map_addr, 0x4000_0042).is_none());
    }

    #[test]
    fn player_position_uses_negative_offset() {
        point_vtable_window_at_fake();
        let player_id = 0x1000_0001;
        let mut creature = make_creature(player_id, "Avar Tar", 100, (0, 0, 0));
        // Player position lives at id_addr - 40
        let id_off = ID_SLACK + 0x34;
        let p = id_off - 40;
        creature[p..p + 4].copy_from_slice(&123u32.to_le_bytes());
        creature[p + 4..p + 8].copy_from_slice(&456u32.to_le_bytes());
        creature[p + 8..p + 12].copy_from_slice(&7u32.to_le_bytes());
        let id_addr = creature.as_ptr() as usize + id_off;
        assert_eq!(read_position(id_addr, player_id, player_id), Some((123, 456, 7)));
        // Same creature read as an NPC uses +576
        assert_eq!(read_position(id_addr, player_id, 0), Some((1000 + player_id % 50, 900, 7)));
    }

    #[test]
    fn out_of_bounds_position_rejected() {
        let words = [70_000u32, 10u32, 3u32];
        let addr = words.as_ptr() as usize;
        // id_addr contrived so that npc offset lands on `words`
        let id_addr = (addr as i64 - OFFSETS.npc_pos_from_id.load(Ordering::Relaxed) as i64) as usize;
        assert_eq!(read_position(id_addr, 5, 0), None);
    }
}
