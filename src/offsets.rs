// offsets.rs — Process-wide registry of game-struct offsets and RVAs.
//
// One flat set of 32-bit values with compiled-in defaults for the shipped
// client build, replaceable field-by-field at runtime by the `set_offsets`
// pipe command. Readers use relaxed single-word loads; each field is
// 4-byte aligned, so an in-flight update is observed as either the old or
// the new value, never a torn one. There is no "swap all" transaction —
// offsets change once per session in practice.

use crate::process;
use serde_json::Value;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

pub struct OffsetRegistry {
    /// RVA of the game singleton object.
    pub game_singleton_rva: AtomicU32,
    /// Game-singleton field: pointer to the creature currently attacked.
    pub attacking_creature: AtomicU32,
    /// Game-singleton field: pointer to the live ProtocolGame object.
    pub protocol_game: AtomicU32,
    /// Game-singleton field: attack-in-flight flag.
    pub attack_flag: AtomicU32,
    /// Game-singleton field: outgoing packet sequence counter.
    pub seq_counter: AtomicU32,

    /// Creature field: 32-bit identifier.
    pub creature_id: AtomicU32,
    /// Creature field: MSVC std::string name.
    pub creature_name: AtomicU32,
    /// Creature field: health percentage word.
    pub creature_hp: AtomicU32,
    /// Creature field: shared_ptr refcount block.
    pub creature_refs: AtomicU32,

    /// Position block relative to the creature's id field (ordinary creatures).
    pub npc_pos_from_id: AtomicI32,
    /// Position block relative to the id field (local player; negative).
    pub player_pos_from_id: AtomicI32,

    /// Creature vtable must fall in [min, max) as an RVA to be considered live.
    pub vtable_rva_min: AtomicU32,
    pub vtable_rva_max: AtomicU32,

    pub xtea_encrypt_rva: AtomicU32,
    pub game_attack_rva: AtomicU32,
    pub send_attack_rva: AtomicU32,
    pub game_doattack_rva: AtomicU32,
}

/// Defaults for the current client build; overridden via `set_offsets`.
pub static OFFSETS: OffsetRegistry = OffsetRegistry {
    game_singleton_rva: AtomicU32::new(0x00B2_E970),
    attacking_creature: AtomicU32::new(0x0C),
    protocol_game: AtomicU32::new(0x18),
    attack_flag: AtomicU32::new(0x34),
    seq_counter: AtomicU32::new(0x70),

    creature_id: AtomicU32::new(0x34),
    creature_name: AtomicU32::new(0x38),
    creature_hp: AtomicU32::new(0x50),
    creature_refs: AtomicU32::new(0x04),

    npc_pos_from_id: AtomicI32::new(576),
    player_pos_from_id: AtomicI32::new(-40),

    vtable_rva_min: AtomicU32::new(0x0087_0000),
    vtable_rva_max: AtomicU32::new(0x008A_0000),

    xtea_encrypt_rva: AtomicU32::new(0x003A_F220),
    game_attack_rva: AtomicU32::new(0x0008_F220),
    send_attack_rva: AtomicU32::new(0x0019_D100),
    game_doattack_rva: AtomicU32::new(0x0008_9680),
};

impl OffsetRegistry {
    /// Apply a partial update from a parsed `set_offsets` command.
    /// Each field is optional; unknown keys are ignored. Values may be
    /// JSON numbers or `"0x…"` / decimal strings.
    pub fn apply(&self, cmd: &Value) -> usize {
        let obj = match cmd.as_object() {
            Some(o) => o,
            None => return 0,
        };
        let mut updated = 0;
        for (key, val) in obj {
            let target: &AtomicU32 = match key.as_str() {
                "game_singleton_rva" => &self.game_singleton_rva,
                "attacking_creature" => &self.attacking_creature,
                "protocol_game" => &self.protocol_game,
                "attack_flag" => &self.attack_flag,
                "seq_counter" => &self.seq_counter,
                "creature_id" => &self.creature_id,
                "creature_name" => &self.creature_name,
                "creature_hp" => &self.creature_hp,
                "creature_refs" => &self.creature_refs,
                "vtable_rva_min" => &self.vtable_rva_min,
                "vtable_rva_max" => &self.vtable_rva_max,
                "xtea_encrypt_rva" => &self.xtea_encrypt_rva,
                "game_attack_rva" => &self.game_attack_rva,
                "send_attack_rva" => &self.send_attack_rva,
                "game_doattack_rva" => &self.game_doattack_rva,
                "npc_pos_from_id" => {
                    if let Some(v) = parse_i32(val) {
                        self.npc_pos_from_id.store(v, Ordering::Relaxed);
                        updated += 1;
                    }
                    continue;
                }
                "player_pos_from_id" => {
                    if let Some(v) = parse_i32(val) {
                        self.player_pos_from_id.store(v, Ordering::Relaxed);
                        updated += 1;
                    }
                    continue;
                }
                _ => continue,
            };
            if let Some(v) = parse_u32(val) {
                target.store(v, Ordering::Relaxed);
                updated += 1;
            }
        }
        updated
    }

    /// Address of the game singleton object in the live image.
    pub fn game_singleton_addr(&self) -> usize {
        process::from_rva(self.game_singleton_rva.load(Ordering::Relaxed))
    }

    /// Whether a creature vtable pointer falls inside the configured window.
    pub fn vtable_in_window(&self, vtable: usize) -> bool {
        let base = process::module_base();
        if base == 0 || vtable <= base {
            return false;
        }
        let rva = (vtable - base) as u32;
        let min = self.vtable_rva_min.load(Ordering::Relaxed);
        let max = self.vtable_rva_max.load(Ordering::Relaxed);
        rva >= min && rva < max
    }

    /// Name-string offset relative to the creature's id field.
    pub fn name_from_id(&self) -> i32 {
        self.creature_name.load(Ordering::Relaxed) as i32
            - self.creature_id.load(Ordering::Relaxed) as i32
    }

    /// Health-word offset relative to the creature's id field.
    pub fn hp_from_id(&self) -> i32 {
        self.creature_hp.load(Ordering::Relaxed) as i32
            - self.creature_id.load(Ordering::Relaxed) as i32
    }
}

/// Accept a JSON number or a `"0x…"` / decimal string.
pub(crate) fn parse_u32(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    let s = v.as_str()?.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

pub(crate) fn parse_i32(v: &Value) -> Option<i32> {
    if let Some(n) = v.as_i64() {
        return i32::try_from(n).ok();
    }
    let s = v.as_str()?.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok().map(|u| u as i32)
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_update_hex_and_decimal() {
        let reg = OffsetRegistry {
            game_singleton_rva: AtomicU32::new(0),
            attacking_creature: AtomicU32::new(0),
            protocol_game: AtomicU32::new(0),
            attack_flag: AtomicU32::new(0),
            seq_counter: AtomicU32::new(0),
            creature_id: AtomicU32::new(0),
            creature_name: AtomicU32::new(0),
            creature_hp: AtomicU32::new(0),
            creature_refs: AtomicU32::new(0),
            npc_pos_from_id: AtomicI32::new(0),
            player_pos_from_id: AtomicI32::new(0),
            vtable_rva_min: AtomicU32::new(0),
            vtable_rva_max: AtomicU32::new(0),
            xtea_encrypt_rva: AtomicU32::new(0),
            game_attack_rva: AtomicU32::new(0),
            send_attack_rva: AtomicU32::new(0),
            game_doattack_rva: AtomicU32::new(0),
        };
        let cmd = json!({
            "cmd": "set_offsets",
            "game_singleton_rva": "0xB2E970",
            "npc_pos_from_id": 576,
            "player_pos_from_id": -40,
            "creature_hp": "80",
            "bogus_key": 1,
        });
        let n = reg.apply(&cmd);
        assert_eq!(n, 4);
        assert_eq!(reg.game_singleton_rva.load(Ordering::Relaxed), 0xB2E970);
        assert_eq!(reg.npc_pos_from_id.load(Ordering::Relaxed), 576);
        assert_eq!(reg.player_pos_from_id.load(Ordering::Relaxed), -40);
        assert_eq!(reg.creature_hp.load(Ordering::Relaxed), 80);
        // untouched field keeps its value
        assert_eq!(reg.seq_counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn derived_id_relative_offsets() {
        assert_eq!(OFFSETS.name_from_id(), 0x38 - 0x34);
        assert_eq!(OFFSETS.hp_from_id(), 0x50 - 0x34);
    }

    #[test]
    fn malformed_values_ignored() {
        let before = OFFSETS.attack_flag.load(Ordering::Relaxed);
        OFFSETS.apply(&json!({ "attack_flag": "zz", "seq_counter": [1, 2] }));
        assert_eq!(OFFSETS.attack_flag.load(Ordering::Relaxed), before);
    }
}
