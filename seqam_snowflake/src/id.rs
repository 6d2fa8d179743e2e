//! 64-bit snowflake identifiers.
//!
//! | bits   | field                        |
//! |--------|------------------------------|
//! | 0..12  | per-millisecond counter      |
//! | 12..22 | machine id                   |
//! | 22..63 | unix time in milliseconds    |

use serde::Serialize;

/// Counter width mask.
pub const COUNTER_MASK: u64 = 0xFFF;
/// Counter position.
pub const COUNTER_SHIFT: u32 = 0;
/// Machine id width mask.
pub const MACHINE_ID_MASK: u64 = 0x3FF;
/// Machine id position.
pub const MACHINE_ID_SHIFT: u32 = 12;
/// Timestamp width mask.
pub const TIMESTAMP_MASK: u64 = 0x1FF_FFFF_FFFF;
/// Timestamp position.
pub const TIMESTAMP_SHIFT: u32 = 22;

/// Decomposed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnowflakeId {
    /// Milliseconds since the unix epoch.
    pub time_ms: u64,
    /// Generating machine.
    pub machine: u32,
    /// Position inside the millisecond.
    pub count: u32,
}

impl SnowflakeId {
    /// Pack into a 64-bit value. Fields are truncated to their width.
    pub fn to_raw(self) -> i64 {
        let raw = ((self.count as u64) & COUNTER_MASK) << COUNTER_SHIFT
            | ((self.machine as u64) & MACHINE_ID_MASK) << MACHINE_ID_SHIFT
            | (self.time_ms & TIMESTAMP_MASK) << TIMESTAMP_SHIFT;
        raw as i64
    }

    /// Unpack a value produced by [`SnowflakeId::to_raw`].
    pub fn from_raw(raw: i64) -> Self {
        let raw = raw as u64;
        Self {
            time_ms: (raw >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK,
            machine: ((raw >> MACHINE_ID_SHIFT) & MACHINE_ID_MASK) as u32,
            count: ((raw >> COUNTER_SHIFT) & COUNTER_MASK) as u32,
        }
    }
}

/// Split `raw` into `(time_ms, machine, count)`.
pub fn snowflake_get(raw: i64) -> SnowflakeId {
    SnowflakeId::from_raw(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_layout() {
        let id = SnowflakeId {
            time_ms: 1,
            machine: 1,
            count: 1,
        };
        assert_eq!(id.to_raw(), (1 << 22) | (1 << 12) | 1);
        assert_eq!(snowflake_get(0x0040_1001), id);
    }

    #[test]
    fn oversized_fields_are_truncated() {
        let id = SnowflakeId {
            time_ms: 0,
            machine: 1024 + 3,
            count: 4096 + 5,
        };
        assert_eq!(SnowflakeId::from_raw(id.to_raw()).machine, 3);
        assert_eq!(SnowflakeId::from_raw(id.to_raw()).count, 5);
    }

    proptest! {
        #[test]
        fn fields_survive_packing(
            time_ms in 0u64..=TIMESTAMP_MASK,
            machine in 0u32..=1023,
            count in 0u32..=4095,
        ) {
            let id = SnowflakeId { time_ms, machine, count };
            let raw = id.to_raw();
            prop_assert!(raw >= 0);
            prop_assert_eq!(SnowflakeId::from_raw(raw), id);
        }
    }
}
