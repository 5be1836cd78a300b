//! Daemon-wide tuning constants, gathered in one place. The wire-level
//! size caps live with the codec and are re-exported here.

pub use ccn_core::name::MAX_NAME_COMPONENTS;
pub use ccn_core::tlv::MAX_MESSAGE_SIZE;

/// Demand added per interest arrival.
pub const UNIT_DEMAND: i32 = 5;
/// Counters saturate here.
pub const DEMAND_CAP: i32 = UNIT_DEMAND * 8;
/// Half-life of a demand counter under aging.
pub const DEMAND_HALFLIFE_MICROS: u64 = 4_000_000;
/// Aging runs at a quarter of the half-life: four passes of 5/6 is
/// close to one half.
pub const AGING_PERIOD_MICROS: u64 = DEMAND_HALFLIFE_MICROS / 4;
/// Aging passes with no demand before a prefix entry is dropped.
pub const MAX_IDLE_PASSES: u32 = 8;
/// Reaper sweeps a drained propagating entry survives.
pub const REAP_SWEEPS: u8 = 2;
/// The reaper runs while datagram faces or propagating entries exist.
pub const REAP_PERIOD_MICROS: u64 = 2 * DEMAND_HALFLIFE_MICROS;
/// Face-send sets are compacted on this period.
pub const CLEAN_PERIOD_MICROS: u64 = 15_000_000;
/// Base pacing delay for link-framed content sends.
pub const DATA_PAUSE_MICROS: u64 = 16_384;
/// Floor of the delay between propagation ticks.
pub const PROPAGATE_DELAY_BASE_MICROS: u64 = 500;
/// Random spread added on top of the floor (and used alone for the
/// first tick).
pub const PROPAGATE_DELAY_SPREAD_MICROS: u64 = 8_192;
