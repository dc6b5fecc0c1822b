// Fixed-width message layout shared by every front-end board we read out.
// One message is a single little endian u64:
//
// [63..60] tag
// Hit:    [59..44] channel, [43..28] amplitude, [27..0] coarse time
// Epoch:  [59..0]  value
// TsMsb:  [59..0]  value
// Status: [31..0]  flags
// Empty/Dummy carry no payload.

/// Width of one message in bytes
pub const MESSAGE_SIZE_BYTES: usize = 8;

pub const TAG_SHIFT: u32 = 60;
pub const TAG_MASK: u64 = 0xF;

pub const TAG_HIT: u8 = 0;
pub const TAG_EPOCH: u8 = 1;
pub const TAG_TS_MSB: u8 = 2;
pub const TAG_STATUS: u8 = 3;
pub const TAG_EMPTY: u8 = 4;
pub const TAG_DUMMY: u8 = 5;

pub const HIT_CHANNEL_SHIFT: u32 = 44;
pub const HIT_CHANNEL_MASK: u64 = 0xFFFF;
pub const HIT_AMPLITUDE_SHIFT: u32 = 28;
pub const HIT_AMPLITUDE_MASK: u64 = 0xFFFF;
pub const HIT_COARSE_TIME_MASK: u64 = 0x0FFF_FFFF;

pub const MARKER_VALUE_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
pub const STATUS_FLAGS_MASK: u64 = 0xFFFF_FFFF;

// Default source clock: 2^17 fine bins per marker step, 24 bit marker counter
pub const DEFAULT_BIN_WIDTH_NS: f64 = 0.1953125;
pub const DEFAULT_COUNTER_RANGE: u64 = 131_072;
pub const DEFAULT_CYCLE_RANGE: u64 = 16_777_216;

pub const DEFAULT_WINDOW_NS: f64 = 10.0;
pub const DEFAULT_MAX_MEMBERS: usize = 100;
pub const DEFAULT_HIGH_WATER_MARK: usize = 1_000_000;

// Walk tables used by the TOF calibration have this many amplitude buckets
pub const DEFAULT_WALK_BINS: usize = 20;
