use serde::{Deserialize, Serialize};

use super::constants::{DEFAULT_BIN_WIDTH_NS, DEFAULT_COUNTER_RANGE, DEFAULT_CYCLE_RANGE};

/// Where a source stands with respect to its slow counter within the current timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    AwaitingFirstMarker,
    Synced,
}

/// What happened when a marker (Epoch or TsMsb) was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    /// First marker of the timeslice for this source
    First,
    /// Same value as before (markers repeat at frame boundaries)
    Repeated,
    Advanced,
    /// The counter wrapped by the expected step (R-1 -> 0)
    Wrapped,
    /// The counter decreased by some other amount. Still counted as one wraparound.
    UnexpectedJump { previous: u64, current: u64 },
}

impl MarkerOutcome {
    pub fn is_wrap(&self) -> bool {
        matches!(self, Self::Wrapped | Self::UnexpectedJump { .. })
    }
}

/// Slow counter state of a single source.
///
/// The full marker index is `counter_value + cycle_range * cycle_count`. A counter value
/// smaller than the previous one is taken as exactly one wraparound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochState {
    counter_value: u64,
    cycle_count: u64,
    cycle_range: u64,
    sync: SyncState,
    seen_marker: bool,
}

impl EpochState {
    pub fn new(cycle_range: u64) -> Self {
        Self {
            counter_value: 0,
            cycle_count: 0,
            cycle_range: cycle_range.max(1),
            sync: SyncState::AwaitingFirstMarker,
            seen_marker: false,
        }
    }

    pub fn counter_value(&self) -> u64 {
        self.counter_value
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn is_synced(&self) -> bool {
        self.sync == SyncState::Synced
    }

    /// Full, monotonic marker index
    pub fn marker_index(&self) -> u64 {
        self.counter_value + self.cycle_range * self.cycle_count
    }

    /// Drop back to AwaitingFirstMarker. Called at the start of every timeslice.
    pub fn begin_timeslice(&mut self) {
        self.sync = SyncState::AwaitingFirstMarker;
    }

    /// Observe a marker value, continuing from whatever state the run has accumulated.
    pub fn observe(&mut self, value: u64) -> MarkerOutcome {
        let value = value % self.cycle_range;
        let was_synced = self.sync == SyncState::Synced;
        self.sync = SyncState::Synced;

        if !self.seen_marker {
            self.seen_marker = true;
            self.counter_value = value;
            return MarkerOutcome::First;
        }

        let previous = self.counter_value;
        self.counter_value = value;
        let outcome = if value == previous {
            MarkerOutcome::Repeated
        } else if value > previous {
            MarkerOutcome::Advanced
        } else {
            self.cycle_count += 1;
            if value == (previous + 1) % self.cycle_range {
                MarkerOutcome::Wrapped
            } else {
                MarkerOutcome::UnexpectedJump {
                    previous,
                    current: value,
                }
            }
        };

        if was_synced {
            outcome
        } else {
            match outcome {
                MarkerOutcome::Repeated | MarkerOutcome::Advanced => MarkerOutcome::First,
                other => other,
            }
        }
    }

    /// Synchronize on the first marker of a timeslice using the frame start time as anchor.
    ///
    /// `anchor_index` is the full marker index implied by the frame header. The cycle count
    /// is taken from the anchor, moved by one when the marker value sits on the other side
    /// of a wraparound relative to the anchor.
    pub fn sync_to_anchor(&mut self, value: u64, anchor_index: u64) -> MarkerOutcome {
        let value = value % self.cycle_range;
        let anchor_cycle = anchor_index / self.cycle_range;
        let anchor_value = anchor_index % self.cycle_range;
        let half = self.cycle_range / 2;

        let cycle = if value + half < anchor_value {
            anchor_cycle + 1
        } else if anchor_value + half < value && anchor_cycle > 0 {
            anchor_cycle - 1
        } else {
            anchor_cycle
        };

        self.counter_value = value;
        self.cycle_count = cycle;
        self.sync = SyncState::Synced;
        self.seen_marker = true;
        MarkerOutcome::First
    }
}

/// Timing parameters of one source clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceClock {
    /// Width of one fine counter bin
    pub bin_width_ns: f64,
    /// Number of fine bins covered by one marker step
    pub counter_range: u64,
    /// Marker counter modulus
    pub cycle_range: u64,
    /// Subtracted from every reconstructed time
    #[serde(default)]
    pub time_offset_ns: f64,
}

impl Default for SourceClock {
    fn default() -> Self {
        Self {
            bin_width_ns: DEFAULT_BIN_WIDTH_NS,
            counter_range: DEFAULT_COUNTER_RANGE,
            cycle_range: DEFAULT_CYCLE_RANGE,
            time_offset_ns: 0.0,
        }
    }
}

impl SourceClock {
    /// Duration of a single marker step
    pub fn epoch_length_ns(&self) -> f64 {
        self.counter_range as f64 * self.bin_width_ns
    }

    /// Reconstruct the global time of a hit in nanoseconds
    pub fn global_time(&self, state: &EpochState, local_counter: u32) -> f64 {
        let epoch_contribution = self.epoch_length_ns() * state.marker_index() as f64;
        local_counter as f64 * self.bin_width_ns + epoch_contribution - self.time_offset_ns
    }

    /// Marker index implied by a frame start time
    pub fn anchor_index(&self, frame_start_ns: u64) -> u64 {
        let epoch = self.epoch_length_ns();
        if epoch <= 0.0 {
            return 0;
        }
        (frame_start_ns as f64 / epoch).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn unit_clock(cycle_range: u64) -> SourceClock {
        SourceClock {
            bin_width_ns: 1.0,
            counter_range: 1,
            cycle_range,
            time_offset_ns: 0.0,
        }
    }

    #[test]
    fn test_twelve_bit_wraparound() {
        let clock = unit_clock(4096);
        let mut state = EpochState::new(4096);
        let mut times = Vec::new();
        let mut wraps = 0;
        for value in [10, 20, 4095, 5] {
            if state.observe(value).is_wrap() {
                wraps += 1;
            }
            times.push(clock.global_time(&state, 0));
        }
        assert_eq!(wraps, 1);
        assert_eq!(state.cycle_count(), 1);
        assert_eq!(times, vec![10.0, 20.0, 4095.0, 4101.0]);
    }

    #[test]
    fn test_expected_and_unexpected_wrap() {
        let mut state = EpochState::new(16);
        assert_eq!(state.observe(15), MarkerOutcome::First);
        assert_eq!(state.observe(0), MarkerOutcome::Wrapped);
        assert_eq!(state.observe(9), MarkerOutcome::Advanced);
        assert_eq!(
            state.observe(3),
            MarkerOutcome::UnexpectedJump {
                previous: 9,
                current: 3
            }
        );
        assert_eq!(state.cycle_count(), 2);
        assert_eq!(state.marker_index(), 3 + 32);
    }

    #[test]
    fn test_reconstruction_is_monotonic() {
        // Random steps, never more than one wrap per cycle_range steps
        let cycle_range = 64;
        let clock = unit_clock(cycle_range);
        let mut state = EpochState::new(cycle_range);
        let mut rng = StdRng::seed_from_u64(0x2545_f491);
        let mut raw = 0u64;
        let mut last_time = f64::MIN;
        for _ in 0..10_000 {
            raw = (raw + rng.gen_range(0..8)) % cycle_range;
            state.observe(raw);
            let time = clock.global_time(&state, 0);
            assert!(time >= last_time, "time went backwards: {time} < {last_time}");
            last_time = time;
        }
    }

    #[test]
    fn test_resync_keeps_cycle_in_continue_mode() {
        let mut state = EpochState::new(100);
        state.observe(98);
        state.observe(99);
        state.begin_timeslice();
        assert_eq!(state.sync_state(), SyncState::AwaitingFirstMarker);
        assert!(state.observe(1).is_wrap());
        assert!(state.is_synced());
        assert_eq!(state.marker_index(), 101);
    }

    #[test]
    fn test_first_marker_after_resync_is_first() {
        let mut state = EpochState::new(100);
        state.observe(10);
        state.begin_timeslice();
        assert_eq!(state.observe(12), MarkerOutcome::First);
    }

    #[test]
    fn test_sync_to_anchor() {
        let mut state = EpochState::new(100);
        // Header says index 1_099, marker already wrapped to 1 => cycle 11
        state.sync_to_anchor(1, 1_099);
        assert_eq!(state.marker_index(), 1_101);
        // Marker slightly behind the anchor, same cycle
        state.sync_to_anchor(97, 1_099);
        assert_eq!(state.marker_index(), 1_097);
        // Marker from the end of the previous cycle while header is already past the wrap
        state.sync_to_anchor(99, 1_101);
        assert_eq!(state.marker_index(), 1_099);
    }

    #[test]
    fn test_anchor_index_from_frame_start() {
        let clock = SourceClock {
            bin_width_ns: 0.5,
            counter_range: 20,
            cycle_range: 1000,
            time_offset_ns: 0.0,
        };
        assert_eq!(clock.epoch_length_ns(), 10.0);
        assert_eq!(clock.anchor_index(12_345), 1_234);
    }
}
