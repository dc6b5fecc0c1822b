use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::digi::Digi;
use super::error::CalibrationError;
use super::hardware_id::Side;

/// Time walk correction as a function of (calibrated) amplitude.
///
/// The amplitude range `[min_amplitude, max_amplitude)` is split into `bins.len()` equal
/// buckets, each holding the correction at its center. Between centers the correction is
/// linearly interpolated, outside the outermost centers it is clamped. An empty table means no
/// correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkCurve {
    pub min_amplitude: f64,
    pub max_amplitude: f64,
    pub bins: Vec<f64>,
}

impl Default for WalkCurve {
    fn default() -> Self {
        Self {
            min_amplitude: 0.0,
            max_amplitude: 50.0,
            bins: Vec::new(),
        }
    }
}

impl WalkCurve {
    fn validate(&self, channel: u32) -> Result<(), CalibrationError> {
        if !self.bins.is_empty() && !(self.max_amplitude > self.min_amplitude) {
            return Err(CalibrationError::EmptyWalkRange(
                channel,
                self.min_amplitude,
                self.max_amplitude,
            ));
        }
        Ok(())
    }

    /// Correction in ns to subtract from the digi time
    pub fn correction(&self, amplitude: f64) -> f64 {
        let n_bins = self.bins.len();
        if n_bins == 0 {
            return 0.0;
        }
        if !amplitude.is_finite() {
            return f64::NAN;
        }

        let bin_width = (self.max_amplitude - self.min_amplitude) / n_bins as f64;
        // Position relative to the bucket centers
        let position = (amplitude - self.min_amplitude) / bin_width - 0.5;
        if position <= 0.0 {
            return self.bins[0];
        }
        let lower = position.floor() as usize;
        if lower >= n_bins - 1 {
            return self.bins[n_bins - 1];
        }
        let fraction = position - lower as f64;
        self.bins[lower] + fraction * (self.bins[lower + 1] - self.bins[lower])
    }
}

fn unit_gain() -> f64 {
    1.0
}

/// Calibration constants of one channel, or one side of a channel.
///
/// A missing side applies the entry to both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    pub channel: u32,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub time_offset_ns: f64,
    #[serde(default = "unit_gain")]
    pub gain: f64,
    #[serde(default)]
    pub amplitude_offset: f64,
    #[serde(default)]
    pub walk: WalkCurve,
}

impl ChannelCalibration {
    /// Identity calibration for a channel
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            side: None,
            time_offset_ns: 0.0,
            gain: 1.0,
            amplitude_offset: 0.0,
            walk: WalkCurve::default(),
        }
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !self.gain.is_finite() {
            return Err(CalibrationError::BadGain(self.channel, self.gain));
        }
        self.walk.validate(self.channel)
    }

    /// Calibrated (time, amplitude). The walk table is indexed by the calibrated amplitude.
    pub fn apply(&self, digi: &Digi) -> (f64, f64) {
        let amplitude = (digi.amplitude - self.amplitude_offset) * self.gain;
        let time = digi.time - self.time_offset_ns - self.walk.correction(amplitude);
        (time, amplitude)
    }
}

/// Per channel calibration table. Read only once built.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    entries: FxHashMap<(u32, Option<Side>), ChannelCalibration>,
}

impl Calibration {
    pub fn new(entries: Vec<ChannelCalibration>) -> Result<Self, CalibrationError> {
        let mut table = FxHashMap::default();
        for entry in entries {
            entry.validate()?;
            table.insert((entry.channel, entry.side), entry);
        }
        Ok(Self { entries: table })
    }

    pub fn get(&self, channel: u32, side: Side) -> Option<&ChannelCalibration> {
        self.entries
            .get(&(channel, Some(side)))
            .or_else(|| self.entries.get(&(channel, None)))
    }

    /// Calibrated (time, amplitude) of a digi.
    ///
    /// Channels without an entry pass through unchanged. Returns None if the result is not a
    /// finite number.
    pub fn apply(&self, digi: &Digi) -> Option<(f64, f64)> {
        let (time, amplitude) = match self.get(digi.channel, digi.side) {
            Some(entry) => entry.apply(digi),
            None => (digi.time, digi.amplitude),
        };
        if time.is_finite() && amplitude.is_finite() {
            Some((time, amplitude))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk() -> WalkCurve {
        // Centers at 5, 15, 25, 35
        WalkCurve {
            min_amplitude: 0.0,
            max_amplitude: 40.0,
            bins: vec![4.0, 2.0, 1.0, 0.0],
        }
    }

    #[test]
    fn test_walk_interpolation() {
        let curve = walk();
        assert_eq!(curve.correction(5.0), 4.0);
        assert_eq!(curve.correction(10.0), 3.0);
        assert_eq!(curve.correction(20.0), 1.5);
        assert_eq!(curve.correction(35.0), 0.0);
    }

    #[test]
    fn test_walk_clamped_at_ends() {
        let curve = walk();
        assert_eq!(curve.correction(-100.0), 4.0);
        assert_eq!(curve.correction(1.0), 4.0);
        assert_eq!(curve.correction(39.0), 0.0);
        assert_eq!(curve.correction(1000.0), 0.0);
    }

    #[test]
    fn test_empty_walk_is_no_correction() {
        assert_eq!(WalkCurve::default().correction(17.0), 0.0);
        assert!(walk().correction(f64::NAN).is_nan());
    }

    #[test]
    fn test_apply_channel_calibration() {
        let mut entry = ChannelCalibration::new(3);
        entry.time_offset_ns = 2.0;
        entry.gain = 2.0;
        entry.amplitude_offset = 5.0;
        entry.walk = walk();
        let table = Calibration::new(vec![entry]).unwrap();

        // amplitude (15 - 5) * 2 = 20 -> walk 1.5
        let digi = Digi::new(0, 3, Side::A, 100.0, 15.0);
        assert_eq!(table.apply(&digi), Some((96.5, 20.0)));

        let uncalibrated = Digi::new(0, 4, Side::A, 100.0, 15.0);
        assert_eq!(table.apply(&uncalibrated), Some((100.0, 15.0)));
    }

    #[test]
    fn test_side_specific_entry_wins() {
        let mut both = ChannelCalibration::new(1);
        both.time_offset_ns = 1.0;
        let mut side_b = ChannelCalibration::new(1);
        side_b.side = Some(Side::B);
        side_b.time_offset_ns = 3.0;
        let table = Calibration::new(vec![both, side_b]).unwrap();

        let a = Digi::new(0, 1, Side::A, 10.0, 1.0);
        let b = Digi::new(0, 1, Side::B, 10.0, 1.0);
        assert_eq!(table.apply(&a), Some((9.0, 1.0)));
        assert_eq!(table.apply(&b), Some((7.0, 1.0)));
    }

    #[test]
    fn test_nan_result_is_rejected() {
        let table = Calibration::new(vec![ChannelCalibration::new(0)]).unwrap();
        let digi = Digi::new(0, 0, Side::A, 10.0, f64::NAN);
        assert_eq!(table.apply(&digi), None);
    }

    #[test]
    fn test_invalid_tables() {
        let mut entry = ChannelCalibration::new(7);
        entry.gain = f64::INFINITY;
        assert_eq!(
            Calibration::new(vec![entry]).err(),
            Some(CalibrationError::BadGain(7, f64::INFINITY))
        );

        let mut entry = ChannelCalibration::new(8);
        entry.walk = WalkCurve {
            min_amplitude: 10.0,
            max_amplitude: 10.0,
            bins: vec![1.0],
        };
        assert_eq!(
            Calibration::new(vec![entry]).err(),
            Some(CalibrationError::EmptyWalkRange(8, 10.0, 10.0))
        );
    }
}
