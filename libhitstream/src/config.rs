use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::builder::{BuildMode, BuilderConfig};
use super::calibration::{Calibration, ChannelCalibration};
use super::channel_map::ChannelMap;
use super::constants::{DEFAULT_BIN_WIDTH_NS, DEFAULT_COUNTER_RANGE, DEFAULT_CYCLE_RANGE};
use super::decoder::{MaskPolicy, SyncPolicy};
use super::detector::{Detector, DetectorKind};
use super::epoch::SourceClock;
use super::error::{CalibrationError, ChannelMapError, ConfigError};
use super::requirement::{InclusionPolicy, Requirement, RequirementKind};
use super::scheduler::SchedulerOptions;

/// One readout board feeding a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub equipment_id: u32,
    pub bin_width_ns: f64,
    pub counter_range: u64,
    pub cycle_range: u64,
    #[serde(default)]
    pub time_offset_ns: f64,
}

impl SourceConfig {
    pub fn new(equipment_id: u32) -> Self {
        Self {
            equipment_id,
            bin_width_ns: DEFAULT_BIN_WIDTH_NS,
            counter_range: DEFAULT_COUNTER_RANGE,
            cycle_range: DEFAULT_CYCLE_RANGE,
            time_offset_ns: 0.0,
        }
    }

    pub fn clock(&self) -> SourceClock {
        SourceClock {
            bin_width_ns: self.bin_width_ns,
            counter_range: self.counter_range,
            cycle_range: self.cycle_range,
            time_offset_ns: self.time_offset_ns,
        }
    }
}

/// Everything needed to run one detector: its boards, mapping, clustering and calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub name: String,
    pub kind: DetectorKind,
    #[serde(default)]
    pub channel_map_path: Option<PathBuf>,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub calibration: Vec<ChannelCalibration>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            name: String::from("bmon"),
            kind: DetectorKind::Bmon,
            channel_map_path: None,
            sources: vec![SourceConfig::new(0xabc0)],
            builder: BuilderConfig {
                requirements: vec![Requirement::presence(0)],
                ..Default::default()
            },
            calibration: Vec::new(),
        }
    }
}

impl DetectorConfig {
    pub fn clocks(&self) -> Vec<(u32, SourceClock)> {
        self.sources
            .iter()
            .map(|source| (source.equipment_id, source.clock()))
            .collect()
    }

    /// Build the detector profile, loading the channel map if one is given
    pub fn build_detector(&self) -> Result<Detector, ChannelMapError> {
        let map = match &self.channel_map_path {
            Some(path) => Some(ChannelMap::new(path)?),
            None => None,
        };
        let equipment = self.sources.iter().map(|s| s.equipment_id).collect();
        Ok(Detector::new(self.kind, equipment, map))
    }

    pub fn build_calibration(&self) -> Result<Calibration, CalibrationError> {
        Calibration::new(self.calibration.clone())
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidDetector(self.name.clone(), reason.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(self.invalid("no sources configured"));
        }
        for source in self.sources.iter() {
            if !(source.bin_width_ns.is_finite() && source.bin_width_ns > 0.0) {
                return Err(self.invalid(format!(
                    "source 0x{:04x} has bin width {}",
                    source.equipment_id, source.bin_width_ns
                )));
            }
            if source.counter_range == 0 || source.cycle_range == 0 {
                return Err(self.invalid(format!(
                    "source 0x{:04x} has a zero counter or cycle range",
                    source.equipment_id
                )));
            }
        }

        let builder = &self.builder;
        if !(builder.window_ns.is_finite() && builder.window_ns > 0.0) {
            return Err(self.invalid(format!("window of {} ns", builder.window_ns)));
        }
        if builder.max_gap_ns.is_some_and(|gap| !(gap > 0.0)) {
            return Err(self.invalid("max_gap_ns must be positive"));
        }
        if builder.max_members == 0 {
            return Err(self.invalid("max_members must be at least 1"));
        }
        if let InclusionPolicy::AtLeast(k) = builder.policy {
            if !builder.requirements.is_empty() && (k == 0 || k > builder.requirements.len()) {
                return Err(self.invalid(format!(
                    "policy needs {} of {} requirements",
                    k,
                    builder.requirements.len()
                )));
            }
        }
        let needs_pulser = builder
            .requirements
            .iter()
            .any(|r| r.kind == RequirementKind::Pulser);
        match &builder.pulser {
            None if needs_pulser => {
                return Err(self.invalid("a Pulser requirement needs a pulser amplitude range"))
            }
            Some(pulser) if pulser.min_multiplicity == 0 => {
                return Err(self.invalid("pulser min_multiplicity must be at least 1"))
            }
            Some(pulser) if pulser.min_amplitude > pulser.max_amplitude => {
                return Err(self.invalid("pulser amplitude range is empty"))
            }
            _ => (),
        }
        if builder.mode == BuildMode::Strip && !(builder.strip.pitch > 0.0) {
            return Err(self.invalid("strip pitch must be positive"));
        }

        self.build_calibration()?;
        Ok(())
    }
}

/// Structure representing the application configuration. Contains pathing and run information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub archive_path: PathBuf,
    pub include_overlap: bool,
    pub discard_first_timeslice: bool,
    #[serde(default)]
    pub mask_policy: MaskPolicy,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    pub detectors: Vec<DetectorConfig>,
}

impl Default for Config {
    /// Generate a template Config with a single beam monitor. The archive path is invalid.
    fn default() -> Self {
        Self {
            archive_path: PathBuf::from("None"),
            include_overlap: false,
            discard_first_timeslice: true,
            mask_policy: MaskPolicy::Permanent,
            sync_policy: SyncPolicy::FrameStart,
            detectors: vec![DetectorConfig::default()],
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for detector in self.detectors.iter() {
            detector.validate()?;
        }
        Ok(())
    }

    pub fn has_archive(&self) -> bool {
        self.archive_path.exists()
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            include_overlap: self.include_overlap,
            discard_first_timeslice: self.discard_first_timeslice,
        }
    }

    pub fn detector(&self, name: &str) -> Option<&DetectorConfig> {
        self.detectors.iter().find(|d| d.name == name)
    }
}
