use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::buffer::TimeOrderedBuffer;
use super::calibration::Calibration;
use super::cluster::{Cluster, ClusterFlags, ClusterSink};
use super::constants::{DEFAULT_HIGH_WATER_MARK, DEFAULT_MAX_MEMBERS, DEFAULT_WINDOW_NS};
use super::digi::Digi;
use super::observer::{Diagnostic, Observer};
use super::requirement::{InclusionPolicy, PulserConfig, Requirement, RequirementTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BuildMode {
    /// Multi channel time coincidence
    #[default]
    Coincidence,
    /// Adjacent strip clustering with amplitude weighted centroids
    Strip,
}

/// Neighbourhood used by strip clustering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripConfig {
    /// Distance between neighbouring channels
    pub pitch: f64,
    pub max_space_dist: f64,
    pub max_time_dist: f64,
}

impl Default for StripConfig {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            max_space_dist: 1.5,
            max_time_dist: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub mode: BuildMode,
    pub window_ns: f64,
    /// If set, the window ends early once no member was found for this long
    pub max_gap_ns: Option<f64>,
    pub max_members: usize,
    pub policy: InclusionPolicy,
    /// Channel which must be present in a window for it to be emitted
    pub reference_channel: Option<u32>,
    pub requirements: Vec<Requirement>,
    pub pulser: Option<PulserConfig>,
    pub strip: StripConfig,
    /// Buffer size above which windows are built without waiting for readiness
    pub high_water_mark: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::Coincidence,
            window_ns: DEFAULT_WINDOW_NS,
            max_gap_ns: None,
            max_members: DEFAULT_MAX_MEMBERS,
            policy: InclusionPolicy::default(),
            reference_channel: None,
            requirements: Vec::new(),
            pulser: None,
            strip: StripConfig::default(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderStats {
    pub seeds: u64,
    pub clusters: u64,
    /// Windows failing the inclusion policy
    pub suppressed: u64,
    /// Windows passing the policy but missing the reference channel
    pub vetoed: u64,
    pub pulser_forced: u64,
    pub truncated: u64,
    pub degenerate: u64,
    /// Members dropped because their calibration was not a number
    pub excluded_members: u64,
    /// Digis consumed without ending up in an emitted cluster
    pub discarded_digis: u64,
}

/// A digi together with its calibrated time and amplitude
#[derive(Debug, Clone, Copy)]
struct Calibrated {
    digi: Digi,
    time: f64,
    amplitude: f64,
}

/// Turns the time ordered digi stream into clusters.
///
/// Each round takes the earliest buffered digi as seed, sweeps every digi inside the seed's
/// window out of the buffer and decides whether the group is emitted. Digis of a group that
/// is not emitted are dropped; the next round reseeds from the buffer head.
#[derive(Debug)]
pub struct WindowClusterBuilder {
    config: BuilderConfig,
    calibration: Calibration,
    stats: BuilderStats,
    under_pressure: bool,
}

impl WindowClusterBuilder {
    pub fn new(config: BuilderConfig, calibration: Calibration) -> Self {
        Self {
            config,
            calibration,
            stats: BuilderStats::default(),
            under_pressure: false,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    /// Build every cluster whose window is complete.
    ///
    /// A window is complete once the buffer holds a digi at or past its end. With
    /// `force_drain` (end of run) every remaining digi is processed. Returns the number of
    /// clusters pushed to the sink.
    pub fn process(
        &mut self,
        buffer: &mut TimeOrderedBuffer,
        sink: &mut dyn ClusterSink,
        observer: &mut dyn Observer,
        force_drain: bool,
    ) -> usize {
        let before = self.stats.clusters;
        while let Some(seed_time) = buffer.earliest_time() {
            if !force_drain && !self.check_pressure(buffer) {
                match buffer.latest_time() {
                    Some(latest) if latest >= seed_time + self.config.window_ns => (),
                    _ => break,
                }
            }
            let seed = match buffer.pop_front() {
                Some(seed) => seed,
                None => break,
            };
            self.stats.seeds += 1;

            let candidates = self.sweep(seed, buffer);
            let calibrated = self.calibrate(candidates);
            let members = match self.config.mode {
                BuildMode::Coincidence => calibrated,
                BuildMode::Strip => {
                    let (members, leftovers) = self.strip_members(calibrated);
                    buffer.requeue(leftovers);
                    members
                }
            };
            self.emit(seed.time, members, sink, observer, force_drain);
        }
        (self.stats.clusters - before) as usize
    }

    fn check_pressure(&mut self, buffer: &TimeOrderedBuffer) -> bool {
        let pressure = buffer.size() > self.config.high_water_mark;
        if pressure != self.under_pressure {
            if pressure {
                spdlog::info!(
                    "Buffer holds {} digis, above the high water mark of {}; building without waiting for complete windows",
                    buffer.size(),
                    self.config.high_water_mark
                );
            } else {
                spdlog::info!("Buffer back under the high water mark");
            }
            self.under_pressure = pressure;
        }
        pressure
    }

    /// Take the seed and everything inside its window out of the buffer, in time order.
    fn sweep(&self, seed: Digi, buffer: &mut TimeOrderedBuffer) -> Vec<Digi> {
        let window_end = seed.time + self.config.window_ns;
        let mut candidates = vec![seed];
        match self.config.max_gap_ns {
            None => candidates.extend(buffer.retrieve_up_to(window_end)),
            Some(gap) => {
                let mut last = seed.time;
                while let Some(next) = buffer.peek_front() {
                    if next.time > window_end.min(last + gap) {
                        break;
                    }
                    let Some(digi) = buffer.pop_front() else {
                        break;
                    };
                    last = digi.time;
                    candidates.push(digi);
                }
            }
        }
        candidates
    }

    fn calibrate(&mut self, candidates: Vec<Digi>) -> Vec<Calibrated> {
        let mut calibrated = Vec::with_capacity(candidates.len());
        for digi in candidates {
            match self.calibration.apply(&digi) {
                Some((time, amplitude)) => calibrated.push(Calibrated {
                    digi,
                    time,
                    amplitude,
                }),
                None => {
                    spdlog::debug!(
                        "Excluding digi on channel {} at {} ns: calibration is not a number",
                        digi.channel,
                        digi.time
                    );
                    self.stats.excluded_members += 1;
                    self.stats.discarded_digis += 1;
                }
            }
        }
        calibrated
    }

    fn neighbours(&self, a: &Calibrated, b: &Calibrated) -> bool {
        let strip = &self.config.strip;
        let space = (a.digi.channel as f64 - b.digi.channel as f64).abs() * strip.pitch;
        space <= strip.max_space_dist && (a.time - b.time).abs() <= strip.max_time_dist
    }

    /// Grow a cluster from the first candidate through neighbouring strips.
    ///
    /// Candidates not connected to the cluster are returned so they can seed their own.
    fn strip_members(&self, candidates: Vec<Calibrated>) -> (Vec<Calibrated>, Vec<Digi>) {
        let n = candidates.len();
        let mut in_cluster: BitVec = BitVec::repeat(false, n);
        if n > 0 {
            in_cluster.set(0, true);
        }
        loop {
            let mut grew = false;
            for j in 0..n {
                if in_cluster[j] {
                    continue;
                }
                let connected = (0..n)
                    .any(|i| in_cluster[i] && self.neighbours(&candidates[i], &candidates[j]));
                if connected {
                    in_cluster.set(j, true);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let mut members = Vec::new();
        let mut leftovers = Vec::new();
        for (idx, candidate) in candidates.into_iter().enumerate() {
            if in_cluster[idx] {
                members.push(candidate);
            } else {
                leftovers.push(candidate.digi);
            }
        }
        (members, leftovers)
    }

    fn degenerate(&mut self, seed_time: f64, members: usize, observer: &mut dyn Observer) {
        spdlog::warn!(
            "Skipping degenerate cluster seeded at {} ns with {} members: zero total weight",
            seed_time,
            members
        );
        observer.on_diagnostic(&Diagnostic::DegenerateCluster { seed_time, members });
        self.stats.degenerate += 1;
        self.stats.discarded_digis += members as u64;
    }

    fn emit(
        &mut self,
        seed_time: f64,
        mut members: Vec<Calibrated>,
        sink: &mut dyn ClusterSink,
        observer: &mut dyn Observer,
        drained: bool,
    ) {
        // Every candidate failed calibration; they are already counted as discarded
        if members.is_empty() {
            spdlog::debug!("Dropping window seeded at {} ns: no calibrated members", seed_time);
            return;
        }

        let mut tracker =
            RequirementTracker::new(&self.config.requirements, self.config.pulser.as_ref());
        let mut reference_seen = self.config.reference_channel.is_none();
        for member in members.iter() {
            tracker.observe(&member.digi, member.amplitude);
            if self.config.reference_channel == Some(member.digi.channel) {
                reference_seen = true;
            }
        }

        let policy_holds = self
            .config
            .policy
            .holds(tracker.satisfied_count(), tracker.total());
        let pulser_forced = !(policy_holds && reference_seen) && tracker.pulser_forced();
        let pulser_multiplicity = tracker.pulser_multiplicity();
        if !(policy_holds && reference_seen) && !pulser_forced {
            if policy_holds {
                self.stats.vetoed += 1;
            } else {
                self.stats.suppressed += 1;
            }
            self.stats.discarded_digis += members.len() as u64;
            return;
        }

        let mut truncated = false;
        if members.len() > self.config.max_members {
            let candidates = members.len();
            members.truncate(self.config.max_members);
            spdlog::warn!(
                "Cluster seeded at {} ns has {} candidates, keeping the first {}",
                seed_time,
                candidates,
                self.config.max_members
            );
            observer.on_diagnostic(&Diagnostic::Truncation {
                seed_time,
                candidates,
                kept: members.len(),
            });
            self.stats.truncated += 1;
            self.stats.discarded_digis += (candidates - members.len()) as u64;
            truncated = true;
        }

        let (time, position) = match self.config.mode {
            BuildMode::Coincidence => {
                let sum: f64 = members.iter().map(|m| m.time).sum();
                (sum / members.len() as f64, None)
            }
            BuildMode::Strip => {
                let pitch = self.config.strip.pitch;
                let total_weight: f64 = members.iter().map(|m| m.amplitude).sum();
                if total_weight <= 0.0 || !total_weight.is_finite() {
                    self.degenerate(seed_time, members.len(), observer);
                    return;
                }
                let time: f64 = members.iter().map(|m| m.amplitude * m.time).sum();
                let position: f64 = members
                    .iter()
                    .map(|m| m.amplitude * m.digi.channel as f64 * pitch)
                    .sum();
                (time / total_weight, Some(position / total_weight))
            }
        };

        let mut channel_multiplicity = BTreeMap::new();
        for member in members.iter() {
            *channel_multiplicity.entry(member.digi.channel).or_insert(0) += 1;
        }

        let cluster = Cluster {
            members: members.iter().map(|m| m.digi).collect(),
            time,
            position,
            flags: ClusterFlags {
                pulser_forced,
                truncated,
                drained,
            },
            channel_multiplicity,
            pulser_multiplicity,
        };
        if pulser_forced {
            self.stats.pulser_forced += 1;
        }
        self.stats.clusters += 1;
        observer.on_cluster(&cluster);
        sink.push(cluster);
    }
}
