use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use super::digi::Digi;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterFlags {
    /// Emitted only because of the pulser override
    pub pulser_forced: bool,
    /// More candidates than max_members were found; the tail was discarded
    pub truncated: bool,
    /// Built during the end of run drain, window may be incomplete
    pub drained: bool,
}

/// A group of digis judged to come from one physical occurrence.
///
/// Clusters are handed to a ClusterSink as soon as they are built and are never kept by the
/// engine afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub members: Vec<Digi>,
    /// Aggregated (calibrated) time in ns
    pub time: f64,
    /// Amplitude weighted position, strip clusters only
    pub position: Option<f64>,
    pub flags: ClusterFlags,
    /// channel -> number of member digis on it
    pub channel_multiplicity: BTreeMap<u32, u32>,
    /// Number of requirement channels that saw a pulser-like digi
    pub pulser_multiplicity: usize,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn seed_time(&self) -> Option<f64> {
        self.members.first().map(|digi| digi.time)
    }
}

/// Downstream collaborator receiving built clusters
pub trait ClusterSink {
    fn push(&mut self, cluster: Cluster);
}

impl ClusterSink for Vec<Cluster> {
    fn push(&mut self, cluster: Cluster) {
        Vec::push(self, cluster);
    }
}

impl ClusterSink for Sender<Cluster> {
    fn push(&mut self, cluster: Cluster) {
        if let Err(e) = self.send(cluster) {
            spdlog::error!("Cluster sink disconnected, dropping cluster: {}", e);
        }
    }
}

/// Sink which keeps statistics only
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    pub clusters: u64,
    pub members: u64,
    pub truncated: u64,
    pub pulser_forced: u64,
}

impl ClusterSink for CountingSink {
    fn push(&mut self, cluster: Cluster) {
        self.clusters += 1;
        self.members += cluster.size() as u64;
        if cluster.flags.truncated {
            self.truncated += 1;
        }
        if cluster.flags.pulser_forced {
            self.pulser_forced += 1;
        }
    }
}
