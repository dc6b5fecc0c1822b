use super::cluster::Cluster;
use super::digi::Digi;

/// Structural conditions the engine reports besides its regular output.
///
/// None of these stop processing; FatalProtocol is reported right before the error is
/// returned to run control.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    FormatError {
        equipment_id: u32,
        timeslice: u64,
        frame: usize,
        size: usize,
    },
    UnknownSource {
        equipment_id: u32,
        component: usize,
        timeslice: u64,
    },
    EpochDiscontinuity {
        equipment_id: u32,
        timeslice: u64,
        frame: usize,
        previous: u64,
        current: u64,
    },
    DegenerateCluster {
        seed_time: f64,
        members: usize,
    },
    Truncation {
        seed_time: f64,
        candidates: usize,
        kept: usize,
    },
    FatalProtocol {
        equipment_id: u32,
        timeslice: u64,
        frame: usize,
    },
}

/// Notification interface called after each structural event.
///
/// Monitoring (histograms, rates, spill detection) subscribes here and stays out of the
/// decode and clustering code.
pub trait Observer {
    fn on_digi(&mut self, _digi: &Digi) {}
    fn on_cluster(&mut self, _cluster: &Cluster) {}
    fn on_status(&mut self, _equipment_id: u32, _flags: u32) {}
    fn on_epoch_wrap(&mut self, _equipment_id: u32, _cycle_count: u64) {}
    fn on_diagnostic(&mut self, _diagnostic: &Diagnostic) {}
}

/// Counts every notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticCounters {
    pub digis: u64,
    pub clusters: u64,
    pub status_messages: u64,
    pub epoch_wraps: u64,
    pub format_errors: u64,
    pub unknown_sources: u64,
    pub epoch_discontinuities: u64,
    pub degenerate_clusters: u64,
    pub truncations: u64,
    pub fatal_errors: u64,
}

impl Observer for DiagnosticCounters {
    fn on_digi(&mut self, _digi: &Digi) {
        self.digis += 1;
    }

    fn on_cluster(&mut self, _cluster: &Cluster) {
        self.clusters += 1;
    }

    fn on_status(&mut self, _equipment_id: u32, _flags: u32) {
        self.status_messages += 1;
    }

    fn on_epoch_wrap(&mut self, _equipment_id: u32, _cycle_count: u64) {
        self.epoch_wraps += 1;
    }

    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::FormatError { .. } => self.format_errors += 1,
            Diagnostic::UnknownSource { .. } => self.unknown_sources += 1,
            Diagnostic::EpochDiscontinuity { .. } => self.epoch_discontinuities += 1,
            Diagnostic::DegenerateCluster { .. } => self.degenerate_clusters += 1,
            Diagnostic::Truncation { .. } => self.truncations += 1,
            Diagnostic::FatalProtocol { .. } => self.fatal_errors += 1,
        }
    }
}

/// Counters plus any number of external subscribers
#[derive(Default)]
pub struct Observers {
    pub counters: DiagnosticCounters,
    subscribers: Vec<Box<dyn Observer + Send>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("counters", &self.counters)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Observers {
    pub fn subscribe(&mut self, observer: Box<dyn Observer + Send>) {
        self.subscribers.push(observer);
    }
}

impl Observer for Observers {
    fn on_digi(&mut self, digi: &Digi) {
        self.counters.on_digi(digi);
        self.subscribers.iter_mut().for_each(|s| s.on_digi(digi));
    }

    fn on_cluster(&mut self, cluster: &Cluster) {
        self.counters.on_cluster(cluster);
        self.subscribers.iter_mut().for_each(|s| s.on_cluster(cluster));
    }

    fn on_status(&mut self, equipment_id: u32, flags: u32) {
        self.counters.on_status(equipment_id, flags);
        self.subscribers
            .iter_mut()
            .for_each(|s| s.on_status(equipment_id, flags));
    }

    fn on_epoch_wrap(&mut self, equipment_id: u32, cycle_count: u64) {
        self.counters.on_epoch_wrap(equipment_id, cycle_count);
        self.subscribers
            .iter_mut()
            .for_each(|s| s.on_epoch_wrap(equipment_id, cycle_count));
    }

    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.counters.on_diagnostic(diagnostic);
        self.subscribers
            .iter_mut()
            .for_each(|s| s.on_diagnostic(diagnostic));
    }
}
