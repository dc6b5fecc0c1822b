use super::buffer::TimeOrderedBuffer;
use super::builder::WindowClusterBuilder;
use super::cluster::ClusterSink;
use super::config::{Config, DetectorConfig};
use super::decoder::{FrameContext, ProtocolDecoder};
use super::detector::{Detector, DetectorProfile};
use super::digi::Digi;
use super::error::{ConfigError, SchedulerError};
use super::observer::{DiagnosticCounters, Observer, Observers};
use super::timeslice::{Frame, TimesliceSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    AwaitingFirstTimeslice,
    Streaming,
    Draining,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Also decode the overlap frames each timeslice shares with the next one
    pub include_overlap: bool,
    /// Skip the first timeslice of the run without decoding it
    pub discard_first_timeslice: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            include_overlap: false,
            discard_first_timeslice: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub timeslices: u64,
    pub discarded_timeslices: u64,
    pub failed_timeslices: u64,
    pub frames: u64,
    pub masked_frames: u64,
    pub skipped_overlap_frames: u64,
    pub bytes: u64,
}

/// Drives one detector through a run, one timeslice at a time.
///
/// Frames are decoded in (microslice, component) order into the TimeOrderedBuffer, after
/// which the cluster builder consumes every complete window. `finish` force-drains the
/// buffer so nothing is left behind at the end of the run.
#[derive(Debug)]
pub struct FrameScheduler<P: DetectorProfile> {
    name: String,
    state: SchedulerState,
    options: SchedulerOptions,
    decoder: ProtocolDecoder<P>,
    buffer: TimeOrderedBuffer,
    builder: WindowClusterBuilder,
    observers: Observers,
    /// (core, overlap) frame counts, read once from the first processed timeslice
    frame_counts: Option<(usize, usize)>,
    stats: SchedulerStats,
    digis: Vec<Digi>,
}

impl FrameScheduler<Detector> {
    /// Create a scheduler for one configured detector
    pub fn from_config(config: &Config, detector: &DetectorConfig) -> Result<Self, SchedulerError> {
        let profile = detector.build_detector()?;
        let calibration = detector
            .build_calibration()
            .map_err(ConfigError::from)?;
        let decoder = ProtocolDecoder::new(
            profile,
            detector.clocks(),
            config.mask_policy,
            config.sync_policy,
        );
        let builder = WindowClusterBuilder::new(detector.builder.clone(), calibration);
        Ok(Self::new(
            &detector.name,
            decoder,
            builder,
            config.scheduler_options(),
        ))
    }
}

impl<P: DetectorProfile> FrameScheduler<P> {
    pub fn new(
        name: &str,
        decoder: ProtocolDecoder<P>,
        builder: WindowClusterBuilder,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            state: SchedulerState::Idle,
            options,
            decoder,
            buffer: TimeOrderedBuffer::new(),
            builder,
            observers: Observers::default(),
            frame_counts: None,
            stats: SchedulerStats::default(),
            digis: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn counters(&self) -> &DiagnosticCounters {
        &self.observers.counters
    }

    pub fn decoder(&self) -> &ProtocolDecoder<P> {
        &self.decoder
    }

    pub fn builder(&self) -> &WindowClusterBuilder {
        &self.builder
    }

    pub fn buffer(&self) -> &TimeOrderedBuffer {
        &self.buffer
    }

    /// Attach an external observer (monitoring, histogramming)
    pub fn subscribe(&mut self, observer: Box<dyn Observer + Send>) {
        self.observers.subscribe(observer);
    }

    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::InvalidState(self.state));
        }
        spdlog::info!(
            "Starting {} with options {:?}",
            self.name,
            self.options
        );
        self.state = SchedulerState::AwaitingFirstTimeslice;
        Ok(())
    }

    /// Decode one timeslice and build every cluster that became complete.
    ///
    /// Returns Ok(false) if any frame of the timeslice had to be skipped. Only a fatal protocol
    /// error is returned as Err; the run should then be finished and aborted.
    pub fn process_timeslice(
        &mut self,
        timeslice: &dyn TimesliceSource,
        sink: &mut dyn ClusterSink,
    ) -> Result<bool, SchedulerError> {
        match self.state {
            SchedulerState::AwaitingFirstTimeslice => {
                self.state = SchedulerState::Streaming;
                if self.options.discard_first_timeslice {
                    spdlog::info!(
                        "{}: discarding first timeslice {} of the run",
                        self.name,
                        timeslice.index()
                    );
                    self.stats.discarded_timeslices += 1;
                    return Ok(true);
                }
            }
            SchedulerState::Streaming => (),
            state => return Err(SchedulerError::InvalidState(state)),
        }

        if timeslice.num_components() == 0 {
            spdlog::debug!("{}: timeslice {} is empty", self.name, timeslice.index());
            self.stats.timeslices += 1;
            return Ok(true);
        }

        let (n_core, n_overlap) = match self.frame_counts {
            Some(counts) => counts,
            None => {
                let n_core = timeslice.num_core_microslices();
                let n_overlap = timeslice.num_microslices(0).saturating_sub(n_core);
                spdlog::info!(
                    "{}: timeslices have {} core and {} overlap microslices",
                    self.name,
                    n_core,
                    n_overlap
                );
                self.frame_counts = Some((n_core, n_overlap));
                (n_core, n_overlap)
            }
        };
        let n_frames = if self.options.include_overlap {
            n_core + n_overlap
        } else {
            self.stats.skipped_overlap_frames += (n_overlap * timeslice.num_components()) as u64;
            n_core
        };

        let ts_index = timeslice.index();
        self.decoder.begin_timeslice(ts_index);
        let mut success = true;
        for ms_index in 0..n_frames {
            for component in 0..timeslice.num_components() {
                if self.decoder.is_masked(component) {
                    self.stats.masked_frames += 1;
                    continue;
                }
                let (descriptor, content) = match (
                    timeslice.descriptor(component, ms_index),
                    timeslice.content(component, ms_index),
                ) {
                    (Some(descriptor), Some(content)) => (descriptor, content),
                    _ => {
                        spdlog::warn!(
                            "{}: component {} of timeslice {} has no microslice {}",
                            self.name,
                            component,
                            ts_index,
                            ms_index
                        );
                        success = false;
                        continue;
                    }
                };

                let ctx = FrameContext {
                    timeslice: ts_index,
                    component,
                    equipment_id: descriptor.equipment_id,
                    frame: Frame {
                        index: ms_index,
                        start_time: descriptor.index,
                        byte_size: content.len(),
                        is_overlap: ms_index >= n_core,
                    },
                };
                self.stats.frames += 1;
                self.stats.bytes += content.len() as u64;
                let decoded =
                    self.decoder
                        .process_frame(&ctx, content, &mut self.digis, &mut self.observers);
                // Digis decoded ahead of a fatal word still belong to the run
                self.buffer.extend(self.digis.drain(..));
                success &= decoded?;
            }
        }

        self.builder
            .process(&mut self.buffer, sink, &mut self.observers, false);
        self.stats.timeslices += 1;
        if !success {
            self.stats.failed_timeslices += 1;
        }
        Ok(success)
    }

    /// Force-drain the buffer and end the run. Returns the number of clusters built while
    /// draining.
    pub fn finish(&mut self, sink: &mut dyn ClusterSink) -> Result<usize, SchedulerError> {
        match self.state {
            SchedulerState::Draining | SchedulerState::Finished => {
                return Err(SchedulerError::InvalidState(self.state))
            }
            _ => self.state = SchedulerState::Draining,
        }

        let drained = self
            .builder
            .process(&mut self.buffer, sink, &mut self.observers, true);
        self.log_summary();
        self.state = SchedulerState::Finished;
        Ok(drained)
    }

    fn log_summary(&self) {
        let decoder = self.decoder.stats();
        let builder = self.builder.stats();
        let counters = &self.observers.counters;
        spdlog::info!(
            "{}: processed {} timeslices ({} discarded, {} with skipped frames), {} frames, {}",
            self.name,
            self.stats.timeslices,
            self.stats.discarded_timeslices,
            self.stats.failed_timeslices,
            self.stats.frames,
            human_bytes::human_bytes(self.stats.bytes as f64)
        );
        spdlog::info!(
            "{}: {} digis, {} clusters ({} pulser forced, {} truncated), {} late arrivals",
            self.name,
            counters.digis,
            counters.clusters,
            builder.pulser_forced,
            builder.truncated,
            self.buffer.late_arrivals()
        );
        spdlog::info!(
            "{}: {} duplicate messages, {} hits without marker, {} unmapped hits, {} dropped hits",
            self.name,
            decoder.duplicates,
            decoder.hits_without_marker,
            decoder.unmapped_hits,
            decoder.dropped_hits
        );
        spdlog::info!(
            "{}: diagnostics: {} format errors, {} unknown sources, {} epoch wraps, {} epoch discontinuities, {} degenerate clusters, {} truncations",
            self.name,
            counters.format_errors,
            counters.unknown_sources,
            counters.epoch_wraps,
            counters.epoch_discontinuities,
            counters.degenerate_clusters,
            counters.truncations
        );
    }
}
