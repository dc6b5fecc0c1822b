use std::sync::mpsc::Sender;

use super::cluster::{ClusterSink, CountingSink};
use super::config::{Config, DetectorConfig};
use super::detector::DetectorProfile;
use super::error::ProcessorError;
use super::observer::DiagnosticCounters;
use super::scheduler::{FrameScheduler, SchedulerStats};
use super::timeslice::TimesliceSource;
use super::worker_status::{BarColor, WorkerStatus};

/// How often progress is reported, as a fraction of the expected timeslices
const PROGRESS_STEP: f32 = 0.01;

/// What a finished run looked like for one detector
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub detector: String,
    pub stats: SchedulerStats,
    pub counters: DiagnosticCounters,
    pub sink: CountingSink,
}

/// The main loop for a single detector.
///
/// Feeds every timeslice to the scheduler in order and reports progress over `tx`: cyan while
/// streaming, magenta while draining, then green (or red if the run was aborted).
/// `n_expected` is only used for progress. Whatever happens, the scheduler is finished so
/// the buffer is drained before returning.
pub fn process_run<P, T, I>(
    scheduler: &mut FrameScheduler<P>,
    timeslices: I,
    n_expected: usize,
    sink: &mut dyn ClusterSink,
    tx: &Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<(), ProcessorError>
where
    P: DetectorProfile,
    T: TimesliceSource,
    I: IntoIterator<Item = Result<T, ProcessorError>>,
{
    let name = scheduler.name().to_string();
    scheduler.start()?;
    tx.send(WorkerStatus::new(0.0, &name, 0, worker_id, BarColor::CYAN))?;

    let mut reported: f32 = 0.0;
    for (count, item) in timeslices.into_iter().enumerate() {
        let result = match item {
            Ok(timeslice) => scheduler
                .process_timeslice(&timeslice, sink)
                .map(|success| (timeslice.index(), success))
                .map_err(ProcessorError::from),
            Err(e) => Err(e),
        };
        let (index, success) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                spdlog::error!("{}: aborting run after error: {}", name, e);
                scheduler.finish(sink)?;
                tx.send(WorkerStatus::new(
                    reported,
                    &name,
                    count as u64,
                    worker_id,
                    BarColor::RED,
                ))?;
                return Err(e);
            }
        };
        if !success {
            spdlog::warn!("{}: timeslice {} had skipped frames", name, index);
        }

        let progress = if n_expected > 0 {
            ((count + 1) as f32 / n_expected as f32).min(1.0)
        } else {
            0.0
        };
        if progress - reported >= PROGRESS_STEP {
            reported = progress;
            tx.send(WorkerStatus::new(
                progress,
                &name,
                index,
                worker_id,
                BarColor::CYAN,
            ))?;
        }
    }

    tx.send(WorkerStatus::new(
        reported,
        &name,
        scheduler.stats().timeslices,
        worker_id,
        BarColor::MAGENTA,
    ))?;
    let drained = scheduler.finish(sink)?;
    spdlog::info!("{}: drained {} clusters at end of run", name, drained);
    tx.send(WorkerStatus::new(
        1.0,
        &name,
        scheduler.stats().timeslices,
        worker_id,
        BarColor::GREEN,
    ))?;
    Ok(())
}

/// Run every configured detector on its own thread.
///
/// `open_source` gives each worker its own stream of timeslices and the number of timeslices
/// it is expected to hold. Clusters are counted, not kept. Workers share nothing but the
/// configuration and the status channel.
pub fn process_detectors<F, T, I>(
    config: &Config,
    open_source: F,
    tx: Sender<WorkerStatus>,
) -> Result<Vec<RunSummary>, ProcessorError>
where
    F: Fn(&DetectorConfig) -> Result<(I, usize), ProcessorError> + Sync,
    T: TimesliceSource,
    I: Iterator<Item = Result<T, ProcessorError>>,
{
    config.validate()?;

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = config
            .detectors
            .iter()
            .enumerate()
            .map(|(worker_id, detector)| {
                let tx = tx.clone();
                let open_source = &open_source;
                scope.spawn(move || -> Result<RunSummary, ProcessorError> {
                    spdlog::info!("Worker {} processing detector {}", worker_id, detector.name);
                    let mut scheduler = FrameScheduler::from_config(config, detector)?;
                    let (timeslices, n_expected) = open_source(detector)?;
                    let mut sink = CountingSink::default();
                    process_run(
                        &mut scheduler,
                        timeslices,
                        n_expected,
                        &mut sink,
                        &tx,
                        worker_id,
                    )?;
                    Ok(RunSummary {
                        detector: detector.name.clone(),
                        stats: *scheduler.stats(),
                        counters: scheduler.counters().clone(),
                        sink,
                    })
                })
            })
            .collect();
        // Join everything before looking at results so no worker is left running
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    results
        .into_iter()
        .zip(config.detectors.iter())
        .map(|(result, detector)| match result {
            Ok(summary) => summary,
            Err(_) => Err(ProcessorError::WorkerPanicked(detector.name.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_frame, RawMessage};
    use crate::timeslice::{MicrosliceDescriptor, OwnedTimeslice};
    use std::sync::mpsc::channel;

    const EQ: u32 = 0xabc0;

    fn config() -> Config {
        let mut config = Config::default();
        config.discard_first_timeslice = false;
        config.detectors[0].sources[0].bin_width_ns = 1.0;
        config.detectors[0].sources[0].counter_range = 100;
        config
    }

    fn timeslice(index: u64) -> OwnedTimeslice {
        let start = index * 1000;
        let content = encode_frame(&[
            RawMessage::Epoch { value: start / 100 },
            RawMessage::Hit {
                channel: 0,
                amplitude: 5,
                coarse_time: 10,
            },
            RawMessage::Hit {
                channel: 3,
                amplitude: 5,
                coarse_time: 500,
            },
        ]);
        let mut ts = OwnedTimeslice::new(index, 1);
        let descriptor = MicrosliceDescriptor {
            equipment_id: EQ,
            index: start,
            ..Default::default()
        };
        ts.push_microslice(0, descriptor, content);
        ts
    }

    #[test]
    fn test_process_detectors() {
        let config = config();
        let (tx, rx) = channel();
        let summaries = process_detectors(
            &config,
            |_| Ok(((0..4).map(|i| Ok(timeslice(i))), 4)),
            tx,
        )
        .unwrap();

        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.detector, "bmon");
        assert_eq!(summary.stats.timeslices, 4);
        assert_eq!(summary.counters.digis, 8);
        // Only channel 0 is required
        assert_eq!(summary.sink.clusters, 4);

        let statuses: Vec<WorkerStatus> = rx.iter().collect();
        assert_eq!(statuses.first().map(|s| s.progress), Some(0.0));
        let colors: Vec<BarColor> = statuses.iter().map(|s| s.color).collect();
        assert_eq!(colors[colors.len() - 2..], [BarColor::MAGENTA, BarColor::GREEN]);
        assert!(statuses
            .last()
            .is_some_and(|s| s.progress == 1.0 && s.color == BarColor::GREEN));
    }

    #[test]
    fn test_source_error_aborts_and_drains() {
        let config = config();
        let (tx, rx) = channel();
        let mut scheduler = FrameScheduler::from_config(&config, &config.detectors[0]).unwrap();
        let mut sink = CountingSink::default();
        let stream = vec![
            Ok(timeslice(0)),
            Err(ProcessorError::SourceError("truncated archive".into())),
            Ok(timeslice(2)),
        ];
        let result = process_run(&mut scheduler, stream, 3, &mut sink, &tx, 0);
        assert!(matches!(result, Err(ProcessorError::SourceError(_))));
        assert_eq!(sink.clusters, 1);
        assert_eq!(scheduler.stats().timeslices, 1);
        drop(tx);
        assert!(rx.iter().any(|s| s.color == BarColor::RED));
    }
}
