mod archive;

use archive::ArchiveReader;
use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use libhitstream::config::{Config, DetectorConfig};
use libhitstream::error::ProcessorError;
use libhitstream::process::{process_detectors, RunSummary};
use libhitstream::timeslice::OwnedTimeslice;
use libhitstream::worker_status::{BarColor, WorkerStatus};

fn make_template_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

/// Send everything the engine logs to ./hitstream.log
fn init_file_logger() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./hitstream.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn open_archive(
    path: &Path,
    detector: &DetectorConfig,
) -> Result<
    (
        impl Iterator<Item = Result<OwnedTimeslice, ProcessorError>>,
        usize,
    ),
    ProcessorError,
> {
    let reader =
        ArchiveReader::open(path).map_err(|e| ProcessorError::SourceError(Box::new(e)))?;
    spdlog::info!(
        "Opened {} with {} timeslices for detector {}",
        path.to_string_lossy(),
        reader.len(),
        detector.name
    );
    if reader.is_empty() {
        spdlog::warn!("{} holds no timeslices", path.to_string_lossy());
    }
    let n_timeslices = reader.len();
    let timeslices =
        reader.map(|result| result.map_err(|e| ProcessorError::SourceError(Box::new(e))));
    Ok((timeslices, n_timeslices))
}

fn bar_style(color: BarColor) -> ProgressStyle {
    let color = match color {
        BarColor::CYAN => "cyan",
        BarColor::MAGENTA => "magenta",
        BarColor::RED => "red",
        BarColor::GREEN => "green",
    };
    ProgressStyle::with_template(&format!(
        "{{msg:>12}} [{{bar:40.{color}/blue}}] {{pos:>3}}%"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn report(summary: &RunSummary) {
    log::info!(
        "{}: {} timeslices, {} frames ({}), {} digis, {} clusters ({} truncated, {} pulser forced)",
        summary.detector,
        summary.stats.timeslices,
        summary.stats.frames,
        human_bytes::human_bytes(summary.stats.bytes as f64),
        summary.counters.digis,
        summary.sink.clusters,
        summary.sink.truncated,
        summary.sink.pulser_forced
    );
    let counters = &summary.counters;
    let problems = counters.format_errors
        + counters.unknown_sources
        + counters.epoch_discontinuities
        + counters.degenerate_clusters;
    if problems > 0 {
        log::warn!(
            "{}: {} recoverable problems were found, check hitstream.log for details",
            summary.detector,
            problems
        );
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("hitstream_cli")
        .about("Replay recorded timeslice archives through the hitstream engine")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("run").about("Process the archive named in the configuration"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let file_logging = init_file_logger();
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }
    if let Err(e) = file_logging {
        log::warn!("Could not create hitstream.log, engine messages go to the terminal: {e}");
    }

    // Parse the cli
    let Some(path) = matches.get_one::<String>("path") else {
        log::error!("A configuration file is required, use --path");
        return;
    };
    let config_path = PathBuf::from(path);

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write the template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    if let Err(e) = config.validate() {
        log::error!("{e}");
        return;
    }
    log::info!("Config successfully loaded.");
    log::info!("Archive Path: {}", config.archive_path.to_string_lossy());
    log::info!(
        "Include Overlap: {} Discard First Timeslice: {}",
        config.include_overlap,
        config.discard_first_timeslice
    );
    log::info!(
        "Mask Policy: {:?} Sync Policy: {:?}",
        config.mask_policy,
        config.sync_policy
    );
    for detector in config.detectors.iter() {
        log::info!(
            "Detector {}: {:?} with {} source(s), {:?} clustering",
            detector.name,
            detector.kind,
            detector.sources.len(),
            detector.builder.mode
        );
    }
    if !config.has_archive() {
        log::error!(
            "Archive {} does not exist!",
            config.archive_path.to_string_lossy()
        );
        return;
    }

    // Setup one progress bar per detector worker
    let bars: Vec<ProgressBar> = config
        .detectors
        .iter()
        .map(|detector| {
            let pb = pb_manager.add(ProgressBar::new(100));
            pb.set_style(bar_style(BarColor::CYAN));
            pb.set_message(detector.name.clone());
            pb
        })
        .collect();

    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let archive_path = config.archive_path.clone();
    // Spawn the task!
    let handle = std::thread::spawn(move || {
        process_detectors(
            &config,
            |detector: &DetectorConfig| open_archive(&archive_path, detector),
            tx,
        )
    });

    // The channel closes once every worker is done
    for status in rx.iter() {
        if let Some(pb) = bars.get(status.worker_id) {
            pb.set_style(bar_style(status.color));
            pb.set_position((status.progress * 100.0) as u64);
        }
    }
    bars.iter().for_each(|pb| pb.finish());

    match handle.join() {
        Ok(Ok(summaries)) => {
            summaries.iter().for_each(report);
            log::info!("Successfully processed archive!");
        }
        Ok(Err(e)) => log::error!("Processing failed with error: {e}"),
        Err(_) => log::error!("Failed to join processing task!"),
    }

    log::info!("Done.");
}
