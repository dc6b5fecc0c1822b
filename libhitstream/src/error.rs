use std::path::PathBuf;
use thiserror::Error;

use super::constants::MESSAGE_SIZE_BYTES;
use super::scheduler::SchedulerState;
use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message tag {0} is outside the known message enumeration (raw word 0x{1:016x})")]
    UnknownTag(u8, u64),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame of {0} bytes is not a multiple of the message width {size}", size=MESSAGE_SIZE_BYTES)]
    IncorrectFrameSize(usize),
    #[error("Bad message found in frame: {0}")]
    BadMessage(#[from] MessageError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecoderError {
    #[error("Equipment 0x{equipment_id:04x} in component {component} is not configured for this detector")]
    UnknownSource { equipment_id: u32, component: usize },
    #[error("Fatal protocol error from equipment 0x{equipment_id:04x} in timeslice {timeslice}, frame {frame}: {error}")]
    FatalProtocol {
        equipment_id: u32,
        timeslice: u64,
        frame: usize,
        #[source]
        error: MessageError,
    },
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Found invalid detector keyword: {0}")]
    InvalidKeyword(String),
    #[error("Found invalid channel side: {0}")]
    InvalidSide(String),
}

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("ChannelMap failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChannelMap failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("ChannelMap failed to parse a side keyword: {0}")]
    BadSide(#[from] DetectorError),
    #[error("ChannelMap was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalibrationError {
    #[error("Walk curve for channel {0} has an empty amplitude range [{1}, {2})")]
    EmptyWalkRange(u32, f64, f64),
    #[error("Calibration for channel {0} has a non-finite gain {1}")]
    BadGain(u32, f64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config for detector {0} is invalid: {1}")]
    InvalidDetector(String, String),
    #[error("Config failed due to calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("FrameScheduler failed due to decoder error: {0}")]
    DecoderError(#[from] DecoderError),
    #[error("FrameScheduler received a timeslice while in state {0:?}")]
    InvalidState(SchedulerState),
    #[error("FrameScheduler failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("FrameScheduler failed due to ChannelMap error: {0}")]
    MapError(#[from] ChannelMapError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to FrameScheduler error: {0}")]
    SchedulerError(#[from] SchedulerError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to ChannelMap error: {0}")]
    MapError(#[from] ChannelMapError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed because worker for detector {0} panicked")]
    WorkerPanicked(String),
    #[error("Processor failed to read timeslices: {0}")]
    SourceError(Box<dyn std::error::Error + Send + Sync>),
}
