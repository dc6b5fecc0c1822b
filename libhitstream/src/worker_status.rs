/// Color of a worker's progress bar, one per phase of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarColor {
    /// Streaming timeslices
    #[default]
    CYAN,
    /// Force-draining the buffer at the end of the run
    MAGENTA,
    /// Run aborted
    RED,
    /// Drained and finished
    GREEN,
}

/// Progress message a worker sends to whoever displays it
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub detector: String,
    pub timeslice: u64,
    pub worker_id: usize,
    pub color: BarColor,
}

impl WorkerStatus {
    pub fn new(
        progress: f32,
        detector: &str,
        timeslice: u64,
        worker_id: usize,
        color: BarColor,
    ) -> Self {
        Self {
            progress,
            detector: detector.to_string(),
            timeslice,
            worker_id,
            color,
        }
    }
}
