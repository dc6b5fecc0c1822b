//! # hitstream
//!
//! hitstream is a streaming engine for free-streaming detector readout, written in Rust. It
//! takes timeslices of raw front-end frames, reconstructs time stamped hits (digis) from the
//! fixed-width message stream, orders them in time and groups them into clusters using
//! configurable coincidence rules. Built clusters are handed to a sink; the engine keeps
//! nothing once a cluster leaves.
//!
//! ## Installation
//!
//! In the future we may depoly to crates.io, but currently the only method of install is
//! from source.
//!
//! To build and install the CLI use `cargo install --path ./hitstream_cli` from the top
//! level hitstream repository.
//!
//! ## Pipeline
//!
//! For each detector a [`scheduler::FrameScheduler`] pulls frames out of a timeslice in
//! (microslice, component) order:
//!
//! - [`decoder::ProtocolDecoder`] splits each frame into 8 byte messages, keeps one
//!   [`epoch::EpochState`] per readout board and turns hit messages into
//!   [`digi::Digi`]s with a global time in ns.
//! - [`buffer::TimeOrderedBuffer`] keeps the digis of all boards in time order.
//! - [`builder::WindowClusterBuilder`] seeds a window on the earliest digi, sweeps the
//!   window and emits a [`cluster::Cluster`] if the requirements hold.
//!
//! The first timeslice of a run is discarded by default, and overlap microslices are only
//! decoded when `include_overlap` is set. At the end of a run the buffer is force-drained.
//!
//! Detector specifics live behind [`detector::DetectorProfile`]; the supported detectors are
//! the beam monitor (`Bmon`), the timing RPC wall (`Tof`), the fiber hodoscope
//! (`Hodoscope`) and the silicon strips (`Sts`).
//!
//! ## Configuration
//!
//! Configurations are YAML files. A template can be generated with `hitstream_cli new`.
//!
//! ```yml
//! archive_path: None
//! include_overlap: false
//! discard_first_timeslice: true
//! mask_policy: Permanent
//! sync_policy: FrameStart
//! detectors:
//! - name: bmon
//!   kind: Bmon
//!   channel_map_path: null
//!   sources:
//!   - equipment_id: 43968
//!     bin_width_ns: 0.1953125
//!     counter_range: 131072
//!     cycle_range: 16777216
//!     time_offset_ns: 0.0
//!   builder:
//!     mode: Coincidence
//!     window_ns: 10.0
//!     max_gap_ns: null
//!     max_members: 100
//!     policy: !AtLeast 1
//!     reference_channel: null
//!     requirements:
//!     - kind: Presence
//!       channel: 0
//!       side: Any
//!     pulser: null
//!     strip:
//!       pitch: 1.0
//!       max_space_dist: 1.5
//!       max_time_dist: 1.0
//!     high_water_mark: 1000000
//!   calibration: []
//! ```
//!
//! `mask_policy` may also be `!RetryAfter n` to look at a masked component again after n
//! timeslices. `sync_policy: Continue` keeps the marker cycle count across timeslices
//! instead of anchoring it on the microslice start time.
//!
//! ### Channel Map Format
//!
//! The channel map is a CSV file with *no* whitespaces. The columns are as follows:
//!
//! ```csv
//! equipment,raw_channel,channel,side
//! ```
//!
//! The equipment id may be given in hex with a `0x` prefix. The side is `A` or `B`. Without
//! a channel map each detector uses its built-in mapping.
//!
//! ## Output
//!
//! The CLI writes a log file `hitstream.log`, which contains the detailed status of each
//! detector worker including every skipped frame and the end of run summary.
pub mod buffer;
pub mod builder;
pub mod calibration;
pub mod channel_map;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod detector;
pub mod digi;
pub mod epoch;
pub mod error;
pub mod hardware_id;
pub mod message;
pub mod observer;
pub mod process;
pub mod requirement;
pub mod scheduler;
pub mod timeslice;
pub mod worker_status;
