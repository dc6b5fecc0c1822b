use bit_set::BitSet;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::detector::DetectorProfile;
use super::digi::Digi;
use super::epoch::{EpochState, MarkerOutcome, SourceClock};
use super::error::DecoderError;
use super::message::{frame_words, RawMessage};
use super::observer::{Diagnostic, Observer};
use super::timeslice::Frame;

/// What to do with a component that delivered data from an unconfigured board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MaskPolicy {
    /// Warn once, then ignore the component for the rest of the run
    #[default]
    Permanent,
    /// Warn once, ignore the component for this many timeslices, then look again
    RetryAfter(u64),
}

/// How a source picks its cycle count when it sees the first marker of a timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncPolicy {
    /// Anchor the cycle count on the frame start time from the microslice header
    #[default]
    FrameStart,
    /// Keep the cycle count accumulated during the run
    Continue,
}

/// Counters kept by the decoder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub skipped_frames: u64,
    pub bytes: u64,
    pub messages: u64,
    pub duplicates: u64,
    pub hits_without_marker: u64,
    pub dropped_hits: u64,
    pub unmapped_hits: u64,
    pub digis: u64,
}

/// Where the frame being decoded comes from. Used for log and diagnostic context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub timeslice: u64,
    pub component: usize,
    pub equipment_id: u32,
    pub frame: Frame,
}

/// Clock and slow counter state of a single readout board
#[derive(Debug, Clone)]
pub struct SourceDecoder {
    pub clock: SourceClock,
    pub epoch: EpochState,
}

impl SourceDecoder {
    pub fn new(clock: SourceClock) -> Self {
        let epoch = EpochState::new(clock.cycle_range);
        Self { clock, epoch }
    }
}

/// Decodes frames of fixed-width messages into digis with reconstructed global time.
///
/// Owns one SourceDecoder per configured board. A component that delivers data from an
/// unknown board is masked according to the MaskPolicy.
#[derive(Debug)]
pub struct ProtocolDecoder<P: DetectorProfile> {
    profile: P,
    sources: FxHashMap<u32, SourceDecoder>,
    masked: BitSet,
    masked_at: FxHashMap<usize, u64>,
    mask_policy: MaskPolicy,
    sync_policy: SyncPolicy,
    stats: DecoderStats,
}

impl<P: DetectorProfile> ProtocolDecoder<P> {
    pub fn new(
        profile: P,
        sources: Vec<(u32, SourceClock)>,
        mask_policy: MaskPolicy,
        sync_policy: SyncPolicy,
    ) -> Self {
        Self {
            profile,
            sources: sources
                .into_iter()
                .map(|(eq, clock)| (eq, SourceDecoder::new(clock)))
                .collect(),
            masked: BitSet::new(),
            masked_at: FxHashMap::default(),
            mask_policy,
            sync_policy,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    pub fn source(&self, equipment_id: u32) -> Option<&SourceDecoder> {
        self.sources.get(&equipment_id)
    }

    pub fn is_masked(&self, component: usize) -> bool {
        self.masked.contains(component)
    }

    /// Reset every source to AwaitingFirstMarker and release masks whose retry delay expired.
    pub fn begin_timeslice(&mut self, timeslice: u64) {
        for source in self.sources.values_mut() {
            source.epoch.begin_timeslice();
        }

        if let MaskPolicy::RetryAfter(delay) = self.mask_policy {
            let expired: Vec<usize> = self
                .masked_at
                .iter()
                .filter(|(_, since)| timeslice >= **since + delay)
                .map(|(component, _)| *component)
                .collect();
            for component in expired {
                spdlog::debug!(
                    "Unmasking component {} at timeslice {} after retry delay",
                    component,
                    timeslice
                );
                self.masked.remove(component);
                self.masked_at.remove(&component);
            }
        }
    }

    /// Decode one frame and append the resulting digis to `out`.
    ///
    /// Returns Ok(false) if the frame was skipped (masked component, unknown board, malformed
    /// frame). Only a message tag outside the known set is returned as an error.
    pub fn process_frame(
        &mut self,
        ctx: &FrameContext,
        bytes: &[u8],
        out: &mut Vec<Digi>,
        observer: &mut dyn Observer,
    ) -> Result<bool, DecoderError> {
        if self.masked.contains(ctx.component) {
            self.stats.skipped_frames += 1;
            return Ok(false);
        }

        let Self {
            profile,
            sources,
            masked,
            masked_at,
            mask_policy,
            sync_policy,
            stats,
        } = self;
        let Some(source) = sources.get_mut(&ctx.equipment_id) else {
            let e = DecoderError::UnknownSource {
                equipment_id: ctx.equipment_id,
                component: ctx.component,
            };
            spdlog::warn!(
                "{} (timeslice {}, frame {}); masking component {} (policy {:?})",
                e,
                ctx.timeslice,
                ctx.frame.index,
                ctx.component,
                mask_policy
            );
            observer.on_diagnostic(&Diagnostic::UnknownSource {
                equipment_id: ctx.equipment_id,
                component: ctx.component,
                timeslice: ctx.timeslice,
            });
            masked.insert(ctx.component);
            masked_at.insert(ctx.component, ctx.timeslice);
            stats.skipped_frames += 1;
            return Ok(false);
        };

        let words = match frame_words(bytes) {
            Ok(words) => words,
            Err(e) => {
                spdlog::warn!(
                    "Skipping frame {} of timeslice {} from equipment 0x{:04x}: {}",
                    ctx.frame.index,
                    ctx.timeslice,
                    ctx.equipment_id,
                    e
                );
                observer.on_diagnostic(&Diagnostic::FormatError {
                    equipment_id: ctx.equipment_id,
                    timeslice: ctx.timeslice,
                    frame: ctx.frame.index,
                    size: bytes.len(),
                });
                stats.skipped_frames += 1;
                return Ok(false);
            }
        };

        stats.frames += 1;
        stats.bytes += bytes.len() as u64;

        let mut previous: Option<u64> = None;
        for word in words {
            // The readout occasionally repeats a word back to back
            if previous == Some(word) {
                stats.duplicates += 1;
                continue;
            }
            previous = Some(word);
            stats.messages += 1;

            let message = match RawMessage::from_word(word) {
                Ok(message) => message,
                Err(error) => {
                    spdlog::error!(
                        "Fatal protocol error from equipment 0x{:04x} in timeslice {}, frame {}: {}",
                        ctx.equipment_id,
                        ctx.timeslice,
                        ctx.frame.index,
                        error
                    );
                    observer.on_diagnostic(&Diagnostic::FatalProtocol {
                        equipment_id: ctx.equipment_id,
                        timeslice: ctx.timeslice,
                        frame: ctx.frame.index,
                    });
                    return Err(DecoderError::FatalProtocol {
                        equipment_id: ctx.equipment_id,
                        timeslice: ctx.timeslice,
                        frame: ctx.frame.index,
                        error,
                    });
                }
            };

            match message {
                RawMessage::Hit {
                    channel,
                    amplitude,
                    coarse_time,
                } => {
                    if !source.epoch.is_synced() {
                        stats.hits_without_marker += 1;
                        continue;
                    }
                    let (raw_channel, amplitude) = match profile.decode_hit(channel, amplitude) {
                        Some(decoded) => decoded,
                        None => {
                            stats.dropped_hits += 1;
                            continue;
                        }
                    };
                    let (channel, side) = match profile.map_channel(ctx.equipment_id, raw_channel)
                    {
                        Some(mapped) => mapped,
                        None => {
                            stats.unmapped_hits += 1;
                            continue;
                        }
                    };
                    let time = source.clock.global_time(&source.epoch, coarse_time);
                    let digi = Digi::new(ctx.equipment_id, channel, side, time, amplitude);
                    observer.on_digi(&digi);
                    stats.digis += 1;
                    out.push(digi);
                }
                RawMessage::Epoch { value } | RawMessage::TsMsb { value } => {
                    let outcome = if !source.epoch.is_synced()
                        && *sync_policy == SyncPolicy::FrameStart
                    {
                        let anchor = source.clock.anchor_index(ctx.frame.start_time);
                        source.epoch.sync_to_anchor(value, anchor)
                    } else {
                        source.epoch.observe(value)
                    };
                    match outcome {
                        MarkerOutcome::Wrapped => {
                            spdlog::info!(
                                "Marker counter of equipment 0x{:04x} wrapped, cycle {} (timeslice {}, frame {})",
                                ctx.equipment_id,
                                source.epoch.cycle_count(),
                                ctx.timeslice,
                                ctx.frame.index
                            );
                            observer.on_epoch_wrap(ctx.equipment_id, source.epoch.cycle_count());
                        }
                        MarkerOutcome::UnexpectedJump { previous, current } => {
                            spdlog::warn!(
                                "Unexpected marker jump on equipment 0x{:04x}: {} -> {}, counted as wrap to cycle {} (timeslice {}, frame {})",
                                ctx.equipment_id,
                                previous,
                                current,
                                source.epoch.cycle_count(),
                                ctx.timeslice,
                                ctx.frame.index
                            );
                            observer.on_epoch_wrap(ctx.equipment_id, source.epoch.cycle_count());
                            observer.on_diagnostic(&Diagnostic::EpochDiscontinuity {
                                equipment_id: ctx.equipment_id,
                                timeslice: ctx.timeslice,
                                frame: ctx.frame.index,
                                previous,
                                current,
                            });
                        }
                        MarkerOutcome::First
                        | MarkerOutcome::Repeated
                        | MarkerOutcome::Advanced => (),
                    }
                }
                RawMessage::Status { flags } => observer.on_status(ctx.equipment_id, flags),
                RawMessage::Empty | RawMessage::Dummy => (),
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Detector, DetectorKind};
    use crate::hardware_id::Side;
    use crate::message::encode_frame;
    use crate::observer::DiagnosticCounters;

    const EQ: u32 = 0xabc0;

    fn unit_clock() -> SourceClock {
        SourceClock {
            bin_width_ns: 1.0,
            counter_range: 100,
            cycle_range: 16,
            time_offset_ns: 0.0,
        }
    }

    fn decoder(sync_policy: SyncPolicy) -> ProtocolDecoder<Detector> {
        ProtocolDecoder::new(
            Detector::new(DetectorKind::Bmon, vec![EQ], None),
            vec![(EQ, unit_clock())],
            MaskPolicy::Permanent,
            sync_policy,
        )
    }

    fn context(component: usize, equipment_id: u32, frame: usize, start_time: u64) -> FrameContext {
        FrameContext {
            timeslice: 1,
            component,
            equipment_id,
            frame: Frame {
                index: frame,
                start_time,
                byte_size: 0,
                is_overlap: false,
            },
        }
    }

    fn hit(channel: u16, amplitude: u16, coarse_time: u32) -> RawMessage {
        RawMessage::Hit {
            channel,
            amplitude,
            coarse_time,
        }
    }

    #[test]
    fn test_hits_get_global_time() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[
            RawMessage::Epoch { value: 3 },
            hit(2, 50, 7),
            RawMessage::Epoch { value: 4 },
            hit(5, 60, 99),
            RawMessage::Empty,
        ]);
        let ok = dec
            .process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert!(ok);
        assert_eq!(digis.len(), 2);
        assert_eq!(digis[0], Digi::new(EQ, 2, Side::A, 307.0, 50.0));
        assert_eq!(digis[1].time, 499.0);
        assert_eq!(counters.digis, 2);
    }

    #[test]
    fn test_hits_before_first_marker_are_dropped() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[hit(1, 10, 1), RawMessage::Epoch { value: 0 }, hit(1, 10, 2)]);
        dec.process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert_eq!(digis.len(), 1);
        assert_eq!(dec.stats().hits_without_marker, 1);
    }

    #[test]
    fn test_wrap_across_frames_keeps_time_monotonic() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let first = encode_frame(&[RawMessage::Epoch { value: 15 }, hit(0, 1, 50)]);
        let second = encode_frame(&[RawMessage::Epoch { value: 0 }, hit(0, 1, 10)]);
        dec.process_frame(&context(0, EQ, 0, 0), &first, &mut digis, &mut counters)
            .unwrap();
        dec.process_frame(&context(0, EQ, 1, 0), &second, &mut digis, &mut counters)
            .unwrap();
        assert_eq!(digis[0].time, 1550.0);
        assert_eq!(digis[1].time, 1610.0);
        assert_eq!(counters.epoch_wraps, 1);
        assert_eq!(counters.epoch_discontinuities, 0);
    }

    #[test]
    fn test_unexpected_jump_is_reported_and_decoding_continues() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[
            RawMessage::Epoch { value: 9 },
            RawMessage::Epoch { value: 4 },
            hit(0, 1, 0),
        ]);
        dec.process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert_eq!(counters.epoch_discontinuities, 1);
        assert_eq!(digis.len(), 1);
        assert_eq!(digis[0].time, (4 + 16) as f64 * 100.0);
    }

    #[test]
    fn test_frame_start_anchor() {
        let mut dec = decoder(SyncPolicy::FrameStart);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        // Frame starts at marker index 33 (cycle 2, value 1); marker says 1
        let bytes = encode_frame(&[RawMessage::TsMsb { value: 1 }, hit(0, 1, 5)]);
        dec.process_frame(&context(0, EQ, 0, 3_300), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert_eq!(digis[0].time, 3_305.0);
    }

    #[test]
    fn test_unknown_source_warns_once_and_masks() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[RawMessage::Epoch { value: 1 }, hit(0, 1, 5)]);
        for frame in 0..3 {
            let ok = dec
                .process_frame(&context(4, 0xdead, frame, 0), &bytes, &mut digis, &mut counters)
                .unwrap();
            assert!(!ok);
        }
        assert!(dec.is_masked(4));
        assert_eq!(counters.unknown_sources, 1);
        assert!(digis.is_empty());
        // The mask is per component; the known board keeps decoding
        assert!(dec
            .process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap());
    }

    #[test]
    fn test_retry_policy_unmasks() {
        let mut dec = ProtocolDecoder::new(
            Detector::new(DetectorKind::Bmon, vec![EQ], None),
            vec![(EQ, unit_clock())],
            MaskPolicy::RetryAfter(2),
            SyncPolicy::Continue,
        );
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[RawMessage::Epoch { value: 1 }]);
        dec.process_frame(&context(1, 0xdead, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert!(dec.is_masked(1));
        dec.begin_timeslice(2);
        assert!(dec.is_masked(1));
        dec.begin_timeslice(3);
        assert!(!dec.is_masked(1));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let mut bytes = encode_frame(&[RawMessage::Epoch { value: 1 }, hit(0, 1, 5)]);
        bytes.truncate(13);
        let ok = dec
            .process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert!(!ok);
        assert_eq!(counters.format_errors, 1);
        assert!(digis.is_empty());
        assert!(!dec.is_masked(0));
    }

    #[test]
    fn test_unknown_tag_escalates() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let mut bytes = encode_frame(&[RawMessage::Epoch { value: 1 }]);
        bytes.extend_from_slice(&0xF000_0000_0000_0000u64.to_le_bytes());
        let result = dec.process_frame(&context(0, EQ, 2, 0), &bytes, &mut digis, &mut counters);
        assert!(matches!(
            result,
            Err(DecoderError::FatalProtocol { frame: 2, .. })
        ));
        assert_eq!(counters.fatal_errors, 1);
    }

    #[test]
    fn test_duplicate_words_are_skipped() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[RawMessage::Epoch { value: 1 }, hit(0, 1, 5), hit(0, 1, 5)]);
        dec.process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert_eq!(digis.len(), 1);
        assert_eq!(dec.stats().duplicates, 1);
    }

    #[test]
    fn test_status_messages_reach_observer() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let bytes = encode_frame(&[
            RawMessage::Status { flags: 0x3 },
            RawMessage::Epoch { value: 1 },
            RawMessage::Status { flags: 0x8 },
            hit(0, 1, 5),
            RawMessage::Dummy,
        ]);
        let ok = dec
            .process_frame(&context(0, EQ, 0, 0), &bytes, &mut digis, &mut counters)
            .unwrap();
        assert!(ok);
        assert_eq!(counters.status_messages, 2);
        assert_eq!(digis.len(), 1);
    }

    #[test]
    fn test_unknown_source_is_masked_before_format_check() {
        let mut dec = decoder(SyncPolicy::Continue);
        let mut counters = DiagnosticCounters::default();
        let mut digis = Vec::new();
        let ok = dec
            .process_frame(&context(2, 0xbeef, 0, 0), &[0u8; 5], &mut digis, &mut counters)
            .unwrap();
        assert!(!ok);
        assert!(dec.is_masked(2));
        assert_eq!(counters.unknown_sources, 1);
        assert_eq!(counters.format_errors, 0);
        assert_eq!(dec.stats().skipped_frames, 1);
        assert_eq!(dec.stats().frames, 0);
    }
}
