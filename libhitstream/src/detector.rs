use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::channel_map::ChannelMap;
use super::error::DetectorError;
use super::hardware_id::Side;

/// The small set of things the engine needs to know about a detector.
///
/// Everything else (clock handling, buffering, clustering) is shared by all detectors.
pub trait DetectorProfile {
    /// Number of detector channels served by one readout board
    fn channel_count(&self) -> usize;

    /// Turn the raw hit fields into a raw channel and an amplitude.
    ///
    /// None means the hit is not physics data for this detector and is dropped.
    fn decode_hit(&self, raw_channel: u16, raw_amplitude: u16) -> Option<(u16, f64)>;

    /// Map a raw channel of a board to a detector channel and side.
    fn map_channel(&self, equipment_id: u32, raw_channel: u16) -> Option<(u32, Side)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorKind {
    /// Diamond beam monitor, single ended strips read by a TDC
    Bmon,
    /// Double ended timing RPC strips
    Tof,
    /// Two axis fiber hodoscope
    Hodoscope,
    /// Silicon strips
    Sts,
}

impl FromStr for DetectorKind {
    type Err = DetectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bmon" => Ok(Self::Bmon),
            "tof" => Ok(Self::Tof),
            "hodoscope" | "hodo" => Ok(Self::Hodoscope),
            "sts" => Ok(Self::Sts),
            _ => Err(DetectorError::InvalidKeyword(s.to_string())),
        }
    }
}

const BMON_CHANNELS: usize = 16;
const TOF_CHANNELS: usize = 32;
const HODO_FIBERS_PER_AXIS: usize = 64;
const STS_CHANNELS: usize = 128;
// STS-XYTER and the hodoscope front end only deliver a 5 bit ADC
const ADC_5BIT_MASK: u16 = 0x1f;

impl DetectorKind {
    fn raw_channel_count(&self) -> usize {
        match self {
            Self::Bmon => BMON_CHANNELS,
            Self::Tof => 2 * TOF_CHANNELS,
            Self::Hodoscope => 2 * HODO_FIBERS_PER_AXIS,
            Self::Sts => STS_CHANNELS,
        }
    }

    /// Board-local channel and side for a raw channel
    fn local_channel(&self, raw_channel: u16) -> (u32, Side) {
        let raw = raw_channel as u32;
        match self {
            Self::Bmon | Self::Sts => (raw, Side::A),
            Self::Tof => {
                let side = if raw % 2 == 0 { Side::A } else { Side::B };
                (raw / 2, side)
            }
            Self::Hodoscope => {
                let fibers = HODO_FIBERS_PER_AXIS as u32;
                let side = if raw < fibers { Side::A } else { Side::B };
                (raw % fibers, side)
            }
        }
    }
}

/// A configured detector: its kind, the boards it is read through and an optional channel map.
///
/// Without a map, channels are numbered board by board in the order the boards were listed.
#[derive(Debug, Clone)]
pub struct Detector {
    kind: DetectorKind,
    equipment: Vec<u32>,
    map: Option<ChannelMap>,
}

impl Detector {
    pub fn new(kind: DetectorKind, equipment: Vec<u32>, map: Option<ChannelMap>) -> Self {
        Self {
            kind,
            equipment,
            map,
        }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }
}

impl DetectorProfile for Detector {
    fn channel_count(&self) -> usize {
        match self.kind {
            DetectorKind::Bmon => BMON_CHANNELS,
            DetectorKind::Tof => TOF_CHANNELS,
            DetectorKind::Hodoscope => HODO_FIBERS_PER_AXIS,
            DetectorKind::Sts => STS_CHANNELS,
        }
    }

    fn decode_hit(&self, raw_channel: u16, raw_amplitude: u16) -> Option<(u16, f64)> {
        if raw_channel as usize >= self.kind.raw_channel_count() {
            return None;
        }
        let amplitude = match self.kind {
            DetectorKind::Bmon | DetectorKind::Tof => raw_amplitude,
            DetectorKind::Hodoscope | DetectorKind::Sts => raw_amplitude & ADC_5BIT_MASK,
        };
        Some((raw_channel, amplitude as f64))
    }

    fn map_channel(&self, equipment_id: u32, raw_channel: u16) -> Option<(u32, Side)> {
        if let Some(map) = &self.map {
            return map
                .get(equipment_id, raw_channel)
                .map(|address| (address.channel, address.side));
        }
        let board = self.equipment.iter().position(|eq| *eq == equipment_id)?;
        let (local, side) = self.kind.local_channel(raw_channel);
        Some((board as u32 * self.channel_count() as u32 + local, side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_id::ChannelAddress;

    #[test]
    fn test_keywords() {
        assert_eq!(DetectorKind::from_str("BMON").ok(), Some(DetectorKind::Bmon));
        assert_eq!(DetectorKind::from_str("hodo").ok(), Some(DetectorKind::Hodoscope));
        assert!(DetectorKind::from_str("rich").is_err());
    }

    #[test]
    fn test_tof_identity_mapping_is_double_ended() {
        let tof = Detector::new(DetectorKind::Tof, vec![0x10, 0x11], None);
        assert_eq!(tof.map_channel(0x10, 6), Some((3, Side::A)));
        assert_eq!(tof.map_channel(0x10, 7), Some((3, Side::B)));
        assert_eq!(tof.map_channel(0x11, 7), Some((35, Side::B)));
        assert_eq!(tof.map_channel(0x12, 7), None);
    }

    #[test]
    fn test_hodoscope_axes_and_adc() {
        let hodo = Detector::new(DetectorKind::Hodoscope, vec![0x20], None);
        assert_eq!(hodo.map_channel(0x20, 70), Some((6, Side::B)));
        assert_eq!(hodo.decode_hit(70, 0xff), Some((70, 31.0)));
        assert_eq!(hodo.decode_hit(128, 3), None);
    }

    #[test]
    fn test_bmon_drops_unknown_channels() {
        let bmon = Detector::new(DetectorKind::Bmon, vec![0x90], None);
        assert_eq!(bmon.decode_hit(3, 95), Some((3, 95.0)));
        assert_eq!(bmon.decode_hit(16, 95), None);
    }

    #[test]
    fn test_map_overrides_identity() {
        let mut map = ChannelMap::default();
        map.insert(ChannelAddress::new(0x90, 1, 42, Side::B));
        let bmon = Detector::new(DetectorKind::Bmon, vec![0x90], Some(map));
        assert_eq!(bmon.map_channel(0x90, 1), Some((42, Side::B)));
        assert_eq!(bmon.map_channel(0x90, 2), None);
    }
}
