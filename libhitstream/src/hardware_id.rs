use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::str::FromStr;

use super::error::DetectorError;

/// Readout end of a channel. Single ended detectors only ever use A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    A,
    B,
}

impl FromStr for Side {
    type Err = DetectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "a" | "A" | "0" => Ok(Self::A),
            "b" | "B" | "1" => Ok(Self::B),
            other => Err(DetectorError::InvalidSide(other.to_string())),
        }
    }
}

/// Full address of a detector channel, including the hardware it was read through.
#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub struct ChannelAddress {
    pub equipment_id: u32,
    pub raw_channel: u16,
    pub channel: u32,
    pub side: Side,
}

impl ChannelAddress {
    pub fn new(equipment_id: u32, raw_channel: u16, channel: u32, side: Side) -> Self {
        Self {
            equipment_id,
            raw_channel,
            channel,
            side,
        }
    }
}

/// Generate a unique id number for a given hardware location
pub fn generate_uuid(equipment_id: u32, raw_channel: u16) -> u64 {
    ((equipment_id as u64) << 16) | raw_channel as u64
}
