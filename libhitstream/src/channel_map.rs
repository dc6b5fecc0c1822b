// Maps [equipment, raw channel] -> ChannelAddress(equipment, raw channel, channel, side).
// The table content is detector specific and treated as opaque configuration; only the
// shape of the CSV is fixed here:
//
// equipment,raw_channel,channel,side
//
// Equipment ids may be written in hex with a 0x prefix.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::error::ChannelMapError;
use super::hardware_id::{generate_uuid, ChannelAddress, Side};

const ENTRIES_PER_LINE: usize = 4; //equipment, raw channel, channel, side

fn parse_equipment(entry: &str) -> Result<u32, std::num::ParseIntError> {
    let entry = entry.trim();
    if let Some(hex) = entry.strip_prefix("0x").or(entry.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        entry.parse()
    }
}

/// ChannelMap contains the mapping of the readout hardware (equipment id, raw channel) to the
/// detector channel and side.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    map: FxHashMap<u64, ChannelAddress>,
}

impl ChannelMap {
    /// Load a map from a CSV file
    pub fn new(path: &Path) -> Result<Self, ChannelMapError> {
        let mut contents = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
        Self::from_csv(&contents)
    }

    /// Parse a map from CSV text. The first line is a header and is skipped.
    pub fn from_csv(contents: &str) -> Result<Self, ChannelMapError> {
        let mut cm = ChannelMap::default();

        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').collect();
            if entries.len() != ENTRIES_PER_LINE {
                return Err(ChannelMapError::BadFileFormat);
            }

            let equipment_id = parse_equipment(entries[0])?;
            let raw_channel: u16 = entries[1].trim().parse()?;
            let channel: u32 = entries[2].trim().parse()?;
            let side: Side = entries[3].parse()?;

            cm.insert(ChannelAddress::new(equipment_id, raw_channel, channel, side));
        }

        Ok(cm)
    }

    pub fn insert(&mut self, address: ChannelAddress) {
        self.map.insert(
            generate_uuid(address.equipment_id, address.raw_channel),
            address,
        );
    }

    /// Get the full address for a given piece of hardware.
    ///
    /// Returns None if the hardware is not in the map
    pub fn get(&self, equipment_id: u32, raw_channel: u16) -> Option<&ChannelAddress> {
        self.map.get(&generate_uuid(equipment_id, raw_channel))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
