use super::hardware_id::Side;

/// A reconstructed detector hit with a global timestamp.
///
/// Digis are created by the decoder, owned by the TimeOrderedBuffer until the cluster builder
/// takes them, and then either copied into a Cluster or discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Digi {
    pub source_id: u32,
    pub channel: u32,
    pub side: Side,
    /// Global time in ns
    pub time: f64,
    pub amplitude: f64,
}

impl Digi {
    pub fn new(source_id: u32, channel: u32, side: Side, time: f64, amplitude: f64) -> Self {
        Self {
            source_id,
            channel,
            side,
            time,
            amplitude,
        }
    }
}
