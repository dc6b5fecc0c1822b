use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use super::digi::Digi;
use super::hardware_id::Side;

/// Which readout ends of a channel have to fire for a requirement to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SideRequirement {
    A,
    B,
    #[default]
    Any,
    /// Needs a digi on each end (double ended strips)
    Both,
}

impl SideRequirement {
    pub fn accepts(&self, side: Side) -> bool {
        match self {
            Self::A => side == Side::A,
            Self::B => side == Side::B,
            Self::Any | Self::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequirementKind {
    /// Any digi on the channel
    #[default]
    Presence,
    /// A digi inside the pulser amplitude range
    Pulser,
    /// A digi outside the pulser amplitude range
    Beam,
}

/// A condition on one channel evaluated over a coincidence window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub kind: RequirementKind,
    pub channel: u32,
    #[serde(default)]
    pub side: SideRequirement,
}

impl Requirement {
    pub fn presence(channel: u32) -> Self {
        Self {
            kind: RequirementKind::Presence,
            channel,
            side: SideRequirement::Any,
        }
    }
}

/// How many requirements must hold for a window to be emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InclusionPolicy {
    /// Every requirement
    All,
    /// At least K requirements
    AtLeast(usize),
}

impl Default for InclusionPolicy {
    fn default() -> Self {
        Self::AtLeast(1)
    }
}

impl InclusionPolicy {
    /// A window with no requirements configured always passes.
    pub fn holds(&self, satisfied: usize, total: usize) -> bool {
        if total == 0 {
            return true;
        }
        match self {
            Self::All => satisfied == total,
            Self::AtLeast(k) => satisfied >= *k,
        }
    }
}

/// Amplitude signature of the calibration pulser
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulserConfig {
    pub min_amplitude: f64,
    pub max_amplitude: f64,
    /// Number of requirement channels which must see the pulser to force emission
    pub min_multiplicity: usize,
}

impl PulserConfig {
    pub fn is_pulser(&self, amplitude: f64) -> bool {
        amplitude >= self.min_amplitude && amplitude <= self.max_amplitude
    }
}

/// Per window state of a requirement list, filled while sweeping the window.
#[derive(Debug)]
pub struct RequirementTracker<'a> {
    requirements: &'a [Requirement],
    pulser: Option<&'a PulserConfig>,
    seen_a: BitVec,
    seen_b: BitVec,
    pulser_seen: BitVec,
}

impl<'a> RequirementTracker<'a> {
    pub fn new(requirements: &'a [Requirement], pulser: Option<&'a PulserConfig>) -> Self {
        let n = requirements.len();
        Self {
            requirements,
            pulser,
            seen_a: BitVec::repeat(false, n),
            seen_b: BitVec::repeat(false, n),
            pulser_seen: BitVec::repeat(false, n),
        }
    }

    /// Record one digi of the window. `amplitude` is the calibrated amplitude.
    pub fn observe(&mut self, digi: &Digi, amplitude: f64) {
        let pulser_like = self.pulser.is_some_and(|p| p.is_pulser(amplitude));
        for (idx, requirement) in self.requirements.iter().enumerate() {
            if requirement.channel != digi.channel || !requirement.side.accepts(digi.side) {
                continue;
            }
            if pulser_like {
                self.pulser_seen.set(idx, true);
            }
            let matched = match requirement.kind {
                RequirementKind::Presence => true,
                RequirementKind::Pulser => pulser_like,
                RequirementKind::Beam => !pulser_like,
            };
            if matched {
                match digi.side {
                    Side::A => self.seen_a.set(idx, true),
                    Side::B => self.seen_b.set(idx, true),
                }
            }
        }
    }

    pub fn is_satisfied(&self, idx: usize) -> bool {
        match self.requirements.get(idx).map(|r| r.side) {
            Some(SideRequirement::Both) => self.seen_a[idx] && self.seen_b[idx],
            Some(_) => self.seen_a[idx] || self.seen_b[idx],
            None => false,
        }
    }

    pub fn satisfied_count(&self) -> usize {
        (0..self.requirements.len())
            .filter(|idx| self.is_satisfied(*idx))
            .count()
    }

    pub fn total(&self) -> usize {
        self.requirements.len()
    }

    /// Number of requirement channels which saw a pulser-like digi
    pub fn pulser_multiplicity(&self) -> usize {
        self.pulser_seen.count_ones()
    }

    /// True if the pulser override forces emission of this window
    pub fn pulser_forced(&self) -> bool {
        self.pulser
            .is_some_and(|p| p.min_multiplicity > 0 && self.pulser_multiplicity() >= p.min_multiplicity)
    }
}
