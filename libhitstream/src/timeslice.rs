/// Header of one microslice as delivered by the timeslice source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicrosliceDescriptor {
    pub equipment_id: u32,
    pub sys_id: u8,
    /// Start time of the microslice in ns
    pub index: u64,
    pub size: u32,
    pub flags: u16,
}

/// Pull interface over one timeslice.
///
/// Components are readout links; each component holds the same number of microslices (frames).
/// The first `num_core_microslices` frames are the core, the rest is the overlap shared with
/// the following timeslice.
pub trait TimesliceSource {
    fn index(&self) -> u64;
    fn num_components(&self) -> usize;
    fn num_core_microslices(&self) -> usize;
    fn num_microslices(&self, component: usize) -> usize;
    fn descriptor(&self, component: usize, ms_index: usize) -> Option<MicrosliceDescriptor>;
    fn content(&self, component: usize, ms_index: usize) -> Option<&[u8]>;
}

/// Position of a frame inside its timeslice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    pub start_time: u64,
    pub byte_size: usize,
    pub is_overlap: bool,
}

/// A fully materialized timeslice, used for replay and tests
#[derive(Debug, Clone, Default)]
pub struct OwnedTimeslice {
    index: u64,
    num_core: usize,
    components: Vec<Vec<(MicrosliceDescriptor, Vec<u8>)>>,
}

impl OwnedTimeslice {
    pub fn new(index: u64, num_core: usize) -> Self {
        Self {
            index,
            num_core,
            components: Vec::new(),
        }
    }

    /// Append a microslice to a component, creating the component if needed.
    ///
    /// The descriptor size is overwritten with the real content size.
    pub fn push_microslice(
        &mut self,
        component: usize,
        mut descriptor: MicrosliceDescriptor,
        content: Vec<u8>,
    ) {
        if self.components.len() <= component {
            self.components.resize_with(component + 1, Vec::new);
        }
        descriptor.size = content.len() as u32;
        self.components[component].push((descriptor, content));
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.components
            .iter()
            .flatten()
            .map(|(_, content)| content.len() as u64)
            .sum()
    }
}

impl TimesliceSource for OwnedTimeslice {
    fn index(&self) -> u64 {
        self.index
    }

    fn num_components(&self) -> usize {
        self.components.len()
    }

    fn num_core_microslices(&self) -> usize {
        self.num_core
    }

    fn num_microslices(&self, component: usize) -> usize {
        self.components.get(component).map_or(0, |c| c.len())
    }

    fn descriptor(&self, component: usize, ms_index: usize) -> Option<MicrosliceDescriptor> {
        self.components
            .get(component)
            .and_then(|c| c.get(ms_index))
            .map(|(descriptor, _)| *descriptor)
    }

    fn content(&self, component: usize, ms_index: usize) -> Option<&[u8]> {
        self.components
            .get(component)
            .and_then(|c| c.get(ms_index))
            .map(|(_, content)| content.as_slice())
    }
}
