//! Named memory accounting for the build phases.
//!
//! Workspace entries are transient buffers of a phase; split-space entries are
//! the tables that survive into the final index. The log is advisory: it
//! drives memory-limit decisions but never allocates anything itself.

use log::debug;

use crate::partition::mb;

#[derive(Clone, Debug)]
struct SpaceEntry {
    name: &'static str,
    bytes: usize,
    split: bool,
}

/// Running totals of named allocations with a peak watermark.
#[derive(Clone, Debug, Default)]
pub struct SpaceLog {
    entries: Vec<SpaceEntry>,
    workspace: usize,
    splitspace: usize,
    peak: usize,
}

impl SpaceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workspace(&mut self, name: &'static str, bytes: usize) {
        self.add(name, bytes, false);
    }

    pub fn subtract_workspace(&mut self, name: &'static str) {
        self.subtract(name, false);
    }

    pub fn add_splitspace(&mut self, name: &'static str, bytes: usize) {
        self.add(name, bytes, true);
    }

    pub fn total(&self) -> usize {
        self.workspace + self.splitspace
    }

    pub fn workspace(&self) -> usize {
        self.workspace
    }

    pub fn splitspace(&self) -> usize {
        self.splitspace
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Bytes recorded under `name`, if present.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.bytes)
    }

    fn add(&mut self, name: &'static str, bytes: usize, split: bool) {
        assert!(
            !self.entries.iter().any(|e| e.name == name && e.split == split),
            "space entry {name} added twice"
        );
        self.entries.push(SpaceEntry { name, bytes, split });
        if split {
            self.splitspace += bytes;
        } else {
            self.workspace += bytes;
        }
        self.peak = self.peak.max(self.total());
        debug!(
            "space: +{name} {:.2} MB, total {:.2} MB (peak {:.2} MB)",
            mb(bytes),
            mb(self.total()),
            mb(self.peak)
        );
    }

    fn subtract(&mut self, name: &'static str, split: bool) {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name && e.split == split)
            .unwrap_or_else(|| panic!("space entry {name} was never added"));
        let entry = self.entries.swap_remove(idx);
        if split {
            self.splitspace -= entry.bytes;
        } else {
            self.workspace -= entry.bytes;
        }
        debug!("space: -{name} {:.2} MB, total {:.2} MB", mb(entry.bytes), mb(self.total()));
    }
}
