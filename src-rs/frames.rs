use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Still frames captured under one daemon event id, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameGroup {
    frames: Vec<PathBuf>,
}

impl FrameGroup {
    pub fn frames(&self) -> &[PathBuf] {
        &self.frames
    }

    pub fn first(&self) -> Option<&Path> {
        self.frames.first().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug)]
pub struct Recorded<'a> {
    /// True when this frame opened the group.
    pub created: bool,
    pub group: &'a FrameGroup,
}

#[derive(Debug, Default)]
pub struct FrameAggregator {
    groups: BTreeMap<u64, FrameGroup>,
    keep_groups: usize,
}

impl FrameAggregator {
    /// `keep_groups == 0` keeps every group for the life of the session.
    pub fn new(keep_groups: usize) -> Self {
        Self {
            groups: BTreeMap::new(),
            keep_groups,
        }
    }

    pub fn record_frame(&mut self, event_id: u64, image: PathBuf) -> Recorded<'_> {
        let created = !self.groups.contains_key(&event_id);
        self.groups
            .entry(event_id)
            .or_default()
            .frames
            .push(image);
        self.evict_stale(event_id);

        Recorded {
            created,
            group: &self.groups[&event_id],
        }
    }

    pub fn first_frame(&self, event_id: u64) -> Option<&Path> {
        self.groups.get(&event_id).and_then(FrameGroup::first)
    }

    pub fn drop_first_frame(&mut self, event_id: u64) -> Option<PathBuf> {
        let group = self.groups.get_mut(&event_id)?;
        if group.frames.is_empty() {
            return None;
        }
        Some(group.frames.remove(0))
    }

    pub fn group(&self, event_id: u64) -> Option<&FrameGroup> {
        self.groups.get(&event_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    // Evicts by id relative to the newest group. The group just recorded and
    // its predecessor always survive while keep_groups >= 2.
    fn evict_stale(&mut self, recorded: u64) {
        if self.keep_groups == 0 {
            return;
        }
        let Some(&newest) = self.groups.keys().next_back() else {
            return;
        };
        let cutoff = newest.saturating_sub(self.keep_groups as u64 - 1);
        self.groups.retain(|&id, _| id >= cutoff || id == recorded);
    }
}
