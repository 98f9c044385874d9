use crate::errors::*;
use indexmap::map::{Entry, IndexMap};

/// Open channels keyed by channel number, in the order they were opened.
///
/// Numbers are handed out monotonically starting at 1 and are never reused on the same
/// connection.
pub(crate) struct ChannelSlots<T> {
    slots: IndexMap<u16, T>,
    next_channel_id: u32,
    channel_max: u16,
}

impl<T> ChannelSlots<T> {
    pub(crate) fn new() -> ChannelSlots<T> {
        ChannelSlots {
            slots: IndexMap::new(),
            next_channel_id: 1,
            channel_max: 0,
        }
    }

    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        assert!(
            self.slots.is_empty() && self.next_channel_id == 1,
            "channel_max should not be set after channels have been opened"
        );
        self.channel_max = channel_max;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn ids(&self) -> Vec<u16> {
        self.slots.keys().cloned().collect()
    }

    pub(crate) fn get(&self, channel_id: u16) -> Option<&T> {
        self.slots.get(&channel_id)
    }

    pub(crate) fn get_mut(&mut self, channel_id: u16) -> Option<&mut T> {
        self.slots.get_mut(&channel_id)
    }

    /// Allocates the next channel number and stores `entry` under it.
    pub(crate) fn insert_next(&mut self, entry: T) -> Result<u16> {
        if self.next_channel_id > u32::from(self.channel_max) {
            return ExhaustedChannelIdsSnafu.fail();
        }
        let channel_id = self.next_channel_id as u16;
        self.next_channel_id += 1;
        match self.slots.entry(channel_id) {
            Entry::Occupied(_) => panic!("duplicate channel id {} allocated", channel_id),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(channel_id)
    }

    pub(crate) fn remove(&mut self, channel_id: u16) -> Option<T> {
        self.slots.shift_remove(&channel_id)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
