/// Key of an entry in a [`SlotMap`].
///
/// The index is unique among the live entries and is reused after the entry is removed; the
/// generation tells apart entries that occupied the same slot at different times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generation-checked [`SlotId`]s.
///
/// New entries take the first free slot, so that indices stay small.
#[derive(Debug)]
pub(super) struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        SlotMap { slots: Vec::new(), len: 0 }
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.slots.iter().position(|slot| slot.value.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return SlotId { index: index as u32, generation: slot.generation }
        }

        self.slots.push(Slot { generation: 0, value: Some(value) });
        SlotId { index: (self.slots.len() - 1) as u32, generation: 0 }
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation => slot.value.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => slot.value.as_mut(),
            _ => None,
        }
    }

    /// Looks up a live entry by the bare index (as received from the peer).
    pub fn id_by_index(&self, index: u32) -> Option<SlotId> {
        let slot = self.slots.get(index as usize)?;
        slot.value.as_ref().map(|_| SlotId { index, generation: slot.generation })
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => {
                let value = slot.value.take();
                if value.is_some() { self.len -= 1 }
                value
            },
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ids(&self) -> Vec<SlotId> {
        self.slots.iter().enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| SlotId { index: index as u32, generation: slot.generation })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.len = 0;
        self.slots.iter_mut().filter_map(|slot| slot.value.take()).collect()
    }
}
