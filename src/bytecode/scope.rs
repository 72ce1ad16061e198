use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::lang::value::VBType;

/// Number of local slots addressable by a `u8` operand.
pub const SLOT_COUNT: usize = 256;

/// Slot reserved for "the result" of top-level statements.
pub const RESULT_SLOT: u8 = 0;

pub type Slot = u8;

/// Hands out slot ids, reusing released ones first-in first-out.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    next: usize,
    freed: VecDeque<Slot>,
}

impl SlotAllocator {
    /// An allocator with `RESULT_SLOT` already taken.
    pub fn new() -> Self {
        Self {
            next: RESULT_SLOT as usize + 1,
            freed: VecDeque::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<Slot> {
        if let Some(slot) = self.freed.pop_front() {
            trace!("reusing slot {}", slot);
            return Some(slot);
        }
        if self.next >= SLOT_COUNT {
            return None;
        }
        let slot = self.next as Slot;
        self.next += 1;
        Some(slot)
    }

    pub fn release(&mut self, slot: Slot) {
        trace!("releasing slot {}", slot);
        self.freed.push_back(slot);
    }

    /// Slots currently handed out.
    pub fn live(&self) -> usize {
        self.next - self.freed.len()
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    pub ty: VBType,
    pub slot: Slot,
    pub depth: usize,
}

/// Named variables plus anonymous loop scratch slots, tagged by the scope
/// depth that owns them.
#[derive(Debug, Clone, Default)]
pub struct ScopeTable {
    vars: HashMap<String, Variable>,
    scratch: Vec<(Slot, usize)>,
    depth: usize,
}

impl ScopeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn declare(&mut self, name: &str, ty: VBType, slot: Slot) {
        self.vars.insert(
            name.to_string(),
            Variable {
                ty,
                slot,
                depth: self.depth,
            },
        );
    }

    pub fn add_scratch(&mut self, slot: Slot) {
        self.scratch.push((slot, self.depth));
    }

    pub fn enter(&mut self) {
        self.depth += 1;
    }

    /// Leave the innermost scope and return the slots it owned, ascending.
    pub fn leave(&mut self) -> Vec<Slot> {
        debug_assert!(self.depth > 0, "leave() without matching enter()");
        self.depth = self.depth.saturating_sub(1);
        let depth = self.depth;

        let mut released: Vec<Slot> = Vec::new();
        self.vars.retain(|_, var| {
            if var.depth > depth {
                released.push(var.slot);
                false
            } else {
                true
            }
        });
        self.scratch.retain(|&(slot, owner)| {
            if owner > depth {
                released.push(slot);
                false
            } else {
                true
            }
        });

        released.sort_unstable();
        released
    }
}
