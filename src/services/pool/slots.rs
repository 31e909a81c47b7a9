//! Credential slots
//!
//! The pool is an ordered list of slots. A slot position is a stable
//! identifier: slots are appended but never removed, only emptied.

use serde::{Deserialize, Serialize};

// ============================================================================
// Slot
// ============================================================================

/// One position in the credential pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Slot {
    Active(String),
    Empty,
}

impl Slot {
    pub fn is_active(&self) -> bool {
        matches!(self, Slot::Active(_))
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Slot::Active(token) => Some(token),
            Slot::Empty => None,
        }
    }
}

impl From<Option<String>> for Slot {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(token) if !token.is_empty() => Slot::Active(token),
            _ => Slot::Empty,
        }
    }
}

impl From<Slot> for Option<String> {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Active(token) => Some(token),
            Slot::Empty => None,
        }
    }
}

/// An active slot handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSlot {
    pub index: usize,
    pub token: String,
}

/// Where a newly provisioned credential ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Reused an emptied slot
    Filled(usize),
    /// Grew the pool by one slot
    Appended(usize),
    /// The token was already active at this slot; nothing changed
    Duplicate(usize),
}

impl Placement {
    pub fn index(&self) -> usize {
        match *self {
            Placement::Filled(i) | Placement::Appended(i) | Placement::Duplicate(i) => i,
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, Placement::Duplicate(_))
    }
}

// ============================================================================
// Slot Pool
// ============================================================================

/// Ordered slots with an incrementally maintained active count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPool {
    slots: Vec<Slot>,
    active: usize,
}

impl SlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: Vec<Slot>) -> Self {
        let active = slots.iter().filter(|s| s.is_active()).count();
        Self { slots, active }
    }

    /// Parse the persisted form: a JSON array of nullable tokens
    pub fn from_persisted(json: &str) -> Result<Self, serde_json::Error> {
        let slots: Vec<Slot> = serde_json::from_str(json)?;
        Ok(Self::from_slots(slots))
    }

    /// Serialize the whole pool, empties as `null`
    pub fn to_persisted(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.position(token).is_some()
    }

    fn position(&self, token: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.token() == Some(token))
    }

    /// Active slots in stored order
    pub fn active_slots(&self) -> Vec<ActiveSlot> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.token().map(|token| ActiveSlot {
                    index,
                    token: token.to_string(),
                })
            })
            .collect()
    }

    /// Empty the slot at `index`. Returns false if out of range or already empty.
    pub fn deprecate(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_active() => {
                *slot = Slot::Empty;
                self.active -= 1;
                true
            }
            _ => false,
        }
    }

    /// Empty the slot at `index` only while it still holds `token`
    pub fn deprecate_token(&mut self, index: usize, token: &str) -> bool {
        if self.get(index).and_then(Slot::token) != Some(token) {
            return false;
        }
        self.deprecate(index)
    }

    /// Put `token` into the first empty slot, or append a new one
    pub fn place(&mut self, token: String) -> Placement {
        if let Some(existing) = self.position(&token) {
            return Placement::Duplicate(existing);
        }

        self.active += 1;
        match self.slots.iter().position(|s| !s.is_active()) {
            Some(index) => {
                self.slots[index] = Slot::Active(token);
                Placement::Filled(index)
            }
            None => {
                self.slots.push(Slot::Active(token));
                Placement::Appended(self.slots.len() - 1)
            }
        }
    }
}
