//! Breakpoint bookkeeping.
//!
//! One slot per address. A slot is *persistent* while it should be armed at
//! the start of every round, and *armed* while it is patched into the current
//! child. Process control owns the patched bytes; this table only tracks
//! intent and ids.

use std::collections::HashMap;

use racetrap_target::BreakpointId;

/// Why an address is trapped. Later roles take precedence when two uses
/// share an address; the weaker ones come back when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BreakpointRole {
    /// Entry of a function that has not been explored yet
    FunctionEntry,
    /// Memory-referencing instruction: a scheduling point
    MemoryReference,
    /// Entry of a function with a registered handler
    Handler,
    /// Return address of every thread
    ExitMarker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSlot {
    pub addr: u64,
    /// Strongest of `uses`
    pub role: BreakpointRole,
    uses: Vec<BreakpointRole>,
    pub persistent: bool,
    pub armed: Option<BreakpointId>,
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    slots: Vec<BreakpointSlot>,
    by_addr: HashMap<u64, usize>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a persistent breakpoint. Returns true if the address is new.
    pub fn insert(&mut self, addr: u64, role: BreakpointRole) -> bool {
        if let Some(&index) = self.by_addr.get(&addr) {
            let slot = &mut self.slots[index];
            slot.persistent = true;
            slot.role = slot.role.max(role);
            if !slot.uses.contains(&role) {
                slot.uses.push(role);
            }
            return false;
        }
        self.by_addr.insert(addr, self.slots.len());
        self.slots.push(BreakpointSlot { addr, role, uses: vec![role], persistent: true, armed: None });
        true
    }

    /// Drop one use of `addr`. The slot falls back to its strongest remaining
    /// role, or is removed when none is left. Returns the remaining role.
    pub fn release(&mut self, addr: u64, role: BreakpointRole) -> Option<BreakpointRole> {
        let slot = self.get_mut(addr)?;
        slot.uses.retain(|&r| r != role);
        match slot.uses.iter().max().copied() {
            Some(remaining) => {
                slot.role = remaining;
                Some(remaining)
            }
            None => {
                self.remove(addr);
                None
            }
        }
    }

    /// Forget an address. The caller disarms it first if it is armed.
    pub fn remove(&mut self, addr: u64) -> Option<BreakpointSlot> {
        let index = self.by_addr.remove(&addr)?;
        let slot = self.slots.swap_remove(index);
        if let Some(moved) = self.slots.get(index) {
            self.by_addr.insert(moved.addr, index);
        }
        Some(slot)
    }

    /// Stop arming `addr` in future rounds.
    pub fn retire(&mut self, addr: u64) {
        if let Some(slot) = self.get_mut(addr) {
            slot.persistent = false;
        }
    }

    pub fn get(&self, addr: u64) -> Option<&BreakpointSlot> {
        self.by_addr.get(&addr).map(|&i| &self.slots[i])
    }

    fn get_mut(&mut self, addr: u64) -> Option<&mut BreakpointSlot> {
        self.by_addr.get(&addr).map(|&i| &mut self.slots[i])
    }

    pub fn role(&self, addr: u64) -> Option<BreakpointRole> {
        self.get(addr).map(|slot| slot.role)
    }

    pub fn armed_id(&self, addr: u64) -> Option<BreakpointId> {
        self.get(addr).and_then(|slot| slot.armed)
    }

    pub fn is_armed(&self, addr: u64) -> bool {
        self.armed_id(addr).is_some()
    }

    pub fn set_armed(&mut self, addr: u64, id: Option<BreakpointId>) {
        if let Some(slot) = self.get_mut(addr) {
            slot.armed = id;
        }
    }

    /// Persistent addresses not armed in the current child, in address order.
    pub fn pending(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> =
            self.slots.iter().filter(|s| s.persistent && s.armed.is_none()).map(|s| s.addr).collect();
        addrs.sort_unstable();
        addrs
    }

    /// Armed addresses whose role is not in `keep`, in address order.
    pub fn armed_except(&self, keep: &[BreakpointRole]) -> Vec<u64> {
        let mut addrs: Vec<u64> = self
            .slots
            .iter()
            .filter(|s| s.armed.is_some() && !keep.contains(&s.role))
            .map(|s| s.addr)
            .collect();
        addrs.sort_unstable();
        addrs
    }

    /// Mark everything disarmed, after the child is gone.
    pub fn disarm_all(&mut self) {
        for slot in &mut self.slots {
            slot.armed = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn armed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.armed.is_some()).count()
    }

    pub fn count_role(&self, role: BreakpointRole) -> usize {
        self.slots.iter().filter(|s| s.role == role && s.persistent).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_roles() {
        let mut table = BreakpointTable::new();
        assert!(table.insert(0x1000, BreakpointRole::FunctionEntry));
        assert!(!table.insert(0x1000, BreakpointRole::MemoryReference));
        assert_eq!(table.role(0x1000), Some(BreakpointRole::MemoryReference));
        // A weaker role never downgrades a slot.
        table.insert(0x1000, BreakpointRole::FunctionEntry);
        assert_eq!(table.role(0x1000), Some(BreakpointRole::MemoryReference));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_restores_weaker_role() {
        let mut table = BreakpointTable::new();
        table.insert(0x1000, BreakpointRole::FunctionEntry);
        table.insert(0x1000, BreakpointRole::MemoryReference);
        table.insert(0x1000, BreakpointRole::Handler);
        assert_eq!(table.role(0x1000), Some(BreakpointRole::Handler));

        assert_eq!(table.release(0x1000, BreakpointRole::Handler), Some(BreakpointRole::MemoryReference));
        assert_eq!(table.role(0x1000), Some(BreakpointRole::MemoryReference));
        assert_eq!(table.release(0x1000, BreakpointRole::FunctionEntry), Some(BreakpointRole::MemoryReference));
        assert_eq!(table.release(0x1000, BreakpointRole::MemoryReference), None);
        assert!(table.get(0x1000).is_none());
        assert_eq!(table.release(0x1000, BreakpointRole::Handler), None);
    }

    #[test]
    fn test_pending_and_armed() {
        let mut table = BreakpointTable::new();
        table.insert(0x3000, BreakpointRole::MemoryReference);
        table.insert(0x1000, BreakpointRole::FunctionEntry);
        table.insert(0x2000, BreakpointRole::ExitMarker);
        assert_eq!(table.pending(), vec![0x1000, 0x2000, 0x3000]);

        table.set_armed(0x1000, Some(BreakpointId(1)));
        table.set_armed(0x2000, Some(BreakpointId(2)));
        assert_eq!(table.pending(), vec![0x3000]);
        assert!(table.is_armed(0x1000));
        assert_eq!(table.armed_id(0x2000), Some(BreakpointId(2)));
        assert_eq!(table.armed_except(&[BreakpointRole::ExitMarker]), vec![0x1000]);

        table.disarm_all();
        assert_eq!(table.armed_count(), 0);
        assert_eq!(table.pending().len(), 3);
    }

    #[test]
    fn test_retire_keeps_slot_but_not_pending() {
        let mut table = BreakpointTable::new();
        table.insert(0x1000, BreakpointRole::FunctionEntry);
        table.retire(0x1000);
        assert!(table.pending().is_empty());
        assert_eq!(table.role(0x1000), Some(BreakpointRole::FunctionEntry));
        assert_eq!(table.count_role(BreakpointRole::FunctionEntry), 0);
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut table = BreakpointTable::new();
        table.insert(0x1000, BreakpointRole::Handler);
        table.insert(0x2000, BreakpointRole::Handler);
        table.insert(0x3000, BreakpointRole::Handler);
        let removed = table.remove(0x1000).unwrap();
        assert_eq!(removed.addr, 0x1000);
        assert!(table.get(0x1000).is_none());
        assert_eq!(table.get(0x3000).unwrap().addr, 0x3000);
        assert_eq!(table.get(0x2000).unwrap().addr, 0x2000);
        assert!(table.remove(0x1000).is_none());
        table.remove(0x3000);
        assert_eq!(table.len(), 1);
    }
}
