//! Per-task handle tables
//!
//! Handles are small per-task integers bound to a `(mailbox, mode)` pair.
//! Numbers start at 1, grow monotonically and skip values still in use, so
//! a closed handle is not handed out again until the counter wraps.

use std::collections::{BTreeMap, HashMap};

use crate::abi::Mode;
use crate::error::{MailboxError, Result};
use crate::namespace::MailboxId;
use crate::{HandleId, Pid};

/// What a handle refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub mailbox: MailboxId,
    pub mode: Mode,
}

#[derive(Debug)]
struct TaskHandles {
    next: HandleId,
    entries: BTreeMap<HandleId, Binding>,
}

impl Default for TaskHandles {
    fn default() -> Self {
        Self {
            next: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl TaskHandles {
    fn allocate(&mut self) -> Option<HandleId> {
        for _ in 0..HandleId::MAX {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1).max(1);
            if candidate != 0 && !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct HandleTable {
    limit_per_pid: usize,
    tasks: HashMap<Pid, TaskHandles>,
}

impl HandleTable {
    pub fn new(limit_per_pid: usize) -> Self {
        Self {
            limit_per_pid: limit_per_pid.clamp(1, HandleId::MAX as usize),
            tasks: HashMap::new(),
        }
    }

    /// Number of handles `pid` holds
    pub fn count(&self, pid: Pid) -> usize {
        self.tasks.get(&pid).map_or(0, |t| t.entries.len())
    }

    /// Fail early if `pid` could not take another handle
    pub fn ensure_room(&self, pid: Pid) -> Result<()> {
        if self.count(pid) >= self.limit_per_pid {
            return Err(MailboxError::HandleQuota(pid));
        }
        Ok(())
    }

    pub fn insert(&mut self, pid: Pid, binding: Binding) -> Result<HandleId> {
        self.ensure_room(pid)?;
        let task = self.tasks.entry(pid).or_default();
        let handle = task.allocate().ok_or(MailboxError::HandleQuota(pid))?;
        task.entries.insert(handle, binding);
        Ok(handle)
    }

    pub fn get(&self, pid: Pid, handle: HandleId) -> Result<Binding> {
        self.tasks
            .get(&pid)
            .and_then(|t| t.entries.get(&handle))
            .copied()
            .ok_or(MailboxError::InvalidHandle { pid, handle })
    }

    pub fn remove(&mut self, pid: Pid, handle: HandleId) -> Result<Binding> {
        self.tasks
            .get_mut(&pid)
            .and_then(|t| t.entries.remove(&handle))
            .ok_or(MailboxError::InvalidHandle { pid, handle })
    }

    /// Remove every handle `pid` holds
    pub fn take_task(&mut self, pid: Pid) -> Vec<(HandleId, Binding)> {
        self.tasks
            .remove(&pid)
            .map(|t| t.entries.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: u32) -> Binding {
        Binding {
            mailbox: MailboxId(id),
            mode: Mode::RDWR,
        }
    }

    #[test]
    fn test_handles_start_at_one_and_are_not_reused() {
        let mut table = HandleTable::new(8);
        let a = table.insert(1, binding(1)).unwrap();
        let b = table.insert(1, binding(2)).unwrap();
        assert_eq!((a, b), (1, 2));

        table.remove(1, a).unwrap();
        let c = table.insert(1, binding(3)).unwrap();
        assert_eq!(c, 3);
        assert_eq!(
            table.get(1, a),
            Err(MailboxError::InvalidHandle { pid: 1, handle: 1 })
        );
    }

    #[test]
    fn test_handles_are_per_task() {
        let mut table = HandleTable::new(8);
        assert_eq!(table.insert(1, binding(1)).unwrap(), 1);
        assert_eq!(table.insert(2, binding(1)).unwrap(), 1);
        assert!(table.get(3, 1).is_err());
    }

    #[test]
    fn test_double_remove_fails() {
        let mut table = HandleTable::new(8);
        let h = table.insert(4, binding(1)).unwrap();
        table.remove(4, h).unwrap();
        assert_eq!(
            table.remove(4, h),
            Err(MailboxError::InvalidHandle { pid: 4, handle: h })
        );
    }

    #[test]
    fn test_quota() {
        let mut table = HandleTable::new(2);
        let first = table.insert(7, binding(1)).unwrap();
        table.insert(7, binding(1)).unwrap();
        assert_eq!(table.insert(7, binding(1)), Err(MailboxError::HandleQuota(7)));

        table.remove(7, first).unwrap();
        table.insert(7, binding(1)).unwrap();
        assert_eq!(table.take_task(7).len(), 2);
        assert_eq!(table.count(7), 0);
    }
}
