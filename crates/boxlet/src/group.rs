//! Worker groups as seen by the proxy: a permit pool plus a bounded count
//! of tasks waiting for one of its workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::{GroupId, WorkerGroup};
use crate::permit::{PermitInUse, PermitPool};

/// The group's backlog is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backlog of {backlog} waiting tasks is full")]
pub struct BacklogFull {
    pub backlog: usize,
}

/// Counts one task in the group's backlog until dropped.
pub struct WaitGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupOccupancy {
    /// Connected, healthy workers.
    pub workers: usize,
    /// Workers the master was asked to run.
    pub configured: usize,
    pub idle: usize,
    pub waiting: usize,
}

pub struct GroupDispatcher {
    pool: PermitPool,
    configured: usize,
    backlog: usize,
    waiting: AtomicUsize,
}

impl GroupDispatcher {
    pub fn new(group: &WorkerGroup, backlog: usize) -> Self {
        Self {
            pool: PermitPool::new(group.id.clone()),
            configured: group.workers,
            backlog,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &GroupId {
        self.pool.group()
    }

    pub fn pool(&self) -> &PermitPool {
        &self.pool
    }

    /// An idle worker right now, without queueing.
    pub fn try_acquire(&self) -> Option<PermitInUse> {
        self.pool.try_acquire()
    }

    /// Take a place in the backlog, or fail if it is full.
    pub fn enqueue(&self) -> Result<WaitGuard<'_>, BacklogFull> {
        self.waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.backlog).then_some(n + 1)
            })
            .map(|_| WaitGuard {
                waiting: &self.waiting,
            })
            .map_err(|_| BacklogFull {
                backlog: self.backlog,
            })
    }

    pub fn occupancy(&self) -> GroupOccupancy {
        let pool = self.pool.occupancy();
        GroupOccupancy {
            workers: pool.workers,
            configured: self.configured,
            idle: pool.idle,
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }
}

/// All groups of one proxy. The first configured group is the default
/// target when the application has no group router.
pub struct GroupTable {
    groups: Vec<Arc<GroupDispatcher>>,
}

impl GroupTable {
    pub fn new(groups: &[WorkerGroup], backlog: usize) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|g| Arc::new(GroupDispatcher::new(g, backlog)))
                .collect(),
        }
    }

    pub fn get(&self, id: &GroupId) -> Option<&Arc<GroupDispatcher>> {
        self.groups.iter().find(|g| g.id() == id)
    }

    pub fn default_group(&self) -> Option<&Arc<GroupDispatcher>> {
        self.groups.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<GroupDispatcher>> {
        self.groups.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_is_bounded_by_backlog() {
        let group = GroupDispatcher::new(&WorkerGroup::new("a", 1), 2);

        let first = group.enqueue().unwrap();
        let second = group.enqueue().unwrap();
        assert_eq!(group.enqueue().err(), Some(BacklogFull { backlog: 2 }));
        assert_eq!(group.occupancy().waiting, 2);

        drop(first);
        let third = group.enqueue().unwrap();
        assert_eq!(group.occupancy().waiting, 2);
        drop((second, third));
        assert_eq!(group.occupancy().waiting, 0);
    }

    #[test]
    fn zero_backlog_never_queues() {
        let group = GroupDispatcher::new(&WorkerGroup::new("a", 1), 0);
        assert!(group.enqueue().is_err());
    }

    #[test]
    fn table_defaults_to_first_group() {
        let table = GroupTable::new(&[WorkerGroup::new("a", 2), WorkerGroup::new("b", 1)], 8);
        assert_eq!(table.default_group().unwrap().id(), &GroupId::from("a"));
        assert_eq!(
            table.get(&GroupId::from("b")).unwrap().occupancy(),
            GroupOccupancy {
                workers: 0,
                configured: 1,
                idle: 0,
                waiting: 0
            }
        );
        assert!(table.get(&GroupId::from("c")).is_none());
    }
}
