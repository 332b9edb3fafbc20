//! Worker registry.
//!
//! One process runs several cooperating workers: one apply worker per remote
//! origin, plus the per-database coordinator that hosts the sequence and
//! lock control loops. The registry is the single place their control state
//! lives: a mutex-guarded map of tagged slots with a narrow accessor API,
//! rather than raw shared memory.
//!
//! Pausing apply is global (all apply workers wait), while the stop-at
//! replay position is per worker: a change at or before the stop position
//! completes in full, later ones are not started.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::change::Lsn;
use crate::identity::NodeIdentity;

/// Control state for one apply worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyControl {
    /// Stop replay once past this position.
    pub stop_at: Option<Lsn>,
    /// Commit LSN of the last change this worker applied.
    pub last_applied: Option<Lsn>,
}

/// A registered worker slot.
#[derive(Debug, Clone, Copy)]
pub enum Worker {
    /// Apply worker for one remote origin.
    Apply(ApplyControl),
    /// The per-database coordinator running the sequence and lock loops.
    Coordinator,
}

/// Registry of the process's workers.
pub struct WorkerRegistry {
    slots: Mutex<HashMap<NodeIdentity, Worker>>,
    pause_tx: watch::Sender<bool>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            slots: Mutex::new(HashMap::new()),
            pause_tx,
        }
    }

    /// Register an apply worker for a remote origin. Re-registering keeps
    /// the existing control state so a restarted worker resumes its stop
    /// position.
    pub fn register_apply(&self, origin: NodeIdentity) {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(origin)
            .or_insert(Worker::Apply(ApplyControl::default()));
    }

    /// Register the coordinator slot under the local node's identity.
    pub fn register_coordinator(&self, node: NodeIdentity) {
        self.slots.lock().unwrap().insert(node, Worker::Coordinator);
    }

    pub fn deregister(&self, id: NodeIdentity) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Pause or resume all apply workers.
    pub fn pause_apply(&self, pause: bool) {
        self.pause_tx.send_replace(pause);
    }

    pub fn apply_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Block until apply is unpaused. Returns immediately when not paused.
    pub async fn wait_if_paused(&self) {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Ask an apply worker to stop replay once past `lsn`; `None` clears the
    /// stop position.
    pub fn set_stop_position(&self, origin: NodeIdentity, lsn: Option<Lsn>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Worker::Apply(control)) = slots.get_mut(&origin) {
            control.stop_at = lsn;
        }
    }

    pub fn stop_position(&self, origin: NodeIdentity) -> Option<Lsn> {
        match self.slots.lock().unwrap().get(&origin) {
            Some(Worker::Apply(control)) => control.stop_at,
            _ => None,
        }
    }

    pub fn note_applied(&self, origin: NodeIdentity, lsn: Lsn) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Worker::Apply(control)) = slots.get_mut(&origin) {
            control.last_applied = Some(lsn);
        }
    }

    pub fn apply_control(&self, origin: NodeIdentity) -> Option<ApplyControl> {
        match self.slots.lock().unwrap().get(&origin) {
            Some(Worker::Apply(control)) => Some(*control),
            _ => None,
        }
    }

    /// Snapshot of all registered workers.
    pub fn workers(&self) -> Vec<(NodeIdentity, Worker)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(sysid: u64) -> NodeIdentity {
        NodeIdentity::new(sysid, 1, 1)
    }

    #[test]
    fn test_reregister_keeps_control_state() {
        let reg = WorkerRegistry::new();
        reg.register_apply(origin(2));
        reg.set_stop_position(origin(2), Some(77));
        reg.register_apply(origin(2));
        assert_eq!(reg.stop_position(origin(2)), Some(77));
    }

    #[test]
    fn test_stop_position_only_touches_apply_slots() {
        let reg = WorkerRegistry::new();
        reg.register_coordinator(origin(1));
        reg.set_stop_position(origin(1), Some(5));
        assert_eq!(reg.stop_position(origin(1)), None);
    }

    #[tokio::test]
    async fn test_wait_if_paused_blocks_until_resume() {
        let reg = std::sync::Arc::new(WorkerRegistry::new());
        reg.pause_apply(true);

        let reg2 = reg.clone();
        let waiter = tokio::spawn(async move { reg2.wait_if_paused().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        reg.pause_apply(false);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_if_paused_is_immediate_when_running() {
        let reg = WorkerRegistry::new();
        reg.wait_if_paused().await;
    }
}
