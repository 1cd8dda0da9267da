//! The shared, persisted plan.
//!
//! Every mutation happens under one lock and is followed by a full save
//! before the lock is released, so concurrent workers never interleave
//! writes and the document on disk always matches some committed state.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::plan::{PersistenceError, Plan, PlanStore, ResultRef, Subtask, SubtaskStatus};

#[derive(Debug, Clone)]
pub(crate) struct PlanLedger {
    plan: Arc<Mutex<Plan>>,
    store: PlanStore,
}

impl PlanLedger {
    pub(crate) fn new(plan: Plan, store: PlanStore) -> Self {
        Self {
            plan: Arc::new(Mutex::new(plan)),
            store,
        }
    }

    pub(crate) async fn persist(&self) -> Result<(), PersistenceError> {
        let plan = self.plan.lock().await;
        self.store.save(&plan).await
    }

    pub(crate) async fn snapshot(&self) -> Plan {
        self.plan.lock().await.clone()
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut Subtask),
    {
        let mut plan = self.plan.lock().await;
        match plan.subtask_mut(id) {
            Some(subtask) => apply(subtask),
            None => tracing::warn!(subtask_id = id, "ledger update for unknown subtask"),
        }
        self.store.save(&plan).await
    }

    pub(crate) async fn mark_running(&self, id: &str) -> Result<(), PersistenceError> {
        self.update(id, |s| {
            s.status = SubtaskStatus::Running;
            s.error = None;
        })
        .await
    }

    pub(crate) async fn mark_completed(
        &self,
        id: &str,
        result_ref: Option<ResultRef>,
    ) -> Result<(), PersistenceError> {
        self.update(id, |s| {
            s.status = SubtaskStatus::Completed;
            s.result_ref = result_ref;
            s.error = None;
        })
        .await
    }

    pub(crate) async fn mark_failed(&self, id: &str, error: String) -> Result<(), PersistenceError> {
        self.update(id, |s| {
            s.status = SubtaskStatus::Failed;
            s.error = Some(error);
        })
        .await
    }

    pub(crate) async fn reset_pending(&self, id: &str) -> Result<(), PersistenceError> {
        self.update(id, |s| {
            s.status = SubtaskStatus::Pending;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_mutation_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("plan.json"));
        let plan = Plan::new(vec![Subtask::new("s1", "T", "O", "coder", "local", 1)]);
        let ledger = PlanLedger::new(plan, store.clone());

        ledger.mark_running("s1").await.unwrap();
        assert_eq!(
            store.load().await.unwrap().status_of("s1"),
            Some(SubtaskStatus::Running)
        );

        ledger
            .mark_completed("s1", Some(ResultRef::new("mem:x")))
            .await
            .unwrap();
        let on_disk = store.load().await.unwrap();
        assert_eq!(on_disk.status_of("s1"), Some(SubtaskStatus::Completed));
        assert_eq!(on_disk.subtasks[0].result_ref, Some(ResultRef::new("mem:x")));
        assert_eq!(on_disk, ledger.snapshot().await);
    }

    #[tokio::test]
    async fn concurrent_updates_leave_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("plan.json"));
        let subtasks = (0..16)
            .map(|i| Subtask::new(format!("s{i}"), "T", format!("O{i}"), "coder", "local", 1))
            .collect();
        let ledger = PlanLedger::new(Plan::new(subtasks), store.clone());

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.mark_failed(&format!("s{i}"), "boom".to_string()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let on_disk = store.load().await.unwrap();
        assert_eq!(on_disk.progress().failed, 16);
    }
}
