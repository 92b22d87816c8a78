use async_trait::async_trait;
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::entities::QueueEntry;
use orchestrator_domain::store::QueueRepository;

use super::InMemoryTransaction;

#[async_trait]
impl QueueRepository for InMemoryTransaction {
    async fn create_queue_entry(&mut self, entry: QueueEntry) -> OrchestratorResult<()> {
        self.working.queue.insert(entry.job_exe_id, entry);
        Ok(())
    }

    async fn get_queue(&mut self) -> OrchestratorResult<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self.working.queue.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.queued.cmp(&b.queued))
                .then(a.job_exe_id.cmp(&b.job_exe_id))
        });
        Ok(entries)
    }

    async fn delete_queue_entries(&mut self, job_exe_ids: &[i64]) -> OrchestratorResult<()> {
        for id in job_exe_ids {
            self.working.queue.remove(id);
        }
        Ok(())
    }
}
