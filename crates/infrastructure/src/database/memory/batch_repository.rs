use std::collections::BTreeSet;

use async_trait::async_trait;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{Batch, BatchMetrics, Dataset, DatasetFile};
use orchestrator_domain::store::BatchRepository;

use super::{next_id, InMemoryTransaction};

#[async_trait]
impl BatchRepository for InMemoryTransaction {
    async fn create_batch(&mut self, mut batch: Batch) -> OrchestratorResult<Batch> {
        let state = &mut self.working;
        batch.id = next_id(&mut state.sequences.batch);
        if batch.root_batch_id == 0 {
            batch.root_batch_id = batch.id;
        }
        state.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&mut self, id: i64) -> OrchestratorResult<Option<Batch>> {
        Ok(self.working.batches.get(&id).cloned())
    }

    async fn lock_batch(&mut self, id: i64) -> OrchestratorResult<Option<Batch>> {
        Ok(self.working.batches.get(&id).cloned())
    }

    async fn update_batch(&mut self, batch: &Batch) -> OrchestratorResult<()> {
        let row = self
            .working
            .batches
            .get_mut(&batch.id)
            .ok_or(OrchestratorError::BatchNotFound { id: batch.id })?;
        *row = batch.clone();
        Ok(())
    }

    async fn get_latest_batch(&mut self, root_batch_id: i64) -> OrchestratorResult<Option<Batch>> {
        Ok(self
            .working
            .batches
            .values()
            .rev()
            .find(|batch| batch.root_batch_id == root_batch_id && !batch.is_superseded)
            .cloned())
    }

    async fn count_batch_recipes(&mut self, batch_id: i64) -> OrchestratorResult<(i64, i64)> {
        let (total, completed) = self
            .working
            .recipes
            .values()
            .filter(|recipe| recipe.batch_id == Some(batch_id) && recipe.is_top_level())
            .fold((0, 0), |(total, completed), recipe| {
                (total + 1, completed + i64::from(recipe.is_completed))
            });
        Ok((total, completed))
    }

    async fn save_batch_metrics(
        &mut self,
        batch_id: i64,
        metrics: Vec<BatchMetrics>,
    ) -> OrchestratorResult<()> {
        self.working.batch_metrics.insert(batch_id, metrics);
        Ok(())
    }

    async fn get_batch_metrics(&mut self, batch_id: i64) -> OrchestratorResult<Vec<BatchMetrics>> {
        Ok(self
            .working
            .batch_metrics
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_dataset(&mut self, mut dataset: Dataset) -> OrchestratorResult<Dataset> {
        let state = &mut self.working;
        if dataset.id == 0 {
            dataset.id = next_id(&mut state.sequences.dataset);
        }
        state.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset(&mut self, id: i64) -> OrchestratorResult<Option<Dataset>> {
        Ok(self.working.datasets.get(&id).cloned())
    }

    async fn add_dataset_files(&mut self, files: Vec<DatasetFile>) -> OrchestratorResult<Vec<DatasetFile>> {
        let state = &mut self.working;
        if let Some(file) = files
            .iter()
            .find(|file| !state.datasets.contains_key(&file.dataset_id))
        {
            return Err(OrchestratorError::DatasetNotFound { id: file.dataset_id });
        }
        let mut added = Vec::with_capacity(files.len());
        for mut file in files {
            file.id = next_id(&mut state.sequences.dataset_file);
            state.dataset_files.insert(file.id, file.clone());
            added.push(file);
        }
        Ok(added)
    }

    async fn find_dataset_files(
        &mut self,
        dataset_id: i64,
        exclude_file_ids: &[i64],
        before_id: Option<i64>,
        limit: usize,
    ) -> OrchestratorResult<Vec<DatasetFile>> {
        let excluded: BTreeSet<i64> = exclude_file_ids.iter().copied().collect();
        Ok(self
            .working
            .dataset_files
            .values()
            .rev()
            .filter(|file| before_id.is_none_or(|before| file.id < before))
            .filter(|file| file.dataset_id == dataset_id && !excluded.contains(&file.file_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_dataset_files(&mut self, dataset_id: i64) -> OrchestratorResult<i64> {
        Ok(self
            .working
            .dataset_files
            .values()
            .filter(|file| file.dataset_id == dataset_id)
            .count() as i64)
    }
}
