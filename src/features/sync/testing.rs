//! In-process transport for exercising sync cycles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::features::sync::OperationType;
use crate::transport::{
    ItemOutcome, ReferenceData, Transport, TransportError, UploadItem, UploadResponse,
};

/// Answers every upload the same way: a fixed outcome list, a fixed error,
/// or success for each item sent. An optional delay holds each upload open.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Option<Vec<ItemOutcome>>,
    failure: Option<TransportError>,
    delay: Option<Duration>,
    reference: ReferenceData,
    unreachable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(mut self, outcomes: Vec<ItemOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn fail_with(mut self, error: TransportError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_reference(mut self, reference: ReferenceData) -> Self {
        self.reference = reference;
        self
    }

    /// Upload call counter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Size of each uploaded batch, in call order.
    pub fn batch_sizes(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.batch_sizes)
    }

    /// Toggle for what `check_connectivity` reports.
    pub fn unreachable(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unreachable)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn upload_batch(
        &self,
        _kind: OperationType,
        items: Vec<UploadItem>,
    ) -> Result<UploadResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(items.len());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let per_item = self.outcomes.clone().unwrap_or_else(|| {
            items
                .iter()
                .map(|item| ItemOutcome::success(item.natural_key.clone()))
                .collect()
        });
        Ok(UploadResponse { per_item })
    }

    async fn download_reference_data(
        &self,
        _scope_id: String,
    ) -> Result<ReferenceData, TransportError> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(self.reference.clone()),
        }
    }

    async fn check_connectivity(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
