//! In-memory adapter for tests and preview runs.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::adapter::{AdapterError, DatasetAdapter, UnitStream};
use crate::types::{RowResult, Unit};

#[derive(Default)]
pub struct MemoryAdapter {
    units: Vec<Map<String, Value>>,
    written: Mutex<Vec<RowResult>>,
}

impl MemoryAdapter {
    pub fn new(units: Vec<Map<String, Value>>) -> Self {
        Self {
            units,
            written: Mutex::new(Vec::new()),
        }
    }

    /// Everything handed to `write_results` so far.
    pub async fn written(&self) -> Vec<RowResult> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl DatasetAdapter for MemoryAdapter {
    async fn read_units(&self) -> Result<UnitStream, AdapterError> {
        let units: Vec<_> = self
            .units
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, fields)| Ok(Unit::new(i as u64, fields)))
            .collect();
        Ok(Box::pin(futures::stream::iter(units)))
    }

    async fn write_results(&self, results: &[RowResult]) -> Result<(), AdapterError> {
        self.written.lock().await.extend_from_slice(results);
        Ok(())
    }

    async fn schema(&self) -> Vec<String> {
        self.units
            .first()
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn assigns_contiguous_indices() {
        let mut a = Map::new();
        a.insert("text".into(), json!("one"));
        let mut b = Map::new();
        b.insert("text".into(), json!("two"));

        let adapter = MemoryAdapter::new(vec![a, b]);
        let units: Vec<_> = adapter
            .read_units()
            .await
            .unwrap()
            .map(|u| u.unwrap())
            .collect()
            .await;

        assert_eq!(units[0].index, 0);
        assert_eq!(units[1].index, 1);
    }

    #[tokio::test]
    async fn empty_input_yields_no_units() {
        let adapter = MemoryAdapter::new(Vec::new());
        let units: Vec<_> = adapter.read_units().await.unwrap().collect().await;
        assert!(units.is_empty());
        assert!(adapter.schema().await.is_empty());
    }
}
