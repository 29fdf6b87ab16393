use std::collections::{HashMap, HashSet};

use fundex_storage::{FundStore, Persist, StoreError};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    /// Row count of every committed flush, in order.
    pub flushes: Vec<usize>,
}

/// Full in-memory index of one table plus the pending writes against it.
///
/// Pending holds each code inserted or mutated since the last flush, once. When it reaches
/// `batch_size` the rows are written in a single store transaction.
pub struct UpsertBatcher<T: Persist> {
    index: HashMap<String, T>,
    pending: Vec<String>,
    pending_set: HashSet<String>,
    batch_size: usize,
    report: BatchReport,
}

impl<T: Persist> UpsertBatcher<T> {
    pub fn new(preloaded: Vec<T>, batch_size: usize) -> Self {
        let index = preloaded
            .into_iter()
            .map(|row| (row.code().to_string(), row))
            .collect();
        Self {
            index,
            pending: Vec::new(),
            pending_set: HashSet::new(),
            batch_size: batch_size.max(1),
            report: BatchReport::default(),
        }
    }

    pub async fn preload(store: &dyn FundStore, batch_size: usize) -> Result<Self, StoreError> {
        let rows = T::load_all(store).await?;
        info!(dataset = %T::DATASET, rows = rows.len(), "preloaded index");
        Ok(Self::new(rows, batch_size))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    pub fn get(&self, code: &str) -> Option<&T> {
        self.index.get(code)
    }

    /// Every indexed code, sorted.
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.index.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn index_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.index.values_mut()
    }

    /// Create or mutate `code` with `apply`, then flush if the pending set is full.
    ///
    /// `apply` must not fail: callers map their payload first so that a rejected record never
    /// reaches the index.
    pub async fn upsert_with(
        &mut self,
        store: &dyn FundStore,
        code: &str,
        apply: impl FnOnce(&mut T),
    ) -> Result<Upserted, StoreError> {
        let outcome = match self.index.get_mut(code) {
            Some(existing) => {
                apply(existing);
                self.report.updated += 1;
                Upserted::Updated
            }
            None => {
                let mut row = T::blank(code);
                apply(&mut row);
                self.index.insert(code.to_string(), row);
                self.report.inserted += 1;
                Upserted::Inserted
            }
        };
        self.mark_pending(code);
        if self.pending.len() >= self.batch_size {
            self.flush(store).await?;
        }
        Ok(outcome)
    }

    fn mark_pending(&mut self, code: &str) {
        if self.pending_set.insert(code.to_string()) {
            self.pending.push(code.to_string());
        }
    }

    pub async fn flush(&mut self, store: &dyn FundStore) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows: Vec<T> = self
            .pending
            .iter()
            .filter_map(|code| self.index.get(code).cloned())
            .collect();
        T::write_batch(store, &rows).await?;
        self.pending.clear();
        self.pending_set.clear();
        self.report.flushes.push(rows.len());
        info!(
            dataset = %T::DATASET,
            rows = rows.len(),
            inserted = self.report.inserted,
            updated = self.report.updated,
            "committed batch"
        );
        Ok(())
    }

    /// Final flush of whatever is still pending.
    pub async fn finish(&mut self, store: &dyn FundStore) -> Result<BatchReport, StoreError> {
        self.flush(store).await?;
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundex_adapters::{map_detail, RawRecord};
    use fundex_core::{Dataset, FundDetail, FundRecord, DETAIL_ATTRIBUTE_KEYS};
    use fundex_storage::MemoryFundStore;
    use serde_json::Value as JsonValue;

    fn detail_payload(short_name: &str) -> RawRecord {
        let mut raw = RawRecord::new();
        raw.insert("FCODE".into(), JsonValue::String("000001".into()));
        for key in DETAIL_ATTRIBUTE_KEYS {
            raw.insert(key.into(), JsonValue::Null);
        }
        raw.insert("SHORTNAME".into(), JsonValue::String(short_name.into()));
        raw.insert("RISKLEVEL".into(), JsonValue::String("3".into()));
        raw
    }

    #[tokio::test]
    async fn flushes_at_batch_size_and_on_finish() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundDetail>::new(Vec::new(), 1000);
        for i in 0..2500 {
            let code = format!("{i:06}");
            batcher
                .upsert_with(&store, &code, |d| d.short_name = Some(format!("fund {i}")))
                .await
                .expect("upsert");
        }
        assert_eq!(batcher.pending_len(), 500);

        let report = batcher.finish(&store).await.expect("finish");
        assert_eq!(report.inserted, 2500);
        assert_eq!(report.updated, 0);
        assert_eq!(report.flushes, vec![1000, 1000, 500]);

        let sizes: Vec<usize> = store.batches().await.iter().map(|b| b.codes.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(store.load_details().await.expect("load").len(), 2500);
    }

    #[tokio::test]
    async fn refresh_of_same_payload_converges_to_one_row() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundDetail>::new(Vec::new(), 1000);

        let first = map_detail(&detail_payload("Alpha")).expect("map");
        let second = map_detail(&detail_payload("Alpha Plus")).expect("map");
        assert_eq!(
            batcher
                .upsert_with(&store, "000001", |d| first.apply_to(d))
                .await
                .expect("first"),
            Upserted::Inserted
        );
        assert_eq!(
            batcher
                .upsert_with(&store, "000001", |d| second.apply_to(d))
                .await
                .expect("second"),
            Upserted::Updated
        );
        let report = batcher.finish(&store).await.expect("finish");
        assert_eq!((report.inserted, report.updated), (1, 1));
        assert_eq!(report.flushes, vec![1]);

        let stored = store.detail("000001").await.expect("row");
        let mut expected = FundDetail::blank("000001");
        second.apply_to(&mut expected);
        expected.update_time = stored.update_time;
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn preloaded_rows_are_indexed_but_not_written() {
        let store = MemoryFundStore::with_rows(vec![], vec![FundDetail::blank("000001")], vec![]);
        let mut batcher = UpsertBatcher::<FundDetail>::preload(&store, 10)
            .await
            .expect("preload");
        assert!(batcher.contains("000001"));
        assert_eq!(batcher.codes(), vec!["000001".to_string()]);

        let report = batcher.finish(&store).await.expect("finish");
        assert!(report.flushes.is_empty());
        assert!(store.batches().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_codes_count_once_toward_the_threshold() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundDetail>::new(Vec::new(), 2);
        for _ in 0..3 {
            batcher
                .upsert_with(&store, "000001", |d| d.cycle = Some("1".into()))
                .await
                .expect("upsert");
        }
        assert!(store.batches().await.is_empty());
        batcher
            .upsert_with(&store, "000002", |_| {})
            .await
            .expect("upsert");
        let batches = store.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].dataset, Dataset::Detail);
        assert_eq!(batches[0].codes, vec!["000001", "000002"]);
    }
}
