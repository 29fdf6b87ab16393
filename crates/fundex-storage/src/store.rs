use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use fundex_core::{Dataset, FundDetail, FundIdentity, FundRate, FundRecord};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error while {action}: {source}")]
    Database {
        action: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub(crate) fn db(action: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let action = action.into();
        move |source| StoreError::Database { action, source }
    }
}

/// Relational store owning the three fund tables.
///
/// Every `write_*` call is one transaction and upserts by code; `update_time` is assigned by
/// the store on every write.
#[async_trait]
pub trait FundStore: Send + Sync {
    /// Create missing tables. Never drops anything.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn load_identities(&self) -> Result<Vec<FundIdentity>, StoreError>;

    async fn load_details(&self) -> Result<Vec<FundDetail>, StoreError>;

    async fn load_rates(&self) -> Result<Vec<FundRate>, StoreError>;

    async fn write_identities(&self, rows: &[FundIdentity]) -> Result<(), StoreError>;

    async fn write_details(&self, rows: &[FundDetail]) -> Result<(), StoreError>;

    async fn write_rates(&self, rows: &[FundRate]) -> Result<(), StoreError>;

    /// Re-derive `names_agree` for every stored identity. Returns the number of rows changed.
    async fn recompute_name_agreement(&self) -> Result<u64, StoreError>;
}

/// Routes a record type to its table on a [`FundStore`].
#[async_trait]
pub trait Persist: FundRecord {
    async fn load_all(store: &dyn FundStore) -> Result<Vec<Self>, StoreError>;

    async fn write_batch(store: &dyn FundStore, rows: &[Self]) -> Result<(), StoreError>;
}

#[async_trait]
impl Persist for FundIdentity {
    async fn load_all(store: &dyn FundStore) -> Result<Vec<Self>, StoreError> {
        store.load_identities().await
    }

    async fn write_batch(store: &dyn FundStore, rows: &[Self]) -> Result<(), StoreError> {
        store.write_identities(rows).await
    }
}

#[async_trait]
impl Persist for FundDetail {
    async fn load_all(store: &dyn FundStore) -> Result<Vec<Self>, StoreError> {
        store.load_details().await
    }

    async fn write_batch(store: &dyn FundStore, rows: &[Self]) -> Result<(), StoreError> {
        store.write_details(rows).await
    }
}

#[async_trait]
impl Persist for FundRate {
    async fn load_all(store: &dyn FundStore) -> Result<Vec<Self>, StoreError> {
        store.load_rates().await
    }

    async fn write_batch(store: &dyn FundStore, rows: &[Self]) -> Result<(), StoreError> {
        store.write_rates(rows).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBatch {
    pub dataset: Dataset,
    pub codes: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    identities: BTreeMap<String, FundIdentity>,
    details: BTreeMap<String, FundDetail>,
    rates: BTreeMap<String, FundRate>,
    batches: Vec<WrittenBatch>,
}

/// In-process store for dry runs and tests. Keeps a log of every written batch.
#[derive(Debug, Default)]
pub struct MemoryFundStore {
    state: Mutex<MemoryState>,
}

impl MemoryFundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(
        identities: Vec<FundIdentity>,
        details: Vec<FundDetail>,
        rates: Vec<FundRate>,
    ) -> Self {
        let state = MemoryState {
            identities: identities.into_iter().map(|r| (r.code.clone(), r)).collect(),
            details: details.into_iter().map(|r| (r.code.clone(), r)).collect(),
            rates: rates.into_iter().map(|r| (r.code.clone(), r)).collect(),
            batches: Vec::new(),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn batches(&self) -> Vec<WrittenBatch> {
        self.state.lock().await.batches.clone()
    }

    pub async fn identity(&self, code: &str) -> Option<FundIdentity> {
        self.state.lock().await.identities.get(code).cloned()
    }

    pub async fn detail(&self, code: &str) -> Option<FundDetail> {
        self.state.lock().await.details.get(code).cloned()
    }

    pub async fn rate(&self, code: &str) -> Option<FundRate> {
        self.state.lock().await.rates.get(code).cloned()
    }
}

fn stamp_all<T: FundRecord>(
    table: &mut BTreeMap<String, T>,
    rows: &[T],
    stamp: impl Fn(&mut T),
) -> Vec<String> {
    rows.iter()
        .map(|row| {
            let mut row = row.clone();
            stamp(&mut row);
            let code = row.code().to_string();
            table.insert(code.clone(), row);
            code
        })
        .collect()
}

#[async_trait]
impl FundStore for MemoryFundStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_identities(&self) -> Result<Vec<FundIdentity>, StoreError> {
        Ok(self.state.lock().await.identities.values().cloned().collect())
    }

    async fn load_details(&self) -> Result<Vec<FundDetail>, StoreError> {
        Ok(self.state.lock().await.details.values().cloned().collect())
    }

    async fn load_rates(&self) -> Result<Vec<FundRate>, StoreError> {
        Ok(self.state.lock().await.rates.values().cloned().collect())
    }

    async fn write_identities(&self, rows: &[FundIdentity]) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let codes = stamp_all(&mut state.identities, rows, |r| r.update_time = Some(now));
        state.batches.push(WrittenBatch {
            dataset: Dataset::Identity,
            codes,
        });
        Ok(())
    }

    async fn write_details(&self, rows: &[FundDetail]) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let codes = stamp_all(&mut state.details, rows, |r| r.update_time = Some(now));
        state.batches.push(WrittenBatch {
            dataset: Dataset::Detail,
            codes,
        });
        Ok(())
    }

    async fn write_rates(&self, rows: &[FundRate]) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let codes = stamp_all(&mut state.rates, rows, |r| r.update_time = Some(now));
        state.batches.push(WrittenBatch {
            dataset: Dataset::Rate,
            codes,
        });
        Ok(())
    }

    async fn recompute_name_agreement(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for identity in state.identities.values_mut() {
            if identity.recompute_names_agree() {
                identity.update_time = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }
}
