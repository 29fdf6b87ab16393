use fundex_core::{FundIdentity, NameSide};
use fundex_storage::{FundStore, StoreError};
use tracing::info;

use crate::batcher::{UpsertBatcher, Upserted};

/// Merge a sighting of `code` into the identity index.
///
/// Only the sides that carry a name are touched, so a nameless sighting of a new code still
/// creates its row. A sighting that changes nothing is not written and returns `None`.
pub async fn reconcile(
    batcher: &mut UpsertBatcher<FundIdentity>,
    store: &dyn FundStore,
    code: &str,
    howbuy_name: Option<&str>,
    eastmoney_name: Option<&str>,
) -> Result<Option<Upserted>, StoreError> {
    let incoming: Vec<(NameSide, &str)> = [
        (NameSide::Howbuy, howbuy_name),
        (NameSide::Eastmoney, eastmoney_name),
    ]
    .into_iter()
    .filter_map(|(side, name)| name.map(|n| (side, n)))
    .collect();

    let fresh = match batcher.get(code) {
        Some(existing) => incoming
            .iter()
            .any(|(side, name)| existing.name(*side) != Some(*name)),
        None => true,
    };
    if !fresh {
        return Ok(None);
    }

    let outcome = batcher
        .upsert_with(store, code, |identity| {
            for (side, name) in &incoming {
                identity.set_name(*side, *name);
            }
        })
        .await?;
    Ok(Some(outcome))
}

/// Re-derive `names_agree` across the whole index and the whole table, including rows this run
/// never touched. Returns the number of stored rows that changed.
pub async fn recompute_name_agreement(
    batcher: &mut UpsertBatcher<FundIdentity>,
    store: &dyn FundStore,
) -> Result<u64, StoreError> {
    let in_memory = batcher
        .index_mut()
        .map(FundIdentity::recompute_names_agree)
        .filter(|changed| *changed)
        .count();
    let stored = store.recompute_name_agreement().await?;
    info!(in_memory, stored, "recomputed names_agree");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundex_storage::MemoryFundStore;

    #[tokio::test]
    async fn names_from_both_sides_merge_into_one_identity() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundIdentity>::new(Vec::new(), 100);

        let first = reconcile(&mut batcher, &store, "000001", Some("ABC"), None)
            .await
            .expect("howbuy");
        let second = reconcile(&mut batcher, &store, "000001", None, Some("ABC"))
            .await
            .expect("eastmoney");
        assert_eq!(first, Some(Upserted::Inserted));
        assert_eq!(second, Some(Upserted::Updated));

        let identity = batcher.get("000001").expect("indexed");
        assert_eq!(identity.howbuy_name(), Some("ABC"));
        assert_eq!(identity.eastmoney_name(), Some("ABC"));
        assert!(identity.names_agree());
    }

    #[tokio::test]
    async fn diverging_name_clears_agreement_after_the_pass() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundIdentity>::new(Vec::new(), 100);
        reconcile(&mut batcher, &store, "000001", Some("ABC"), Some("ABC"))
            .await
            .expect("seed");
        batcher.finish(&store).await.expect("flush");
        assert!(store.identity("000001").await.expect("row").names_agree());

        reconcile(&mut batcher, &store, "000001", None, Some("ABD"))
            .await
            .expect("rename");
        batcher.finish(&store).await.expect("flush");
        recompute_name_agreement(&mut batcher, &store)
            .await
            .expect("pass");

        let stored = store.identity("000001").await.expect("row");
        assert_eq!(stored.howbuy_name(), Some("ABC"));
        assert_eq!(stored.eastmoney_name(), Some("ABD"));
        assert!(!stored.names_agree());
        assert!(!batcher.get("000001").expect("indexed").names_agree());
    }

    #[tokio::test]
    async fn nameless_sighting_creates_row_and_keeps_stored_name() {
        let store = MemoryFundStore::new();
        let mut batcher = UpsertBatcher::<FundIdentity>::new(Vec::new(), 100);

        let created = reconcile(&mut batcher, &store, "000002", None, None)
            .await
            .expect("new code");
        assert_eq!(created, Some(Upserted::Inserted));
        reconcile(&mut batcher, &store, "000002", Some("DEF"), None)
            .await
            .expect("named");
        let again = reconcile(&mut batcher, &store, "000002", None, None)
            .await
            .expect("nameless again");
        assert_eq!(again, None);

        let identity = batcher.get("000002").expect("indexed");
        assert_eq!(identity.howbuy_name(), Some("DEF"));
        assert_eq!(identity.eastmoney_name(), None);
    }

    #[tokio::test]
    async fn unchanged_sighting_is_not_rewritten() {
        let stored = FundIdentity::from_stored("000001", Some("ABC".into()), None, false, None);
        let store = MemoryFundStore::with_rows(vec![stored.clone()], vec![], vec![]);
        let mut batcher = UpsertBatcher::new(vec![stored], 100);

        let outcome = reconcile(&mut batcher, &store, "000001", Some("ABC"), None)
            .await
            .expect("reconcile");
        assert_eq!(outcome, None);
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(batcher.report().updated, 0);
    }

    #[tokio::test]
    async fn pass_fixes_stale_flags_on_untouched_rows() {
        let stale = FundIdentity::from_stored(
            "000009",
            Some("Fund".into()),
            Some("fund".into()),
            true,
            None,
        );
        let store = MemoryFundStore::with_rows(vec![stale.clone()], vec![], vec![]);
        let mut batcher = UpsertBatcher::new(vec![stale], 100);

        let changed = recompute_name_agreement(&mut batcher, &store)
            .await
            .expect("pass");
        assert_eq!(changed, 1);
        assert!(!store.identity("000009").await.expect("row").names_agree());
        assert!(!batcher.get("000009").expect("indexed").names_agree());
    }
}
