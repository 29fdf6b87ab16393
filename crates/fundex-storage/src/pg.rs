use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundex_core::{
    column_for_key, FeeTier, FundDetail, FundIdentity, FundRate, FundRecord, TierSpec,
    DETAIL_ATTRIBUTE_KEYS, RATE_ATTRIBUTE_KEYS, REDEMPTION_TIERS, SUBSCRIPTION_TIERS,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::{FundStore, StoreError};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BINDS_PER_STATEMENT: usize = 60_000;

const INSTALLMENT_COLUMN: &str = "dtzt";

#[derive(Debug, Clone)]
pub struct PgFundStore {
    pool: PgPool,
}

impl PgFundStore {
    pub async fn connect(options: PgConnectOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(StoreError::db("connecting to postgres"))?;
        Ok(Self { pool })
    }
}

fn detail_columns() -> Vec<String> {
    DETAIL_ATTRIBUTE_KEYS.iter().map(|k| column_for_key(k)).collect()
}

fn rate_columns() -> Vec<String> {
    let mut columns: Vec<String> = RATE_ATTRIBUTE_KEYS.iter().map(|k| column_for_key(k)).collect();
    columns.push(INSTALLMENT_COLUMN.to_string());
    columns.extend(SUBSCRIPTION_TIERS.column_names());
    columns.extend(REDEMPTION_TIERS.column_names());
    columns
}

fn identity_columns() -> Vec<String> {
    ["howbuy_name", "eastmoney_name", "names_agree"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

pub(crate) fn create_table_sql(table: &str, columns: &[String]) -> String {
    let body = columns
        .iter()
        .map(|c| {
            let ty = match c.as_str() {
                "names_agree" => "BOOLEAN NOT NULL DEFAULT FALSE",
                INSTALLMENT_COLUMN => "BOOLEAN",
                _ => "TEXT",
            };
            format!("    {c} {ty},")
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    code VARCHAR(16) PRIMARY KEY,\n{body}\n    update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)"
    )
}

type Values<'q, 'a> = Separated<'q, 'a, Postgres, &'static str>;

/// A record that can bind one `VALUES` tuple, minus its leading code.
pub(crate) trait BindRow: FundRecord {
    /// Must push exactly one bind per upsert column, in column order.
    fn bind_values<'a>(&'a self, b: &mut Values<'_, 'a>);
}

/// `INSERT ... ON CONFLICT (code) DO UPDATE` over `rows`.
pub(crate) fn upsert_query<'a, T: BindRow>(
    table: &str,
    columns: &[String],
    rows: &'a [T],
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} (code, {}, update_time) ",
        columns.join(", ")
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.code());
        row.bind_values(&mut b);
        b.push("NOW()");
    });
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(format!(
        " ON CONFLICT (code) DO UPDATE SET {assignments}, update_time = NOW()"
    ));
    qb
}

fn rows_per_statement(columns: usize) -> usize {
    (MAX_BINDS_PER_STATEMENT / (columns + 1)).max(1)
}

impl BindRow for FundIdentity {
    fn bind_values<'a>(&'a self, b: &mut Values<'_, 'a>) {
        b.push_bind(self.howbuy_name());
        b.push_bind(self.eastmoney_name());
        b.push_bind(self.names_agree());
    }
}

impl BindRow for FundDetail {
    fn bind_values<'a>(&'a self, b: &mut Values<'_, 'a>) {
        for (_, value) in self.attributes() {
            b.push_bind(value);
        }
    }
}

impl BindRow for FundRate {
    fn bind_values<'a>(&'a self, b: &mut Values<'_, 'a>) {
        for (_, value) in self.attributes() {
            b.push_bind(value);
        }
        b.push_bind(self.installment_enabled);
        for spec in [SUBSCRIPTION_TIERS, REDEMPTION_TIERS] {
            for tier in self.tiers(&spec) {
                b.push_bind(tier.bound.as_deref());
                b.push_bind(tier.rate.as_deref());
            }
        }
    }
}

fn read_tiers(row: &PgRow, spec: &TierSpec, slots: &mut [FeeTier]) -> Result<(), sqlx::Error> {
    for (i, slot) in slots.iter_mut().enumerate() {
        let (bound, rate) = spec.columns_for(i + 1);
        slot.bound = row.try_get(bound.as_str())?;
        slot.rate = row.try_get(rate.as_str())?;
    }
    Ok(())
}

fn identity_from_row(row: &PgRow) -> Result<FundIdentity, sqlx::Error> {
    Ok(FundIdentity::from_stored(
        row.try_get::<String, _>("code")?,
        row.try_get("howbuy_name")?,
        row.try_get("eastmoney_name")?,
        row.try_get("names_agree")?,
        row.try_get::<Option<DateTime<Utc>>, _>("update_time")?,
    ))
}

fn detail_from_row(row: &PgRow) -> Result<FundDetail, sqlx::Error> {
    let mut detail = FundDetail {
        code: row.try_get("code")?,
        update_time: row.try_get("update_time")?,
        ..Default::default()
    };
    for (key, slot) in detail.attributes_mut() {
        *slot = row.try_get(column_for_key(key).as_str())?;
    }
    Ok(detail)
}

fn rate_from_row(row: &PgRow) -> Result<FundRate, sqlx::Error> {
    let mut rate = FundRate {
        code: row.try_get("code")?,
        installment_enabled: row
            .try_get::<Option<bool>, _>(INSTALLMENT_COLUMN)?
            .unwrap_or(false),
        update_time: row.try_get("update_time")?,
        ..Default::default()
    };
    for (key, slot) in rate.attributes_mut() {
        *slot = row.try_get(column_for_key(key).as_str())?;
    }
    read_tiers(row, &SUBSCRIPTION_TIERS, &mut rate.subscription_tiers)?;
    read_tiers(row, &REDEMPTION_TIERS, &mut rate.redemption_tiers)?;
    Ok(rate)
}

impl PgFundStore {
    async fn load_rows<T>(
        &self,
        table: &str,
        decode: impl Fn(&PgRow) -> Result<T, sqlx::Error>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = sqlx::query(&format!("SELECT * FROM {table}"))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::db(format!("loading {table}")))?;
        let decoded = rows
            .iter()
            .map(&decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::db(format!("decoding {table} rows")))?;
        debug!(table, rows = decoded.len(), "preloaded table");
        Ok(decoded)
    }

    async fn write_rows<T: BindRow>(
        &self,
        table: &str,
        columns: &[String],
        rows: &[T],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::db(format!("opening transaction on {table}")))?;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let mut qb = upsert_query(table, columns, chunk);
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db(format!("upserting into {table}")))?;
        }
        tx.commit()
            .await
            .map_err(StoreError::db(format!("committing {table} batch")))?;
        Ok(())
    }
}

#[async_trait]
impl FundStore for PgFundStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for (table, columns) in [
            ("fund_identity", identity_columns()),
            ("fund_detail", detail_columns()),
            ("fund_rate", rate_columns()),
        ] {
            sqlx::query(&create_table_sql(table, &columns))
                .execute(&self.pool)
                .await
                .map_err(StoreError::db(format!("creating {table}")))?;
        }
        info!("schema ensured");
        Ok(())
    }

    async fn load_identities(&self) -> Result<Vec<FundIdentity>, StoreError> {
        self.load_rows("fund_identity", identity_from_row).await
    }

    async fn load_details(&self) -> Result<Vec<FundDetail>, StoreError> {
        self.load_rows("fund_detail", detail_from_row).await
    }

    async fn load_rates(&self) -> Result<Vec<FundRate>, StoreError> {
        self.load_rows("fund_rate", rate_from_row).await
    }

    async fn write_identities(&self, rows: &[FundIdentity]) -> Result<(), StoreError> {
        self.write_rows("fund_identity", &identity_columns(), rows).await
    }

    async fn write_details(&self, rows: &[FundDetail]) -> Result<(), StoreError> {
        self.write_rows("fund_detail", &detail_columns(), rows).await
    }

    async fn write_rates(&self, rows: &[FundRate]) -> Result<(), StoreError> {
        self.write_rows("fund_rate", &rate_columns(), rows).await
    }

    async fn recompute_name_agreement(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fund_identity
               SET names_agree = COALESCE(howbuy_name = eastmoney_name, FALSE),
                   update_time = NOW()
             WHERE names_agree IS DISTINCT FROM COALESCE(howbuy_name = eastmoney_name, FALSE)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::db("recomputing names_agree"))?;
        Ok(result.rows_affected())
    }
}
