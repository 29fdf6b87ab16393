//! Core fund reference model shared by the fundex crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "fundex-core";

/// A row type keyed by fund code that the batcher can create, index and persist.
pub trait FundRecord: Clone + Send + Sync + 'static {
    const DATASET: Dataset;

    /// A fresh entity carrying only its key.
    fn blank(code: &str) -> Self;

    fn code(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dataset {
    Identity,
    Detail,
    Rate,
}

impl Dataset {
    /// Harvest order: each dataset is driven by the code set of the one before it.
    pub const ALL: [Dataset; 3] = [Dataset::Identity, Dataset::Detail, Dataset::Rate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Identity => "identity",
            Dataset::Detail => "detail",
            Dataset::Rate => "rate",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Dataset::Identity => "fund_identity",
            Dataset::Detail => "fund_detail",
            Dataset::Rate => "fund_rate",
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which portal a display name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameSide {
    Howbuy,
    Eastmoney,
}

/// One `(code, display name)` pair from a listing endpoint. Sources may list a code without a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedFund {
    pub code: String,
    pub name: Option<String>,
}

impl ListedFund {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: Some(name.into()),
        }
    }

    pub fn unnamed(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: None,
        }
    }
}

/// Result of a keyed fetch that reached the source and decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Present(Map<String, JsonValue>),
    /// The source answered but has no data for the code yet.
    Empty,
}

impl Payload {
    /// Any falsy value (`null`, `false`, `0`, `""`, `[]`, `{}`) means "no data yet". A truthy
    /// value that is not an object is `None`.
    pub fn from_datas(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) if map.is_empty() => Some(Payload::Empty),
            JsonValue::Object(map) => Some(Payload::Present(map)),
            JsonValue::Null | JsonValue::Bool(false) => Some(Payload::Empty),
            JsonValue::String(s) if s.is_empty() => Some(Payload::Empty),
            JsonValue::Array(items) if items.is_empty() => Some(Payload::Empty),
            JsonValue::Number(n) if n.as_f64() == Some(0.0) => Some(Payload::Empty),
            _ => None,
        }
    }
}

/// Cross-source identity of a fund.
///
/// `names_agree` is true iff both names are present and byte-equal. Setting either name
/// recomputes it; rows loaded from the store keep their stored flag until the next
/// reconciliation pass re-asserts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundIdentity {
    pub code: String,
    howbuy_name: Option<String>,
    eastmoney_name: Option<String>,
    names_agree: bool,
    pub update_time: Option<DateTime<Utc>>,
}

impl FundIdentity {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            howbuy_name: None,
            eastmoney_name: None,
            names_agree: false,
            update_time: None,
        }
    }

    pub fn from_stored(
        code: impl Into<String>,
        howbuy_name: Option<String>,
        eastmoney_name: Option<String>,
        names_agree: bool,
        update_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            code: code.into(),
            howbuy_name,
            eastmoney_name,
            names_agree,
            update_time,
        }
    }

    pub fn howbuy_name(&self) -> Option<&str> {
        self.howbuy_name.as_deref()
    }

    pub fn eastmoney_name(&self) -> Option<&str> {
        self.eastmoney_name.as_deref()
    }

    pub fn name(&self, side: NameSide) -> Option<&str> {
        match side {
            NameSide::Howbuy => self.howbuy_name(),
            NameSide::Eastmoney => self.eastmoney_name(),
        }
    }

    pub fn names_agree(&self) -> bool {
        self.names_agree
    }

    pub fn set_name(&mut self, side: NameSide, name: impl Into<String>) {
        let slot = match side {
            NameSide::Howbuy => &mut self.howbuy_name,
            NameSide::Eastmoney => &mut self.eastmoney_name,
        };
        *slot = Some(name.into());
        self.recompute_names_agree();
    }

    /// Returns true when the flag changed.
    pub fn recompute_names_agree(&mut self) -> bool {
        let agree = match (&self.howbuy_name, &self.eastmoney_name) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        let changed = agree != self.names_agree;
        self.names_agree = agree;
        changed
    }
}

impl FundRecord for FundIdentity {
    const DATASET: Dataset = Dataset::Identity;

    fn blank(code: &str) -> Self {
        Self::new(code)
    }

    fn code(&self) -> &str {
        &self.code
    }
}

/// Source payload keys of the detail endpoint, in column order.
pub const DETAIL_ATTRIBUTE_KEYS: [&str; 26] = [
    "FEATURE",
    "CYCLE",
    "WEBBACKCODE",
    "SHORTNAME",
    "FULLNAME",
    "FTYPE",
    "ESTABDATE",
    "ENDNAV",
    "FEGMRQ",
    "RLEVEL_SZ",
    "RISKLEVEL",
    "JJGS",
    "TGYH",
    "JJGSID",
    "JJJL",
    "NETNAV",
    "BENCH",
    "INDEXCODE",
    "INDEXNAME",
    "PRSVPERIOD",
    "PRSVDATE",
    "PRSVTYPE",
    "BUYTIME",
    "MGREXP",
    "TRUSTEXP",
    "SALESEXP",
];

/// Column name for a source payload key.
pub fn column_for_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FundDetail {
    pub code: String,
    pub feature: Option<String>,
    pub cycle: Option<String>,
    pub back_end_code: Option<String>,
    pub short_name: Option<String>,
    pub full_name: Option<String>,
    pub fund_type: Option<String>,
    pub established_on: Option<String>,
    pub asset_scale: Option<String>,
    pub scale_as_of: Option<String>,
    pub rating: Option<String>,
    pub risk_level: Option<String>,
    pub manager_company: Option<String>,
    pub custodian_bank: Option<String>,
    pub manager_company_id: Option<String>,
    pub fund_manager: Option<String>,
    pub initial_scale: Option<String>,
    pub benchmark: Option<String>,
    pub index_code: Option<String>,
    pub index_name: Option<String>,
    pub preservation_period: Option<String>,
    pub preservation_date: Option<String>,
    pub preservation_type: Option<String>,
    pub buy_time: Option<String>,
    pub management_fee: Option<String>,
    pub custody_fee: Option<String>,
    pub sales_fee: Option<String>,
    pub update_time: Option<DateTime<Utc>>,
}

impl FundDetail {
    /// Attribute values paired with their source key, in [`DETAIL_ATTRIBUTE_KEYS`] order.
    pub fn attributes(&self) -> [(&'static str, Option<&str>); 26] {
        let k = DETAIL_ATTRIBUTE_KEYS;
        [
            (k[0], self.feature.as_deref()),
            (k[1], self.cycle.as_deref()),
            (k[2], self.back_end_code.as_deref()),
            (k[3], self.short_name.as_deref()),
            (k[4], self.full_name.as_deref()),
            (k[5], self.fund_type.as_deref()),
            (k[6], self.established_on.as_deref()),
            (k[7], self.asset_scale.as_deref()),
            (k[8], self.scale_as_of.as_deref()),
            (k[9], self.rating.as_deref()),
            (k[10], self.risk_level.as_deref()),
            (k[11], self.manager_company.as_deref()),
            (k[12], self.custodian_bank.as_deref()),
            (k[13], self.manager_company_id.as_deref()),
            (k[14], self.fund_manager.as_deref()),
            (k[15], self.initial_scale.as_deref()),
            (k[16], self.benchmark.as_deref()),
            (k[17], self.index_code.as_deref()),
            (k[18], self.index_name.as_deref()),
            (k[19], self.preservation_period.as_deref()),
            (k[20], self.preservation_date.as_deref()),
            (k[21], self.preservation_type.as_deref()),
            (k[22], self.buy_time.as_deref()),
            (k[23], self.management_fee.as_deref()),
            (k[24], self.custody_fee.as_deref()),
            (k[25], self.sales_fee.as_deref()),
        ]
    }

    pub fn attributes_mut(&mut self) -> [(&'static str, &mut Option<String>); 26] {
        let k = DETAIL_ATTRIBUTE_KEYS;
        [
            (k[0], &mut self.feature),
            (k[1], &mut self.cycle),
            (k[2], &mut self.back_end_code),
            (k[3], &mut self.short_name),
            (k[4], &mut self.full_name),
            (k[5], &mut self.fund_type),
            (k[6], &mut self.established_on),
            (k[7], &mut self.asset_scale),
            (k[8], &mut self.scale_as_of),
            (k[9], &mut self.rating),
            (k[10], &mut self.risk_level),
            (k[11], &mut self.manager_company),
            (k[12], &mut self.custodian_bank),
            (k[13], &mut self.manager_company_id),
            (k[14], &mut self.fund_manager),
            (k[15], &mut self.initial_scale),
            (k[16], &mut self.benchmark),
            (k[17], &mut self.index_code),
            (k[18], &mut self.index_name),
            (k[19], &mut self.preservation_period),
            (k[20], &mut self.preservation_date),
            (k[21], &mut self.preservation_type),
            (k[22], &mut self.buy_time),
            (k[23], &mut self.management_fee),
            (k[24], &mut self.custody_fee),
            (k[25], &mut self.sales_fee),
        ]
    }
}

impl FundRecord for FundDetail {
    const DATASET: Dataset = Dataset::Detail;

    fn blank(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Default::default()
        }
    }

    fn code(&self) -> &str {
        &self.code
    }
}

/// Scalar text keys of the rate endpoint, in column order. `DTZT` is handled separately.
pub const RATE_ATTRIBUTE_KEYS: [&str; 12] = [
    "SGZT",
    "SHZT",
    "MINSG",
    "MINDT",
    "MAXSG",
    "MINSSG",
    "MINSBSG",
    "SSBCFMDATA",
    "RDMCFMDATA",
    "MGREXP",
    "TRUSTEXP",
    "SALESEXP",
];

pub const INSTALLMENT_FLAG_KEY: &str = "DTZT";

/// One (threshold, rate) row of a fee schedule. Both halves are raw source text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeTier {
    pub bound: Option<String>,
    pub rate: Option<String>,
}

impl FeeTier {
    pub fn is_set(&self) -> bool {
        self.bound.is_some() || self.rate.is_some()
    }
}

/// Shape of a fee-tier sub-list and of the numbered columns it flattens into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSpec {
    /// Payload key of the sub-list, also the column prefix.
    pub prefix: &'static str,
    pub bound_key: &'static str,
    pub rate_key: &'static str,
    pub max_tiers: usize,
}

pub const SUBSCRIPTION_TIERS: TierSpec = TierSpec {
    prefix: "sg",
    bound_key: "money",
    rate_key: "rate",
    max_tiers: 5,
};

pub const REDEMPTION_TIERS: TierSpec = TierSpec {
    prefix: "sh",
    bound_key: "time",
    rate_key: "rate",
    max_tiers: 7,
};

impl TierSpec {
    /// `(bound, rate)` column names for tier `n` (1-based).
    pub fn columns_for(&self, n: usize) -> (String, String) {
        (
            format!("{}_{}{}", self.prefix, self.bound_key, n),
            format!("{}_{}{}", self.prefix, self.rate_key, n),
        )
    }

    pub fn column_names(&self) -> Vec<String> {
        (1..=self.max_tiers)
            .flat_map(|n| {
                let (bound, rate) = self.columns_for(n);
                [bound, rate]
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FundRate {
    pub code: String,
    pub subscription_status: Option<String>,
    pub redemption_status: Option<String>,
    pub min_subscription: Option<String>,
    pub min_installment: Option<String>,
    pub max_daily_subscription: Option<String>,
    pub min_first_purchase: Option<String>,
    pub min_additional_purchase: Option<String>,
    pub subscription_confirm_days: Option<String>,
    pub redemption_confirm_days: Option<String>,
    pub management_fee: Option<String>,
    pub custody_fee: Option<String>,
    pub sales_fee: Option<String>,
    pub installment_enabled: bool,
    pub subscription_tiers: [FeeTier; 5],
    pub redemption_tiers: [FeeTier; 7],
    pub update_time: Option<DateTime<Utc>>,
}

impl FundRate {
    pub fn attributes(&self) -> [(&'static str, Option<&str>); 12] {
        let k = RATE_ATTRIBUTE_KEYS;
        [
            (k[0], self.subscription_status.as_deref()),
            (k[1], self.redemption_status.as_deref()),
            (k[2], self.min_subscription.as_deref()),
            (k[3], self.min_installment.as_deref()),
            (k[4], self.max_daily_subscription.as_deref()),
            (k[5], self.min_first_purchase.as_deref()),
            (k[6], self.min_additional_purchase.as_deref()),
            (k[7], self.subscription_confirm_days.as_deref()),
            (k[8], self.redemption_confirm_days.as_deref()),
            (k[9], self.management_fee.as_deref()),
            (k[10], self.custody_fee.as_deref()),
            (k[11], self.sales_fee.as_deref()),
        ]
    }

    pub fn attributes_mut(&mut self) -> [(&'static str, &mut Option<String>); 12] {
        let k = RATE_ATTRIBUTE_KEYS;
        [
            (k[0], &mut self.subscription_status),
            (k[1], &mut self.redemption_status),
            (k[2], &mut self.min_subscription),
            (k[3], &mut self.min_installment),
            (k[4], &mut self.max_daily_subscription),
            (k[5], &mut self.min_first_purchase),
            (k[6], &mut self.min_additional_purchase),
            (k[7], &mut self.subscription_confirm_days),
            (k[8], &mut self.redemption_confirm_days),
            (k[9], &mut self.management_fee),
            (k[10], &mut self.custody_fee),
            (k[11], &mut self.sales_fee),
        ]
    }

    pub fn tiers(&self, spec: &TierSpec) -> &[FeeTier] {
        if spec.prefix == SUBSCRIPTION_TIERS.prefix {
            &self.subscription_tiers
        } else {
            &self.redemption_tiers
        }
    }

    pub fn tiers_mut(&mut self, spec: &TierSpec) -> &mut [FeeTier] {
        if spec.prefix == SUBSCRIPTION_TIERS.prefix {
            &mut self.subscription_tiers
        } else {
            &mut self.redemption_tiers
        }
    }
}

impl FundRecord for FundRate {
    const DATASET: Dataset = Dataset::Rate;

    fn blank(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Default::default()
        }
    }

    fn code(&self) -> &str {
        &self.code
    }
}
