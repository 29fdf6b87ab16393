//! Pure conversion of Eastmoney payloads into fund entities.
//!
//! Mapping is total over the declared attribute set: a missing key is an error because it
//! means the upstream schema changed. Mapping produces an update value first and applies it
//! afterwards, so a failed mapping never leaves an entity half-written.

use fundex_core::{
    FeeTier, FundDetail, FundRate, TierSpec, DETAIL_ATTRIBUTE_KEYS, INSTALLMENT_FLAG_KEY,
    RATE_ATTRIBUTE_KEYS, REDEMPTION_TIERS, SUBSCRIPTION_TIERS,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("payload is missing field {0}")]
    MissingField(String),
    #[error("field {key} holds a non-scalar value")]
    InvalidValue { key: String },
    #[error("field {key} is not an integer flag: {value:?}")]
    InvalidFlag { key: String, value: String },
}

fn scalar_text(key: &str, value: &JsonValue) -> Result<Option<String>, MappingError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        JsonValue::Bool(b) => Ok(Some(b.to_string())),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(MappingError::InvalidValue {
            key: key.to_string(),
        }),
    }
}

/// Required key, nullable value.
pub fn required_text(raw: &RawRecord, key: &str) -> Result<Option<String>, MappingError> {
    let value = raw
        .get(key)
        .ok_or_else(|| MappingError::MissingField(key.to_string()))?;
    scalar_text(key, value)
}

/// Mapped detail attributes, ready to be applied to a new or existing [`FundDetail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailUpdate {
    /// The payload's own `FCODE`, which may differ from the requested code.
    pub payload_code: Option<String>,
    values: Vec<Option<String>>,
}

impl DetailUpdate {
    pub fn apply_to(&self, detail: &mut FundDetail) {
        for ((_, slot), value) in detail.attributes_mut().into_iter().zip(&self.values) {
            *slot = value.clone();
        }
    }
}

pub fn map_detail(raw: &RawRecord) -> Result<DetailUpdate, MappingError> {
    let payload_code = required_text(raw, "FCODE")?;
    let values = DETAIL_ATTRIBUTE_KEYS
        .iter()
        .map(|key| required_text(raw, key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DetailUpdate {
        payload_code,
        values,
    })
}

/// The first `min(len, max_tiers)` entries of a tier sub-list, in payload order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedTiers {
    pub spec: TierSpec,
    pub tiers: Vec<FeeTier>,
    /// Entries past `max_tiers`, kept out of storage.
    pub dropped: usize,
}

impl FlattenedTiers {
    /// `({prefix}_{field}{n}, value)` pairs, n starting at 1.
    pub fn named_fields(&self) -> Vec<(String, Option<String>)> {
        self.tiers
            .iter()
            .enumerate()
            .flat_map(|(i, tier)| {
                let (bound_col, rate_col) = self.spec.columns_for(i + 1);
                [(bound_col, tier.bound.clone()), (rate_col, tier.rate.clone())]
            })
            .collect()
    }

    /// Tier N lands in slot N; slots past the payload length are cleared.
    pub fn apply_to(&self, slots: &mut [FeeTier]) {
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = self.tiers.get(i).cloned().unwrap_or_default();
        }
    }
}

/// `None` for a null or absent list: callers leave the stored tiers untouched.
pub fn flatten_tiers(
    list: Option<&JsonValue>,
    spec: &TierSpec,
) -> Result<Option<FlattenedTiers>, MappingError> {
    let entries = match list {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::Array(entries)) => entries,
        Some(_) => {
            return Err(MappingError::InvalidValue {
                key: spec.prefix.to_string(),
            })
        }
    };

    let kept = entries.len().min(spec.max_tiers);
    let tiers = entries[..kept]
        .iter()
        .map(|entry| -> Result<FeeTier, MappingError> {
            let entry = entry.as_object().ok_or_else(|| MappingError::InvalidValue {
                key: spec.prefix.to_string(),
            })?;
            Ok(FeeTier {
                bound: required_text(entry, spec.bound_key)?,
                rate: required_text(entry, spec.rate_key)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(FlattenedTiers {
        spec: *spec,
        tiers,
        dropped: entries.len() - kept,
    }))
}

/// `DTZT`: trimmed integer text, absent or empty meaning 0.
pub fn parse_installment_flag(raw: &RawRecord) -> Result<bool, MappingError> {
    let invalid = |value: String| MappingError::InvalidFlag {
        key: INSTALLMENT_FLAG_KEY.to_string(),
        value,
    };
    match raw.get(INSTALLMENT_FLAG_KEY) {
        None | Some(JsonValue::Null) => Ok(false),
        Some(JsonValue::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(false);
            }
            trimmed
                .parse::<i64>()
                .map(|v| v != 0)
                .map_err(|_| invalid(s.clone()))
        }
        Some(JsonValue::Number(n)) => n.as_i64().map(|v| v != 0).ok_or_else(|| invalid(n.to_string())),
        Some(other) => Err(invalid(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateUpdate {
    values: Vec<Option<String>>,
    pub installment_enabled: bool,
    pub subscription: Option<FlattenedTiers>,
    pub redemption: Option<FlattenedTiers>,
}

impl RateUpdate {
    pub fn dropped_tiers(&self) -> usize {
        [&self.subscription, &self.redemption]
            .into_iter()
            .flatten()
            .map(|t| t.dropped)
            .sum()
    }

    pub fn apply_to(&self, rate: &mut FundRate) {
        for ((_, slot), value) in rate.attributes_mut().into_iter().zip(&self.values) {
            *slot = value.clone();
        }
        rate.installment_enabled = self.installment_enabled;
        if let Some(tiers) = &self.subscription {
            tiers.apply_to(&mut rate.subscription_tiers);
        }
        if let Some(tiers) = &self.redemption {
            tiers.apply_to(&mut rate.redemption_tiers);
        }
    }
}

pub fn map_rate(raw: &RawRecord) -> Result<RateUpdate, MappingError> {
    let values = RATE_ATTRIBUTE_KEYS
        .iter()
        .map(|key| required_text(raw, key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RateUpdate {
        values,
        installment_enabled: parse_installment_flag(raw)?,
        subscription: flatten_tiers(raw.get(SUBSCRIPTION_TIERS.prefix), &SUBSCRIPTION_TIERS)?,
        redemption: flatten_tiers(raw.get(REDEMPTION_TIERS.prefix), &REDEMPTION_TIERS)?,
    })
}
