//! Source clients for the Howbuy and Eastmoney fund endpoints + the payload field mapper.

pub mod mapper;

use async_trait::async_trait;
use fundex_core::{ListedFund, NameSide, Payload};
use fundex_storage::{decode_json, strip_envelope, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub use mapper::{
    flatten_tiers, map_detail, map_rate, parse_installment_flag, DetailUpdate, FlattenedTiers,
    MappingError, RateUpdate, RawRecord,
};

pub const CRATE_NAME: &str = "fundex-adapters";

pub const HOWBUY_RANKING_URL: &str = "https://www.howbuy.com/fund/fundranking/ajax.htm";
pub const EASTMONEY_SUGGEST_URL: &str = "https://m.1234567.com.cn/data/FundSuggestList.js";
pub const EASTMONEY_CODE_SEARCH_URL: &str = "http://fund.eastmoney.com/js/fundcode_search.js";
pub const EASTMONEY_DETAIL_URL: &str = "https://fundmobapi.eastmoney.com/FundMApi/FundDetailInformation.ashx?FCODE={code}&deviceid=Wap&plat=Wap&product=EFund&version=2.0.0";
pub const EASTMONEY_RATE_URL: &str = "https://fundmobapi.eastmoney.com/FundMApi/FundRateInfo.ashx?FCODE={code}&deviceid=Wap&plat=Wap&product=EFund&version=2.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Paged form POST, `{"list": [{"jjdm", "jjjc"}]}`.
    HowbuyRanking,
    /// `var ... = {"Datas": ["code|abbr|name|..."]};`
    EastmoneySuggest,
    /// `var r = [[code, abbr, name, type, pinyin], ...];`
    EastmoneyCodeSearch,
}

impl SourceKind {
    pub fn side(&self) -> NameSide {
        match self {
            SourceKind::HowbuyRanking => NameSide::Howbuy,
            SourceKind::EastmoneySuggest | SourceKind::EastmoneyCodeSearch => NameSide::Eastmoney,
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            SourceKind::HowbuyRanking => HOWBUY_RANKING_URL,
            SourceKind::EastmoneySuggest => EASTMONEY_SUGGEST_URL,
            SourceKind::EastmoneyCodeSearch => EASTMONEY_CODE_SEARCH_URL,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl AdapterError {
    pub fn is_network(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.is_network())
    }
}

/// A listing endpoint naming funds from one side of the identity merge.
///
/// Pages are numbered from 1 and an empty page ends the listing. Pacing between pages is left
/// to the caller.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    fn source_id(&self) -> &str;

    fn side(&self) -> NameSide;

    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<Vec<ListedFund>, AdapterError>;
}

pub fn identity_source_for(source_id: &str, kind: SourceKind, url: &str) -> Box<dyn IdentitySource> {
    let source_id = source_id.to_string();
    let url = url.to_string();
    match kind {
        SourceKind::HowbuyRanking => Box::new(HowbuyRankingSource { source_id, url }),
        SourceKind::EastmoneySuggest => Box::new(EastmoneySuggestSource { source_id, url }),
        SourceKind::EastmoneyCodeSearch => Box::new(EastmoneyCodeSearchSource { source_id, url }),
    }
}

fn text_field(item: &JsonValue, key: &str) -> Result<Option<String>, MappingError> {
    match item.get(key) {
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Null) => Ok(None),
        Some(_) => Err(MappingError::InvalidValue {
            key: key.to_string(),
        }),
        None => Err(MappingError::MissingField(key.to_string())),
    }
}

fn listed_fund(code: Option<String>, name: Option<String>) -> Result<ListedFund, MappingError> {
    let code = code.ok_or_else(|| MappingError::MissingField("jjdm".to_string()))?;
    Ok(ListedFund { code, name })
}

#[derive(Debug, Clone)]
pub struct HowbuyRankingSource {
    source_id: String,
    url: String,
}

impl HowbuyRankingSource {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
        }
    }

    fn form(page: u32) -> Vec<(&'static str, String)> {
        let mut form: Vec<(&'static str, String)> = [
            "orderField",
            "orderType",
            "glrm",
            "keyword",
            "bd",
            "ed",
            "radio",
        ]
        .into_iter()
        .map(|k| (k, String::new()))
        .collect();
        form.push(("page", page.to_string()));
        form.push(("cat", "index.htm".to_string()));
        form
    }
}

#[async_trait]
impl IdentitySource for HowbuyRankingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn side(&self) -> NameSide {
        NameSide::Howbuy
    }

    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<Vec<ListedFund>, AdapterError> {
        let value = http.post_form_json(&self.url, &Self::form(page)).await?;
        let items = match value.get("list") {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(JsonValue::Null) => &[],
            _ => return Err(FetchError::envelope(&self.url, "missing `list` array").into()),
        };
        debug!(source_id = %self.source_id, page, items = items.len(), "fetched ranking page");
        items
            .iter()
            .map(|item| -> Result<ListedFund, AdapterError> {
                Ok(listed_fund(
                    text_field(item, "jjdm")?,
                    text_field(item, "jjjc")?,
                )?)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct EastmoneySuggestSource {
    source_id: String,
    url: String,
}

pub fn parse_suggest_list(url: &str, body: &str) -> Result<Vec<ListedFund>, AdapterError> {
    let value = decode_json(url, strip_envelope(url, body, 16, 3)?)?;
    let entries = value
        .get("Datas")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::envelope(url, "missing `Datas` array"))?;
    entries
        .iter()
        .map(|entry| -> Result<ListedFund, AdapterError> {
            let line = entry.as_str().ok_or_else(|| MappingError::InvalidValue {
                key: "Datas".to_string(),
            })?;
            let parts: Vec<&str> = line.split('|').collect();
            match (parts.first(), parts.get(2)) {
                (Some(code), Some(name)) => Ok(ListedFund::new(*code, *name)),
                _ => Err(FetchError::envelope(url, format!("short suggest entry {line:?}")).into()),
            }
        })
        .collect()
}

#[async_trait]
impl IdentitySource for EastmoneySuggestSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn side(&self) -> NameSide {
        NameSide::Eastmoney
    }

    /// The whole list arrives as page 1.
    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<Vec<ListedFund>, AdapterError> {
        if page > 1 {
            return Ok(Vec::new());
        }
        let body = http.get_text(&self.url).await?;
        parse_suggest_list(&self.url, &body)
    }
}

#[derive(Debug, Clone)]
pub struct EastmoneyCodeSearchSource {
    source_id: String,
    url: String,
}

pub fn parse_code_search(url: &str, body: &str) -> Result<Vec<ListedFund>, AdapterError> {
    let value = decode_json(url, strip_envelope(url, body, 8, 1)?)?;
    let rows = value
        .as_array()
        .ok_or_else(|| FetchError::envelope(url, "expected an array of rows"))?;
    rows.iter()
        .map(|row| -> Result<ListedFund, AdapterError> {
            let code = row.get(0).and_then(JsonValue::as_str);
            match (code, row.get(2)) {
                (Some(code), Some(JsonValue::String(name))) => Ok(ListedFund::new(code, name.as_str())),
                (Some(code), Some(JsonValue::Null)) => Ok(ListedFund::unnamed(code)),
                _ => Err(FetchError::envelope(url, format!("malformed code row {row}")).into()),
            }
        })
        .collect()
}

#[async_trait]
impl IdentitySource for EastmoneyCodeSearchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn side(&self) -> NameSide {
        NameSide::Eastmoney
    }

    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<Vec<ListedFund>, AdapterError> {
        if page > 1 {
            return Ok(Vec::new());
        }
        let body = http.get_text(&self.url).await?;
        parse_code_search(&self.url, &body)
    }
}

/// Keyed detail and rate endpoints of the Eastmoney mobile API.
///
/// URL templates carry a `{code}` placeholder. Pacing is left to the caller so that skipped
/// codes cost nothing.
#[derive(Debug, Clone)]
pub struct FundApiClient {
    detail_url: String,
    rate_url: String,
}

impl Default for FundApiClient {
    fn default() -> Self {
        Self::new(EASTMONEY_DETAIL_URL, EASTMONEY_RATE_URL)
    }
}

impl FundApiClient {
    pub fn new(detail_url: impl Into<String>, rate_url: impl Into<String>) -> Self {
        Self {
            detail_url: detail_url.into(),
            rate_url: rate_url.into(),
        }
    }

    pub async fn fetch_detail(&self, http: &HttpFetcher, code: &str) -> Result<Payload, AdapterError> {
        fetch_datas(http, &self.detail_url.replace("{code}", code)).await
    }

    pub async fn fetch_rate(&self, http: &HttpFetcher, code: &str) -> Result<Payload, AdapterError> {
        fetch_datas(http, &self.rate_url.replace("{code}", code)).await
    }
}

async fn fetch_datas(http: &HttpFetcher, url: &str) -> Result<Payload, AdapterError> {
    let mut value = http.get_json(url).await?;
    let Some(datas) = value.get_mut("Datas").map(JsonValue::take) else {
        return Ok(Payload::Empty);
    };
    Payload::from_datas(datas)
        .ok_or_else(|| FetchError::envelope(url, "`Datas` is not an object").into())
}
