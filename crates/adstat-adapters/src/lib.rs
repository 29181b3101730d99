//! AdStat reporting API adapter: login, report request and record mapping.

use adstat_core::{RowMetadata, StatisticRow, Variant};
use adstat_http::{FetchError, HttpClientConfig, HttpSession};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "adstat-adapters";

pub const DEFAULT_BASE_URL: &str = "https://client.adstat.pro";
pub const LOGIN_PATH: &str = "/api/v2/login";
pub const REPORT_PATH: &str = "/api/report/tgview";

pub const PLATFORM_ID: u32 = 10;
pub const PARTNER_ID: u32 = 2;
pub const CURRENCY_CODE: &str = "EUR";
pub const ADS_TRAILING_MINUTES: i64 = 75;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("missing AdStat credentials (set ADSTAT_USERNAME and ADSTAT_PASSWORD)")]
    MissingCredentials,
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("record {index}: {source}")]
    Mapping {
        index: usize,
        #[source]
        source: MappingError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has unusable value {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Anything that can produce one fetch window worth of rows.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    fn variant(&self) -> Variant;

    async fn fetch(&self) -> Result<Vec<StatisticRow>, SourceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Time range requested from the report endpoint, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

impl FetchWindow {
    /// The whole UTC calendar day containing `now - 1h`, so the last hour of a
    /// day is still picked up shortly after midnight.
    pub fn calendar_day_of_previous_hour(now: DateTime<Utc>) -> Self {
        let day = (now - Duration::hours(1)).date_naive();
        let start = day.and_time(NaiveTime::MIN).and_utc();
        Self {
            date_from: start,
            date_to: start + Duration::days(1) - Duration::milliseconds(1),
        }
    }

    pub fn trailing(now: DateTime<Utc>, minutes: i64) -> Self {
        Self {
            date_from: now - Duration::minutes(minutes),
            date_to: now,
        }
    }

    pub fn for_variant(variant: Variant, now: DateTime<Utc>) -> Self {
        match variant {
            Variant::Accounts | Variant::Campaigns => Self::calendar_day_of_previous_hour(now),
            Variant::Ads => Self::trailing(now, ADS_TRAILING_MINUTES),
        }
    }
}

fn format_bound(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub date_from: String,
    pub date_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grouping {
    pub name: &'static str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,
}

impl Grouping {
    fn plain(name: &'static str) -> Self {
        Self { name, kind: None }
    }

    fn typed(name: &'static str, kind: u8) -> Self {
        Self { name, kind: Some(kind) }
    }
}

/// Request body of the report endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportFilters {
    pub date: DateRange,
    pub platform: Vec<u32>,
    pub partner: Vec<u32>,
    pub campaign: Vec<u32>,
    pub group_time: u8,
    pub groupings: Vec<Grouping>,
    pub object: Vec<String>,
    pub sub_client: Vec<String>,
    pub type_cab: Option<u8>,
    pub account_uids: Vec<String>,
    pub currency_code: &'static str,
    pub use_account_currency: bool,
}

impl ReportFilters {
    pub fn new(variant: Variant, window: FetchWindow) -> Self {
        let groupings = match variant {
            Variant::Accounts => vec![
                Grouping::plain("object"),
                Grouping::typed("account", 1),
                Grouping::typed("date", 1),
            ],
            Variant::Campaigns => vec![
                Grouping::plain("object"),
                Grouping::plain("campaign"),
                Grouping::typed("account", 1),
                Grouping::typed("date", 1),
            ],
            Variant::Ads => vec![
                Grouping::plain("object"),
                Grouping::plain("ad"),
                Grouping::typed("date", 1),
            ],
        };
        Self {
            date: DateRange {
                date_from: format_bound(window.date_from),
                date_to: format_bound(window.date_to),
            },
            platform: vec![PLATFORM_ID],
            partner: vec![PARTNER_ID],
            campaign: Vec::new(),
            group_time: 1,
            groupings,
            object: Vec::new(),
            sub_client: Vec::new(),
            type_cab: None,
            account_uids: Vec::new(),
            currency_code: CURRENCY_CODE,
            use_account_currency: false,
        }
    }
}

/// One record of the report response, before typing. Every field is optional
/// on the wire; [`map_record`] decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteStatistic {
    pub date: Option<JsonValue>,
    pub object: Option<JsonValue>,
    pub unit: Option<JsonValue>,
    pub account_name: Option<JsonValue>,
    pub ad_id: Option<JsonValue>,
    pub spent: Option<JsonValue>,
    pub impressions: Option<JsonValue>,
    pub goals: Option<JsonValue>,
    pub price_target: Option<JsonValue>,
    pub cpm: Option<JsonValue>,
    pub clicks: Option<JsonValue>,
    pub cpc: Option<JsonValue>,
    pub ctr: Option<JsonValue>,
    pub ad_type: Option<JsonValue>,
    pub campaign_plat: Option<JsonValue>,
    pub ad_text: Option<JsonValue>,
    pub topics: Option<JsonValue>,
    pub channels: Option<JsonValue>,
    pub languages: Option<JsonValue>,
    pub countries: Option<JsonValue>,
    pub user_locations: Option<JsonValue>,
    pub user_channels: Option<JsonValue>,
    pub promote_url: Option<JsonValue>,
    pub website_name: Option<JsonValue>,
    pub views_per_users: Option<JsonValue>,
    pub button_type: Option<JsonValue>,
    pub media_type: Option<JsonValue>,
    pub only_crypto: Option<JsonValue>,
    pub exclude_crypto: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportResponse {
    #[serde(default)]
    pub results: Vec<RemoteStatistic>,
}

fn json_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_text(value: Option<&JsonValue>, field: &'static str) -> Result<String, MappingError> {
    match value {
        None | Some(JsonValue::Null) => Err(MappingError::MissingField(field)),
        Some(v) => json_text(Some(v)).ok_or_else(|| MappingError::InvalidValue {
            field,
            value: v.to_string(),
        }),
    }
}

fn json_f64(value: Option<&JsonValue>, field: &'static str) -> Result<Option<f64>, MappingError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => Ok(n.as_f64()),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s.trim().parse().map(Some).map_err(|_| MappingError::InvalidValue {
            field,
            value: s.clone(),
        }),
        Some(other) => Err(MappingError::InvalidValue {
            field,
            value: other.to_string(),
        }),
    }
}

fn json_i32(value: Option<&JsonValue>, field: &'static str) -> Result<Option<i32>, MappingError> {
    let Some(number) = json_f64(value, field)? else {
        return Ok(None);
    };
    if number.fract() != 0.0 || number < i32::MIN as f64 || number > i32::MAX as f64 {
        return Err(MappingError::InvalidValue {
            field,
            value: number.to_string(),
        });
    }
    Ok(Some(number as i32))
}

fn json_bool(value: Option<&JsonValue>, field: &'static str) -> Result<Option<bool>, MappingError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(JsonValue::Number(n)) if n.as_i64() == Some(0) => Ok(Some(false)),
        Some(JsonValue::Number(n)) if n.as_i64() == Some(1) => Ok(Some(true)),
        Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            "" => Ok(None),
            _ => Err(MappingError::InvalidValue {
                field,
                value: s.clone(),
            }),
        },
        Some(other) => Err(MappingError::InvalidValue {
            field,
            value: other.to_string(),
        }),
    }
}

fn json_string_vec(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().filter_map(|v| json_text(Some(v))).collect(),
        Some(JsonValue::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn json_date(value: Option<&JsonValue>) -> Result<NaiveDate, MappingError> {
    let text = required_text(value, "date")?;
    // "2024-05-01", "2024-05-01T00:00:00Z" and "2024-05-01 00:00:00" all carry
    // the day in their first ten characters.
    let parsed = text
        .get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok());
    parsed.ok_or(MappingError::InvalidValue {
        field: "date",
        value: text,
    })
}

/// Map one remote record into a typed row. The correspondence between remote
/// fields and columns is fixed per variant.
pub fn map_record(record: &RemoteStatistic, variant: Variant) -> Result<StatisticRow, MappingError> {
    let date = json_date(record.date.as_ref())?;
    let (object_key, account_key) = match variant {
        Variant::Accounts | Variant::Campaigns => (
            required_text(record.object.as_ref(), "object")?,
            required_text(record.account_name.as_ref(), "account_name")?,
        ),
        Variant::Ads => (
            required_text(record.unit.as_ref(), "unit")?,
            required_text(record.ad_id.as_ref(), "ad_id")?,
        ),
    };

    let mut row = StatisticRow::new(date, object_key, account_key);
    row.spent = json_f64(record.spent.as_ref(), "spent")?;
    row.impressions = json_f64(record.impressions.as_ref(), "impressions")?;
    row.goals = json_f64(record.goals.as_ref(), "goals")?;
    row.price_target = json_f64(record.price_target.as_ref(), "price_target")?;
    row.cpm = json_f64(record.cpm.as_ref(), "cpm")?;
    row.clicks = json_i32(record.clicks.as_ref(), "clicks")?;
    row.cpc = json_f64(record.cpc.as_ref(), "cpc")?;
    row.ctr = json_f64(record.ctr.as_ref(), "ctr")?;
    row.metadata = map_metadata(record, variant)?;
    Ok(row)
}

fn map_metadata(record: &RemoteStatistic, variant: Variant) -> Result<RowMetadata, MappingError> {
    let mut meta = RowMetadata::default();
    match variant {
        Variant::Accounts => {}
        Variant::Campaigns => {
            meta.ad_type = json_text(record.ad_type.as_ref());
            meta.campaign_plat = json_text(record.campaign_plat.as_ref());
        }
        Variant::Ads => {
            meta.account_name = json_text(record.account_name.as_ref());
            meta.ad_type = json_text(record.ad_type.as_ref());
            meta.ad_text = json_text(record.ad_text.as_ref());
            meta.topics = json_string_vec(record.topics.as_ref());
            meta.channels = json_string_vec(record.channels.as_ref());
            meta.languages = json_string_vec(record.languages.as_ref());
            meta.countries = json_string_vec(record.countries.as_ref());
            meta.user_locations = json_string_vec(record.user_locations.as_ref());
            meta.user_channels = json_string_vec(record.user_channels.as_ref());
            meta.promote_url = json_text(record.promote_url.as_ref());
            meta.website_name = json_text(record.website_name.as_ref());
            meta.views_per_users = json_f64(record.views_per_users.as_ref(), "views_per_users")?;
            meta.button_type = json_text(record.button_type.as_ref());
            meta.media_type = json_text(record.media_type.as_ref());
            meta.only_crypto = json_bool(record.only_crypto.as_ref(), "only_crypto")?;
            meta.exclude_crypto = json_bool(record.exclude_crypto.as_ref(), "exclude_crypto")?;
        }
    }
    Ok(meta)
}

/// Map a whole response, keeping the remote order. The first unusable record
/// fails the batch.
pub fn map_records(records: &[RemoteStatistic], variant: Variant) -> Result<Vec<StatisticRow>, SourceError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| map_record(record, variant).map_err(|source| SourceError::Mapping { index, source }))
        .collect()
}

#[derive(Debug, Clone)]
pub struct AdstatSourceConfig {
    pub base_url: String,
    pub credentials: Credentials,
    pub variant: Variant,
    pub http: HttpClientConfig,
}

impl Default for AdstatSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials: Credentials::default(),
            variant: Variant::default(),
            http: HttpClientConfig::default(),
        }
    }
}

pub struct AdstatSource {
    base_url: String,
    credentials: Credentials,
    variant: Variant,
    http: HttpSession,
}

impl AdstatSource {
    pub fn new(config: AdstatSourceConfig) -> anyhow::Result<Self> {
        let http = HttpSession::new(config.http)?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials,
            variant: config.variant,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange username/password for a bearer token.
    pub async fn login(&self) -> Result<String, SourceError> {
        let (Some(username), Some(password)) = (&self.credentials.username, &self.credentials.password) else {
            return Err(SourceError::MissingCredentials);
        };
        let body: JsonValue = self
            .http
            .post_form(&self.url(LOGIN_PATH), &[("username", username.as_str()), ("password", password.as_str())])
            .await?;
        match body.get("access_token").and_then(JsonValue::as_str) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(SourceError::LoginRejected(
                body.get("detail")
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "response carried no access_token".to_string()),
            )),
        }
    }

    /// Log in and fetch the window that applies at `now`.
    pub async fn fetch_at(&self, now: DateTime<Utc>) -> Result<Vec<StatisticRow>, SourceError> {
        let token = self.login().await?;
        let window = FetchWindow::for_variant(self.variant, now);
        let filters = ReportFilters::new(self.variant, window);
        info!(
            variant = %self.variant,
            date_from = %filters.date.date_from,
            date_to = %filters.date.date_to,
            "requesting report"
        );
        debug!(filters = ?filters, "report filters");

        let report: ReportResponse = self
            .http
            .post_json(&self.url(REPORT_PATH), &filters, Some(&token))
            .await?;
        info!(records = report.results.len(), "report received");
        map_records(&report.results, self.variant)
    }
}

#[async_trait]
impl StatisticsSource for AdstatSource {
    fn variant(&self) -> Variant {
        self.variant
    }

    async fn fetch(&self) -> Result<Vec<StatisticRow>, SourceError> {
        self.fetch_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    fn record(value: JsonValue) -> RemoteStatistic {
        serde_json::from_value(value).expect("record")
    }

    #[test]
    fn window_covers_day_of_previous_hour() {
        let window = FetchWindow::calendar_day_of_previous_hour(at(2024, 5, 2, 0, 30));
        let filters = ReportFilters::new(Variant::Accounts, window);
        assert_eq!(filters.date.date_from, "2024-05-01T00:00:00.000Z");
        assert_eq!(filters.date.date_to, "2024-05-01T23:59:59.999Z");

        let window = FetchWindow::calendar_day_of_previous_hour(at(2024, 5, 2, 13, 5));
        assert_eq!(window.date_from, at(2024, 5, 2, 0, 0));
    }

    #[test]
    fn ads_window_trails_seventy_five_minutes() {
        let now = at(2024, 5, 2, 10, 0);
        let window = FetchWindow::for_variant(Variant::Ads, now);
        assert_eq!(window.date_from, at(2024, 5, 2, 8, 45));
        assert_eq!(window.date_to, now);
    }

    #[test]
    fn filters_serialize_to_report_body() {
        let window = FetchWindow::calendar_day_of_previous_hour(at(2024, 5, 2, 13, 0));
        let body = serde_json::to_value(ReportFilters::new(Variant::Accounts, window)).unwrap();
        assert_eq!(
            body,
            json!({
                "date": {"date_from": "2024-05-02T00:00:00.000Z", "date_to": "2024-05-02T23:59:59.999Z"},
                "platform": [10],
                "partner": [2],
                "campaign": [],
                "group_time": 1,
                "groupings": [
                    {"name": "object"},
                    {"name": "account", "type": 1},
                    {"name": "date", "type": 1}
                ],
                "object": [],
                "sub_client": [],
                "type_cab": null,
                "account_uids": [],
                "currency_code": "EUR",
                "use_account_currency": false
            })
        );
    }

    #[test]
    fn maps_account_record() {
        let row = map_record(
            &record(json!({
                "date": "2024-05-01",
                "object": "u1",
                "account_name": "acct",
                "clicks": 3,
                "spent": 1.2,
                "impressions": "150",
                "cpc": null
            })),
            Variant::Accounts,
        )
        .unwrap();

        assert_eq!(row.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(row.object_key, "u1");
        assert_eq!(row.account_key, "acct");
        assert_eq!(row.clicks, Some(3));
        assert_eq!(row.spent, Some(1.2));
        assert_eq!(row.impressions, Some(150.0));
        assert_eq!(row.cpc, None);
        assert_eq!(row.metadata, RowMetadata::default());
    }

    #[test]
    fn integer_object_ids_and_timestamped_dates_are_normalised() {
        let row = map_record(
            &record(json!({"date": "2024-05-01T00:00:00Z", "object": 4242, "account_name": "acct"})),
            Variant::Accounts,
        )
        .unwrap();
        assert_eq!(row.object_key, "4242");
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    #[test]
    fn missing_key_component_is_rejected() {
        let err = map_record(&record(json!({"date": "2024-05-01", "object": "u1"})), Variant::Accounts).unwrap_err();
        assert_eq!(err, MappingError::MissingField("account_name"));

        let err = map_record(&record(json!({"date": "yesterday", "object": "u1", "account_name": "a"})), Variant::Accounts)
            .unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { field: "date", .. }));
    }

    #[test]
    fn fractional_clicks_are_rejected() {
        let err = map_record(
            &record(json!({"date": "2024-05-01", "object": "u1", "account_name": "a", "clicks": 2.5})),
            Variant::Accounts,
        )
        .unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { field: "clicks", .. }));
    }

    #[test]
    fn ads_record_keys_on_unit_and_ad_id_and_keeps_targeting() {
        let row = map_record(
            &record(json!({
                "date": "2024-05-01",
                "unit": 17,
                "ad_id": "ad-9",
                "account_name": "acct",
                "ad_text": "Join now",
                "topics": ["crypto", "finance"],
                "countries": "DE",
                "only_crypto": 1,
                "exclude_crypto": "false",
                "views_per_users": "1.5"
            })),
            Variant::Ads,
        )
        .unwrap();

        assert_eq!(row.object_key, "17");
        assert_eq!(row.account_key, "ad-9");
        assert_eq!(row.metadata.account_name.as_deref(), Some("acct"));
        assert_eq!(row.metadata.topics, vec!["crypto", "finance"]);
        assert_eq!(row.metadata.countries, vec!["DE"]);
        assert_eq!(row.metadata.only_crypto, Some(true));
        assert_eq!(row.metadata.exclude_crypto, Some(false));
        assert_eq!(row.metadata.views_per_users, Some(1.5));
    }

    #[test]
    fn map_records_reports_failing_index() {
        let records = vec![
            record(json!({"date": "2024-05-01", "object": "u1", "account_name": "a"})),
            record(json!({"date": "2024-05-01", "account_name": "a"})),
        ];
        match map_records(&records, Variant::Accounts) {
            Err(SourceError::Mapping { index, source }) => {
                assert_eq!(index, 1);
                assert_eq!(source, MappingError::MissingField("object"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_credentials_fail_at_fetch_time() {
        let source = AdstatSource::new(AdstatSourceConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        })
        .expect("source");
        assert!(matches!(source.fetch().await, Err(SourceError::MissingCredentials)));
    }
}
