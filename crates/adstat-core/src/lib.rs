//! Core domain model for the AdStat statistics import.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "adstat-core";

/// Deployment variant. Decides the destination table, the natural key shape
/// and which metadata columns are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// `(date, object, account_name)` with plain metrics.
    #[default]
    Accounts,
    /// `(date, object, account_name)` plus campaign metadata.
    Campaigns,
    /// `(date, unit, ad_id)` plus ad creative and targeting metadata.
    Ads,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Campaigns => "campaigns",
            Self::Ads => "ads",
        }
    }

    pub fn default_table(&self) -> &'static str {
        match self {
            Self::Accounts => "statistics",
            Self::Campaigns => "campaign_statistics",
            Self::Ads => "ad_statistics",
        }
    }

    /// Names of the natural-key columns, in key order. The remote API uses the
    /// same names for the corresponding record fields.
    pub fn key_columns(&self) -> [&'static str; 3] {
        match self {
            Self::Accounts | Self::Campaigns => ["date", "object", "account_name"],
            Self::Ads => ["date", "unit", "ad_id"],
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}` (expected accounts, campaigns or ads)")]
pub struct UnknownVariant(pub String);

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accounts" | "account" => Ok(Self::Accounts),
            "campaigns" | "campaign" => Ok(Self::Campaigns),
            "ads" | "ad" => Ok(Self::Ads),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Natural key of a statistic row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatKey {
    pub date: NaiveDate,
    pub object_key: String,
    pub account_key: String,
}

/// Optional descriptive columns. Which of them are persisted depends on the
/// [`Variant`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowMetadata {
    pub account_name: Option<String>,
    pub ad_type: Option<String>,
    pub campaign_plat: Option<String>,
    pub ad_text: Option<String>,
    pub topics: Vec<String>,
    pub channels: Vec<String>,
    pub languages: Vec<String>,
    pub countries: Vec<String>,
    pub user_locations: Vec<String>,
    pub user_channels: Vec<String>,
    pub promote_url: Option<String>,
    pub website_name: Option<String>,
    pub views_per_users: Option<f64>,
    pub button_type: Option<String>,
    pub media_type: Option<String>,
    pub only_crypto: Option<bool>,
    pub exclude_crypto: Option<bool>,
}

/// One observation for a `(date, object, account)` key, or `(date, unit, ad_id)`
/// in the ads variant where `account_key` carries the ad id.
///
/// Metrics are nullable: the reporting API leaves ratios empty when their
/// denominator is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRow {
    pub date: NaiveDate,
    pub object_key: String,
    pub account_key: String,
    pub spent: Option<f64>,
    pub impressions: Option<f64>,
    pub goals: Option<f64>,
    pub price_target: Option<f64>,
    pub cpm: Option<f64>,
    pub clicks: Option<i32>,
    pub cpc: Option<f64>,
    pub ctr: Option<f64>,
    #[serde(default)]
    pub metadata: RowMetadata,
}

impl StatisticRow {
    /// A row with the given key and every metric unset.
    pub fn new(date: NaiveDate, object_key: impl Into<String>, account_key: impl Into<String>) -> Self {
        Self {
            date,
            object_key: object_key.into(),
            account_key: account_key.into(),
            spent: None,
            impressions: None,
            goals: None,
            price_target: None,
            cpm: None,
            clicks: None,
            cpc: None,
            ctr: None,
            metadata: RowMetadata::default(),
        }
    }

    pub fn key(&self) -> StatKey {
        StatKey {
            date: self.date,
            object_key: self.object_key.clone(),
            account_key: self.account_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

const CSI: &str = "\x1b[";

/// Severity of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Severity {
    /// ANSI bright foreground color code.
    pub fn color_code(&self) -> u8 {
        match self {
            Self::Error => 91,
            Self::Info => 92,
            Self::Warning => 93,
            Self::Debug => 96,
            Self::Trace => 95,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// Render one console line. Colored lines carry only the message wrapped in the
/// severity's color; plain lines are prefixed with the severity label instead.
pub fn format_line(severity: Severity, message: &str, color: bool) -> String {
    if color {
        format!("{CSI}{}m{message}{CSI}m", severity.color_code())
    } else {
        format!("{}: {message}", severity.label())
    }
}
