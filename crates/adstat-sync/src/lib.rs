//! Import pipeline: provisioning, date-scoped reconciliation and the retry loop.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use adstat_adapters::{AdstatSource, AdstatSourceConfig, Credentials, SourceError, StatisticsSource, DEFAULT_BASE_URL};
use adstat_core::{RetryDisposition, StatKey, StatisticRow, Variant};
use adstat_http::{HttpClientConfig, DEFAULT_USER_AGENT};
use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Executor, PgConnection, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adstat-sync";

pub const DEFAULT_TRIES: u32 = 10;
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Postgres caps bind parameters per statement at `u16::MAX`.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub ssl_mode: PgSslMode,
}

impl DbConfig {
    pub fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(database)
            .ssl_mode(self.ssl_mode)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db: DbConfig,
    pub variant: Variant,
    pub table: String,
    pub base_url: String,
    pub credentials: Credentials,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub tries: u32,
    pub batch_size: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let ssl_mode_raw = var("DB_SSLMODE", "require");
        let ssl_mode = PgSslMode::from_str(&ssl_mode_raw).unwrap_or_else(|_| {
            warn!(value = %ssl_mode_raw, "unrecognised DB_SSLMODE, using require");
            PgSslMode::Require
        });
        let variant = lookup("ADSTAT_VARIANT")
            .and_then(|v| match v.parse::<Variant>() {
                Ok(variant) => Some(variant),
                Err(err) => {
                    warn!(%err, "falling back to the accounts variant");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            db: DbConfig {
                dbname: var("DB_NAME", "adstat_db"),
                user: var("DB_USER", "docker"),
                password: var("DB_PASSWORD", "secret"),
                host: var("DB_HOST", "postgres"),
                port: lookup("DB_PORT").and_then(|v| v.parse().ok()).unwrap_or(5432),
                ssl_mode,
            },
            variant,
            table: lookup("ADSTAT_TABLE")
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| variant.default_table().to_string()),
            base_url: var("ADSTAT_BASE_URL", DEFAULT_BASE_URL),
            credentials: Credentials {
                username: lookup("ADSTAT_USERNAME"),
                password: lookup("ADSTAT_PASSWORD"),
            },
            user_agent: var("ADSTAT_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: lookup("ADSTAT_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            tries: lookup("ADSTAT_TRIES")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_TRIES),
            batch_size: lookup("ADSTAT_BATCH_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
        }
    }

    pub fn layout(&self) -> TableLayout {
        TableLayout::new(self.variant, self.table.clone())
    }

    pub fn source_config(&self) -> AdstatSourceConfig {
        AdstatSourceConfig {
            base_url: self.base_url.clone(),
            credentials: self.credentials.clone(),
            variant: self.variant,
            http: HttpClientConfig {
                timeout: self.http_timeout_secs.map(Duration::from_secs),
                user_agent: Some(self.user_agent.clone()),
                cookie_store: true,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema error on table {table}: {detail}")]
    Schema { table: String, detail: String },
}

impl SyncError {
    /// Schema problems need an operator; everything else may heal on retry.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Schema { .. } => RetryDisposition::NonRetryable,
            Self::Source(_) | Self::Database(_) => RetryDisposition::Retryable,
        }
    }
}

/// A destination table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Date,
    Object,
    Account,
    Spent,
    Impressions,
    Goals,
    PriceTarget,
    Cpm,
    Clicks,
    Cpc,
    Ctr,
    AccountName,
    AdType,
    CampaignPlat,
    AdText,
    Topics,
    Channels,
    Languages,
    Countries,
    UserLocations,
    UserChannels,
    PromoteUrl,
    WebsiteName,
    ViewsPerUsers,
    ButtonType,
    MediaType,
    OnlyCrypto,
    ExcludeCrypto,
}

const METRIC_COLUMNS: [Column; 8] = [
    Column::Spent,
    Column::Impressions,
    Column::Goals,
    Column::PriceTarget,
    Column::Cpm,
    Column::Clicks,
    Column::Cpc,
    Column::Ctr,
];

const CAMPAIGN_COLUMNS: [Column; 2] = [Column::AdType, Column::CampaignPlat];

const AD_COLUMNS: [Column; 16] = [
    Column::AccountName,
    Column::AdType,
    Column::AdText,
    Column::Topics,
    Column::Channels,
    Column::Languages,
    Column::Countries,
    Column::UserLocations,
    Column::UserChannels,
    Column::PromoteUrl,
    Column::WebsiteName,
    Column::ViewsPerUsers,
    Column::ButtonType,
    Column::MediaType,
    Column::OnlyCrypto,
    Column::ExcludeCrypto,
];

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Shape of the destination table for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub variant: Variant,
    pub table: String,
}

impl TableLayout {
    pub fn new(variant: Variant, table: impl Into<String>) -> Self {
        Self {
            variant,
            table: table.into(),
        }
    }

    pub fn key_columns(&self) -> [Column; 3] {
        [Column::Date, Column::Object, Column::Account]
    }

    /// Every non-key column, overwritten on conflict.
    pub fn value_columns(&self) -> Vec<Column> {
        let mut columns = METRIC_COLUMNS.to_vec();
        match self.variant {
            Variant::Accounts => {}
            Variant::Campaigns => columns.extend(CAMPAIGN_COLUMNS),
            Variant::Ads => columns.extend(AD_COLUMNS),
        }
        columns
    }

    /// Insert order: key columns first, then value columns.
    pub fn columns(&self) -> Vec<Column> {
        let mut columns = self.key_columns().to_vec();
        columns.extend(self.value_columns());
        columns
    }

    pub fn column_name(&self, column: Column) -> &'static str {
        let [_, object, account] = self.variant.key_columns();
        match column {
            Column::Date => "date",
            Column::Object => object,
            Column::Account => account,
            Column::Spent => "spent",
            Column::Impressions => "impressions",
            Column::Goals => "goals",
            Column::PriceTarget => "price_target",
            Column::Cpm => "cpm",
            Column::Clicks => "clicks",
            Column::Cpc => "cpc",
            Column::Ctr => "ctr",
            Column::AccountName => "account_name",
            Column::AdType => "ad_type",
            Column::CampaignPlat => "campaign_plat",
            Column::AdText => "ad_text",
            Column::Topics => "topics",
            Column::Channels => "channels",
            Column::Languages => "languages",
            Column::Countries => "countries",
            Column::UserLocations => "user_locations",
            Column::UserChannels => "user_channels",
            Column::PromoteUrl => "promote_url",
            Column::WebsiteName => "website_name",
            Column::ViewsPerUsers => "views_per_users",
            Column::ButtonType => "button_type",
            Column::MediaType => "media_type",
            Column::OnlyCrypto => "only_crypto",
            Column::ExcludeCrypto => "exclude_crypto",
        }
    }

    fn sql_type(column: Column) -> &'static str {
        match column {
            Column::Date => "DATE NOT NULL",
            Column::Object | Column::Account => "VARCHAR(255) NOT NULL",
            Column::Clicks => "INT",
            Column::Spent
            | Column::Impressions
            | Column::Goals
            | Column::PriceTarget
            | Column::Cpm
            | Column::Cpc
            | Column::Ctr
            | Column::ViewsPerUsers => "DOUBLE PRECISION",
            Column::Topics
            | Column::Channels
            | Column::Languages
            | Column::Countries
            | Column::UserLocations
            | Column::UserChannels => "TEXT[] NOT NULL DEFAULT '{}'",
            Column::OnlyCrypto | Column::ExcludeCrypto => "BOOLEAN",
            Column::AccountName
            | Column::AdType
            | Column::CampaignPlat
            | Column::AdText
            | Column::PromoteUrl
            | Column::WebsiteName
            | Column::ButtonType
            | Column::MediaType => "TEXT",
        }
    }

    fn quoted_list(&self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| quote_ident(self.column_name(*c)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn create_table_sql(&self) -> String {
        let mut defs = vec!["\"id\" UUID DEFAULT gen_random_uuid() PRIMARY KEY".to_string()];
        defs.extend(
            self.columns()
                .into_iter()
                .map(|c| format!("{} {}", quote_ident(self.column_name(c)), Self::sql_type(c))),
        );
        defs.push(format!("UNIQUE ({})", self.quoted_list(&self.key_columns())));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(&self.table),
            defs.join(",\n    ")
        )
    }

    pub fn create_index_sqls(&self) -> Vec<String> {
        self.key_columns()
            .into_iter()
            .map(|c| {
                let name = self.column_name(c);
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("idx_{}_{}", self.table, name)),
                    quote_ident(&self.table),
                    quote_ident(name)
                )
            })
            .collect()
    }

    pub fn delete_date_sql(&self) -> String {
        format!("DELETE FROM {} WHERE \"date\" = $1", quote_ident(&self.table))
    }

    pub fn insert_prefix(&self) -> String {
        format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&self.table),
            self.quoted_list(&self.columns())
        )
    }

    pub fn conflict_clause(&self) -> String {
        let updates = self
            .value_columns()
            .into_iter()
            .map(|c| {
                let name = quote_ident(self.column_name(c));
                format!("{name} = EXCLUDED.{name}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            self.quoted_list(&self.key_columns()),
            updates
        )
    }

    pub fn max_rows_per_statement(&self) -> usize {
        MAX_BIND_PARAMS / self.columns().len()
    }
}

fn bind_column(values: &mut Separated<'_, '_, Postgres, &'static str>, column: Column, row: &StatisticRow) {
    let meta = &row.metadata;
    match column {
        Column::Date => values.push_bind(row.date),
        Column::Object => values.push_bind(row.object_key.clone()),
        Column::Account => values.push_bind(row.account_key.clone()),
        Column::Spent => values.push_bind(row.spent),
        Column::Impressions => values.push_bind(row.impressions),
        Column::Goals => values.push_bind(row.goals),
        Column::PriceTarget => values.push_bind(row.price_target),
        Column::Cpm => values.push_bind(row.cpm),
        Column::Clicks => values.push_bind(row.clicks),
        Column::Cpc => values.push_bind(row.cpc),
        Column::Ctr => values.push_bind(row.ctr),
        Column::AccountName => values.push_bind(meta.account_name.clone()),
        Column::AdType => values.push_bind(meta.ad_type.clone()),
        Column::CampaignPlat => values.push_bind(meta.campaign_plat.clone()),
        Column::AdText => values.push_bind(meta.ad_text.clone()),
        Column::Topics => values.push_bind(meta.topics.clone()),
        Column::Channels => values.push_bind(meta.channels.clone()),
        Column::Languages => values.push_bind(meta.languages.clone()),
        Column::Countries => values.push_bind(meta.countries.clone()),
        Column::UserLocations => values.push_bind(meta.user_locations.clone()),
        Column::UserChannels => values.push_bind(meta.user_channels.clone()),
        Column::PromoteUrl => values.push_bind(meta.promote_url.clone()),
        Column::WebsiteName => values.push_bind(meta.website_name.clone()),
        Column::ViewsPerUsers => values.push_bind(meta.views_per_users),
        Column::ButtonType => values.push_bind(meta.button_type.clone()),
        Column::MediaType => values.push_bind(meta.media_type.clone()),
        Column::OnlyCrypto => values.push_bind(meta.only_crypto),
        Column::ExcludeCrypto => values.push_bind(meta.exclude_crypto),
    };
}

fn database_error_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

const DUPLICATE_DATABASE: &str = "42P04";
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_OBJECT: &str = "42710";
/// Raised on `pg_type` when two sessions create the same table at once.
const UNIQUE_VIOLATION: &str = "23505";
/// `ON CONFLICT` target has no matching unique index.
const INVALID_COLUMN_REFERENCE: &str = "42P10";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DdlFailure {
    /// Lost a creation race; the object is there.
    AlreadyExists,
    Schema,
    /// No server answer at all, worth another attempt.
    Connection,
}

fn classify_ddl_error(code: Option<&str>) -> DdlFailure {
    match code {
        Some(DUPLICATE_DATABASE | DUPLICATE_TABLE | DUPLICATE_OBJECT | UNIQUE_VIOLATION) => DdlFailure::AlreadyExists,
        Some(_) => DdlFailure::Schema,
        None => DdlFailure::Connection,
    }
}

/// Layout columns absent from the live table, in layout order.
fn missing_columns(layout: &TableLayout, live: &HashSet<String>) -> Vec<&'static str> {
    layout
        .columns()
        .into_iter()
        .map(|c| layout.column_name(c))
        .filter(|name| !live.contains(*name))
        .collect()
}

/// Whether one of the unique indexes covers exactly the natural key.
fn has_unique_key(layout: &TableLayout, unique_indexes: &[Vec<String>]) -> bool {
    let key: HashSet<&str> = layout.key_columns().iter().map(|c| layout.column_name(*c)).collect();
    unique_indexes.iter().any(|columns| {
        columns.len() == key.len() && columns.iter().all(|name| key.contains(name.as_str()))
    })
}

/// Write side of the reconciler. Each call is its own transaction.
#[async_trait]
pub trait StatisticsStore: Send {
    /// Delete every row stored for `date`; returns the number removed.
    async fn delete_date(&mut self, date: NaiveDate) -> Result<u64, SyncError>;

    /// Insert-or-overwrite `rows` in one statement. Keys within `rows` are unique.
    async fn upsert_batch(&mut self, rows: &[StatisticRow]) -> Result<u64, SyncError>;

    fn max_batch_rows(&self) -> usize {
        usize::MAX
    }

    /// Release the underlying connection.
    async fn close(self) -> Result<(), SyncError>
    where
        Self: Sized,
    {
        Ok(())
    }
}

pub struct PgStatisticsStore {
    conn: PgConnection,
    layout: TableLayout,
}

impl PgStatisticsStore {
    pub fn new(conn: PgConnection, layout: TableLayout) -> Self {
        Self { conn, layout }
    }
}

#[async_trait]
impl StatisticsStore for PgStatisticsStore {
    async fn delete_date(&mut self, date: NaiveDate) -> Result<u64, SyncError> {
        let sql = self.layout.delete_date_sql();
        let result = sqlx::query(&sql).bind(date).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_batch(&mut self, rows: &[StatisticRow]) -> Result<u64, SyncError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = self.layout.columns();
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(self.layout.insert_prefix());
        qb.push_values(rows.iter(), |mut values, row| {
            for column in &columns {
                bind_column(&mut values, *column, row);
            }
        });
        qb.push(self.layout.conflict_clause());
        let result = qb.build().execute(&mut self.conn).await.map_err(|err| {
            if database_error_code(&err).as_deref() == Some(INVALID_COLUMN_REFERENCE) {
                SyncError::Schema {
                    table: self.layout.table.clone(),
                    detail: err.to_string(),
                }
            } else {
                SyncError::Database(err)
            }
        })?;
        Ok(result.rows_affected())
    }

    fn max_batch_rows(&self) -> usize {
        self.layout.max_rows_per_statement()
    }

    async fn close(self) -> Result<(), SyncError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Makes sure the destination exists and hands out a store bound to it.
#[async_trait]
pub trait Provisioner: Send + Sync {
    type Store: StatisticsStore;

    async fn provision(&self) -> Result<Self::Store, SyncError>;
}

#[derive(Debug, Clone)]
pub struct PgProvisioner {
    db: DbConfig,
    layout: TableLayout,
}

impl PgProvisioner {
    pub fn new(db: DbConfig, layout: TableLayout) -> Self {
        Self { db, layout }
    }

    /// Create the configured database through the `postgres` maintenance
    /// database when the catalog does not list it yet.
    pub async fn ensure_database(&self) -> Result<(), SyncError> {
        let mut conn = PgConnection::connect_with(&self.db.connect_options("postgres")).await?;
        let name = &self.db.dbname;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name.as_str())
            .fetch_optional(&mut conn)
            .await?;

        if exists.is_some() {
            info!(database = %name, "Database {name} already exists.");
        } else {
            match conn.execute(format!("CREATE DATABASE {}", quote_ident(name)).as_str()).await {
                Ok(_) => info!(database = %name, "Database {name} created."),
                Err(err) if classify_ddl_error(database_error_code(&err).as_deref()) == DdlFailure::AlreadyExists => {
                    info!(database = %name, "Database {name} already exists.");
                }
                Err(err) => return Err(err.into()),
            }
        }

        conn.close().await?;
        Ok(())
    }

    /// Create the table, its unique key and indexes, then check that the live
    /// table carries every column the layout writes.
    pub async fn ensure_table(&self, conn: &mut PgConnection) -> Result<(), SyncError> {
        let table = &self.layout.table;
        let mut statements = vec![self.layout.create_table_sql()];
        statements.extend(self.layout.create_index_sqls());

        for sql in &statements {
            if let Err(err) = (&mut *conn).execute(sql.as_str()).await {
                match classify_ddl_error(database_error_code(&err).as_deref()) {
                    DdlFailure::AlreadyExists => {
                        debug!(table = %table, "created concurrently by another session");
                    }
                    DdlFailure::Schema => {
                        return Err(SyncError::Schema {
                            table: table.clone(),
                            detail: err.to_string(),
                        })
                    }
                    DdlFailure::Connection => return Err(err.into()),
                }
            }
        }

        let live: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table.as_str())
        .fetch_all(&mut *conn)
        .await?;
        let live: HashSet<String> = live.into_iter().collect();

        let missing = missing_columns(&self.layout, &live);
        if !missing.is_empty() {
            return Err(SyncError::Schema {
                table: table.clone(),
                detail: format!("missing columns: {}", missing.join(", ")),
            });
        }

        // Plain unique indexes only: partial and expression indexes cannot
        // serve `ON CONFLICT (key)`.
        let unique_indexes: Vec<Vec<String>> = sqlx::query_scalar(
            "SELECT ARRAY(SELECT a.attname::text FROM unnest(i.indkey) AS k(attnum) \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum) \
             FROM pg_index i \
             WHERE i.indrelid = to_regclass($1) AND i.indisunique \
             AND i.indpred IS NULL AND i.indexprs IS NULL",
        )
        .bind(quote_ident(table))
        .fetch_all(&mut *conn)
        .await?;

        if !has_unique_key(&self.layout, &unique_indexes) {
            let key: Vec<_> = self.layout.key_columns().iter().map(|c| self.layout.column_name(*c)).collect();
            return Err(SyncError::Schema {
                table: table.clone(),
                detail: format!("no unique constraint on ({})", key.join(", ")),
            });
        }

        info!(table = %table, "Table {table} ready.");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for PgProvisioner {
    type Store = PgStatisticsStore;

    async fn provision(&self) -> Result<PgStatisticsStore, SyncError> {
        self.ensure_database().await?;
        let mut conn = PgConnection::connect_with(&self.db.connect_options(&self.db.dbname)).await?;
        self.ensure_table(&mut conn).await?;
        Ok(PgStatisticsStore::new(conn, self.layout.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub date: NaiveDate,
    pub deleted: u64,
    /// Distinct keys stored, however often a key repeats in the input.
    pub written: usize,
    pub batches: usize,
}

/// Drop all but the last occurrence of each key. One statement cannot upsert
/// the same row twice, and last-wins is what row-by-row writes would give.
pub fn collapse_duplicate_keys(batch: &[StatisticRow]) -> Cow<'_, [StatisticRow]> {
    let mut last_index: HashMap<StatKey, usize> = HashMap::with_capacity(batch.len());
    for (index, row) in batch.iter().enumerate() {
        last_index.insert(row.key(), index);
    }
    if last_index.len() == batch.len() {
        return Cow::Borrowed(batch);
    }
    Cow::Owned(
        batch
            .iter()
            .enumerate()
            .filter(|(index, row)| last_index.get(&row.key()) == Some(index))
            .map(|(_, row)| row.clone())
            .collect(),
    )
}

/// Replace the stored rows for the fetched date with `rows`.
///
/// The delete is scoped by the date of the first row. Batches are written in
/// order and independently; a failing batch stops the run and leaves earlier
/// batches committed. Returns `None` when there is nothing to reconcile.
pub async fn reconcile<S: StatisticsStore + ?Sized>(
    store: &mut S,
    rows: &[StatisticRow],
    batch_size: usize,
) -> Result<Option<ReconcileSummary>, SyncError> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let date = first.date;

    let other_dates = rows.iter().filter(|r| r.date != date).count();
    if other_dates > 0 {
        warn!(
            %date,
            other_dates,
            "fetch spans several dates; only {date} is cleared before writing"
        );
    }

    let deleted = store.delete_date(date).await?;
    info!(%date, deleted, "All statistics records deleted where date={date}");

    let batch_size = batch_size.clamp(1, store.max_batch_rows().max(1));
    let mut written_keys: HashSet<StatKey> = HashSet::with_capacity(rows.len());
    let mut batches = 0usize;
    for (n, batch) in rows.chunks(batch_size).enumerate() {
        let from = n * batch_size;
        let to = from + batch.len();
        let unique = collapse_duplicate_keys(batch);
        if unique.len() != batch.len() {
            debug!(from, to, dropped = batch.len() - unique.len(), "collapsed duplicate keys");
        }
        store.upsert_batch(&unique).await?;
        written_keys.extend(unique.iter().map(StatisticRow::key));
        batches += 1;
        info!(from, to, "Saved {} records from index {from} to {to}.", batch.len());
    }

    Ok(Some(ReconcileSummary {
        date,
        deleted,
        written: written_keys.len(),
        batches,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Reconciled(ReconcileSummary),
    /// The source returned no rows; nothing was touched.
    Empty,
}

/// One pass of the import, retried by [`RunController`].
#[async_trait]
pub trait SyncAttempt: Send {
    async fn attempt(&mut self) -> Result<AttemptOutcome, SyncError>;
}

/// Provision, fetch, reconcile.
pub struct EtlJob<P, S> {
    provisioner: P,
    source: S,
    batch_size: usize,
}

impl<P, S> EtlJob<P, S> {
    pub fn new(provisioner: P, source: S, batch_size: usize) -> Self {
        Self {
            provisioner,
            source,
            batch_size,
        }
    }
}

#[async_trait]
impl<P, S> SyncAttempt for EtlJob<P, S>
where
    P: Provisioner,
    S: StatisticsSource,
{
    async fn attempt(&mut self) -> Result<AttemptOutcome, SyncError> {
        let mut store = self.provisioner.provision().await?;
        debug!(variant = %self.source.variant(), "fetching statistics");
        let reconciled = match self.source.fetch().await {
            Ok(rows) => reconcile(&mut store, &rows, self.batch_size).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = store.close().await {
            warn!("closing database connection failed: {err}");
        }
        Ok(match reconciled? {
            Some(summary) => AttemptOutcome::Reconciled(summary),
            None => AttemptOutcome::Empty,
        })
    }
}

#[derive(Debug)]
pub enum RunStatus {
    Succeeded(ReconcileSummary),
    /// Every attempt failed or came back empty.
    Exhausted,
    /// A non-retryable error stopped the loop early.
    Aborted(SyncError),
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub attempts: u32,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct RunController {
    max_attempts: u32,
}

impl Default for RunController {
    fn default() -> Self {
        Self::new(DEFAULT_TRIES)
    }
}

impl RunController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run<A: SyncAttempt + ?Sized>(&self, job: &mut A) -> RunReport {
        let run_id = Uuid::new_v4();

        for attempt in 1..=self.max_attempts {
            let span = info_span!("attempt", %run_id, attempt, of = self.max_attempts);
            match job.attempt().instrument(span).await {
                Ok(AttemptOutcome::Reconciled(summary)) => {
                    info!(%run_id, attempt, written = summary.written, "Finished successfully!");
                    return RunReport {
                        run_id,
                        attempts: attempt,
                        status: RunStatus::Succeeded(summary),
                    };
                }
                Ok(AttemptOutcome::Empty) => {
                    warn!(%run_id, attempt, "No statistics returned, nothing to reconcile.");
                }
                Err(err) => match err.disposition() {
                    RetryDisposition::Retryable => {
                        error!(%run_id, attempt, "An error has occurred: {err}");
                    }
                    RetryDisposition::NonRetryable => {
                        error!(%run_id, attempt, "Fatal error, not retrying: {err}");
                        return RunReport {
                            run_id,
                            attempts: attempt,
                            status: RunStatus::Aborted(err),
                        };
                    }
                },
            }
        }

        RunReport {
            run_id,
            attempts: self.max_attempts,
            status: RunStatus::Exhausted,
        }
    }
}

pub async fn run_import_from_env() -> anyhow::Result<RunReport> {
    run_import(SyncConfig::from_env()).await
}

pub async fn run_import(config: SyncConfig) -> anyhow::Result<RunReport> {
    let provisioner = PgProvisioner::new(config.db.clone(), config.layout());
    let source = AdstatSource::new(config.source_config()).context("building AdStat client")?;
    let mut job = EtlJob::new(provisioner, source, config.batch_size);
    Ok(RunController::new(config.tries).run(&mut job).await)
}

/// Provision the database and table once, without fetching.
pub async fn provision_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let provisioner = PgProvisioner::new(config.db.clone(), config.layout());
    let store = provisioner
        .provision()
        .await
        .with_context(|| format!("provisioning table {}", config.table))?;
    store.close().await.context("closing connection")?;
    Ok(())
}
