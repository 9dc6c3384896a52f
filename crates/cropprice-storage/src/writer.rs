use std::fmt;

use async_trait::async_trait;
use cropprice_core::PriceRecord;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, warn};

pub const INSERT_PRICE_SQL: &str = r#"
    INSERT INTO public.tb_mst_crop_price
        (district, market, crop_name, variety_name, grade,
         minprice, maxprice, modelprice, pricedate, crop_id, state)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{0}")]
    Database(#[from] sqlx::Error),
}

/// Destination for derived price records.
#[async_trait]
pub trait PriceSink: Send + Sync {
    async fn insert(&self, record: &PriceRecord) -> Result<(), WriteError>;
}

#[derive(Clone)]
pub struct DbSettings {
    pub database: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl DbSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

/// Writes each record over its own short-lived connection.
#[derive(Debug, Clone)]
pub struct PgPriceWriter {
    options: PgConnectOptions,
}

impl PgPriceWriter {
    pub fn new(settings: &DbSettings) -> Self {
        Self {
            options: settings.connect_options(),
        }
    }
}

#[async_trait]
impl PriceSink for PgPriceWriter {
    async fn insert(&self, record: &PriceRecord) -> Result<(), WriteError> {
        let mut conn = PgConnection::connect_with(&self.options).await?;
        let result = insert_in_transaction(&mut conn, record).await;
        // The transaction has already been committed or rolled back on drop.
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing price connection failed");
        }
        result?;
        debug!(
            crop = %record.crop_name,
            district = %record.district,
            pricedate = %record.price_date,
            "price row committed"
        );
        Ok(())
    }
}

async fn insert_in_transaction(
    conn: &mut PgConnection,
    record: &PriceRecord,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    sqlx::query(INSERT_PRICE_SQL)
        .bind(&record.district)
        .bind(&record.market)
        .bind(&record.crop_name)
        .bind(&record.variety_name)
        .bind(&record.grade)
        .bind(record.min_price)
        .bind(record.max_price)
        .bind(record.model_price)
        .bind(record.price_date)
        .bind(record.crop_id)
        .bind(&record.state)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}
