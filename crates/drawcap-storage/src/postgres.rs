//! Postgres-backed draw store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use drawcap_core::{Draw, HourBucket, Prize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::draws::{DrawStore, PrizeMerge, DEFAULT_PRIZE_LOAD_CONCURRENCY};

const DRAW_COLUMNS: &str = "id, composite_key, lottery_key, draw_date, hour_bucket, \
     hour_bucket_raw, prize_count, source, imported_at";

const PRIZE_COLUMNS: &str =
    "position, raw_value, last4, last3, last2, group_index, animal_label";

#[derive(Debug, Clone)]
pub struct PgDrawStore {
    pool: PgPool,
}

impl PgDrawStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_PRIZE_LOAD_CONCURRENCY as u32)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

fn draw_from_row(row: &PgRow) -> Result<Draw> {
    let hour_text: String = row.try_get("hour_bucket")?;
    let hour_bucket: HourBucket = hour_text
        .parse()
        .with_context(|| format!("stored hour bucket {hour_text:?}"))?;
    let prize_count: i32 = row.try_get("prize_count")?;
    Ok(Draw {
        id: row.try_get::<Uuid, _>("id")?,
        composite_key: row.try_get("composite_key")?,
        lottery_key: row.try_get("lottery_key")?,
        date: row.try_get::<NaiveDate, _>("draw_date")?,
        hour_bucket,
        hour_bucket_raw: row.try_get("hour_bucket_raw")?,
        prize_count: prize_count.max(0) as u32,
        source: row.try_get("source")?,
        imported_at: row.try_get::<DateTime<Utc>, _>("imported_at")?,
    })
}

fn prize_from_row(row: &PgRow) -> Result<Prize> {
    let position: i16 = row.try_get("position")?;
    let group_index: i16 = row.try_get("group_index")?;
    Ok(Prize {
        position: position as u8,
        raw_value: row.try_get("raw_value")?,
        last4: row.try_get("last4")?,
        last3: row.try_get("last3")?,
        last2: row.try_get("last2")?,
        group_index: group_index as u8,
        animal_label: row.try_get("animal_label")?,
    })
}

#[async_trait]
impl DrawStore for PgDrawStore {
    async fn get_draw(&self, id: Uuid) -> Result<Option<Draw>> {
        let row = sqlx::query(&format!("SELECT {DRAW_COLUMNS} FROM draws WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("selecting draw")?;
        row.as_ref().map(draw_from_row).transpose()
    }

    async fn upsert_draw(&self, draw: &Draw) -> Result<()> {
        sqlx::query(
            "INSERT INTO draws (id, composite_key, lottery_key, draw_date, hour_bucket, \
             hour_bucket_raw, prize_count, source, imported_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
               hour_bucket_raw = COALESCE(EXCLUDED.hour_bucket_raw, draws.hour_bucket_raw), \
               source = EXCLUDED.source",
        )
        .bind(draw.id)
        .bind(&draw.composite_key)
        .bind(&draw.lottery_key)
        .bind(draw.date)
        .bind(draw.hour_bucket.to_string())
        .bind(&draw.hour_bucket_raw)
        .bind(&draw.source)
        .bind(draw.imported_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting draw {}", draw.composite_key))?;
        Ok(())
    }

    async fn upsert_prize(&self, draw_id: Uuid, prize: &Prize) -> Result<PrizeMerge> {
        if prize.raw_value.trim().is_empty() {
            return Ok(PrizeMerge::KeptExisting);
        }
        let mut tx = self.pool.begin().await.context("opening transaction")?;

        let existing = sqlx::query(&format!(
            "SELECT {PRIZE_COLUMNS} FROM prizes WHERE draw_id = $1 AND position = $2 FOR UPDATE"
        ))
        .bind(draw_id)
        .bind(prize.position as i16)
        .fetch_optional(&mut *tx)
        .await
        .context("selecting prize")?;
        let merge = match existing.as_ref().map(prize_from_row).transpose()? {
            Some(current) if &current == prize => return Ok(PrizeMerge::Unchanged),
            Some(_) => PrizeMerge::Updated,
            None => PrizeMerge::Inserted,
        };

        sqlx::query(
            "INSERT INTO prizes \
               (draw_id, position, raw_value, last4, last3, last2, group_index, animal_label) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (draw_id, position) DO UPDATE SET \
               raw_value = EXCLUDED.raw_value, last4 = EXCLUDED.last4, last3 = EXCLUDED.last3, \
               last2 = EXCLUDED.last2, group_index = EXCLUDED.group_index, \
               animal_label = EXCLUDED.animal_label",
        )
        .bind(draw_id)
        .bind(prize.position as i16)
        .bind(&prize.raw_value)
        .bind(&prize.last4)
        .bind(&prize.last3)
        .bind(&prize.last2)
        .bind(prize.group_index as i16)
        .bind(&prize.animal_label)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upserting prize {} of draw {draw_id}", prize.position))?;

        sqlx::query(
            "UPDATE draws SET prize_count = (SELECT COUNT(*) FROM prizes WHERE draw_id = $1) \
             WHERE id = $1",
        )
        .bind(draw_id)
        .execute(&mut *tx)
        .await
        .context("refreshing prize count")?;

        tx.commit().await.context("committing prize upsert")?;
        Ok(merge)
    }

    async fn list_prizes(&self, draw_id: Uuid) -> Result<Vec<Prize>> {
        let rows = sqlx::query(&format!(
            "SELECT {PRIZE_COLUMNS} FROM prizes WHERE draw_id = $1 ORDER BY position"
        ))
        .bind(draw_id)
        .fetch_all(&self.pool)
        .await
        .context("selecting prizes")?;
        rows.iter().map(prize_from_row).collect()
    }

    async fn list_draws(&self, lottery_key: &str) -> Result<Vec<Draw>> {
        let rows = sqlx::query(&format!(
            "SELECT {DRAW_COLUMNS} FROM draws WHERE lottery_key = $1 ORDER BY composite_key"
        ))
        .bind(lottery_key)
        .fetch_all(&self.pool)
        .await
        .context("selecting draws")?;
        rows.iter().map(draw_from_row).collect()
    }

    async fn draws_for_date(&self, lottery_key: &str, date: NaiveDate) -> Result<Vec<Draw>> {
        let rows = sqlx::query(&format!(
            "SELECT {DRAW_COLUMNS} FROM draws WHERE lottery_key = $1 AND draw_date = $2 \
             ORDER BY composite_key"
        ))
        .bind(lottery_key)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("selecting draws for date")?;
        rows.iter().map(draw_from_row).collect()
    }

    async fn prize_count(&self, draw_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prizes WHERE draw_id = $1")
            .bind(draw_id)
            .fetch_one(&self.pool)
            .await
            .context("counting prizes")?;
        Ok(count.max(0) as usize)
    }
}
