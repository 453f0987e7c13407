//! Series record repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::crawler::DataKind;
use crate::database::models::SeriesRecordDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{WritePool, begin_immediate};
use crate::source::SeriesRecord;

#[async_trait]
pub trait SeriesRecordRepository: Send + Sync {
    /// Insert records, replacing rows with the same `(keyword, area, kind, date)`.
    async fn upsert_batch(&self, records: &[SeriesRecord]) -> Result<()>;

    /// Records of one series, ordered by date.
    async fn find_series(
        &self,
        keyword: &str,
        area_code: &str,
        kind: DataKind,
    ) -> Result<Vec<SeriesRecord>>;

    async fn count(&self) -> Result<i64>;
}

pub struct SqlxSeriesRecordRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxSeriesRecordRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    async fn write(&self, records: &[SeriesRecord]) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        for record in records {
            let row = SeriesRecordDbModel::from_record(record);
            sqlx::query(
                r#"
                INSERT INTO series_record (keyword, area_code, kind, date, value, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(keyword, area_code, kind, date) DO UPDATE SET
                    value = excluded.value,
                    fetched_at = excluded.fetched_at
                "#,
            )
            .bind(&row.keyword)
            .bind(&row.area_code)
            .bind(&row.kind)
            .bind(&row.date)
            .bind(row.value)
            .bind(row.fetched_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SeriesRecordRepository for SqlxSeriesRecordRepository {
    async fn upsert_batch(&self, records: &[SeriesRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("series.upsert_batch", || self.write(records)).await
    }

    async fn find_series(
        &self,
        keyword: &str,
        area_code: &str,
        kind: DataKind,
    ) -> Result<Vec<SeriesRecord>> {
        let rows = sqlx::query_as::<_, SeriesRecordDbModel>(
            r#"
            SELECT * FROM series_record
            WHERE keyword = ? AND area_code = ? AND kind = ?
            ORDER BY date
            "#,
        )
        .bind(keyword)
        .bind(area_code)
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SeriesRecordDbModel::into_record).collect()
    }

    async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM series_record")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
