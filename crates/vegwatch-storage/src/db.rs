//! SQLite-backed price table and outbound email queue.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;
use vegwatch_core::{parse_day, EmailDraft, EmailQueueEntry, PriceDraft, PriceObservation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connects to `url` (creating the file if needed) and applies pending migrations.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn prices(&self) -> PriceStore {
        PriceStore {
            pool: self.pool.clone(),
        }
    }

    pub fn email_queue(&self) -> EmailQueueStore {
        EmailQueueStore {
            pool: self.pool.clone(),
        }
    }
}

/// Slim projection of one day's rows used by the alert and report engines.
#[derive(Debug, Clone, PartialEq)]
pub struct DayPrice {
    pub vegetable: String,
    pub wholesale_price: Option<i64>,
    pub image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PriceStore {
    pool: SqlitePool,
}

impl PriceStore {
    /// Atomically swaps every row for `(date, city)` with `drafts`. An empty slice
    /// clears the day. Returns the number of rows inserted.
    pub async fn replace_day(&self, date: NaiveDate, city: &str, drafts: &[PriceDraft]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM prices WHERE date = ? AND city = ?")
            .bind(date)
            .bind(city)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let created_at = Utc::now();
        let mut inserted = 0u64;
        for draft in drafts {
            inserted += insert_price(&mut *tx, date, city, draft, created_at).await?;
        }
        tx.commit().await?;

        debug!(%date, city, deleted, inserted, "replaced day");
        Ok(inserted)
    }

    pub async fn insert(&self, draft: &PriceDraft) -> Result<(), StoreError> {
        insert_price(&self.pool, draft.date, &draft.city, draft, Utc::now()).await?;
        Ok(())
    }

    pub async fn delete_day(&self, date: NaiveDate, city: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM prices WHERE date = ? AND city = ?")
            .bind(date)
            .bind(city)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Full table scan.
    pub async fn list_all(&self) -> Result<Vec<PriceObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, date, city, vegetable, wholesale_price,
                   retail_min_price, retail_max_price,
                   shopmall_min_price, shopmall_max_price,
                   unit, image, created_at
              FROM prices
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(observation_from_row).collect()
    }

    pub async fn list_day(&self, date: NaiveDate, city: &str) -> Result<Vec<PriceObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, date, city, vegetable, wholesale_price,
                   retail_min_price, retail_max_price,
                   shopmall_min_price, shopmall_max_price,
                   unit, image, created_at
              FROM prices
             WHERE date = ? AND city = ?
             ORDER BY id
            "#,
        )
        .bind(date)
        .bind(city)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(observation_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recent day present, optionally restricted to one city.
    pub async fn latest_date(&self, city: Option<&str>) -> Result<Option<NaiveDate>, StoreError> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(date) FROM prices WHERE (?1 IS NULL OR city = ?1)")
                .bind(city)
                .fetch_one(&self.pool)
                .await?;
        latest
            .map(|raw| {
                parse_day(&raw).map_err(|_| StoreError::Corrupt {
                    column: "date",
                    value: raw,
                })
            })
            .transpose()
    }

    pub async fn prices_on(&self, date: NaiveDate, city: Option<&str>) -> Result<Vec<DayPrice>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT vegetable, wholesale_price, image
              FROM prices
             WHERE date = ?1
               AND (?2 IS NULL OR city = ?2)
             ORDER BY id
            "#,
        )
        .bind(date)
        .bind(city)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DayPrice {
                    vegetable: row.try_get("vegetable")?,
                    wholesale_price: row.try_get("wholesale_price")?,
                    image: row.try_get("image")?,
                })
            })
            .collect()
    }

    /// Per-vegetable mean wholesale price over `[start, end_exclusive)`. Null and
    /// non-positive prices are left out of the mean.
    pub async fn average_wholesale(
        &self,
        start: NaiveDate,
        end_exclusive: NaiveDate,
        city: Option<&str>,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT vegetable, AVG(wholesale_price) AS avg_price
              FROM prices
             WHERE date >= ?1 AND date < ?2
               AND (?3 IS NULL OR city = ?3)
               AND wholesale_price IS NOT NULL
               AND wholesale_price > 0
             GROUP BY vegetable
            "#,
        )
        .bind(start)
        .bind(end_exclusive)
        .bind(city)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let vegetable: String = row.try_get("vegetable")?;
            let avg: f64 = row.try_get("avg_price")?;
            out.insert(vegetable, avg);
        }
        Ok(out)
    }
}

async fn insert_price<'e, E>(
    executor: E,
    date: NaiveDate,
    city: &str,
    draft: &PriceDraft,
    created_at: DateTime<Utc>,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO prices
            (date, city, vegetable, wholesale_price,
             retail_min_price, retail_max_price,
             shopmall_min_price, shopmall_max_price,
             unit, image, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(date)
    .bind(city)
    .bind(&draft.vegetable)
    .bind(draft.wholesale_price)
    .bind(&draft.retail_min_price)
    .bind(&draft.retail_max_price)
    .bind(&draft.shopmall_min_price)
    .bind(&draft.shopmall_max_price)
    .bind(&draft.unit)
    .bind(&draft.image)
    .bind(created_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn observation_from_row(row: &SqliteRow) -> Result<PriceObservation, StoreError> {
    Ok(PriceObservation {
        id: row.try_get("id")?,
        date: row.try_get("date")?,
        city: row.try_get("city")?,
        vegetable: row.try_get("vegetable")?,
        wholesale_price: row.try_get("wholesale_price")?,
        retail_min_price: row.try_get("retail_min_price")?,
        retail_max_price: row.try_get("retail_max_price")?,
        shopmall_min_price: row.try_get("shopmall_min_price")?,
        shopmall_max_price: row.try_get("shopmall_max_price")?,
        unit: row.try_get("unit")?,
        image: row.try_get("image")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Append-only producer side of the outbound email queue.
#[derive(Debug, Clone)]
pub struct EmailQueueStore {
    pool: SqlitePool,
}

impl EmailQueueStore {
    /// Appends one unsent email and returns its id.
    pub async fn enqueue(&self, email: &EmailDraft) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_queue
                (email_to, subject, html_body, email_cc, attachment_path, is_sent, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&email.to)
        .bind(&email.subject)
        .bind(&email.html_body)
        .bind(&email.cc)
        .bind(&email.attachment_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<EmailQueueEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, email_to, subject, html_body, email_cc, attachment_path,
                   is_sent, created_at, sent_on
              FROM email_queue
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn html_body(&self, id: i64) -> Result<Option<String>, StoreError> {
        let body = sqlx::query_scalar::<_, String>("SELECT html_body FROM email_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(body)
    }

    pub async fn list(&self, pending_only: bool) -> Result<Vec<EmailQueueEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email_to, subject, html_body, email_cc, attachment_path,
                   is_sent, created_at, sent_on
              FROM email_queue
             WHERE (?1 = 0 OR is_sent = 0)
             ORDER BY id
            "#,
        )
        .bind(pending_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Dispatcher hook: flags an unsent email as delivered. Returns false when the
    /// id is unknown or already sent.
    pub async fn mark_sent(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE email_queue SET is_sent = 1, sent_on = ? WHERE id = ? AND is_sent = 0")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<EmailQueueEntry, StoreError> {
    Ok(EmailQueueEntry {
        id: row.try_get("id")?,
        to: row.try_get("email_to")?,
        subject: row.try_get("subject")?,
        html_body: row.try_get("html_body")?,
        cc: row.try_get("email_cc")?,
        attachment_path: row.try_get("attachment_path")?,
        is_sent: row.try_get("is_sent")?,
        created_at: row.try_get("created_at")?,
        sent_on: row.try_get("sent_on")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn draft(date: &str, city: &str, vegetable: &str, price: Option<i64>) -> PriceDraft {
        PriceDraft {
            date: day(date),
            city: city.to_string(),
            vegetable: vegetable.to_string(),
            wholesale_price: price,
            retail_min_price: Some("20".into()),
            retail_max_price: Some("35".into()),
            shopmall_min_price: None,
            shopmall_max_price: None,
            unit: Some("kg".into()),
            image: Some(format!("https://example.test/{vegetable}.png")),
        }
    }

    #[tokio::test]
    async fn replace_day_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let prices = db.prices();
        let rows = vec![
            draft("2025-01-01", "kerala", "Tomato", Some(30)),
            draft("2025-01-01", "kerala", "Onion", Some(40)),
        ];

        let first = prices.replace_day(day("2025-01-01"), "kerala", &rows).await.unwrap();
        let snapshot_a = prices.list_day(day("2025-01-01"), "kerala").await.unwrap();
        let second = prices.replace_day(day("2025-01-01"), "kerala", &rows).await.unwrap();
        let snapshot_b = prices.list_day(day("2025-01-01"), "kerala").await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        assert_eq!(prices.count().await.unwrap(), 2);
        let names = |rows: &[PriceObservation]| rows.iter().map(|r| r.vegetable.clone()).collect::<Vec<_>>();
        assert_eq!(names(&snapshot_a), names(&snapshot_b));
        assert_eq!(snapshot_b[0].retail_max_price.as_deref(), Some("35"));
    }

    #[tokio::test]
    async fn replace_day_with_nothing_clears_only_that_key() {
        let db = Database::in_memory().await.unwrap();
        let prices = db.prices();
        prices.insert(&draft("2025-01-01", "kerala", "Tomato", Some(30))).await.unwrap();
        prices.insert(&draft("2025-01-01", "chennai", "Tomato", Some(28))).await.unwrap();
        prices.insert(&draft("2025-01-02", "kerala", "Tomato", Some(31))).await.unwrap();

        let inserted = prices.replace_day(day("2025-01-01"), "kerala", &[]).await.unwrap();

        assert_eq!(inserted, 0);
        assert!(prices.list_day(day("2025-01-01"), "kerala").await.unwrap().is_empty());
        assert_eq!(prices.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_day_is_scoped_to_date_and_city() {
        let db = Database::in_memory().await.unwrap();
        let prices = db.prices();
        prices.insert(&draft("2025-01-01", "kerala", "Tomato", Some(30))).await.unwrap();
        prices.insert(&draft("2025-01-01", "kerala", "Onion", Some(40))).await.unwrap();
        prices.insert(&draft("2025-01-01", "chennai", "Tomato", Some(28))).await.unwrap();

        assert_eq!(prices.delete_day(day("2025-01-01"), "kerala").await.unwrap(), 2);
        assert_eq!(prices.delete_day(day("2025-01-01"), "kerala").await.unwrap(), 0);
        assert_eq!(prices.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_date_respects_city_filter() {
        let db = Database::in_memory().await.unwrap();
        let prices = db.prices();
        assert_eq!(prices.latest_date(None).await.unwrap(), None);

        prices.insert(&draft("2025-01-03", "kerala", "Tomato", Some(30))).await.unwrap();
        prices.insert(&draft("2025-01-05", "chennai", "Tomato", Some(30))).await.unwrap();

        assert_eq!(prices.latest_date(None).await.unwrap(), Some(day("2025-01-05")));
        assert_eq!(prices.latest_date(Some("kerala")).await.unwrap(), Some(day("2025-01-03")));
    }

    #[tokio::test]
    async fn averages_skip_missing_and_zero_prices() {
        let db = Database::in_memory().await.unwrap();
        let prices = db.prices();
        for (date, price) in [
            ("2025-01-01", Some(90)),
            ("2025-01-02", Some(110)),
            ("2025-01-03", None),
            ("2025-01-04", Some(0)),
            ("2025-01-05", Some(500)),
        ] {
            prices.insert(&draft(date, "kerala", "Tomato", price)).await.unwrap();
        }

        let avg = prices
            .average_wholesale(day("2025-01-01"), day("2025-01-05"), None)
            .await
            .unwrap();
        assert_eq!(avg.get("Tomato").copied(), Some(100.0));
    }

    #[tokio::test]
    async fn queued_email_round_trips_by_id() {
        let db = Database::in_memory().await.unwrap();
        let queue = db.email_queue();
        let html = "<p>Tomato up 20.0%</p>";

        let first = queue.enqueue(&EmailDraft::new("ops@example.test", "Alert", html)).await.unwrap();
        let second = queue.enqueue(&EmailDraft::new("ops@example.test", "Alert 2", "<p/>")).await.unwrap();
        assert!(second > first);

        let entry = queue.get(first).await.unwrap().unwrap();
        assert_eq!(entry.html_body, html);
        assert!(!entry.is_sent);
        assert!(entry.sent_on.is_none());
        assert_eq!(queue.html_body(first).await.unwrap().as_deref(), Some(html));
        assert!(queue.get(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_sent_drains_pending_list() {
        let db = Database::in_memory().await.unwrap();
        let queue = db.email_queue();
        let a = queue.enqueue(&EmailDraft::new("a@example.test", "A", "<p>a</p>")).await.unwrap();
        let b = queue.enqueue(&EmailDraft::new("b@example.test", "B", "<p>b</p>")).await.unwrap();

        assert!(queue.mark_sent(a).await.unwrap());
        assert!(!queue.mark_sent(a).await.unwrap());

        let pending = queue.list(true).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b]);
        let all = queue.list(false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_sent && all[0].sent_on.is_some());
    }
}
