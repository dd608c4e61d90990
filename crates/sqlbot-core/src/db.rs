//! The read-only SQL database collaborator (spec §6). `Database` is the
//! trait boundary; `SqliteDatabase` is the in-process stand-in backing it so
//! the crate runs end to end without a network dependency.

use crate::error::DatabaseError;
use crate::memory::{QueryResult, Row};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str) -> Result<QueryResult, DatabaseError>;
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open an in-memory database seeded with the `app_portfolio` fixture
    /// used by the worked scenarios (50 rows, 49 distinct app_name, 21
    /// distinct iOS apps).
    pub async fn seeded_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await?;
        seed_app_portfolio(&pool).await?;
        Ok(Self { pool })
    }
}

async fn seed_app_portfolio(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE app_portfolio (
            id INTEGER PRIMARY KEY,
            app_name TEXT NOT NULL,
            platform TEXT NOT NULL,
            country TEXT NOT NULL,
            installs INTEGER NOT NULL,
            revenue REAL NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    // 49 distinct apps: the first 21 are iOS, the remaining 28 are Android.
    for i in 1..=49 {
        let platform = if i <= 21 { "iOS" } else { "Android" };
        let app_name = format!("App{i:02}");
        sqlx::query(
            "INSERT INTO app_portfolio (app_name, platform, country, installs, revenue)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&app_name)
        .bind(platform)
        .bind("US")
        .bind((i as i64) * 1000)
        .bind((i as f64) * 123.45)
        .execute(pool)
        .await?;
    }

    // One extra row for App01 in a second country, bringing the row count to
    // 50 while leaving the distinct-app and distinct-iOS-app counts unchanged.
    sqlx::query(
        "INSERT INTO app_portfolio (app_name, platform, country, installs, revenue)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind("App01")
    .bind("iOS")
    .bind("UK")
    .bind(500_i64)
    .bind(88.0_f64)
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn query(&self, sql: &str) -> Result<QueryResult, DatabaseError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let columns: Vec<String> = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let data: Vec<Row> = rows.iter().map(row_to_map).collect();
        Ok(QueryResult::ok(columns, data))
    }
}

fn row_to_map(row: &sqlx::sqlite::SqliteRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let value = decode_value(row, idx, col.type_info().name());
            (col.name().to_string(), value)
        })
        .collect()
}

fn decode_value(row: &sqlx::sqlite::SqliteRow, idx: usize, type_name: &str) -> serde_json::Value {
    let raw = row.try_get_raw(idx).ok();
    if raw.as_ref().map(ValueRef::is_null).unwrap_or(true) {
        return serde_json::Value::Null;
    }

    // Computed columns (COUNT(), SUM(), ...) carry no static SQLite column
    // type ("NULL"/"") so the declared type can't be trusted; fall back to
    // trying each representation in turn.
    match type_name {
        "INTEGER" | "BOOLEAN" => row
            .try_get::<i64, _>(idx)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "REAL" => row
            .try_get::<f64, _>(idx)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        "TEXT" => row
            .try_get::<String, _>(idx)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<i64, _>(idx)
            .map(serde_json::Value::from)
            .or_else(|_| {
                row.try_get::<f64, _>(idx).map(|f| {
                    serde_json::Number::from_f64(f)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                })
            })
            .or_else(|_| row.try_get::<String, _>(idx).map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_matches_scenario_counts() {
        let db = SqliteDatabase::seeded_in_memory().await.unwrap();

        let result = db
            .query("SELECT COUNT(DISTINCT app_name) AS n FROM app_portfolio")
            .await
            .unwrap();
        assert_eq!(result.data[0][0].1, serde_json::json!(49));

        let result = db
            .query(
                "SELECT COUNT(DISTINCT app_name) AS n FROM app_portfolio WHERE platform = 'iOS'",
            )
            .await
            .unwrap();
        assert_eq!(result.data[0][0].1, serde_json::json!(21));

        let result = db.query("SELECT * FROM app_portfolio").await.unwrap();
        assert_eq!(result.row_count, 50);
    }

    #[tokio::test]
    async fn rejects_bad_sql_as_query_error() {
        let db = SqliteDatabase::seeded_in_memory().await.unwrap();
        let err = db.query("SELECT * FROM not_a_table").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
    }
}

