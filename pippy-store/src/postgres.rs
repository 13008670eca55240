//! Relational store backend
//!
//! One `(key text unique, value jsonb)` table per deployment; JSON-path
//! sorts and grouped counts are translated into server-side
//! `jsonb_path_query` calls so they never load the full prefix into memory.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{Result, Store, StoreError};

pub struct PgStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgStore {
    /// Connect and make sure the backing table exists.
    pub async fn connect(database_url: &str, schema: &str, table: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let store = Self {
            pool,
            schema: schema.to_string(),
            table: table.to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    async fn ensure_table(&self) -> Result<()> {
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id SERIAL PRIMARY KEY, \
             date TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             key VARCHAR UNIQUE, \
             value JSONB);",
            self.qualified()
        );
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    fn like_pattern(prefix: &str) -> String {
        format!("{prefix}%")
    }

    async fn sorted_n(
        &self,
        prefix: &str,
        json_path: &str,
        order: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        let mut query = format!(
            "SELECT key, value FROM {} WHERE key LIKE $1 \
             ORDER BY jsonb_path_query(value, $2::jsonpath) {order}",
            self.qualified()
        );
        if limit > 0 {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .bind(json_path)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let value: Value = row.try_get("value")?;
                Ok((key, value))
            })
            .collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_value(&self, key: &str, value: Value) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value;",
            self.qualified()
        );
        sqlx::query(&query)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_value(&self, key: &str) -> Result<Value> {
        let query = format!("SELECT value FROM {} WHERE key = $1;", self.qualified());
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::KeyNotFound)?;
        Ok(row.try_get("value")?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key = $1;", self.qualified());
        sqlx::query(&query).bind(key).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key LIKE $1;", self.qualified());
        sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let query = format!("SELECT key FROM {} WHERE key LIKE $1;", self.qualified());
        let rows = sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("key")?))
            .collect()
    }

    async fn load_values(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let query = format!(
            "SELECT key, value FROM {} WHERE key LIKE $1;",
            self.qualified()
        );
        let rows = sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let value: Value = row.try_get("value")?;
                Ok((key, value))
            })
            .collect()
    }

    async fn count(&self, prefix: &str) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(key) FROM {} WHERE key LIKE $1;",
            self.qualified()
        );
        let count: i64 = sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count as u64)
    }

    async fn count_json_path(&self, prefix: &str, json_path: &str) -> Result<Vec<(Value, i64)>> {
        let query = format!(
            "SELECT jsonb_path_query(value, $2::jsonpath) AS jsonpath, COUNT(key) \
             FROM {} WHERE key LIKE $1 GROUP BY jsonpath;",
            self.qualified()
        );
        let rows = sqlx::query(&query)
            .bind(Self::like_pattern(prefix))
            .bind(json_path)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let value: Value = row.try_get("jsonpath")?;
                let count: i64 = row.try_get(1)?;
                Ok((value, count))
            })
            .collect()
    }

    async fn sorted_asc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        self.sorted_n(prefix, json_path, "ASC", limit).await
    }

    async fn sorted_desc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        self.sorted_n(prefix, json_path, "DESC", limit).await
    }
}
