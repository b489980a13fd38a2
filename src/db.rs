//! Database connections shared by the repositories.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId, Bson};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DbConfig;
use crate::error::Result;

/// Open the PostgreSQL pool and apply pending migrations.
pub async fn connect_postgres(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.postgres_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Connect to MongoDB and verify the server answers.
pub async fn connect_mongo(config: &DbConfig) -> Result<mongodb::Database> {
    let client = mongodb::Client::with_uri_str(&config.mongo_uri).await?;
    let db = client.database(&config.mongo_name);
    db.run_command(bson::doc! { "ping": 1 }).await?;
    info!(database = %config.mongo_name, "Connected to MongoDB");
    Ok(db)
}

pub fn to_bson_date(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

pub fn from_bson_date(at: bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or_default()
}

/// Object ids go in as BSON `ObjectId`, any other id stays a string.
pub fn to_bson_id(raw: &str) -> Bson {
    match ObjectId::parse_str(raw) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(raw.to_string()),
    }
}

/// Reads back either form; object ids come out as lowercase hex.
pub fn from_bson_id(value: Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(raw) => raw,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bson_id_types() {
        let raw = "65A1F0C2E4B0A1B2C3D4E5F6";
        let id = to_bson_id(raw);
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(from_bson_id(id), raw.to_lowercase());

        assert_eq!(to_bson_id("code-1"), Bson::String("code-1".into()));
        assert_eq!(from_bson_id(Bson::String("code-1".into())), "code-1");
    }

    #[test]
    fn test_bson_date_keeps_millis() {
        let now = Utc::now();
        let back = from_bson_date(to_bson_date(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
