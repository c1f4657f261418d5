use super::{FrameRecord, LightHistory, LightTransitionRecord, Record, RecordSink};
use crate::error::PersistenceError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Record sink backed by the `light_records` and `image_records` tables.
#[derive(Clone)]
pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn insert_all(&self, records: &[Record]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        let lights: Vec<&LightTransitionRecord> = records
            .iter()
            .filter_map(|record| match record {
                Record::LightTransition(transition) => Some(transition),
                _ => None,
            })
            .collect();
        let frames: Vec<&FrameRecord> = records
            .iter()
            .filter_map(|record| match record {
                Record::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        if !lights.is_empty() {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO light_records (name, datetime, \"on\") ");
            builder.push_values(lights.iter(), |mut b, transition| {
                b.push_bind(&transition.luminaire)
                    .push_bind(transition.at)
                    .push_bind(transition.on);
            });
            builder.build().execute(&mut *tx).await?;
        }
        if !frames.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO image_records (product_id, parameter, instrument, captured_at, width, height, file_path, label_path, metadata) ",
            );
            builder.push_values(frames.iter(), |mut b, frame| {
                b.push_bind(&frame.product_id)
                    .push_bind(&frame.parameter)
                    .push_bind(&frame.instrument)
                    .push_bind(frame.captured_at)
                    .push_bind(frame.width as i32)
                    .push_bind(frame.height as i32)
                    .push_bind(frame.path.to_string_lossy().into_owned())
                    .push_bind(frame.label_path.to_string_lossy().into_owned())
                    .push_bind(SqlJson(frame.metadata.to_json()));
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!(lights = lights.len(), frames = frames.len(), "inserted record batch");
        Ok(())
    }
}

#[async_trait]
impl LightHistory for PgRecordSink {
    async fn latest_before(
        &self,
        luminaire: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<LightTransitionRecord>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT name, datetime, "on"
            FROM light_records
            WHERE name = $1
              AND ($2::timestamptz IS NULL OR datetime < $2)
            ORDER BY datetime DESC
            LIMIT 1
            "#,
        )
        .bind(luminaire)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LightTransitionRecord {
            luminaire: row.try_get::<String, _>("name")?,
            at: row.try_get::<DateTime<Utc>, _>("datetime")?,
            on: row.try_get::<bool, _>("on")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::env;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&admin_pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE light_records (
                id serial primary key,
                name text not null,
                datetime timestamptz not null,
                "on" boolean not null
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE image_records (
                product_id text primary key,
                parameter text not null,
                instrument text not null,
                captured_at timestamptz null,
                width int not null,
                height int not null,
                file_path text not null,
                label_path text not null,
                metadata jsonb not null
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn light_records_round_trip_through_postgres() -> Result<()> {
        if env::var("ROVER_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("ROVER_TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => return Ok(()),
        };
        let pool = setup_test_pool(&database_url, "rover_ingest_sink_test").await?;
        let sink = PgRecordSink::new(pool);

        let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        sink.insert_all(&[
            Record::LightTransition(LightTransitionRecord {
                luminaire: "navLight1".to_string(),
                at: at(100),
                on: true,
            }),
            Record::LightTransition(LightTransitionRecord {
                luminaire: "navLight1".to_string(),
                at: at(200),
                on: false,
            }),
        ])
        .await?;

        let before = sink.latest_before("navLight1", Some(at(200))).await?;
        assert_eq!(before.map(|t| t.on), Some(true));
        let latest = sink.latest_before("navLight1", None).await?;
        assert_eq!(latest.map(|t| t.at), Some(at(200)));
        assert!(sink.latest_before("hazLight1", None).await?.is_none());
        Ok(())
    }
}
