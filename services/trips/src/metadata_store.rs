use crate::config::DatabaseConfig;
use crate::geo::Point;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by the relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("referenced row not found: {0}")]
    MissingReference(String),

    #[error("segment {0} is missing or already closed")]
    NotOpen(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    fn from_write(err: sqlx::Error, context: impl FnOnce() -> String) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db.is_unique_violation() {
                return Self::Duplicate(context());
            }
            if db.is_foreign_key_violation() {
                return Self::MissingReference(context());
            }
        }
        Self::Database(err)
    }
}

/// Identity mapping between a user device and its vehicle token
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Vehicle {
    pub token_id: i64,
    pub user_device_id: String,
}

/// Lifecycle position of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
}

/// One continuous driving interval
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: String,
    pub vehicle_token_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_position: Option<Point>,
    pub start_position_estimate: Option<Point>,
    pub end_position: Option<Point>,
    pub dropped_data: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub bundlr_id: Option<String>,
}

impl Segment {
    /// A freshly opened segment
    pub fn open(id: impl Into<String>, vehicle_token_id: i64, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            vehicle_token_id,
            start_time,
            end_time: None,
            start_position: None,
            start_position_estimate: None,
            end_position: None,
            dropped_data: false,
            encryption_key: None,
            bundlr_id: None,
        }
    }

    pub fn state(&self) -> SegmentState {
        if self.end_time.is_some() {
            SegmentState::Closed
        } else {
            SegmentState::Open
        }
    }

    /// Whether neither a literal nor an estimated start is known
    pub fn start_unknown(&self) -> bool {
        self.start_position.is_none() && self.start_position_estimate.is_none()
    }
}

/// Fields written exactly once when a segment closes
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCompletion {
    pub end_time: DateTime<Utc>,
    pub end_position: Option<Point>,
    pub start_position_estimate: Option<Point>,
    pub dropped_data: bool,
    pub encryption_key: Vec<u8>,
    pub bundlr_id: Option<String>,
}

/// Typed access to the `vehicles` and `trips` tables
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Record a device/token mapping; a no-op if the token is already known
    async fn upsert_vehicle(&self, device_id: &str, token_id: i64) -> Result<(), StoreError>;

    async fn get_vehicle_by_device_id(&self, device_id: &str)
        -> Result<Option<Vehicle>, StoreError>;

    /// Insert a new segment row; fails with `Duplicate` if the id exists
    async fn insert_segment(&self, segment: &Segment) -> Result<(), StoreError>;

    async fn get_segment(&self, id: &str) -> Result<Option<Segment>, StoreError>;

    /// Close an open segment; fails with `NotOpen` if it is missing or closed
    async fn update_segment_on_complete(
        &self,
        id: &str,
        completion: &SegmentCompletion,
    ) -> Result<(), StoreError>;

    /// Closed segment with the latest end time for the vehicle
    async fn get_most_recent_closed_segment(
        &self,
        token_id: i64,
    ) -> Result<Option<Segment>, StoreError>;
}

/// Row shape of `trips`, with points split into coordinates
#[derive(Debug, FromRow)]
struct SegmentRow {
    id: String,
    vehicle_token_id: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    start_lon: Option<f64>,
    start_lat: Option<f64>,
    start_est_lon: Option<f64>,
    start_est_lat: Option<f64>,
    end_lon: Option<f64>,
    end_lat: Option<f64>,
    dropped_data: bool,
    encryption_key: Option<Vec<u8>>,
    bundlr_id: Option<String>,
}

fn point_from_columns(lon: Option<f64>, lat: Option<f64>) -> Option<Point> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Point::new(lat, lon)),
        _ => None,
    }
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Self {
            id: row.id,
            vehicle_token_id: row.vehicle_token_id,
            start_time: row.start_time,
            end_time: row.end_time,
            start_position: point_from_columns(row.start_lon, row.start_lat),
            start_position_estimate: point_from_columns(row.start_est_lon, row.start_est_lat),
            end_position: point_from_columns(row.end_lon, row.end_lat),
            dropped_data: row.dropped_data,
            encryption_key: row.encryption_key,
            bundlr_id: row.bundlr_id,
        }
    }
}

// POINT columns store x = longitude, y = latitude.
const SEGMENT_COLUMNS: &str = r#"
    id, vehicle_token_id, start_time, end_time,
    start_position[0] AS start_lon, start_position[1] AS start_lat,
    start_position_estimate[0] AS start_est_lon, start_position_estimate[1] AS start_est_lat,
    end_position[0] AS end_lon, end_position[1] AS end_lat,
    dropped_data, encryption_key, bundlr_id
"#;

/// Metadata store backed by PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TripStore for MetadataStore {
    #[instrument(skip(self))]
    async fn upsert_vehicle(&self, device_id: &str, token_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO vehicles (token_id, user_device_id)
            VALUES ($1, $2)
            ON CONFLICT (token_id) DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::from_write(e, || format!("vehicle for device {device_id}"))
        })?;

        debug!(
            inserted = result.rows_affected() == 1,
            "Vehicle mapping stored"
        );
        Ok(())
    }

    async fn get_vehicle_by_device_id(
        &self,
        device_id: &str,
    ) -> Result<Option<Vehicle>, StoreError> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            SELECT token_id, user_device_id
            FROM vehicles
            WHERE user_device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(vehicle)
    }

    #[instrument(skip(self, segment), fields(segment_id = %segment.id))]
    async fn insert_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        let start = segment.start_position;
        let estimate = segment.start_position_estimate;
        let end = segment.end_position;

        sqlx::query(
            r#"
            INSERT INTO trips (
                id, vehicle_token_id, start_time, end_time,
                start_position, start_position_estimate, end_position,
                dropped_data, encryption_key, bundlr_id
            ) VALUES (
                $1, $2, $3, $4,
                point($5, $6), point($7, $8), point($9, $10),
                $11, $12, $13
            )
            "#,
        )
        .bind(&segment.id)
        .bind(segment.vehicle_token_id)
        .bind(segment.start_time)
        .bind(segment.end_time)
        .bind(start.map(|p| p.longitude))
        .bind(start.map(|p| p.latitude))
        .bind(estimate.map(|p| p.longitude))
        .bind(estimate.map(|p| p.latitude))
        .bind(end.map(|p| p.longitude))
        .bind(end.map(|p| p.latitude))
        .bind(segment.dropped_data)
        .bind(&segment.encryption_key)
        .bind(&segment.bundlr_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, || format!("segment {}", segment.id)))?;

        debug!("Segment inserted");
        Ok(())
    }

    async fn get_segment(&self, id: &str) -> Result<Option<Segment>, StoreError> {
        let sql = format!("SELECT {SEGMENT_COLUMNS} FROM trips WHERE id = $1");
        let row = sqlx::query_as::<_, SegmentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Segment::from))
    }

    #[instrument(skip(self, completion))]
    async fn update_segment_on_complete(
        &self,
        id: &str,
        completion: &SegmentCompletion,
    ) -> Result<(), StoreError> {
        let end = completion.end_position;
        let estimate = completion.start_position_estimate;

        let result = sqlx::query(
            r#"
            UPDATE trips SET
                end_time = $2,
                end_position = point($3, $4),
                start_position_estimate = point($5, $6),
                dropped_data = $7,
                encryption_key = $8,
                bundlr_id = $9
            WHERE id = $1 AND end_time IS NULL
            "#,
        )
        .bind(id)
        .bind(completion.end_time)
        .bind(end.map(|p| p.longitude))
        .bind(end.map(|p| p.latitude))
        .bind(estimate.map(|p| p.longitude))
        .bind(estimate.map(|p| p.latitude))
        .bind(completion.dropped_data)
        .bind(&completion.encryption_key)
        .bind(&completion.bundlr_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotOpen(id.to_string()));
        }

        debug!("Segment closed");
        Ok(())
    }

    async fn get_most_recent_closed_segment(
        &self,
        token_id: i64,
    ) -> Result<Option<Segment>, StoreError> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM trips \
             WHERE vehicle_token_id = $1 AND end_time IS NOT NULL \
             ORDER BY end_time DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SegmentRow>(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Segment::from))
    }
}
