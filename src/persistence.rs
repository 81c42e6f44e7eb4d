//! SQLite-backed catalog, position, travel-time, and geometry-cache
//! storage, grounded on `sync::SyncManager`'s upsert/transaction shape
//! (`ON CONFLICT(...) DO UPDATE SET ... = excluded...`, one transaction per
//! catalog refresh) and on `api::stations::list`'s `json_each` batched-IN
//! pattern for multi-row lookups.

use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use crate::models::{DayType, StopOnRoute, TravelObservation};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Debug, Clone, FromRow)]
pub struct RouteRow {
    pub id: i64,
    pub number: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct RouteStopRow {
    pub route_id: i64,
    pub stop_id: i64,
    pub stop_name: String,
    pub lat: f64,
    pub lon: f64,
    pub direction: i64,
    pub stop_order: i64,
}

#[derive(Debug, Clone)]
pub struct VehiclePositionRow {
    pub vehicle_id: String,
    pub route_id: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub progress: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| PersistenceError::Connection(e.to_string()))?;
        let store = Self::new(pool);
        store.create_schema().await?;
        Ok(store)
    }

    pub async fn create_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                id INTEGER PRIMARY KEY,
                number TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT ''
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stops (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS route_stops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id INTEGER NOT NULL,
                stop_id INTEGER NOT NULL,
                direction INTEGER NOT NULL,
                stop_order INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                UNIQUE(route_id, stop_id, direction, stop_order)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicle_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                route_id INTEGER,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                speed REAL,
                course REAL,
                progress REAL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_vp_vehicle_ts ON vehicle_positions(vehicle_id, timestamp);
            CREATE INDEX IF NOT EXISTS ix_vp_route_ts ON vehicle_positions(route_id, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS travel_time_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id INTEGER NOT NULL,
                from_stop_id INTEGER NOT NULL,
                to_stop_id INTEGER NOT NULL,
                day_type TEXT NOT NULL,
                hour INTEGER NOT NULL,
                median_seconds REAL NOT NULL,
                sample_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE(route_id, from_stop_id, to_stop_id, day_type, hour)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS geometry_cache (
                route_number TEXT PRIMARY KEY,
                points_json TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Upserts the full catalog (routes, stops, route-stop orderings) in a
    /// single transaction, so a partial failure leaves the previous
    /// catalog intact.
    pub async fn upsert_catalog(
        &self,
        routes: &[RouteRow],
        route_stops: &[(i64, StopOnRoute)],
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for route in routes {
            upsert_route(&mut tx, route).await?;
        }

        let mut seen_stops = std::collections::HashSet::new();
        for (_, stop) in route_stops {
            if seen_stops.insert(stop.stop_id) {
                upsert_stop(&mut tx, stop.stop_id, &stop.name).await?;
            }
        }

        for (route_id, stop) in route_stops {
            upsert_route_stop(&mut tx, *route_id, stop).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn append_positions(&self, positions: &[VehiclePositionRow]) -> Result<(), PersistenceError> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for p in positions {
            sqlx::query(
                r#"
                INSERT INTO vehicle_positions (vehicle_id, route_id, lat, lon, speed, course, progress, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.vehicle_id)
            .bind(p.route_id)
            .bind(p.lat)
            .bind(p.lon)
            .bind(p.speed)
            .bind(p.course)
            .bind(p.progress)
            .bind(p.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Applies the incremental-mean update from §6 for one observation:
    /// `median_seconds := median_seconds + (sample - median_seconds) / (count + 1)`.
    pub async fn record_travel_time(&self, obs: &TravelObservation) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO travel_time_segments
                (route_id, from_stop_id, to_stop_id, day_type, hour, median_seconds, sample_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(route_id, from_stop_id, to_stop_id, day_type, hour) DO UPDATE SET
                median_seconds = median_seconds + (? - median_seconds) / (sample_count + 1),
                sample_count = sample_count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(obs.route_id)
        .bind(obs.from_stop_id)
        .bind(obs.to_stop_id)
        .bind(obs.day_type.as_str())
        .bind(obs.hour as i64)
        .bind(obs.seconds)
        .bind(Utc::now().to_rfc3339())
        .bind(obs.seconds)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn cached_geometry_if_fresh(
        &self,
        route_number: &str,
        freshness_hours: i64,
    ) -> Result<Option<Vec<(f64, f64)>>, PersistenceError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT points_json, fetched_at FROM geometry_cache WHERE route_number = ?")
                .bind(route_number)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        let Some((points_json, fetched_at)) = row else {
            return Ok(None);
        };

        let fetched_at: DateTime<Utc> = fetched_at
            .parse()
            .map_err(|e: chrono::ParseError| PersistenceError::Decode(e.to_string()))?;
        if Utc::now() - fetched_at > chrono::Duration::hours(freshness_hours) {
            return Ok(None);
        }

        let points: Vec<(f64, f64)> =
            serde_json::from_str(&points_json).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        Ok(Some(points))
    }

    pub async fn store_geometry(&self, route_number: &str, points: &[(f64, f64)]) -> Result<(), PersistenceError> {
        let points_json = serde_json::to_string(points).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO geometry_cache (route_number, points_json, fetched_at)
            VALUES (?, ?, ?)
            ON CONFLICT(route_number) DO UPDATE SET
                points_json = excluded.points_json,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(route_number)
        .bind(points_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn load_route_stops(&self, route_ids: &[i64]) -> Result<Vec<RouteStopRow>, PersistenceError> {
        let ids_json = serde_json::to_string(route_ids).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        sqlx::query_as(
            r#"
            SELECT rs.route_id, rs.stop_id, s.name AS stop_name, rs.lat, rs.lon, rs.direction, rs.stop_order
            FROM route_stops rs
            JOIN stops s ON s.id = rs.stop_id
            WHERE rs.route_id IN (SELECT value FROM json_each(?))
            ORDER BY rs.route_id, rs.direction, rs.stop_order
            "#,
        )
        .bind(ids_json)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

async fn upsert_route(tx: &mut Transaction<'_, Sqlite>, route: &RouteRow) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO routes (id, number, name) VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET number = excluded.number, name = excluded.name
        "#,
    )
    .bind(route.id)
    .bind(&route.number)
    .bind(&route.name)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn upsert_stop(tx: &mut Transaction<'_, Sqlite>, stop_id: i64, name: &str) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO stops (id, name) VALUES (?, ?)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name
        "#,
    )
    .bind(stop_id)
    .bind(name)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn upsert_route_stop(
    tx: &mut Transaction<'_, Sqlite>,
    route_id: i64,
    stop: &StopOnRoute,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO route_stops (route_id, stop_id, direction, stop_order, lat, lon)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(route_id, stop_id, direction, stop_order) DO UPDATE SET
            lat = excluded.lat,
            lon = excluded.lon
        "#,
    )
    .bind(route_id)
    .bind(stop.stop_id)
    .bind(stop.direction as i64)
    .bind(stop.order as i64)
    .bind(stop.lat)
    .bind(stop.lon)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Database(e.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to connect: {0}")]
    Connection(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

/// Classifies the day-type/hour bucket a travel-time observation should be
/// filed under, per §4.5 step 4: local time is UTC+5, night hours [0,5)
/// excluded.
pub fn local_day_type_and_hour(now_utc: DateTime<Utc>) -> Option<(DayType, u8)> {
    let local = now_utc + chrono::Duration::hours(5);
    let hour = local.hour() as u8;
    if hour < 5 {
        return None;
    }
    Some((DayType::from_chrono_weekday(local.weekday()), hour))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn night_hours_are_excluded() {
        let midnight_utc = Utc.with_ymd_and_hms(2026, 1, 5, 20, 0, 0).unwrap(); // 01:00 local
        assert!(local_day_type_and_hour(midnight_utc).is_none());
    }

    #[test]
    fn service_hours_classify_day_type() {
        // 2026-01-05 is a Monday; +5h stays Monday.
        let morning_utc = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let (day_type, hour) = local_day_type_and_hour(morning_utc).unwrap();
        assert_eq!(day_type, DayType::Weekday);
        assert_eq!(hour, 13);
    }

    async fn memory_store() -> Store {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Store::new(pool);
        store.create_schema().await.unwrap();
        store
    }

    fn observation(seconds: f64) -> TravelObservation {
        TravelObservation {
            route_id: 1,
            from_stop_id: 10,
            to_stop_id: 11,
            day_type: DayType::Weekday,
            hour: 8,
            seconds,
        }
    }

    #[tokio::test]
    async fn record_travel_time_converges_to_the_sample_mean() {
        let store = memory_store().await;

        for seconds in [100.0, 110.0, 120.0] {
            store.record_travel_time(&observation(seconds)).await.unwrap();
        }

        let (median_seconds, sample_count): (f64, i64) = sqlx::query_as(
            r#"
            SELECT median_seconds, sample_count FROM travel_time_segments
            WHERE route_id = ? AND from_stop_id = ? AND to_stop_id = ? AND day_type = ? AND hour = ?
            "#,
        )
        .bind(1i64)
        .bind(10i64)
        .bind(11i64)
        .bind(DayType::Weekday.as_str())
        .bind(8i64)
        .fetch_one(&store.pool)
        .await
        .unwrap();

        assert_eq!(sample_count, 3);
        assert!((median_seconds - 110.0).abs() < 1e-6, "median_seconds={median_seconds}");
    }
}
