use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::warn;

use soko_core::repository::{PurgeReport, RepositoryError, RepositoryResult, TimetableChanges, TrainRepository};
use soko_core::{Direction, Passenger, Slot, Train, TrainKey};

pub struct PostgresTrainRepository {
    pool: PgPool,
}

impl PostgresTrainRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn passengers_by_train(&self, train_ids: &[i64]) -> RepositoryResult<HashMap<i64, Vec<Passenger>>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT tp.train_id, p.handle, p.chat_id
            FROM train_passengers tp
            JOIN passengers p ON p.id = tp.passenger_id
            WHERE tp.train_id = ANY($1)
            ORDER BY p.handle
            "#,
        )
        .bind(train_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;

        let mut grouped: HashMap<i64, Vec<Passenger>> = HashMap::new();
        for row in rows {
            grouped.entry(row.train_id).or_default().push(Passenger {
                handle: row.handle,
                chat_id: row.chat_id,
            });
        }
        Ok(grouped)
    }
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct TrainRow {
    id: i64,
    number: i32,
    direction: i16,
    departure_time: DateTime<Utc>,
    arrival_time: DateTime<Utc>,
    tag: Option<String>,
}

impl TrainRow {
    fn into_train(self) -> RepositoryResult<Train> {
        let direction = u8::try_from(self.direction)
            .ok()
            .and_then(Direction::from_byte)
            .ok_or_else(|| RepositoryError::Corrupt(format!("train {} has direction {}", self.id, self.direction)))?;
        Ok(Train {
            number: self.number,
            direction,
            departure: self.departure_time,
            arrival: self.arrival_time,
            tag: self.tag,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    train_id: i64,
    handle: String,
    chat_id: i64,
}

#[derive(sqlx::FromRow)]
struct PassengerRow {
    handle: String,
    chat_id: i64,
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    number: i32,
    departure_time: DateTime<Utc>,
}

fn direction_column(direction: Direction) -> i16 {
    direction.as_byte() as i16
}

async fn clear_memberships(tx: &mut Transaction<'_, Postgres>, key: &TrainKey) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM train_passengers
        WHERE train_id IN (SELECT id FROM trains WHERE number = $1 AND departure_time = $2)
        "#,
    )
    .bind(key.number)
    .bind(key.departure)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl TrainRepository for PostgresTrainRepository {
    async fn find_slot(&self, key: &TrainKey) -> RepositoryResult<Option<Slot>> {
        let row = sqlx::query_as::<_, TrainRow>(
            r#"
            SELECT id, number, direction, departure_time, arrival_time, tag
            FROM trains
            WHERE number = $1 AND departure_time = $2
            "#,
        )
        .bind(key.number)
        .bind(key.departure)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id = row.id;
        let mut passengers = self.passengers_by_train(&[id]).await?;
        let train = row.into_train()?;
        Ok(Some(Slot::new(train, passengers.remove(&id).unwrap_or_default())))
    }

    async fn find_slots(
        &self,
        direction: Option<Direction>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Slot>> {
        let rows = sqlx::query_as::<_, TrainRow>(
            r#"
            SELECT id, number, direction, departure_time, arrival_time, tag
            FROM trains
            WHERE ($1::SMALLINT IS NULL OR direction = $1)
              AND arrival_time >= $2
              AND departure_time < $3
            ORDER BY departure_time, number
            "#,
        )
        .bind(direction.map(direction_column))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut passengers = self.passengers_by_train(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let list = passengers.remove(&row.id).unwrap_or_default();
                Ok(Slot::new(row.into_train()?, list))
            })
            .collect()
    }

    async fn trains_departing(
        &self,
        direction: Direction,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Train>> {
        let rows = sqlx::query_as::<_, TrainRow>(
            r#"
            SELECT id, number, direction, departure_time, arrival_time, tag
            FROM trains
            WHERE direction = $1 AND departure_time >= $2 AND departure_time < $3
            ORDER BY departure_time, number
            "#,
        )
        .bind(direction_column(direction))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;

        rows.into_iter().map(TrainRow::into_train).collect()
    }

    async fn find_passenger(&self, handle: &str) -> RepositoryResult<Option<Passenger>> {
        let row = sqlx::query_as::<_, PassengerRow>("SELECT handle, chat_id FROM passengers WHERE handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::backend)?;

        Ok(row.map(|r| Passenger { handle: r.handle, chat_id: r.chat_id }))
    }

    async fn upsert_passenger(&self, passenger: &Passenger) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO passengers (handle, chat_id)
            VALUES ($1, $2)
            ON CONFLICT (handle) DO UPDATE SET chat_id = EXCLUDED.chat_id
            "#,
        )
        .bind(&passenger.handle)
        .bind(passenger.chat_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;
        Ok(())
    }

    async fn insert_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool> {
        // Resolving both ends inside the INSERT makes a concurrently deleted train a no-op.
        let result = sqlx::query(
            r#"
            INSERT INTO train_passengers (train_id, passenger_id)
            SELECT t.id, p.id
            FROM trains t, passengers p
            WHERE t.number = $1 AND t.departure_time = $2 AND p.handle = $3
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.number)
        .bind(key.departure)
        .bind(handle)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM train_passengers tp
            USING trains t, passengers p
            WHERE tp.train_id = t.id AND tp.passenger_id = p.id
              AND t.number = $1 AND t.departure_time = $2 AND p.handle = $3
            "#,
        )
        .bind(key.number)
        .bind(key.departure)
        .bind(handle)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_passenger_if_unboarded(&self, handle: &str) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM passengers p
            WHERE p.handle = $1
              AND NOT EXISTS (SELECT 1 FROM train_passengers tp WHERE tp.passenger_id = p.id)
            "#,
        )
        .bind(handle)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_timetable(&self, changes: &TimetableChanges) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::backend)?;

        // 1. Cancelled trains: drop memberships first, the foreign keys restrict deletes
        for key in &changes.cancelled {
            clear_memberships(&mut tx, key).await.map_err(RepositoryError::backend)?;
            sqlx::query("DELETE FROM trains WHERE number = $1 AND departure_time = $2")
                .bind(key.number)
                .bind(key.departure)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::backend)?;
        }

        // 2. Rescheduled trains lose their passengers
        for reschedule in &changes.rescheduled {
            let previous = &reschedule.previous;
            let train = &reschedule.train;
            clear_memberships(&mut tx, previous).await.map_err(RepositoryError::backend)?;
            let result = sqlx::query(
                r#"
                UPDATE trains
                SET departure_time = $3, arrival_time = $4, direction = $5, tag = $6
                WHERE number = $1 AND departure_time = $2
                "#,
            )
            .bind(previous.number)
            .bind(previous.departure)
            .bind(train.departure)
            .bind(train.arrival)
            .bind(direction_column(train.direction))
            .bind(&train.tag)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::backend)?;
            if result.rows_affected() == 0 {
                warn!("Rescheduled train {} was no longer stored", previous);
            }
        }

        // 3. Tag-only changes keep passengers
        for retag in &changes.retagged {
            sqlx::query("UPDATE trains SET tag = $3 WHERE number = $1 AND departure_time = $2")
                .bind(retag.key.number)
                .bind(retag.key.departure)
                .bind(&retag.tag)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::backend)?;
        }

        // 4. New trains
        for train in &changes.inserted {
            let result = sqlx::query(
                r#"
                INSERT INTO trains (number, direction, departure_time, arrival_time, tag)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (number, departure_time) DO NOTHING
                "#,
            )
            .bind(train.number)
            .bind(direction_column(train.direction))
            .bind(train.departure)
            .bind(train.arrival)
            .bind(&train.tag)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::backend)?;
            if result.rows_affected() == 0 {
                warn!("Train {} already stored, insert skipped", train.key());
            }
        }

        tx.commit().await.map_err(RepositoryError::backend)?;
        Ok(())
    }

    async fn purge_arrived(&self, now: DateTime<Utc>) -> RepositoryResult<PurgeReport> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::backend)?;

        sqlx::query(
            r#"
            DELETE FROM train_passengers
            WHERE train_id IN (SELECT id FROM trains WHERE arrival_time < $1)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::backend)?;

        let trains = sqlx::query_as::<_, KeyRow>(
            "DELETE FROM trains WHERE arrival_time < $1 RETURNING number, departure_time",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(RepositoryError::backend)?;

        let passengers: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM passengers p
            WHERE NOT EXISTS (SELECT 1 FROM train_passengers tp WHERE tp.passenger_id = p.id)
            RETURNING p.handle
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(RepositoryError::backend)?;

        tx.commit().await.map_err(RepositoryError::backend)?;

        Ok(PurgeReport {
            trains: trains
                .into_iter()
                .map(|r| TrainKey::new(r.number, r.departure_time))
                .collect(),
            passengers,
        })
    }

    async fn count_trains(&self) -> RepositoryResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM trains")
            .fetch_one(&self.pool)
            .await
            .map_err(RepositoryError::backend)
    }
}
