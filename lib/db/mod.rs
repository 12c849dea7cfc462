use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::sql_types::BigInt;
use diesel::{OptionalExtension, QueryableByName};
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool, PoolError},
        AsyncDieselConnectionManager,
    },
    RunQueryDsl,
};
use futures::future::BoxFuture;
use thiserror::Error;

/// Instance ids at or above this are reserved for synthetic rows.
const SYNTHETIC_ID_FLOOR: i64 = 100_000_000_000;

pub async fn build_db_pool(db_url: &str) -> Result<Pool<AsyncPgConnection>, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(manager).max_size(4).build()
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("database pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("no stored instances")]
    Empty,

    #[error("stored completion time {0} is out of range")]
    BadTimestamp(i64),
}

/// Newest instance already stored downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestInstance {
    pub instance_id: i64,
    pub completed_at: DateTime<Utc>,
}

pub trait LatestInstanceLookup: Send + Sync {
    fn latest_instance<'a>(&'a self) -> BoxFuture<'a, Result<LatestInstance, LookupError>>;
}

impl<T> LatestInstanceLookup for Arc<T>
where
    T: LatestInstanceLookup + ?Sized,
{
    fn latest_instance<'a>(&'a self) -> BoxFuture<'a, Result<LatestInstance, LookupError>> {
        (**self).latest_instance()
    }
}

#[derive(QueryableByName, Debug)]
struct LatestRow {
    #[diesel(sql_type = BigInt)]
    instance_id: i64,
    #[diesel(sql_type = BigInt)]
    completed_epoch: i64,
}

pub struct PgLatestInstanceLookup {
    pool: Pool<AsyncPgConnection>,
}

impl PgLatestInstanceLookup {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    async fn query_latest(&self) -> Result<LatestInstance, LookupError> {
        let mut conn = self.pool.get().await?;
        let row: Option<LatestRow> = diesel::sql_query(
            "SELECT instance_id, EXTRACT(EPOCH FROM date_completed)::BIGINT AS completed_epoch \
             FROM instance WHERE instance_id < $1 ORDER BY instance_id DESC LIMIT 1",
        )
        .bind::<BigInt, _>(SYNTHETIC_ID_FLOOR)
        .get_result(&mut conn)
        .await
        .optional()?;

        let row = row.ok_or(LookupError::Empty)?;
        let completed_at = DateTime::<Utc>::from_timestamp(row.completed_epoch, 0)
            .ok_or(LookupError::BadTimestamp(row.completed_epoch))?;
        Ok(LatestInstance {
            instance_id: row.instance_id,
            completed_at,
        })
    }
}

impl LatestInstanceLookup for PgLatestInstanceLookup {
    fn latest_instance<'a>(&'a self) -> BoxFuture<'a, Result<LatestInstance, LookupError>> {
        Box::pin(self.query_latest())
    }
}
