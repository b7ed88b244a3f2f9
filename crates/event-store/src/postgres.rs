use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AppendResult, CommandAddResult, CommandId, CommandStore, EventEnvelope,
    EventId, EventStore, EventStream, HandledCommand, Items, ProcessId, PublishProgressStore,
    Result, Snapshot, SnapshotStore, Version,
};

const STREAM_PRIMARY_KEY: &str = "event_streams_pkey";
const STREAM_COMMAND_KEY: &str = "unique_aggregate_command";

const STREAM_COLUMNS: &str =
    "aggregate_id, version, aggregate_type, command_id, process_id, timestamp, events, items";

/// PostgreSQL-backed implementation of every store trait.
///
/// Streams are stored one row per `(aggregate_id, version)`; the primary key
/// provides the optimistic-concurrency guard and a unique
/// `(aggregate_id, command_id)` constraint detects re-applied commands.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_stream(row: PgRow) -> Result<EventStream> {
        let events: Vec<EventEnvelope> = serde_json::from_value(row.try_get("events")?)?;
        let items: Items = serde_json::from_value(row.try_get("items")?)?;
        let process_id: Option<String> = row.try_get("process_id")?;

        let stream = EventStream::new(
            CommandId::from(row.try_get::<String, _>("command_id")?),
            AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            row.try_get::<String, _>("aggregate_type")?,
            Version::new(row.try_get("version")?),
            events,
        )?
        .with_process_id(process_id.map(ProcessId::from))
        .with_items(items)
        .with_timestamp(row.try_get("timestamp")?);

        Ok(stream)
    }

    fn row_to_command(row: PgRow) -> Result<HandledCommand> {
        let process_id: Option<String> = row.try_get("process_id")?;
        let source_event_id: Option<Uuid> = row.try_get("source_event_id")?;
        let version: Option<i64> = row.try_get("version")?;

        Ok(HandledCommand {
            command_id: CommandId::from(row.try_get::<String, _>("command_id")?),
            aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            command_type: row.try_get("command_type")?,
            process_id: process_id.map(ProcessId::from),
            source_event_id: source_event_id.map(EventId::from_uuid),
            version: version.map(Version::new),
            payload: row.try_get("payload")?,
            items: serde_json::from_value(row.try_get("items")?)?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(&self, stream: &EventStream) -> Result<AppendResult> {
        stream.verify()?;

        let events = serde_json::to_value(stream.events())?;
        let items = serde_json::to_value(stream.items())?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO event_streams
                (aggregate_id, version, aggregate_type, command_id, process_id, timestamp, events, items)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(stream.aggregate_id().as_str())
        .bind(stream.version().as_i64())
        .bind(stream.aggregate_type())
        .bind(stream.command_id().as_str())
        .bind(stream.process_id().map(ProcessId::as_str))
        .bind(stream.timestamp())
        .bind(events)
        .bind(items)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(AppendResult::Success),
            Err(sqlx::Error::Database(db_err)) => {
                let constraint = db_err.constraint().map(str::to_owned);
                match constraint.as_deref() {
                    Some(STREAM_COMMAND_KEY) => Ok(AppendResult::DuplicateCommand),
                    Some(STREAM_PRIMARY_KEY) => {
                        // Both keys can collide at once; the command check wins.
                        let prior = self
                            .find_by_command(stream.aggregate_id(), stream.command_id())
                            .await?;
                        if prior.is_some() {
                            Ok(AppendResult::DuplicateCommand)
                        } else {
                            metrics::counter!("event_store_version_conflicts_total").increment(1);
                            tracing::debug!(
                                aggregate_id = %stream.aggregate_id(),
                                version = %stream.version(),
                                "stream version already taken"
                            );
                            Ok(AppendResult::DuplicateEventVersion)
                        }
                    }
                    _ => Err(sqlx::Error::Database(db_err).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Version,
        to: Option<Version>,
    ) -> Result<Vec<EventStream>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STREAM_COLUMNS}
            FROM event_streams
            WHERE aggregate_id = $1
              AND version >= $2
              AND ($3::BIGINT IS NULL OR version <= $3)
            ORDER BY version ASC
            "#
        ))
        .bind(aggregate_id.as_str())
        .bind(from.as_i64())
        .bind(to.map(|v| v.as_i64()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_stream).collect()
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: &CommandId,
    ) -> Result<Option<EventStream>> {
        let row = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM event_streams WHERE aggregate_id = $1 AND command_id = $2"
        ))
        .bind(aggregate_id.as_str())
        .bind(command_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stream).transpose()
    }

    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM event_streams WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }
}

#[async_trait]
impl CommandStore for PostgresStore {
    async fn insert(&self, command: &HandledCommand) -> Result<CommandAddResult> {
        let result = sqlx::query(
            r#"
            INSERT INTO handled_commands
                (command_id, aggregate_id, aggregate_type, command_type, process_id,
                 source_event_id, version, payload, items, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (command_id) DO NOTHING
            "#,
        )
        .bind(command.command_id.as_str())
        .bind(command.aggregate_id.as_str())
        .bind(&command.aggregate_type)
        .bind(&command.command_type)
        .bind(command.process_id.as_ref().map(ProcessId::as_str))
        .bind(command.source_event_id.map(|id| id.as_uuid()))
        .bind(command.version.map(|v| v.as_i64()))
        .bind(&command.payload)
        .bind(serde_json::to_value(&command.items)?)
        .bind(command.timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(CommandAddResult::DuplicateCommand)
        } else {
            Ok(CommandAddResult::Success)
        }
    }

    async fn find(&self, command_id: &CommandId) -> Result<Option<HandledCommand>> {
        let row = sqlx::query(
            r#"
            SELECT command_id, aggregate_id, aggregate_type, command_type, process_id,
                   source_event_id, version, payload, items, timestamp
            FROM handled_commands
            WHERE command_id = $1
            "#,
        )
        .bind(command_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_command).transpose()
    }

    async fn remove(&self, command_id: &CommandId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM handled_commands WHERE command_id = $1")
            .bind(command_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SnapshotStore for PostgresStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, timestamp, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET aggregate_type = EXCLUDED.aggregate_type,
                version = EXCLUDED.version,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            WHERE snapshots.version < EXCLUDED.version
            "#,
        )
        .bind(snapshot.aggregate_id.as_str())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, timestamp, state
            FROM snapshots
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                timestamp: row.try_get("timestamp")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PublishProgressStore for PostgresStore {
    async fn published_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM published_versions WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }

    async fn record_published(&self, aggregate_id: &AggregateId, version: Version) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO published_versions (aggregate_id, version)
            VALUES ($1, $2)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET version = GREATEST(published_versions.version, EXCLUDED.version)
            "#,
        )
        .bind(aggregate_id.as_str())
        .bind(version.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
