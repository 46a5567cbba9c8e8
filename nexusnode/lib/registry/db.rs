use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Pool, Row, Sqlite,
    SqliteConnection,
};
use tokio::fs;

use crate::{
    models::{Instance, InstanceStatus, NetworkBinding, ServerResource},
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the registry database
pub static REGISTRY_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/registry/migrations");

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(db_path: impl AsRef<Path>, migrator: &Migrator) -> NexusResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}

/// Moves every instance persisted as starting or running back to stopped.
///
/// No sandbox outlives the daemon, so these records are stale after a restart.
pub(crate) async fn reconcile_statuses(pool: &Pool<Sqlite>) -> NexusResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET status = ?, modified_at = ?
        WHERE status IN (?, ?)
        "#,
    )
    .bind(InstanceStatus::Stopped.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(InstanceStatus::Starting.as_str())
    .bind(InstanceStatus::Running.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Loads every instance record.
pub(crate) async fn load_instances(pool: &Pool<Sqlite>) -> NexusResult<Vec<Instance>> {
    let rows = sqlx::query(
        r#"
        SELECT id, owner, name, status, cpu_cores, ram_mb, disk_gb, startup_command,
               entrypoint, port, url, workspace_ref, created_at, modified_at
        FROM instances
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(instance_from_row).collect()
}

/// Loads every allocated port.
pub(crate) async fn load_port_allocations(pool: &Pool<Sqlite>) -> NexusResult<Vec<u16>> {
    let rows = sqlx::query("SELECT port FROM port_allocations")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| row.get::<i64, _>("port") as u16)
        .collect())
}

/// Inserts a new instance and its port allocation.
pub(crate) async fn insert_instance(
    conn: &mut SqliteConnection,
    instance: &Instance,
) -> NexusResult<()> {
    sqlx::query(
        r#"
        INSERT INTO instances (
            id, owner, name, status, cpu_cores, ram_mb, disk_gb, startup_command,
            entrypoint, port, url, workspace_ref, created_at, modified_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.owner)
    .bind(&instance.name)
    .bind(instance.status.as_str())
    .bind(instance.limits.cpu_cores)
    .bind(instance.limits.ram_mb as i64)
    .bind(instance.limits.disk_gb)
    .bind(&instance.startup_command)
    .bind(&instance.entrypoint)
    .bind(instance.network.port as i64)
    .bind(&instance.network.url)
    .bind(&instance.workspace_ref)
    .bind(instance.created_at.to_rfc3339())
    .bind(instance.modified_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO port_allocations (port, instance_id, allocated_at)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(instance.network.port as i64)
    .bind(&instance.id)
    .bind(instance.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Writes the mutable fields of an instance.
pub(crate) async fn update_instance(pool: &Pool<Sqlite>, instance: &Instance) -> NexusResult<()> {
    sqlx::query(
        r#"
        UPDATE instances
        SET status = ?, cpu_cores = ?, ram_mb = ?, disk_gb = ?, startup_command = ?,
            entrypoint = ?, modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(instance.status.as_str())
    .bind(instance.limits.cpu_cores)
    .bind(instance.limits.ram_mb as i64)
    .bind(instance.limits.disk_gb)
    .bind(&instance.startup_command)
    .bind(&instance.entrypoint)
    .bind(instance.modified_at.to_rfc3339())
    .bind(&instance.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Removes an instance and releases its port.
pub(crate) async fn delete_instance(conn: &mut SqliteConnection, instance_id: &str) -> NexusResult<()> {
    sqlx::query("DELETE FROM port_allocations WHERE instance_id = ?")
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM instances WHERE id = ?")
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn instance_from_row(row: &SqliteRow) -> NexusResult<Instance> {
    let status: String = row.get("status");

    Ok(Instance {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        status: status.parse()?,
        limits: ServerResource {
            cpu_cores: row.get("cpu_cores"),
            ram_mb: row.get::<i64, _>("ram_mb") as u64,
            disk_gb: row.get("disk_gb"),
        },
        usage: ServerResource::default(),
        startup_command: row.get("startup_command"),
        entrypoint: row.get("entrypoint"),
        network: NetworkBinding {
            port: row.get::<i64, _>("port") as u16,
            url: row.get("url"),
        },
        workspace_ref: row.get("workspace_ref"),
        created_at: parse_timestamp(row.get("created_at"))?,
        modified_at: parse_timestamp(row.get("modified_at"))?,
    })
}

fn parse_timestamp(value: String) -> NexusResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(NexusError::custom)
}
