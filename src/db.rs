use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open (creating if necessary) the sqlite database at `path` and run
/// embedded migrations. `path` may be `:memory:` for tests.
pub async fn connect(path: &str) -> anyhow::Result<SqlitePool> {
    let is_memory = path == ":memory:";
    let options = if is_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
    };

    // A `:memory:` database is private to the connection that opened it;
    // pooling more than one would hand out empty, schema-less databases
    // to every connection after the first. Pin the pool to a single
    // connection so every acquire sees the same in-memory database.
    let max_connections = if is_memory { 1 } else { 8 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
