use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

/// Connect to the throwaway test database, or None when TEST_DATABASE_URL is
/// unset (the suite then skips itself).
pub async fn test_pool() -> Option<Pool<Postgres>> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("test database unreachable");
    fleet_orchestrator::migrations::run_inline_migrations(&pool).await;
    Some(pool)
}

/// Unique per-test VM name so suites can run against a shared database.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, &uuid::Uuid::new_v4().to_string()[..8])
}
