#![allow(dead_code)]

use anyhow::Result;
use gamwich_lib::migrate;
use gamwich_lib::store::household::{self, Household, User};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    migrate::apply_migrations(&pool).await?;
    Ok(pool)
}

pub async fn seed_household(pool: &SqlitePool) -> Result<(Household, User)> {
    Ok(
        household::create_household_with_admin(pool, "Bag End", "frodo@shire.example", "Frodo")
            .await?,
    )
}

pub async fn add_member(pool: &SqlitePool, household_id: i64, email: &str, name: &str) -> Result<User> {
    Ok(household::invite_member(pool, household_id, email, name, "member").await?)
}
