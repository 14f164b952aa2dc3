//! Rewards redeemable against chore points.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::store::chores::point_balance;
use crate::time::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct Reward {
    pub id: i64,
    pub household_id: i64,
    pub title: String,
    pub cost: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardInput {
    pub title: String,
    pub cost: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub id: i64,
    pub reward_id: i64,
    pub user_id: i64,
    pub cost: i64,
    pub redeemed_at: i64,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Reward> {
    Ok(Reward {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        title: row.try_get("title")?,
        cost: row.try_get("cost")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create(pool: &SqlitePool, household_id: i64, input: &RewardInput) -> AppResult<Reward> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Title must not be empty"));
    }
    if input.cost < 0 {
        return Err(AppError::validation("Cost must not be negative"));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO rewards (household_id, title, cost, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(household_id)
    .bind(title)
    .bind(input.cost)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Reward"))
}

pub async fn get(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<Option<Reward>> {
    let row = sqlx::query(
        "SELECT id, household_id, title, cost, created_at, updated_at FROM rewards \
         WHERE id = ? AND household_id = ?",
    )
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<Reward>> {
    let rows = sqlx::query(
        "SELECT id, household_id, title, cost, created_at, updated_at FROM rewards \
         WHERE household_id = ? ORDER BY cost, title",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM rewards WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Reward"));
    }
    Ok(())
}

/// Spend points on a reward. The cost is snapshotted into the redemption so
/// later price changes do not rewrite history.
pub async fn redeem(
    pool: &SqlitePool,
    household_id: i64,
    reward_id: i64,
    user_id: i64,
) -> AppResult<Redemption> {
    let reward = get(pool, household_id, reward_id)
        .await?
        .ok_or_else(|| AppError::not_found("Reward"))?;
    let balance = point_balance(pool, user_id).await?;
    if balance < reward.cost {
        return Err(
            AppError::validation("Not enough points for this reward")
                .with_context("balance", balance.to_string())
                .with_context("cost", reward.cost.to_string()),
        );
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO reward_redemptions (reward_id, user_id, cost, redeemed_at) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(reward_id)
    .bind(user_id)
    .bind(reward.cost)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(Redemption {
        id,
        reward_id,
        user_id,
        cost: reward.cost,
        redeemed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use crate::store::chores::{self, ChoreInput};
    use crate::store::household::create_household_with_admin;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture() -> (SqlitePool, i64, i64) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        let (hh, user) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        (pool, hh.id, user.id)
    }

    #[tokio::test]
    async fn redeem_requires_sufficient_balance() {
        let (pool, hh, user) = fixture().await;
        let reward = create(
            &pool,
            hh,
            &RewardInput {
                title: "Movie night".to_string(),
                cost: 10,
            },
        )
        .await
        .unwrap();

        let err = redeem(&pool, hh, reward.id, user).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION/BAD_REQUEST");

        let chore = chores::create(
            &pool,
            hh,
            &ChoreInput {
                title: "Mow lawn".to_string(),
                description: None,
                assigned_to: None,
                due_at: None,
                rrule: None,
                points: 12,
            },
        )
        .await
        .unwrap();
        chores::complete(&pool, hh, chore.id, user).await.unwrap();

        let redemption = redeem(&pool, hh, reward.id, user).await.unwrap();
        assert_eq!(redemption.cost, 10);
        assert_eq!(chores::point_balance(&pool, user).await.unwrap(), 2);
    }
}
