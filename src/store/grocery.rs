use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct GroceryItem {
    pub id: i64,
    pub household_id: i64,
    pub name: String,
    pub quantity: Option<String>,
    pub category: Option<String>,
    pub checked: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroceryInput {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

const COLUMNS: &str =
    "id, household_id, name, quantity, category, checked, created_by, created_at, updated_at";

fn from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<GroceryItem> {
    Ok(GroceryItem {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        name: row.try_get("name")?,
        quantity: row.try_get("quantity")?,
        category: row.try_get("category")?,
        checked: row.try_get::<i64, _>("checked")? != 0,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create(
    pool: &SqlitePool,
    household_id: i64,
    created_by: i64,
    input: &GroceryInput,
) -> AppResult<GroceryItem> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Item name must not be empty"));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO grocery_items (household_id, name, quantity, category, checked, created_by, \
         created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?, ?) RETURNING id",
    )
    .bind(household_id)
    .bind(name)
    .bind(&input.quantity)
    .bind(&input.category)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Grocery item"))
}

pub async fn get(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<Option<GroceryItem>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM grocery_items WHERE id = ? AND household_id = ?"
    ))
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<GroceryItem>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM grocery_items WHERE household_id = ? ORDER BY checked, category, name"
    ))
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn set_checked(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
    checked: bool,
) -> AppResult<GroceryItem> {
    let result = sqlx::query(
        "UPDATE grocery_items SET checked = ?, updated_at = ? WHERE id = ? AND household_id = ?",
    )
    .bind(checked as i64)
    .bind(now_ms())
    .bind(id)
    .bind(household_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Grocery item"));
    }
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Grocery item"))
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM grocery_items WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Grocery item"));
    }
    Ok(())
}

/// Remove everything already ticked off; returns the deleted ids so the
/// caller can broadcast them.
pub async fn clear_checked(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<i64>> {
    let rows = sqlx::query(
        "DELETE FROM grocery_items WHERE household_id = ? AND checked = 1 RETURNING id",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<i64, _>("id")?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
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

    fn item(name: &str) -> GroceryInput {
        GroceryInput {
            name: name.to_string(),
            quantity: None,
            category: None,
        }
    }

    #[tokio::test]
    async fn check_and_clear_round() {
        let (pool, hh, user) = fixture().await;
        let milk = create(&pool, hh, user, &item("milk")).await.unwrap();
        let eggs = create(&pool, hh, user, &item("eggs")).await.unwrap();
        set_checked(&pool, hh, milk.id, true).await.unwrap();

        let mut cleared = clear_checked(&pool, hh).await.unwrap();
        cleared.sort_unstable();
        assert_eq!(cleared, vec![milk.id]);

        let remaining = list(&pool, hh).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, eggs.id);
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let (pool, hh, user) = fixture().await;
        assert!(create(&pool, hh, user, &item("  ")).await.is_err());
    }
}
