use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct Household {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub user_id: i64,
    pub email: String,
    pub name: String,
    pub role: String,
}

fn household_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Household> {
    Ok(Household {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn get_household(pool: &SqlitePool, id: i64) -> AppResult<Option<Household>> {
    let row = sqlx::query("SELECT id, name, created_at FROM households WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(household_from_row).transpose()
}

pub async fn user_by_email(pool: &SqlitePool, email: &str) -> AppResult<Option<User>> {
    let row = sqlx::query("SELECT id, email, name, created_at FROM users WHERE email = ?")
        .bind(email.trim())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn user_by_id(pool: &SqlitePool, id: i64) -> AppResult<Option<User>> {
    let row = sqlx::query("SELECT id, email, name, created_at FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Bootstrap: create a household together with its first admin user.
pub async fn create_household_with_admin(
    pool: &SqlitePool,
    household_name: &str,
    email: &str,
    user_name: &str,
) -> AppResult<(Household, User)> {
    let name = household_name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Household name must not be empty"));
    }
    let email = normalize_email(email)?;
    let now = now_ms();

    let mut tx = pool.begin().await?;
    let household_id: i64 =
        sqlx::query_scalar("INSERT INTO households (name, created_at) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
    let user_id: i64 = sqlx::query_scalar(
        "INSERT INTO users (email, name, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&email)
    .bind(user_name.trim())
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO memberships (user_id, household_id, role, created_at) VALUES (?, ?, 'admin', ?)",
    )
    .bind(user_id)
    .bind(household_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok((
        Household {
            id: household_id,
            name: name.to_string(),
            created_at: now,
        },
        User {
            id: user_id,
            email,
            name: user_name.trim().to_string(),
            created_at: now,
        },
    ))
}

/// Admin invites a family member. An existing user just gains a membership.
pub async fn invite_member(
    pool: &SqlitePool,
    household_id: i64,
    email: &str,
    user_name: &str,
    role: &str,
) -> AppResult<User> {
    if role != "admin" && role != "member" {
        return Err(AppError::validation("Role must be admin or member"));
    }
    let email = normalize_email(email)?;
    let now = now_ms();

    let mut tx = pool.begin().await?;
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await?;
    let user_id = match existing {
        Some(id) => id,
        None => {
            sqlx::query_scalar(
                "INSERT INTO users (email, name, created_at) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(&email)
            .bind(user_name.trim())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
        }
    };
    sqlx::query(
        "INSERT INTO memberships (user_id, household_id, role, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(household_id)
    .bind(role)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let user = user_by_id(pool, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(user)
}

/// Get or create the user row for an address. Invite acceptance lands here
/// when the invited account was never provisioned.
pub async fn get_or_create_user(pool: &SqlitePool, email: &str, name: &str) -> AppResult<User> {
    let email = normalize_email(email)?;
    if let Some(user) = user_by_email(pool, &email).await? {
        return Ok(user);
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO users (email, name, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&email)
    .bind(name.trim())
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(User {
        id,
        email,
        name: name.trim().to_string(),
        created_at: now,
    })
}

/// Membership insert that tolerates an existing row, so accepting the same
/// invite link twice is a no-op.
pub async fn ensure_membership(
    pool: &SqlitePool,
    user_id: i64,
    household_id: i64,
    role: &str,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO memberships (user_id, household_id, role, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id, household_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(household_id)
    .bind(role)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Role of `user_id` inside `household_id`, or `None` when not a member.
pub async fn membership_role(
    pool: &SqlitePool,
    user_id: i64,
    household_id: i64,
) -> AppResult<Option<String>> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT role FROM memberships WHERE user_id = ? AND household_id = ?",
    )
    .bind(user_id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    Ok(role)
}

pub async fn households_for_user(pool: &SqlitePool, user_id: i64) -> AppResult<Vec<Household>> {
    let rows = sqlx::query(
        "SELECT h.id, h.name, h.created_at FROM households h \
         JOIN memberships m ON m.household_id = h.id \
         WHERE m.user_id = ? ORDER BY h.id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(household_from_row).collect()
}

pub async fn list_members(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<Member>> {
    let rows = sqlx::query(
        "SELECT u.id AS user_id, u.email, u.name, m.role FROM users u \
         JOIN memberships m ON m.user_id = u.id \
         WHERE m.household_id = ? ORDER BY u.name",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(Member {
                user_id: row.try_get("user_id")?,
                email: row.try_get("email")?,
                name: row.try_get("name")?,
                role: row.try_get("role")?,
            })
        })
        .collect()
}

pub async fn all_household_ids(pool: &SqlitePool) -> AppResult<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM households ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

fn normalize_email(email: &str) -> AppResult<String> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::validation("A valid email address is required"));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn bootstrap_creates_admin_membership() {
        let pool = pool().await;
        let (hh, user) = create_household_with_admin(&pool, "Bag End", "Frodo@Shire.example", "Frodo")
            .await
            .unwrap();
        assert_eq!(user.email, "frodo@shire.example");
        let role = membership_role(&pool, user.id, hh.id).await.unwrap();
        assert_eq!(role.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn invite_rejects_duplicate_membership() {
        let pool = pool().await;
        let (hh, _) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        invite_member(&pool, hh.id, "b@x.example", "B", "member")
            .await
            .unwrap();
        let err = invite_member(&pool, hh.id, "b@x.example", "B", "member")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT/UNIQUE");
    }

    #[tokio::test]
    async fn ensure_membership_is_idempotent() {
        let pool = pool().await;
        let (hh, _) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        let sam = get_or_create_user(&pool, "Sam@Shire.example", "Sam")
            .await
            .unwrap();
        assert_eq!(sam.email, "sam@shire.example");
        // A second lookup returns the same row instead of inserting.
        let again = get_or_create_user(&pool, "sam@shire.example", "Samwise")
            .await
            .unwrap();
        assert_eq!(again.id, sam.id);
        assert_eq!(again.name, "Sam");

        ensure_membership(&pool, sam.id, hh.id, "member").await.unwrap();
        ensure_membership(&pool, sam.id, hh.id, "member").await.unwrap();
        let role = membership_role(&pool, sam.id, hh.id).await.unwrap();
        assert_eq!(role.as_deref(), Some("member"));
    }

    #[tokio::test]
    async fn membership_is_scoped() {
        let pool = pool().await;
        let (hh_a, user_a) = create_household_with_admin(&pool, "A", "a@x.example", "A")
            .await
            .unwrap();
        let (hh_b, _) = create_household_with_admin(&pool, "B", "b@x.example", "B")
            .await
            .unwrap();
        assert!(membership_role(&pool, user_a.id, hh_b.id)
            .await
            .unwrap()
            .is_none());
        assert!(membership_role(&pool, user_a.id, hh_a.id)
            .await
            .unwrap()
            .is_some());
    }
}
