//! Cookie sessions with a 90-day sliding expiry.

use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::auth::AuthContext;
use crate::error::{AppError, AppResult};
use crate::time::now_ms;

pub const SESSION_COOKIE: &str = "gamwich_session";
pub const SESSION_TTL_MS: i64 = 90 * 24 * 60 * 60 * 1000;

/// The expiry is only rewritten once it has aged past this, so a busy kiosk
/// does not update the row on every request.
const RENEW_AFTER_MS: i64 = 24 * 60 * 60 * 1000;

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub async fn create(pool: &SqlitePool, user_id: i64, household_id: i64) -> AppResult<String> {
    let token = generate_token();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO sessions (token, user_id, household_id, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(household_id)
    .bind(now)
    .bind(now + SESSION_TTL_MS)
    .execute(pool)
    .await?;
    Ok(token)
}

/// Resolve a token into an identity, sliding the expiry forward.
pub async fn authenticate(pool: &SqlitePool, token: &str) -> AppResult<Option<AuthContext>> {
    if token.is_empty() {
        return Ok(None);
    }
    let now = now_ms();
    let row = sqlx::query(
        "SELECT s.user_id, s.household_id, s.expires_at, m.role FROM sessions s \
         JOIN memberships m ON m.user_id = s.user_id AND m.household_id = s.household_id \
         WHERE s.token = ? AND s.expires_at > ?",
    )
    .bind(token)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let expires_at: i64 = row.try_get("expires_at")?;
    if expires_at - now < SESSION_TTL_MS - RENEW_AFTER_MS {
        sqlx::query("UPDATE sessions SET expires_at = ? WHERE token = ?")
            .bind(now + SESSION_TTL_MS)
            .bind(token)
            .execute(pool)
            .await?;
    }
    Ok(Some(AuthContext {
        user_id: row.try_get("user_id")?,
        household_id: row.try_get("household_id")?,
        role: row.try_get("role")?,
    }))
}

pub async fn logout(pool: &SqlitePool, token: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Repoint the session at another household the user belongs to.
pub async fn switch_household(
    pool: &SqlitePool,
    token: &str,
    household_id: i64,
) -> AppResult<()> {
    let member: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM memberships m JOIN sessions s ON s.user_id = m.user_id \
         WHERE s.token = ? AND m.household_id = ?",
    )
    .bind(token)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    if member.is_none() {
        return Err(AppError::unauthorized());
    }
    sqlx::query("UPDATE sessions SET household_id = ? WHERE token = ?")
        .bind(household_id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn gc_expired(pool: &SqlitePool) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now_ms())
        .execute(pool)
        .await?;
    let removed = result.rows_affected();
    if removed > 0 {
        debug!(target: "gamwich", removed, "session_gc");
    }
    Ok(removed)
}

/// Session cookie sent on login; `Secure` follows the external URL scheme.
pub fn build_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::days(90))
        .build()
}

pub fn removal_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::ZERO)
        .build()
}
