//! Six-digit email codes for login, registration, and invites.
//!
//! Only the newest unconsumed code per address is ever checked, each code
//! lives fifteen minutes, and five wrong guesses kill it. Register and
//! invite codes carry the household the verified session lands in. Whether
//! an address exists is never revealed to the caller of the request
//! endpoint.

use rand::Rng;
use sqlx::{Row, SqlitePool};

use crate::error::AppResult;
use crate::store::household::{user_by_email, User};
use crate::time::now_ms;

pub const CODE_TTL_MS: i64 = 15 * 60 * 1000;
pub const MAX_ATTEMPTS: i64 = 5;

pub const PURPOSE_LOGIN: &str = "login";
pub const PURPOSE_REGISTER: &str = "register";
pub const PURPOSE_INVITE: &str = "invite";

fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Persist a fresh code. Register and invite codes carry the household the
/// session created on verification will point at.
pub async fn issue(
    pool: &SqlitePool,
    email: &str,
    purpose: &str,
    household_id: Option<i64>,
) -> AppResult<String> {
    let email = email.trim().to_ascii_lowercase();
    let code = generate_code();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO auth_codes (email, code, purpose, household_id, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&email)
    .bind(&code)
    .bind(purpose)
    .bind(household_id)
    .bind(now)
    .bind(now + CODE_TTL_MS)
    .execute(pool)
    .await?;
    Ok(code)
}

/// Issue a login code for a known address. `Ok(None)` means the address has
/// no account; the route responds identically either way.
pub async fn request(pool: &SqlitePool, email: &str) -> AppResult<Option<(User, String)>> {
    let Some(user) = user_by_email(pool, email).await? else {
        return Ok(None);
    };
    let code = issue(pool, email, PURPOSE_LOGIN, None).await?;
    Ok(Some((user, code)))
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified {
        email: String,
        purpose: String,
        household_id: Option<i64>,
    },
    /// No live code for the address: never issued, already consumed, or
    /// past its TTL.
    Expired,
    /// The attempt budget was spent; the code is dead even if the right
    /// value arrives now.
    TooManyAttempts,
    IncorrectCode,
}

/// Check a submitted code against the newest live one for the address.
/// Wrong guesses bump the attempt counter; the guess after the budget is
/// spent consumes the code for good.
pub async fn verify(pool: &SqlitePool, email: &str, submitted: &str) -> AppResult<VerifyOutcome> {
    let email = email.trim().to_ascii_lowercase();
    let now = now_ms();

    let row = sqlx::query(
        "SELECT id, code, purpose, household_id, attempts FROM auth_codes \
         WHERE email = ? AND consumed_at IS NULL AND expires_at > ? \
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(&email)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(VerifyOutcome::Expired);
    };
    let id: i64 = row.try_get("id")?;
    let stored: String = row.try_get("code")?;
    let purpose: String = row.try_get("purpose")?;
    let household_id: Option<i64> = row.try_get("household_id")?;
    let attempts: i64 = row.try_get("attempts")?;

    if attempts >= MAX_ATTEMPTS {
        consume(pool, id, now).await?;
        return Ok(VerifyOutcome::TooManyAttempts);
    }
    if stored != submitted.trim() {
        // RETURNING keeps the bump atomic against concurrent guesses.
        sqlx::query_scalar::<_, i64>(
            "UPDATE auth_codes SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        return Ok(VerifyOutcome::IncorrectCode);
    }

    if !consume(pool, id, now).await? {
        // A concurrent submission of the same code won the consume.
        return Ok(VerifyOutcome::Expired);
    }
    Ok(VerifyOutcome::Verified {
        email,
        purpose,
        household_id,
    })
}

async fn consume(pool: &SqlitePool, id: i64, now: i64) -> AppResult<bool> {
    let result =
        sqlx::query("UPDATE auth_codes SET consumed_at = ? WHERE id = ? AND consumed_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn gc_expired(pool: &SqlitePool) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM auth_codes WHERE expires_at <= ?")
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
