//! Push subscriptions, per-user preferences, and the dedup ledger.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

/// Delivered notifications older than this fall out of the dedup ledger.
pub const SENT_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct PushSubscription {
    pub id: i64,
    pub user_id: i64,
    pub household_id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInput {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub calendar_reminders: bool,
    pub chore_reminders: bool,
    pub grocery_updates: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            calendar_reminders: true,
            chore_reminders: true,
            grocery_updates: true,
        }
    }
}

fn subscription_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<PushSubscription> {
    Ok(PushSubscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        household_id: row.try_get("household_id")?,
        endpoint: row.try_get("endpoint")?,
        p256dh: row.try_get("p256dh")?,
        auth: row.try_get("auth")?,
    })
}

/// Register a browser's subscription. Re-registering an endpoint moves it to
/// the new user, which is what happens on a shared kiosk after switching.
pub async fn upsert_subscription(
    pool: &SqlitePool,
    user_id: i64,
    household_id: i64,
    input: &SubscriptionInput,
) -> AppResult<PushSubscription> {
    if input.endpoint.trim().is_empty() {
        return Err(AppError::validation("Endpoint must not be empty"));
    }
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO push_subscriptions (user_id, household_id, endpoint, p256dh, auth, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (endpoint) DO UPDATE SET \
           user_id = excluded.user_id, household_id = excluded.household_id, \
           p256dh = excluded.p256dh, auth = excluded.auth \
         RETURNING id",
    )
    .bind(user_id)
    .bind(household_id)
    .bind(input.endpoint.trim())
    .bind(&input.p256dh)
    .bind(&input.auth)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(PushSubscription {
        id,
        user_id,
        household_id,
        endpoint: input.endpoint.trim().to_string(),
        p256dh: input.p256dh.clone(),
        auth: input.auth.clone(),
    })
}

pub async fn delete_by_endpoint(pool: &SqlitePool, endpoint: &str) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
        .bind(endpoint)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn subscriptions_for_household(
    pool: &SqlitePool,
    household_id: i64,
) -> AppResult<Vec<PushSubscription>> {
    let rows = sqlx::query(
        "SELECT id, user_id, household_id, endpoint, p256dh, auth FROM push_subscriptions \
         WHERE household_id = ?",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(subscription_from_row).collect()
}

pub async fn preferences(pool: &SqlitePool, user_id: i64) -> AppResult<Preferences> {
    let row = sqlx::query(
        "SELECT calendar_reminders, chore_reminders, grocery_updates FROM push_preferences \
         WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    match row {
        None => Ok(Preferences::default()),
        Some(row) => Ok(Preferences {
            calendar_reminders: row.try_get::<i64, _>("calendar_reminders")? != 0,
            chore_reminders: row.try_get::<i64, _>("chore_reminders")? != 0,
            grocery_updates: row.try_get::<i64, _>("grocery_updates")? != 0,
        }),
    }
}

pub async fn set_preferences(
    pool: &SqlitePool,
    user_id: i64,
    prefs: &Preferences,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO push_preferences (user_id, calendar_reminders, chore_reminders, grocery_updates) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id) DO UPDATE SET \
           calendar_reminders = excluded.calendar_reminders, \
           chore_reminders = excluded.chore_reminders, \
           grocery_updates = excluded.grocery_updates",
    )
    .bind(user_id)
    .bind(prefs.calendar_reminders as i64)
    .bind(prefs.chore_reminders as i64)
    .bind(prefs.grocery_updates as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether the `(user, kind, subject)` slot is already in the ledger.
/// Checked before delivery; the row itself is written only on success.
pub async fn already_sent(
    pool: &SqlitePool,
    user_id: i64,
    kind: &str,
    subject: &str,
) -> AppResult<bool> {
    let sent: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM sent_notifications \
         WHERE user_id = ? AND kind = ? AND subject = ?)",
    )
    .bind(user_id)
    .bind(kind)
    .bind(subject)
    .fetch_one(pool)
    .await?;
    Ok(sent)
}

/// Record the `(user, kind, subject)` slot after a successful send. Returns
/// false when a concurrent delivery for the same user got there first.
pub async fn claim_notification(
    pool: &SqlitePool,
    user_id: i64,
    kind: &str,
    subject: &str,
) -> AppResult<bool> {
    let result = sqlx::query(
        "INSERT INTO sent_notifications (user_id, kind, subject, sent_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id, kind, subject) DO NOTHING",
    )
    .bind(user_id)
    .bind(kind)
    .bind(subject)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn prune_sent(pool: &SqlitePool) -> AppResult<u64> {
    let cutoff = now_ms() - SENT_RETENTION_MS;
    let result = sqlx::query("DELETE FROM sent_notifications WHERE sent_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
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

    #[tokio::test]
    async fn endpoint_upsert_moves_subscription() {
        let (pool, hh, user) = fixture().await;
        let input = SubscriptionInput {
            endpoint: "https://push.example/ep1".to_string(),
            p256dh: "key".to_string(),
            auth: "auth".to_string(),
        };
        upsert_subscription(&pool, user, hh, &input).await.unwrap();
        upsert_subscription(&pool, user, hh, &input).await.unwrap();
        assert_eq!(
            subscriptions_for_household(&pool, hh).await.unwrap().len(),
            1
        );
        assert!(delete_by_endpoint(&pool, "https://push.example/ep1")
            .await
            .unwrap());
        assert!(!delete_by_endpoint(&pool, "https://push.example/ep1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn claim_is_once_per_subject() {
        let (pool, _, user) = fixture().await;
        assert!(!already_sent(&pool, user, "calendar_reminder", "42:1000")
            .await
            .unwrap());
        assert!(claim_notification(&pool, user, "calendar_reminder", "42:1000")
            .await
            .unwrap());
        assert!(already_sent(&pool, user, "calendar_reminder", "42:1000")
            .await
            .unwrap());
        assert!(!claim_notification(&pool, user, "calendar_reminder", "42:1000")
            .await
            .unwrap());
        // Different subject or kind claims independently.
        assert!(claim_notification(&pool, user, "calendar_reminder", "42:2000")
            .await
            .unwrap());
        assert!(claim_notification(&pool, user, "chore_due", "42:1000")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn prune_drops_old_entries() {
        let (pool, _, user) = fixture().await;
        claim_notification(&pool, user, "chore_due", "old").await.unwrap();
        sqlx::query("UPDATE sent_notifications SET sent_at = ?")
            .bind(now_ms() - SENT_RETENTION_MS - 1)
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(prune_sent(&pool).await.unwrap(), 1);
        // The slot can be claimed again afterwards.
        assert!(claim_notification(&pool, user, "chore_due", "old")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn default_preferences_are_all_on() {
        let (pool, _, user) = fixture().await;
        let prefs = preferences(&pool, user).await.unwrap();
        assert!(prefs.calendar_reminders && prefs.chore_reminders && prefs.grocery_updates);

        set_preferences(
            &pool,
            user,
            &Preferences {
                calendar_reminders: false,
                chore_reminders: true,
                grocery_updates: false,
            },
        )
        .await
        .unwrap();
        let prefs = preferences(&pool, user).await.unwrap();
        assert!(!prefs.calendar_reminders);
        assert!(prefs.chore_reminders);
        assert!(!prefs.grocery_updates);
    }
}
