use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gamwich_lib::config::Config;
use gamwich_lib::push::PushService;
use gamwich_lib::store::push::{self, Preferences, SubscriptionInput};
use gamwich_lib::time::now_ms;
use tokio::sync::RwLock;

#[path = "util.rs"]
mod util;

fn sub(endpoint: &str) -> SubscriptionInput {
    SubscriptionInput {
        endpoint: endpoint.to_string(),
        p256dh: "BKey".to_string(),
        auth: "auth".to_string(),
    }
}

#[tokio::test]
async fn a_notification_is_claimed_exactly_once_per_user() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, frodo) = util::seed_household(&pool).await?;
    let sam = util::add_member(&pool, hh.id, "sam@shire.example", "Sam").await?;

    let subject = "42:1750000000000";
    assert!(push::claim_notification(&pool, frodo.id, "calendar_reminder", subject).await?);
    // A later scheduler tick sees the same occurrence and backs off.
    assert!(push::already_sent(&pool, frodo.id, "calendar_reminder", subject).await?);
    assert!(!push::claim_notification(&pool, frodo.id, "calendar_reminder", subject).await?);

    // Another user, another kind, another subject: all independent slots.
    assert!(push::claim_notification(&pool, sam.id, "calendar_reminder", subject).await?);
    assert!(push::claim_notification(&pool, frodo.id, "chore_due", subject).await?);
    assert!(
        push::claim_notification(&pool, frodo.id, "calendar_reminder", "42:1750000060000").await?
    );
    Ok(())
}

#[tokio::test]
async fn failed_delivery_leaves_the_dedup_slot_open() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, frodo) = util::seed_household(&pool).await?;
    let sam = util::add_member(&pool, hh.id, "sam@shire.example", "Sam").await?;
    // Nothing listens on port 9, so every delivery attempt fails.
    push::upsert_subscription(&pool, sam.id, hh.id, &sub("http://127.0.0.1:9/dead")).await?;

    let service = PushService::new(
        Arc::new(RwLock::new(pool.clone())),
        Arc::new(Config::from_env()),
    );
    service.notify_grocery_added(hh.id, frodo.id, 7, "Milk").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // No ledger row, so the notification stays eligible for a retry.
    let sent: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sent_notifications")
        .fetch_one(&pool)
        .await?;
    assert_eq!(sent, 0);
    assert!(!push::already_sent(&pool, sam.id, "grocery_added", "7").await?);
    // A connection failure is not 404/410; the subscription survives.
    assert_eq!(
        push::subscriptions_for_household(&pool, hh.id).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn pruning_frees_old_slots_for_reclaiming() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (_, frodo) = util::seed_household(&pool).await?;

    assert!(push::claim_notification(&pool, frodo.id, "grocery_added", "7").await?);
    assert_eq!(push::prune_sent(&pool).await?, 0); // nothing old enough

    sqlx::query("UPDATE sent_notifications SET sent_at = ?")
        .bind(now_ms() - push::SENT_RETENTION_MS - 1)
        .execute(&pool)
        .await?;
    assert_eq!(push::prune_sent(&pool).await?, 1);
    assert!(push::claim_notification(&pool, frodo.id, "grocery_added", "7").await?);
    Ok(())
}

#[tokio::test]
async fn re_registering_an_endpoint_moves_it_to_the_new_user() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, frodo) = util::seed_household(&pool).await?;
    let sam = util::add_member(&pool, hh.id, "sam@shire.example", "Sam").await?;

    push::upsert_subscription(&pool, frodo.id, hh.id, &sub("https://push.example/kiosk")).await?;
    // Sam logs in on the same kiosk browser.
    push::upsert_subscription(&pool, sam.id, hh.id, &sub("https://push.example/kiosk")).await?;

    let subs = push::subscriptions_for_household(&pool, hh.id).await?;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].user_id, sam.id);

    assert!(push::delete_by_endpoint(&pool, "https://push.example/kiosk").await?);
    assert!(!push::delete_by_endpoint(&pool, "https://push.example/kiosk").await?);
    Ok(())
}

#[tokio::test]
async fn preferences_default_to_all_enabled() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (_, frodo) = util::seed_household(&pool).await?;

    let prefs = push::preferences(&pool, frodo.id).await?;
    assert!(prefs.calendar_reminders && prefs.chore_reminders && prefs.grocery_updates);

    push::set_preferences(
        &pool,
        frodo.id,
        &Preferences {
            calendar_reminders: true,
            chore_reminders: false,
            grocery_updates: false,
        },
    )
    .await?;
    let prefs = push::preferences(&pool, frodo.id).await?;
    assert!(prefs.calendar_reminders);
    assert!(!prefs.chore_reminders);
    assert!(!prefs.grocery_updates);
    Ok(())
}
