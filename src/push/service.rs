//! Web Push delivery and the minute scheduler that drives reminders.
//!
//! Three notification kinds: calendar reminders (fired when an occurrence's
//! reminder instant falls inside the last tick window), chores coming due
//! within the hour, and ad-hoc grocery updates pushed by the mutation
//! handlers. The sent ledger makes every `(user, kind, subject)` fire once.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, info, warn};
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::push::vapid::{self, VapidKeys};
use crate::store::chores;
use crate::store::events;
use crate::store::household;
use crate::store::push as push_store;
use crate::time::{now_ms, to_date};

pub const TICK_INTERVAL_MS: u64 = 60_000;
/// Concurrent deliveries across all ticks and ad-hoc sends.
pub const PUSH_FANOUT_PERMITS: usize = 64;
/// Chores due within this horizon get a heads-up.
const CHORE_DUE_HORIZON_MS: i64 = 60 * 60 * 1000;

pub const KIND_CALENDAR_REMINDER: &str = "calendar_reminder";
pub const KIND_CHORE_DUE: &str = "chore_due";
pub const KIND_GROCERY_ADDED: &str = "grocery_added";

#[derive(Debug, Serialize)]
struct Payload<'a> {
    kind: &'a str,
    title: &'a str,
    body: String,
}

pub struct PushService {
    pool: Arc<RwLock<SqlitePool>>,
    config: Arc<Config>,
    client: HyperWebPushClient,
    fanout: Arc<Semaphore>,
}

impl PushService {
    pub fn new(pool: Arc<RwLock<SqlitePool>>, config: Arc<Config>) -> Self {
        PushService {
            pool,
            config,
            client: HyperWebPushClient::new(),
            fanout: Arc::new(Semaphore::new(PUSH_FANOUT_PERMITS)),
        }
    }

    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if let Err(err) = self.tick_pass().await {
                warn!(target: "gamwich", error = %err, "push_tick");
            }
        }
    }

    async fn tick_pass(&self) -> AppResult<()> {
        let pool = self.pool.read().await.clone();
        let now = now_ms();
        for household_id in household::all_household_ids(&pool).await? {
            if let Err(err) = self.household_pass(&pool, household_id, now).await {
                warn!(target: "gamwich", household_id, error = %err, "push_household_pass");
            }
        }
        push_store::prune_sent(&pool).await?;
        Ok(())
    }

    async fn household_pass(
        &self,
        pool: &SqlitePool,
        household_id: i64,
        now: i64,
    ) -> AppResult<()> {
        let subs = push_store::subscriptions_for_household(pool, household_id).await?;
        if subs.is_empty() {
            return Ok(());
        }
        let keys = vapid::load_or_create(pool, household_id, &self.config).await?;

        // Calendar reminders: the reminder instant fell within the last tick.
        for event in events::events_with_reminders(pool, household_id).await? {
            let offset = event.reminder_minutes.unwrap_or(0) * 60_000;
            let starts = occurrence_starts_in(&event, now - TICK_INTERVAL_MS as i64 + offset, now + offset);
            for start in starts {
                let subject = format!("{}:{}", event.id, start);
                let body = format!("Starts at {}", to_date(start).format("%H:%M UTC"));
                self.deliver(
                    pool,
                    &keys,
                    &subs,
                    None,
                    KIND_CALENDAR_REMINDER,
                    &subject,
                    &event.title,
                    body,
                    |prefs| prefs.calendar_reminders,
                )
                .await?;
            }
        }

        // Chores due within the hour.
        for chore in chores::due_in_window(pool, household_id, now, now + CHORE_DUE_HORIZON_MS).await? {
            let due = chore.due_at.unwrap_or(now);
            let subject = format!("{}:{}", chore.id, due);
            let body = format!("Due at {}", to_date(due).format("%H:%M UTC"));
            self.deliver(
                pool,
                &keys,
                &subs,
                chore.assigned_to,
                KIND_CHORE_DUE,
                &subject,
                &chore.title,
                body,
                |prefs| prefs.chore_reminders,
            )
            .await?;
        }
        Ok(())
    }

    /// Ad-hoc grocery notification fired from the mutation handler. The
    /// actor does not get told about their own addition, and the dedup
    /// subject is the item id so a retried send never fires twice.
    pub async fn notify_grocery_added(
        &self,
        household_id: i64,
        actor_user_id: i64,
        item_id: i64,
        item_name: &str,
    ) {
        let pool = self.pool.read().await.clone();
        let result: AppResult<()> = async {
            let subs: Vec<_> = push_store::subscriptions_for_household(&pool, household_id)
                .await?
                .into_iter()
                .filter(|sub| sub.user_id != actor_user_id)
                .collect();
            if subs.is_empty() {
                return Ok(());
            }
            let keys = vapid::load_or_create(&pool, household_id, &self.config).await?;
            let subject = item_id.to_string();
            self.deliver(
                &pool,
                &keys,
                &subs,
                None,
                KIND_GROCERY_ADDED,
                &subject,
                "Grocery list updated",
                format!("{item_name} was added to the list"),
                |prefs| prefs.grocery_updates,
            )
            .await
        }
        .await;
        if let Err(err) = result {
            warn!(target: "gamwich", household_id, error = %err, "push_grocery");
        }
    }

    /// Fan out to each eligible user's subscriptions under the delivery
    /// semaphore. The dedup ledger row is written only after a send
    /// succeeds, so a failed delivery stays eligible for the next tick.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        pool: &SqlitePool,
        keys: &VapidKeys,
        subs: &[push_store::PushSubscription],
        only_user: Option<i64>,
        kind: &str,
        subject: &str,
        title: &str,
        body: String,
        wants: impl Fn(&push_store::Preferences) -> bool,
    ) -> AppResult<()> {
        let payload = serde_json::to_vec(&Payload { kind, title, body })?;

        let mut eligible_users: Vec<i64> = Vec::new();
        let mut skipped_users: Vec<i64> = Vec::new();
        for sub in subs {
            if only_user.is_some_and(|user| user != sub.user_id) {
                continue;
            }
            if skipped_users.contains(&sub.user_id) {
                continue;
            }
            if !eligible_users.contains(&sub.user_id) {
                let prefs = push_store::preferences(pool, sub.user_id).await?;
                if !wants(&prefs)
                    || push_store::already_sent(pool, sub.user_id, kind, subject).await?
                {
                    skipped_users.push(sub.user_id);
                    continue;
                }
                eligible_users.push(sub.user_id);
            }

            let permit = self
                .fanout
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::new("PUSH/SEMAPHORE", e.to_string()))?;
            let client = self.client.clone();
            let keys = keys.clone();
            let endpoint = sub.endpoint.clone();
            let p256dh = sub.p256dh.clone();
            let auth = sub.auth.clone();
            let payload = payload.clone();
            let pool = pool.clone();
            let user_id = sub.user_id;
            let kind = kind.to_string();
            let subject = subject.to_string();
            tokio::spawn(async move {
                let _permit = permit;
                match send_one(&client, &keys, &endpoint, &p256dh, &auth, &payload).await {
                    Ok(()) => {
                        debug!(target: "gamwich", endpoint = %endpoint, "push_sent");
                        if let Err(err) =
                            push_store::claim_notification(&pool, user_id, &kind, &subject).await
                        {
                            warn!(target: "gamwich", error = %err, "push_ledger_write");
                        }
                    }
                    Err(SendError::Gone) => {
                        info!(target: "gamwich", endpoint = %endpoint, "push_subscription_gone");
                        if let Err(err) = push_store::delete_by_endpoint(&pool, &endpoint).await {
                            warn!(target: "gamwich", error = %err, "push_subscription_delete");
                        }
                    }
                    Err(SendError::Other(err)) => {
                        warn!(target: "gamwich", endpoint = %endpoint, error = %err, "push_send");
                    }
                }
            });
        }
        Ok(())
    }
}

enum SendError {
    /// 404/410 from the push service; the subscription is dead.
    Gone,
    Other(WebPushError),
}

async fn send_one(
    client: &HyperWebPushClient,
    keys: &VapidKeys,
    endpoint: &str,
    p256dh: &str,
    auth: &str,
    payload: &[u8],
) -> Result<(), SendError> {
    let info = SubscriptionInfo::new(endpoint, p256dh, auth);
    let signature = VapidSignatureBuilder::from_base64(&keys.private, web_push::URL_SAFE_NO_PAD, &info)
        .map_err(SendError::Other)?
        .build()
        .map_err(SendError::Other)?;

    let mut builder = WebPushMessageBuilder::new(&info);
    builder.set_payload(ContentEncoding::Aes128Gcm, payload);
    builder.set_vapid_signature(signature);
    let message = builder.build().map_err(SendError::Other)?;

    match client.send(message).await {
        Ok(()) => Ok(()),
        Err(WebPushError::EndpointNotValid) | Err(WebPushError::EndpointNotFound) => {
            Err(SendError::Gone)
        }
        Err(err) => Err(SendError::Other(err)),
    }
}

/// Starts (ms) of the event's occurrences inside `[from_ms, to_ms]`.
/// Single events contribute their own start; recurring ones expand.
pub fn occurrence_starts_in(event: &events::Event, from_ms: i64, to_ms: i64) -> Vec<i64> {
    match event.rrule.as_deref() {
        None => {
            if event.start_at >= from_ms && event.start_at <= to_ms {
                vec![event.start_at]
            } else {
                Vec::new()
            }
        }
        Some(raw) => match crate::recurrence::Rule::parse(raw) {
            Err(err) => {
                warn!(target: "gamwich", event_id = event.id, error = %err, "push_skip_bad_rule");
                Vec::new()
            }
            Ok(rule) => rule
                .expand(
                    to_date(event.start_at),
                    to_date(event.end_at),
                    to_date(from_ms),
                    to_date(to_ms + 1),
                )
                .map(|(start, _)| start.timestamp_millis())
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::Event;

    fn event(start_at: i64, rrule: Option<&str>) -> Event {
        Event {
            id: 1,
            household_id: 1,
            title: "Swim practice".to_string(),
            description: None,
            start_at,
            end_at: start_at + 3_600_000,
            all_day: false,
            rrule: rrule.map(str::to_string),
            reminder_minutes: Some(30),
            created_by: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    #[test]
    fn single_event_start_inside_window_only() {
        let e = event(10 * HOUR, None);
        assert_eq!(occurrence_starts_in(&e, 9 * HOUR, 11 * HOUR), vec![10 * HOUR]);
        assert!(occurrence_starts_in(&e, 11 * HOUR, 12 * HOUR).is_empty());
        // Window bounds are inclusive; a reminder instant landing exactly on
        // the tick still fires.
        assert_eq!(occurrence_starts_in(&e, 10 * HOUR, 10 * HOUR), vec![10 * HOUR]);
    }

    #[test]
    fn recurring_event_expands_into_window() {
        let e = event(9 * HOUR, Some("FREQ=DAILY"));
        let starts = occurrence_starts_in(&e, 2 * DAY, 4 * DAY);
        assert_eq!(starts, vec![2 * DAY + 9 * HOUR, 3 * DAY + 9 * HOUR]);
    }

    #[test]
    fn bad_stored_rule_yields_nothing() {
        let e = event(9 * HOUR, Some("FREQ=DAILY;BOGUS=1"));
        assert!(occurrence_starts_in(&e, 0, 10 * DAY).is_empty());
    }
}
