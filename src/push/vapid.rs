//! VAPID key management.
//!
//! A persisted pair always wins: browser subscriptions are bound to the
//! public key, so once a pair exists in settings it keeps being served.
//! Environment keys seed a fresh install; with neither, a P-256 pair is
//! generated once and persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::store::settings::{self, keys};
use crate::time::now_ms;

#[derive(Debug, Clone)]
pub struct VapidKeys {
    /// Uncompressed P-256 point, base64url without padding. Handed to the
    /// browser's `applicationServerKey`.
    pub public: String,
    /// Raw scalar, base64url without padding.
    pub private: String,
}

pub fn generate() -> VapidKeys {
    let secret = SecretKey::random(&mut rand::rngs::OsRng);
    let public_point = secret.public_key().to_encoded_point(false);
    VapidKeys {
        public: URL_SAFE_NO_PAD.encode(public_point.as_bytes()),
        private: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
    }
}

pub async fn load_or_create(
    pool: &SqlitePool,
    household_id: i64,
    config: &Config,
) -> AppResult<VapidKeys> {
    let stored_public = settings::get(pool, household_id, keys::VAPID_PUBLIC).await?;
    let stored_private = settings::get(pool, household_id, keys::VAPID_PRIVATE).await?;
    if let (Some(public), Some(private)) = (stored_public, stored_private) {
        return Ok(VapidKeys { public, private });
    }

    if let (Some(public), Some(private)) = (
        config.vapid_public_key.clone(),
        config.vapid_private_key.clone(),
    ) {
        let now = now_ms();
        for (key, value) in [
            (keys::VAPID_PUBLIC, public.as_str()),
            (keys::VAPID_PRIVATE, private.as_str()),
        ] {
            sqlx::query(
                "INSERT INTO settings (household_id, key, value, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT (household_id, key) DO UPDATE SET value = excluded.value, \
                 updated_at = excluded.updated_at",
            )
            .bind(household_id)
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(pool)
            .await?;
        }
        return Ok(VapidKeys { public, private });
    }

    let generated = generate();
    let now = now_ms();
    for (key, value) in [
        (keys::VAPID_PUBLIC, generated.public.as_str()),
        (keys::VAPID_PRIVATE, generated.private.as_str()),
    ] {
        sqlx::query(
            "INSERT INTO settings (household_id, key, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (household_id, key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
        )
        .bind(household_id)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(pool)
        .await?;
    }
    info!(target: "gamwich", household_id, "vapid_keys_generated");
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use crate::store::household::create_household_with_admin;
    use sqlx::sqlite::SqlitePoolOptions;

    fn config(public: Option<&str>, private: Option<&str>) -> Config {
        Config {
            port: 0,
            db_path: std::path::PathBuf::from(":memory:"),
            base_url: "http://localhost".to_string(),
            s3: Default::default(),
            vapid_public_key: public.map(str::to_string),
            vapid_private_key: private.map(str::to_string),
            email_api_url: None,
            email_api_key: None,
            email_from: "gamwich@localhost".to_string(),
        }
    }

    async fn fixture() -> (SqlitePool, i64) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        let (hh, _) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        (pool, hh.id)
    }

    #[tokio::test]
    async fn generated_pair_is_persisted_and_stable() {
        let (pool, hh) = fixture().await;
        let first = load_or_create(&pool, hh, &config(None, None)).await.unwrap();
        let second = load_or_create(&pool, hh, &config(None, None)).await.unwrap();
        assert_eq!(first.private, second.private);
        assert_eq!(first.public, second.public);
    }

    #[tokio::test]
    async fn persisted_pair_wins_over_environment_keys() {
        let (pool, hh) = fixture().await;
        let stored = load_or_create(&pool, hh, &config(None, None)).await.unwrap();
        // Subscriptions are bound to the stored public key, so a later env
        // pair must not displace it.
        let loaded = load_or_create(&pool, hh, &config(Some("env-pub"), Some("env-priv")))
            .await
            .unwrap();
        assert_eq!(loaded.public, stored.public);
        assert_eq!(loaded.private, stored.private);
    }

    #[tokio::test]
    async fn environment_keys_seed_a_fresh_install() {
        let (pool, hh) = fixture().await;
        let loaded = load_or_create(&pool, hh, &config(Some("env-pub"), Some("env-priv")))
            .await
            .unwrap();
        assert_eq!(loaded.public, "env-pub");
        // Once seeded they are persisted and keep winning.
        let again = load_or_create(&pool, hh, &config(None, None)).await.unwrap();
        assert_eq!(again.public, "env-pub");
    }

    #[test]
    fn generated_keys_have_expected_shape() {
        let keys = generate();
        let public = URL_SAFE_NO_PAD.decode(&keys.public).unwrap();
        let private = URL_SAFE_NO_PAD.decode(&keys.private).unwrap();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04); // uncompressed point marker
        assert_eq!(private.len(), 32);
        // Two calls generate distinct keys.
        assert_ne!(generate().private, keys.private);
    }
}
