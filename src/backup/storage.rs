//! S3-compatible object storage client.

use std::time::Duration;

use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use sqlx::SqlitePool;
use tokio::time::timeout;

use crate::error::{AppError, AppResult};
use crate::store::settings::{self, keys};

/// Every storage call is bounded; a hung endpoint must not wedge the
/// backup pipeline.
const OP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl StorageConfig {
    pub fn from_env(env: &crate::config::S3Env) -> Self {
        StorageConfig {
            endpoint: env.endpoint.clone(),
            region: env.region.clone(),
            bucket: env.bucket.clone(),
            access_key: env.access_key.clone(),
            secret_key: env.secret_key.clone(),
        }
    }

    /// Environment values are the baseline; non-empty settings override
    /// them field by field.
    pub async fn resolve(
        pool: &SqlitePool,
        household_id: i64,
        env: &crate::config::S3Env,
    ) -> AppResult<Self> {
        let mut config = StorageConfig::from_env(env);
        for (key, slot) in [
            (keys::S3_ENDPOINT, &mut config.endpoint),
            (keys::S3_REGION, &mut config.region),
            (keys::S3_BUCKET, &mut config.bucket),
            (keys::S3_ACCESS_KEY, &mut config.access_key),
            (keys::S3_SECRET_KEY, &mut config.secret_key),
        ] {
            if let Some(value) = settings::get(pool, household_id, key).await? {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
        Ok(config)
    }

    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.bucket.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.is_empty()
    }
}

pub struct ObjectStorage {
    bucket: Box<Bucket>,
}

impl ObjectStorage {
    /// Path-style addressing, since self-hosted MinIO and friends rarely
    /// resolve virtual-host buckets.
    pub fn new(config: &StorageConfig) -> AppResult<Self> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| AppError::new("STORAGE/CREDENTIALS", e.to_string()))?;
        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| AppError::new("STORAGE/CONFIG", e.to_string()))?
            .with_path_style();
        Ok(ObjectStorage { bucket })
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> AppResult<()> {
        let response = timeout(OP_TIMEOUT, self.bucket.put_object(key, data))
            .await
            .map_err(|_| AppError::new("STORAGE/TIMEOUT", "Object upload timed out"))?
            .map_err(|e| AppError::new("STORAGE/PUT", e.to_string()))?;
        if !(200..300).contains(&response.status_code()) {
            return Err(AppError::new(
                "STORAGE/PUT",
                format!("upload returned HTTP {}", response.status_code()),
            )
            .with_context("key", key.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        let response = timeout(OP_TIMEOUT, self.bucket.get_object(key))
            .await
            .map_err(|_| AppError::new("STORAGE/TIMEOUT", "Object download timed out"))?
            .map_err(|e| AppError::new("STORAGE/GET", e.to_string()))?;
        if response.status_code() == 404 {
            return Err(AppError::not_found("Backup object"));
        }
        if !(200..300).contains(&response.status_code()) {
            return Err(AppError::new(
                "STORAGE/GET",
                format!("download returned HTTP {}", response.status_code()),
            )
            .with_context("key", key.to_string()));
        }
        Ok(response.bytes().to_vec())
    }

    pub async fn delete(&self, key: &str) -> AppResult<()> {
        timeout(OP_TIMEOUT, self.bucket.delete_object(key))
            .await
            .map_err(|_| AppError::new("STORAGE/TIMEOUT", "Object delete timed out"))?
            .map_err(|e| AppError::new("STORAGE/DELETE", e.to_string()))?;
        Ok(())
    }
}
