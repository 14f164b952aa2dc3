use std::env;
use std::path::PathBuf;

/// Runtime configuration, sourced from the environment. Settings persisted to
/// the database override these at runtime (see `store::settings`).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub base_url: String,
    pub s3: S3Env,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub email_api_url: Option<String>,
    pub email_api_key: Option<String>,
    pub email_from: String,
}

/// S3 credentials from the environment; any blank field leaves backups
/// disabled until an admin configures storage in settings.
#[derive(Debug, Clone, Default)]
pub struct S3Env {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8080);
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("gamwich.sqlite3"));
        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        Config {
            port,
            db_path,
            base_url,
            s3: S3Env {
                endpoint: env::var("GAMWICH_S3_ENDPOINT").unwrap_or_default(),
                region: env::var("GAMWICH_S3_REGION").unwrap_or_default(),
                bucket: env::var("GAMWICH_S3_BUCKET").unwrap_or_default(),
                access_key: env::var("GAMWICH_S3_ACCESS_KEY").unwrap_or_default(),
                secret_key: env::var("GAMWICH_S3_SECRET_KEY").unwrap_or_default(),
            },
            vapid_public_key: env::var("VAPID_PUBLIC_KEY").ok().filter(|v| !v.is_empty()),
            vapid_private_key: env::var("VAPID_PRIVATE_KEY").ok().filter(|v| !v.is_empty()),
            email_api_url: env::var("EMAIL_API_URL").ok().filter(|v| !v.is_empty()),
            email_api_key: env::var("EMAIL_API_KEY").ok().filter(|v| !v.is_empty()),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "gamwich@localhost".to_string()),
        }
    }

    pub fn base_url_is_https(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}
