//! Outbound email via a JSON HTTP API.
//!
//! Email is best-effort: a missing configuration or a failed send is logged
//! and swallowed, because the login flow must not reveal delivery problems
//! to the caller.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

pub struct Mailer {
    client: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    from: String,
}

impl Mailer {
    pub fn new(config: &Config) -> Self {
        Mailer {
            client: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_url: config.email_api_url.clone(),
            api_key: config.email_api_key.clone(),
            from: config.email_from.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_url.is_some() && self.api_key.is_some()
    }

    pub async fn send(&self, to: &str, subject: &str, text: &str) {
        let (Some(url), Some(key)) = (self.api_url.as_deref(), self.api_key.as_deref()) else {
            // Development fallback: the code only appears in the server log.
            info!(target: "gamwich", to = %to, subject = %subject, body = %text, "mail_unconfigured");
            return;
        };
        let result = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(&OutboundEmail {
                from: &self.from,
                to,
                subject,
                text,
            })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(target: "gamwich", to = %to, "mail_sent");
            }
            Ok(response) => {
                warn!(target: "gamwich", to = %to, status = %response.status(), "mail_rejected");
            }
            Err(err) => {
                warn!(target: "gamwich", to = %to, error = %err, "mail_send");
            }
        }
    }

    pub async fn send_login_code(&self, to: &str, code: &str) {
        let text = format!(
            "Your Gamwich login code is {code}. It expires in 15 minutes.\n\n\
             If you did not request this, you can ignore this email."
        );
        self.send(to, "Your Gamwich login code", &text).await;
    }
}
