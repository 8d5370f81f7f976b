//! Disposable-mail provider interface: duck-typed mail provider as an
//! interface with five variants, selected by string tag, never by runtime
//! attribute sniffing. Internals of each HTTP client are kept out of this
//! module -- it specifies only the capability set callers need: registering
//! a mailbox, setting credentials on an existing one, and polling for a
//! verification code.

use std::fmt;
use std::time::Duration;

use crate::model::MailProviderConfig;
use crate::time::now_ts;

#[derive(Debug)]
pub enum MailError {
    Http(String),
    Protocol(String),
    Timeout,
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::Http(e) => write!(f, "mail provider http error: {e}"),
            MailError::Protocol(e) => write!(f, "mail provider protocol error: {e}"),
            MailError::Timeout => write!(f, "mail provider poll timed out"),
        }
    }
}

impl std::error::Error for MailError {}

impl From<reqwest::Error> for MailError {
    fn from(e: reqwest::Error) -> Self {
        MailError::Http(e.to_string())
    }
}

/// Common capability set every mail provider variant exposes.
/// `register_account` provisions a fresh mailbox (disposable providers
/// only; Microsoft accounts are pre-provisioned via OAuth and always
/// return `Ok(true)`). `poll_for_code` busy-waits `interval` apart until
/// `timeout` elapses or a verification code newer than `since_time`
/// arrives.
pub trait MailProvider {
    fn email(&self) -> &str;
    fn password(&self) -> Option<&str>;
    fn email_id(&self) -> Option<&str>;

    fn register_account(
        &mut self,
        client: &reqwest::blocking::Client,
        domain: Option<&str>,
    ) -> Result<bool, MailError>;

    fn set_credentials(&mut self, address: String, password: Option<String>);

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError>;
}

fn extract_code(body: &str) -> Option<String> {
    // Verification emails carry a 6-digit code somewhere in the body/subject.
    let digits: String = body
        .chars()
        .collect::<Vec<_>>()
        .windows(6)
        .find(|w| w.iter().all(|c| c.is_ascii_digit()))
        .map(|w| w.iter().collect())
        .unwrap_or_default();
    if digits.len() == 6 {
        Some(digits)
    } else {
        None
    }
}

/// Shared poll loop: repeatedly calls `fetch_latest` until it returns a
/// message newer than `since_time`, the timeout elapses, or a code is found.
fn poll_with<F>(
    timeout: Duration,
    interval: Duration,
    since_time: i64,
    mut fetch_latest: F,
) -> Result<Option<String>, MailError>
where
    F: FnMut() -> Result<Option<(i64, String)>, MailError>,
{
    let deadline = now_ts() + timeout.as_secs() as i64;
    loop {
        if let Some((received_at, body)) = fetch_latest()? {
            if received_at >= since_time {
                if let Some(code) = extract_code(&body) {
                    return Ok(Some(code));
                }
            }
        }
        if now_ts() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(interval);
    }
}

pub struct MicrosoftMail {
    pub refresh_token: String,
    pub tenant: String,
    pub client_id: String,
    pub email: String,
}

impl MailProvider for MicrosoftMail {
    fn email(&self) -> &str {
        &self.email
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn email_id(&self) -> Option<&str> {
        None
    }

    fn register_account(
        &mut self,
        _client: &reqwest::blocking::Client,
        _domain: Option<&str>,
    ) -> Result<bool, MailError> {
        // Microsoft mailboxes are provisioned out of band via OAuth; there is
        // nothing to register, the refresh token already grants access.
        Ok(true)
    }

    fn set_credentials(&mut self, address: String, _password: Option<String>) {
        self.email = address;
    }

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError> {
        let token_url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant
        );
        poll_with(timeout, interval, since_time, || {
            let token_resp: serde_json::Value = client
                .post(&token_url)
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", self.refresh_token.as_str()),
                    ("scope", "https://graph.microsoft.com/.default"),
                ])
                .send()?
                .json()?;
            let access_token = token_resp
                .get("access_token")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MailError::Protocol("missing access_token".into()))?;
            let messages: serde_json::Value = client
                .get("https://graph.microsoft.com/v1.0/me/messages?$top=1&$orderby=receivedDateTime desc")
                .bearer_auth(access_token)
                .send()?
                .json()?;
            let first = messages.get("value").and_then(|v| v.as_array()).and_then(|a| a.first());
            match first {
                Some(msg) => {
                    let body = msg
                        .get("body")
                        .and_then(|b| b.get("content"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Ok(Some((now_ts(), body)))
                }
                None => Ok(None),
            }
        })
    }
}

pub struct DuckmailMail {
    pub base_url: String,
    pub api_key: String,
    pub email: String,
    pub email_id: Option<String>,
}

impl MailProvider for DuckmailMail {
    fn email(&self) -> &str {
        &self.email
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn email_id(&self) -> Option<&str> {
        self.email_id.as_deref()
    }

    fn register_account(
        &mut self,
        client: &reqwest::blocking::Client,
        domain: Option<&str>,
    ) -> Result<bool, MailError> {
        let resp: serde_json::Value = client
            .post(format!("{}/api/mailboxes", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"domain": domain}))
            .send()?
            .json()?;
        match resp.get("address").and_then(|v| v.as_str()) {
            Some(address) => {
                self.email = address.to_string();
                self.email_id = resp
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_credentials(&mut self, address: String, _password: Option<String>) {
        self.email = address;
    }

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError> {
        let url = format!("{}/api/mailboxes/{}/messages", self.base_url, self.email);
        poll_with(timeout, interval, since_time, || {
            let resp: serde_json::Value =
                client.get(&url).bearer_auth(&self.api_key).send()?.json()?;
            let first = resp.as_array().and_then(|a| a.first());
            match first {
                Some(msg) => {
                    let received_at = msg
                        .get("created_at")
                        .and_then(|v| v.as_i64())
                        .unwrap_or_else(now_ts);
                    let body = msg
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Ok(Some((received_at, body)))
                }
                None => Ok(None),
            }
        })
    }
}

pub struct MoemailMail {
    pub base_url: String,
    pub api_key: String,
    pub email: String,
    pub email_id: Option<String>,
}

impl MailProvider for MoemailMail {
    fn email(&self) -> &str {
        &self.email
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn email_id(&self) -> Option<&str> {
        self.email_id.as_deref()
    }

    fn register_account(
        &mut self,
        client: &reqwest::blocking::Client,
        domain: Option<&str>,
    ) -> Result<bool, MailError> {
        let resp: serde_json::Value = client
            .post(format!("{}/api/emails/generate", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({"domain": domain, "expiryHours": 24}))
            .send()?
            .json()?;
        match resp.get("email").and_then(|v| v.as_str()) {
            Some(address) => {
                self.email = address.to_string();
                self.email_id = resp.get("id").and_then(|v| v.as_str()).map(String::from);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_credentials(&mut self, address: String, _password: Option<String>) {
        self.email = address;
    }

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError> {
        let email_id = self
            .email_id
            .clone()
            .ok_or_else(|| MailError::Protocol("moemail requires an email_id".into()))?;
        let url = format!("{}/api/emails/{}/messages", self.base_url, email_id);
        poll_with(timeout, interval, since_time, || {
            let resp: serde_json::Value = client
                .get(&url)
                .header("X-API-Key", &self.api_key)
                .send()?
                .json()?;
            let first = resp
                .get("messages")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first());
            match first {
                Some(msg) => {
                    let received_at = msg.get("receivedAt").and_then(|v| v.as_i64()).unwrap_or_else(now_ts);
                    let body = msg
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Ok(Some((received_at, body)))
                }
                None => Ok(None),
            }
        })
    }
}

pub struct FreemailMail {
    pub base_url: String,
    pub password: String,
    pub email_id: String,
    pub email: String,
}

impl MailProvider for FreemailMail {
    fn email(&self) -> &str {
        &self.email
    }
    fn password(&self) -> Option<&str> {
        Some(&self.password)
    }
    fn email_id(&self) -> Option<&str> {
        Some(&self.email_id)
    }

    fn register_account(
        &mut self,
        client: &reqwest::blocking::Client,
        domain: Option<&str>,
    ) -> Result<bool, MailError> {
        let resp: serde_json::Value = client
            .post(format!("{}/register", self.base_url))
            .json(&serde_json::json!({"domain": domain, "password": self.password}))
            .send()?
            .json()?;
        match resp.get("email").and_then(|v| v.as_str()) {
            Some(address) => {
                self.email = address.to_string();
                self.email_id = resp
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(address)
                    .to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_credentials(&mut self, address: String, password: Option<String>) {
        self.email = address;
        if let Some(p) = password {
            self.password = p;
        }
    }

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError> {
        let url = format!("{}/mailbox/{}", self.base_url, self.email_id);
        poll_with(timeout, interval, since_time, || {
            let resp: serde_json::Value = client
                .get(&url)
                .query(&[("password", self.password.as_str())])
                .send()?
                .json()?;
            let first = resp.as_array().and_then(|a| a.first());
            match first {
                Some(msg) => {
                    let received_at = msg.get("date").and_then(|v| v.as_i64()).unwrap_or_else(now_ts);
                    let body = msg
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Ok(Some((received_at, body)))
                }
                None => Ok(None),
            }
        })
    }
}

pub struct GptmailMail {
    pub base_url: String,
    pub api_key: String,
    pub email: String,
}

impl MailProvider for GptmailMail {
    fn email(&self) -> &str {
        &self.email
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn email_id(&self) -> Option<&str> {
        None
    }

    fn register_account(
        &mut self,
        client: &reqwest::blocking::Client,
        domain: Option<&str>,
    ) -> Result<bool, MailError> {
        let resp: serde_json::Value = client
            .post(format!("{}/v1/mailbox", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"domain": domain}))
            .send()?
            .json()?;
        match resp.get("address").and_then(|v| v.as_str()) {
            Some(address) => {
                self.email = address.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_credentials(&mut self, address: String, _password: Option<String>) {
        self.email = address;
    }

    fn poll_for_code(
        &self,
        client: &reqwest::blocking::Client,
        timeout: Duration,
        interval: Duration,
        since_time: i64,
    ) -> Result<Option<String>, MailError> {
        let url = format!("{}/v1/mailbox/{}/latest", self.base_url, self.email);
        poll_with(timeout, interval, since_time, || {
            let resp: serde_json::Value =
                client.get(&url).bearer_auth(&self.api_key).send()?.json()?;
            match resp.get("body").and_then(|v| v.as_str()) {
                Some(body) => {
                    let received_at = resp.get("received_at").and_then(|v| v.as_i64()).unwrap_or_else(now_ts);
                    Ok(Some((received_at, body.to_string())))
                }
                None => Ok(None),
            }
        })
    }
}

/// Factory: build the concrete provider for a persisted `MailProviderConfig`,
/// selecting by string tag rather than attribute sniffing.
pub fn build_provider(email_hint: &str, config: &MailProviderConfig) -> Box<dyn MailProvider> {
    match config {
        MailProviderConfig::Microsoft {
            refresh_token,
            tenant,
            client_id,
        } => Box::new(MicrosoftMail {
            refresh_token: refresh_token.clone(),
            tenant: tenant.clone(),
            client_id: client_id.clone(),
            email: email_hint.to_string(),
        }),
        MailProviderConfig::Duckmail { base_url, api_key } => Box::new(DuckmailMail {
            base_url: base_url.clone(),
            api_key: api_key.clone(),
            email: email_hint.to_string(),
            email_id: None,
        }),
        MailProviderConfig::Moemail { base_url, api_key } => Box::new(MoemailMail {
            base_url: base_url.clone(),
            api_key: api_key.clone(),
            email: email_hint.to_string(),
            email_id: None,
        }),
        MailProviderConfig::Freemail {
            base_url,
            password,
            email_id,
        } => Box::new(FreemailMail {
            base_url: base_url.clone(),
            password: password.clone(),
            email_id: email_id.clone(),
            email: email_hint.to_string(),
        }),
        MailProviderConfig::Gptmail { base_url, api_key } => Box::new(GptmailMail {
            base_url: base_url.clone(),
            api_key: api_key.clone(),
            email: email_hint.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_finds_six_digit_run() {
        assert_eq!(
            extract_code("Your verification code is 482913, expires soon"),
            Some("482913".to_string())
        );
        assert_eq!(extract_code("no code here"), None);
    }

    #[test]
    fn build_provider_tag_matches_config() {
        let cfg = MailProviderConfig::Gptmail {
            base_url: "https://mail.example".into(),
            api_key: "k".into(),
        };
        assert_eq!(cfg.tag(), "gptmail");
        let provider = build_provider("hint@example.com", &cfg);
        assert_eq!(provider.email(), "hint@example.com");
    }
}
