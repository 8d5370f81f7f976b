//! Request orchestrator: binds an inbound request to an
//! account + upstream session, runs the retry/failover loop with account
//! exclusion, and classifies outcomes back into account cooldown state.

use std::collections::HashSet;
use std::sync::Arc;

use acctrelay_core::model::QuotaClass;
use acctrelay_core::time::now_ts;

use crate::account::AccountPool;
use crate::api_keys::KeyMode;
use crate::chat_id::{derive_chat_id, ChatIdInputs};
use crate::error::GatewayError;
use crate::http_clients::TrafficClient;
use crate::jwt_minter::JwtMinter;
use crate::media::{GeneratedFile, MediaHandler};
use crate::models::is_known_model;
use crate::normalizer::{build_full_context_text, parse_last_message, strip_to_last_user_message};
use crate::session_cache::SessionBindingCache;
use crate::settings::{MediaOutputMode, RetrySettings};
use crate::stream_engine::{
    collect_files, create_session, fetch_session_file_metadata, run_stream_assist, upload_file, AttemptEvent,
};

/// Per-event sink a streaming caller hands to `Orchestrator::handle_live`.
/// Every `AttemptEvent` the current attempt produces is forwarded the
/// moment it is parsed, rather than only once the whole attempt succeeds.
pub type LiveSender = tokio::sync::mpsc::UnboundedSender<AttemptEvent>;

/// A per-`chat_id` mutex guards the select-account + create-session +
/// write-binding critical section. Its scope is small enough that two
/// different conversations never serialize on each other. A fixed shard
/// count avoids the cleanup cost of a per-key `HashMap<String, Mutex<()>>`
/// -- a stale shard lock just sits idle, it is never leaked per-chat_id.
const LOCK_SHARD_COUNT: usize = 256;

pub struct ChatLockTable {
    shards: Vec<tokio::sync::Mutex<()>>,
}

impl Default for ChatLockTable {
    fn default() -> Self {
        ChatLockTable {
            shards: (0..LOCK_SHARD_COUNT).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }
}

impl ChatLockTable {
    fn shard_for(&self, chat_id: &str) -> &tokio::sync::Mutex<()> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        chat_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Runs `f` holding the shard lock for `chat_id` across its whole
    /// `await`ed critical section -- account selection, session creation,
    /// and the binding write all happen before the lock is released, so a
    /// second request for the same `chat_id` that arrives mid-creation
    /// blocks on this same lock instead of racing a fresh round-robin pick
    /// against the in-flight one.
    pub async fn with_lock<R, F, Fut>(&self, chat_id: &str, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let _guard = self.shard_for(chat_id).lock().await;
        f().await
    }
}

/// Owns its data rather than borrowing from the request handler: a live
/// streaming call runs on a spawned task, which needs a `'static` request.
pub struct OrchestratorRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub api_key_mode: KeyMode,
    pub api_key_binding_key: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub enum OrchestratorOutcome {
    /// A synthetic admin-command reply; upstream was never touched.
    SyntheticReply(String),
    Generated {
        content: String,
        media_fragments: Vec<String>,
    },
}

pub struct Orchestrator {
    pub pool: Arc<AccountPool>,
    pub locks: Arc<ChatLockTable>,
    pub bindings: Arc<SessionBindingCache>,
    pub http: Arc<crate::http_clients::HttpClients>,
    pub jwt_minter: Arc<JwtMinter>,
    pub media: Arc<MediaHandler>,
    pub retry: RetrySettings,
    pub image_mode: MediaOutputMode,
    pub video_mode: MediaOutputMode,
    pub upstream_base: String,
    pub media_base_url: String,
}

const RESET_SESSION_COMMAND: &str = "重置";
const SWAP_ACCOUNT_COMMAND: &str = "换号";

/// Mirrors the ground-truth fingerprint algorithm's `messages[0]` access:
/// the literal first message in the array, regardless of its role, with
/// its actual `role` field (falling back to `""`) -- not a hardcoded
/// `"user"` search, since a leading `system` message changes the hash.
fn first_message_text_and_role(messages: &[serde_json::Value]) -> (String, String) {
    let Some(first) = messages.first() else {
        return (String::new(), String::new());
    };
    let role = first.get("role").and_then(|r| r.as_str()).unwrap_or("").to_string();
    let content = first.get("content").cloned().unwrap_or(serde_json::Value::Null);
    (role, crate::normalizer::content_text(&content))
}

impl Orchestrator {
    /// The full request state machine, buffering every generated event
    /// and handing back one complete `OrchestratorOutcome`.
    pub async fn handle(&self, request_id: &str, req: OrchestratorRequest) -> Result<OrchestratorOutcome, GatewayError> {
        self.handle_inner(request_id, req, None).await
    }

    /// Like `handle`, but forwards every `AttemptEvent` over `live` the
    /// moment `stream_engine` parses it off the upstream byte stream,
    /// instead of only handing results back once the whole attempt is
    /// done. The route handler turns each event into an SSE frame as it
    /// arrives.
    pub async fn handle_live(
        &self,
        request_id: &str,
        req: OrchestratorRequest,
        live: LiveSender,
    ) -> Result<OrchestratorOutcome, GatewayError> {
        self.handle_inner(request_id, req, Some(live)).await
    }

    /// Streaming callers and non-streaming callers share this; the only
    /// difference is whether `live` is given and how the caller renders
    /// `OrchestratorOutcome::Generated`.
    async fn handle_inner(
        &self,
        request_id: &str,
        req: OrchestratorRequest,
        live: Option<LiveSender>,
    ) -> Result<OrchestratorOutcome, GatewayError> {
        // Step 1: validate model.
        if !is_known_model(&req.model) {
            return Err(GatewayError::ModelUnknown(req.model.clone()));
        }
        let quota_class = QuotaClass::from_model_id(&req.model);

        // Step 2: chat_id.
        let (first_role, first_text) = first_message_text_and_role(&req.messages);
        let chat_id = derive_chat_id(&ChatIdInputs {
            api_key: Some(&req.api_key_binding_key),
            headers: &req.headers,
            body: &req.body,
            client_ip: &req.client_ip,
            first_user_role: &first_role,
            first_user_text: &first_text,
        });

        // Step 3: admin in-band commands, memory mode only.
        if req.api_key_mode == KeyMode::Memory {
            let (_, last_text) = last_user_text(&req.messages);
            if last_text.trim() == RESET_SESSION_COMMAND {
                self.bindings.reset_session(&chat_id);
                return Ok(OrchestratorOutcome::SyntheticReply(
                    "Session has been reset.".to_string(),
                ));
            }
            if last_text.trim() == SWAP_ACCOUNT_COMMAND {
                self.bindings.remove(&chat_id);
                return Ok(OrchestratorOutcome::SyntheticReply(
                    "Account binding has been cleared.".to_string(),
                ));
            }
        }

        let (query_text, inline_images) = parse_last_message(&req.messages, &self.http.chat).await;

        // Step 4: under the per-chat_id lock, resolve (account, session).
        // The lock is held across account selection *and* session creation
        // so a second request for this chat_id either reuses the finished
        // binding or blocks behind this one instead of racing a fresh
        // round-robin pick against an in-flight creation.
        let (account_id, session_path, mut is_first) = self
            .locks
            .with_lock(&chat_id, || self.resolve_binding(&chat_id, quota_class, request_id))
            .await?;

        let mut excluded: HashSet<String> = HashSet::new();
        let mut current_account = self.pool.get(Some(&account_id), quota_class)?;
        let mut current_session = session_path;
        let mut last_err = None;

        for attempt in 0..=self.retry.max_request_retries {
            if attempt > 0 {
                excluded.insert(current_account.account_id());
                current_account = match self.pool.get_excluding(&excluded, quota_class) {
                    Ok(account) => account,
                    Err(err) => {
                        last_err = Some(err);
                        break;
                    }
                };
                let jwt = self
                    .jwt_minter
                    .get(self.http_for_auth(), &current_account, request_id)
                    .await?;
                current_session = create_session(&self.http.chat, &self.upstream_base, &jwt).await?;
                is_first = true;
                self.bindings.set(&chat_id, &current_account.account_id(), Some(current_session.clone()));
            }

            let body_messages = strip_to_last_user_message(&req.messages, is_first);
            let text_for_attempt = if is_first {
                query_text.clone()
            } else {
                build_full_context_text(&body_messages)
            };

            match self
                .run_one_attempt(
                    request_id,
                    &current_account,
                    &current_session,
                    &text_for_attempt,
                    &inline_images,
                    &req.model,
                    quota_class,
                    &req.headers,
                    live.as_ref(),
                )
                .await
            {
                Ok(outcome) => {
                    current_account.record_success();
                    self.bindings.set(&chat_id, &current_account.account_id(), Some(current_session.clone()));
                    return Ok(outcome);
                }
                Err(err) => {
                    self.classify_and_record(&current_account, &err, request_id, quota_class);
                    last_err = Some(err.clone());
                    if !err.retryable() {
                        return Err(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::NoAccountAvailable))
    }

    fn http_for_auth(&self) -> Arc<TrafficClient> {
        // `HttpClients` owns the three clients directly (no internal Arc);
        // wrap a fresh client mirroring the auth policy so `JwtMinter::get`
        // (which takes an owned `Arc<TrafficClient>`) can be called from a
        // method that only borrows `self.http`.
        Arc::new(TrafficClient::new(self.http.auth.policy.clone()))
    }

    /// Step 4 body, called while holding the chat_id shard lock for its
    /// entire duration: reuse an existing (account, session) binding if one
    /// exists, otherwise pick an account, mint a session for it, and write
    /// the binding -- all before the lock is released. A second caller for
    /// the same `chat_id` that reaches this method while the first is still
    /// inside it blocks on the shard lock rather than observing a
    /// half-written binding, so it can never round-robin onto a different
    /// account for a session the first caller is already creating.
    async fn resolve_binding(
        &self,
        chat_id: &str,
        quota_class: QuotaClass,
        request_id: &str,
    ) -> Result<(String, String, bool), GatewayError> {
        // An existing binding with no session yet means a prior `重置`
        // (reset-session) command cleared the session but intentionally
        // preserved the account -- mint a fresh session for that same
        // account rather than round-robinning onto a different one.
        let account = if let Some(binding) = self.bindings.get(chat_id) {
            match self.pool.get_by_id(&binding.account_id) {
                Some(account) => {
                    if let Some(session_id) = binding.session_id {
                        return Ok((binding.account_id, session_id, false));
                    }
                    account
                }
                None => {
                    self.bindings.remove(chat_id);
                    self.pool.get(None, quota_class)?
                }
            }
        } else {
            self.pool.get(None, quota_class)?
        };

        let account_id = account.account_id();
        let jwt = self.jwt_minter.get(self.http_for_auth(), &account, request_id).await?;
        let session = create_session(&self.http.chat, &self.upstream_base, &jwt).await?;
        self.bindings.set(chat_id, &account_id, Some(session.clone()));
        Ok((account_id, session, true))
    }

    async fn run_one_attempt(
        &self,
        request_id: &str,
        account: &Arc<crate::account::AccountState>,
        session_path: &str,
        query_text: &str,
        inline_images: &[crate::normalizer::InlineImage],
        model: &str,
        quota_class: QuotaClass,
        headers: &[(String, String)],
        live: Option<&LiveSender>,
    ) -> Result<OrchestratorOutcome, GatewayError> {
        let jwt = self.jwt_minter.get(self.http_for_auth(), account, request_id).await?;

        let session_path = if session_path.is_empty() {
            create_session(&self.http.chat, &self.upstream_base, &jwt).await?
        } else {
            session_path.to_string()
        };

        let mut file_ids = Vec::new();
        for image in inline_images {
            if let Ok(file_id) = upload_file(&self.http.chat, &self.upstream_base, &jwt, &session_path, image).await {
                file_ids.push(file_id);
            }
        }

        let mut forward = live.map(|tx| {
            move |event: &AttemptEvent| {
                let _ = tx.send(event.clone());
            }
        });
        let on_event: Option<&mut dyn FnMut(&AttemptEvent)> = match forward.as_mut() {
            Some(f) => Some(f),
            None => None,
        };

        let attempt = run_stream_assist(
            &self.http.chat,
            &self.upstream_base,
            &jwt,
            &session_path,
            query_text,
            &file_ids,
            model,
            quota_class,
            on_event,
        )
        .await?;

        let content: String = attempt
            .events
            .iter()
            .filter_map(|e| match e {
                AttemptEvent::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();

        let files = collect_files(&attempt.events);
        let mut media_fragments = Vec::new();
        if !files.is_empty() {
            let file_ids: Vec<String> = files.iter().map(|(id, _)| id.clone()).collect();
            let metadata = fetch_session_file_metadata(&self.http.chat, &self.upstream_base, &jwt, &session_path, &file_ids)
                .await
                .unwrap_or_default();

            for (file_id, fallback_mime) in &files {
                let (mime_type, file_session_path) = metadata
                    .get(file_id)
                    .cloned()
                    .unwrap_or_else(|| (fallback_mime.clone(), session_path.clone()));
                let generated = GeneratedFile {
                    file_id: file_id.clone(),
                    mime_type: mime_type.clone(),
                    session_path: file_session_path,
                };
                let mode = if mime_type.starts_with("video/") {
                    self.video_mode
                } else {
                    self.image_mode
                };
                match self.media.download(&self.http.chat.plain_client(), &generated.session_path, &generated.file_id, &jwt).await {
                    Ok(bytes) => {
                        let base_url = self.media_base_url_for(headers);
                        if let Ok(fragment) = self.media.render_fragment(&generated, mode, &bytes, &base_url) {
                            if let Some(tx) = live {
                                let _ = tx.send(AttemptEvent::Content(format!("\n\n{fragment}")));
                            }
                            media_fragments.push(fragment);
                        }
                    }
                    Err(err) => {
                        let fragment = format!("\n\n*[media download failed: {err}]*\n");
                        if let Some(tx) = live {
                            let _ = tx.send(AttemptEvent::Content(fragment.clone()));
                        }
                        media_fragments.push(fragment);
                    }
                }
            }
        }

        Ok(OrchestratorOutcome::Generated { content, media_fragments })
    }

    /// A self-hosted media URL is derived from the inbound request's
    /// forwarded headers unless the admin has pinned one in settings, in
    /// which case that override always wins.
    fn media_base_url_for(&self, headers: &[(String, String)]) -> String {
        if !self.media_base_url.is_empty() {
            return self.media_base_url.clone();
        }
        let header = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        crate::media::derive_base_url(
            header("x-forwarded-proto"),
            header("x-forwarded-host"),
            header("host").unwrap_or("localhost"),
        )
    }

    fn classify_and_record(&self, account: &Arc<crate::account::AccountState>, err: &GatewayError, request_id: &str, quota_class: QuotaClass) {
        match err {
            GatewayError::AccountRateLimited { resource_exhausted } => {
                account.handle_http_error(429, *resource_exhausted, quota_class, self.retry.rate_limit_cooldown_seconds, self.retry.account_failure_threshold);
            }
            GatewayError::UpstreamServerError(status) => {
                account.handle_http_error(*status, false, quota_class, self.retry.rate_limit_cooldown_seconds, self.retry.account_failure_threshold);
            }
            GatewayError::AccountAuthExpired => {
                account.handle_http_error(401, false, quota_class, self.retry.rate_limit_cooldown_seconds, self.retry.account_failure_threshold);
            }
            _ => {
                account.handle_non_http_error(&err.to_string(), request_id, self.retry.account_failure_threshold);
            }
        }
    }
}

fn last_user_text(messages: &[serde_json::Value]) -> (&'static str, String) {
    let last_user = messages.iter().rev().find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"));
    let content = last_user.and_then(|m| m.get("content")).cloned().unwrap_or(serde_json::Value::Null);
    ("user", crate::normalizer::content_text(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_table_serializes_same_chat_id() {
        let table = ChatLockTable::default();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c1 = counter.clone();
        table
            .with_lock("chat-a", || async move {
                c1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_table_maps_different_ids_to_shards_deterministically() {
        let table = ChatLockTable::default();
        let first = table.shard_for("chat-a") as *const tokio::sync::Mutex<()>;
        let second = table.shard_for("chat-a") as *const tokio::sync::Mutex<()>;
        assert_eq!(first, second);
    }
}
