//! Auth Conductor (spec §4.G): owns the in-memory `Auth` map, drives
//! candidate selection through the `Selector`, dispatches to the registered
//! `ProviderExecutor`, marks results back onto the `Auth`, and runs the
//! background auto-refresh loop.
//!
//! Grounded on the teacher's `CredentialPool::execute`/`execute_for_id`
//! (`gproxy-provider-core/src/credential_pool.rs`): candidate-filter-then-try
//! loop, mark-on-failure-then-continue, a `StateSink` hook fired on every
//! mutation. Adapted from a generic weighted credential pool to the spec's
//! `Auth`/`Selector`/`ProviderExecutor` seams, and from single-shot weighted
//! pick to the spec's filter-then-round-robin `Selector`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use gproxy_provider_core::{
    Attributes, Auth, AttemptFailure, Event, EventHub, EventSink, ExecutorRegistry, Metadata,
    Options, OperationalEvent, ProviderExecutor, Request, Response, ResultEvent, SelectOptions,
    Selector, SelectorError, StreamChunk, UnavailableReason, UpstreamHttpRequest,
    UpstreamPassthroughError, REQUESTED_MODEL_KEY,
};
use gproxy_storage::{AuthStore, AuthStoreError};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

/// §4.G.2: candidates already tried this call are excluded from the next
/// pick, bounded so a flapping provider can't loop forever.
const DEFAULT_MAX_ATTEMPTS: usize = 4;
/// §4.G.5: the auto-refresh loop ticks at most this often.
const REFRESH_TICK: Duration = Duration::from_secs(5);
/// §4.G.5: claiming an auth for refresh pushes its deadline out by this much
/// so a second tick can't double-claim it while the refresh is in flight.
const REFRESH_CLAIM_LEAD: Duration = Duration::from_secs(60);
/// §4.G.5: a failed refresh attempt is retried after this backoff.
const REFRESH_FAILURE_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// §4.G.7 safety factor applied to a model's context window before truncation
/// kicks in.
const TRUNCATE_SAFETY_FACTOR: f32 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("auth {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] AuthStoreError),
    #[error(transparent)]
    Upstream(#[from] UpstreamPassthroughError),
}

/// Input DTO for `AuthConductor::register` (spec §4.G.1 `Register`). An empty
/// `id` is assigned a fresh one.
#[derive(Debug, Default, Clone)]
pub struct RegisterRequest {
    pub id: Option<String>,
    pub provider: String,
    pub prefix: Option<String>,
    pub label: Option<String>,
    pub attributes: Attributes,
    pub metadata: Metadata,
    pub proxy_url: Option<String>,
}

/// Adapts the spec's Hook interface (`OnAuthRegistered`/`OnAuthUpdated`/
/// `OnResult`, each no-op by default per §6) onto the event hub's single
/// `EventSink::write` seam, the way the teacher's `StateSink` trait
/// (`credential_pool.rs`) sits behind `CredentialPool::apply_mark`.
pub trait ConductorHooks: Send + Sync {
    fn on_auth_registered(&self, _auth_id: &str, _provider: &str) {}
    fn on_auth_updated(&self, _auth_id: &str, _provider: &str) {}
    fn on_result(&self, _event: &ResultEvent) {}
}

pub struct ConductorEventSink {
    hooks: Arc<dyn ConductorHooks>,
}

impl ConductorEventSink {
    pub fn new(hooks: Arc<dyn ConductorHooks>) -> Self {
        Self { hooks }
    }
}

impl EventSink for ConductorEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::Operational(OperationalEvent::AuthRegistered { auth_id, provider }) => {
                    self.hooks.on_auth_registered(auth_id, provider)
                }
                Event::Operational(OperationalEvent::AuthUpdated { auth_id, provider }) => {
                    self.hooks.on_auth_updated(auth_id, provider)
                }
                Event::Operational(OperationalEvent::Result(result)) => {
                    self.hooks.on_result(result)
                }
                Event::Upstream(_) => {}
            }
        })
    }
}

/// Splits a trailing `(...)` "thinking" suffix (e.g. `gpt-4(high)` →
/// `("gpt-4", "(high)")`) off a model name, per §4.G.2's alias-preservation
/// rule. Returns an empty suffix when there isn't one.
fn split_thinking_suffix(model: &str) -> (&str, &str) {
    if model.ends_with(')') {
        if let Some(idx) = model.rfind('(') {
            return (&model[..idx], &model[idx..]);
        }
    }
    (model, "")
}

fn selector_error_passthrough(err: &SelectorError) -> UpstreamPassthroughError {
    let status = err.status_code();
    let message = match err {
        SelectorError::NoCandidates => "no auth available for this provider".to_string(),
        SelectorError::ModelCooldown { retry_after_secs } => {
            format!("model cooling down for {retry_after_secs}s")
        }
        SelectorError::AuthUnavailable {
            cooldown,
            disabled,
            other,
            ..
        } => format!("auth unavailable (cooldown={cooldown}, disabled={disabled}, other={other})"),
    };
    let code = match status {
        404 => "auth_not_found",
        429 => "model_cooldown",
        _ => "auth_unavailable",
    };
    let mut passthrough = UpstreamPassthroughError::new(status, message).with_code(code);
    if let Some(secs) = err.retry_after_secs() {
        passthrough = passthrough.with_retry_after(Duration::from_secs(secs));
    }
    passthrough
}

/// Owns the auth map and drives every provider executor call on top of it
/// (spec §4.G). Streaming dispatch and the auto-refresh loop spawn detached
/// tasks, so callers that use either must hold this behind an `Arc`.
pub struct AuthConductor {
    auths: RwLock<HashMap<String, Auth>>,
    registry: ExecutorRegistry,
    store: Arc<dyn AuthStore>,
    hub: EventHub,
    selector: Selector,
    quota_cooldown_disabled: AtomicBool,
    max_attempts: usize,
    /// §4.G.2's first alias layer / §9 "global table keyed by channel":
    /// `channel (Auth.Provider) → alias-lowercase → upstream model`.
    /// Independent of, and applied before, the per-auth-id API-key table
    /// carried in `Auth.metadata["model_aliases"]`.
    oauth_channel_aliases: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl AuthConductor {
    pub fn new(registry: ExecutorRegistry, store: Arc<dyn AuthStore>, hub: EventHub) -> Self {
        Self {
            auths: RwLock::new(HashMap::new()),
            registry,
            store,
            hub,
            selector: Selector::new(),
            quota_cooldown_disabled: AtomicBool::new(false),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            oauth_channel_aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Replaces the global OAuth-channel alias table for one channel (spec
    /// §4.G.2's first alias layer). `aliases` maps lowercased requested-model
    /// name to upstream model name.
    pub async fn set_oauth_channel_aliases(&self, channel: &str, aliases: HashMap<String, String>) {
        self.oauth_channel_aliases
            .write()
            .await
            .insert(channel.to_string(), aliases);
    }

    /// §5: global toggle for the 408/500/502/503/504 cooldown row; a
    /// per-auth override can still be carried in `Auth.attributes` by the
    /// caller and checked before invoking this.
    pub fn set_quota_cooldown_disabled(&self, disabled: bool) {
        self.quota_cooldown_disabled.store(disabled, Ordering::Relaxed);
    }

    fn quota_cooldown_disabled(&self, auth: &Auth) -> bool {
        if let Some(value) = auth.attributes.get("quota_cooldown_disabled") {
            return value == "true";
        }
        self.quota_cooldown_disabled.load(Ordering::Relaxed)
    }

    // ---- §4.G.1 lifecycle -------------------------------------------------

    /// `Load`: replaces the in-memory map with whatever the store has on
    /// disk. Returns the number of auths loaded.
    pub async fn load(&self) -> Result<usize, ConductorError> {
        let loaded = self.store.list().await?;
        let mut auths = self.auths.write().await;
        let count = loaded.len();
        for mut auth in loaded {
            auth.ensure_index();
            auths.insert(auth.id.clone(), auth);
        }
        Ok(count)
    }

    /// `Register`: assigns an id when absent, persists if the record carries
    /// real credential material, then fires `OnAuthRegistered`.
    pub async fn register(&self, request: RegisterRequest) -> Result<Auth, ConductorError> {
        let mut auth = Auth::new(request.provider);
        auth.id = request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        auth.prefix = request.prefix;
        auth.label = request.label;
        auth.attributes = request.attributes;
        auth.metadata = request.metadata;
        auth.proxy_url = request.proxy_url;
        auth.ensure_index();

        if auth.is_persistable() {
            self.store.save(&auth).await?;
        }

        {
            let mut auths = self.auths.write().await;
            auths.insert(auth.id.clone(), auth.clone());
        }

        self.hub
            .emit(Event::Operational(OperationalEvent::AuthRegistered {
                auth_id: auth.id.clone(),
                provider: auth.provider.clone(),
            }))
            .await;

        Ok(auth)
    }

    /// `Update`: applies `mutate` under the write lock, persists, and fires
    /// `OnAuthUpdated`.
    pub async fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Auth),
    ) -> Result<Auth, ConductorError> {
        let updated = {
            let mut auths = self.auths.write().await;
            let auth = auths
                .get_mut(id)
                .ok_or_else(|| ConductorError::NotFound(id.to_string()))?;
            mutate(auth);
            auth.updated_at = SystemTime::now();
            auth.clone()
        };
        if updated.is_persistable() {
            self.store.save(&updated).await?;
        }
        self.hub
            .emit(Event::Operational(OperationalEvent::AuthUpdated {
                auth_id: updated.id.clone(),
                provider: updated.provider.clone(),
            }))
            .await;
        Ok(updated)
    }

    pub async fn list(&self) -> Vec<Auth> {
        self.auths.read().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Auth> {
        self.auths.read().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> Result<(), ConductorError> {
        self.auths.write().await.remove(id);
        self.store.delete(id).await?;
        Ok(())
    }

    // ---- model rewriting & truncation (§4.G.2, §4.G.7) --------------------

    /// Strips the auth's configured prefix, then threads the two independent
    /// alias layers §4.G.2/§9 require, in their documented order: the global
    /// OAuth-channel table (keyed by `Auth.Provider`) first, then the
    /// per-auth-id API-key table carried in `metadata["model_aliases"]`. The
    /// API-key layer preserves a requester's "thinking" suffix (e.g.
    /// `(high)`) when the configured upstream name doesn't already carry one.
    async fn rewrite_model(&self, auth: &Auth, model: &str) -> String {
        let stripped = match &auth.prefix {
            Some(prefix) if !prefix.is_empty() => {
                model.strip_prefix(prefix.as_str()).map(str::to_string)
            }
            _ => None,
        }
        .unwrap_or_else(|| model.to_string());

        let after_oauth = {
            let table = self.oauth_channel_aliases.read().await;
            table
                .get(&auth.provider)
                .and_then(|aliases| aliases.get(&stripped.to_ascii_lowercase()))
                .cloned()
                .unwrap_or(stripped)
        };

        let (base, suffix) = split_thinking_suffix(&after_oauth);
        let api_key_rewritten = auth
            .metadata
            .get("model_aliases")
            .and_then(Value::as_object)
            .and_then(|map| map.get(&base.to_ascii_lowercase()))
            .and_then(Value::as_str)
            .map(str::to_string);

        match api_key_rewritten {
            Some(target) if !suffix.is_empty() && split_thinking_suffix(&target).1.is_empty() => {
                format!("{target}{suffix}")
            }
            Some(target) => target,
            None => after_oauth,
        }
    }

    /// Drops the oldest messages when the payload looks too large for the
    /// model's context window, prepending a short note about what happened.
    /// A simplified reading of §4.G.7: it reuses `truncate_messages`'s
    /// drop-oldest-fraction behavior repeatedly instead of the original's
    /// memory-event-summary extraction.
    fn maybe_truncate(&self, model: &str, payload: &Bytes) -> Bytes {
        let Ok(mut value) = serde_json::from_slice::<Value>(payload) else {
            return payload.clone();
        };

        let limit = gproxy_provider_core::model_context_limit(model) as f32;
        let chars_per_token = if model.to_ascii_lowercase().contains("claude") {
            3.0
        } else {
            3.5
        };
        let char_budget = (limit * TRUNCATE_SAFETY_FACTOR * chars_per_token) as usize;

        let mut truncated = false;
        loop {
            let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
            if size <= char_budget {
                break;
            }
            if !gproxy_provider_core::truncate_messages(&mut value, 0.3) {
                break;
            }
            truncated = true;
        }

        if truncated && let Some(messages) = value.get_mut("messages").and_then(Value::as_array_mut) {
            messages.insert(
                0,
                serde_json::json!({
                    "role": "system",
                    "content": "[earlier turns truncated to fit the model's context window]",
                }),
            );
        }

        serde_json::to_vec(&value)
            .map(Bytes::from)
            .unwrap_or_else(|_| payload.clone())
    }

    /// Builds the `Request` every executor's `execute`/`execute_stream`
    /// receives: resolves the alias chain, then applies the shared §4.F
    /// step-4 thinking-budget injection/normalization on top of the
    /// already-translated payload, before the call ever reaches a concrete
    /// executor.
    async fn build_request(&self, auth: &Auth, model: &str, payload: Bytes) -> Request {
        let mut metadata = HashMap::new();
        metadata.insert(
            REQUESTED_MODEL_KEY.to_string(),
            Value::String(model.to_string()),
        );

        let rewritten_model = self.rewrite_model(auth, model).await;
        let payload = self.apply_thinking_budget(&auth.provider, &rewritten_model, payload);

        Request {
            model: rewritten_model,
            payload,
            metadata,
        }
    }

    /// §4.F step 4: inject/normalize a thinking block keyed on the final
    /// (post-alias) model's capability, clamping Claude-via-Antigravity to
    /// `max_tokens - 1`.
    fn apply_thinking_budget(&self, provider: &str, model: &str, payload: Bytes) -> Bytes {
        let dialect = gproxy_provider_core::dialect_for_provider(provider);
        if dialect == gproxy_provider_core::ThinkingDialect::None {
            return payload;
        }
        let Ok(mut value) = serde_json::from_slice::<Value>(&payload) else {
            return payload;
        };
        let clamp_to_max_tokens_minus_one = provider == "antigravity" && gproxy_provider_core::is_claude_family(model);
        if !gproxy_provider_core::apply_thinking_budget(&mut value, model, dialect, clamp_to_max_tokens_minus_one) {
            return payload;
        }
        serde_json::to_vec(&value).map(Bytes::from).unwrap_or(payload)
    }

    async fn candidates(&self, provider: &str, tried: &HashSet<String>) -> Vec<Auth> {
        self.auths
            .read()
            .await
            .values()
            .filter(|auth| auth.provider == provider && !tried.contains(&auth.id))
            .cloned()
            .collect()
    }

    // ---- §4.G.3 MarkResult --------------------------------------------

    async fn record_outcome(
        &self,
        auth_id: &str,
        model: &str,
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: Option<String>,
        reason: Option<UnavailableReason>,
    ) {
        let now = SystemTime::now();
        let snapshot = {
            let mut auths = self.auths.write().await;
            let Some(auth) = auths.get_mut(auth_id) else {
                return;
            };
            let quota_cooldown_disabled = self.quota_cooldown_disabled(auth);
            match status {
                None => auth.mark_success(model, now),
                Some(_) => auth.mark_failure(
                    model,
                    status,
                    retry_after,
                    message.clone(),
                    now,
                    quota_cooldown_disabled,
                ),
            }
            auth.clone()
        };
        if snapshot.is_persistable() {
            let _ = self.store.save(&snapshot).await;
        }
        self.hub
            .emit(Event::Operational(OperationalEvent::Result(ResultEvent {
                auth_id: auth_id.to_string(),
                provider: snapshot.provider.clone(),
                model: model.to_string(),
                success: status.is_none(),
                error_status: status,
                error_message: message,
                retry_after_secs: retry_after.map(|d| d.as_secs()),
                reason,
            })))
            .await;
    }

    async fn record_success(&self, auth_id: &str, model: &str) {
        self.record_outcome(auth_id, model, None, None, None, None).await;
    }

    async fn record_failure(&self, auth_id: &str, model: &str, failure: &AttemptFailure) {
        self.record_outcome(
            auth_id,
            model,
            Some(failure.passthrough.status),
            failure.passthrough.retry_after,
            Some(failure.passthrough.message.clone()),
            failure.mark.map(|mark| mark.reason),
        )
        .await;
    }

    async fn record_failure_from_passthrough(
        &self,
        auth_id: &str,
        model: &str,
        err: &UpstreamPassthroughError,
    ) {
        self.record_outcome(
            auth_id,
            model,
            Some(err.status),
            err.retry_after,
            Some(err.message.clone()),
            None,
        )
        .await;
    }

    // ---- §4.G.2 execute (non-streaming) ------------------------------------

    pub async fn execute(
        &self,
        provider: &str,
        model: &str,
        payload: Bytes,
        options: Options,
    ) -> Result<Response, UpstreamPassthroughError> {
        let payload = self.maybe_truncate(model, &payload);
        let mut tried = HashSet::new();
        let mut last_error: Option<UpstreamPassthroughError> = None;

        for _ in 0..self.max_attempts {
            let candidates = self.candidates(provider, &tried).await;
            let picked = match self.selector.pick(provider, model, SelectOptions::default(), &candidates) {
                Ok(auth) => auth.clone(),
                Err(err) => {
                    return Err(last_error.unwrap_or_else(|| selector_error_passthrough(&err)));
                }
            };
            tried.insert(picked.id.clone());

            let Some(executor) = self.registry.get(provider) else {
                return Err(UpstreamPassthroughError::not_supported(format!(
                    "no executor registered for {provider}"
                )));
            };

            let request = self.build_request(&picked, model, payload.clone()).await;
            match executor.execute(&picked, &request, &options).await {
                Ok(response) => {
                    self.record_success(&picked.id, model).await;
                    return Ok(response);
                }
                Err(failure) => {
                    last_error = Some(failure.passthrough.clone());
                    self.record_failure(&picked.id, model, &failure).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| UpstreamPassthroughError::service_unavailable("exhausted retry budget")))
    }

    /// Single-attempt token-count dispatch against an already-selected auth
    /// (spec §4.E `CountTokens`); unlike `execute`, this never retries onto a
    /// different auth since the caller is counting for a specific candidate.
    pub async fn count_tokens(
        &self,
        auth_id: &str,
        model: &str,
        payload: Bytes,
        options: Options,
    ) -> Result<Response, UpstreamPassthroughError> {
        let auth = self
            .get_by_id(auth_id)
            .await
            .ok_or_else(|| UpstreamPassthroughError::new(404, "auth not found").with_code("auth_not_found"))?;
        let Some(executor) = self.registry.get(&auth.provider) else {
            return Err(UpstreamPassthroughError::not_supported(format!(
                "no executor registered for {}",
                auth.provider
            )));
        };
        let request = self.build_request(&auth, model, payload).await;
        executor
            .count_tokens(&auth, &request, &options)
            .await
            .map_err(|failure| failure.passthrough)
    }

    // ---- §4.G.4 streaming execution forwarder ------------------------------

    /// Takes `Arc<Self>` by value (cheap to clone at the call site) because
    /// the forwarder that records the eventual success/failure `Result` runs
    /// in a detached task.
    pub async fn execute_stream(
        self: Arc<Self>,
        provider: &str,
        model: &str,
        payload: Bytes,
        options: Options,
    ) -> Result<mpsc::Receiver<StreamChunk>, UpstreamPassthroughError> {
        let payload = self.maybe_truncate(model, &payload);
        let mut tried = HashSet::new();
        let mut last_error: Option<UpstreamPassthroughError> = None;

        for _ in 0..self.max_attempts {
            let candidates = self.candidates(provider, &tried).await;
            let picked = match self.selector.pick(provider, model, SelectOptions::default(), &candidates) {
                Ok(auth) => auth.clone(),
                Err(err) => {
                    return Err(last_error.unwrap_or_else(|| selector_error_passthrough(&err)));
                }
            };
            tried.insert(picked.id.clone());

            let Some(executor) = self.registry.get(provider) else {
                return Err(UpstreamPassthroughError::not_supported(format!(
                    "no executor registered for {provider}"
                )));
            };

            let request = self.build_request(&picked, model, payload.clone()).await;
            match executor.execute_stream(&picked, &request, &options).await {
                Ok(mut upstream_rx) => {
                    let (tx, rx) = mpsc::channel(16);
                    let conductor = Arc::clone(&self);
                    let auth_id = picked.id.clone();
                    let model = model.to_string();
                    tokio::spawn(async move {
                        let mut recorded = false;
                        while let Some(chunk) = upstream_rx.recv().await {
                            if let Some(err) = chunk.error.clone() {
                                if !recorded {
                                    conductor
                                        .record_failure_from_passthrough(&auth_id, &model, &err)
                                        .await;
                                    recorded = true;
                                }
                                let _ = tx.send(chunk).await;
                                break;
                            }
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        if !recorded {
                            conductor.record_success(&auth_id, &model).await;
                        }
                    });
                    return Ok(rx);
                }
                Err(failure) => {
                    last_error = Some(failure.passthrough.clone());
                    self.record_failure(&picked.id, model, &failure).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| UpstreamPassthroughError::service_unavailable("exhausted retry budget")))
    }

    // ---- §4.G.6 HTTP request injection --------------------------------------

    /// `InjectCredentials`/`PrepareHttpRequest`: looks up the auth, delegates
    /// header/body stamping to its executor's `prepare_request`, and applies
    /// the same MarkResult status table on failure (as an aggregate mark,
    /// since no model is in scope at this seam). `ProviderExecutor::
    /// prepare_request` is a mandatory (non-optional) trait method in this
    /// port, so the spec's "if the executor doesn't implement RequestPreparer"
    /// branch never triggers here — every executor always implements it.
    pub async fn prepare_http_request(
        &self,
        auth_id: &str,
        request: &mut UpstreamHttpRequest,
    ) -> Result<(), UpstreamPassthroughError> {
        let auth = self
            .get_by_id(auth_id)
            .await
            .ok_or_else(|| UpstreamPassthroughError::new(404, "auth not found").with_code("auth_not_found"))?;
        let Some(executor) = self.registry.get(&auth.provider) else {
            return Err(UpstreamPassthroughError::not_supported(format!(
                "no executor registered for {}",
                auth.provider
            )));
        };

        match executor.prepare_request(request, &auth) {
            Ok(()) => Ok(()),
            Err(err) => {
                let now = SystemTime::now();
                let quota_cooldown_disabled = self.quota_cooldown_disabled(&auth);
                let snapshot = {
                    let mut auths = self.auths.write().await;
                    let Some(a) = auths.get_mut(auth_id) else {
                        return Err(err);
                    };
                    a.mark_failure_aggregate(
                        Some(err.status),
                        err.retry_after,
                        Some(err.message.clone()),
                        now,
                        quota_cooldown_disabled,
                    );
                    a.clone()
                };
                if snapshot.is_persistable() {
                    let _ = self.store.save(&snapshot).await;
                }
                Err(err)
            }
        }
    }

    // ---- §4.G.5 auto-refresh loop -------------------------------------------

    /// Spawns the background refresh loop; ticks every `REFRESH_TICK` and
    /// claims any auth whose `next_refresh_after` is due. Dropping the
    /// returned handle does not stop the loop (it isn't abort-on-drop);
    /// callers that need to stop it should `.abort()` explicitly.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let conductor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_TICK).await;
                conductor.refresh_due().await;
            }
        })
    }

    async fn refresh_due(self: &Arc<Self>) {
        let now = SystemTime::now();
        let due: Vec<Auth> = {
            let mut auths = self.auths.write().await;
            let mut due = Vec::new();
            for auth in auths.values_mut() {
                if auth.disabled {
                    continue;
                }
                let is_due = matches!(auth.next_refresh_after, Some(t) if t <= now);
                if !is_due {
                    continue;
                }
                auth.next_refresh_after = Some(now + REFRESH_CLAIM_LEAD);
                due.push(auth.clone());
            }
            due
        };

        for auth in due {
            let conductor = Arc::clone(self);
            tokio::spawn(async move {
                conductor.refresh_one(auth).await;
            });
        }
    }

    async fn refresh_one(&self, auth: Auth) {
        let Some(executor) = self.registry.get(&auth.provider) else {
            return;
        };
        let auth_id = auth.id.clone();
        let now = SystemTime::now();
        match executor.refresh(&auth).await {
            Ok(mut refreshed) => {
                refreshed.last_refreshed_at = Some(now);
                refreshed.next_refresh_after = None;
                let persistable = refreshed.is_persistable();
                {
                    let mut auths = self.auths.write().await;
                    auths.insert(auth_id, refreshed.clone());
                }
                if persistable {
                    let _ = self.store.save(&refreshed).await;
                }
            }
            Err(_failure) => {
                let mut auths = self.auths.write().await;
                if let Some(a) = auths.get_mut(&auth_id) {
                    a.next_refresh_after = Some(SystemTime::now() + REFRESH_FAILURE_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gproxy_provider_core::UpstreamFailure;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct MemoryStore {
        auths: AsyncMutex<HashMap<String, Auth>>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                auths: AsyncMutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl AuthStore for MemoryStore {
        async fn list(&self) -> Result<Vec<Auth>, AuthStoreError> {
            Ok(self.auths.lock().await.values().cloned().collect())
        }

        async fn save(&self, auth: &Auth) -> Result<String, AuthStoreError> {
            if auth.id.trim().is_empty() {
                return Err(AuthStoreError::EmptyId);
            }
            self.auths.lock().await.insert(auth.id.clone(), auth.clone());
            Ok(auth.id.clone())
        }

        async fn delete(&self, id: &str) -> Result<(), AuthStoreError> {
            self.auths.lock().await.remove(id);
            Ok(())
        }
    }

    /// Always fails with a fixed status, every time, for every auth.
    struct AlwaysFails(u16);

    #[async_trait]
    impl ProviderExecutor for AlwaysFails {
        fn identifier(&self) -> &'static str {
            "flaky"
        }

        fn prepare_request(
            &self,
            _req: &mut UpstreamHttpRequest,
            _auth: &Auth,
        ) -> Result<(), UpstreamPassthroughError> {
            Ok(())
        }

        async fn execute(
            &self,
            _auth: &Auth,
            _request: &Request,
            _options: &Options,
        ) -> Result<Response, AttemptFailure> {
            let failure = UpstreamFailure::Http {
                status: self.0,
                headers: Vec::new(),
                body: Bytes::new(),
            };
            let mark = self.decide_unavailable(&failure);
            Err(AttemptFailure {
                passthrough: UpstreamPassthroughError::new(self.0, "always fails"),
                mark,
            })
        }

        async fn execute_stream(
            &self,
            _auth: &Auth,
            _request: &Request,
            _options: &Options,
        ) -> Result<mpsc::Receiver<StreamChunk>, AttemptFailure> {
            Err(AttemptFailure {
                passthrough: UpstreamPassthroughError::new(self.0, "always fails"),
                mark: None,
            })
        }
    }

    /// Succeeds on the Nth call (1-indexed) per auth id, fails with 500
    /// before that.
    struct SucceedsOnAttempt {
        target: StdMutex<HashMap<String, usize>>,
        succeed_after: usize,
    }

    impl SucceedsOnAttempt {
        fn new(succeed_after: usize) -> Self {
            Self {
                target: StdMutex::new(HashMap::new()),
                succeed_after,
            }
        }
    }

    #[async_trait]
    impl ProviderExecutor for SucceedsOnAttempt {
        fn identifier(&self) -> &'static str {
            "flaky"
        }

        fn prepare_request(
            &self,
            _req: &mut UpstreamHttpRequest,
            _auth: &Auth,
        ) -> Result<(), UpstreamPassthroughError> {
            Ok(())
        }

        async fn execute(
            &self,
            auth: &Auth,
            _request: &Request,
            _options: &Options,
        ) -> Result<Response, AttemptFailure> {
            let mut target = self.target.lock().unwrap();
            let count = target.entry(auth.id.clone()).or_insert(0);
            *count += 1;
            if *count >= self.succeed_after {
                Ok(Response {
                    payload: Bytes::from_static(b"{}"),
                    usage: None,
                })
            } else {
                Err(AttemptFailure {
                    passthrough: UpstreamPassthroughError::new(500, "not yet"),
                    mark: Some(gproxy_provider_core::UnavailableDecision {
                        duration: Duration::from_secs(1),
                        reason: UnavailableReason::Upstream5xx,
                    }),
                })
            }
        }

        async fn execute_stream(
            &self,
            _auth: &Auth,
            _request: &Request,
            _options: &Options,
        ) -> Result<mpsc::Receiver<StreamChunk>, AttemptFailure> {
            unimplemented!()
        }
    }

    async fn conductor_with(executor: Arc<dyn ProviderExecutor>) -> AuthConductor {
        let mut registry = ExecutorRegistry::new();
        registry.register(executor);
        AuthConductor::new(registry, MemoryStore::new(), EventHub::new(16))
    }

    #[tokio::test]
    async fn register_then_get_by_id_round_trips() {
        let conductor = conductor_with(Arc::new(AlwaysFails(500))).await;
        let auth = conductor
            .register(RegisterRequest {
                provider: "flaky".to_string(),
                metadata: {
                    let mut m = Metadata::new();
                    m.insert("api_key".to_string(), Value::String("secret".to_string()));
                    m
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let fetched = conductor.get_by_id(&auth.id).await.unwrap();
        assert_eq!(fetched.id, auth.id);
        assert_eq!(conductor.list().await.len(), 1);
    }

    #[tokio::test]
    async fn execute_round_robins_across_two_auths() {
        let conductor = conductor_with(Arc::new(SucceedsOnAttempt::new(1))).await;
        for label in ["a", "b"] {
            conductor
                .register(RegisterRequest {
                    id: Some(label.to_string()),
                    provider: "flaky".to_string(),
                    metadata: {
                        let mut m = Metadata::new();
                        m.insert("api_key".to_string(), Value::String("k".to_string()));
                        m
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let mut picked = HashSet::new();
        for _ in 0..4 {
            conductor
                .execute("flaky", "m", Bytes::from_static(b"{}"), Options::default())
                .await
                .unwrap();
        }
        for auth in conductor.list().await {
            picked.insert(auth.id);
        }
        assert_eq!(picked.len(), 2);
    }

    #[tokio::test]
    async fn execute_does_not_retry_the_same_auth_twice_in_one_call() {
        // `succeed_after(2)` means the lone auth only succeeds on its second
        // attempt, but a single call excludes an already-tried auth from the
        // next pick, so with only one candidate the call must fail rather
        // than loop back onto it.
        let conductor = conductor_with(Arc::new(SucceedsOnAttempt::new(2))).await;
        conductor
            .register(RegisterRequest {
                id: Some("only".to_string()),
                provider: "flaky".to_string(),
                metadata: {
                    let mut m = Metadata::new();
                    m.insert("api_key".to_string(), Value::String("k".to_string()));
                    m
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let result = conductor
            .execute("flaky", "m", Bytes::from_static(b"{}"), Options::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_surfaces_no_candidates_as_404() {
        let conductor = conductor_with(Arc::new(AlwaysFails(500))).await;
        let err = conductor
            .execute("flaky", "m", Bytes::from_static(b"{}"), Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn execute_marks_auth_unavailable_after_exhausting_budget() {
        let conductor = conductor_with(Arc::new(AlwaysFails(401))).await;
        conductor
            .register(RegisterRequest {
                id: Some("a1".to_string()),
                provider: "flaky".to_string(),
                metadata: {
                    let mut m = Metadata::new();
                    m.insert("api_key".to_string(), Value::String("k".to_string()));
                    m
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let err = conductor
            .execute("flaky", "m", Bytes::from_static(b"{}"), Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, 401);
        let auth = conductor.get_by_id("a1").await.unwrap();
        assert!(auth.model_states["m"].unavailable);
    }

    #[tokio::test]
    async fn streaming_forwarder_records_exactly_one_failure_result() {
        struct StreamsOneError;

        #[async_trait]
        impl ProviderExecutor for StreamsOneError {
            fn identifier(&self) -> &'static str {
                "flaky"
            }

            fn prepare_request(
                &self,
                _req: &mut UpstreamHttpRequest,
                _auth: &Auth,
            ) -> Result<(), UpstreamPassthroughError> {
                Ok(())
            }

            async fn execute(
                &self,
                _auth: &Auth,
                _request: &Request,
                _options: &Options,
            ) -> Result<Response, AttemptFailure> {
                unimplemented!()
            }

            async fn execute_stream(
                &self,
                _auth: &Auth,
                _request: &Request,
                _options: &Options,
            ) -> Result<mpsc::Receiver<StreamChunk>, AttemptFailure> {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx
                        .send(StreamChunk {
                            payload: None,
                            error: Some(UpstreamPassthroughError::new(429, "rate limited")),
                        })
                        .await;
                });
                Ok(rx)
            }
        }

        let conductor = Arc::new(conductor_with(Arc::new(StreamsOneError)).await);
        conductor
            .register(RegisterRequest {
                id: Some("a1".to_string()),
                provider: "flaky".to_string(),
                metadata: {
                    let mut m = Metadata::new();
                    m.insert("api_key".to_string(), Value::String("k".to_string()));
                    m
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let mut hub_rx = conductor.hub.subscribe();
        let mut rx = conductor
            .execute_stream("flaky", "m", Bytes::from_static(b"{}"), Options::default())
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().error.is_some());
        assert!(rx.recv().await.is_none());

        let mut saw_result = 0;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(200), hub_rx.recv()).await {
            if let Ok(Event::Operational(OperationalEvent::Result(r))) = event {
                assert!(!r.success);
                saw_result += 1;
            }
        }
        assert_eq!(saw_result, 1);
    }

    #[tokio::test]
    async fn refresh_loop_claims_and_clears_due_auths() {
        struct Refreshes;

        #[async_trait]
        impl ProviderExecutor for Refreshes {
            fn identifier(&self) -> &'static str {
                "flaky"
            }

            fn prepare_request(
                &self,
                _req: &mut UpstreamHttpRequest,
                _auth: &Auth,
            ) -> Result<(), UpstreamPassthroughError> {
                Ok(())
            }

            async fn execute(
                &self,
                _auth: &Auth,
                _request: &Request,
                _options: &Options,
            ) -> Result<Response, AttemptFailure> {
                unimplemented!()
            }

            async fn execute_stream(
                &self,
                _auth: &Auth,
                _request: &Request,
                _options: &Options,
            ) -> Result<mpsc::Receiver<StreamChunk>, AttemptFailure> {
                unimplemented!()
            }

            async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
                let mut next = auth.clone();
                next.metadata.insert("refreshed".to_string(), Value::Bool(true));
                Ok(next)
            }
        }

        let conductor = Arc::new(conductor_with(Arc::new(Refreshes)).await);
        conductor
            .register(RegisterRequest {
                id: Some("a1".to_string()),
                provider: "flaky".to_string(),
                metadata: {
                    let mut m = Metadata::new();
                    m.insert("api_key".to_string(), Value::String("k".to_string()));
                    m
                },
                ..Default::default()
            })
            .await
            .unwrap();
        conductor
            .update("a1", |auth| auth.next_refresh_after = Some(SystemTime::now()))
            .await
            .unwrap();

        conductor.refresh_due().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let auth = conductor.get_by_id("a1").await.unwrap();
        assert_eq!(auth.metadata.get("refreshed"), Some(&Value::Bool(true)));
        assert!(auth.next_refresh_after.is_none());
    }

    #[tokio::test]
    async fn rewrite_model_strips_prefix_then_applies_alias() {
        let registry = ExecutorRegistry::new();
        let store = MemoryStore::new();
        let conductor = AuthConductor::new(registry, store, EventHub::new(4));

        let mut auth = Auth::new("flaky");
        auth.prefix = Some("work/".to_string());
        auth.metadata.insert(
            "model_aliases".to_string(),
            serde_json::json!({"gpt-4": "gpt-4-internal"}),
        );

        assert_eq!(conductor.rewrite_model(&auth, "work/gpt-4").await, "gpt-4-internal");
        assert_eq!(conductor.rewrite_model(&auth, "gpt-3.5").await, "gpt-3.5");
    }

    #[tokio::test]
    async fn rewrite_model_applies_oauth_channel_layer_before_api_key_layer() {
        let registry = ExecutorRegistry::new();
        let store = MemoryStore::new();
        let conductor = AuthConductor::new(registry, store, EventHub::new(4));

        conductor
            .set_oauth_channel_aliases(
                "flaky",
                HashMap::from([("gpt-4".to_string(), "gpt-4-channel".to_string())]),
            )
            .await;

        let mut auth = Auth::new("flaky");
        auth.metadata.insert(
            "model_aliases".to_string(),
            serde_json::json!({"gpt-4-channel": "gpt-4-internal"}),
        );

        // The OAuth-channel table fires first (gpt-4 -> gpt-4-channel), then
        // the per-auth API-key table fires on its output (-> gpt-4-internal).
        assert_eq!(conductor.rewrite_model(&auth, "gpt-4").await, "gpt-4-internal");
    }

    #[tokio::test]
    async fn rewrite_model_preserves_thinking_suffix_through_api_key_alias() {
        let registry = ExecutorRegistry::new();
        let store = MemoryStore::new();
        let conductor = AuthConductor::new(registry, store, EventHub::new(4));

        let mut auth = Auth::new("flaky");
        auth.metadata.insert(
            "model_aliases".to_string(),
            serde_json::json!({"gpt-4": "gpt-4-internal"}),
        );

        assert_eq!(
            conductor.rewrite_model(&auth, "gpt-4(high)").await,
            "gpt-4-internal(high)"
        );
    }

    #[tokio::test]
    async fn build_request_injects_thinking_budget_for_gemini_provider() {
        let registry = ExecutorRegistry::new();
        let store = MemoryStore::new();
        let conductor = AuthConductor::new(registry, store, EventHub::new(4));
        let auth = Auth::new("antigravity");

        let payload = Bytes::from_static(br#"{"contents": []}"#);
        let request = conductor.build_request(&auth, "gemini-2.5-pro", payload).await;
        let value: Value = serde_json::from_slice(&request.payload).unwrap();
        assert_eq!(value["generationConfig"]["thinkingConfig"]["thinkingBudget"], 32_768);
    }

    #[tokio::test]
    async fn build_request_clamps_claude_via_antigravity_to_max_tokens_minus_one() {
        // Antigravity wraps every model, including Claude, in the same
        // Gemini-shaped `generateContent` envelope, so the thinking block it
        // carries is `generationConfig.thinkingConfig`, not Claude's own
        // `thinking` field.
        let registry = ExecutorRegistry::new();
        let store = MemoryStore::new();
        let conductor = AuthConductor::new(registry, store, EventHub::new(4));
        let auth = Auth::new("antigravity");

        let payload = Bytes::from_static(br#"{"generationConfig": {"maxOutputTokens": 2000}}"#);
        let request = conductor
            .build_request(&auth, "claude-opus-4-1", payload)
            .await;
        let value: Value = serde_json::from_slice(&request.payload).unwrap();
        assert_eq!(value["generationConfig"]["thinkingConfig"]["thinkingBudget"], 1999);
    }
}
