//! Token lifecycle state machine
//!
//! `TokenManager` is the single owner of credential state in the process.
//! Callers ask it for a usable access token with [`TokenManager::ensure_token`];
//! it answers from the in-memory cache, then from the durable store, and only
//! then starts an authentication attempt (silent refresh, optionally followed
//! by interactive consent).
//!
//! At most one attempt is in flight. It is held as a shared future: every
//! caller that arrives while it runs awaits the same result instead of
//! launching a second consent screen or a second refresh with a refresh
//! token the first call may already have rotated.
//!
//! Logout aborts the attempt but leaves it in place until it has wound
//! down, so a new attempt never overlaps a detached one.

use chrono::{DateTime, Duration, Utc};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::oauth::OAuthFlow;
use super::{AuthError, Clock, Credential, CredentialStore, ExpiryPolicy, SystemClock, TokenGrant};

type AttemptFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

/// Observable state of the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoCredential,
    /// Access token within the expiry margin.
    Fresh,
    /// Access token exists but is past the margin (or was rejected by the API).
    Stale,
    /// A silent refresh is in flight.
    Refreshing,
    /// Waiting on the user at the consent screen.
    AwaitingInteractive,
    /// The refresh token was rejected; only an interactive login can recover.
    PermanentFailure,
}

/// Broadcast to the renewal scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalSignal {
    /// An interactive login completed; the counter increases with each one.
    Active(u64),
    /// Logged out; stop renewing.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Refreshing,
    AwaitingInteractive,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    issued_at: DateTime<Utc>,
}

impl From<&Credential> for CachedToken {
    fn from(c: &Credential) -> Self {
        Self {
            access_token: c.access_token.clone(),
            issued_at: c.issued_at,
        }
    }
}

struct PendingAttempt {
    id: u64,
    /// Generation the attempt was started in; older ones were detached by logout.
    generation: u64,
    interactive: bool,
    phase: Phase,
    future: AttemptFuture,
    abort: AbortHandle,
}

enum Attempt {
    /// The attempt this caller started or joined, with its mode.
    Current {
        interactive: bool,
        future: AttemptFuture,
        joined: bool,
    },
    /// An attempt detached by logout that has not finished unwinding yet.
    Detached(AttemptFuture),
}

#[derive(Default)]
struct State {
    cache: Option<CachedToken>,
    /// Last token the provider API answered with 401.
    rejected: Option<String>,
    pending: Option<PendingAttempt>,
    permanent_failure: bool,
    /// Bumped by logout; attempts started before it must not persist.
    generation: u64,
    next_attempt_id: u64,
    interactive_logins: u64,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    flow: Arc<dyn OAuthFlow>,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    state: Mutex<State>,
    renewal: watch::Sender<RenewalSignal>,
}

/// Handle to the process-wide credential state. Cheap to clone.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        flow: Arc<dyn OAuthFlow>,
        policy: ExpiryPolicy,
    ) -> Self {
        Self::with_clock(store, flow, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        flow: Arc<dyn OAuthFlow>,
        policy: ExpiryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (renewal, _) = watch::channel(RenewalSignal::Active(0));
        Self {
            inner: Arc::new(Inner {
                store,
                flow,
                clock,
                policy,
                state: Mutex::new(State::default()),
                renewal,
            }),
        }
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.inner.policy
    }

    /// Return a usable access token, renewing it if needed.
    ///
    /// With `interactive = false` no consent screen is ever shown; a missing
    /// or unrecoverable credential fails with `AuthenticationRequired` (or
    /// `InvalidGrant` when the refresh token was just rejected).
    pub async fn ensure_token(&self, interactive: bool) -> Result<String, AuthError> {
        if let Some(token) = self.current_token() {
            return Ok(token);
        }
        if let Some(token) = self.inner.load_fresh_from_store() {
            tracing::debug!("Using stored access token");
            return Ok(token);
        }

        let mut escalated = false;
        loop {
            let (attempt_interactive, attempt, joined) = match self.inner.start_or_join(interactive) {
                Attempt::Current {
                    interactive: mode,
                    future,
                    joined,
                } => (mode, future, joined),
                Attempt::Detached(previous) => {
                    tracing::debug!("Waiting for detached authentication attempt to finish");
                    let _ = previous.await;
                    continue;
                }
            };
            if joined {
                tracing::debug!("Joining in-flight authentication attempt");
            }
            match attempt.await {
                // A silent attempt someone else started cannot satisfy an
                // explicit login; run one interactive attempt after it.
                Err(e)
                    if joined
                        && interactive
                        && !attempt_interactive
                        && !escalated
                        && e.needs_interaction() =>
                {
                    tracing::debug!("Joined silent attempt failed ({}); retrying interactively", e);
                    escalated = true;
                }
                result => return result,
            }
        }
    }

    /// Cached token if it is still fresh. Never does I/O.
    pub fn current_token(&self) -> Option<String> {
        let state = self.inner.lock();
        let now = self.inner.clock.now();
        state
            .cache
            .as_ref()
            .filter(|c| self.inner.is_usable(&state, &c.access_token, c.issued_at, now))
            .map(|c| c.access_token.clone())
    }

    /// Best-effort check without network I/O: a fresh token, or a refresh
    /// token to get one with.
    pub fn is_logged_in(&self) -> bool {
        if self.inner.lock().permanent_failure {
            return false;
        }
        if self.current_token().is_some() {
            return true;
        }
        match self.inner.store.get() {
            Some(cred) => {
                let state = self.inner.lock();
                let now = self.inner.clock.now();
                cred.refresh_token.is_some()
                    || self
                        .inner
                        .is_usable(&state, &cred.access_token, cred.issued_at, now)
            }
            None => false,
        }
    }

    pub fn state(&self) -> TokenState {
        {
            let state = self.inner.lock();
            let pending = state
                .pending
                .as_ref()
                .filter(|p| p.generation == state.generation);
            match pending.map(|p| p.phase) {
                Some(Phase::Refreshing) => return TokenState::Refreshing,
                Some(Phase::AwaitingInteractive) => return TokenState::AwaitingInteractive,
                Some(Phase::Starting) | None => {}
            }
            if state.permanent_failure {
                return TokenState::PermanentFailure;
            }
        }
        if self.current_token().is_some() {
            return TokenState::Fresh;
        }
        match self.inner.store.get() {
            None => TokenState::NoCredential,
            Some(cred) => {
                let state = self.inner.lock();
                let now = self.inner.clock.now();
                if self
                    .inner
                    .is_usable(&state, &cred.access_token, cred.issued_at, now)
                {
                    TokenState::Fresh
                } else {
                    TokenState::Stale
                }
            }
        }
    }

    /// Record that the provider API answered `token` with 401 Unauthorized,
    /// so the next `ensure_token` renews instead of handing it out again.
    pub fn reject_token(&self, token: &str) {
        let mut state = self.inner.lock();
        if state
            .cache
            .as_ref()
            .is_some_and(|c| c.access_token == token)
        {
            state.cache = None;
        }
        state.rejected = Some(token.to_string());
        tracing::debug!("Access token rejected by API; it will be renewed");
    }

    /// Forget every credential and suspend scheduled renewal. Idempotent.
    ///
    /// An attempt still in flight is aborted and its result is not persisted.
    pub fn logout(&self) -> Result<(), AuthError> {
        let result = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.cache = None;
            state.rejected = None;
            if let Some(pending) = &state.pending {
                pending.abort.abort();
            }
            state.permanent_failure = false;
            self.inner.store.clear()
        };
        self.inner.renewal.send_replace(RenewalSignal::Suspended);
        tracing::info!("Credentials cleared");
        result
    }

    /// Subscribe to login/logout notifications for scheduled renewal.
    pub fn renewal_signals(&self) -> watch::Receiver<RenewalSignal> {
        self.inner.renewal.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic: every update is a plain assignment.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_usable(&self, state: &State, token: &str, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.policy.is_fresh(issued_at, now) && state.rejected.as_deref() != Some(token)
    }

    /// Step 2 of `ensure_token`: promote a fresh stored token into the cache.
    fn load_fresh_from_store(&self) -> Option<String> {
        let cred = self.store.get()?;
        let now = self.clock.now();
        let mut state = self.lock();
        if !self.is_usable(&state, &cred.access_token, cred.issued_at, now) {
            return None;
        }
        state.cache = Some(CachedToken::from(&cred));
        Some(cred.access_token)
    }

    fn start_or_join(self: &Arc<Self>, interactive: bool) -> Attempt {
        let mut state = self.lock();
        if let Some(pending) = &state.pending {
            if pending.generation != state.generation {
                return Attempt::Detached(pending.future.clone());
            }
            return Attempt::Current {
                interactive: pending.interactive,
                future: pending.future.clone(),
                joined: true,
            };
        }

        state.next_attempt_id += 1;
        let id = state.next_attempt_id;
        let generation = state.generation;
        let (abort, registration) = AbortHandle::new_pair();

        let attempt = {
            let inner = Arc::clone(self);
            async move { inner.run_attempt(id, interactive, generation).await }
        };
        let inner = Arc::clone(self);
        // Every outcome, a panic included, clears the pending slot.
        let future = AssertUnwindSafe(Abortable::new(attempt, registration))
            .catch_unwind()
            .map(move |outcome| {
                inner.finish_attempt(id);
                match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(_aborted)) => {
                        tracing::debug!("Authentication attempt aborted by logout");
                        Err(AuthError::AuthenticationRequired)
                    }
                    Err(_panic) => {
                        tracing::error!("Authentication attempt panicked");
                        Err(AuthError::MalformedResponse(
                            "authentication attempt failed unexpectedly".into(),
                        ))
                    }
                }
            })
            .boxed()
            .shared();

        state.pending = Some(PendingAttempt {
            id,
            generation,
            interactive,
            phase: Phase::Starting,
            future: future.clone(),
            abort,
        });
        Attempt::Current {
            interactive,
            future,
            joined: false,
        }
    }

    fn finish_attempt(&self, id: u64) {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
        }
    }

    fn set_phase(&self, id: u64, phase: Phase) {
        let mut state = self.lock();
        if let Some(pending) = state.pending.as_mut().filter(|p| p.id == id) {
            pending.phase = phase;
        }
    }

    /// Steps 3 and 4 of `ensure_token`.
    async fn run_attempt(
        &self,
        id: u64,
        interactive: bool,
        generation: u64,
    ) -> Result<String, AuthError> {
        // A previous attempt may have stored a token since the caller looked.
        if let Some(token) = self.load_fresh_from_store() {
            return Ok(token);
        }

        let refresh_token = self.store.get().and_then(|c| c.refresh_token);
        if let Some(refresh_token) = refresh_token {
            self.set_phase(id, Phase::Refreshing);
            tracing::info!("Access token missing or stale, refreshing silently...");

            let refreshed = self.flow.refresh(&refresh_token).await;
            match refreshed {
                Ok(grant) => return self.persist(grant, Some(refresh_token), generation, false),
                Err(AuthError::InvalidGrant(reason)) => {
                    tracing::warn!("Refresh token rejected ({}); discarding credentials", reason);
                    self.wipe(generation);
                    if !interactive {
                        let mut state = self.lock();
                        if state.generation == generation {
                            state.permanent_failure = true;
                        }
                        return Err(AuthError::InvalidGrant(reason));
                    }
                }
                Err(e) => {
                    tracing::warn!("Silent refresh failed: {}", e);
                    return Err(e);
                }
            }
        }

        if self.flow.supports_silent_authorization() {
            match self.authorize_and_exchange(false).await {
                Ok(grant) => return self.persist(grant, None, generation, false),
                Err(AuthError::InteractionRequired) => {
                    tracing::debug!("Provider session cannot be reused silently");
                }
                Err(e) if !interactive => {
                    tracing::warn!("Silent authorization failed: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("Silent authorization failed: {}", e),
            }
        }

        if !interactive {
            tracing::info!("No usable credential; interactive login required");
            return Err(AuthError::AuthenticationRequired);
        }

        self.set_phase(id, Phase::AwaitingInteractive);
        tracing::info!("Starting interactive authorization...");
        match self.authorize_and_exchange(true).await {
            Ok(grant) => self.persist(grant, None, generation, true),
            Err(e) => {
                tracing::error!("Interactive authorization failed: {}", e);
                self.wipe(generation);
                Err(e)
            }
        }
    }

    async fn authorize_and_exchange(&self, interactive: bool) -> Result<TokenGrant, AuthError> {
        let grant = self.flow.authorize(interactive).await?;
        self.flow.exchange(grant).await
    }

    /// Stamp, cache and store a new token.
    fn persist(
        &self,
        grant: TokenGrant,
        previous_refresh: Option<String>,
        generation: u64,
        interactive: bool,
    ) -> Result<String, AuthError> {
        if let Some(secs) = grant.expires_in {
            let lifetime = i64::try_from(secs).ok().and_then(Duration::try_seconds);
            if lifetime.is_some_and(|d| d < self.policy.usable_window()) {
                tracing::warn!(
                    "Provider issued a token valid for {}s, shorter than the renewal window",
                    secs
                );
            }
        }
        let credential = Credential::from_grant(grant, previous_refresh, self.clock.now());

        let mut state = self.lock();
        if state.generation != generation {
            tracing::info!("Logged out while authenticating; discarding new token");
            return Err(AuthError::AuthenticationRequired);
        }
        state.cache = Some(CachedToken::from(&credential));
        state.rejected = None;
        state.permanent_failure = false;
        if let Err(e) = self.store.set(&credential) {
            // The token is still good for this process.
            tracing::error!("Failed to persist credentials: {}", e);
        }
        if interactive {
            state.interactive_logins += 1;
            self.renewal
                .send_replace(RenewalSignal::Active(state.interactive_logins));
        }

        tracing::info!(
            "Access token acquired (refresh token {})",
            if credential.refresh_token.is_some() { "present" } else { "absent" }
        );
        Ok(credential.access_token)
    }

    /// Drop cache and store, unless a logout already started a new generation.
    fn wipe(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.cache = None;
        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear credentials: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by the auth and api tests.

    use super::*;
    use crate::auth::redirect::AuthorizationGrant;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    pub fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3599),
        }
    }

    /// Scripted provider. Each call yields a few times so that concurrent
    /// callers can pile up while it is in flight.
    #[derive(Default)]
    pub struct MockFlow {
        pub authorize_calls: AtomicUsize,
        pub exchange_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub authorize_error: Mutex<Option<AuthError>>,
        pub exchange_results: Mutex<VecDeque<Result<TokenGrant, AuthError>>>,
        pub refresh_results: Mutex<VecDeque<Result<TokenGrant, AuthError>>>,
        pub panic_on_exchange: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    /// Counts a provider call as in flight until dropped.
    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MockFlow {
        pub fn push_exchange(&self, result: Result<TokenGrant, AuthError>) {
            self.exchange_results.lock().unwrap().push_back(result);
        }

        pub fn push_refresh(&self, result: Result<TokenGrant, AuthError>) {
            self.refresh_results.lock().unwrap().push_back(result);
        }

        pub fn network_calls(&self) -> usize {
            self.authorize_calls.load(Ordering::SeqCst)
                + self.exchange_calls.load(Ordering::SeqCst)
                + self.refresh_calls.load(Ordering::SeqCst)
        }

        /// Most provider calls that were ever running at the same time.
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn enter(&self) -> InFlight<'_> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            InFlight(&self.in_flight)
        }
    }

    async fn suspend() {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    #[async_trait]
    impl OAuthFlow for MockFlow {
        async fn authorize(&self, interactive: bool) -> Result<AuthorizationGrant, AuthError> {
            if !interactive {
                return Err(AuthError::InteractionRequired);
            }
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            let _call = self.enter();
            suspend().await;
            if let Some(e) = self.authorize_error.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(AuthorizationGrant::Code {
                code: "c0de".into(),
                pkce_verifier: None,
            })
        }

        async fn exchange(&self, _grant: AuthorizationGrant) -> Result<TokenGrant, AuthError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            let _call = self.enter();
            suspend().await;
            if self.panic_on_exchange.load(Ordering::SeqCst) {
                panic!("token endpoint exploded");
            }
            let next = self.exchange_results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(grant("abc", Some("r1"))))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let _call = self.enter();
            suspend().await;
            let next = self.refresh_results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(grant("def", None)))
        }
    }
}
