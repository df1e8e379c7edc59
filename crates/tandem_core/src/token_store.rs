//! Bounded, refreshing credential cache.
//!
//! Keeps at most one access token per document, refreshes proactively before
//! expiry, bounds concurrent network refreshes, and deduplicates concurrent
//! requests for the same document through a shared in-flight future.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use lru::LruCache;
use tokio::sync::Semaphore;

use crate::error::{Result, TandemError};
use crate::time::{IntervalId, TimeProvider};
use crate::types::ClientToken;

/// Cached token entry.
#[derive(Debug, Clone)]
pub struct TokenInfo<T> {
    /// Human-readable name for reports (usually the document path)
    pub friendly_name: String,
    /// The token, absent until the first successful refresh
    pub token: Option<T>,
    /// Expiry in epoch milliseconds
    pub expiry_time_ms: i64,
    /// Consecutive failed refresh attempts
    pub attempts: u32,
}

/// Injected refresh call against the auth provider.
pub type RefreshFn<T> = Arc<dyn Fn(&str) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Injected expiry derivation from a freshly obtained token.
pub type ExpiryFn<T> = Arc<dyn Fn(&T) -> Result<i64> + Send + Sync>;

/// Callback invoked with the fresh token after a successful refresh.
pub type RefreshCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Filter for [`TokenStore::clear`].
pub type GuidFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

type SharedRefresh<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<TandemError>>>>;

/// Tuning knobs for the token store.
#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    /// Maximum cached tokens (LRU-evicted beyond this)
    pub max_tokens: usize,
    /// Maximum concurrent refresh calls; overflow queues FIFO
    pub max_connections: usize,
    /// A token "should refresh" once `now + margin > expiry`
    pub expiry_margin_ms: i64,
    /// Period of the background sweep
    pub sweep_interval_ms: u64,
    /// Failed attempts before an entry is dropped
    pub max_attempts: u32,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            max_connections: 5,
            expiry_margin_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60_000,
            max_attempts: 3,
        }
    }
}

/// Bounded cache of per-document access tokens with proactive refresh.
pub struct TokenStore<T: Clone + Send + Sync + 'static> {
    time: Arc<dyn TimeProvider>,
    refresh: RefreshFn<T>,
    get_expiry: ExpiryFn<T>,
    config: TokenStoreConfig,
    tokens: Mutex<LruCache<String, TokenInfo<T>>>,
    callbacks: Mutex<HashMap<String, RefreshCallback<T>>>,
    in_flight: Mutex<HashMap<String, SharedRefresh<T>>>,
    semaphore: Arc<Semaphore>,
    timer: Mutex<Option<IntervalId>>,
}

impl<T: Clone + Send + Sync + 'static> TokenStore<T> {
    /// Create a token store with the given refresh and expiry functions.
    pub fn new(
        time: Arc<dyn TimeProvider>,
        refresh: RefreshFn<T>,
        get_expiry: ExpiryFn<T>,
        config: TokenStoreConfig,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.max_tokens.max(1)).unwrap();
        let max_connections = config.max_connections.max(1);
        Arc::new(Self {
            time,
            refresh,
            get_expiry,
            config,
            tokens: Mutex::new(LruCache::new(capacity)),
            callbacks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            timer: Mutex::new(None),
        })
    }

    /// Get a valid token for `guid`, refreshing if needed.
    ///
    /// Concurrent callers for the same guid share one in-flight refresh. A
    /// failed refresh rejects every waiter; nothing is retried here. Only
    /// the periodic sweep re-enqueues refresh candidates.
    pub fn get(
        self: &Arc<Self>,
        guid: &str,
        friendly_name: &str,
        on_refreshed: Option<RefreshCallback<T>>,
    ) -> BoxFuture<'static, Result<T>> {
        if let Some(cb) = on_refreshed {
            self.callbacks.lock().unwrap().insert(guid.to_string(), cb);
        }

        let now = self.time.now();
        {
            let mut tokens = self.tokens.lock().unwrap();
            // An exhausted entry is dropped before refreshing again, so a
            // cached rejection is never reused.
            let exhausted = tokens
                .peek(guid)
                .is_some_and(|entry| entry.attempts >= self.config.max_attempts);
            if exhausted {
                log::debug!("[TokenStore] Dropping exhausted entry for {}", guid);
                tokens.pop(guid);
            }
            if let Some(entry) = tokens.get_mut(guid) {
                if let Some(token) = &entry.token {
                    if !should_refresh(now, self.config.expiry_margin_ms, entry.expiry_time_ms) {
                        let token = token.clone();
                        return async move { Ok(token) }.boxed();
                    }
                }
            } else {
                tokens.put(
                    guid.to_string(),
                    TokenInfo {
                        friendly_name: friendly_name.to_string(),
                        token: None,
                        expiry_time_ms: 0,
                        attempts: 0,
                    },
                );
            }
        }

        let shared = self.ensure_refresh(guid);
        let guid = guid.to_string();
        async move {
            shared.await.map_err(|e| TandemError::TokenRefresh {
                guid,
                message: e.to_string(),
            })
        }
        .boxed()
    }

    /// Non-blocking peek at a cached, unexpired token.
    pub fn get_sync(&self, guid: &str) -> Option<T> {
        let now = self.time.now();
        let tokens = self.tokens.lock().unwrap();
        tokens.peek(guid).and_then(|entry| {
            if entry.expiry_time_ms > now {
                entry.token.clone()
            } else {
                None
            }
        })
    }

    /// Start the periodic sweep. Requires a tokio runtime context.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let id = self.time.set_interval(
            Arc::new(move || {
                if let Some(store) = weak.upgrade() {
                    store.sweep();
                }
            }),
            self.config.sweep_interval_ms,
        );
        *timer = Some(id);
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        let mut timer = self.timer.lock().unwrap();
        if let Some(id) = timer.take() {
            self.time.clear_interval(id);
        }
    }

    /// One sweep pass: evict dead entries, schedule refreshes for live ones.
    pub fn sweep(self: &Arc<Self>) {
        let now = self.time.now();
        let callback_guids: std::collections::HashSet<String> = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks.keys().cloned().collect()
        };

        let mut to_refresh = Vec::new();
        {
            let mut tokens = self.tokens.lock().unwrap();
            let mut to_drop = Vec::new();
            for (guid, entry) in tokens.iter() {
                let has_callback = callback_guids.contains(guid);
                if entry.attempts >= self.config.max_attempts {
                    to_drop.push(guid.clone());
                } else if entry.expiry_time_ms <= now && !has_callback {
                    to_drop.push(guid.clone());
                } else if has_callback
                    && should_refresh(now, self.config.expiry_margin_ms, entry.expiry_time_ms)
                {
                    to_refresh.push(guid.clone());
                }
            }
            for guid in to_drop {
                log::debug!("[TokenStore] Sweep dropping {}", guid);
                tokens.pop(&guid);
            }
        }

        for guid in to_refresh {
            let shared = self.ensure_refresh(&guid);
            tokio::spawn(async move {
                // Result already recorded by the refresh itself.
                let _ = shared.await;
            });
        }
    }

    /// Deregister the refresh callback for `guid`.
    pub fn remove_from_refresh_queue(&self, guid: &str) {
        self.callbacks.lock().unwrap().remove(guid);
    }

    /// Drop cached entries matching `filter`, or all entries if none is given.
    pub fn clear(&self, filter: Option<GuidFilter>) {
        let mut tokens = self.tokens.lock().unwrap();
        match filter {
            None => tokens.clear(),
            Some(filter) => {
                let matching: Vec<String> = tokens
                    .iter()
                    .filter(|(guid, _)| filter(guid.as_str()))
                    .map(|(guid, _)| guid.clone())
                    .collect();
                for guid in matching {
                    tokens.pop(&guid);
                }
            }
        }
    }

    /// Drop tokens whose expiry is past and reset `attempts` on the rest.
    pub fn clear_state(&self) {
        let now = self.time.now();
        let mut tokens = self.tokens.lock().unwrap();
        let expired: Vec<String> = tokens
            .iter()
            .filter(|(_, entry)| entry.expiry_time_ms <= now)
            .map(|(guid, _)| guid.clone())
            .collect();
        for guid in expired {
            tokens.pop(&guid);
        }
        for (_, entry) in tokens.iter_mut() {
            entry.attempts = 0;
        }
    }

    /// Human-readable report of cached entries, sorted by expiry.
    pub fn report(&self) -> String {
        let now = self.time.now();
        let tokens = self.tokens.lock().unwrap();
        let mut entries: Vec<(String, String, i64, u32, bool)> = tokens
            .iter()
            .map(|(guid, e)| {
                (
                    guid.clone(),
                    e.friendly_name.clone(),
                    e.expiry_time_ms,
                    e.attempts,
                    e.token.is_some(),
                )
            })
            .collect();
        entries.sort_by_key(|(_, _, expiry, _, _)| *expiry);

        let mut out = String::new();
        out.push_str(&format!("{} token(s) cached\n", entries.len()));
        for (guid, name, expiry, attempts, has_token) in entries {
            let status = if !has_token {
                "no token".to_string()
            } else if expiry <= now {
                "expired".to_string()
            } else {
                format!("expires in {}s", (expiry - now) / 1000)
            };
            out.push_str(&format!(
                "  {} ({}): {}, attempts={}\n",
                name, guid, status, attempts
            ));
        }
        out
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempt counter for a cached entry (diagnostics and tests).
    pub fn attempts(&self, guid: &str) -> Option<u32> {
        let tokens = self.tokens.lock().unwrap();
        tokens.peek(guid).map(|e| e.attempts)
    }

    /// Number of refreshes currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    fn ensure_refresh(self: &Arc<Self>, guid: &str) -> SharedRefresh<T> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(existing) = in_flight.get(guid) {
            return existing.clone();
        }

        let store = Arc::clone(self);
        let guid_owned = guid.to_string();
        let fut = async move {
            let _permit = store
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Arc::new(TandemError::Cancelled("token-refresh".to_string())))?;
            let result = (store.refresh)(&guid_owned).await;
            store.finish_refresh(&guid_owned, result)
        }
        .boxed()
        .shared();

        in_flight.insert(guid.to_string(), fut.clone());
        fut
    }

    fn finish_refresh(
        self: &Arc<Self>,
        guid: &str,
        result: Result<T>,
    ) -> std::result::Result<T, Arc<TandemError>> {
        self.in_flight.lock().unwrap().remove(guid);

        let result = result.and_then(|token| {
            let expiry = (self.get_expiry)(&token)?;
            Ok((token, expiry))
        });

        match result {
            Ok((token, expiry)) => {
                {
                    let mut tokens = self.tokens.lock().unwrap();
                    if let Some(entry) = tokens.get_mut(guid) {
                        entry.token = Some(token.clone());
                        entry.expiry_time_ms = expiry;
                        entry.attempts = 0;
                    } else {
                        tokens.put(
                            guid.to_string(),
                            TokenInfo {
                                friendly_name: guid.to_string(),
                                token: Some(token.clone()),
                                expiry_time_ms: expiry,
                                attempts: 0,
                            },
                        );
                    }
                }
                let callback = {
                    let callbacks = self.callbacks.lock().unwrap();
                    callbacks.get(guid).cloned()
                };
                if let Some(cb) = callback {
                    cb(&token);
                }
                Ok(token)
            }
            Err(e) => {
                let mut tokens = self.tokens.lock().unwrap();
                if let Some(entry) = tokens.get_mut(guid) {
                    entry.attempts += 1;
                    log::debug!(
                        "[TokenStore] Refresh failed for {} (attempt {}): {}",
                        guid,
                        entry.attempts,
                        e
                    );
                }
                Err(Arc::new(e))
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for TokenStore<T> {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(id) = timer.take() {
                self.time.clear_interval(id);
            }
        }
    }
}

fn should_refresh(now: i64, margin_ms: i64, expiry_time_ms: i64) -> bool {
    now + margin_ms > expiry_time_ms
}

/// Decode a JWT's `exp` claim and return it in epoch milliseconds.
///
/// This is the default expiry derivation; providers can inject their own.
pub fn jwt_expiry_ms(jwt: &str) -> Result<i64> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| TandemError::Jwt("token is not a JWT".to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|e| TandemError::Jwt(format!("payload is not base64url: {}", e)))?;
    let value: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| TandemError::Jwt(format!("payload is not JSON: {}", e)))?;
    let exp = value
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| TandemError::Jwt("payload has no numeric exp".to_string()))?;
    Ok(exp * 1000)
}

/// Default expiry function for [`ClientToken`]s: the server-provided expiry
/// when present, otherwise the JWT `exp` claim.
pub fn client_token_expiry() -> ExpiryFn<ClientToken> {
    Arc::new(|token: &ClientToken| match token.expiry_time {
        Some(expiry) => Ok(expiry),
        None => jwt_expiry_ms(&token.token),
    })
}
