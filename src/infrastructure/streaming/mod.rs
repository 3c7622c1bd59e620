//! Streaming subscription manager.
//!
//! Keeps one websocket open to the broker's streaming endpoint, owns the
//! UIC -> subscription ledger, decodes inbound binary frames into the quote
//! map, and supervises reconnects. Subscribe/unsubscribe happen over a REST
//! side channel (the `SubscriptionApi` port) so ledger behavior is testable
//! without a socket.
//!
//! Every reconnect rotates the context id (the broker 409s on reuse) and
//! re-enrolls the desired UIC set under fresh reference ids, because the
//! broker drops all subscriptions with the old context.

pub mod codec;

use crate::domain::errors::GatewayError;
use crate::domain::ports::{Clock, SubscriptionApi};
use crate::domain::types::{Quote, SubscriptionEntry, Uic};
use crate::infrastructure::auth::TokenSource;
use codec::{PAYLOAD_FORMAT_JSON, decode_frames};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const CONTEXT_BASE: &str = "BotContext";
const REF_BASE: &str = "PriceSub";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Watched-but-never-promoted subscriptions older than this are prunable.
const STALE_AFTER: Duration = Duration::from_secs(3600);

struct StreamState {
    context_id: String,
    ledger: HashMap<Uic, SubscriptionEntry>,
    quotes: HashMap<Uic, Quote>,
}

pub struct StreamingManager {
    ws_url: String,
    api: Arc<dyn SubscriptionApi>,
    auth: Arc<TokenSource>,
    clock: Arc<dyn Clock>,
    state: Mutex<StreamState>,
    limit_hit: AtomicBool,
}

impl StreamingManager {
    pub fn new(
        ws_url: String,
        api: Arc<dyn SubscriptionApi>,
        auth: Arc<TokenSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context_id = format!("{CONTEXT_BASE}_{}", clock.unix_seconds());
        Self {
            ws_url,
            api,
            auth,
            clock,
            state: Mutex::new(StreamState {
                context_id,
                ledger: HashMap::new(),
                quotes: HashMap::new(),
            }),
            limit_hit: AtomicBool::new(false),
        }
    }

    /// Enroll one UIC. Idempotent: an already-enrolled UIC is left alone.
    pub async fn add(&self, uic: Uic) -> Result<(), GatewayError> {
        if self.state.lock().expect("stream state").ledger.contains_key(&uic) {
            debug!(uic, "Already enrolled");
            return Ok(());
        }
        self.enroll(uic).await
    }

    /// Drop one UIC. Idempotent; local state is removed even when the REST
    /// delete fails, because the broker GCs subscriptions with the context.
    pub async fn remove(&self, uic: Uic) {
        let entry = {
            let mut state = self.state.lock().expect("stream state");
            state.quotes.remove(&uic);
            state.ledger.remove(&uic)
        };
        let Some(entry) = entry else {
            debug!(uic, "Not enrolled, remove is a no-op");
            return;
        };

        match self
            .api
            .delete_price_subscription(&entry.context_id, &entry.reference_id)
            .await
        {
            Ok(()) => info!(uic, reference_id = %entry.reference_id, "Unsubscribed"),
            Err(e) => warn!(uic, "Unsubscribe failed, local entry dropped anyway: {e}"),
        }
    }

    /// Drop subscriptions older than 60 minutes whose UIC is not in `safe`
    /// (open positions). Clears the subscription-limit backoff flag.
    pub async fn prune(&self, safe: &HashSet<Uic>) -> Vec<Uic> {
        info!("Running stream pruning...");
        let now = self.clock.monotonic();

        let stale: Vec<Uic> = {
            let state = self.state.lock().expect("stream state");
            state
                .ledger
                .values()
                .filter(|entry| {
                    !safe.contains(&entry.uic)
                        && now.duration_since(entry.created_at) > STALE_AFTER
                })
                .map(|entry| entry.uic)
                .collect()
        };

        for uic in &stale {
            self.remove(*uic).await;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Pruned stale subscriptions");
        }

        self.limit_hit.store(false, Ordering::Relaxed);
        stale
    }

    pub fn latest(&self, uic: Uic) -> Option<Quote> {
        self.state.lock().expect("stream state").quotes.get(&uic).copied()
    }

    /// Snapshot of enrolled UICs, sorted for deterministic iteration.
    pub fn watched(&self) -> Vec<Uic> {
        let mut uics: Vec<Uic> = self
            .state
            .lock()
            .expect("stream state")
            .ledger
            .keys()
            .copied()
            .collect();
        uics.sort_unstable();
        uics
    }

    pub fn entry(&self, uic: Uic) -> Option<SubscriptionEntry> {
        self.state.lock().expect("stream state").ledger.get(&uic).cloned()
    }

    /// Whether the broker has refused further subscriptions. The scanner
    /// pauses enrollments while this is set; `prune` clears it.
    pub fn limit_reached(&self) -> bool {
        self.limit_hit.load(Ordering::Relaxed)
    }

    /// Allocate a fresh context id for a new websocket session.
    pub fn rotate_context(&self) -> String {
        let context_id = format!("{CONTEXT_BASE}_{}", self.clock.unix_seconds());
        self.state.lock().expect("stream state").context_id = context_id.clone();
        context_id
    }

    /// Take the set of UICs that must be re-enrolled after a reconnect,
    /// discarding their ledger entries (the broker lost them with the old
    /// context).
    pub fn take_desired(&self) -> Vec<Uic> {
        let mut state = self.state.lock().expect("stream state");
        let mut desired: Vec<Uic> = state.ledger.keys().copied().collect();
        desired.sort_unstable();
        state.ledger.clear();
        desired
    }

    /// Enroll every UIC in `desired` under the current context. Individual
    /// failures are logged and skipped; a subscription-limit error stops the
    /// batch since further enrolls would also be refused.
    pub async fn reenroll(&self, desired: &[Uic]) {
        for &uic in desired {
            if let Err(GatewayError::SubscriptionLimit) = self.enroll(uic).await {
                break;
            }
        }
    }

    async fn enroll(&self, uic: Uic) -> Result<(), GatewayError> {
        let (context_id, reference_id) = {
            let state = self.state.lock().expect("stream state");
            (
                state.context_id.clone(),
                format!("{REF_BASE}_{uic}_{}", self.clock.unix_seconds()),
            )
        };

        match self
            .api
            .create_price_subscription(&context_id, &reference_id, &[uic])
            .await
        {
            Ok(snapshot) => {
                {
                    let mut state = self.state.lock().expect("stream state");
                    state.ledger.insert(
                        uic,
                        SubscriptionEntry {
                            uic,
                            reference_id,
                            context_id,
                            created_at: self.clock.monotonic(),
                        },
                    );
                }
                self.apply_snapshot(&snapshot);
                Ok(())
            }
            Err(GatewayError::SubscriptionLimit) => {
                self.limit_hit.store(true, Ordering::Relaxed);
                error!("CRITICAL: streaming subscription limit reached, pausing enrollments until prune");
                Err(GatewayError::SubscriptionLimit)
            }
            Err(e) => {
                warn!(uic, "Subscription enroll abandoned: {e}");
                Ok(())
            }
        }
    }

    /// Record quotes from a snapshot or delta `Data` array. Price precedence
    /// is LastTraded, then Ask, then Bid; elements without both a UIC and a
    /// price are skipped.
    pub fn apply_snapshot(&self, items: &[Value]) {
        let now = self.clock.monotonic();
        let mut state = self.state.lock().expect("stream state");

        for item in items {
            let Some(uic) = item.get("Uic").and_then(Value::as_u64) else {
                continue;
            };
            let uic = uic as Uic;

            let Some(last_price) = item.get("Quote").and_then(|quote| {
                quote
                    .get("LastTraded")
                    .or_else(|| quote.get("Ask"))
                    .or_else(|| quote.get("Bid"))
                    .and_then(Value::as_f64)
            }) else {
                continue;
            };

            debug!(uic, last_price, "Price update");
            state.quotes.insert(
                uic,
                Quote {
                    uic,
                    last_price,
                    updated_at: now,
                },
            );
        }
    }

    /// Supervised connection loop: connect with a fresh context, re-enroll
    /// the desired set, pump messages until disconnect or shutdown, then
    /// back off 5 s and repeat with a refreshed token.
    pub async fn run(self: Arc<Self>, initial: Vec<Uic>, mut shutdown: watch::Receiver<bool>) {
        let mut pending: Vec<Uic> = initial;

        while *shutdown.borrow() {
            let token = match self.auth.bearer().await {
                Ok(token) => token,
                Err(e) => {
                    error!("No valid token for streaming: {e}");
                    if !sleep_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            let context_id = self.rotate_context();
            let url = format!("{}?contextId={}", self.ws_url, context_id);
            info!(context_id = %context_id, "Connecting to streaming endpoint...");

            let request = match build_request(&url, &token) {
                Ok(request) => request,
                Err(e) => {
                    error!("Could not build websocket request: {e}");
                    break;
                }
            };

            let ws = match connect_async(request).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    error!("Websocket connect failed: {e}");
                    if !sleep_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                        break;
                    }
                    continue;
                }
            };
            info!("Websocket connected, setting up subscriptions...");

            // Entries from the previous context are gone server-side.
            let mut desired = self.take_desired();
            for uic in pending.drain(..) {
                if !desired.contains(&uic) {
                    desired.push(uic);
                }
            }
            self.reenroll(&desired).await;

            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() {
                            let _ = write.send(Message::Close(None)).await;
                            info!("Streaming manager shut down");
                            return;
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                        Some(Ok(Message::Text(text))) => {
                            if text.contains("SubscriptionLimitExceeded") {
                                self.limit_hit.store(true, Ordering::Relaxed);
                                error!("CRITICAL: websocket reported subscription limit: {text}");
                            } else {
                                info!("Ignoring text frame: {text}");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Websocket closed by server: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Websocket read error: {e}");
                            break;
                        }
                        None => {
                            warn!("Websocket stream ended");
                            break;
                        }
                    }
                }
            }

            if !*shutdown.borrow() {
                break;
            }
            warn!(
                "Websocket disconnected, reconnecting in {}s...",
                RECONNECT_DELAY.as_secs()
            );
            if !sleep_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                break;
            }
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        let frames = match decode_frames(data) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Dropping undecodable message: {e}");
                return;
            }
        };

        for frame in frames {
            if frame.payload_format != PAYLOAD_FORMAT_JSON {
                debug!(
                    reference_id = %frame.reference_id,
                    format = frame.payload_format,
                    "Skipping opaque payload"
                );
                continue;
            }
            if !frame.reference_id.starts_with(REF_BASE) {
                debug!(reference_id = %frame.reference_id, "Skipping non-price frame");
                continue;
            }

            let payload: Value = match serde_json::from_slice(&frame.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(reference_id = %frame.reference_id, "Bad JSON payload: {e}");
                    continue;
                }
            };

            match payload {
                Value::Array(items) => self.apply_snapshot(&items),
                other => self.apply_snapshot(std::slice::from_ref(&other)),
            }
        }
    }
}

fn build_request(
    url: &str,
    token: &str,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        tokio_tungstenite::tungstenite::http::header::AUTHORIZATION,
        format!("Bearer {token}").parse()?,
    );
    Ok(request)
}

/// Sleep for `d` unless shutdown fires first. Returns whether to keep going.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => {}
        _ = shutdown.changed() => {}
    }
    *shutdown.borrow()
}
