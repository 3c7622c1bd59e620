//! Subscription-ledger behavior of the streaming manager, driven through a
//! recording stand-in for the REST side channel: idempotent add/remove,
//! reconnect re-enrollment, pruning, and the subscription-limit backoff.

use async_trait::async_trait;
use saxotrader::config::AuthConfig;
use saxotrader::domain::errors::GatewayError;
use saxotrader::domain::ports::{Clock, SubscriptionApi};
use saxotrader::domain::types::Uic;
use saxotrader::infrastructure::auth::TokenSource;
use saxotrader::infrastructure::persistence::MemoryStateStore;
use saxotrader::infrastructure::streaming::StreamingManager;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    fn advance(&self, d: Duration) {
        *self.offset.lock().unwrap() += d;
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn unix_seconds(&self) -> u64 {
        1_700_000_000 + self.offset.lock().unwrap().as_secs()
    }
}

#[derive(Default)]
struct RecordingApi {
    subscribes: Mutex<Vec<(String, String, Vec<Uic>)>>,
    deletes: Mutex<Vec<(String, String)>>,
    refuse_with_limit: AtomicBool,
    fail_subscribes: AtomicBool,
    fail_deletes: AtomicBool,
    snapshot: Mutex<Vec<Value>>,
}

#[async_trait]
impl SubscriptionApi for RecordingApi {
    async fn create_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        uics: &[Uic],
    ) -> Result<Vec<Value>, GatewayError> {
        if self.refuse_with_limit.load(Ordering::Relaxed) {
            return Err(GatewayError::SubscriptionLimit);
        }
        if self.fail_subscribes.load(Ordering::Relaxed) {
            return Err(GatewayError::Remote {
                status: 500,
                body: "boom".to_string(),
            });
        }
        self.subscribes.lock().unwrap().push((
            context_id.to_string(),
            reference_id.to_string(),
            uics.to_vec(),
        ));
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn delete_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
    ) -> Result<(), GatewayError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(GatewayError::Remote {
                status: 500,
                body: "boom".to_string(),
            });
        }
        self.deletes
            .lock()
            .unwrap()
            .push((context_id.to_string(), reference_id.to_string()));
        Ok(())
    }
}

fn manager(api: Arc<RecordingApi>, clock: Arc<ManualClock>) -> StreamingManager {
    let store = Arc::new(MemoryStateStore::new());
    let auth = Arc::new(TokenSource::new(
        AuthConfig {
            app_key: "key".to_string(),
            app_secret: "secret".to_string(),
            auth_endpoint: String::new(),
            token_endpoint: String::new(),
            redirect_url: String::new(),
            refresh_token: None,
            env_backup_path: None,
        },
        store,
    ));
    StreamingManager::new("wss://example.invalid/ws".to_string(), api, auth, clock)
}

#[tokio::test]
async fn add_is_idempotent() {
    let api = Arc::new(RecordingApi::default());
    let manager = manager(api.clone(), Arc::new(ManualClock::new()));

    manager.add(211).await.unwrap();
    manager.add(211).await.unwrap();

    assert_eq!(manager.watched(), vec![211]);
    assert_eq!(api.subscribes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn remove_is_idempotent_and_survives_delete_failure() {
    let api = Arc::new(RecordingApi::default());
    let manager = manager(api.clone(), Arc::new(ManualClock::new()));

    manager.add(211).await.unwrap();
    api.fail_deletes.store(true, Ordering::Relaxed);

    // Broker delete fails; local state goes away regardless.
    manager.remove(211).await;
    assert!(manager.watched().is_empty());
    assert!(manager.latest(211).is_none());

    // Second remove is a no-op with no further REST traffic.
    manager.remove(211).await;
    assert!(api.deletes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn abandoned_enroll_leaves_no_ledger_entry() {
    let api = Arc::new(RecordingApi::default());
    let manager = manager(api.clone(), Arc::new(ManualClock::new()));

    // Non-limit REST failures abandon the enroll quietly.
    api.fail_subscribes.store(true, Ordering::Relaxed);
    assert!(manager.add(211).await.is_ok());
    assert!(manager.watched().is_empty());

    // The UIC can be enrolled once the broker recovers.
    api.fail_subscribes.store(false, Ordering::Relaxed);
    manager.add(211).await.unwrap();
    assert_eq!(manager.watched(), vec![211]);
}

#[tokio::test]
async fn reconnect_reenrolls_under_fresh_context_and_refs() {
    let api = Arc::new(RecordingApi::default());
    let clock = Arc::new(ManualClock::new());
    let manager = manager(api.clone(), clock.clone());

    for uic in [10, 20, 30] {
        manager.add(uic).await.unwrap();
    }
    let old_entries: Vec<_> = [10, 20, 30]
        .iter()
        .map(|&u| manager.entry(u).unwrap())
        .collect();

    // Forced reconnect: new context id, ledger discarded, all three UICs
    // re-enrolled with fresh reference ids.
    clock.advance(Duration::from_secs(10));
    let new_context = manager.rotate_context();
    let desired = manager.take_desired();
    assert_eq!(desired, vec![10, 20, 30]);
    assert!(manager.watched().is_empty());

    manager.reenroll(&desired).await;
    assert_eq!(manager.watched(), vec![10, 20, 30]);

    for old in &old_entries {
        let new = manager.entry(old.uic).unwrap();
        assert_eq!(new.context_id, new_context);
        assert_ne!(new.context_id, old.context_id);
        assert_ne!(new.reference_id, old.reference_id);
    }
    // Three initial subscribes plus three re-enrollments.
    assert_eq!(api.subscribes.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn prune_respects_safe_set() {
    let api = Arc::new(RecordingApi::default());
    let clock = Arc::new(ManualClock::new());
    let manager = manager(api.clone(), clock.clone());

    for uic in [10, 20, 30] {
        manager.add(uic).await.unwrap();
    }

    // 3700s later, everything is stale but UIC 20 is a held position.
    clock.advance(Duration::from_secs(3700));
    let safe: HashSet<Uic> = [20].into_iter().collect();
    let removed = manager.prune(&safe).await;

    assert_eq!(manager.watched(), vec![20]);
    let mut removed = removed;
    removed.sort_unstable();
    assert_eq!(removed, vec![10, 30]);
}

#[tokio::test]
async fn prune_keeps_young_subscriptions() {
    let api = Arc::new(RecordingApi::default());
    let clock = Arc::new(ManualClock::new());
    let manager = manager(api.clone(), clock.clone());

    manager.add(10).await.unwrap();
    clock.advance(Duration::from_secs(1800));
    manager.add(30).await.unwrap();
    clock.advance(Duration::from_secs(1900));

    // UIC 10 is 3700s old, UIC 30 only 1900s.
    let removed = manager.prune(&HashSet::new()).await;
    assert_eq!(removed, vec![10]);
    assert_eq!(manager.watched(), vec![30]);
}

#[tokio::test]
async fn subscription_limit_flags_backoff_until_prune() {
    let api = Arc::new(RecordingApi::default());
    let manager = manager(api.clone(), Arc::new(ManualClock::new()));

    api.refuse_with_limit.store(true, Ordering::Relaxed);
    assert!(manager.add(99).await.is_err());
    assert!(manager.limit_reached());

    api.refuse_with_limit.store(false, Ordering::Relaxed);
    manager.prune(&HashSet::new()).await;
    assert!(!manager.limit_reached());
}

#[tokio::test]
async fn snapshot_quotes_follow_price_precedence() {
    let api = Arc::new(RecordingApi::default());
    let manager = manager(api.clone(), Arc::new(ManualClock::new()));

    manager.apply_snapshot(&[
        json!({"Uic": 1, "Quote": {"LastTraded": 10.0, "Ask": 11.0, "Bid": 9.0}}),
        json!({"Uic": 2, "Quote": {"Ask": 21.0, "Bid": 19.0}}),
        json!({"Uic": 3, "Quote": {"Bid": 29.0}}),
        json!({"Uic": 4, "Quote": {}}),
        json!({"Quote": {"LastTraded": 5.0}}),
    ]);

    assert_eq!(manager.latest(1).unwrap().last_price, 10.0);
    assert_eq!(manager.latest(2).unwrap().last_price, 21.0);
    assert_eq!(manager.latest(3).unwrap().last_price, 29.0);
    assert!(manager.latest(4).is_none());
}

#[tokio::test]
async fn enroll_snapshot_feeds_quote_map() {
    let api = Arc::new(RecordingApi::default());
    *api.snapshot.lock().unwrap() =
        vec![json!({"Uic": 211, "Quote": {"LastTraded": 12.5}})];

    let manager = manager(api.clone(), Arc::new(ManualClock::new()));
    manager.add(211).await.unwrap();

    assert_eq!(manager.latest(211).unwrap().last_price, 12.5);
}
