//! Orchestration: builds the component graph, runs the periodic tasks, and
//! handles signal-driven shutdown.
//!
//! Four periodic tasks share the world: the scanner (universe sweep), the
//! stream processor (quote ticks into the strategy), the janitor (stale
//! subscription pruning), and the reporter (health lines). A fifth task
//! supervises the websocket. Slow REST work runs behind a small semaphore so
//! the interval tasks stay responsive.

use crate::application::audit::ProfitAuditor;
use crate::application::executor::OrderExecutor;
use crate::application::reporter::HealthReporter;
use crate::application::scanner::MarketScanner;
use crate::application::strategy::{StrategyParams, TrendFollower};
use crate::config::Config;
use crate::domain::ports::{CostOracle, StateStore, SubscriptionApi, SystemClock};
use crate::domain::types::{ActiveUniverse, OrderKind, Uic};
use crate::infrastructure::auth::TokenSource;
use crate::infrastructure::gateway::SaxoGateway;
use crate::infrastructure::persistence::{
    ACTIVE_UNIVERSE_KEY, MemoryStateStore, RedisStateStore,
};
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::infrastructure::streaming::StreamingManager;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const STREAM_PROCESS_INTERVAL: Duration = Duration::from_millis(100);
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
/// Bound on concurrent slow REST work (scanner sweeps, pruning).
const WORKER_POOL_SIZE: usize = 5;
/// How long shutdown waits for tasks to acknowledge before exiting anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Trader {
    config: Config,
    store: Arc<dyn StateStore>,
    limiter: Arc<RateLimiter>,
    gateway: Arc<SaxoGateway>,
    streaming: Arc<StreamingManager>,
    executor: Arc<OrderExecutor>,
    reporter: Arc<HealthReporter>,
    strategy: Arc<Mutex<TrendFollower>>,
}

impl Trader {
    /// Wire the component graph and verify authentication. A failed token
    /// refresh here is fatal; the process should exit nonzero.
    pub async fn build(config: Config) -> Result<Self> {
        info!(
            "Building trader (mode: {})...",
            if config.dry_run { "SIMULATION" } else { "REAL MONEY" }
        );

        let store: Arc<dyn StateStore> = match config.broker.redis_url.as_deref() {
            Some(url) => Arc::new(RedisStateStore::connect(url).await?),
            None => {
                warn!("REDIS_URL not set, state will not survive restarts");
                Arc::new(MemoryStateStore::new())
            }
        };

        let auth = Arc::new(TokenSource::new(config.auth.clone(), store.clone()));
        auth.bearer()
            .await
            .context("Authentication failed at startup")?;

        let clock = Arc::new(SystemClock);
        let limiter = Arc::new(RateLimiter::new(
            config.broker.rate_limit,
            Duration::from_secs(config.broker.rate_window_secs),
            clock.clone(),
        ));
        let gateway = Arc::new(SaxoGateway::new(
            config.broker.base_url.clone(),
            auth.clone(),
            limiter.clone(),
        ));
        let streaming = Arc::new(StreamingManager::new(
            config.broker.ws_url.clone(),
            gateway.clone() as Arc<dyn SubscriptionApi>,
            auth.clone(),
            clock,
        ));

        let auditor = ProfitAuditor::new(
            gateway.clone() as Arc<dyn CostOracle>,
            config.strategy.account_currency.clone(),
        );
        let params = StrategyParams {
            short_period: config.strategy.short_period,
            long_period: config.strategy.long_period,
            history_cap: config.strategy.history_cap,
            stop_loss_pct: config.strategy.stop_loss_pct,
            trade_quantity: config.strategy.trade_quantity,
            instrument_currency: config.strategy.instrument_currency.clone(),
        };
        let mut strategy = TrendFollower::new(params, auditor, store.clone());
        strategy.restore().await?;

        let executor = Arc::new(OrderExecutor::new(
            gateway.clone(),
            limiter.clone(),
            config.dry_run,
        ));

        Ok(Self {
            config,
            store,
            limiter,
            gateway,
            streaming,
            executor,
            reporter: Arc::new(HealthReporter::new()),
            strategy: Arc::new(Mutex::new(strategy)),
        })
    }

    /// Direct access to the emergency flatten, for the CLI flag.
    pub async fn kill_switch(&self) {
        self.executor.kill_switch().await;
    }

    /// Run until SIGINT/SIGTERM. Clean shutdown persists open positions and
    /// gives every task a short grace period to acknowledge.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let pool = Arc::new(Semaphore::new(WORKER_POOL_SIZE));

        tokio::spawn(async move {
            wait_for_signal().await;
            error!("CRITICAL: shutdown signal received");
            let _ = shutdown_tx.send(false);
        });

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(tokio::spawn(
            self.streaming
                .clone()
                .run(self.config.watchlist.clone(), shutdown_rx.clone()),
        ));
        handles.push(self.spawn_scanner(shutdown_rx.clone(), pool.clone()));
        handles.push(self.spawn_stream_processor(shutdown_rx.clone()));
        handles.push(self.spawn_janitor(shutdown_rx.clone(), pool.clone()));
        handles.push(self.spawn_reporter(shutdown_rx.clone()));

        info!("Trader is running. Send SIGINT/SIGTERM to stop.");

        let mut shutdown = shutdown_rx;
        while *shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        warn!("Shutting down...");
        {
            let strategy = self.strategy.lock().await;
            strategy.persist_all().await;
            self.reporter.log_health(&strategy.snapshot());
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                "Tasks did not acknowledge shutdown within {}s, exiting anyway",
                SHUTDOWN_GRACE.as_secs()
            );
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn spawn_scanner(
        &self,
        mut shutdown: watch::Receiver<bool>,
        pool: Arc<Semaphore>,
    ) -> JoinHandle<()> {
        let mut scanner = MarketScanner::new(
            self.gateway.clone(),
            self.limiter.clone(),
            self.streaming.clone(),
            self.config.scanner.clone(),
            self.config.watchlist.clone(),
        );
        let store = self.store.clone();
        let streaming = self.streaming.clone();
        let strategy = self.strategy.clone();
        let interval = Duration::from_secs(self.config.scanner.scan_interval_secs);

        tokio::spawn(async move {
            info!("Market scanner started (interval: {}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        let _permit = pool.acquire().await.expect("worker pool closed");
                        scanner.scan().await;
                        publish_universe(&store, &streaming, &strategy).await;
                    }
                }
            }
            info!("Market scanner stopped");
        })
    }

    fn spawn_stream_processor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let streaming = self.streaming.clone();
        let strategy = self.strategy.clone();
        let executor = self.executor.clone();
        let reporter = self.reporter.clone();
        let store = self.store.clone();
        let dry_run = self.config.dry_run;
        let quantity = self.config.strategy.trade_quantity;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STREAM_PROCESS_INTERVAL);
            let mut last_seen: HashMap<Uic, Instant> = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        // Snapshot: UICs added mid-iteration are seen next cycle.
                        for uic in streaming.watched() {
                            let Some(quote) = streaming.latest(uic) else { continue };
                            if last_seen.get(&uic) == Some(&quote.updated_at) {
                                continue;
                            }
                            last_seen.insert(uic, quote.updated_at);

                            let (prev_peak, signal, new_peak) = {
                                let mut strategy = strategy.lock().await;
                                let prev_peak = strategy.peak_of(uic);
                                let signal = strategy.update(uic, quote.last_price).await;
                                (prev_peak, signal, strategy.peak_of(uic))
                            };

                            if let (Some(prev), Some(new)) = (prev_peak, new_peak) {
                                if new > prev {
                                    warn!(uic, "PEAK DETECTED: new high {new:.2}");
                                }
                            }

                            let Some(side) = signal else { continue };
                            error!(
                                uic,
                                "CRITICAL: trade signal {side} @ {}", quote.last_price
                            );

                            if dry_run {
                                reporter.log_simulation_trade(
                                    side,
                                    uic,
                                    quote.last_price,
                                    "strategy signal (dry run)",
                                );
                            } else if executor
                                .place(uic, quantity, side, OrderKind::Market, None, "Stock")
                                .await
                            {
                                error!(uic, "CRITICAL: execution success {side}");
                            } else {
                                error!(uic, "Execution failed {side}");
                            }

                            // A signal means the owned set changed.
                            publish_universe(&store, &streaming, &strategy).await;
                        }
                    }
                }
            }
            info!("Stream processor stopped");
        })
    }

    fn spawn_janitor(
        &self,
        mut shutdown: watch::Receiver<bool>,
        pool: Arc<Semaphore>,
    ) -> JoinHandle<()> {
        let streaming = self.streaming.clone();
        let strategy = self.strategy.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            // Nothing can be stale yet; skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        let _permit = pool.acquire().await.expect("worker pool closed");
                        let safe: HashSet<Uic> =
                            strategy.lock().await.owned().into_iter().collect();
                        let removed = streaming.prune(&safe).await;
                        if !removed.is_empty() {
                            publish_universe(&store, &streaming, &strategy).await;
                        }
                    }
                }
            }
            info!("Janitor stopped");
        })
    }

    fn spawn_reporter(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reporter = self.reporter.clone();
        let strategy = self.strategy.clone();

        tokio::spawn(async move {
            let mut health = tokio::time::interval(HEALTH_INTERVAL);
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() { break; }
                    }
                    _ = health.tick() => {
                        let positions = strategy.lock().await.snapshot();
                        reporter.log_health(&positions);
                    }
                    _ = heartbeat.tick() => {
                        info!("[heartbeat] System healthy, connection stable");
                    }
                }
            }
            info!("Reporter stopped");
        })
    }
}

/// Mirror the watched/owned view to the state store.
async fn publish_universe(
    store: &Arc<dyn StateStore>,
    streaming: &Arc<StreamingManager>,
    strategy: &Arc<Mutex<TrendFollower>>,
) {
    let owned = strategy.lock().await.owned();
    let view = ActiveUniverse::new(streaming.watched(), owned);

    match serde_json::to_string(&view) {
        Ok(json) => {
            if let Err(e) = store.set(ACTIVE_UNIVERSE_KEY, &json).await {
                error!("Failed to publish active universe: {e:#}");
            }
        }
        Err(e) => error!("Could not serialize active universe: {e}"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
