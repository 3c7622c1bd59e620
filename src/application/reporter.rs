//! Health reporting. Pure observer: snapshots in, log lines out.

use crate::domain::types::{Position, Side, Uic};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::info;

pub struct HealthReporter {
    system: Mutex<System>,
    pid: Pid,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// One line of process and position health: CPU %, RSS, and the
    /// entry/peak pair for every open position.
    pub fn log_health(&self, positions: &[Position]) {
        let (cpu_pct, rss_mb) = {
            let mut system = self.system.lock().expect("reporter sysinfo");
            system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
            system
                .process(self.pid)
                .map(|process| {
                    (
                        process.cpu_usage(),
                        process.memory() as f64 / 1024.0 / 1024.0,
                    )
                })
                .unwrap_or((0.0, 0.0))
        };

        let tracking: Vec<String> = positions
            .iter()
            .map(|p| format!("uic:{} entry:{} peak:{}", p.uic, p.entry_price, p.peak_price))
            .collect();

        info!(
            "HEALTH CHECK | cpu: {cpu_pct:.1}% | rss: {rss_mb:.1}MB | open positions: {} | {}",
            positions.len(),
            tracking.join(", ")
        );
    }

    /// Record a trade decision that dry-run mode kept off the wire.
    pub fn log_simulation_trade(&self, side: Side, uic: Uic, price: f64, reason: &str) {
        info!("[dry run] Would have {side} {uic} @ {price}. Reason: {reason}");
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}
