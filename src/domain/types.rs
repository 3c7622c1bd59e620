use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Universal Instrument Code: the broker's integer key for a tradable symbol.
pub type Uic = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Wire spelling expected by the broker's `BuySell` order field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "Market",
            OrderKind::Limit => "Limit",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest observed price for one instrument.
///
/// `updated_at` is monotonic so the stream processor can detect duplicate
/// ticks without trusting broker timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub uic: Uic,
    pub last_price: f64,
    pub updated_at: Instant,
}

/// One open long position, persisted to the state store on every mutation.
///
/// Invariants: `quantity > 0` and `peak_price >= entry_price` while held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub uic: Uic,
    pub entry_price: f64,
    pub quantity: f64,
    pub peak_price: f64,
}

impl Position {
    pub fn open(uic: Uic, entry_price: f64, quantity: f64) -> Self {
        Self {
            uic,
            entry_price,
            quantity,
            peak_price: entry_price,
        }
    }
}

/// Ledger record for one enrolled streaming subscription.
///
/// `reference_id` is unique per process lifetime; `context_id` matches the
/// websocket session the subscription was created under.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub uic: Uic,
    pub reference_id: String,
    pub context_id: String,
    pub created_at: Instant,
}

/// Snapshot of what the bot is watching and holding, mirrored to the state
/// store on every change for external observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUniverse {
    pub watched: Vec<Uic>,
    pub owned: Vec<Uic>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ActiveUniverse {
    pub fn new(mut watched: Vec<Uic>, mut owned: Vec<Uic>) -> Self {
        watched.sort_unstable();
        owned.sort_unstable();
        Self {
            watched,
            owned,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_wire_spelling() {
        assert_eq!(Side::Buy.as_str(), "Buy");
        assert_eq!(Side::Sell.as_str(), "Sell");
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_position_round_trip() {
        let pos = Position {
            uic: 211,
            entry_price: 12.34,
            quantity: 10.0,
            peak_price: 13.01,
        };

        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(pos, back);
    }

    #[test]
    fn test_open_position_peak_starts_at_entry() {
        let pos = Position::open(42, 5.5, 10.0);
        assert_eq!(pos.peak_price, pos.entry_price);
    }

    #[test]
    fn test_active_universe_sorted() {
        let view = ActiveUniverse::new(vec![30, 10, 20], vec![20]);
        assert_eq!(view.watched, vec![10, 20, 30]);
        assert_eq!(view.owned, vec![20]);
    }
}
