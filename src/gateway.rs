// ===============================
// src/gateway.rs (mirror venue interface + paper venue)
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::domain::{CloseFill, OpenFill, PositionKey, Ticket};
use crate::errors::VenueError;

/// Live view of and write access to the mirror terminal. Reads are never
/// cached by the engine; every pass asks again.
#[async_trait]
pub trait MirrorVenue: Send + Sync {
    /// Total open lots for the key, summed over all of our tickets.
    async fn observed_lots(&self, key: &PositionKey) -> Result<Decimal, VenueError>;
    /// Our tickets for the key, arbitrary order.
    async fn list_tickets(&self, key: &PositionKey) -> Result<Vec<Ticket>, VenueError>;
    /// Every key where we currently hold nonzero lots.
    async fn exposed_keys(&self) -> Result<Vec<PositionKey>, VenueError>;
    /// Market open.
    async fn open(&self, key: &PositionKey, lots: Decimal) -> Result<OpenFill, VenueError>;
    /// Market close of (part of) one ticket.
    async fn close(&self, key: &PositionKey, ticket_id: u64, lots: Decimal) -> Result<CloseFill, VenueError>;
}

#[derive(Debug, Clone)]
struct PaperTicket {
    id: u64,
    lots: Decimal,
    magic: u64,
}

/// In-memory mirror terminal: fills at the current paper quote after
/// `fill_delay`. Only tickets carrying `magic` are visible to the engine.
pub struct PaperVenue {
    magic: u64,
    fill_delay: Duration,
    price_walk: bool,
    default_quote: Decimal,
    tickets: Mutex<HashMap<PositionKey, Vec<PaperTicket>>>,
    quotes: Mutex<HashMap<String, Option<Decimal>>>,
    close_cap: Mutex<Option<Decimal>>,
    reject_next: AtomicU32,
    offline: AtomicBool,
    next_ticket: AtomicU64,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
}

impl PaperVenue {
    pub fn new(magic: u64, fill_delay: Duration) -> Self {
        Self {
            magic,
            fill_delay,
            price_walk: false,
            default_quote: dec!(100),
            tickets: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            close_cap: Mutex::new(None),
            reject_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
            open_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
        }
    }

    /// Random-walk the quotes a few cents per fill (demo mode).
    pub fn with_price_walk(mut self) -> Self {
        self.price_walk = true;
        self
    }

    pub fn set_quote(&self, instrument: &str, price: Option<Decimal>) {
        self.quotes.lock().insert(instrument.to_string(), price);
    }

    /// The next `n` open/close submissions are rejected.
    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// While offline every call fails with a transport error, as if the
    /// terminal connection dropped.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Caps the lots any single close call actually closes.
    pub fn cap_closes(&self, cap: Option<Decimal>) {
        *self.close_cap.lock() = cap;
    }

    /// Places a ticket directly, as if opened outside the engine.
    pub fn seed_ticket(&self, key: &PositionKey, lots: Decimal, magic: u64) -> u64 {
        let id = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.tickets.lock().entry(key.clone()).or_default().push(PaperTicket { id, lots, magic });
        id
    }

    pub fn open_calls(&self) -> u32 { self.open_calls.load(Ordering::SeqCst) }

    pub fn close_calls(&self) -> u32 { self.close_calls.load(Ordering::SeqCst) }

    fn ours<'a>(&self, tickets: &'a [PaperTicket]) -> impl Iterator<Item = &'a PaperTicket> + 'a {
        let magic = self.magic;
        tickets.iter().filter(move |t| t.magic == magic && t.lots > Decimal::ZERO)
    }

    fn quote(&self, instrument: &str) -> Result<Decimal, VenueError> {
        let mut quotes = self.quotes.lock();
        let slot = quotes.entry(instrument.to_string()).or_insert(Some(self.default_quote));
        let px = slot.ok_or_else(|| VenueError::QuoteUnavailable(instrument.to_string()))?;
        if self.price_walk {
            // jangan simpan ThreadRng melewati .await
            let step = Decimal::new(rand::thread_rng().gen_range(-3..=3), 2);
            *slot = Some((px + step).max(dec!(0.01)));
        }
        Ok(px)
    }

    fn link(&self) -> Result<(), VenueError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(VenueError::Transport("paper: terminal offline".into()));
        }
        Ok(())
    }

    fn take_rejection(&self) -> bool {
        self.reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MirrorVenue for PaperVenue {
    async fn observed_lots(&self, key: &PositionKey) -> Result<Decimal, VenueError> {
        self.link()?;
        let tickets = self.tickets.lock();
        Ok(tickets.get(key).map(|ts| self.ours(ts).map(|t| t.lots).sum::<Decimal>()).unwrap_or(Decimal::ZERO))
    }

    async fn list_tickets(&self, key: &PositionKey) -> Result<Vec<Ticket>, VenueError> {
        self.link()?;
        let tickets = self.tickets.lock();
        Ok(tickets
            .get(key)
            .map(|ts| self.ours(ts).map(|t| Ticket { ticket_id: t.id, lots: t.lots }).collect())
            .unwrap_or_default())
    }

    async fn exposed_keys(&self) -> Result<Vec<PositionKey>, VenueError> {
        self.link()?;
        let tickets = self.tickets.lock();
        let mut keys: Vec<PositionKey> = tickets
            .iter()
            .filter(|(_, ts)| self.ours(ts).next().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn open(&self, key: &PositionKey, lots: Decimal) -> Result<OpenFill, VenueError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.link()?;
        let price = self.quote(&key.instrument)?;
        if self.take_rejection() {
            return Err(VenueError::Rejected("paper: rejection injected".into()));
        }
        sleep(self.fill_delay).await;

        let id = self.seed_ticket(key, lots, self.magic);
        info!(%key, %lots, %price, ticket = id, "paper OPEN filled");
        Ok(OpenFill { ticket_id: id, filled_lots: lots, price })
    }

    async fn close(&self, key: &PositionKey, ticket_id: u64, lots: Decimal) -> Result<CloseFill, VenueError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.link()?;
        let price = self.quote(&key.instrument)?;
        if self.take_rejection() {
            return Err(VenueError::Rejected("paper: rejection injected".into()));
        }
        sleep(self.fill_delay).await;

        let cap = *self.close_cap.lock();
        let mut tickets = self.tickets.lock();
        let list = tickets.get_mut(key).ok_or_else(|| VenueError::Rejected(format!("no position for {key}")))?;
        let t = list
            .iter_mut()
            .find(|t| t.id == ticket_id && t.magic == self.magic)
            .ok_or_else(|| VenueError::Rejected(format!("unknown ticket {ticket_id}")))?;

        let mut closed = lots.min(t.lots);
        if let Some(cap) = cap {
            closed = closed.min(cap);
        }
        t.lots -= closed;
        list.retain(|t| t.lots > Decimal::ZERO);
        if list.is_empty() {
            tickets.remove(key);
        }
        debug!(%key, ticket = ticket_id, %closed, "paper CLOSE filled");
        Ok(CloseFill { closed_lots: closed, price })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PosSide;

    fn key() -> PositionKey { PositionKey::new("BTC", PosSide::Long) }

    #[tokio::test]
    async fn open_then_observe_then_close() {
        let v = PaperVenue::new(7, Duration::ZERO);
        let fill = v.open(&key(), dec!(0.03)).await.unwrap();
        assert_eq!(fill.filled_lots, dec!(0.03));
        assert_eq!(v.observed_lots(&key()).await.unwrap(), dec!(0.03));

        let c = v.close(&key(), fill.ticket_id, dec!(0.01)).await.unwrap();
        assert_eq!(c.closed_lots, dec!(0.01));
        assert_eq!(v.observed_lots(&key()).await.unwrap(), dec!(0.02));

        v.close(&key(), fill.ticket_id, dec!(5)).await.unwrap();
        assert!(v.exposed_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_tickets_are_invisible() {
        let v = PaperVenue::new(7, Duration::ZERO);
        v.seed_ticket(&key(), dec!(1), 99);
        assert_eq!(v.observed_lots(&key()).await.unwrap(), dec!(0));
        assert!(v.list_tickets(&key()).await.unwrap().is_empty());
        assert!(v.exposed_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_quote_and_injected_rejection() {
        let v = PaperVenue::new(7, Duration::ZERO);
        v.set_quote("BTC", None);
        assert!(matches!(v.open(&key(), dec!(1)).await, Err(VenueError::QuoteUnavailable(_))));
        v.set_quote("BTC", Some(dec!(50)));
        v.reject_next(1);
        assert!(matches!(v.open(&key(), dec!(1)).await, Err(VenueError::Rejected(_))));
        assert_eq!(v.open(&key(), dec!(1)).await.unwrap().price, dec!(50));
    }

    #[tokio::test]
    async fn offline_terminal_fails_with_transport_error() {
        let v = PaperVenue::new(7, Duration::ZERO);
        v.set_offline(true);
        let err = v.observed_lots(&key()).await.unwrap_err();
        assert!(matches!(err, VenueError::Transport(_)));
        assert!(err.is_retryable());
        assert!(v.open(&key(), dec!(1)).await.is_err());
        v.set_offline(false);
        assert_eq!(v.observed_lots(&key()).await.unwrap(), dec!(0));
    }
}
