//! Execution venue interface and the in-process simulator.
//!
//! A venue answers quote requests and executes orders. The simulator
//! produces prices with bounded variance around a base price and sleeps for
//! a bounded random latency; with a seed it is fully deterministic, which is
//! how tests pin scenario outcomes.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ExecutionError;

/// A venue's answer to a quote request
#[derive(Debug, Clone)]
pub struct Quote {
    pub venue: String,
    pub price: Decimal,
    pub fee: Decimal,
}

impl Quote {
    /// Net price after the venue fee, the routing comparison key.
    pub fn net_price(&self) -> Decimal {
        self.price * (Decimal::ONE - self.fee)
    }
}

/// A venue's execution receipt
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub tx_hash: String,
    pub executed_price: Decimal,
}

#[async_trait]
pub trait Venue: Send + Sync {
    fn id(&self) -> &str;

    /// Must complete or error within the router's 5s quote deadline.
    async fn get_quote(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
    ) -> Result<Quote, ExecutionError>;

    /// Must complete or error within the router's 10s execute deadline.
    async fn execute(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
        expected_price: Decimal,
        slippage: Decimal,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Simulated venue with bounded latency and price variance.
pub struct MockVenue {
    id: String,
    base_price: Decimal,
    fee: Decimal,
    /// Price variance around the base/expected price, in basis points
    variance_bps: i64,
    latency: (u64, u64),
    rng: Mutex<StdRng>,
    fail_quotes: AtomicU32,
    fail_executes: AtomicU32,
    executed_price_override: Mutex<Option<Decimal>>,
}

impl MockVenue {
    pub fn new(id: &str, base_price: Decimal, fee: Decimal, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            id: id.to_string(),
            base_price,
            fee,
            variance_bps: 50,
            latency: (5, 25),
            rng: Mutex::new(rng),
            fail_quotes: AtomicU32::new(0),
            fail_executes: AtomicU32::new(0),
            executed_price_override: Mutex::new(None),
        }
    }

    /// Override the price variance; zero pins quotes to the base price.
    pub fn with_variance_bps(mut self, bps: i64) -> Self {
        self.variance_bps = bps;
        self
    }

    /// Fail the next `n` quote requests with a transport error.
    pub fn fail_next_quotes(&self, n: u32) {
        self.fail_quotes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` executions with a transport error.
    pub fn fail_next_executes(&self, n: u32) {
        self.fail_executes.store(n, Ordering::SeqCst);
    }

    /// Pin the executed price, overriding the jittered fill.
    pub fn set_executed_price(&self, price: Decimal) {
        *self.executed_price_override.lock() = Some(price);
    }

    fn jitter(&self, around: Decimal) -> Decimal {
        let bps = self
            .rng
            .lock()
            .gen_range(-self.variance_bps..=self.variance_bps);
        around * (Decimal::ONE + Decimal::new(bps, 4))
    }

    async fn simulate_latency(&self) {
        let (lo, hi) = self.latency;
        let ms = self.rng.lock().gen_range(lo..=hi);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Venue for MockVenue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_quote(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount: Decimal,
    ) -> Result<Quote, ExecutionError> {
        self.simulate_latency().await;

        if Self::take_failure(&self.fail_quotes) {
            return Err(ExecutionError::VenueTransport {
                venue: self.id.clone(),
                reason: "simulated quote failure".to_string(),
            });
        }

        Ok(Quote {
            venue: self.id.clone(),
            price: self.jitter(self.base_price),
            fee: self.fee,
        })
    }

    async fn execute(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount: Decimal,
        expected_price: Decimal,
        _slippage: Decimal,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.simulate_latency().await;

        if Self::take_failure(&self.fail_executes) {
            return Err(ExecutionError::VenueTransport {
                venue: self.id.clone(),
                reason: "simulated execution failure".to_string(),
            });
        }

        let pinned = *self.executed_price_override.lock();
        let executed_price = pinned.unwrap_or_else(|| self.jitter(expected_price));

        Ok(ExecutionResult {
            tx_hash: format!("0x{}", Uuid::new_v4().simple()),
            executed_price,
        })
    }
}
