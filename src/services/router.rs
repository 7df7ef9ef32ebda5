//! Venue routing: parallel quote fan-out, best-venue selection, execution
//! and slippage validation.
//!
//! The router holds no persistence and never touches the event bus; failures
//! propagate upward as typed `ExecutionError`s for the worker to classify.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::services::venue::{ExecutionResult, Quote, Venue};

/// Hard wall-clock deadline for the quote fan-out
pub const QUOTE_DEADLINE: Duration = Duration::from_secs(5);

/// Hard wall-clock deadline for a single execution
pub const EXECUTE_DEADLINE: Duration = Duration::from_secs(10);

pub struct Router {
    venues: Vec<Arc<dyn Venue>>,
}

impl Router {
    pub fn new(venues: Vec<Arc<dyn Venue>>) -> Self {
        Self { venues }
    }

    pub fn venue_ids(&self) -> Vec<String> {
        self.venues.iter().map(|v| v.id().to_string()).collect()
    }

    /// Fetch quotes from every venue concurrently under one 5s deadline.
    ///
    /// Venues that time out or error are omitted; only an empty result is an
    /// error (`QuoteUnavailable`).
    pub async fn quotes(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
    ) -> Result<BTreeMap<String, Quote>, ExecutionError> {
        let requests = self.venues.iter().map(|venue| {
            let venue = venue.clone();
            let token_in = token_in.to_string();
            let token_out = token_out.to_string();
            async move {
                let id = venue.id().to_string();
                let result = tokio::time::timeout(
                    QUOTE_DEADLINE,
                    venue.get_quote(&token_in, &token_out, amount),
                )
                .await;
                match result {
                    Ok(Ok(quote)) => Some((id, quote)),
                    Ok(Err(err)) => {
                        warn!(venue = %id, error = %err, "Venue quote failed");
                        None
                    }
                    Err(_) => {
                        warn!(venue = %id, "Venue quote timed out");
                        None
                    }
                }
            }
        });

        let quotes: BTreeMap<String, Quote> =
            join_all(requests).await.into_iter().flatten().collect();

        if quotes.is_empty() {
            return Err(ExecutionError::QuoteUnavailable);
        }

        debug!(count = quotes.len(), "Collected venue quotes");
        Ok(quotes)
    }

    /// Pick the venue with the highest net-of-fee price.
    ///
    /// Ties break on lexicographic venue id, which the BTreeMap iteration
    /// order provides for free.
    pub fn select_best(quotes: &BTreeMap<String, Quote>) -> Result<(String, Quote), ExecutionError> {
        let mut best: Option<(&String, &Quote, Decimal)> = None;
        for (id, quote) in quotes {
            let net = quote.net_price();
            if best.as_ref().map(|(_, _, b)| net > *b).unwrap_or(true) {
                best = Some((id, quote, net));
            }
        }
        best.map(|(id, quote, _)| (id.clone(), quote.clone()))
            .ok_or(ExecutionError::QuoteUnavailable)
    }

    /// Execute against the chosen venue under the 10s deadline.
    pub async fn execute(
        &self,
        venue_id: &str,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
        expected_price: Decimal,
        slippage: Decimal,
    ) -> Result<ExecutionResult, ExecutionError> {
        let venue = self
            .venues
            .iter()
            .find(|v| v.id() == venue_id)
            .ok_or_else(|| ExecutionError::UnknownVenue(venue_id.to_string()))?;

        let started = std::time::Instant::now();
        tokio::time::timeout(
            EXECUTE_DEADLINE,
            venue.execute(token_in, token_out, amount, expected_price, slippage),
        )
        .await
        .map_err(|_| ExecutionError::VenueTimeout {
            venue: venue_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })?
    }

    /// Relative price deviation check: |expected − actual| / expected ≤ max.
    pub fn check_slippage(expected: Decimal, actual: Decimal, max_slippage: Decimal) -> bool {
        if expected.is_zero() {
            return false;
        }
        let deviation = (expected - actual).abs() / expected;
        deviation <= max_slippage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::venue::MockVenue;
    use rust_decimal_macros::dec;

    fn quote(venue: &str, price: Decimal, fee: Decimal) -> (String, Quote) {
        (
            venue.to_string(),
            Quote {
                venue: venue.to_string(),
                price,
                fee,
            },
        )
    }

    #[test]
    fn selects_highest_net_of_fee_price() {
        // alpha nets 99.7, beta nets 100.299
        let quotes: BTreeMap<_, _> = [
            quote("alpha", dec!(100), dec!(0.003)),
            quote("beta", dec!(100.5), dec!(0.002)),
        ]
        .into_iter()
        .collect();

        let (winner, best) = Router::select_best(&quotes).unwrap();
        assert_eq!(winner, "beta");
        assert_eq!(best.price, dec!(100.5));
    }

    #[test]
    fn fee_can_flip_the_raw_price_ordering() {
        let quotes: BTreeMap<_, _> = [
            quote("alpha", dec!(100), dec!(0.001)),
            quote("beta", dec!(100.2), dec!(0.02)),
        ]
        .into_iter()
        .collect();

        let (winner, _) = Router::select_best(&quotes).unwrap();
        assert_eq!(winner, "alpha");
    }

    #[test]
    fn ties_break_lexicographically() {
        let quotes: BTreeMap<_, _> = [
            quote("gamma", dec!(100), dec!(0.01)),
            quote("alpha", dec!(100), dec!(0.01)),
            quote("beta", dec!(100), dec!(0.01)),
        ]
        .into_iter()
        .collect();

        let (winner, _) = Router::select_best(&quotes).unwrap();
        assert_eq!(winner, "alpha");
    }

    #[test]
    fn slippage_boundary_is_inclusive() {
        assert!(Router::check_slippage(dec!(100), dec!(95), dec!(0.05)));
        assert!(!Router::check_slippage(dec!(100), dec!(94.9), dec!(0.05)));
        // S1 numbers: |100.5 - 100.2| / 100.5 = 0.002985... <= 0.05
        assert!(Router::check_slippage(dec!(100.5), dec!(100.2), dec!(0.05)));
        // S4 numbers: |100 - 95| / 100 = 0.05 > 0.001
        assert!(!Router::check_slippage(dec!(100), dec!(95), dec!(0.001)));
        // zero expected price can never pass
        assert!(!Router::check_slippage(dec!(0), dec!(1), dec!(0.5)));
    }

    #[tokio::test]
    async fn quotes_omit_failing_venues() {
        let alpha = Arc::new(MockVenue::new("alpha", dec!(100), dec!(0.003), Some(1)));
        let beta = Arc::new(MockVenue::new("beta", dec!(100.5), dec!(0.002), Some(2)));
        alpha.fail_next_quotes(1);

        let router = Router::new(vec![alpha, beta]);
        let quotes = router.quotes("SOL", "USDC", dec!(1)).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert!(quotes.contains_key("beta"));
    }

    #[tokio::test]
    async fn quotes_error_only_when_all_venues_fail() {
        let alpha = Arc::new(MockVenue::new("alpha", dec!(100), dec!(0.003), Some(1)));
        alpha.fail_next_quotes(1);

        let router = Router::new(vec![alpha]);
        let err = router.quotes("SOL", "USDC", dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::QuoteUnavailable));
    }

    #[tokio::test]
    async fn execute_rejects_unknown_venue() {
        let router = Router::new(vec![]);
        let err = router
            .execute("omega", "SOL", "USDC", dec!(1), dec!(100), dec!(0.05))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownVenue(_)));
    }
}
