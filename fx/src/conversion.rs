//! Currency conversion types and operations.

use chrono::NaiveDate;
use ratelink_common::{Currency, CurrencyPair, Money, RateKey};
use rust_decimal::Decimal;
use tracing::debug;

use crate::cache::RateCache;
use crate::error::FxResult;

/// Represents a completed currency conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    /// Input amount.
    pub input: Money,
    /// Output amount, rounded to the target currency.
    pub output: Money,
    /// Rate used for conversion.
    pub rate: Decimal,
    /// Key the rate was looked up under.
    pub rate_key: RateKey,
}

impl Conversion {
    /// Convert `input` into `target` at the rate for `date`.
    ///
    /// Converting into the input's own currency uses a rate of one and
    /// never touches the cache.
    pub async fn execute(
        cache: &RateCache,
        input: Money,
        target: Currency,
        date: NaiveDate,
    ) -> FxResult<Self> {
        let pair = CurrencyPair::new(input.currency.clone(), target);
        let rate_key = RateKey::new(pair, date);

        let rate = if rate_key.pair.is_identity() {
            Decimal::ONE
        } else {
            cache.get(&rate_key).await?
        };

        let output = input.convert(&rate_key.pair, rate)?;
        debug!(input = %input, output = %output, rate = %rate, "Converted amount");

        Ok(Self {
            input,
            output,
            rate,
            rate_key,
        })
    }
}
