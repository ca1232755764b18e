//! `PricingPolicy`: the six-step entry/hedge pricing algorithm (spec.md
//! §4.4), operating on `Decimal` throughout for exact tick alignment —
//! a deliberate deviation from the teacher's `f64` pricing (see DESIGN.md).

use crate::config::MaxSizeMode;
use crate::domain::{Market, Side};
use crate::error::PricingError;
use crate::signal::Bias;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct PricingInput {
    pub bias: Bias,
    pub confidence: f64,
    pub available_balance: Decimal,
    pub best_bid_up: Option<Decimal>,
    pub best_bid_down: Option<Decimal>,
    pub tick_size: Decimal,
    pub combined_cap: Decimal,
    pub max_size_mode: MaxSizeMode,
    pub max_size: Decimal,
    pub bet_percent: Decimal,
    pub scaling_factor: Decimal,
    pub min_order_size: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub entry_side: Side,
    pub hedge_side: Side,
    pub entry_price: Decimal,
    pub hedge_price: Decimal,
    pub size: Decimal,
}

pub struct PricingPolicy;

impl PricingPolicy {
    pub fn plan(market: &Market, input: &PricingInput) -> Result<EntryPlan, PricingError> {
        let entry_side = match input.bias {
            Bias::Up => Side::Up,
            Bias::Down => Side::Down,
            Bias::Neutral => return Err(PricingError::NoMarket),
        };
        let hedge_side = entry_side.opposite();
        let _ = market;

        let entry_price = bid_for(entry_side, input).ok_or(PricingError::NoMarket)?;

        let hedge_bid = bid_for(hedge_side, input).ok_or(PricingError::NoMarket)?;
        let cap_headroom = input.combined_cap - entry_price;
        let hedge_price = round_down_to_tick(hedge_bid.min(cap_headroom), input.tick_size);

        if entry_price + hedge_price > input.combined_cap {
            return Err(PricingError::NotProfitable {
                combined: to_f64(entry_price + hedge_price),
                cap: to_f64(input.combined_cap),
            });
        }

        let base_bet = input.available_balance * input.bet_percent;
        let confidence = Decimal::from_f64_retain(input.confidence).unwrap_or(Decimal::ZERO);
        let scaled = base_bet * (Decimal::ONE + confidence * input.scaling_factor);
        if entry_price <= Decimal::ZERO {
            return Err(PricingError::NoMarket);
        }
        let scaled_shares = scaled / entry_price;

        let size = match input.max_size_mode {
            MaxSizeMode::Cap => scaled_shares.min(input.max_size),
            MaxSizeMode::Maximize => {
                let max_affordable = input.available_balance / entry_price;
                scaled_shares.max(input.max_size).min(max_affordable)
            }
        };

        if size < input.min_order_size {
            return Err(PricingError::BelowMin {
                size: to_f64(size),
                min: to_f64(input.min_order_size),
            });
        }

        Ok(EntryPlan {
            entry_side,
            hedge_side,
            entry_price,
            hedge_price,
            size,
        })
    }
}

fn bid_for(side: Side, input: &PricingInput) -> Option<Decimal> {
    match side {
        Side::Up => input.best_bid_up,
        Side::Down => input.best_bid_down,
    }
}

/// Floors `value` to the nearest multiple of `tick`. Used for the hedge leg
/// and for sell prices — the tie-break direction is always the one that
/// keeps the combined price under the cap.
pub fn round_down_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).floor() * tick
}

pub fn round_up_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).ceil() * tick
}

fn to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn market() -> Market {
        Market {
            symbol: "BTC".into(),
            window_start: Utc::now(),
            window_end: Utc::now() + chrono::Duration::minutes(15),
            up_token: crate::domain::Token("up".into()),
            down_token: crate::domain::Token("down".into()),
            tick_size: dec!(0.01),
        }
    }

    fn base_input() -> PricingInput {
        PricingInput {
            bias: Bias::Up,
            confidence: 0.5,
            available_balance: dec!(1000),
            best_bid_up: Some(dec!(0.40)),
            best_bid_down: Some(dec!(0.55)),
            tick_size: dec!(0.01),
            combined_cap: dec!(0.99),
            max_size_mode: MaxSizeMode::Cap,
            max_size: dec!(1000),
            bet_percent: dec!(0.05),
            scaling_factor: dec!(1.0),
            min_order_size: dec!(5.0),
        }
    }

    #[test]
    fn rejects_neutral_bias_as_no_market() {
        let mut input = base_input();
        input.bias = Bias::Neutral;
        let err = PricingPolicy::plan(&market(), &input).unwrap_err();
        assert!(matches!(err, PricingError::NoMarket));
    }

    #[test]
    fn rejects_missing_entry_bid() {
        let mut input = base_input();
        input.best_bid_up = None;
        let err = PricingPolicy::plan(&market(), &input).unwrap_err();
        assert!(matches!(err, PricingError::NoMarket));
    }

    #[test]
    fn hedge_price_floors_to_tick_and_respects_cap_headroom() {
        let mut input = base_input();
        input.best_bid_down = Some(dec!(0.60));
        let plan = PricingPolicy::plan(&market(), &input).unwrap();
        assert_eq!(plan.entry_price, dec!(0.40));
        assert_eq!(plan.hedge_price, dec!(0.59));
        assert!(plan.entry_price + plan.hedge_price <= input.combined_cap);
    }

    #[test]
    fn rejects_when_combined_exceeds_cap() {
        let mut input = base_input();
        input.best_bid_up = Some(dec!(0.60));
        input.best_bid_down = Some(dec!(0.60));
        input.combined_cap = dec!(0.99);
        let err = PricingPolicy::plan(&market(), &input).unwrap_err();
        assert!(matches!(err, PricingError::NotProfitable { .. }));
    }

    #[test]
    fn rejects_size_below_minimum() {
        let mut input = base_input();
        input.available_balance = dec!(10);
        input.bet_percent = dec!(0.01);
        let err = PricingPolicy::plan(&market(), &input).unwrap_err();
        assert!(matches!(err, PricingError::BelowMin { .. }));
    }

    #[test]
    fn cap_mode_limits_to_max_size() {
        let mut input = base_input();
        input.max_size = dec!(10);
        input.available_balance = dec!(100000);
        let plan = PricingPolicy::plan(&market(), &input).unwrap();
        assert_eq!(plan.size, dec!(10));
    }

    #[test]
    fn maximize_mode_bounds_by_available_balance() {
        let mut input = base_input();
        input.max_size_mode = MaxSizeMode::Maximize;
        input.max_size = dec!(10000);
        input.available_balance = dec!(40);
        let plan = PricingPolicy::plan(&market(), &input).unwrap();
        let max_affordable = input.available_balance / plan.entry_price;
        assert_eq!(plan.size, max_affordable);
    }

    #[test]
    fn round_down_to_tick_floors_correctly() {
        assert_eq!(round_down_to_tick(dec!(0.567), dec!(0.01)), dec!(0.56));
        assert_eq!(round_down_to_tick(dec!(0.56), dec!(0.01)), dec!(0.56));
    }

    #[test]
    fn round_up_to_tick_ceils_correctly() {
        assert_eq!(round_up_to_tick(dec!(0.561), dec!(0.01)), dec!(0.57));
        assert_eq!(round_up_to_tick(dec!(0.56), dec!(0.01)), dec!(0.56));
    }
}
