//! `PreSettlementOptimizer` (spec.md §4.9): while holding both legs FILLED,
//! periodically re-checks the signal during the pre-resolution window and,
//! if it flips strongly enough, sells the now-losing leg early to recover
//! residual value instead of letting it resolve to zero.

use crate::config::PreSettlementConfig;
use crate::domain::Side;
use crate::liquidator::{EmergencyLiquidator, LiquidationOutcome, LiquidationProgressSink};
use crate::signal::{Bias, Signal};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerDecision {
    KeepBoth,
    SellLosingLeg {
        losing_side: Side,
        outcome: LiquidationOutcome,
    },
}

pub struct PreSettlementOptimizer<'a> {
    config: &'a PreSettlementConfig,
}

impl<'a> PreSettlementOptimizer<'a> {
    pub fn new(config: &'a PreSettlementConfig) -> Self {
        Self { config }
    }

    /// `true` while `now` is inside `[windowEnd - startSec, windowEnd - stopSec]`.
    pub fn is_in_window(&self, now: DateTime<Utc>, window_end: DateTime<Utc>) -> bool {
        if !self.config.enable {
            return false;
        }
        let start = window_end - chrono::Duration::seconds(self.config.start_sec);
        let stop = window_end - chrono::Duration::seconds(self.config.stop_sec);
        now >= start && now <= stop
    }

    /// Decides whether to sell the losing leg based on the latest signal.
    /// Both legs are held at this point (spec.md §4.9 only runs when both
    /// FILLED), so the losing leg is simply the side opposite the bias.
    /// Does not itself invoke the liquidator — callers fetch the decision,
    /// then drive `EmergencyLiquidator` so this stays free of I/O.
    pub fn decide(&self, signal: Signal) -> Decision {
        if signal.confidence < self.config.min_confidence {
            return Decision::KeepBoth;
        }
        let bias_side = match signal.bias {
            Bias::Up => Side::Up,
            Bias::Down => Side::Down,
            Bias::Neutral => return Decision::KeepBoth,
        };
        Decision::SellLosingLeg {
            losing_side: bias_side.opposite(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    KeepBoth,
    SellLosingLeg { losing_side: Side },
}

/// Invokes the liquidator on the losing leg once a `SellLosingLeg` decision
/// has been made. Split from `decide` so the pure decision logic is
/// trivially unit-testable without a mock exchange.
pub async fn apply_decision(
    liquidator: &EmergencyLiquidator,
    decision: Decision,
    losing_token: &crate::domain::Token,
    position: Decimal,
    entry_price: Decimal,
    window_end: DateTime<Utc>,
    progress: &dyn LiquidationProgressSink,
) -> Result<OptimizerDecision, crate::error::LifecycleError> {
    match decision {
        Decision::KeepBoth => Ok(OptimizerDecision::KeepBoth),
        Decision::SellLosingLeg { losing_side } => {
            let outcome = liquidator
                .liquidate(losing_token, position, entry_price, window_end, progress)
                .await?;
            Ok(OptimizerDecision::SellLosingLeg {
                losing_side,
                outcome,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    fn config() -> PreSettlementConfig {
        PreSettlementConfig::default()
    }

    #[test]
    fn in_window_true_between_start_and_stop() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let window_end = Utc::now();
        let now = window_end - chrono::Duration::seconds(100);
        assert!(optimizer.is_in_window(now, window_end));
    }

    #[test]
    fn out_of_window_before_start() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let window_end = Utc::now();
        let now = window_end - chrono::Duration::seconds(500);
        assert!(!optimizer.is_in_window(now, window_end));
    }

    #[test]
    fn out_of_window_after_stop() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let window_end = Utc::now();
        let now = window_end - chrono::Duration::seconds(10);
        assert!(!optimizer.is_in_window(now, window_end));
    }

    #[test]
    fn keeps_both_below_min_confidence() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let signal = Signal::new(0.5, Bias::Up, 0.7);
        assert_eq!(optimizer.decide(signal), Decision::KeepBoth);
    }

    #[test]
    fn sells_opposite_leg_on_strong_confident_bias() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let signal = Signal::new(0.85, Bias::Up, 0.9);
        let decision = optimizer.decide(signal);
        assert_eq!(
            decision,
            Decision::SellLosingLeg {
                losing_side: Side::Down
            }
        );
    }

    #[test]
    fn keeps_both_on_neutral_bias() {
        let cfg = config();
        let optimizer = PreSettlementOptimizer::new(&cfg);
        let signal = Signal::new(0.0, Bias::Neutral, 0.5);
        assert_eq!(optimizer.decide(signal), Decision::KeepBoth);
    }
}
