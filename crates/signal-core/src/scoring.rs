//! Scoring functions shared by the engine, executor and analyzer.
//!
//! Every function here is pure and documents its input and output range so it can be
//! tested without a store or broker behind it.

use crate::types::{Direction, SignalType};

/// Compute the mean of a data slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Compute sample standard deviation.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Mean over standard deviation of per-trade returns. 0 when there is no dispersion.
pub fn sharpe_like(returns: &[f64]) -> f64 {
    let sd = std_dev(returns);
    if sd < f64::EPSILON {
        return 0.0;
    }
    mean(returns) / sd
}

/// Raw strategy strength (0-1 or 0-100) -> 0-100.
/// Values up to 1.0 are read as fractions.
pub fn normalize_strength(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    let scaled = if raw.abs() <= 1.0 { raw.abs() * 100.0 } else { raw.abs() };
    scaled.clamp(0.0, 100.0)
}

/// Any confidence -> 0-1. Percent inputs (> 1) are scaled down.
pub fn clamp_confidence(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

/// Volatility assumed when a candidate carries none (2% daily).
pub const DEFAULT_VOLATILITY: f64 = 0.02;

/// Risk score in 0-100 from daily volatility (fraction) and confidence (0-1).
///
/// Volatility saturates at 5% daily and carries 60% of the score; the remaining 40%
/// is the lack of confidence.
pub fn risk_score(volatility: Option<f64>, confidence: f64) -> f64 {
    let vol = volatility
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_VOLATILITY)
        .abs();
    let vol_component = (vol / 0.05).min(1.0);
    let confidence_component = 1.0 - clamp_confidence(confidence);
    (100.0 * (0.6 * vol_component + 0.4 * confidence_component)).clamp(0.0, 100.0)
}

/// Expected return (signed fraction): probability-weighted reward minus risk, where
/// reward and risk are the distances to take-profit and stop-loss as fractions of price.
pub fn expected_return(confidence: f64, reward_pct: f64, risk_pct: f64) -> f64 {
    let p = clamp_confidence(confidence);
    p * reward_pct.abs() - (1.0 - p) * risk_pct.abs()
}

/// Relative difference between suggested and executed price, always >= 0.
pub fn slippage(suggested_price: f64, executed_price: f64) -> f64 {
    if suggested_price <= 0.0 || !suggested_price.is_finite() || !executed_price.is_finite() {
        return 0.0;
    }
    (executed_price - suggested_price).abs() / suggested_price
}

/// Return of a closed trade, signed by direction: a short that fell is positive.
pub fn directional_return(direction: Direction, entry_price: f64, exit_price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    direction.sign() * (exit_price - entry_price) / entry_price
}

/// Ordering key for the executor. Exposure-reducing signals always outrank new
/// exposure because the type bonus exceeds the 0-100 quality band.
pub fn execution_priority(signal_type: SignalType, strength: f64, confidence: f64) -> f64 {
    let type_bonus = match signal_type {
        SignalType::Exit => 300.0,
        SignalType::Reduce => 200.0,
        SignalType::Hedge => 100.0,
        SignalType::Entry | SignalType::Add => 0.0,
    };
    type_bonus + 0.7 * strength.clamp(0.0, 100.0) + 30.0 * clamp_confidence(confidence)
}

/// Post-trade score in 0-100.
///
/// 50 is break-even; +/-10% realized return reaches the extremes. Calling the
/// direction of the expected move right adds 10, slippage costs up to 10.
pub fn evaluation_score(actual_return: f64, expected_return: f64, slippage: f64) -> f64 {
    let mut score = 50.0 + (actual_return * 500.0).clamp(-50.0, 50.0);
    if expected_return != 0.0 && actual_return.signum() == expected_return.signum() {
        score += 10.0;
    }
    score -= (slippage.max(0.0) * 1000.0).min(10.0);
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_strength_scales() {
        assert_relative_eq!(normalize_strength(0.8), 80.0);
        assert_relative_eq!(normalize_strength(80.0), 80.0);
        assert_relative_eq!(normalize_strength(250.0), 100.0);
        assert_relative_eq!(normalize_strength(f64::NAN), 0.0);
    }

    #[test]
    fn test_clamp_confidence() {
        assert_relative_eq!(clamp_confidence(0.7), 0.7);
        assert_relative_eq!(clamp_confidence(70.0), 0.7);
        assert_relative_eq!(clamp_confidence(-1.0), 0.0);
    }

    #[test]
    fn test_risk_score_range() {
        let calm = risk_score(Some(0.005), 0.9);
        let wild = risk_score(Some(0.08), 0.2);
        assert!(calm < 20.0);
        assert!(wild > 85.0);
        assert!((0.0..=100.0).contains(&risk_score(None, 0.5)));
    }

    #[test]
    fn test_slippage() {
        assert_relative_eq!(slippage(100.0, 101.0), 0.01);
        assert_relative_eq!(slippage(100.0, 99.0), 0.01);
        assert_relative_eq!(slippage(100.0, 100.0), 0.0);
        assert_relative_eq!(slippage(0.0, 5.0), 0.0);
    }

    #[test]
    fn test_directional_return() {
        assert_relative_eq!(directional_return(Direction::Long, 100.0, 110.0), 0.10);
        assert_relative_eq!(directional_return(Direction::Short, 100.0, 90.0), 0.10);
        assert_relative_eq!(directional_return(Direction::Short, 100.0, 110.0), -0.10);
    }

    #[test]
    fn test_exits_outrank_entries() {
        let weakest_exit = execution_priority(SignalType::Exit, 0.0, 0.0);
        let weakest_reduce = execution_priority(SignalType::Reduce, 0.0, 0.0);
        let strongest_entry = execution_priority(SignalType::Entry, 100.0, 1.0);
        let strongest_add = execution_priority(SignalType::Add, 100.0, 1.0);
        assert!(weakest_exit > weakest_reduce);
        assert!(weakest_reduce > strongest_entry);
        assert!(weakest_reduce > strongest_add);
    }

    #[test]
    fn test_evaluation_score_bounds() {
        assert_relative_eq!(evaluation_score(0.0, 0.0, 0.0), 50.0);
        assert_relative_eq!(evaluation_score(0.5, 0.05, 0.0), 100.0);
        assert_relative_eq!(evaluation_score(-0.5, 0.05, 0.02), 0.0);
        assert!(evaluation_score(0.02, 0.03, 0.0) > evaluation_score(0.02, -0.03, 0.0));
    }

    #[test]
    fn test_sharpe_like() {
        assert_relative_eq!(sharpe_like(&[0.01, 0.01, 0.01]), 0.0);
        assert!(sharpe_like(&[0.02, 0.01, 0.03]) > 0.0);
        assert!(sharpe_like(&[-0.02, -0.01, -0.03]) < 0.0);
    }
}
