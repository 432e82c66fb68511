use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Kelly criterion: f* = (b·p - q) / b
///
/// `win_rate` is p, `payoff_ratio` is b (average win over average loss).
/// Negative values mean the edge is negative and nothing should be staked.
pub fn kelly_fraction(win_rate: f64, payoff_ratio: f64) -> f64 {
    if !win_rate.is_finite() || !payoff_ratio.is_finite() || payoff_ratio <= 0.0 {
        return 0.0;
    }
    let p = win_rate.clamp(0.0, 1.0);
    let q = 1.0 - p;
    (payoff_ratio * p - q) / payoff_ratio
}

/// Win/loss statistics of closed trades, as fractions of entry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEstimate {
    pub win_rate: f64,
    /// Mean return of winners (positive)
    pub avg_win: f64,
    /// Mean magnitude of losers (positive)
    pub avg_loss: f64,
    pub sample_size: usize,
}

impl EdgeEstimate {
    /// Build from per-trade returns. Zero returns count as losses.
    pub fn from_returns(returns: &[f64]) -> Self {
        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns
            .iter()
            .copied()
            .filter(|r| *r <= 0.0)
            .map(f64::abs)
            .collect();

        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };

        Self {
            win_rate: if returns.is_empty() {
                0.0
            } else {
                wins.len() as f64 / returns.len() as f64
            },
            avg_win: avg(&wins),
            avg_loss: avg(&losses),
            sample_size: returns.len(),
        }
    }

    /// Average win over average loss. With no losing magnitude on record the ratio is
    /// undefined; callers get `None` and fall back to the band floor.
    pub fn payoff_ratio(&self) -> Option<f64> {
        if self.avg_loss > f64::EPSILON && self.avg_win > 0.0 {
            Some(self.avg_win / self.avg_loss)
        } else {
            None
        }
    }
}

/// Band the scaled Kelly fraction is forced into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingBand {
    /// Safety multiplier on the raw Kelly fraction (0.5 = half Kelly)
    pub multiplier: f64,
    /// Floor, also used when there is no measurable edge
    pub min_fraction: f64,
    /// Hard cap per symbol
    pub max_fraction: f64,
}

impl Default for SizingBand {
    fn default() -> Self {
        Self {
            multiplier: 0.5,
            min_fraction: 0.005,
            max_fraction: 0.10,
        }
    }
}

impl SizingBand {
    pub fn new(multiplier: f64, min_fraction: f64, max_fraction: f64) -> Result<Self> {
        if multiplier <= 0.0 || multiplier > 1.0 {
            bail!("kelly multiplier must be in (0, 1], got {multiplier}");
        }
        if max_fraction <= 0.0 || max_fraction > 1.0 {
            bail!("max fraction must be in (0, 1], got {max_fraction}");
        }
        if min_fraction < 0.0 || min_fraction > max_fraction {
            bail!("min fraction must be in [0, {max_fraction}], got {min_fraction}");
        }
        Ok(Self {
            multiplier,
            min_fraction,
            max_fraction,
        })
    }

    /// Same band with a tighter cap. The floor follows the cap down if needed.
    pub fn capped_at(&self, cap: f64) -> Self {
        let max_fraction = self.max_fraction.min(cap.max(0.0));
        Self {
            multiplier: self.multiplier,
            min_fraction: self.min_fraction.min(max_fraction),
            max_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingDecision {
    /// Fraction of equity per position, always within the band
    pub fraction: f64,
    /// Kelly fraction before multiplier and band
    pub raw_kelly: f64,
    /// True when the band cap bound the result
    pub capped: bool,
    pub reasoning: String,
}

/// Turns an edge estimate into a per-position equity fraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KellyPositionSizer {
    pub band: SizingBand,
}

impl KellyPositionSizer {
    pub fn new(band: SizingBand) -> Self {
        Self { band }
    }

    pub fn size(&self, edge: &EdgeEstimate) -> SizingDecision {
        let band = &self.band;
        let Some(payoff) = edge.payoff_ratio() else {
            return SizingDecision {
                fraction: band.min_fraction,
                raw_kelly: 0.0,
                capped: false,
                reasoning: format!(
                    "No payoff ratio from {} trades; using floor {:.2}%",
                    edge.sample_size,
                    band.min_fraction * 100.0
                ),
            };
        };

        let raw = kelly_fraction(edge.win_rate, payoff);
        let scaled = raw.max(0.0) * band.multiplier;
        let fraction = scaled.clamp(band.min_fraction, band.max_fraction);
        let capped = scaled > band.max_fraction;

        tracing::debug!(
            win_rate = edge.win_rate,
            payoff,
            raw_kelly = raw,
            fraction,
            "Kelly sizing"
        );

        SizingDecision {
            fraction,
            raw_kelly: raw,
            capped,
            reasoning: format!(
                "Kelly {:.2}% x {:.2} -> {:.2}% (win rate {:.1}%, payoff {:.2}, n={})",
                raw * 100.0,
                band.multiplier,
                fraction * 100.0,
                edge.win_rate * 100.0,
                payoff,
                edge.sample_size
            ),
        }
    }
}
