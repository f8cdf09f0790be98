//! Strategy weights and weighted strategy selection.

use crate::engine::probe::LatencyBand;
use crate::error::SessionError;
use loadsmith_common::WeightsConfig;
use rand::Rng;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    HttpFlood,
    PostFlood,
    ConnectionHold,
    Hybrid,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::HttpFlood,
        Strategy::PostFlood,
        Strategy::ConnectionHold,
        Strategy::Hybrid,
    ];

    /// Tag stored in each record's `attack_type`.
    pub fn tag(&self) -> &'static str {
        match self {
            Strategy::HttpFlood => "http_flood",
            Strategy::PostFlood => "post_flood",
            Strategy::ConnectionHold => "connection_hold",
            Strategy::Hybrid => "hybrid",
        }
    }

    fn index(&self) -> usize {
        match self {
            Strategy::HttpFlood => 0,
            Strategy::PostFlood => 1,
            Strategy::ConnectionHold => 2,
            Strategy::Hybrid => 3,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Non-negative weight per strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyWeights {
    weights: [f64; 4],
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

impl StrategyWeights {
    pub fn uniform() -> Self {
        Self { weights: [0.25; 4] }
    }

    pub fn from_config(cfg: &WeightsConfig) -> Self {
        Self {
            weights: [cfg.http_flood, cfg.post_flood, cfg.connection_hold, cfg.hybrid],
        }
    }

    pub fn get(&self, strategy: Strategy) -> f64 {
        self.weights[strategy.index()]
    }

    pub fn set(&mut self, strategy: Strategy, weight: f64) {
        self.weights[strategy.index()] = weight.max(0.0);
    }

    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Strategy, f64)> + '_ {
        Strategy::ALL.iter().map(move |s| (*s, self.get(*s)))
    }

    /// One-time bias from the probe: slow targets lean towards holding
    /// connections, fast ones towards flooding. Zero weights stay zero.
    pub fn adjust_for(&mut self, band: LatencyBand) {
        let factors: [(Strategy, f64); 2] = match band {
            LatencyBand::Slow => [(Strategy::ConnectionHold, 1.6), (Strategy::PostFlood, 1.2)],
            LatencyBand::Fast => [(Strategy::HttpFlood, 1.4), (Strategy::PostFlood, 1.4)],
            LatencyBand::Normal => return,
        };
        for (strategy, factor) in factors {
            let w = self.get(strategy);
            self.set(strategy, w * factor);
        }
    }
}

/// Cumulative distribution over [`StrategyWeights`], built once and shared
/// read-only by every worker.
#[derive(Debug, Clone)]
pub struct StrategySampler {
    strategies: Vec<Strategy>,
    cumulative: Vec<f64>,
}

impl StrategySampler {
    pub fn new(weights: &StrategyWeights) -> Result<Self, SessionError> {
        let mut strategies = Vec::with_capacity(4);
        let mut cumulative = Vec::with_capacity(4);
        let mut running = 0.0;
        for (strategy, weight) in weights.iter() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(SessionError::InvalidConfig(format!(
                    "weight for {} is {}",
                    strategy, weight
                )));
            }
            if weight == 0.0 {
                continue;
            }
            running += weight;
            strategies.push(strategy);
            cumulative.push(running);
        }
        if strategies.is_empty() {
            return Err(SessionError::InvalidConfig(
                "strategy weights must sum to a positive value".to_string(),
            ));
        }
        Ok(Self {
            strategies,
            cumulative,
        })
    }

    pub fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Maps a uniform draw `u` in `[0, 1)` onto a strategy.
    pub fn pick(&self, u: f64) -> Strategy {
        let point = u.clamp(0.0, 1.0) * self.total();
        let idx = self.cumulative.partition_point(|c| *c <= point);
        self.strategies[idx.min(self.strategies.len() - 1)]
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Strategy {
        self.pick(rng.gen::<f64>())
    }

    pub fn contains(&self, strategy: Strategy) -> bool {
        self.strategies.contains(&strategy)
    }
}
