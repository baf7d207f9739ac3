//! DCA grid strategy: configuration, ladder construction, entry/exit rules
//! and the engine that drives them.

mod config;
mod engine;
mod grid;
mod rules;

pub use config::{Regime, StrategyConfig};
pub use engine::{EngineComponents, StrategyEngine};
