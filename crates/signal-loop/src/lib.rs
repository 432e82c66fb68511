//! Closed-loop signal pipeline: strategy output becomes validated, position-aware trading
//! signals, which are executed, evaluated once closed, and fed back into the parameters
//! that produced them.

pub mod adaptive_optimizer;
pub mod closing;
pub mod config;
pub mod loop_coordinator;
pub mod metrics;
pub mod order_executor;
pub mod performance_analyzer;
pub mod position_filter;
pub mod run_source;
pub mod service;
pub mod signal_engine;

pub use adaptive_optimizer::AdaptiveOptimizer;
pub use config::{ExecutionMode, PipelineConfig};
pub use loop_coordinator::{CycleResult, LoopContext, LoopCoordinator, LoopStatus, PhaseStatus};
pub use metrics::LoopMetrics;
pub use order_executor::{BatchExecutionResult, ExecutionResult, OrderExecutor};
pub use performance_analyzer::{PerformanceAnalyzer, PerformanceReport};
pub use position_filter::{FilterStats, PositionFilter, PositionSnapshot};
pub use run_source::StaticRunSource;
pub use service::{PendingSignals, TradingLoopService};
pub use signal_engine::SignalEngine;
