//! Havoc core library: chaos scenario orchestration shared by the CLI.

#[path = "runtime/analyzer.rs"]
mod analyzer;
#[path = "runtime/clock.rs"]
mod clock;
#[path = "platform/config.rs"]
mod config;
#[path = "platform/duration.rs"]
mod duration;
#[path = "runtime/engine.rs"]
mod engine;
#[path = "platform/error.rs"]
mod error;
#[path = "runtime/host.rs"]
mod host;
#[path = "runtime/locator.rs"]
mod locator;
#[path = "runtime/remediate.rs"]
mod remediate;
#[path = "runtime/remote.rs"]
mod remote;
#[path = "model/report.rs"]
mod report;
#[path = "model/scenario.rs"]
mod scenario;
#[path = "runtime/scripted.rs"]
mod scripted;
#[path = "runtime/tasks.rs"]
mod tasks;

pub use analyzer::*;
pub use clock::*;
pub use config::*;
pub use duration::*;
pub use engine::*;
pub use error::*;
pub use host::*;
pub use locator::*;
pub use remediate::*;
pub use remote::*;
pub use report::*;
pub use scenario::*;
pub use scripted::*;
pub use tasks::*;
