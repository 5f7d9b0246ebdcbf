pub mod broker;
pub mod error;
pub mod launch;
pub mod output;
pub mod supervisor;

pub use broker::{BroadcastHub, Delivery, LagMarks, Subscriber, SubscriberId};
pub use error::SupervisorError;
pub use launch::{LaunchSpec, RunnerConfig, RuntimeInstallConfig};
pub use output::{LineSource, LogLine, LogRingBuffer};
pub use supervisor::{ControlOutcome, ProcessSupervisor, SupervisorConfig};
