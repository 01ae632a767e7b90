pub mod cli;
pub mod config;
pub mod controller;
pub mod detector;
pub mod fetch;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod pacing;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod util;

// Re-export main types for library usage
pub use config::{ControllerConfig, Defaults, TargetConfig};
pub use controller::{ChangeDetectSink, Controller};
pub use detector::{BlockDetector, Classification};
pub use fetch::{FetchResult, Fetcher, HttpFetcher, Sink, TransportError};
pub use identity::{Identity, IdentityPool};
pub use pacing::DelayModel;
pub use recovery::{ExponentialBackoff, RecoveryController, Transition};
pub use scheduler::AdaptiveScheduler;
pub use session::SessionStore;
pub use store::{ControllerStore, RecoveryRecord, RecoveryStateRecord, SessionRecord};
