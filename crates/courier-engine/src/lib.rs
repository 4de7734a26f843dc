//! Exchange coordination for courier: pull claiming, push dispatch,
//! receipt handling, retry scheduling and per-responder pull pacing.

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod notify;
pub mod pacing;
pub mod pmode;
pub mod reliability;
pub mod retry;

pub use config::EngineConfig;
pub use coordinator::{restore_status_of, Coordinator, DueRetries, PullResponse, Submission};
pub use driver::{DriverStats, ExchangeDriver};
pub use error::{Disposition, EngineError};
pub use notify::{LoggingSink, Notification, NotificationSink, NotifyError, RecordingSink};
pub use pacing::{PacingConfig, PacingSnapshot, PullFrequencyRegistry};
pub use pmode::{
    ExchangeContext, LegConfig, PModeError, PModeProvider, ProcessConfig, StaticPModeProvider,
};
pub use reliability::{ReceivedResponse, ReliabilityContract, ReliabilityOutcome, ReplyPattern};
pub use retry::{RetryPolicy, RetryStrategy};
