//! Control plane for the proxy farm
//!
//! The controller dials every known agent, authenticates it with the
//! nonce/HMAC handshake, and then exchanges encrypted events: commands flow
//! down, registrations, status updates and logs flow up.
pub mod agent;
pub mod channel;
pub mod controller;
pub mod desired;
pub mod driver;
pub mod error;
pub mod log_layer;
pub mod outbox;
pub mod reconnect;
pub mod session;
pub mod task_tracker;

pub use agent::{AgentConfig, AgentLink, AgentRuntime};
pub use channel::ControlChannel;
pub use controller::{AgentLogEntry, AgentState, Controller, ControllerConfig, StateChange};
pub use desired::{
    AgentSpec, DesiredStateError, DesiredStateSource, KnownAgent, StaticDesiredState,
    UplinkAssignment, UplinkSpec,
};
pub use driver::{Credentials, DriverError, MockUplinkDriver, UplinkDriver};
pub use error::{ControlError, SessionError};
pub use log_layer::LogForwardLayer;
pub use outbox::Outbox;
pub use reconnect::{ReconnectManager, DEFAULT_RECONNECT_INTERVAL};
pub use session::{
    ControlSession, Role, SessionConfig, SessionOutput, SessionState, DEFAULT_MAX_DECRYPT_FAILURES,
};
pub use task_tracker::TaskTracker;
