use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Port {port} already relays to {existing}, refusing {requested}")]
    TargetConflict {
        port: u16,
        existing: String,
        requested: String,
    },

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different entry port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Upstream {target} unreachable: {reason}")]
    UpstreamConnect { target: String, reason: String },

    #[error("Upstream {0} did not answer in time")]
    UpstreamTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
