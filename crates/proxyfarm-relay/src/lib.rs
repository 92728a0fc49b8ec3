//! Data-plane relay for published uplinks
//!
//! One listener per entry port, one task per accepted client. Bytes are copied
//! unmodified to the assigned upstream; the first client chunk is inspected for
//! an HTTP Host or TLS SNI hostname that ends up in the activity stream.
pub mod activity;
pub mod connection;
pub mod error;
pub mod manager;
pub mod sniff;

pub use activity::{ActivityKind, ByteCounters, RelayActivity};
pub use connection::{relay_connection, DEFAULT_CONNECT_TIMEOUT};
pub use error::RelayError;
pub use manager::{EnsureOutcome, RelayConfig, RelayManager};
pub use sniff::{http_host, sniff_hostname, tls_sni};
