//! Client side routing.
//!
//! [`Resolver`] learns the servers and who leads from any one of them,
//! [`Picker`] sends writes to the leader and spreads reads over followers,
//! and [`LogClient`] ties both to request connections with retries.

mod client;
mod conn;
pub mod picker;
pub mod resolver;

use std::time::Duration;

pub use self::client::LogClient;
pub use self::conn::{ClientTls, Conn, RecordStream};
pub use self::picker::{Picker, SubConn};
pub use self::resolver::{Address, Resolver};

#[derive(Clone)]
pub struct ClientOptions {
    /// Extra attempts after a retryable failure, each preceded by a fresh
    /// resolution.
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub dial_timeout: Duration,
    pub tls: Option<ClientTls>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_millis(200),
            dial_timeout: Duration::from_secs(1),
            tls: None,
        }
    }
}
