//! TPoT tunnel client
//!
//! Opens one WebSocket connection to a TPoT relay and serves the
//! conversations the relay multiplexes over it, each bridged to a TCP
//! connection to the local target. HTTP conversations get their `Host`
//! header rewritten on the way through.
//!
//! # Example
//!
//! ```no_run
//! use tpot_client::{TunnelConfig, TunnelConnector};
//!
//! # async fn run() -> Result<(), tpot_client::TunnelError> {
//! let config = TunnelConfig::builder()
//!     .server("https://tpot.example.com")
//!     .target("localhost:3000")
//!     .build()?;
//!
//! let session = TunnelConnector::new(config).connect().await?;
//! println!("Tunnel established: {}", session.tunnel_url());
//! session.run().await
//! # }
//! ```

pub mod config;
mod conversation;
pub mod error;
pub mod http_inspector;
pub mod session;
mod transport;

pub use config::{HostRewrite, Scheme, TunnelConfig, TunnelConfigBuilder, UrlComponents};
pub use conversation::PAUSE_THRESHOLD;
pub use error::{ConnectFailure, TunnelError};
pub use http_inspector::{HttpInspector, InspectionError};
pub use session::{TunnelConnector, TunnelSession};
