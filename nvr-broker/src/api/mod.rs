//! Broker API Client
//!
//! HTTP client for the broker's control plane (`/api/streams`, `/api/preload`,
//! `/api/frame.jpeg`, `/api/server`).
//!
//! # Example
//!
//! ```no_run
//! use nvr_broker::api::BrokerClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BrokerClient::new(1984, "", 8554)?;
//! client.add_stream("front", "rtsp://10.0.0.5/main#media=video").await?;
//! let url = client.get_rtsp_url("front").await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod error;
pub mod types;

pub use client::BrokerClient;
pub use error::BrokerApiError;
pub use types::*;
