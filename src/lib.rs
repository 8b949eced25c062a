//! Exchange Link
//!
//! Client-side WebSocket connection runtime for exchange feeds: connection
//! lifecycle, heartbeat handling per exchange convention, reconnection with
//! backoff and recovery, and ownership transfer between tasks.
//!
//! ```no_run
//! # async fn demo() -> exchange_link::LinkResult<()> {
//! use exchange_link::{Link, LinkConfig, LinkMessage};
//!
//! let link = Link::builder(LinkConfig::new("wss://stream.binance.com:9443/ws")).spawn()?;
//! link.handle.open().await?;
//!
//! let mut messages = link.messages;
//! while let Some(message) = messages.recv().await {
//!     if let LinkMessage::Frame(frame) = message {
//!         println!("{}", frame);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod link;
pub mod logging;
pub mod reconnect;
pub mod session;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use config::LinkConfig;
pub use error::{LinkError, LinkResult};
pub use frame::{CloseReason, Frame};
pub use link::{Link, LinkBuilder};
pub use session::{
    ConnectionId, ConnectionSnapshot, ConnectionStatus, LinkExit, LinkHandle, LinkMessage,
    OwnedLink, SpawnedLink, Termination,
};
pub use transfer::{mailbox, TransferInbox, TransferOffer, TransferTarget};
