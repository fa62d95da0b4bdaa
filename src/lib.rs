//! Streams packet records from live capture, synthetic traffic or recordings
//! into a host/flow graph and fans snapshots out to websocket viewers.

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod replay;
pub mod server;
pub mod session;
pub mod sniff;
pub mod source;
pub mod synthetic;

pub use aggregator::{Aggregator, GraphState};
pub use broadcast::{Broadcaster, Subscription, Update};
pub use config::Config;
pub use pipeline::Pipeline;
pub use session::SessionManager;
