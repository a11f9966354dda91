//! Bybit v5 option venue: public ticker stream and instrument discovery

pub mod discovery;
pub mod messages;
pub mod websocket;

pub use discovery::BybitSymbolDirectory;
pub use messages::{parse_frame, OptionTicker, ParseError};
pub use websocket::{BybitConnection, BybitConnector};
