pub mod connection;
pub mod dispatcher;

pub use dispatcher::{ConnId, ConnectionState, Dispatcher, Fanout, Room};
