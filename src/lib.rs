pub mod args;
pub mod client;
pub mod command;
pub mod connection;
pub mod master;
pub mod net;
pub mod rdb;
pub mod redis;
pub mod replica;
pub mod resp;
pub mod session;
pub mod store;
pub mod stream;
pub mod waiters;

pub use command::Command;
pub use master::MasterServer;
pub use net::{Binding, DEFAULT_PORT};
pub use redis::RedisServer;
pub use resp::RESP;
