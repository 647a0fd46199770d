//! mailsink - disposable email capture service
//!
//! Any address on a configured domain is a live mailbox that materializes
//! on first delivery, is readable over POP3, and is reaped by a retention
//! scanner. This library provides the storage, addressing, pub/sub, and
//! server lifecycle pieces; the daemon binary wires them together.

pub mod config;
pub mod error;
pub mod hub;
pub mod manager;
pub mod message;
pub mod policy;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use hub::{MessageEvent, MessageHub};
pub use manager::StoreManager;
pub use message::{Delivery, Metadata};
pub use policy::AddrPolicy;
pub use server::{Listener, SessionHandler, Shutdown};
pub use storage::Store;
