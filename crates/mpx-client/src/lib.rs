//! Managed upstream clients: one transport per upstream server, with the
//! connection lifecycle, tool cache, health probing, and child-process
//! discipline around it.

pub mod client;
pub mod envfilter;
pub mod health;
pub mod process;
pub mod tools;
pub mod transport;

pub use client::{ClientSettings, DisablePersistence, ManagedClient};
pub use envfilter::{REDACTED_SENTINEL, filter_env, is_sensitive_key};
pub use process::ProcessRegistry;
pub use tools::{ToolCache, ToolDescriptor, tool_fingerprint};
pub use transport::{ConnectedTransport, Connector, RmcpConnector, ServerHandshake};
