//! edgegrid-notify — ships cache changes to subscribers.
//!
//! The server side broadcasts selected caches to remote workers: a full
//! sync list at connect (start marker, every object, end marker), then
//! incremental updates as the caches change. Subscribers are identified
//! by a notify id; when one disconnects, flush hooks run so ephemeral
//! data it reported (CloudletInfo) can be marked offline. The client
//! side applies a received stream into local caches and forwards
//! site-originated updates back up.

pub mod client;
pub mod server;

pub use client::NotifyClient;
pub use server::{NotifyMsg, NotifyServer, UpstreamHandler};
