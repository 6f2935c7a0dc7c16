//! Multi-client chat relay with length-prefixed framing and UDP discovery.
//!
//! The relay is one event loop that owns every piece of connection state.
//! Per-connection reader tasks decode frames and forward them to the loop over
//! a channel, so command handling never needs a lock.
//!
//! - [`codec`] frames payloads as `[u32 big-endian length][bytes]`.
//! - [`registry`] tracks live connections, enforces capacity, and fans out
//!   broadcasts. It is backed by the generation-checked slots in [`arena`].
//! - [`protocol`] parses client commands and builds relay replies.
//! - [`dispatch`] runs one command against the registry and the [`chat_log`].
//! - [`relay`] is the accept/read/sweep event loop.
//! - [`discovery`] announces the relay over UDP broadcast and lets clients find it.
//! - [`client`] is the terminal client built on the same codec.
//! - [`cli`] holds the command-line interface for both modes.

pub mod arena;
pub mod chat_log;
pub mod cli;
pub mod client;
pub mod codec;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
