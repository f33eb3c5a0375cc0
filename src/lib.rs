//! Connection and completion engine for key-value benchmarks over a
//! memory-registered, zero-copy transport.
//!
//! At a high level the crate provides a few major components:
//!
//! * `WorkerContext`, which owns one transport provider handle, one completion queue and
//! the connections established through it, and drives them from a single dispatcher loop.
//!
//! * `BufferPool`, pre-registered receive buffers that are re-posted after each completion.
//!
//! * `ConnectionHandler`, the per-connection callback set for the four completion kinds
//! (receive, send, remote read, remote write).
//!
//! * The remote-access header (`RemoteAccessHeader`) used to ask a peer for a one-sided
//! read or write, and the chunked transfer helpers (`split_framed`, `Reassembler`) for
//! payloads larger than one buffer.
//!
//! The transport itself is abstracted behind `TransportProvider`. `LoopbackProvider` is an
//! in-process implementation with reliable-connected semantics.
//!
//! #### Example
//! A server replies to every command that does not carry `noreply`.
//!
//! ```
//! use rdma_kv_engine::{
//!     ConnectionHandler, EngineConfig, LoopbackProvider, ReplyingHandler, TransportProvider,
//!     WorkerContext,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> rdma_kv_engine::Result<()> {
//!     let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
//!     let addr = "127.0.0.1:11211".parse().unwrap();
//!
//!     let mut server = WorkerContext::new(Arc::clone(&provider), EngineConfig::default())?;
//!     let _listener = server.listen(
//!         addr,
//!         Box::new(|_| Box::new(ReplyingHandler::default()) as Box<dyn ConnectionHandler>),
//!     )?;
//!
//!     let mut client = WorkerContext::new(provider, EngineConfig::default())?;
//!     let conn = client.connect(addr, Box::new(ReplyingHandler::default()))?;
//!     let _accepted = server.process_cm_events()?;
//!     let _established = client.process_cm_events()?;
//!
//!     client.send(conn, b"get foo\r\n")?;
//!     let _ = server.poll_completions()?;
//!     let _ = client.poll_completions()?;
//!     Ok(())
//! }
//! ```
#![warn(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::cargo,
    unreachable_pub,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc, // TODO: add error docs
    clippy::missing_panics_doc, // TODO: add panic docs
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::std_instead_of_core, // we target std only
    clippy::question_mark_used, // `?` is the error propagation style of this crate
)]

/// Memory access flags
mod access;
/// Generational slot arena
mod arena;
/// Pre-registered receive buffers
mod buffer_pool;
/// Chunked transfer and reassembly
mod chunked;
/// Work completions and completion status
mod completion_queue;
/// Engine configuration
mod config;
/// Connection state and per-connection operations
mod connection;
/// The completion dispatcher and its polling triggers
mod dispatcher;
/// Engine error type
mod error;
/// Error logging helpers
mod error_utilities;
/// Per-connection completion handlers
mod handler;
/// Random id helpers
mod id;
/// Lock helpers
mod lock_utilities;
/// Macro helpers
mod macro_utilities;
/// Registered memory
mod memory_region;
/// Transport provider contract and the loopback implementation
mod provider;
/// Endpoint-id to connection registry
mod registry;
/// Remote-access header protocol
mod remote_access;
/// Work context arena
mod work_context;
/// Work request descriptions
mod work_request;
/// Worker context, the owner of one dispatcher loop
mod worker;

pub use access::AccessFlag;
pub use buffer_pool::{BufferPool, PostTarget};
pub use chunked::{
    chunk_count, framed_len, split_framed, strip_terminator, Reassembler, Reassembly,
    DEFAULT_CHUNK_SIZE, TERMINATOR,
};
pub use completion_queue::{WCError, WcOpcode, WorkCompletion};
pub use config::{EngineConfig, EngineConfigBuilder, EngineConfigBuilderError};
pub use connection::{ConnectionCtx, ConnectionId, ConnectionState, ConnectionStats};
pub use dispatcher::{DispatchStats, ManualTrigger, PollingTriggerType};
pub use error::{Error, ErrorKind, Result};
pub use handler::{Completion, ConnectionHandler, HandlerFactory, ReplyingHandler};
pub use memory_region::{MrAccess, MrKeys, RegisteredBuffer, RemoteDescriptor};
pub use provider::{
    loopback::LoopbackProvider, CmChannelId, CmEvent, CmEventKind, CqId, EndpointId,
    QpInitAttr, SrqId, TransportProvider,
};
pub use registry::{ConnectionRegistry, SharedRegistry, PRIME_LADDER};
pub use remote_access::{is_remote_access, HeaderEncoding, RemoteAccessHeader, RemoteOp};
pub use work_context::{BufferSlot, WorkContext, WorkContextArena, WorkRequestId};
pub use work_request::{RecvWr, SendOpcode, SendWr, Sge};
pub use worker::{spawn_worker, WorkerContext};
