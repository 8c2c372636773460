//! # collab-core
//!
//! The real-time collaboration core behind a multi-user pattern editor:
//! a WebSocket hub that fans code edits, chat, and transport controls out
//! to every connected participant; a write-through cache in front of
//! Postgres so hot edits never wait on a round trip to the durable
//! store; and a CC-Signals paste-lock engine that notices when pasted
//! content may belong to someone else and holds the session until a
//! human (or enough subsequent editing) clears it.
//!
//! Everything outside the wire protocol, the session/participant data
//! model, and these four subsystems — auth issuance, the AI assistant
//! itself, work/fork bookkeeping — lives in other services and only
//! touches this crate at its edges (a JWT to verify, a CC signal to
//! consult).

pub mod client;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod flusher;
pub mod gateway;
pub mod hub;
pub mod kv;
pub mod lock;
pub mod model;
pub mod paste;
pub mod protocol;
pub mod repo;
pub mod server;
pub mod simhash;
