//! Trellis Proto - shared data model and RPC surface
//!
//! Defines the records replicated through the cluster store, the
//! request/response bodies of the control-plane RPC surface, and a
//! reqwest-based client implementing one method per operation.
//!
//! # Modules
//!
//! - [`types`] - replicated records (nodes, peers, routes, master descriptor)
//! - [`rpc`] - RPC request/response bodies and the error envelope
//! - [`client`] - HTTP client for the control-plane RPC surface

pub mod client;
pub mod rpc;
pub mod types;

pub use client::{Client, ClientError};
pub use rpc::*;
pub use types::{KeyPair, Master, Node, Peer, Route};
