//! # Accord
//!
//! A WalletConnect-v2-style client: a dapp (proposer) and a wallet
//! (responder) establish end-to-end encrypted channels over an untrusted
//! publish/subscribe relay, negotiate JSON-RPC and notification permissions,
//! and exchange requests under them.
//!
//! ## Features
//!
//! - **Two-phase sequences** (pending → settled) for pairings and sessions
//! - **End-to-end encryption** with per-topic keys (X25519 + HKDF + AEAD)
//! - **Permission negotiation** with controller-gated, monotonic upgrades
//! - **Pluggable transport** layer (WebSocket, in-memory relay for tests)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use accord::{Client, ClientConfig, ClientEvent};
//!
//! # async fn run() -> accord::Result<()> {
//! let client = Client::init(ClientConfig::default()).await?;
//! let mut events = client.events();
//!
//! // React to proposals, requests and notifications from the peer.
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ClientEvent::SessionRequest { topic, request, .. } => {
//!             println!("peer request on {topic}: {}", request.method);
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              CLIENT FACADE                  │
//! │   connect | pair | approve | request | ...  │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │            SEQUENCE ENGINES                 │
//! │   pairing + session state machines          │
//! │   (stores, history, permission checks)      │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  X25519 | HKDF-SHA256 | ChaCha20-Poly1305   │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │                 RELAYER                     │
//! │  publish/subscribe JSON-RPC over WebSocket  │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod crypto;
pub mod error;
pub mod history;
pub mod relay;
pub mod sequence;
pub mod storage;
pub mod store;
pub mod uri;

/// A 32-byte identifier, hex-encoded; also the keychain lookup key for the
/// symmetric key of the channel it names.
pub type Topic = String;

// Re-export main types at crate root
pub use client::{Client, ClientConfig, ClientEvent};
pub use error::{Error, Result};
