//! # wa-relay-core
//!
//! Outbound message relay core for a WhatsApp-style multidevice chat
//! protocol: takes an application-level message addressed to a direct
//! peer, group, newsletter, or status feed and produces the signed,
//! per-device encrypted binary stanza(s) ready to hand to the transport.
//!
//! ## Features
//!
//! - LID/PN identity reconciliation (`identity`)
//! - Device-list resolution with USync fan-out (`devices`)
//! - Pairwise session assertion and Signal-style ratchet encryption
//!   (`session`, `crypto`)
//! - Group sender-key fan-out (`group`)
//! - Stanza assembly for all outbound message shapes (`stanza`)
//! - Top-level orchestration (`relay`), receipts, media re-upload, and the
//!   retry-receipt plaintext cache (`receipts`, `media`, `retry`)
//! - QR code pairing (multidevice) and the Noise/WebSocket transport layer
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wa_relay_core::{Client, store::MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let client = Client::new(store);
//!     client.connect().await?;
//!     // Handle QR or existing session...
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod client;
pub mod config;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod events;
pub mod group;
pub mod identity;
pub mod media;
pub mod pairing;
pub mod receipts;
pub mod relay;
pub mod retry;
pub mod session;
pub mod socket;
pub mod stanza;
pub mod store;
pub mod transport;
pub mod types;

pub use client::{Client, CompletePairingParams, SendRequestExtra, SendResponse};
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use events::Event;
pub use media::{MediaConn, MediaConnCache, MediaConnFetcher};
pub use pairing::{
    generate_pairing_keys, sign_device_identity, verify_device_identity, verify_signed_identity,
    PairingKeys, VerifiedIdentity,
};
pub use receipts::{build_receipts, ReceiptType};
pub use relay::{PatchedMessage, Relay, RelayOptions, RelayResult, RetryInput, SendNode};
pub use retry::RetryCache;
pub use store::{DeviceStore, OwnDevice, Store};
pub use transport::Transport;
pub use types::{EditType, Jid, MessageId};
