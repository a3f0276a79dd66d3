//! LXMF message store, wire codec, router, and propagation-node manager.
//!
//! Sits on top of [`mesh_transport`]: the router drives a `TransportCore`
//! to move signed, content-addressed messages either directly to a peer or
//! via a propagation node, and the store persists them to disk keyed by
//! conversation.

pub mod error;
pub mod message;
pub mod payload;
pub mod propagation;
pub mod router;
pub mod state;
pub mod store;
pub mod wire;

pub use error::LxmfError;
pub use message::Message;
pub use payload::Payload;
pub use propagation::{PropagationManager, PropagationNode};
pub use router::LxmfRouter;
pub use state::MessageState;
pub use store::{FileMessageStore, MessageMeta, MessageStore};
pub use wire::WireMessage;
