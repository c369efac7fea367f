//! Deterministic simulation harness for RelayDrop testing.
//!
//! Two ways to run the relay and its participants reproducibly:
//!
//! - [`SimWorld`] drives the action-based relay and clients in-process, one
//!   frame at a time, with seeded scheduling and fault injection (connection
//!   loss, duplicated and reordered chunks, failing chunk stores).
//! - [`SimServer`] and [`SimPeer`] run the same state machines over turmoil's
//!   simulated TCP, for end-to-end tests through real frame I/O.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks transfer properties against a
//! [`WorldSnapshot`]. Invariants verify WHAT must be true across all
//! execution paths, not specific scenarios. Use
//! [`InvariantRegistry::standard()`] for the transfer invariants.
//!
//! # Operations
//!
//! [`WorldOp`] sequences (from proptest or `arbitrary`) explore interleavings
//! of commands, deliveries, disconnects and time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod operation;
pub mod sim_env;
pub mod sim_peer;
pub mod sim_server;
pub mod sim_transport;
pub mod sim_world;

pub use invariants::{
    ChunksWithinManifest, ConfirmedMeansComplete, Invariant, InvariantKind, InvariantRegistry,
    InvariantResult, ParticipantRole, ParticipantSnapshot, ProgressMonotonic, RoomSnapshot,
    SenderNeverConfirms, SenderViewWithinRelay, Violation, WorldSnapshot,
};
pub use operation::{PeerId, ROOM_SLOTS, RoomSlot, WorldOp, slot_code, slot_source};
pub use sim_env::{DEFAULT_SEED, SimEnv};
pub use sim_peer::SimPeer;
pub use sim_server::SimServer;
pub use sim_transport::{read_frame, write_frame};
pub use sim_world::{FaultConfig, SimWorld, WorldClient, WorldError};
