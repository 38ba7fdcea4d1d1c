//! Embermesh: decentralized Bluetooth LE mesh messaging.
//!
//! Co-located devices exchange broadcast chat, directed private
//! messages, friend-request handshakes, and SOS beacons with no
//! infrastructure: every node scans nearby advertisements and
//! periodically advertises a short manufacturer-data payload.
//! Forwarding is store-and-forward flooding with TTL decrement,
//! duplicate suppression, and randomized timing.
//!
//! Instantiate one [`MeshService`] at the application root, subscribe to
//! its event streams, and call its send operations; there are no global
//! singletons.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `bluetooth` | Wire codec, peer table, advertising mutex, radio seam, engine |
//! | `message` | Dedup cache, relay ledger, router pipeline, message log |
//! | `events` | Broadcast-channel fan-out of classified events |
//! | `identity` | Persistent node id, node hash, friend code |
//! | `persistence` | String key/value store seam |
//! | `location` | Bounded coordinate acquisition for outbound messages |

pub mod bluetooth;
pub mod events;
pub mod identity;
pub mod location;
pub mod message;
pub mod persistence;

pub use bluetooth::mesh_service::{MeshConfig, MeshService};
pub use bluetooth::protocol::{DecodeError, MeshFrame, PacketType, MANUFACTURER_ID};
pub use bluetooth::radio::{BtleplugRadio, MeshRadio, ScanResult};
pub use events::{FriendCodeDiscovery, FriendRequestEvent, MeshEvents, PacketDiagnostic};
pub use identity::LocalIdentity;
pub use location::LocationProvider;
pub use message::message_types::MeshMessage;
pub use persistence::{JsonFileStore, KeyValueStore, MemoryStore};
