//! Core library for coordinating a small mesh of devices over an overlay
//! network sidecar: wire framing, the sidecar client, connection transport,
//! device presence, primary election, a local pub/sub bus, and state sync.

pub mod bus;
pub mod codec;
pub mod config;
pub mod device;
pub mod election;
pub mod envelope;
pub mod error;
pub mod node;
pub mod overlay;
pub mod sync;
pub mod transport;

pub use bus::{Bus, OutboundSink, Subscription};
pub use codec::{Codec, Format};
pub use config::NodeConfig;
pub use device::{Device, DeviceEvent, DeviceRole, DeviceStatus, DeviceTable};
pub use election::{Candidate, Election, ElectionEvent, ElectionState, ELECTION_TIMEOUT, PRIMARY_LOSS_GRACE};
pub use envelope::Envelope;
pub use error::{CodecError, MeshError, OverlayError, SyncError, TransportError};
pub use node::MeshNode;
pub use overlay::{Overlay, OverlayCommand, OverlayEvent, OverlayPeer, SidecarOverlay, SidecarState};
pub use sync::{SyncAdapter, SyncStore, SYNC_NAMESPACE};
pub use transport::{Transport, TransportEvent};
