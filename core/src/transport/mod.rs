// Transport module: BLE platform seam and per-peripheral link management

pub mod bridge;
pub mod connection;

pub use bridge::{BleTransport, CharacteristicRef, TransportError, TransportEvent, WriteChannel};
pub use connection::{ConnectionManager, LinkEvent, LinkTransition};
