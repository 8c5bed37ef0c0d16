pub mod dedup;
pub mod flood_relay;
pub mod fragment;
pub mod protocol;
pub mod radio;

#[cfg(feature = "ble")]
pub mod btle;

pub use dedup::DedupCache;
pub use flood_relay::{FloodRelay, FloodStatistics};
pub use fragment::{fragment, FragmentReassembler, ReassemblyTable};
pub use protocol::{chunk_size, FragmentKey, MeshPacket, MeshProtocol, HEADER_LEN};
pub use radio::{BroadcastRadio, RadioBlob, SimulatedAir, SimulatedRadio};

#[cfg(feature = "ble")]
pub use btle::BtleRadio;
