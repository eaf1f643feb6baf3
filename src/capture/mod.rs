//! Packet capture and TCP stream reassembly
//!
//! Turns a stream of captured packets into per-connection sequences of
//! whole wire messages. The packet source is a pluggable boundary; pcap
//! capture files are supported in-crate.

pub mod packet;
pub mod pcap;
pub mod reassembly;

pub use packet::{dissect, CapturedPacket, FlowKey, LinkType, PacketSource, TcpSegment};
pub use pcap::PcapFileSource;
pub use reassembly::{MessageFramer, ReassemblyStats, StreamReassembler};
