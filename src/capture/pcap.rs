//! pcap capture-file reader
//!
//! Reads the classic pcap container: a 24-byte global header followed by
//! 16-byte record headers and frame bytes. Both byte orders and both
//! timestamp precisions (microsecond and nanosecond magic) are handled.

use crate::capture::packet::{CapturedPacket, LinkType, PacketSource};
use crate::error::{CaptureError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_MICROS_SWAPPED: u32 = 0xd4c3_b2a1;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;

/// Largest frame a record header may claim; anything bigger means the file
/// is corrupt or not a pcap
const MAX_FRAME_LEN: u32 = 256 * 1024;

/// [`PacketSource`] over a pcap capture file
#[derive(Debug)]
pub struct PcapFileSource {
    reader: BufReader<File>,
    swapped: bool,
    nanos: bool,
    link: LinkType,
}

impl PcapFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| CaptureError::operation("open capture", format!("{}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        let mut global = [0u8; 24];
        reader
            .read_exact(&mut global)
            .map_err(|e| CaptureError::operation("read global header", e.to_string()))?;

        let magic = u32::from_le_bytes([global[0], global[1], global[2], global[3]]);
        let (swapped, nanos) = match magic {
            MAGIC_MICROS => (false, false),
            MAGIC_NANOS => (false, true),
            MAGIC_MICROS_SWAPPED => (true, false),
            MAGIC_NANOS_SWAPPED => (true, true),
            other => return Err(CaptureError::BadMagic(other).into()),
        };

        let read_u32 = |at: usize| {
            let b = [global[at], global[at + 1], global[at + 2], global[at + 3]];
            if swapped {
                u32::from_be_bytes(b)
            } else {
                u32::from_le_bytes(b)
            }
        };
        let network = read_u32(20);
        let link = match network {
            LINKTYPE_ETHERNET => LinkType::Ethernet,
            LINKTYPE_RAW => LinkType::RawIp,
            other => return Err(CaptureError::UnsupportedLinkType(other).into()),
        };

        Ok(Self {
            reader,
            swapped,
            nanos,
            link,
        })
    }

    fn read_u32(&self, buf: &[u8], at: usize) -> u32 {
        let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        if self.swapped {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }
}

impl PacketSource for PcapFileSource {
    fn link_type(&self) -> LinkType {
        self.link
    }

    fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        let mut record = [0u8; 16];
        match self.reader.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CaptureError::operation("read record header", e.to_string()).into()),
        }

        let ts_sec = self.read_u32(&record, 0);
        let ts_frac = self.read_u32(&record, 4);
        let incl_len = self.read_u32(&record, 8);
        if incl_len > MAX_FRAME_LEN {
            return Err(CaptureError::operation(
                "read record",
                format!("frame length {} exceeds limit", incl_len),
            )
            .into());
        }

        let mut data = vec![0u8; incl_len as usize];
        self.reader
            .read_exact(&mut data)
            .map_err(|e| CaptureError::operation("read frame", e.to_string()))?;

        let nanos = if self.nanos { ts_frac } else { ts_frac * 1000 };
        let timestamp = DateTime::<Utc>::from_timestamp(ts_sec as i64, nanos)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_nanos(0));

        Ok(Some(CapturedPacket {
            timestamp,
            data: Bytes::from(data),
        }))
    }
}
