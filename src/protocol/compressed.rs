//! Compressed message handling (opcode 2012)
//!
//! A compressed message wraps another operation: the body carries the
//! original opcode, the uncompressed size, a compressor id, and the
//! compressed bytes. The codec unwraps it and re-dispatches with a
//! synthesized header carrying the original opcode.

use crate::error::{ProtocolError, Result};
use crate::protocol::header::{MsgHeader, HEADER_LEN};
use crate::protocol::wire::{WireReader, WireWriter};
use std::io::{Read, Write};

/// Compressor ids defined by the wire protocol
pub const COMPRESSOR_NOOP: u8 = 0;
pub const COMPRESSOR_SNAPPY: u8 = 1;
pub const COMPRESSOR_ZLIB: u8 = 2;
pub const COMPRESSOR_ZSTD: u8 = 3;

/// Unwrap a compressed body into (synthesized header, uncompressed body)
///
/// `header` is the outer compressed-message header; its request/response
/// ids are preserved in the synthesized inner header.
pub fn unwrap(header: &MsgHeader, body: &[u8]) -> Result<(MsgHeader, Vec<u8>)> {
    let mut r = WireReader::new(body);
    let original_opcode = r.read_i32()?;
    let uncompressed_size = r.read_i32()?;
    let compressor_id = r.read_u8()?;
    let compressed = r.read_rest();

    let inner = decompress(compressor_id, compressed)?;
    if inner.len() != uncompressed_size as usize {
        return Err(ProtocolError::operation(
            "decompress",
            format!(
                "declared {} uncompressed bytes, got {}",
                uncompressed_size,
                inner.len()
            ),
        )
        .into());
    }

    let inner_header = MsgHeader {
        message_length: (HEADER_LEN + inner.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_opcode,
    };
    Ok((inner_header, inner))
}

/// Build a compressed body wrapping `inner_opcode` + `inner_body`
pub fn wrap(inner_opcode: i32, inner_body: &[u8], compressor_id: u8) -> Result<Vec<u8>> {
    let compressed = compress(compressor_id, inner_body)?;
    let mut w = WireWriter::new();
    w.write_i32(inner_opcode);
    w.write_i32(inner_body.len() as i32);
    w.write_u8(compressor_id);
    w.write_bytes(&compressed);
    Ok(w.into_bytes())
}

fn decompress(compressor_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        COMPRESSOR_NOOP => Ok(data.to_vec()),
        COMPRESSOR_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| ProtocolError::operation("snappy decompress", e.to_string()).into()),
        COMPRESSOR_ZLIB => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ProtocolError::operation("zlib decompress", e.to_string()))?;
            Ok(out)
        }
        COMPRESSOR_ZSTD => zstd::stream::decode_all(data)
            .map_err(|e| ProtocolError::operation("zstd decompress", e.to_string()).into()),
        other => Err(ProtocolError::UnsupportedCompressor(other).into()),
    }
}

fn compress(compressor_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        COMPRESSOR_NOOP => Ok(data.to_vec()),
        COMPRESSOR_SNAPPY => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| ProtocolError::operation("snappy compress", e.to_string()).into()),
        COMPRESSOR_ZLIB => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)
                .and_then(|_| enc.finish())
                .map_err(|e| ProtocolError::operation("zlib compress", e.to_string()).into())
        }
        COMPRESSOR_ZSTD => zstd::stream::encode_all(data, 0)
            .map_err(|e| ProtocolError::operation("zstd compress", e.to_string()).into()),
        other => Err(ProtocolError::UnsupportedCompressor(other).into()),
    }
}
