//! HPACK header compression, RFC 7541. Spec §4.2.
//!
//! Kept as a pure, transport-free codec — `Encoder::encode` and
//! `Decoder::decode` operate on in-memory header lists and byte blocks only,
//! with no knowledge of frames or streams. [`crate::connection`] is
//! responsible for assembling a header block out of possibly-fragmented
//! HEADERS/CONTINUATION payloads before handing it to the decoder.

mod huffman;
mod table;

use crate::error::{Error, ErrorCode};
use crate::types::{HeaderField, HeaderList};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use table::Table;

/// Headers a well-behaved encoder never inserts into the dynamic table,
/// since their values are typically high-entropy or sensitive and reused
/// verbatim would defeat little, per RFC 7541 §7.1's guidance on
/// never-indexed literals.
const NEVER_INDEX: &[&[u8]] = &[b"authorization", b"cookie", b"set-cookie"];

fn compression_error(message: impl Into<String>) -> Error {
    Error::connection(ErrorCode::CompressionError, message)
}

/// Encode an HPACK integer with an N-bit prefix, RFC 7541 §5.1.
fn encode_integer(out: &mut BytesMut, mut value: usize, prefix_bits: u8, prefix_pattern: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(prefix_pattern | value as u8);
        return;
    }
    out.put_u8(prefix_pattern | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.put_u8(((value % 128) | 0x80) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

/// Decode an HPACK integer given the already-consumed prefix byte's low bits.
fn decode_integer(buf: &mut Bytes, prefix_bits: u8, first_byte: u8) -> Result<usize, Error> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (first_byte & max_prefix as u8) as usize;
    if value < max_prefix {
        return Ok(value);
    }
    let mut m = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(compression_error("truncated HPACK integer"));
        }
        let b = buf.get_u8();
        value += ((b & 0x7f) as usize)
            .checked_shl(m)
            .ok_or_else(|| compression_error("HPACK integer overflow"))?;
        if b & 0x80 == 0 {
            break;
        }
        m += 7;
        if m > 63 {
            return Err(compression_error("HPACK integer overflow"));
        }
    }
    Ok(value)
}

fn encode_string(out: &mut BytesMut, value: &[u8]) {
    let huffman = huffman::encode(value);
    if huffman.len() < value.len() {
        encode_integer(out, huffman.len(), 7, 0x80);
        out.extend_from_slice(&huffman);
    } else {
        encode_integer(out, value.len(), 7, 0x00);
        out.extend_from_slice(value);
    }
}

fn decode_string(buf: &mut Bytes) -> Result<Bytes, Error> {
    if !buf.has_remaining() {
        return Err(compression_error("truncated HPACK string"));
    }
    let first = buf.get_u8();
    let is_huffman = first & 0x80 != 0;
    let len = decode_integer(buf, 7, first)?;
    if buf.remaining() < len {
        return Err(compression_error("HPACK string length exceeds block"));
    }
    let raw = buf.copy_to_bytes(len);
    if is_huffman {
        huffman::decode(&raw).map_err(|e| compression_error(e.to_string()))
    } else {
        Ok(raw)
    }
}

/// How a header field should be represented on the wire. `encode` picks one
/// per field, per spec §4.2's encoder policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Representation {
    Indexed,
    LiteralWithIncrementalIndexing,
    LiteralWithoutIndexing,
    LiteralNeverIndexed,
}

fn representation_for(field: &HeaderField) -> Representation {
    if NEVER_INDEX.contains(&&field.name[..]) {
        Representation::LiteralNeverIndexed
    } else if field.is_pseudo()
        || field.name == &b"content-length"[..]
        || field.name == &b"date"[..]
    {
        Representation::LiteralWithoutIndexing
    } else {
        Representation::LiteralWithIncrementalIndexing
    }
}

/// Stateful HPACK encoder: one instance per connection direction, per spec
/// §4.2's "coupled to one connection" invariant.
#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    /// A dynamic table size update queued by a SETTINGS change, emitted as
    /// the first instruction of the next encoded block.
    pending_resize: Option<usize>,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_resize: None,
        }
    }

    /// Applied when the peer's SETTINGS_HEADER_TABLE_SIZE changes; emits a
    /// dynamic table size update as the first instruction in the next block
    /// (RFC 7541 §6.3), by recording intent for the next `encode` call.
    pub fn set_max_dynamic_table_size(&mut self, new_max_size: usize) {
        self.pending_resize = Some(new_max_size);
    }

    #[must_use]
    pub fn dynamic_table_size(&self) -> usize {
        self.table.current_size()
    }

    pub fn encode(&mut self, headers: &HeaderList) -> Bytes {
        let mut out = BytesMut::with_capacity(headers.len() * 16);

        if let Some(new_size) = self.pending_resize.take() {
            self.table.resize(new_size);
            encode_integer(&mut out, new_size, 5, 0x20);
        }

        for field in headers {
            if let Some(index) = self.find_indexed(field) {
                encode_integer(&mut out, index, 7, 0x80);
                continue;
            }

            let representation = representation_for(field);
            let (prefix_bits, prefix_pattern) = match representation {
                Representation::LiteralWithIncrementalIndexing => (6, 0x40),
                Representation::LiteralWithoutIndexing => (4, 0x00),
                Representation::LiteralNeverIndexed => (4, 0x10),
                Representation::Indexed => unreachable!("handled above"),
            };

            if let Some(name_index) = self.find_name_only(&field.name) {
                encode_integer(&mut out, name_index, prefix_bits, prefix_pattern);
            } else {
                out.put_u8(prefix_pattern);
                encode_string(&mut out, &field.name);
            }
            encode_string(&mut out, &field.value);

            if representation == Representation::LiteralWithIncrementalIndexing {
                self.table.push(field.name.clone(), field.value.clone());
            }
        }

        out.freeze()
    }

    fn find_indexed(&self, field: &HeaderField) -> Option<usize> {
        (1..=self.table.len()).find(|&i| {
            self.table
                .get(i)
                .is_some_and(|(n, v)| n == &field.name[..] && v == &field.value[..])
        })
    }

    fn find_name_only(&self, name: &[u8]) -> Option<usize> {
        (1..=self.table.len()).find(|&i| self.table.get(i).is_some_and(|(n, _)| n == name))
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(crate::settings::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

/// Stateful HPACK decoder. See [`Encoder`].
#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    max_dynamic_table_size: usize,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            max_dynamic_table_size: dynamic_table_size,
        }
    }

    /// Applied when our own SETTINGS_HEADER_TABLE_SIZE changes; bounds any
    /// size update the peer's encoder is allowed to request.
    pub fn set_max_dynamic_table_size(&mut self, new_max_size: usize) {
        self.max_dynamic_table_size = new_max_size;
        self.table.resize(self.table.max_size().min(new_max_size));
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, Error> {
        let mut buf = Bytes::copy_from_slice(block);
        let mut headers = HeaderList::new();
        // RFC 7541 §4.2 / spec §4.2: a size update is only legal as one of
        // the leading instructions of a header block — once any indexed or
        // literal representation has been seen, a later size update is a
        // COMPRESSION_ERROR rather than a silent resize.
        let mut seen_representation = false;

        while buf.has_remaining() {
            let first = buf.get_u8();
            if first & 0x80 != 0 {
                let index = decode_integer(&mut buf, 7, first)?;
                let (name, value) = self
                    .table
                    .get(index)
                    .ok_or_else(|| compression_error(format!("invalid HPACK index {index}")))?;
                headers.push(HeaderField::new(name.clone(), value.clone()));
                seen_representation = true;
            } else if first & 0x40 != 0 {
                let field = self.decode_literal(&mut buf, first, 6)?;
                self.table.push(field.name.clone(), field.value.clone());
                headers.push(field);
                seen_representation = true;
            } else if first & 0x20 != 0 {
                if seen_representation {
                    return Err(compression_error(
                        "dynamic table size update must precede all other representations in a header block",
                    ));
                }
                let new_size = decode_integer(&mut buf, 5, first)?;
                if new_size > self.max_dynamic_table_size {
                    return Err(compression_error(
                        "dynamic table size update exceeds the advertised maximum",
                    ));
                }
                self.table.resize(new_size);
            } else {
                // 0x10 (never indexed) and 0x00 (without indexing) share a
                // 4-bit prefix and differ only in forwarding semantics,
                // which don't matter to a terminal decoder.
                let field = self.decode_literal(&mut buf, first, 4)?;
                headers.push(field);
            }
        }

        Ok(headers)
    }

    fn decode_literal(
        &self,
        buf: &mut Bytes,
        first: u8,
        prefix_bits: u8,
    ) -> Result<HeaderField, Error> {
        let index = decode_integer(buf, prefix_bits, first)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            self.table
                .get(index)
                .map(|(n, _)| n.clone())
                .ok_or_else(|| compression_error(format!("invalid HPACK name index {index}")))?
        };
        let value = decode_string(buf)?;
        Ok(HeaderField::new(name, value))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(crate::settings::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::hpack as their_hpack;

    #[test]
    fn encode_integer_matches_rfc_example() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.example1
        let mut out = BytesMut::new();
        encode_integer(&mut out, 10, 5, 0x00);
        assert_eq!(&out[..], &[0b0000_1010]);
    }

    #[test]
    fn encode_integer_requiring_continuation_matches_rfc_example() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.example3
        let mut out = BytesMut::new();
        encode_integer(&mut out, 1337, 5, 0x00);
        assert_eq!(&out[..], &[0b0001_1111, 0b1001_1010, 0b0000_1010]);
    }

    #[test]
    fn roundtrip_through_own_codec() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();
        let headers = vec![
            HeaderField::new(&b":method"[..], &b"GET"[..]),
            HeaderField::new(&b":path"[..], &b"/"[..]),
            HeaderField::new(&b"x-custom"[..], &b"value"[..]),
        ];
        let encoded = encoder.encode(&headers);
        let decoded = decoder.decode(&encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn repeated_header_becomes_indexed_on_second_use() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();
        let headers = vec![HeaderField::new(&b"x-custom"[..], &b"value"[..])];
        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);
        assert!(second.len() < first.len());
        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn decodes_blocks_produced_by_an_independent_implementation() {
        let mut their_encoder = their_hpack::Encoder::new();
        let wire = their_encoder.encode(vec![(&b":method"[..], &b"GET"[..]), (&b":path"[..], &b"/"[..])]);
        let mut decoder = Decoder::default();
        let decoded = decoder.decode(&wire).unwrap();
        assert_eq!(decoded[0].name.as_ref(), b":method");
        assert_eq!(decoded[0].value.as_ref(), b"GET");
        assert_eq!(decoded[1].name.as_ref(), b":path");
        assert_eq!(decoded[1].value.as_ref(), b"/");
    }

    #[test]
    fn our_blocks_decode_in_an_independent_implementation() {
        let mut encoder = Encoder::default();
        let headers = vec![
            HeaderField::new(&b":method"[..], &b"GET"[..]),
            HeaderField::new(&b":path"[..], &b"/"[..]),
        ];
        let wire = encoder.encode(&headers);
        let mut their_decoder = their_hpack::Decoder::new();
        let decoded = their_decoder.decode(&wire).unwrap();
        assert_eq!(decoded[0].0.as_slice(), b":method");
        assert_eq!(decoded[0].1.as_slice(), b"GET");
    }

    #[test]
    fn invalid_index_is_a_compression_error() {
        let mut decoder = Decoder::default();
        let err = decoder.decode(&[0xFF, 0x00]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CompressionError);
    }

    #[test]
    fn authorization_header_is_never_indexed() {
        let field = HeaderField::new(&b"authorization"[..], &b"Bearer secret"[..]);
        assert_eq!(representation_for(&field), Representation::LiteralNeverIndexed);
    }
}
