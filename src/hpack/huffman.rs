//! Huffman coding per RFC 7541 Appendix B.
//!
//! Codes are derived canonically from the fixed per-symbol code lengths
//! defined by the RFC (the RFC's codes are themselves a canonical Huffman
//! code for those lengths: symbols ordered by `(length, symbol)`, codes
//! assigned as consecutive integers, left-shifted whenever length
//! increases). Deriving the bit patterns from the length table keeps the 257
//! magic numbers down to one per symbol instead of two, and lets the decoder
//! be built once, at first use, as a binary trie rather than hand-maintained
//! alongside the encoder.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::OnceLock;

/// Code length, in bits, for each of the 256 byte values plus the EOS
/// symbol (index 256). https://httpwg.org/specs/rfc7541.html#huffman.code
#[rustfmt::skip]
const LENGTHS: [u8; 257] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
     6, 10, 10, 12, 13,  6,  8, 11, 10, 10,  8, 11,  8,  6,  6,  6,
     5,  5,  5,  6,  6,  6,  6,  6,  6,  6,  7,  8, 15,  6, 12, 10,
    13,  6,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,
     7,  7,  7,  7,  7,  7,  7,  7,  8,  7,  8, 13, 19, 13, 14,  6,
    15,  5,  6,  5,  6,  5,  6,  6,  6,  5,  7,  7,  6,  6,  6,  5,
     6,  7,  6,  5,  5,  6,  7,  7,  7,  7,  7, 15, 11, 14, 13, 28,
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 24,
    24, 23, 24, 24, 24, 24, 24, 24, 26, 26, 25, 24, 24, 24, 26, 26,
    26, 26, 26, 26, 26, 27, 26, 26, 26, 26, 26, 25, 26, 26, 26, 26,
    26, 26, 27, 26, 26, 26, 26, 26, 26, 27, 26, 26, 26, 26, 26, 26,
    26, 26, 26, 26, 27, 28, 27, 27, 27, 27, 27, 27, 26, 27, 27, 27,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 26,
    30,
];

pub const EOS: usize = 256;

/// (code, length) pairs for all 257 symbols, canonically derived from
/// `LENGTHS` once and cached.
fn codes() -> &'static [(u32, u8); 257] {
    static CODES: OnceLock<[(u32, u8); 257]> = OnceLock::new();
    CODES.get_or_init(|| {
        let mut order: Vec<usize> = (0..257).collect();
        order.sort_by_key(|&sym| (LENGTHS[sym], sym));

        let mut out = [(0u32, 0u8); 257];
        let mut code: u32 = 0;
        let mut prev_len = LENGTHS[order[0]];
        for &sym in &order {
            let len = LENGTHS[sym];
            code <<= len - prev_len;
            out[sym] = (code, len);
            code += 1;
            prev_len = len;
        }
        out
    })
}

/// Encode `input` with the Huffman table, padding the final partial byte
/// with 1 bits (the EOS symbol's leading bits), per RFC 7541 §5.2.
#[must_use]
pub fn encode(input: &[u8]) -> Bytes {
    let table = codes();
    let mut out = BytesMut::with_capacity(input.len());
    let mut acc: u64 = 0;
    let mut acc_bits: u32 = 0;

    for &byte in input {
        let (code, len) = table[byte as usize];
        acc = (acc << len) | u64::from(code);
        acc_bits += u32::from(len);
        while acc_bits >= 8 {
            acc_bits -= 8;
            out.put_u8(((acc >> acc_bits) & 0xFF) as u8);
        }
    }
    if acc_bits > 0 {
        let pad_bits = 8 - acc_bits;
        let last = ((acc << pad_bits) | ((1u64 << pad_bits) - 1)) & 0xFF;
        out.put_u8(last as u8);
    }
    out.freeze()
}

/// Worst case, Huffman coding never expands the input by more than this
/// factor (the shortest code is 5 bits).
#[must_use]
pub fn max_encoded_len(plain_len: usize) -> usize {
    (plain_len * 8 + 4) / 5
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum HuffmanError {
    #[error("Huffman string contains the EOS symbol")]
    EosInBody,
    #[error("Huffman padding is not all 1 bits, or is longer than 7 bits")]
    InvalidPadding,
}

struct Node {
    // Either a leaf (symbol) or an internal node with two children.
    children: Option<[u32; 2]>,
    symbol: Option<u16>,
}

/// Decode tree, built once from `codes()`.
fn tree() -> &'static Vec<Node> {
    static TREE: OnceLock<Vec<Node>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes = vec![Node {
            children: Some([0, 0]),
            symbol: None,
        }];
        nodes[0].children = None; // root starts as a pending internal node
        nodes[0] = Node {
            children: Some([u32::MAX, u32::MAX]),
            symbol: None,
        };

        for (sym, &(code, len)) in codes().iter().enumerate() {
            let mut current = 0usize;
            for bit_index in (0..len).rev() {
                let bit = ((code >> bit_index) & 1) as usize;
                let next = nodes[current].children.expect("leaf reused as internal")[bit];
                if next == u32::MAX {
                    nodes.push(Node {
                        children: Some([u32::MAX, u32::MAX]),
                        symbol: None,
                    });
                    let new_index = (nodes.len() - 1) as u32;
                    nodes[current].children.as_mut().unwrap()[bit] = new_index;
                    current = new_index as usize;
                } else {
                    current = next as usize;
                }
            }
            nodes[current].children = None;
            nodes[current].symbol = Some(sym as u16);
        }
        nodes
    })
}

/// Decode a Huffman-coded string. Rejects an embedded EOS symbol and a
/// padding tail that is not all-1s or longer than 7 bits, per spec §4.2 /
/// RFC 7541 §5.2.
pub fn decode(input: &[u8]) -> Result<Bytes, HuffmanError> {
    let tree = tree();
    let mut out = BytesMut::with_capacity(input.len() * 2);
    let mut current = 0usize;
    let mut last_leaf_bit = 0usize; // bit position (from the end) of the last completed leaf
    let total_bits = input.len() * 8;

    for (i, &byte) in input.iter().enumerate() {
        for b in (0..8).rev() {
            let bit = ((byte >> b) & 1) as usize;
            let bit_pos = i * 8 + (7 - b);
            let node = &tree[current];
            let children = node
                .children
                .expect("decode reached a symbol mid-traversal");
            let next = children[bit];
            if next == u32::MAX {
                return Err(HuffmanError::InvalidPadding);
            }
            current = next as usize;
            if let Some(symbol) = tree[current].symbol {
                if symbol as usize == EOS {
                    return Err(HuffmanError::EosInBody);
                }
                out.put_u8(symbol as u8);
                current = 0;
                last_leaf_bit = bit_pos + 1;
            }
        }
    }

    if current != 0 {
        // Unterminated code left over: must be a prefix of all-1s padding of
        // at most 7 bits.
        let remaining_bits = total_bits - last_leaf_bit;
        if remaining_bits > 7 {
            return Err(HuffmanError::InvalidPadding);
        }
        if !is_all_ones_from(current, &tree) {
            return Err(HuffmanError::InvalidPadding);
        }
    }

    Ok(out.freeze())
}

/// Whether every path from `node` down to EOS's bit pattern is all 1-bits
/// (i.e. the remaining unterminated bits are a valid padding prefix).
fn is_all_ones_from(node: usize, tree: &[Node]) -> bool {
    match tree[node].children {
        None => tree[node].symbol == Some(EOS as u16),
        Some(children) => {
            let one_child = children[1];
            one_child != u32::MAX && is_all_ones_from(one_child as usize, tree)
        }
    }
}
