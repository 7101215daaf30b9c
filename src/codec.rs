//! BIP144 witness stack serialization.
//!
//! A witness is written either as a top-level field (prefixed by its element
//! count) or as a bare stack (elements until the stream ends). The prefix is an
//! element count, not a byte length, unlike the script wire format.

use core::fmt;

use bitcoin::{
    consensus::{
        encode::{self, VarInt},
        Decodable, Encodable,
    },
    io::{self, BufRead, Write},
};

/// Upper bound on any declared witness element count or element length.
///
/// Script limits only constrain evaluation and not every stack is evaluated, so
/// memory is guarded by the block weight instead.
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Elements reserved up front for a prefixed witness, whatever the declared count.
const MAX_PREALLOCATED_ELEMENTS: usize = 1_000;

/// The declared quantity that a bound check applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Number of elements announced by a prefixed witness.
    ElementCount,
    /// Byte length announced for a single element.
    ElementLength,
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Allocation::ElementCount => "element count",
            Allocation::ElementLength => "element length",
        })
    }
}

/// Reasons a witness stream fails to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// A declared count or length is larger than the allocation bound.
    #[error("witness {kind} {requested} exceeds allocation bound {max}")]
    Oversized {
        kind: Allocation,
        requested: u64,
        max: usize,
    },
    /// A compact-size integer was truncated or not minimally encoded.
    #[error("malformed witness size prefix: {0}")]
    Encoding(#[from] encode::Error),
    /// The stream ended inside an element.
    #[error("witness stream read failed: {0}")]
    Io(#[from] io::Error),
}

/// Checks a declared size against [`MAX_BLOCK_WEIGHT`] before anything is allocated.
pub fn check_allocation(requested: u64, kind: Allocation) -> Result<usize, DecodeError> {
    check_allocation_within(requested, MAX_BLOCK_WEIGHT, kind)
}

/// Checks a declared size against an explicit bound.
pub fn check_allocation_within(
    requested: u64,
    max: usize,
    kind: Allocation,
) -> Result<usize, DecodeError> {
    usize::try_from(requested)
        .ok()
        .filter(|size| *size <= max)
        .ok_or(DecodeError::Oversized {
            kind,
            requested,
            max,
        })
}

pub(crate) fn decode_stack<R: BufRead + ?Sized>(
    reader: &mut R,
    prefix: bool,
    max: usize,
) -> Result<Vec<Vec<u8>>, DecodeError> {
    if prefix {
        let count = check_allocation_within(read_compact_size(reader)?, max, Allocation::ElementCount)?;
        let mut stack = Vec::with_capacity(count.min(MAX_PREALLOCATED_ELEMENTS));
        for _ in 0..count {
            stack.push(read_element(reader, max)?);
        }
        Ok(stack)
    } else {
        let mut stack = Vec::new();
        while !is_exhausted(reader)? {
            stack.push(read_element(reader, max)?);
        }
        Ok(stack)
    }
}

fn read_element<R: BufRead + ?Sized>(reader: &mut R, max: usize) -> Result<Vec<u8>, DecodeError> {
    let len = check_allocation_within(read_compact_size(reader)?, max, Allocation::ElementLength)?;
    let mut element = vec![0u8; len];
    reader.read_exact(&mut element)?;
    Ok(element)
}

fn read_compact_size<R: BufRead + ?Sized>(reader: &mut R) -> Result<u64, DecodeError> {
    Ok(VarInt::consensus_decode(reader)?.0)
}

fn is_exhausted<R: BufRead + ?Sized>(reader: &mut R) -> Result<bool, io::Error> {
    Ok(reader.fill_buf()?.is_empty())
}

pub(crate) fn encode_stack<W: Write + ?Sized>(
    stack: &[Vec<u8>],
    writer: &mut W,
    prefix: bool,
) -> Result<usize, io::Error> {
    let mut written = 0usize;
    if prefix {
        written += VarInt(stack.len() as u64).consensus_encode(writer)?;
    }
    for element in stack {
        written += VarInt(element.len() as u64).consensus_encode(writer)?;
        writer.write_all(element)?;
        written += element.len();
    }
    Ok(written)
}

pub(crate) fn serialized_size(stack: &[Vec<u8>], prefix: bool) -> usize {
    let elements: usize = stack
        .iter()
        .map(|element| compact_size_len(element.len() as u64) + element.len())
        .sum();
    if prefix {
        compact_size_len(stack.len() as u64) + elements
    } else {
        elements
    }
}

pub(crate) fn compact_size_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
