//! The witness stack attached to a transaction input.

use core::{fmt, ops::Index, slice};

use bitcoin::{
    hex::DisplayHex,
    io::{self, BufRead, Write},
};
use log::debug;

use crate::codec::{self, DecodeError, MAX_BLOCK_WEIGHT};

/// Largest element a script push may carry.
pub const MAX_PUSH_DATA_SIZE: usize = 520;

const HASH_SIZE: usize = 32;

/// A decoded witness stack.
///
/// Witnesses built from an explicit stack are always valid. Witnesses produced by
/// [`Witness::from_data`] or [`Witness::from_reader`] carry a validity flag that is
/// cleared, together with the stack, when the stream was inconsistent. Use
/// [`Witness::decode`] to get the parse failure as an error instead.
///
/// The default witness is empty and invalid: nothing has been parsed into it.
#[derive(Debug, Clone, Default)]
pub struct Witness {
    stack: Vec<Vec<u8>>,
    valid: bool,
}

impl Witness {
    /// Wraps an existing stack.
    pub fn new(stack: Vec<Vec<u8>>) -> Self {
        Self { stack, valid: true }
    }

    /// Decodes a witness, bounding every declared size by [`MAX_BLOCK_WEIGHT`].
    pub fn decode<R: BufRead + ?Sized>(reader: &mut R, prefix: bool) -> Result<Self, DecodeError> {
        Self::decode_within(reader, prefix, MAX_BLOCK_WEIGHT)
    }

    /// Decodes a witness with a caller-chosen allocation bound.
    pub fn decode_within<R: BufRead + ?Sized>(
        reader: &mut R,
        prefix: bool,
        max: usize,
    ) -> Result<Self, DecodeError> {
        codec::decode_stack(reader, prefix, max).map(Self::new)
    }

    /// Parses a witness from a stream, yielding an invalid witness on failure.
    pub fn from_reader<R: BufRead + ?Sized>(reader: &mut R, prefix: bool) -> Self {
        let mut witness = Self::default();
        witness.read_from(reader, prefix);
        witness
    }

    /// Parses a witness from a byte buffer, yielding an invalid witness on failure.
    ///
    /// Bytes following a complete prefixed witness are left unread.
    pub fn from_data(mut data: &[u8], prefix: bool) -> Self {
        Self::from_reader(&mut data, prefix)
    }

    /// Discards the current stack and parses a new one in its place.
    ///
    /// Returns the resulting validity.
    pub fn read_from<R: BufRead + ?Sized>(&mut self, reader: &mut R, prefix: bool) -> bool {
        self.clear();
        match Self::decode(reader, prefix) {
            Ok(witness) => {
                *self = witness;
                true
            }
            Err(err) => {
                debug!("discarding witness: {err}");
                false
            }
        }
    }

    /// Serializes the witness into a new buffer.
    pub fn to_data(&self, prefix: bool) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.serialized_size(prefix));
        self.write_to(&mut data, prefix)
            .expect("writing to a vector cannot fail");
        data
    }

    /// Serializes the witness into `writer`, returning the number of bytes written.
    ///
    /// # Panics
    ///
    /// If the bytes written disagree with [`Witness::serialized_size`].
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, prefix: bool) -> Result<usize, io::Error> {
        let written = codec::encode_stack(&self.stack, writer, prefix)?;
        assert_eq!(
            written,
            self.serialized_size(prefix),
            "witness serialization length mismatch"
        );
        Ok(written)
    }

    /// Encoded length, including the element count when `prefix` is set.
    pub fn serialized_size(&self, prefix: bool) -> usize {
        codec::serialized_size(&self.stack, prefix)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Bottom element of the stack.
    ///
    /// # Panics
    ///
    /// If the witness is empty.
    pub fn front(&self) -> &[u8] {
        self.stack.first().expect("front of an empty witness")
    }

    /// Top element of the stack.
    ///
    /// # Panics
    ///
    /// If the witness is empty.
    pub fn back(&self) -> &[u8] {
        self.stack.last().expect("back of an empty witness")
    }

    pub fn iter(&self) -> slice::Iter<'_, Vec<u8>> {
        self.stack.iter()
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    pub fn into_stack(self) -> Vec<Vec<u8>> {
        self.stack
    }

    /// Empties and invalidates the witness.
    pub fn clear(&mut self) {
        self.stack = Vec::new();
        self.valid = false;
    }

    /// Whether every element fits in a single script push.
    pub fn is_push_size(stack: &[Vec<u8>]) -> bool {
        stack.iter().all(|element| element.len() <= MAX_PUSH_DATA_SIZE)
    }

    /// Whether the stack is the coinbase witness reserved value: one 32-byte element.
    pub fn is_reserved_pattern(stack: &[Vec<u8>]) -> bool {
        matches!(stack, [element] if element.len() == HASH_SIZE)
    }
}

impl PartialEq for Witness {
    fn eq(&self, other: &Self) -> bool {
        self.stack == other.stack
    }
}

impl Eq for Witness {}

impl Index<usize> for Witness {
    type Output = [u8];

    fn index(&self, index: usize) -> &[u8] {
        &self.stack[index]
    }
}

impl<'a> IntoIterator for &'a Witness {
    type Item = &'a Vec<u8>;
    type IntoIter = slice::Iter<'a, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.stack.iter()
    }
}

impl From<Vec<Vec<u8>>> for Witness {
    fn from(stack: Vec<Vec<u8>>) -> Self {
        Self::new(stack)
    }
}

impl From<&bitcoin::Witness> for Witness {
    fn from(witness: &bitcoin::Witness) -> Self {
        Self::new(witness.iter().map(<[u8]>::to_vec).collect())
    }
}

impl From<&Witness> for bitcoin::Witness {
    fn from(witness: &Witness) -> Self {
        bitcoin::Witness::from_slice(&witness.stack)
    }
}

impl fmt::Display for Witness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return f.write_str("<invalid>");
        }
        for (position, element) in self.stack.iter().enumerate() {
            if position > 0 {
                f.write_str(" ")?;
            }
            write!(f, "[{:x}]", element.as_slice().as_hex())?;
        }
        Ok(())
    }
}
