//! Typed ABI word decoding
//!
//! Every accessor returns `Option` and fails closed: out-of-range offsets,
//! non-zero padding on narrow types and truncated data all yield `None`,
//! which the normalizer turns into a skipped log.

use super::types::Address;
use num_bigint::{BigInt, Sign};

pub const WORD: usize = 32;

/// Decode a `0x`-prefixed (or bare) hex string.
pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).ok()
}

/// 32-byte topic as raw bytes.
pub fn topic_word(topic: &str) -> Option<[u8; WORD]> {
    let bytes = decode_hex(topic)?;
    bytes.try_into().ok()
}

/// Indexed `address` parameter.
pub fn topic_address(topic: &str) -> Option<Address> {
    let word = topic_word(topic)?;
    address_from_word(&word)
}

/// Indexed `bytes32` parameter, lowercase hex.
pub fn topic_bytes32(topic: &str) -> Option<String> {
    topic_word(topic).map(|w| format!("0x{}", hex::encode(w)))
}

/// Indexed `uint256` parameter.
pub fn topic_uint(topic: &str) -> Option<BigInt> {
    topic_word(topic).map(|w| BigInt::from_bytes_be(Sign::Plus, &w))
}

fn address_from_word(word: &[u8]) -> Option<Address> {
    if word.len() != WORD || word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Some(Address::from_bytes(&bytes))
}

/// Read-only view over ABI-encoded data. Offsets read through a view are
/// relative to the start of that view, which matches how the ABI encodes
/// dynamic members of a tuple.
#[derive(Debug, Clone, Copy)]
pub struct Words<'a> {
    data: &'a [u8],
}

impl<'a> Words<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len_words(&self) -> usize {
        self.data.len() / WORD
    }

    fn word_at_byte(&self, start: usize) -> Option<&'a [u8]> {
        let end = start.checked_add(WORD)?;
        self.data.get(start..end)
    }

    pub fn word(&self, index: usize) -> Option<&'a [u8]> {
        self.word_at_byte(index.checked_mul(WORD)?)
    }

    pub fn address(&self, index: usize) -> Option<Address> {
        address_from_word(self.word(index)?)
    }

    pub fn uint(&self, index: usize) -> Option<BigInt> {
        Some(BigInt::from_bytes_be(Sign::Plus, self.word(index)?))
    }

    pub fn bytes32(&self, index: usize) -> Option<String> {
        Some(format!("0x{}", hex::encode(self.word(index)?)))
    }

    /// Narrow unsigned integer (`uint8`..`uint64`); rejects values with
    /// anything set above the low 8 bytes.
    pub fn u64(&self, index: usize) -> Option<u64> {
        word_to_u64(self.word(index)?)
    }

    pub fn u32(&self, index: usize) -> Option<u32> {
        self.u64(index).and_then(|v| u32::try_from(v).ok())
    }

    pub fn u8(&self, index: usize) -> Option<u8> {
        self.u64(index).and_then(|v| u8::try_from(v).ok())
    }

    /// Byte offset stored in head word `index`, bounds-checked against the view.
    pub fn offset(&self, index: usize) -> Option<usize> {
        let off = usize::try_from(self.u64(index)?).ok()?;
        if off > self.data.len() {
            return None;
        }
        Some(off)
    }

    /// Dynamic tuple referenced by head word `index`.
    pub fn tuple(&self, index: usize) -> Option<Words<'a>> {
        let off = self.offset(index)?;
        Some(Words::new(&self.data[off..]))
    }

    /// Static tuple of `width` words starting at head word `index`.
    pub fn inline(&self, index: usize, width: usize) -> Option<Words<'a>> {
        let start = index.checked_mul(WORD)?;
        let end = start.checked_add(width.checked_mul(WORD)?)?;
        self.data.get(start..end).map(Words::new)
    }

    /// `(length, element-area view)` of the dynamic array at head word `index`.
    fn array(&self, index: usize, elem_words: usize) -> Option<(usize, Words<'a>)> {
        let off = self.offset(index)?;
        let len = usize::try_from(word_to_u64(self.word_at_byte(off)?)?).ok()?;
        let start = off + WORD;
        let bytes = len.checked_mul(elem_words)?.checked_mul(WORD)?;
        let end = start.checked_add(bytes)?;
        let area = self.data.get(start..end)?;
        Some((len, Words::new(area)))
    }

    pub fn address_array(&self, index: usize) -> Option<Vec<Address>> {
        let (len, area) = self.array(index, 1)?;
        (0..len).map(|i| area.address(i)).collect()
    }

    pub fn uint_array(&self, index: usize) -> Option<Vec<BigInt>> {
        let (len, area) = self.array(index, 1)?;
        (0..len).map(|i| area.uint(i)).collect()
    }

    /// Array of static tuples, each `width` words wide.
    pub fn tuple_array(&self, index: usize, width: usize) -> Option<Vec<Words<'a>>> {
        let (len, area) = self.array(index, width)?;
        (0..len).map(|i| area.inline(i * width, width)).collect()
    }

    /// Dynamic `string`. Invalid UTF-8 becomes the empty string; a
    /// truncated encoding is `None`.
    pub fn string(&self, index: usize) -> Option<String> {
        let off = self.offset(index)?;
        let len = usize::try_from(word_to_u64(self.word_at_byte(off)?)?).ok()?;
        let start = off + WORD;
        let bytes = self.data.get(start..start.checked_add(len)?)?;
        Some(String::from_utf8(bytes.to_vec()).unwrap_or_default())
    }
}

fn word_to_u64(word: &[u8]) -> Option<u64> {
    if word.len() != WORD || word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(buf))
}
