use std::collections::BTreeMap;
use std::str;

use crate::error::DecodeError;
use crate::{DICT_START, INT_START, LENGTH_DELIM, LIST_START, MAX_DEPTH, VALUE_END};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Inner<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(BTreeMap<&'a [u8], Value<'a>>),
}

/// A decoded bencode value borrowing from the input buffer.
///
/// Every value keeps the exact byte span it was decoded from, available
/// through [`Value::raw_bytes`]. Dictionary keys must be strictly ascending
/// in byte order; anything else fails the decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value<'a> {
    inner: Inner<'a>,
    raw: &'a [u8],
}

impl<'a> Value<'a> {
    /// Decode a buffer holding exactly one bencode value.
    ///
    /// # Errors
    ///
    /// Fails with a [`DecodeError`] describing the first malformed byte, or
    /// with [`DecodeError::TrailingBytes`] when the buffer continues past the
    /// decoded value.
    pub fn decode(bytes: &'a [u8]) -> Result<Value<'a>, DecodeError> {
        let (value, consumed) = Self::decode_prefix(bytes)?;

        if consumed != bytes.len() {
            return Err(DecodeError::TrailingBytes {
                pos: consumed,
                trailing: bytes.len() - consumed,
            });
        }

        Ok(value)
    }

    /// Decode one value from the front of a buffer, returning it together
    /// with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Fails with a [`DecodeError`] describing the first malformed byte.
    pub fn decode_prefix(bytes: &'a [u8]) -> Result<(Value<'a>, usize), DecodeError> {
        let value = decode_value(bytes, 0, 0)?;
        let consumed = value.raw.len();

        Ok((value, consumed))
    }

    /// The exact bytes this value was decoded from.
    #[must_use]
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.raw
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self.inner {
            Inner::Int(n) => Some(n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.inner {
            Inner::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a UTF-8 string, when it is a byte string holding valid
    /// UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        match self.inner {
            Inner::Bytes(b) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self.inner {
            Inner::List(ref l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<&'a [u8], Value<'a>>> {
        match self.inner {
            Inner::Dict(ref d) => Some(d),
            _ => None,
        }
    }

    /// Look a key up in a dictionary value. Returns `None` when the value is
    /// not a dictionary or the key is absent.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<&Value<'a>> {
        match self.inner {
            Inner::Dict(ref d) => d.get(key),
            _ => None,
        }
    }
}

fn peek(bytes: &[u8], pos: usize) -> Result<u8, DecodeError> {
    bytes.get(pos).copied().ok_or(DecodeError::UnexpectedEnd { pos })
}

fn decode_value(bytes: &[u8], pos: usize, depth: usize) -> Result<Value<'_>, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep { pos });
    }

    match peek(bytes, pos)? {
        INT_START => decode_int(bytes, pos),
        LIST_START => decode_list(bytes, pos, depth),
        DICT_START => decode_dict(bytes, pos, depth),
        b'0'..=b'9' => decode_bytes(bytes, pos),
        byte => Err(DecodeError::InvalidByte { byte, pos }),
    }
}

fn decode_int(bytes: &[u8], pos: usize) -> Result<Value<'_>, DecodeError> {
    let digits_start = pos + 1;
    let Some(len) = bytes[digits_start..].iter().position(|b| *b == VALUE_END) else {
        return Err(DecodeError::UnterminatedInt { pos });
    };
    let digits = &bytes[digits_start..digits_start + len];

    check_decimal(digits, pos)?;

    let text = str::from_utf8(digits).map_err(|_| DecodeError::InvalidInt { pos })?;
    let n: i64 = text.parse().map_err(|_| DecodeError::InvalidInt { pos })?;

    let end = digits_start + len + 1;
    Ok(Value {
        inner: Inner::Int(n),
        raw: &bytes[pos..end],
    })
}

/// Rejects the non-canonical spellings: empty digit runs, `-0`, and leading
/// zeros on anything other than plain `0`.
fn check_decimal(digits: &[u8], pos: usize) -> Result<(), DecodeError> {
    match digits {
        [] | [b'-'] => Err(DecodeError::InvalidInt { pos }),
        [b'-', b'0', ..] => Err(DecodeError::NegativeZero { pos }),
        [b'0', _, ..] => Err(DecodeError::LeadingZeros { pos }),
        _ => Ok(()),
    }
}

fn decode_bytes(bytes: &[u8], pos: usize) -> Result<Value<'_>, DecodeError> {
    let Some(len) = bytes[pos..].iter().position(|b| *b == LENGTH_DELIM) else {
        return Err(DecodeError::UnexpectedEnd { pos: bytes.len() });
    };
    let digits = &bytes[pos..pos + len];

    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::InvalidInt { pos });
    }
    check_decimal(digits, pos)?;

    let text = str::from_utf8(digits).map_err(|_| DecodeError::InvalidInt { pos })?;
    let length: usize = text.parse().map_err(|_| DecodeError::InvalidInt { pos })?;

    let content_start = pos + len + 1;
    let end = content_start
        .checked_add(length)
        .filter(|end| *end <= bytes.len())
        .ok_or(DecodeError::LengthOverflow { pos })?;

    Ok(Value {
        inner: Inner::Bytes(&bytes[content_start..end]),
        raw: &bytes[pos..end],
    })
}

fn decode_list(bytes: &[u8], pos: usize, depth: usize) -> Result<Value<'_>, DecodeError> {
    let mut items = Vec::new();
    let mut cursor = pos + 1;

    loop {
        match peek(bytes, cursor) {
            Ok(VALUE_END) => break,
            Ok(_) => {}
            Err(_) => return Err(DecodeError::UnterminatedContainer { pos }),
        }

        let item = decode_value(bytes, cursor, depth + 1)?;
        cursor += item.raw.len();
        items.push(item);
    }

    let end = cursor + 1;
    Ok(Value {
        inner: Inner::List(items),
        raw: &bytes[pos..end],
    })
}

fn decode_dict(bytes: &[u8], pos: usize, depth: usize) -> Result<Value<'_>, DecodeError> {
    let mut entries = BTreeMap::new();
    let mut last_key: Option<&[u8]> = None;
    let mut cursor = pos + 1;

    loop {
        match peek(bytes, cursor) {
            Ok(VALUE_END) => break,
            Ok(_) => {}
            Err(_) => return Err(DecodeError::UnterminatedContainer { pos }),
        }

        let key_pos = cursor;
        let key_value = decode_bytes(bytes, cursor)?;
        cursor += key_value.raw.len();
        let key = match key_value.inner {
            Inner::Bytes(b) => b,
            _ => unreachable!("decode_bytes only produces byte strings"),
        };

        // Keys must re-encode to the input, so the decoder enforces the
        // canonical strictly-ascending order up front.
        if let Some(previous) = last_key {
            if key == previous {
                return Err(DecodeError::DuplicateKey {
                    pos: key_pos,
                    key: key.to_vec(),
                });
            }
            if key < previous {
                return Err(DecodeError::UnsortedKey {
                    pos: key_pos,
                    key: key.to_vec(),
                });
            }
        }
        last_key = Some(key);

        let value = decode_value(bytes, cursor, depth + 1)?;
        cursor += value.raw.len();
        entries.insert(key, value);
    }

    let end = cursor + 1;
    Ok(Value {
        inner: Inner::Dict(entries),
        raw: &bytes[pos..end],
    })
}

impl<'a> Value<'a> {
    /// Copy this value into an owned [`crate::Bencode`] tree.
    #[must_use]
    pub fn to_owned_value(&self) -> crate::Bencode {
        match self.inner {
            Inner::Int(n) => crate::Bencode::Int(n),
            Inner::Bytes(b) => crate::Bencode::Bytes(b.to_vec()),
            Inner::List(ref items) => {
                crate::Bencode::List(items.iter().map(Value::to_owned_value).collect())
            }
            Inner::Dict(ref entries) => crate::Bencode::Dict(
                entries
                    .iter()
                    .map(|(key, value)| (key.to_vec(), value.to_owned_value()))
                    .collect(),
            ),
        }
    }
}
