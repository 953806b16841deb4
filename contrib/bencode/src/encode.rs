use std::collections::BTreeMap;

/// An owned bencode tree, used to build values for encoding.
///
/// The dictionary variant is backed by a [`BTreeMap`], so encoding emits keys
/// in ascending lexicographic byte order and is canonical by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// A byte-string value from anything that converts into bytes.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Bencode {
        Bencode::Bytes(bytes.into())
    }

    /// A dictionary value from `(key, value)` pairs. Later duplicates of a
    /// key replace earlier ones.
    pub fn dict<K: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (K, Bencode)>) -> Bencode {
        Bencode::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Serialize the tree. The output is byte-for-byte stable for equal
    /// trees.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

impl From<i64> for Bencode {
    fn from(n: i64) -> Bencode {
        Bencode::Int(n)
    }
}

impl From<&str> for Bencode {
    fn from(s: &str) -> Bencode {
        Bencode::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Bencode {
    fn from(bytes: Vec<u8>) -> Bencode {
        Bencode::Bytes(bytes)
    }
}
