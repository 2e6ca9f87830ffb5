//! Header compression adapter
//!
//! Wraps the `hpack` crate's stateful encoder and decoder. Both contexts are
//! scoped to one connection and advance on every header block, so:
//!
//! - [`HeaderEncoder`] lives inside the connection lock and every block it
//!   produces must be queued for transmission before the lock is released
//! - [`HeaderDecoder`] is owned by the single reader thread
//!
//! A decode failure leaves the decoder in an unknown state. Callers must treat
//! it as fatal for the connection.

use super::error::{Error, Result};
use super::DEFAULT_HEADER_TABLE_SIZE;
use ::hpack::encoder::encode_integer_into;
use bytes::Bytes;
use std::io;

/// An ordered list of header fields
///
/// Order is significant: pseudo-headers come first and duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        HeaderList::default()
    }

    /// Request pseudo-headers in canonical order
    pub fn request(method: &str, scheme: &str, authority: &str, path: &str) -> Self {
        let mut list = HeaderList::new();
        list.push(":method", method);
        list.push(":scheme", scheme);
        list.push(":authority", authority);
        list.push(":path", path);
        list
    }

    /// Response pseudo-header
    pub fn response(status: u16) -> Self {
        let mut list = HeaderList::new();
        list.push(":status", status.to_string());
        list
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Append regular headers, lowercasing names as HTTP/2 requires
    pub fn extend_regular<'a, I>(&mut self, headers: I)
    where
        I: IntoIterator<Item = &'a (&'a str, &'a str)>,
    {
        for (name, value) in headers {
            self.push(name.to_ascii_lowercase(), *value);
        }
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sum of name and value lengths plus 32 octets per field
    /// (RFC 7540 Section 6.5.2)
    pub fn list_size(&self) -> usize {
        self.fields.iter().map(|(n, v)| n.len() + v.len() + 32).sum()
    }
}

impl From<Vec<(String, String)>> for HeaderList {
    fn from(fields: Vec<(String, String)>) -> Self {
        HeaderList { fields }
    }
}

/// Connection-scoped HPACK encoder
///
/// The inner encoder indexes into a 4096-octet dynamic table. Once the peer
/// announces a smaller SETTINGS_HEADER_TABLE_SIZE the encoder signals the new
/// size and emits only non-indexed literals from then on.
pub struct HeaderEncoder {
    inner: ::hpack::Encoder<'static>,
    blocks: u64,
    literal_only: bool,
    size_update: Option<usize>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            inner: ::hpack::Encoder::new(),
            blocks: 0,
            literal_only: false,
            size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size < DEFAULT_HEADER_TABLE_SIZE {
            let size = size as usize;
            self.literal_only = true;
            self.size_update = Some(self.size_update.map_or(size, |pending| pending.min(size)));
        }
    }

    /// Whether blocks stay clear of the peer's dynamic table
    pub fn is_literal_only(&self) -> bool {
        self.literal_only
    }

    /// Compress `headers` into a header block, advancing the context
    pub fn encode(&mut self, headers: &HeaderList) -> Result<Bytes> {
        let mut block = Vec::with_capacity(headers.list_size() / 2);
        let encoded = if self.literal_only {
            self.encode_literals(headers, &mut block)
        } else {
            self.inner
                .encode_into(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block)
        };
        encoded.map_err(|e| Error::Compression(e.to_string()))?;
        self.blocks += 1;
        Ok(Bytes::from(block))
    }

    fn encode_literals(&mut self, headers: &HeaderList, block: &mut Vec<u8>) -> io::Result<()> {
        // A pending size update must open the first block after the change
        if let Some(size) = self.size_update.take() {
            encode_integer_into(size, 5, 0x20, block)?;
        }
        for (name, value) in headers.iter() {
            block.push(0x00);
            for literal in [name.as_bytes(), value.as_bytes()] {
                encode_integer_into(literal.len(), 7, 0, block)?;
                block.extend_from_slice(literal);
            }
        }
        Ok(())
    }

    /// Number of blocks encoded so far
    pub fn blocks_encoded(&self) -> u64 {
        self.blocks
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection-scoped HPACK decoder
pub struct HeaderDecoder {
    inner: ::hpack::Decoder<'static>,
    max_list_size: Option<usize>,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        HeaderDecoder {
            inner: ::hpack::Decoder::new(),
            max_list_size: None,
        }
    }

    /// Reject decoded lists above `size` (our SETTINGS_MAX_HEADER_LIST_SIZE)
    pub fn with_max_list_size(mut self, size: Option<u32>) -> Self {
        self.max_list_size = size.map(|s| s as usize);
        self
    }

    /// Decompress a complete header block, advancing the context
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList> {
        let decoded = self
            .inner
            .decode(block)
            .map_err(|e| Error::HeaderDecompression(format!("{:?}", e)))?;

        let mut list = HeaderList::new();
        for (name, value) in decoded {
            let name = String::from_utf8(name)
                .map_err(|_| Error::HeaderDecompression("header name is not valid UTF-8".to_string()))?;
            list.push(name, String::from_utf8_lossy(&value).into_owned());
        }

        if let Some(max) = self.max_list_size {
            if list.list_size() > max {
                return Err(Error::Protocol(format!(
                    "Header list of {} octets exceeds limit {}",
                    list.list_size(),
                    max
                )));
            }
        }

        Ok(list)
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}
