use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{KairoError, Result};

/// Largest key the wire format can carry.
pub const MAX_KEY_LENGTH: usize = 0xff;
/// Largest value the wire format can carry.
pub const MAX_VALUE_LENGTH: usize = 0xffff;

/// One packet of the framed protocol: an ordered key/value mapping.
///
/// Keys are byte strings (ASCII by convention), 1 to 255 bytes; values
/// are byte-transparent up to 65 535 bytes. Serialization sorts pairs
/// by key so equivalent boxes have one wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBox {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl CommandBox {
    pub fn new() -> CommandBox {
        CommandBox { pairs: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Set `key` to `value`, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        if let Some(pair) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            pair.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key.as_bytes())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key.as_bytes()).is_some()
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let index = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.pairs.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Wire-encode this box.
    ///
    /// Oversized keys or values are a protocol violation; the error
    /// distinguishes which side was too long.
    pub fn serialize(&self) -> Result<Bytes> {
        let mut sorted: Vec<&(Vec<u8>, Vec<u8>)> = self.pairs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = BytesMut::new();
        for (key, value) in sorted {
            if key.is_empty() {
                return Err(KairoError::ProtocolViolation("empty key in box".to_string()));
            }
            if key.len() > MAX_KEY_LENGTH {
                return Err(KairoError::ProtocolViolation(format!(
                    "local key too long: {} bytes",
                    key.len()
                )));
            }
            if value.len() > MAX_VALUE_LENGTH {
                return Err(KairoError::ProtocolViolation(format!(
                    "local value for key {:?} too long: {} bytes",
                    String::from_utf8_lossy(key),
                    value.len()
                )));
            }
            out.put_u16(key.len() as u16);
            out.put_slice(key);
            out.put_u16(value.len() as u16);
            out.put_slice(value);
        }
        out.put_u16(0);
        Ok(out.freeze())
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> FromIterator<(K, V)> for CommandBox {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> CommandBox {
        let mut cbox = CommandBox::new();
        for (k, v) in iter {
            cbox.insert(k, v);
        }
        cbox
    }
}

/// Incremental wire parser for boxes.
///
/// Feed raw chunks in; take complete boxes out one at a time, which is
/// what lets a protocol switch hand the *unparsed* remainder to the
/// next protocol.
#[derive(Default)]
pub struct BoxParser {
    buffer: BytesMut,
    partial: Vec<(Vec<u8>, Vec<u8>)>,
}

impl BoxParser {
    pub fn new() -> BoxParser {
        BoxParser::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Everything fed but not yet parsed into complete pairs. Used when
    /// switching protocols mid-stream.
    ///
    /// Calling this abandons any partially accumulated box.
    pub fn take_leftover(&mut self) -> BytesMut {
        self.partial.clear();
        std::mem::take(&mut self.buffer)
    }

    /// Parse at most one complete box off the stream.
    pub fn next_box(&mut self) -> Result<Option<CommandBox>> {
        loop {
            if self.buffer.len() < 2 {
                return Ok(None);
            }
            let first_len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;

            if first_len == 0 {
                self.buffer.advance(2);
                if self.partial.is_empty() {
                    return Err(KairoError::ProtocolViolation(
                        "empty box on the wire".to_string(),
                    ));
                }
                let pairs = std::mem::take(&mut self.partial);
                return Ok(Some(CommandBox { pairs }));
            }

            if first_len > MAX_KEY_LENGTH {
                return Err(KairoError::ProtocolViolation(format!(
                    "remote key too long: {} bytes",
                    first_len
                )));
            }

            // need key + value length prefix before consuming anything
            if self.buffer.len() < 2 + first_len + 2 {
                return Ok(None);
            }
            let value_len = u16::from_be_bytes([
                self.buffer[2 + first_len],
                self.buffer[2 + first_len + 1],
            ]) as usize;
            if self.buffer.len() < 2 + first_len + 2 + value_len {
                return Ok(None);
            }

            self.buffer.advance(2);
            let key = self.buffer.split_to(first_len).to_vec();
            self.buffer.advance(2);
            let value = self.buffer.split_to(value_len).to_vec();
            self.partial.push((key, value));
        }
    }
}
