use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, AppResult};

use super::DELIMITER;

/// Splits a byte stream into UTF-8 text messages terminated by [`DELIMITER`].
///
/// Bytes after the last delimiter stay in the source buffer as the partial frame and are
/// completed by a later read. The delimiter byte never occurs inside a multi-byte UTF-8
/// sequence, so splitting on raw bytes before decoding keeps characters that straddle two
/// reads intact.
///
/// Payloads must not contain the delimiter themselves; this is not checked when encoding.
#[derive(Debug, Default, Clone)]
pub struct NulDelimitedCodec {
    /// Bytes of the partial frame already scanned, so a long frame arriving in many small
    /// reads is not rescanned from the start each time.
    next_index: usize,
}

impl NulDelimitedCodec {
    pub fn new() -> Self {
        NulDelimitedCodec { next_index: 0 }
    }

    /// Encoded size of `message` on the wire.
    pub fn encoded_len(message: &str) -> usize {
        message.len() + 1
    }

    /// Drain every complete message currently held in `buffer`.
    pub fn decode_all(&mut self, buffer: &mut BytesMut) -> AppResult<Vec<String>> {
        let mut messages = Vec::new();
        while let Some(message) = self.decode(buffer)? {
            messages.push(message);
        }
        Ok(messages)
    }
}

impl Decoder for NulDelimitedCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<String>> {
        let offset = src[self.next_index..]
            .iter()
            .position(|byte| *byte == DELIMITER);

        match offset {
            Some(offset) => {
                let delimiter_index = self.next_index + offset;
                self.next_index = 0;
                let frame = src.split_to(delimiter_index + 1);
                let text = std::str::from_utf8(&frame[..delimiter_index]).map_err(|e| {
                    AppError::MalformedProtocol(format!("frame is not valid utf-8: {}", e))
                })?;
                Ok(Some(text.to_string()))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for NulDelimitedCodec {
    type Error = AppError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> AppResult<()> {
        let message = item.as_ref();
        dst.reserve(Self::encoded_len(message));
        dst.put_slice(message.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(messages: &[&str]) -> BytesMut {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::new();
        for message in messages {
            codec.encode(*message, &mut buffer).unwrap();
        }
        buffer
    }

    #[test]
    fn test_encode_appends_single_delimiter() {
        let buffer = encode_all(&["hello"]);
        assert_eq!(&buffer[..], b"hello\0");
        assert_eq!(NulDelimitedCodec::encoded_len("hello"), buffer.len());
    }

    #[test]
    fn test_decode_multiple_in_one_read() {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::from(&b"a\0b\0\0c"[..]);
        let messages = codec.decode_all(&mut buffer).unwrap();
        assert_eq!(messages, vec!["a", "b", ""]);
        assert_eq!(&buffer[..], b"c");
    }

    #[test]
    fn test_partial_frame_completes_on_next_read() {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::from(&b"hel"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"lo\0wor");
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("hello"));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"ld\0");
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("world"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let encoded = encode_all(&["größe ✓"]);
        let split = encoded.len() - 3;
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::from(&encoded[..split]);
        assert!(codec.decode_all(&mut buffer).unwrap().is_empty());
        buffer.extend_from_slice(&encoded[split..]);
        assert_eq!(codec.decode_all(&mut buffer).unwrap(), vec!["größe ✓"]);
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::from(&[0xff, 0xfe, 0x00][..]);
        let result = codec.decode(&mut buffer);
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }
}
