use bytes::BytesMut;
use rstest::rstest;
use stonewire::{AppResult, NulDelimitedCodec, DELIMITER};
use tokio_util::codec::{Decoder, Encoder};

fn sample_messages() -> Vec<String> {
    vec![
        "hello".to_string(),
        String::new(),
        "a much longer message that spans well past a handful of bytes".to_string(),
        "ünïcödé ✓ 日本語".to_string(),
        "x".repeat(3000),
        "last".to_string(),
    ]
}

fn encode(messages: &[String]) -> AppResult<BytesMut> {
    let mut codec = NulDelimitedCodec::new();
    let mut wire = BytesMut::new();
    for message in messages {
        codec.encode(message.as_str(), &mut wire)?;
    }
    Ok(wire)
}

/// Feed `wire` to a fresh decoder in reads of at most `chunk_size` bytes.
fn decode_in_chunks(wire: &[u8], chunk_size: usize) -> AppResult<Vec<String>> {
    let mut codec = NulDelimitedCodec::new();
    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    for chunk in wire.chunks(chunk_size) {
        buffer.extend_from_slice(chunk);
        while let Some(message) = codec.decode(&mut buffer)? {
            decoded.push(message);
        }
    }
    assert!(buffer.is_empty(), "complete stream leaves no partial frame");
    Ok(decoded)
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(7)]
#[case(64)]
#[case(1024)]
#[case(usize::MAX)]
fn test_round_trip_any_chunking(#[case] chunk_size: usize) -> AppResult<()> {
    let messages = sample_messages();
    let wire = encode(&messages)?;
    assert_eq!(decode_in_chunks(&wire, chunk_size)?, messages);
    Ok(())
}

#[test]
fn test_split_at_every_offset_matches_single_read() -> AppResult<()> {
    let messages = vec!["one".to_string(), "twö".to_string(), "three".to_string()];
    let wire = encode(&messages)?;
    let whole = decode_in_chunks(&wire, wire.len())?;

    for offset in 0..=wire.len() {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::from(&wire[..offset]);
        let mut decoded = codec.decode_all(&mut buffer)?;
        buffer.extend_from_slice(&wire[offset..]);
        decoded.extend(codec.decode_all(&mut buffer)?);
        assert_eq!(decoded, whole, "split at offset {}", offset);
    }
    Ok(())
}

#[test]
fn test_encoded_frame_layout() -> AppResult<()> {
    let wire = encode(&["ab".to_string(), "c".to_string()])?;
    assert_eq!(&wire[..], &[b'a', b'b', DELIMITER, b'c', DELIMITER]);
    Ok(())
}

#[test]
fn test_trailing_partial_frame_is_retained() -> AppResult<()> {
    let mut codec = NulDelimitedCodec::new();
    let mut buffer = BytesMut::from(&b"done\0pend"[..]);
    assert_eq!(codec.decode_all(&mut buffer)?, vec!["done".to_string()]);
    assert_eq!(&buffer[..], b"pend");
    Ok(())
}
