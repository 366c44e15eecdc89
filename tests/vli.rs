use lzcore::vli::{self, VLI_BYTES_MAX, VLI_MAX, VLI_UNKNOWN};
use lzcore::{Error, Status};
use proptest::prelude::*;

fn encode(v: u64) -> Vec<u8> {
    let mut out = vec![0u8; VLI_BYTES_MAX];
    let mut pos = 0;
    vli::encode(v, None, &mut out, &mut pos).unwrap();
    out.truncate(pos);
    out
}

fn decode(bytes: &[u8]) -> Result<(u64, usize), Error> {
    let mut v = 0;
    let mut pos = 0;
    vli::decode(&mut v, None, bytes, &mut pos)?;
    Ok((v, pos))
}

#[test]
fn test_known_encodings() {
    assert_eq!(encode(0), [0x00]);
    assert_eq!(encode(127), [0x7F]);
    assert_eq!(encode(128), [0x80, 0x01]);
    assert_eq!(encode(300), [0xAC, 0x02]);
    assert_eq!(encode(VLI_MAX).len(), VLI_BYTES_MAX);
    assert_eq!(*encode(VLI_MAX).last().unwrap(), 0x7F);
}

#[test]
fn test_single_call_short_buffer_writes_nothing() {
    let mut out = [0xAAu8; 1];
    let mut pos = 0;
    assert!(matches!(vli::encode(128, None, &mut out, &mut pos), Err(Error::Prog(_))));
    assert_eq!(pos, 0);
    assert_eq!(out, [0xAA]);
}

#[test]
fn test_unencodable_values_rejected() {
    let mut out = [0u8; VLI_BYTES_MAX];
    let mut pos = 0;
    assert!(matches!(vli::encode(VLI_UNKNOWN, None, &mut out, &mut pos), Err(Error::Prog(_))));
    assert!(matches!(vli::encode(VLI_MAX + 1, None, &mut out, &mut pos), Err(Error::Prog(_))));
    assert_eq!(vli::size(VLI_UNKNOWN), 0);
    assert!(vli::is_valid(VLI_UNKNOWN));
    assert!(!vli::is_valid(VLI_MAX + 1));
}

#[test]
fn test_padded_zero_rejected() {
    assert!(matches!(decode(&[0x80, 0x00]), Err(Error::Data(_))));
    assert!(matches!(decode(&[0xFF, 0x80, 0x00]), Err(Error::Data(_))));
}

#[test]
fn test_overlong_rejected() {
    assert!(matches!(decode(&[0xFF; 10]), Err(Error::Data(_))));
}

#[test]
fn test_truncated_input() {
    assert!(matches!(decode(&[0x80]), Err(Error::Data(_))));
    assert!(matches!(decode(&[]), Err(Error::Data(_))));

    // Multi-call mode waits for more instead.
    let mut v = 0;
    let mut vli_pos = 0;
    let mut pos = 0;
    assert_eq!(vli::decode(&mut v, Some(&mut vli_pos), &[0x80], &mut pos), Ok(Status::Ok));
    assert_eq!(vli::decode(&mut v, Some(&mut vli_pos), &[], &mut 0), Err(Error::Buf));
}

#[test]
fn test_multi_call_byte_at_a_time() {
    let value = 0x1234_5678_9ABC;
    let encoded = encode(value);

    let mut v = 0;
    let mut vli_pos = 0;
    for (i, byte) in encoded.iter().enumerate() {
        let mut pos = 0;
        let status = vli::decode(&mut v, Some(&mut vli_pos), std::slice::from_ref(byte), &mut pos).unwrap();
        assert_eq!(pos, 1);
        let last = i + 1 == encoded.len();
        assert_eq!(status, if last { Status::StreamEnd } else { Status::Ok });
    }
    assert_eq!(v, value);

    let mut out = Vec::new();
    let mut vli_pos = 0;
    loop {
        let mut byte = [0u8; 1];
        let mut pos = 0;
        let status = vli::encode(value, Some(&mut vli_pos), &mut byte, &mut pos).unwrap();
        out.push(byte[0]);
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(out, encoded);
}

#[test]
fn test_decode_stops_at_terminator() {
    assert_eq!(decode(&[0x80, 0x01, 0x55]).unwrap(), (128, 2));
}

proptest! {
    #[test]
    fn prop_round_trip(v in 0u64..=VLI_MAX) {
        let encoded = encode(v);
        prop_assert_eq!(encoded.len(), vli::size(v));
        let expected_len = ((64 - (v | 1).leading_zeros()) as usize + 6) / 7;
        prop_assert_eq!(encoded.len(), expected_len);
        prop_assert_eq!(decode(&encoded).unwrap(), (v, encoded.len()));
    }
}
