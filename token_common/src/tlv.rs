//! BER-TLV codec.
//!
//! Decoding produces a flat sequence of `(tag, value)` records; tags of up
//! to 4 bytes and long-form lengths are supported. The dictionary view is
//! keyed by tag, with the last record winning on duplicates.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("input ended in the middle of a tag")]
    TruncatedTag,
    #[error("tag longer than 4 bytes")]
    TagTooLong,
    #[error("input ended in the middle of a length")]
    TruncatedLength,
    #[error("length of length {0} not supported")]
    LengthOfLengthTooLong(usize),
    #[error("value length {length} exceeds remaining input of {remaining} bytes")]
    TruncatedValue { length: usize, remaining: usize },
}

/// A single BER-TLV record. The tag holds the raw tag bytes, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u32,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u32, value: impl Into<Vec<u8>>) -> Self {
        Tlv {
            tag,
            value: value.into(),
        }
    }
}

/// Dictionary view of a TLV sequence; iteration order is ascending by tag.
pub type TlvDict = BTreeMap<u32, Vec<u8>>;

/// Decode a byte string into the flat sequence of records it contains.
pub fn decode(input: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    let mut records = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let (tag, after_tag) = decode_tag(rest)?;
        let (length, after_length) = decode_length(after_tag)?;

        if length > after_length.len() {
            return Err(TlvError::TruncatedValue {
                length,
                remaining: after_length.len(),
            });
        }
        let (value, after_value) = after_length.split_at(length);

        records.push(Tlv::new(tag, value));
        rest = after_value;
    }

    Ok(records)
}

/// Decode into a dictionary keyed by tag. Duplicate tags are tolerated, the
/// last value wins.
pub fn decode_dict(input: &[u8]) -> Result<TlvDict, TlvError> {
    let dict = decode(input)?.into_iter().map(|tlv| (tlv.tag, tlv.value)).collect();

    Ok(dict)
}

/// Encode records in the order supplied by the caller.
pub fn encode(records: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        encode_into(&mut out, record.tag, &record.value);
    }

    out
}

/// Encode a dictionary, emitting records in ascending tag order.
pub fn encode_dict(dict: &TlvDict) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, value) in dict {
        encode_into(&mut out, *tag, value);
    }

    out
}

fn decode_tag(input: &[u8]) -> Result<(u32, &[u8]), TlvError> {
    let (&first, mut rest) = input.split_first().ok_or(TlvError::TruncatedTag)?;
    let mut tag = u32::from(first);

    // The low 5 bits all set means the tag number continues into the
    // following bytes, for as long as bit 7 is set.
    if first & 0x1f == 0x1f {
        loop {
            let (&byte, after) = rest.split_first().ok_or(TlvError::TruncatedTag)?;
            if tag > 0x00ff_ffff {
                return Err(TlvError::TagTooLong);
            }
            tag = tag << 8 | u32::from(byte);
            rest = after;

            if byte & 0x80 == 0 {
                break;
            }
        }
    }

    Ok((tag, rest))
}

fn decode_length(input: &[u8]) -> Result<(usize, &[u8]), TlvError> {
    let (&first, rest) = input.split_first().ok_or(TlvError::TruncatedLength)?;

    if first < 0x80 {
        return Ok((usize::from(first), rest));
    }

    let count = usize::from(first & 0x7f);
    if count == 0 || count > 4 {
        return Err(TlvError::LengthOfLengthTooLong(count));
    }
    if rest.len() < count {
        return Err(TlvError::TruncatedLength);
    }

    let (length_bytes, rest) = rest.split_at(count);
    let length = length_bytes.iter().fold(0usize, |acc, &byte| acc << 8 | usize::from(byte));

    Ok((length, rest))
}

fn encode_into(out: &mut Vec<u8>, tag: u32, value: &[u8]) {
    let tag_bytes = tag.to_be_bytes();
    let skip = tag_bytes.iter().take_while(|&&byte| byte == 0).count().min(3);
    out.extend_from_slice(&tag_bytes[skip..]);

    let length = value.len();
    if length < 0x80 {
        out.push(length as u8);
    } else if length <= 0xff {
        out.push(0x81);
        out.push(length as u8);
    } else if length <= 0xffff {
        out.push(0x82);
        out.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        out.push(0x83);
        out.extend_from_slice(&(length as u32).to_be_bytes()[1..]);
    }

    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_decode_flat_sequence() {
        let records = decode(&hex!("01 02 aabb 02 00 5f49 01 cc")).unwrap();

        assert_eq!(
            records,
            vec![
                Tlv::new(0x01, hex!("aabb")),
                Tlv::new(0x02, []),
                Tlv::new(0x5f49, hex!("cc")),
            ]
        );
    }

    #[test]
    fn test_decode_long_form_length() {
        let mut input = hex!("7f49 81 80").to_vec();
        input.extend_from_slice(&[0xab; 0x80]);

        let records = decode(&input).unwrap();
        assert_eq!(records, vec![Tlv::new(0x7f49, vec![0xab; 0x80])]);

        let mut input = hex!("10 82 0100").to_vec();
        input.extend_from_slice(&[0xcd; 0x100]);

        let records = decode(&input).unwrap();
        assert_eq!(records, vec![Tlv::new(0x10, vec![0xcd; 0x100])]);
    }

    #[rstest]
    #[case(&hex!("5f") as &[u8], TlvError::TruncatedTag)]
    #[case(&hex!("01"), TlvError::TruncatedLength)]
    #[case(&hex!("01 82 00"), TlvError::TruncatedLength)]
    #[case(&hex!("01 05 aabb"), TlvError::TruncatedValue { length: 5, remaining: 2 })]
    #[case(&hex!("01 85 0000000000"), TlvError::LengthOfLengthTooLong(5))]
    fn test_decode_error(#[case] input: &[u8], #[case] expected: TlvError) {
        assert_matches!(decode(input), Err(error) if error == expected);
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let mut original = hex!("01 02 aabb 9f1e 01 77 04 00").to_vec();
        original.extend_from_slice(&hex!("05 81 80"));
        original.extend_from_slice(&[0x11; 0x80]);

        let records = decode(&original).unwrap();
        assert_eq!(encode(&records), original);
    }

    #[test]
    fn test_dict_last_value_wins() {
        let dict = decode_dict(&hex!("02 01 aa 02 01 bb")).unwrap();

        assert_eq!(dict.len(), 1);
        assert_eq!(dict[&0x02], hex!("bb"));
    }

    #[test]
    fn test_encode_dict_sorts_by_tag() {
        let dict = TlvDict::from([(0x04, vec![0x01]), (0x01, vec![0x02]), (0x17, vec![])]);

        assert_eq!(encode_dict(&dict), hex!("01 01 02 04 01 01 17 00"));
    }
}
