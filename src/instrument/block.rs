//! Reply parsers for the SCPI channel: plain numbers, comma separated number
//! lists and IEEE 488.2 definite length binary blocks.

use byteorder::{ByteOrder, LittleEndian};
use nom::bytes::complete::{tag, take};
use nom::character::complete::{char, space0};
use nom::combinator::{all_consuming, map_opt, map_res};
use nom::multi::separated_list1;
use nom::number::complete::double;
use nom::sequence::{delimited, preceded};
use nom::IResult;

use crate::error::{Error, Result};

/// Splits `#<w><len...><payload>` into its payload. A zero width header is
/// an indefinite block that runs up to the terminating newline.
pub fn definite_block(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag("#")(input)?;
    let (input, width) = map_opt(take(1usize), |d: &[u8]| (d[0] as char).to_digit(10))(input)?;
    if width == 0 {
        let end = input
            .iter()
            .rposition(|&b| b == b'\n')
            .unwrap_or(input.len());
        return Ok((&input[end..], &input[..end]));
    }
    let (input, len) = map_res(take(width as usize), |d: &[u8]| {
        std::str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|s| s.parse::<usize>().map_err(|_| ()))
    })(input)?;
    take(len)(input)
}

/// Total size in bytes of a definite block whose header is `head`
/// (`#`, width digit, length digits), or `None` while the header is incomplete.
pub fn block_len(head: &[u8]) -> Result<Option<usize>> {
    if head.len() < 2 {
        return Ok(None);
    }
    if head[0] != b'#' {
        return Err(Error::parse(format!(
            "binary block must start with '#', got {:?}",
            head[0] as char
        )));
    }
    let width = (head[1] as char)
        .to_digit(10)
        .ok_or_else(|| Error::parse("invalid block header width"))? as usize;
    if width == 0 {
        return Err(Error::parse("indefinite length blocks are not supported on this channel"));
    }
    if head.len() < 2 + width {
        return Ok(None);
    }
    let len = std::str::from_utf8(&head[2..2 + width])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| Error::parse("invalid block length digits"))?;
    Ok(Some(2 + width + len))
}

/// Decodes a binary block of little-endian `f32` values.
pub fn decode_f32_block(raw: &[u8]) -> Result<Vec<f32>> {
    let (_, payload) = definite_block(raw)
        .map_err(|e| Error::parse(format!("malformed binary block: {:?}", e)))?;
    if payload.len() % 4 != 0 {
        return Err(Error::parse(format!(
            "binary block of {} bytes is not a whole number of floats",
            payload.len()
        )));
    }
    let mut values = vec![0.0_f32; payload.len() / 4];
    LittleEndian::read_f32_into(payload, &mut values);
    Ok(values)
}

/// Encodes values the way the instrument sends them. Used by the mock
/// instrument to exercise the decoder.
pub fn encode_f32_block(values: &[f32]) -> Vec<u8> {
    let mut payload = vec![0_u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut payload);
    let len = payload.len().to_string();
    let mut raw = format!("#{}{}", len.len(), len).into_bytes();
    raw.extend_from_slice(&payload);
    raw.push(b'\n');
    raw
}

fn number_list(input: &str) -> IResult<&str, Vec<f64>> {
    separated_list1(char(','), delimited(space0, double, space0))(input)
}

/// Parses a single numeric reply such as `+5.00120E+00`.
pub fn parse_number(reply: &str) -> Result<f64> {
    all_consuming(preceded(space0, double::<_, ()>))(reply.trim())
        .map(|(_, v)| v)
        .map_err(|_| Error::parse(format!("expected a number, got {:?}", reply.trim())))
}

/// Parses a comma separated list of numbers.
pub fn parse_list(reply: &str) -> Result<Vec<f64>> {
    all_consuming(number_list)(reply.trim())
        .map(|(_, v)| v)
        .map_err(|_| Error::parse(format!("expected a number list, got {:?}", reply.trim())))
}

/// Parses a `<voltage>,<current>` reading.
pub fn parse_pair(reply: &str) -> Result<(f64, f64)> {
    match parse_list(reply)?.as_slice() {
        [a, b] => Ok((*a, *b)),
        other => Err(Error::parse(format!(
            "expected two values, got {}",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scientific_numbers() {
        assert_eq!(parse_number("+5.00120E+00\n").unwrap(), 5.0012);
        assert_eq!(parse_number(" 1").unwrap(), 1.0);
        assert!(parse_number("ON").is_err());
        assert!(parse_number("1.0,2.0").is_err());
    }

    #[test]
    fn parses_reading_pair() {
        let (v, i) = parse_pair("4.98731E+00,-2.49871E-05\n").unwrap();
        assert!((v - 4.98731).abs() < 1e-12);
        assert!((i + 2.49871e-5).abs() < 1e-15);
        assert!(parse_pair("1,2,3").is_err());
    }

    #[test]
    fn decodes_definite_block() {
        let raw = encode_f32_block(&[1.5, -2.25, 3.0]);
        assert_eq!(&raw[..4], b"#212");
        assert_eq!(decode_f32_block(&raw).unwrap(), vec![1.5, -2.25, 3.0]);
    }

    #[test]
    fn block_len_waits_for_full_header() {
        assert_eq!(block_len(b"#").unwrap(), None);
        assert_eq!(block_len(b"#3").unwrap(), None);
        assert_eq!(block_len(b"#3200").unwrap(), Some(205));
        assert!(block_len(b"X3200").is_err());
    }

    #[test]
    fn rejects_ragged_payload() {
        assert!(decode_f32_block(b"#13abc\n").is_err());
    }

    #[test]
    fn indefinite_block_runs_to_newline() {
        let (rest, payload) = definite_block(b"#0abcd\n").unwrap();
        assert_eq!(payload, b"abcd");
        assert_eq!(rest, b"\n");
    }
}
