use bytes::Bytes;

use crate::errors::ProtocolError;

/// One RESP value. Bulk string payloads are opaque bytes; simple strings and
/// errors are line-oriented text and may not contain CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Array(Vec<Resp>),
    BulkString(Bytes),
    SimpleString(String),
    Error(String),
    Integer(i64),
    NullBulkString,
    NullArray,
    Empty,
}

impl Resp {
    pub fn bulk(data: impl Into<Bytes>) -> Resp {
        Resp::BulkString(data.into())
    }

    pub fn simple(text: impl Into<String>) -> Resp {
        Resp::SimpleString(text.into())
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        match self {
            Resp::Array(vector) => {
                let mut encoded = [b"*", vector.len().to_string().as_bytes(), b"\r\n"].concat();
                for val in vector {
                    encoded.extend_from_slice(&val.encode_to_bytes());
                }
                encoded
            }
            Resp::BulkString(data) => [
                b"$",
                data.len().to_string().as_bytes(),
                b"\r\n",
                &data[..],
                b"\r\n",
            ]
            .concat(),
            Resp::SimpleString(text) => [b"+", text.as_bytes(), b"\r\n"].concat(),
            Resp::Error(text) => [b"-", text.as_bytes(), b"\r\n"].concat(),
            Resp::Integer(num) => [b":", num.to_string().as_bytes(), b"\r\n"].concat(),
            Resp::NullBulkString => b"$-1\r\n".to_vec(),
            Resp::NullArray => b"*-1\r\n".to_vec(),
            Resp::Empty => Vec::new(),
        }
    }
}

/// Outcome of a decode attempt over a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// One complete value plus the unconsumed remainder of the buffer.
    Complete(Resp, &'a [u8]),
    /// The buffer ends mid-value; feed more bytes and retry.
    Partial,
}

/// Streaming decoder: never blocks, never consumes. Callers compute the
/// consumed byte count as `buffer.len() - remainder.len()` and advance their
/// own cursor.
pub fn tokenize_bytes(buffer: &[u8]) -> Result<Decoded<'_>, ProtocolError> {
    let Some(type_byte) = buffer.first() else {
        return Ok(Decoded::Partial);
    };
    match type_byte {
        b'*' => {
            let Some((line, mut rest)) = read_next_line(buffer) else {
                return Ok(Decoded::Partial);
            };
            let len = parse_length(&line[1..])?;
            if len < 0 {
                return Ok(Decoded::Complete(Resp::NullArray, rest));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match tokenize_bytes(rest)? {
                    Decoded::Complete(item, new_rest) => {
                        items.push(item);
                        rest = new_rest;
                    }
                    Decoded::Partial => return Ok(Decoded::Partial),
                }
            }
            Ok(Decoded::Complete(Resp::Array(items), rest))
        }
        b'$' => {
            let Some((line, rest)) = read_next_line(buffer) else {
                return Ok(Decoded::Partial);
            };
            let len = parse_length(&line[1..])?;
            if len < 0 {
                return Ok(Decoded::Complete(Resp::NullBulkString, rest));
            }
            let len = len as usize;
            if rest.len() < len + 2 {
                return Ok(Decoded::Partial);
            }
            if &rest[len..len + 2] != b"\r\n" {
                return Err(ProtocolError::MissingTerminator);
            }
            let payload = Bytes::copy_from_slice(&rest[..len]);
            Ok(Decoded::Complete(Resp::BulkString(payload), &rest[len + 2..]))
        }
        b':' => {
            let Some((line, rest)) = read_next_line(buffer) else {
                return Ok(Decoded::Partial);
            };
            let num = std::str::from_utf8(&line[1..])
                .map_err(|_| ProtocolError::BadLength)?
                .parse::<i64>()
                .map_err(|_| ProtocolError::BadLength)?;
            Ok(Decoded::Complete(Resp::Integer(num), rest))
        }
        b'+' => {
            let Some((line, rest)) = read_next_line(buffer) else {
                return Ok(Decoded::Partial);
            };
            let text = std::str::from_utf8(&line[1..]).map_err(|_| ProtocolError::NotUtf8)?;
            Ok(Decoded::Complete(Resp::SimpleString(text.to_string()), rest))
        }
        b'-' => {
            let Some((line, rest)) = read_next_line(buffer) else {
                return Ok(Decoded::Partial);
            };
            let text = std::str::from_utf8(&line[1..]).map_err(|_| ProtocolError::NotUtf8)?;
            Ok(Decoded::Complete(Resp::Error(text.to_string()), rest))
        }
        other => Err(ProtocolError::UnknownType(char::from(*other))),
    }
}

/// Decodes the RDB payload frame a master ships after `+FULLRESYNC`:
/// `$<len>\r\n<bytes>` with no trailing CRLF.
pub fn tokenize_rdb(buffer: &[u8]) -> Result<Option<(Bytes, &[u8])>, ProtocolError> {
    let Some(type_byte) = buffer.first() else {
        return Ok(None);
    };
    if *type_byte != b'$' {
        return Err(ProtocolError::UnknownType(char::from(*type_byte)));
    }
    let Some((line, rest)) = read_next_line(buffer) else {
        return Ok(None);
    };
    let len = parse_length(&line[1..])?;
    if len < 0 {
        return Err(ProtocolError::BadLength);
    }
    let len = len as usize;
    if rest.len() < len {
        return Ok(None);
    }
    Ok(Some((Bytes::copy_from_slice(&rest[..len]), &rest[len..])))
}

fn read_next_line(buffer: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = buffer.windows(2).position(|bytes| bytes == b"\r\n")?;
    Some((&buffer[..idx], &buffer[idx + 2..]))
}

fn parse_length(digits: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(digits)
        .map_err(|_| ProtocolError::BadLength)?
        .parse::<i64>()
        .map_err(|_| ProtocolError::BadLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buffer: &[u8]) -> (Resp, usize) {
        match tokenize_bytes(buffer).unwrap() {
            Decoded::Complete(value, rest) => (value, buffer.len() - rest.len()),
            Decoded::Partial => panic!("expected a complete value"),
        }
    }

    #[test]
    fn decodes_command_array() {
        let (value, consumed) = complete(b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n");
        assert_eq!(
            value,
            Resp::Array(vec![Resp::bulk(&b"ECHO"[..]), Resp::bulk(&b"hey"[..])])
        );
        assert_eq!(consumed, 23);
    }

    #[test]
    fn reports_partial_frames() {
        let frame = b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n";
        for cut in 0..frame.len() {
            assert_eq!(
                tokenize_bytes(&frame[..cut]).unwrap(),
                Decoded::Partial,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn leaves_pipelined_remainder() {
        let (value, consumed) = complete(b"+OK\r\n:42\r\n");
        assert_eq!(value, Resp::simple("OK"));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn decodes_nils_and_errors() {
        let (value, _) = complete(b"$-1\r\n");
        assert_eq!(value, Resp::NullBulkString);
        let (value, _) = complete(b"*-1\r\n");
        assert_eq!(value, Resp::NullArray);
        let (value, _) = complete(b"-ERR boom\r\n");
        assert_eq!(value, Resp::Error("ERR boom".to_string()));
    }

    #[test]
    fn bulk_payload_is_binary_safe() {
        let (value, _) = complete(b"$4\r\n\x00\x01\r\n\r\n");
        assert_eq!(value, Resp::bulk(&b"\x00\x01\r\n"[..]));
    }

    #[test]
    fn rejects_bad_length_prefix() {
        assert_eq!(
            tokenize_bytes(b"$abc\r\nxyz\r\n"),
            Err(ProtocolError::BadLength)
        );
    }

    #[test]
    fn rejects_missing_terminator() {
        assert_eq!(
            tokenize_bytes(b"$3\r\nabcXY"),
            Err(ProtocolError::MissingTerminator)
        );
    }

    #[test]
    fn rejects_unknown_type_byte() {
        assert_eq!(
            tokenize_bytes(b"?what\r\n"),
            Err(ProtocolError::UnknownType('?'))
        );
    }

    #[test]
    fn encode_round_trips_the_wire_form() {
        assert_eq!(Resp::simple("PONG").encode_to_bytes(), b"+PONG\r\n");
        assert_eq!(Resp::Integer(-7).encode_to_bytes(), b":-7\r\n");
        assert_eq!(Resp::bulk(&b"bar"[..]).encode_to_bytes(), b"$3\r\nbar\r\n");
        assert_eq!(
            Resp::Array(vec![Resp::bulk(&b"a"[..]), Resp::bulk(&b"b"[..])]).encode_to_bytes(),
            b"*2\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
        assert_eq!(Resp::Empty.encode_to_bytes(), b"");
    }

    #[test]
    fn rdb_frame_has_no_trailing_crlf() {
        let mut wire = b"$5\r\nREDIS".to_vec();
        wire.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let (payload, rest) = tokenize_rdb(&wire).unwrap().unwrap();
        assert_eq!(&payload[..], b"REDIS");
        assert_eq!(rest, b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn rdb_frame_partial() {
        assert_eq!(tokenize_rdb(b"$10\r\nREDIS").unwrap(), None);
    }
}
