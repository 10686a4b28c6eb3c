//! `Transfer-Encoding: chunked` framing (RFC 9112 §7.1).
//!
//! The teacher crate has no chunked support at all; this module is new,
//! grounded directly on the distilled spec's streaming contract (§4.3,
//! §6, §8 scenario 6): a handler emits chunks in order, each must be
//! delivered to the client byte-for-byte, in arrival order, with no
//! interleaving between chunks from different producers on the same task.

/// Encodes a single chunk: `{len in hex}\r\n{data}\r\n`.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Encodes the terminating zero-length chunk, with no trailer headers.
pub fn encode_final_chunk() -> Vec<u8> {
    b"0\r\n\r\n".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_chunk_with_hex_length_prefix() {
        assert_eq!(b"5\r\nhello\r\n".to_vec(), encode_chunk(b"hello"));
    }

    #[test]
    fn encodes_empty_chunk() {
        assert_eq!(b"0\r\n\r\n".to_vec(), encode_chunk(b""));
    }

    #[test]
    fn final_chunk_terminates_stream() {
        assert_eq!(b"0\r\n\r\n".to_vec(), encode_final_chunk());
    }

    #[test]
    fn concatenated_chunks_preserve_order_and_bytes() {
        let chunks: [&[u8]; 3] = [b"aaaaaaaaaa", b"bbbbbbbbbb", b"ccccc"];
        let mut expected = Vec::new();
        expected.extend(encode_chunk(chunks[0]));
        expected.extend(encode_chunk(chunks[1]));
        expected.extend(encode_chunk(chunks[2]));
        expected.extend(encode_final_chunk());

        assert_eq!(
            b"a\r\naaaaaaaaaa\r\na\r\nbbbbbbbbbb\r\n5\r\nccccc\r\n0\r\n\r\n".to_vec(),
            expected
        );
    }
}
