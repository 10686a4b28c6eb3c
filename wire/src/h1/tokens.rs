//! Byte-class predicates for the HTTP/1.1 grammar (RFC 9110 §5.6.2, §9.5).

/// `tchar`, the character class permitted in header field names and HTTP
/// tokens generally.
/// ```abnf
/// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." / "^" /
///         "_" / "`" / "|" / "~" / DIGIT / ALPHA
/// ```
#[inline]
pub fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Bytes permitted in a request-target (RFC 9110 §9.5 / RFC 3986's
/// `pchar`/`query` productions, widened to everything printable-ASCII that
/// isn't whitespace, since this parser defers semantic URI validation to
/// the application layer).
#[inline]
pub fn is_request_target_token(b: u8) -> bool {
    b > 0x20 && b != 0x7f
}

/// Bytes permitted in a header field value, per RFC 9110 §5.5:
/// `field-value = *field-content`, visible ASCII plus obs-text.
#[inline]
pub fn is_header_value_token(b: u8) -> bool {
    b == b'\t' || (0x20..=0xff).contains(&b) && b != 0x7f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tchar_accepts_alnum_and_punctuation() {
        assert!(is_tchar(b'a'));
        assert!(is_tchar(b'9'));
        assert!(is_tchar(b'-'));
        assert!(!is_tchar(b' '));
        assert!(!is_tchar(b'('));
    }

    #[test]
    fn request_target_rejects_control_and_space() {
        assert!(is_request_target_token(b'/'));
        assert!(!is_request_target_token(b' '));
        assert!(!is_request_target_token(0x01));
    }
}
