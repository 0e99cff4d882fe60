//! NUL-separated argument vectors used by GENERIC_COMMAND.
//!
//! Each argument is followed by a NUL byte and the block ends with one more
//! NUL, so `["a", "bc"]` travels as `a\0bc\0\0`.

/// Largest argument block accepted on either side of the socket.
pub const MAX_ARGS_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgvError {
    #[error("argument block of {0} bytes exceeds the {} byte limit", MAX_ARGS_LEN)]
    TooLong(usize),
    #[error("argument block is not NUL terminated")]
    Unterminated,
    #[error("argument {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("argument {0} contains an embedded NUL")]
    EmbeddedNul(usize),
}

pub fn marshal<S: AsRef<str>>(args: &[S]) -> Result<Vec<u8>, ArgvError> {
    let mut out = Vec::new();
    for (index, arg) in args.iter().enumerate() {
        let bytes = arg.as_ref().as_bytes();
        if bytes.contains(&0) {
            return Err(ArgvError::EmbeddedNul(index));
        }
        out.extend_from_slice(bytes);
        out.push(0);
    }
    out.push(0);
    if out.len() > MAX_ARGS_LEN {
        return Err(ArgvError::TooLong(out.len()));
    }
    Ok(out)
}

pub fn unmarshal(block: &[u8]) -> Result<Vec<String>, ArgvError> {
    if block.len() > MAX_ARGS_LEN {
        return Err(ArgvError::TooLong(block.len()));
    }
    let body = block.strip_suffix(&[0]).ok_or(ArgvError::Unterminated)?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let body = body.strip_suffix(&[0]).ok_or(ArgvError::Unterminated)?;
    body.split(|b| *b == 0)
        .enumerate()
        .map(|(index, raw)| {
            String::from_utf8(raw.to_vec()).map_err(|_| ArgvError::InvalidUtf8(index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_layout() {
        assert_eq!(marshal(&["a", "bc"]).unwrap(), b"a\0bc\0\0");
        assert_eq!(marshal::<&str>(&[]).unwrap(), b"\0");
        assert_eq!(marshal(&[""]).unwrap(), b"\0\0");
    }

    #[test]
    fn unmarshal_recovers_arguments() {
        assert_eq!(
            unmarshal(b"-n\0bridge0\0\0").unwrap(),
            vec!["-n".to_string(), "bridge0".to_string()]
        );
        assert!(unmarshal(b"\0").unwrap().is_empty());
        assert_eq!(unmarshal(b"\0\0").unwrap(), vec![String::new()]);
    }

    #[test]
    fn malformed_blocks_are_rejected() {
        assert_eq!(unmarshal(b""), Err(ArgvError::Unterminated));
        assert_eq!(unmarshal(b"abc"), Err(ArgvError::Unterminated));
        assert_eq!(unmarshal(b"abc\0"), Err(ArgvError::Unterminated));
        assert_eq!(unmarshal(b"ok\0\xff\0\0"), Err(ArgvError::InvalidUtf8(1)));
        assert_eq!(marshal(&["a\0b"]), Err(ArgvError::EmbeddedNul(0)));
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let huge = "x".repeat(MAX_ARGS_LEN);
        assert_eq!(marshal(&[huge.as_str()]), Err(ArgvError::TooLong(MAX_ARGS_LEN + 2)));

        let mut block = vec![b'y'; MAX_ARGS_LEN];
        block.extend_from_slice(b"\0\0");
        assert_eq!(unmarshal(&block), Err(ArgvError::TooLong(MAX_ARGS_LEN + 2)));
    }
}
