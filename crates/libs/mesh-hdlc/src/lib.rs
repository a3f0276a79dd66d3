//! HDLC byte-stuffing framer for stream-oriented transports (TCP, serial).
//!
//! Frames are delimited by [`FLAG`] bytes; [`FLAG`] and [`ESC`] occurring in
//! the payload are escaped with [`ESC`] followed by the byte XORed with
//! [`ESC_MASK`].

use thiserror::Error;

pub const FLAG: u8 = 0x7e;
pub const ESC: u8 = 0x7d;
pub const ESC_MASK: u8 = 0b0010_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HdlcError {
    #[error("truncated escape sequence at end of input")]
    TruncatedEscape,
}

/// Escapes `payload` and wraps it in leading/trailing [`FLAG`] bytes.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(FLAG);
    escape_into(payload, &mut out);
    out.push(FLAG);
    out
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &byte in payload {
        match byte {
            FLAG | ESC => {
                out.push(ESC);
                out.push(byte ^ ESC_MASK);
            }
            _ => out.push(byte),
        }
    }
}

/// Reverses [`frame`]'s escaping. The input must not include the delimiting
/// `FLAG` bytes.
pub fn unescape(escaped: &[u8]) -> Result<Vec<u8>, HdlcError> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut pending_escape = false;
    for &byte in escaped {
        if pending_escape {
            out.push(byte ^ ESC_MASK);
            pending_escape = false;
        } else if byte == ESC {
            pending_escape = true;
        } else {
            out.push(byte);
        }
    }
    if pending_escape {
        return Err(HdlcError::TruncatedEscape);
    }
    Ok(out)
}

/// Finds the first complete `FLAG ... FLAG` region in `data`, returning the
/// byte range `start..=end` of the two delimiters.
pub fn find_frame(data: &[u8]) -> Option<(usize, usize)> {
    let mut start = None;
    for (i, &byte) in data.iter().enumerate() {
        if byte != FLAG {
            continue;
        }
        match start {
            None => start = Some(i),
            Some(start_index) => return Some((start_index, i)),
        }
    }
    None
}

/// Extracts every complete frame from `buffer`, draining consumed bytes.
/// Frames that unescape to fewer than `min_len` bytes (after stripping
/// delimiters) are discarded, as are empty gaps before the first flag.
pub fn extract_frames(buffer: &mut Vec<u8>, min_len: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let Some((start, end)) = find_frame(buffer) else {
            break;
        };
        if end > start + 1 {
            if let Ok(payload) = unescape(&buffer[start + 1..end]) {
                if payload.len() >= min_len {
                    frames.push(payload);
                }
            }
        }
        buffer.drain(..=end);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_payload() {
        let payload = b"hello mesh";
        let framed = frame(payload);
        assert_eq!(framed.first(), Some(&FLAG));
        assert_eq!(framed.last(), Some(&FLAG));
        assert_eq!(unescape(&framed[1..framed.len() - 1]).unwrap(), payload);
    }

    #[test]
    fn escapes_flag_and_escape_bytes() {
        let payload = [0x7e, 0x41, 0x42, 0x7d, 0x43];
        let framed = frame(&payload);
        assert_eq!(
            framed,
            vec![0x7e, 0x7d, 0x5e, 0x41, 0x42, 0x7d, 0x5d, 0x43, 0x7e]
        );
        let mut buffer = framed;
        let frames = extract_frames(&mut buffer, 0);
        assert_eq!(frames, vec![payload.to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extracts_two_frames_with_garbage_prefix() {
        let mut buffer = vec![0x00, 0xff, 0x7e, 0x01, 0x7e, 0x7e, 0x02, 0x7e, 0xff];
        let frames = extract_frames(&mut buffer, 0);
        assert_eq!(frames, vec![vec![0x01], vec![0x02]]);
        assert_eq!(buffer, vec![0xff]);
    }

    #[test]
    fn truncated_escape_is_an_error() {
        assert_eq!(unescape(&[0x41, ESC]), Err(HdlcError::TruncatedEscape));
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut buffer = vec![0x7e, 0x01, 0x02];
        let frames = extract_frames(&mut buffer, 0);
        assert!(frames.is_empty());
        assert_eq!(buffer, vec![0x7e, 0x01, 0x02]);
    }

    #[test]
    fn empty_frame_is_discarded() {
        let mut buffer = vec![0x7e, 0x7e, 0x7e, 0x01, 0x7e];
        let frames = extract_frames(&mut buffer, 0);
        assert_eq!(frames, vec![vec![0x01]]);
    }

    #[test]
    fn min_len_filters_short_frames() {
        let mut buffer = vec![0x7e, 0x01, 0x7e];
        assert!(extract_frames(&mut buffer, 2).is_empty());
    }

    #[test]
    fn fed_its_own_output_reproduces_frames_regardless_of_chunking() {
        let a = b"first".to_vec();
        let b = b"second".to_vec();
        let mut stream = frame(&a);
        stream.extend(frame(&b));

        // Split into arbitrary chunks and feed incrementally.
        let mut buffer = Vec::new();
        let mut collected = Vec::new();
        for chunk in stream.chunks(3) {
            buffer.extend_from_slice(chunk);
            collected.extend(extract_frames(&mut buffer, 0));
        }
        assert_eq!(collected, vec![a, b]);
    }
}
