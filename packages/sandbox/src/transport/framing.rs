// ABOUTME: Decoder for the multiplexed exec stream: 8-byte header plus payload per frame
// ABOUTME: Reassembles frames split across arbitrary read boundaries in a growable buffer

use crate::error::{Result, SandboxError};

/// Header size: stream tag, three reserved bytes, big-endian u32 length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Payloads beyond this are treated as stream corruption.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    Unknown(u8),
}

impl From<u8> for StreamKind {
    fn from(tag: u8) -> Self {
        match tag {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder. Feed raw bytes, collect complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    corrupt: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and drain every frame that is now complete.
    ///
    /// A header announcing more than [`MAX_FRAME_PAYLOAD`] bytes means the stream is out of
    /// sync; the decoder refuses further input after that.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        if self.corrupt {
            return Err(SandboxError::decode("exec stream is no longer in sync", ""));
        }
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.buffer.len() - offset >= FRAME_HEADER_LEN {
            let header = &self.buffer[offset..offset + FRAME_HEADER_LEN];
            let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            if length > MAX_FRAME_PAYLOAD {
                let snippet = String::from_utf8_lossy(header).into_owned();
                self.corrupt = true;
                self.buffer.clear();
                return Err(SandboxError::decode(
                    format!(
                        "exec frame length {} exceeds {}",
                        length, MAX_FRAME_PAYLOAD
                    ),
                    &snippet,
                ));
            }

            let end = offset + FRAME_HEADER_LEN + length;
            if self.buffer.len() < end {
                break;
            }

            frames.push(Frame {
                kind: StreamKind::from(header[0]),
                payload: self.buffer[offset + FRAME_HEADER_LEN..end].to_vec(),
            });
            offset = end;
        }

        self.buffer.drain(..offset);
        Ok(frames)
    }

    /// Call at end of stream: leftover bytes mean the last frame was cut short
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        Err(SandboxError::decode(
            format!(
                "exec stream ended mid-frame with {} bytes pending",
                self.buffer.len()
            ),
            &String::from_utf8_lossy(&self.buffer),
        ))
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode one frame. Used by tests and by fakes standing in for a container runtime.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reference_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(encode_frame(1, br#"{"type":"system","subtype":"init"}"#));
        bytes.extend(encode_frame(2, b"warning: something\n"));
        bytes.extend(encode_frame(1, b""));
        bytes.extend(encode_frame(1, &[b'x'; 3000]));
        bytes.extend(encode_frame(1, br#"{"type":"result"}"#));
        bytes
    }

    #[test]
    fn test_single_feed_decodes_all_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&reference_stream()).unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(frames[1].kind, StreamKind::Stderr);
        assert_eq!(frames[1].payload, b"warning: something\n");
        assert!(frames[2].payload.is_empty());
        assert_eq!(frames[3].payload.len(), 3000);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_arbitrary_chunk_boundaries_match_reference() {
        let stream = reference_stream();
        let reference = FrameDecoder::new().feed(&stream).unwrap();

        for chunk_size in [1, 2, 3, 5, 7, 8, 9, 13, 64, 1000, 4096] {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(decoder.feed(chunk).unwrap());
            }
            assert_eq!(frames, reference, "chunk size {}", chunk_size);
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_split_inside_header_waits_for_rest() {
        let frame = encode_frame(1, b"hello");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&frame[..5]).unwrap().is_empty());
        assert_eq!(decoder.pending(), 5);
        assert!(decoder.finish().is_err());
        let frames = decoder.feed(&frame[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn test_oversized_length_is_a_decode_error() {
        let mut bogus = vec![1u8, 0, 0, 0];
        bogus.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) * 2).to_be_bytes());
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&bogus),
            Err(SandboxError::CliDecode { .. })
        ));

        // Bytes after a corrupt header must never be read as fresh frames
        let looks_valid = encode_frame(1, b"{\"x\":1}\n\n");
        assert!(matches!(
            decoder.feed(&looks_valid),
            Err(SandboxError::CliDecode { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_at_end_of_stream_is_an_error() {
        let frame = encode_frame(1, b"partial payload");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&frame[..frame.len() - 3]).unwrap().is_empty());

        let err = decoder.finish().unwrap_err();
        assert!(matches!(err, SandboxError::CliDecode { .. }));
        assert!(err.to_string().contains("ended mid-frame"));
    }

    #[test]
    fn test_clean_end_of_stream_is_ok() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(1, b"done")).unwrap();
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_unknown_stream_tag_is_preserved() {
        let frames = FrameDecoder::new().feed(&encode_frame(9, b"?")).unwrap();
        assert_eq!(frames[0].kind, StreamKind::Unknown(9));
    }
}
