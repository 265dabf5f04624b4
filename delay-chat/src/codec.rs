//! Line framing for the chat protocol.
//!
//! Splits the inbound byte stream on LF (a preceding CR is dropped) and hands
//! each raw line to the caller; decoding into a [`crate::message::Message`]
//! happens later so a malformed line can be answered without losing the
//! stream. Outbound payloads are already encoded and terminated, so the
//! encoder copies them through untouched.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum line length, terminator included.
pub const MAX_LINE_LENGTH: usize = 8191;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct IdcCodec {
    // Bytes already scanned for a terminator on a previous call.
    scanned: usize,
}

impl Decoder for IdcCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let lf_pos = src[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.scanned + offset);

        match lf_pos {
            Some(pos) => {
                self.scanned = 0;
                if pos + 1 > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(line))
            }
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // An unterminated trailing fragment is not a line.
                src.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for IdcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
