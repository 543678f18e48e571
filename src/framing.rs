//! Wire codec for envelopes over a TCP byte stream.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: envelope (UTF-8 JSON `{to, from, body, options}`)
//!
//! Each frame is self-delimiting, so consecutive envelopes decode from a
//! continuous stream without any other markers.

use anyhow::{anyhow, bail, Result};

use crate::envelope::Envelope;

/// Default maximum frame payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Bytes in the length header.
const HEADER_LEN: usize = 4;

/// Frame type constants.
pub mod frame_type {
    /// JSON-encoded envelope.
    pub const ENVELOPE: u8 = 0x01;
}

/// Encode an envelope into a wire-format byte vector.
///
/// Returns `[u32 LE length][u8 type][payload]`.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized or the encoded
/// payload exceeds `max_frame_size`.
pub fn encode_envelope(envelope: &Envelope, max_frame_size: u32) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| anyhow!("Envelope serialization failed: {e}"))?;
    let length = payload.len() + 1; // +1 for type byte
    if length > max_frame_size as usize {
        bail!("Frame too large: {length} bytes (max {max_frame_size})");
    }
    Ok(encode_raw(frame_type::ENVELOPE, &payload))
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(HEADER_LEN + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single frame from a type byte and payload.
fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Envelope> {
    match frame_type {
        frame_type::ENVELOPE => serde_json::from_slice(payload)
            .map_err(|e| anyhow!("Invalid envelope frame: {e}")),
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete envelopes.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a new decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new decoder rejecting frames larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder and extract all complete envelopes.
    ///
    /// Returns decoded envelopes in arrival order. Incomplete data is
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    /// The decoder must not be used after an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>> {
        self.buf.extend_from_slice(bytes);
        self.drain()
    }

    /// Buffer bytes without decoding them yet.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered and not yet decoded.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Extract every complete envelope already buffered.
    ///
    /// # Errors
    ///
    /// Same as [`FrameDecoder::feed`]. Envelopes decoded before the bad
    /// frame are lost; use [`FrameDecoder::next_envelope`] to keep them.
    pub fn drain(&mut self) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next_envelope()? {
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    /// Decode the next complete envelope, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the next frame is malformed or exceeds the size
    /// limit. Envelopes returned by earlier calls are unaffected.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

        if length == 0 {
            bail!("Invalid frame: zero length");
        }
        if length > self.max_frame_size {
            bail!("Frame too large: {length} bytes (max {})", self.max_frame_size);
        }

        let total = HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return Ok(None); // wait for more data
        }

        let frame_type = self.buf[HEADER_LEN];
        let envelope = decode_frame(frame_type, &self.buf[HEADER_LEN + 1..total])?;
        self.buf.drain(..total);
        Ok(Some(envelope))
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn sample() -> Envelope {
        Envelope::new(["tcpServer", "foo"])
            .with_from(["funds"])
            .with_body(serde_json::json!({"amount": 12, "memo": "well"}))
            .with_option("yakuza", "yen")
    }

    #[test]
    fn test_envelope_survives_encoding() {
        let env = sample();
        let encoded = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded[4], frame_type::ENVELOPE);

        let mut decoder = FrameDecoder::new();
        let envelopes = decoder.feed(&encoded).unwrap();
        assert_eq!(envelopes, vec![env]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_single_feed_keep_order() {
        let mut buf = Vec::new();
        for i in 0..3 {
            let env = Envelope::new(["seq"]).with_body(i);
            buf.extend_from_slice(&encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let envelopes = decoder.feed(&buf).unwrap();
        let bodies: Vec<_> = envelopes.iter().map(|e| e.body.clone()).collect();
        assert_eq!(bodies, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = encode_envelope(&sample(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        let envelopes = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = encode_envelope(&sample(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let envelopes = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(envelopes.is_empty());
            } else {
                assert_eq!(envelopes, vec![sample()]);
            }
        }
    }

    #[test]
    fn test_minimal_peer_document() {
        let payload = br#"{"to":["foo"]}"#;
        let buf = encode_raw(frame_type::ENVELOPE, payload);
        let mut decoder = FrameDecoder::new();
        let envelopes = decoder.feed(&buf).unwrap();
        assert_eq!(envelopes[0].to, Address::from(["foo"]));
        assert!(envelopes[0].from.is_empty());
    }

    #[test]
    fn test_pushed_bytes_decode_on_drain() {
        let encoded = encode_envelope(&sample(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        assert_eq!(decoder.buffered_len(), encoded.len());

        assert_eq!(decoder.drain().unwrap(), vec![sample()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_next_envelope_yields_frames_before_a_bad_one() {
        let mut buf = encode_envelope(&sample(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        buf.extend_from_slice(&encode_raw(frame_type::ENVELOPE, b"{not json"));

        let mut decoder = FrameDecoder::new();
        decoder.push(&buf);
        assert_eq!(decoder.next_envelope().unwrap(), Some(sample()));
        assert!(decoder.next_envelope().is_err());
    }

    #[test]
    fn test_next_envelope_waits_for_complete_frame() {
        let encoded = encode_envelope(&sample(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded[..encoded.len() - 1]);
        assert_eq!(decoder.next_envelope().unwrap(), None);
        decoder.push(&encoded[encoded.len() - 1..]);
        assert_eq!(decoder.next_envelope().unwrap(), Some(sample()));
        assert_eq!(decoder.next_envelope().unwrap(), None);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(64);
        let buf = 65u32.to_le_bytes();
        let err = decoder.feed(&buf).unwrap_err();
        assert!(err.to_string().contains("too large"), "unexpected error: {err}");
    }

    #[test]
    fn test_encode_respects_limit() {
        let env = Envelope::new(["foo"]).with_body("x".repeat(128));
        assert!(encode_envelope(&env, 32).is_err());
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let buf = encode_raw(0xFF, b"test");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_invalid_json_rejected() {
        let buf = encode_raw(frame_type::ENVELOPE, b"{not json");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }
}
