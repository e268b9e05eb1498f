//! Length-prefixed frame codec (C1).
//!
//! Frame layout: 4-byte big-endian payload length, 1-byte flags, payload.
//! Flag bits (LSB first): bit 0 = compressed; bits 1-2 = format
//! (00 = binary-tagged, 01 = JSON, 10/11 reserved); bits 3-7 reserved.

use crate::envelope::Envelope;
use crate::error::CodecError;

/// Maximum payload length: 16 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_FORMAT_MASK: u8 = 0b0000_0110;
const FLAG_FORMAT_SHIFT: u8 = 1;
const FLAG_RESERVED_MASK: u8 = 0b1111_1000;

/// Wire serialization format. Each frame carries its own format bit, so the
/// two are interchangeable on the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// bincode-encoded envelope (bits `00`).
    Binary,
    /// JSON-encoded envelope (bits `01`).
    Json,
}

impl Format {
    fn bits(self) -> u8 {
        match self {
            Format::Binary => 0b00,
            Format::Json => 0b01,
        }
    }

    fn from_bits(bits: u8) -> Option<Format> {
        match bits {
            0b00 => Some(Format::Binary),
            0b01 => Some(Format::Json),
            _ => None,
        }
    }
}

/// A decoded frame plus how many bytes of the input buffer it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub envelope: Envelope,
    pub consumed: usize,
}

/// Encodes and decodes frames, with an optional compression hook.
///
/// The hook only fires above `compress_above_bytes`, which defaults to
/// `u64::MAX` ("never") so the hot LAN path stays allocation-free, matching
/// the distilled spec's "default: never" compression threshold.
#[derive(Clone)]
pub struct Codec {
    compress_above_bytes: u64,
    compressor: Option<fn(&[u8]) -> Vec<u8>>,
    decompressor: Option<fn(&[u8]) -> std::io::Result<Vec<u8>>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            compress_above_bytes: u64::MAX,
            compressor: None,
            decompressor: None,
        }
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable DEFLATE compression (via `flate2`) above `threshold_bytes`.
    pub fn with_compression(mut self, threshold_bytes: u64) -> Self {
        self.compress_above_bytes = threshold_bytes;
        self.compressor = Some(deflate_compress);
        self.decompressor = Some(deflate_decompress);
        self
    }

    /// Serialize `envelope` in `format`, writing the length-prefixed frame.
    pub fn encode(&self, envelope: &Envelope, format: Format) -> Result<Vec<u8>, CodecError> {
        let mut body = match format {
            Format::Binary => {
                bincode::serialize(envelope).map_err(|e| CodecError::Encode(e.to_string()))?
            }
            Format::Json => {
                serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))?
            }
        };

        let mut flags = format.bits() << FLAG_FORMAT_SHIFT;

        if let Some(compressor) = self.compressor {
            if body.len() as u64 > self.compress_above_bytes {
                body = compressor(&body);
                flags |= FLAG_COMPRESSED;
            }
        }

        if body.len() > MAX_FRAME_PAYLOAD {
            return Err(CodecError::MessageTooLarge { len: body.len() });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.push(flags);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Attempt to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame (the
    /// caller should read more bytes and retry). Never consumes more bytes
    /// than it reports in [`Decoded::consumed`].
    pub fn decode(&self, buf: &[u8]) -> Result<Option<Decoded>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let flags = buf[4];

        if len > MAX_FRAME_PAYLOAD {
            return Err(CodecError::MessageTooLarge { len });
        }

        if flags & FLAG_RESERVED_MASK != 0 {
            return Err(CodecError::InvalidEnvelope);
        }

        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut body = buf[HEADER_LEN..total].to_vec();

        if flags & FLAG_COMPRESSED != 0 {
            let decompressor = self
                .decompressor
                .ok_or(CodecError::CompressedFrameRequiresAsyncPath)?;
            body = decompressor(&body).map_err(|e| CodecError::Decode(e.to_string()))?;
        }

        let format = Format::from_bits((flags & FLAG_FORMAT_MASK) >> FLAG_FORMAT_SHIFT)
            .ok_or(CodecError::InvalidEnvelope)?;

        let envelope: Envelope = match format {
            Format::Binary => {
                bincode::deserialize(&body).map_err(|e| CodecError::Decode(e.to_string()))?
            }
            Format::Json => {
                serde_json::from_slice(&body).map_err(|e| CodecError::Decode(e.to_string()))?
            }
        };

        if !envelope.is_well_formed() {
            return Err(CodecError::InvalidEnvelope);
        }

        Ok(Some(Decoded {
            envelope,
            consumed: total,
        }))
    }

    /// Decode every complete frame currently sitting in `buf`, returning the
    /// envelopes in wire order and leaving any trailing partial frame bytes
    /// untouched (the caller is expected to drain `buf` by `consumed` as it
    /// goes, e.g. via `buf.drain(..consumed)`).
    pub fn decode_all(&self, mut buf: &[u8]) -> Result<Vec<Decoded>, CodecError> {
        let mut out = Vec::new();
        loop {
            match self.decode(buf)? {
                Some(decoded) => {
                    let consumed = decoded.consumed;
                    out.push(decoded);
                    buf = &buf[consumed..];
                }
                None => break,
            }
        }
        Ok(out)
    }
}

fn deflate_compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // An in-memory `Vec` writer never fails; swallow the (infallible) error.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn deflate_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        Envelope {
            namespace: "events".into(),
            msg_type: "x".into(),
            payload: json!({"v": 1}),
            timestamp: Some(1234),
        }
    }

    #[test]
    fn round_trips_both_formats() {
        let codec = Codec::new();
        let env = sample_envelope();

        for format in [Format::Binary, Format::Json] {
            let frame = codec.encode(&env, format).unwrap();
            let decoded = codec.decode(&frame).unwrap().unwrap();
            assert_eq!(decoded.envelope, env);
            assert_eq!(decoded.consumed, frame.len());
        }
    }

    #[test]
    fn incomplete_header_requests_more_bytes() {
        let codec = Codec::new();
        assert!(codec.decode(&[0u8; 4]).unwrap().is_none());
    }

    #[test]
    fn incomplete_payload_requests_more_bytes() {
        let codec = Codec::new();
        let env = sample_envelope();
        let frame = codec.encode(&env, Format::Json).unwrap();
        let partial = &frame[..frame.len() - 1];
        assert!(codec.decode(partial).unwrap().is_none());
    }

    #[test]
    fn decode_all_drains_multiple_frames_in_order() {
        let codec = Codec::new();
        let a = Envelope::new("ns", "a", json!(1));
        let b = Envelope::new("ns", "b", json!(2));
        let mut buf = codec.encode(&a, Format::Json).unwrap();
        buf.extend(codec.encode(&b, Format::Binary).unwrap());
        buf.extend_from_slice(&[0, 0, 0]); // trailing partial frame header

        let decoded = codec.decode_all(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].envelope.msg_type, "a");
        assert_eq!(decoded[1].envelope.msg_type, "b");
        let total_consumed: usize = decoded.iter().map(|d| d.consumed).sum();
        assert_eq!(total_consumed, buf.len() - 3);
    }

    #[test]
    fn rejects_oversized_payload() {
        let codec = Codec::new();
        let mut frame = Vec::new();
        let oversized = (MAX_FRAME_PAYLOAD as u32) + 1;
        frame.extend_from_slice(&oversized.to_be_bytes());
        frame.push(0);
        assert_eq!(
            codec.decode(&frame).unwrap_err(),
            CodecError::MessageTooLarge {
                len: oversized as usize
            }
        );
    }

    #[test]
    fn accepts_exactly_16_mib_payload() {
        let codec = Codec::new();
        let len = MAX_FRAME_PAYLOAD as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(FLAG_FORMAT_MASK & (Format::Json.bits() << FLAG_FORMAT_SHIFT));
        frame.extend(vec![b'{'; MAX_FRAME_PAYLOAD]);
        // This payload isn't valid JSON, so decoding fails past the length
        // check - what we're proving here is that the length gate itself
        // accepts exactly 16 MiB rather than rejecting it outright.
        match codec.decode(&frame) {
            Err(CodecError::MessageTooLarge { .. }) => panic!("16 MiB exactly must be accepted"),
            _ => {}
        }
    }

    #[test]
    fn rejects_empty_namespace_or_type() {
        let codec = Codec::new();
        let env = Envelope {
            namespace: String::new(),
            msg_type: "x".into(),
            payload: json!(null),
            timestamp: None,
        };
        let frame = codec.encode(&env, Format::Json).unwrap();
        assert_eq!(codec.decode(&frame).unwrap_err(), CodecError::InvalidEnvelope);
    }

    #[test]
    fn compressed_frame_without_decompressor_fails_sync_path() {
        let plain_codec = Codec::new();
        let compressing_codec = Codec::new().with_compression(0);
        let env = sample_envelope();
        let frame = compressing_codec.encode(&env, Format::Json).unwrap();

        assert_eq!(
            plain_codec.decode(&frame).unwrap_err(),
            CodecError::CompressedFrameRequiresAsyncPath
        );
        assert_eq!(
            compressing_codec.decode(&frame).unwrap().unwrap().envelope,
            env
        );
    }

    #[test]
    fn reserved_flag_bits_are_rejected() {
        let codec = Codec::new();
        let mut frame = vec![0, 0, 0, 1, 0b1000_0000];
        frame.push(b'0');
        assert_eq!(codec.decode(&frame).unwrap_err(), CodecError::InvalidEnvelope);
    }
}
