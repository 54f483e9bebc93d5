//! Legacy wire protocol: length-framed JSON messages.
//!
//! Frame layout: `FF 00 00 | length as 8 big-endian hex chars | 00 |
//! payload | 00 00 FF`. The payload is `{"type": <code>, "data": <value?>}`.
//! The parser scans for the initiator sequence and resynchronizes past
//! garbage, so one mangled frame does not poison the stream; a payload that
//! fails to decode is an `InvalidStructure` and the session closes the
//! connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::crypto::Hash32;

pub const PROTOCOL_VERSION: u32 = 1;

const FRAME_INITIATOR: [u8; 3] = [0xFF, 0x00, 0x00];
const FRAME_TERMINATOR: [u8; 3] = [0x00, 0x00, 0xFF];
const HEADER_LEN: usize = 3 + 8 + 1;

/// Hard cap on a single payload; anything larger is hostile.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Gossiped payload kinds announced by a message receipt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiptType {
    #[serde(rename = "BK")]
    Block,
    #[serde(rename = "TX")]
    Transfer,
    #[serde(rename = "ST")]
    Stake,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptData {
    pub hash: Hash32,
    #[serde(rename = "type")]
    pub msg_type: ReceiptType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FullMessageRequest {
    pub hash: Hash32,
    #[serde(rename = "type")]
    pub msg_type: ReceiptType,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct HeightData {
    pub block_number: u64,
    pub headerhash: Hash32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VersionData {
    pub version: u32,
    pub genesis_prev_headerhash: Hash32,
}

/// Every message the node speaks, tagged with its legacy two/four-letter
/// code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NetMessage {
    /// Hash announcement; payload travels only on request.
    #[serde(rename = "MR")]
    MessageReceipt(ReceiptData),
    /// Pull request for an announced hash.
    #[serde(rename = "SFM")]
    SendFullMessage(FullMessageRequest),
    #[serde(rename = "BK")]
    Block(Box<Block>),
    #[serde(rename = "TX")]
    Transfer(Box<Transaction>),
    #[serde(rename = "ST")]
    Stake(Box<Transaction>),
    /// Fetch block by number (sync backfill).
    #[serde(rename = "FB")]
    FetchBlock(u64),
    /// Reply to FB.
    #[serde(rename = "PB")]
    PushBlock(Box<Block>),
    /// Fetch header by number (fork probing).
    #[serde(rename = "FH")]
    FetchHeader(u64),
    #[serde(rename = "PH")]
    PushHeader(HeightData),
    /// Blockheight exchange: request carries ours, reply carries theirs.
    #[serde(rename = "MB")]
    BlockHeight(HeightData),
    #[serde(rename = "CB")]
    BlockHeightReply(HeightData),
    #[serde(rename = "FMBH")]
    FetchMaxBlockHeight,
    #[serde(rename = "PMBH")]
    PushMaxBlockHeight(HeightData),
    /// Handshake; mismatched genesis closes the connection.
    #[serde(rename = "VE")]
    Version(VersionData),
    #[serde(rename = "PL")]
    PeerList(Vec<String>),
    #[serde(rename = "PE")]
    RequestPeers,
    #[serde(rename = "PI")]
    Ping(String),
    #[serde(rename = "PO")]
    Pong(String),
}

/// Serialize and frame a message for the wire.
pub fn wrap_message(msg: &NetMessage) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 3);
    out.extend_from_slice(&FRAME_INITIATOR);
    out.extend_from_slice(format!("{:08x}", payload.len() as u32).as_bytes());
    out.push(0x00);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&FRAME_TERMINATOR);
    Ok(out)
}

fn find_initiator(buf: &[u8]) -> Option<usize> {
    buf.windows(3).position(|w| w == FRAME_INITIATOR)
}

/// Streaming frame reassembler. Bytes go in, complete payloads come out;
/// anything unparseable is skipped at the next initiator sequence.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame's payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = match find_initiator(&self.buf) {
                Some(pos) => {
                    if pos > 0 {
                        self.buf.drain(..pos);
                    }
                    0
                }
                None => {
                    // keep a potential partial initiator at the tail
                    let keep = self.buf.len().min(2);
                    self.buf.drain(..self.buf.len() - keep);
                    return None;
                }
            };

            if self.buf.len() < start + HEADER_LEN {
                return None;
            }

            let len_field = &self.buf[3..11];
            let len = match std::str::from_utf8(len_field)
                .ok()
                .and_then(|s| u32::from_str_radix(s, 16).ok())
            {
                Some(len) if (len as usize) <= MAX_PAYLOAD_BYTES && self.buf[11] == 0x00 => {
                    len as usize
                }
                _ => {
                    // corrupt header, resync past this initiator
                    self.buf.drain(..3);
                    continue;
                }
            };

            let total = HEADER_LEN + len + 3;
            if self.buf.len() < total {
                return None;
            }
            if self.buf[HEADER_LEN + len..total] != FRAME_TERMINATOR {
                self.buf.drain(..3);
                continue;
            }

            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..total);
            return Some(payload);
        }
    }
}

pub fn decode_payload(payload: &[u8]) -> Result<NetMessage, WireError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_roundtrip(msg: NetMessage) -> NetMessage {
        let bytes = wrap_message(&msg).unwrap();
        let mut buf = FrameBuffer::default();
        buf.push(&bytes);
        let payload = buf.next_frame().expect("one frame");
        decode_payload(&payload).unwrap()
    }

    #[test]
    fn test_roundtrip_receipt() {
        let msg = NetMessage::MessageReceipt(ReceiptData {
            hash: [7u8; 32],
            msg_type: ReceiptType::Block,
            extra: None,
        });
        assert_eq!(frame_roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_roundtrip_every_simple_code() {
        let height = HeightData { block_number: 9, headerhash: [1u8; 32] };
        for msg in [
            NetMessage::FetchBlock(42),
            NetMessage::FetchHeader(7),
            NetMessage::PushHeader(height),
            NetMessage::BlockHeight(height),
            NetMessage::BlockHeightReply(height),
            NetMessage::FetchMaxBlockHeight,
            NetMessage::PushMaxBlockHeight(height),
            NetMessage::Version(VersionData { version: 1, genesis_prev_headerhash: [0u8; 32] }),
            NetMessage::PeerList(vec!["10.1.1.1:19000".into()]),
            NetMessage::RequestPeers,
            NetMessage::Ping("NG".into()),
            NetMessage::Pong("NG".into()),
        ] {
            assert_eq!(frame_roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_wire_shape_uses_legacy_codes() {
        let msg = NetMessage::SendFullMessage(FullMessageRequest {
            hash: [0u8; 32],
            msg_type: ReceiptType::Transfer,
        });
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "SFM");
        assert_eq!(json["data"]["type"], "TX");
    }

    #[test]
    fn test_split_delivery_reassembles() {
        let msg = NetMessage::Ping("NG".into());
        let bytes = wrap_message(&msg).unwrap();
        let mut buf = FrameBuffer::default();
        let (a, b) = bytes.split_at(bytes.len() / 2);
        buf.push(a);
        assert!(buf.next_frame().is_none());
        buf.push(b);
        assert!(buf.next_frame().is_some());
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let msg = NetMessage::RequestPeers;
        let mut stream = b"noise noise".to_vec();
        stream.extend_from_slice(&wrap_message(&msg).unwrap());
        let mut buf = FrameBuffer::default();
        buf.push(&stream);
        let payload = buf.next_frame().unwrap();
        assert_eq!(decode_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn test_corrupt_length_resyncs_to_next_frame() {
        let good = wrap_message(&NetMessage::Ping("NG".into())).unwrap();
        let mut corrupt = good.clone();
        corrupt[4] = b'z'; // not hex
        let mut stream = corrupt;
        stream.extend_from_slice(&good);
        let mut buf = FrameBuffer::default();
        buf.push(&stream);
        let payload = buf.next_frame().unwrap();
        assert_eq!(decode_payload(&payload).unwrap(), NetMessage::Ping("NG".into()));
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let a = wrap_message(&NetMessage::Ping("NG".into())).unwrap();
        let b = wrap_message(&NetMessage::Pong("NG".into())).unwrap();
        let mut buf = FrameBuffer::default();
        let mut stream = a;
        stream.extend_from_slice(&b);
        buf.push(&stream);
        assert!(buf.next_frame().is_some());
        assert!(buf.next_frame().is_some());
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn test_undecodable_payload_is_error() {
        assert!(decode_payload(b"{\"type\":\"??\"}").is_err());
    }
}
