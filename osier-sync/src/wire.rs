//  Copyright 2025 Osier Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Messages and their byte format.
//!
//! After the preamble the stream is a sequence of frames, each a varint
//! length followed by a kind byte and the message body. The kind decides
//! the logical channel; identifier, token, capability and group-member
//! bytes inside the body are delegated to the scheme encodings.

use bytes::{BufMut, Bytes, BytesMut};
use osier_common::code::{get_bytes, put_bool, put_bytes, put_varint};
use osier_common::{
    AreaOfInterest, CodeError, Decode, Encode, LengthyEntry, Range3d, Reader, Schemes,
};
use osier_storage::SchemeEntry;

use crate::error::{Result, SyncError};

pub type SchemeLengthyEntry<S> = LengthyEntry<
    <S as Schemes>::NamespaceId,
    <S as Schemes>::SubspaceId,
    <S as Schemes>::PayloadDigest,
>;

/// The seven logical channels multiplexed over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reconciliation,
    Data,
    Intersection,
    Capability,
    AreaOfInterest,
    PayloadRequest,
    StaticToken,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Reconciliation,
        Channel::Data,
        Channel::Intersection,
        Channel::Capability,
        Channel::AreaOfInterest,
        Channel::PayloadRequest,
        Channel::StaticToken,
    ];

    pub fn index(self) -> usize {
        match self {
            Channel::Reconciliation => 0,
            Channel::Data => 1,
            Channel::Intersection => 2,
            Channel::Capability => 3,
            Channel::AreaOfInterest => 4,
            Channel::PayloadRequest => 5,
            Channel::StaticToken => 6,
        }
    }

    fn to_byte(self) -> u8 {
        self.index() as u8
    }

    fn from_byte(byte: u8) -> std::result::Result<Self, CodeError> {
        Channel::ALL
            .get(byte as usize)
            .copied()
            .ok_or(CodeError::Invalid("channel byte out of range"))
    }
}

/// The handle namespaces a `ControlFree` can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Intersection,
    Capability,
    AreaOfInterest,
    PayloadRequest,
    StaticToken,
}

impl HandleType {
    fn to_byte(self) -> u8 {
        match self {
            HandleType::Intersection => 0,
            HandleType::Capability => 1,
            HandleType::AreaOfInterest => 2,
            HandleType::PayloadRequest => 3,
            HandleType::StaticToken => 4,
        }
    }

    fn from_byte(byte: u8) -> std::result::Result<Self, CodeError> {
        Ok(match byte {
            0 => HandleType::Intersection,
            1 => HandleType::Capability,
            2 => HandleType::AreaOfInterest,
            3 => HandleType::PayloadRequest,
            4 => HandleType::StaticToken,
            _ => return Err(CodeError::Invalid("handle type byte out of range")),
        })
    }
}

pub enum Message<S: Schemes> {
    CommitmentReveal {
        nonce: Vec<u8>,
    },
    ControlIssueGuarantee {
        channel: Channel,
        amount: u64,
    },
    ControlAbsolve {
        channel: Channel,
        amount: u64,
    },
    ControlPlead {
        channel: Channel,
        target: u64,
    },
    ControlAnnounceDropping {
        channel: Channel,
    },
    ControlApologise {
        channel: Channel,
    },
    ControlFree {
        handle: u64,
        handle_type: HandleType,
        mine: bool,
    },
    DataSetMetadata {
        payload: Vec<u8>,
    },
    PaiBindFragment {
        group_member: S::GroupMember,
        is_secondary: bool,
    },
    PaiReplyFragment {
        handle: u64,
        group_member: S::GroupMember,
    },
    PaiRequestSubspaceCapability {
        handle: u64,
    },
    PaiReplySubspaceCapability {
        handle: u64,
        capability: S::SubspaceCapability,
        signature: S::Signature,
    },
    SetupBindReadCapability {
        capability: S::ReadCapability,
        handle: u64,
        signature: S::Signature,
    },
    SetupBindAreaOfInterest {
        area_of_interest: AreaOfInterest<S::SubspaceId>,
        authorisation: u64,
    },
    SetupBindStaticToken {
        static_token: S::StaticToken,
    },
    ReconciliationSendFingerprint {
        range: Range3d<S::SubspaceId>,
        fingerprint: S::Fingerprint,
        sender_handle: u64,
        receiver_handle: u64,
        covers: Option<u64>,
    },
    ReconciliationAnnounceEntries {
        range: Range3d<S::SubspaceId>,
        count: u64,
        want_response: bool,
        will_sort: bool,
        sender_handle: u64,
        receiver_handle: u64,
        covers: Option<u64>,
    },
    ReconciliationSendEntry {
        entry: SchemeLengthyEntry<S>,
        static_token_handle: u64,
        dynamic_token: S::DynamicToken,
    },
    ReconciliationSendPayload {
        amount: u64,
        bytes: Bytes,
    },
    DataSendEntry {
        entry: SchemeEntry<S>,
        offset: u64,
        static_token_handle: u64,
        dynamic_token: S::DynamicToken,
    },
    DataSendPayload {
        amount: u64,
        bytes: Bytes,
    },
    DataBindPayloadRequest {
        entry: SchemeEntry<S>,
        offset: u64,
        capability: u64,
    },
    DataReplyPayload {
        handle: u64,
    },
}

const KIND_COMMITMENT_REVEAL: u8 = 1;
const KIND_ISSUE_GUARANTEE: u8 = 2;
const KIND_ABSOLVE: u8 = 3;
const KIND_PLEAD: u8 = 4;
const KIND_ANNOUNCE_DROPPING: u8 = 5;
const KIND_APOLOGISE: u8 = 6;
const KIND_FREE: u8 = 7;
const KIND_SET_METADATA: u8 = 8;
const KIND_PAI_BIND_FRAGMENT: u8 = 9;
const KIND_PAI_REPLY_FRAGMENT: u8 = 10;
const KIND_PAI_REQUEST_SUBSPACE_CAP: u8 = 11;
const KIND_PAI_REPLY_SUBSPACE_CAP: u8 = 12;
const KIND_BIND_READ_CAPABILITY: u8 = 13;
const KIND_BIND_AREA_OF_INTEREST: u8 = 14;
const KIND_BIND_STATIC_TOKEN: u8 = 15;
const KIND_SEND_FINGERPRINT: u8 = 16;
const KIND_ANNOUNCE_ENTRIES: u8 = 17;
const KIND_RECONCILIATION_SEND_ENTRY: u8 = 18;
const KIND_RECONCILIATION_SEND_PAYLOAD: u8 = 19;
const KIND_DATA_SEND_ENTRY: u8 = 20;
const KIND_DATA_SEND_PAYLOAD: u8 = 21;
const KIND_BIND_PAYLOAD_REQUEST: u8 = 22;
const KIND_REPLY_PAYLOAD: u8 = 23;

impl<S: Schemes> Message<S> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::CommitmentReveal { .. } => "CommitmentReveal",
            Message::ControlIssueGuarantee { .. } => "ControlIssueGuarantee",
            Message::ControlAbsolve { .. } => "ControlAbsolve",
            Message::ControlPlead { .. } => "ControlPlead",
            Message::ControlAnnounceDropping { .. } => "ControlAnnounceDropping",
            Message::ControlApologise { .. } => "ControlApologise",
            Message::ControlFree { .. } => "ControlFree",
            Message::DataSetMetadata { .. } => "DataSetMetadata",
            Message::PaiBindFragment { .. } => "PaiBindFragment",
            Message::PaiReplyFragment { .. } => "PaiReplyFragment",
            Message::PaiRequestSubspaceCapability { .. } => "PaiRequestSubspaceCapability",
            Message::PaiReplySubspaceCapability { .. } => "PaiReplySubspaceCapability",
            Message::SetupBindReadCapability { .. } => "SetupBindReadCapability",
            Message::SetupBindAreaOfInterest { .. } => "SetupBindAreaOfInterest",
            Message::SetupBindStaticToken { .. } => "SetupBindStaticToken",
            Message::ReconciliationSendFingerprint { .. } => "ReconciliationSendFingerprint",
            Message::ReconciliationAnnounceEntries { .. } => "ReconciliationAnnounceEntries",
            Message::ReconciliationSendEntry { .. } => "ReconciliationSendEntry",
            Message::ReconciliationSendPayload { .. } => "ReconciliationSendPayload",
            Message::DataSendEntry { .. } => "DataSendEntry",
            Message::DataSendPayload { .. } => "DataSendPayload",
            Message::DataBindPayloadRequest { .. } => "DataBindPayloadRequest",
            Message::DataReplyPayload { .. } => "DataReplyPayload",
        }
    }

    /// The logical channel this message travels on, `None` for control
    /// messages.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Message::CommitmentReveal { .. }
            | Message::ControlIssueGuarantee { .. }
            | Message::ControlAbsolve { .. }
            | Message::ControlPlead { .. }
            | Message::ControlAnnounceDropping { .. }
            | Message::ControlApologise { .. }
            | Message::ControlFree { .. }
            | Message::DataSetMetadata { .. } => None,
            Message::PaiBindFragment { .. }
            | Message::PaiReplyFragment { .. }
            | Message::PaiRequestSubspaceCapability { .. }
            | Message::PaiReplySubspaceCapability { .. } => Some(Channel::Intersection),
            Message::SetupBindReadCapability { .. } => Some(Channel::Capability),
            Message::SetupBindAreaOfInterest { .. } => Some(Channel::AreaOfInterest),
            Message::SetupBindStaticToken { .. } => Some(Channel::StaticToken),
            Message::ReconciliationSendFingerprint { .. }
            | Message::ReconciliationAnnounceEntries { .. }
            | Message::ReconciliationSendEntry { .. }
            | Message::ReconciliationSendPayload { .. } => Some(Channel::Reconciliation),
            Message::DataSendEntry { .. }
            | Message::DataSendPayload { .. }
            | Message::DataReplyPayload { .. } => Some(Channel::Data),
            Message::DataBindPayloadRequest { .. } => Some(Channel::PayloadRequest),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::CommitmentReveal { nonce } => {
                out.put_u8(KIND_COMMITMENT_REVEAL);
                put_bytes(out, nonce);
            }
            Message::ControlIssueGuarantee { channel, amount } => {
                out.put_u8(KIND_ISSUE_GUARANTEE);
                out.put_u8(channel.to_byte());
                put_varint(out, *amount);
            }
            Message::ControlAbsolve { channel, amount } => {
                out.put_u8(KIND_ABSOLVE);
                out.put_u8(channel.to_byte());
                put_varint(out, *amount);
            }
            Message::ControlPlead { channel, target } => {
                out.put_u8(KIND_PLEAD);
                out.put_u8(channel.to_byte());
                put_varint(out, *target);
            }
            Message::ControlAnnounceDropping { channel } => {
                out.put_u8(KIND_ANNOUNCE_DROPPING);
                out.put_u8(channel.to_byte());
            }
            Message::ControlApologise { channel } => {
                out.put_u8(KIND_APOLOGISE);
                out.put_u8(channel.to_byte());
            }
            Message::ControlFree {
                handle,
                handle_type,
                mine,
            } => {
                out.put_u8(KIND_FREE);
                put_varint(out, *handle);
                out.put_u8(handle_type.to_byte());
                put_bool(out, *mine);
            }
            Message::DataSetMetadata { payload } => {
                out.put_u8(KIND_SET_METADATA);
                put_bytes(out, payload);
            }
            Message::PaiBindFragment {
                group_member,
                is_secondary,
            } => {
                out.put_u8(KIND_PAI_BIND_FRAGMENT);
                group_member.encode(out);
                put_bool(out, *is_secondary);
            }
            Message::PaiReplyFragment {
                handle,
                group_member,
            } => {
                out.put_u8(KIND_PAI_REPLY_FRAGMENT);
                put_varint(out, *handle);
                group_member.encode(out);
            }
            Message::PaiRequestSubspaceCapability { handle } => {
                out.put_u8(KIND_PAI_REQUEST_SUBSPACE_CAP);
                put_varint(out, *handle);
            }
            Message::PaiReplySubspaceCapability {
                handle,
                capability,
                signature,
            } => {
                out.put_u8(KIND_PAI_REPLY_SUBSPACE_CAP);
                put_varint(out, *handle);
                capability.encode(out);
                signature.encode(out);
            }
            Message::SetupBindReadCapability {
                capability,
                handle,
                signature,
            } => {
                out.put_u8(KIND_BIND_READ_CAPABILITY);
                capability.encode(out);
                put_varint(out, *handle);
                signature.encode(out);
            }
            Message::SetupBindAreaOfInterest {
                area_of_interest,
                authorisation,
            } => {
                out.put_u8(KIND_BIND_AREA_OF_INTEREST);
                area_of_interest.encode(out);
                put_varint(out, *authorisation);
            }
            Message::SetupBindStaticToken { static_token } => {
                out.put_u8(KIND_BIND_STATIC_TOKEN);
                static_token.encode(out);
            }
            Message::ReconciliationSendFingerprint {
                range,
                fingerprint,
                sender_handle,
                receiver_handle,
                covers,
            } => {
                out.put_u8(KIND_SEND_FINGERPRINT);
                range.encode(out);
                fingerprint.encode(out);
                put_varint(out, *sender_handle);
                put_varint(out, *receiver_handle);
                encode_covers(out, *covers);
            }
            Message::ReconciliationAnnounceEntries {
                range,
                count,
                want_response,
                will_sort,
                sender_handle,
                receiver_handle,
                covers,
            } => {
                out.put_u8(KIND_ANNOUNCE_ENTRIES);
                range.encode(out);
                put_varint(out, *count);
                put_bool(out, *want_response);
                put_bool(out, *will_sort);
                put_varint(out, *sender_handle);
                put_varint(out, *receiver_handle);
                encode_covers(out, *covers);
            }
            Message::ReconciliationSendEntry {
                entry,
                static_token_handle,
                dynamic_token,
            } => {
                out.put_u8(KIND_RECONCILIATION_SEND_ENTRY);
                entry.encode(out);
                put_varint(out, *static_token_handle);
                dynamic_token.encode(out);
            }
            Message::ReconciliationSendPayload { amount, bytes } => {
                out.put_u8(KIND_RECONCILIATION_SEND_PAYLOAD);
                put_varint(out, *amount);
                put_bytes(out, bytes);
            }
            Message::DataSendEntry {
                entry,
                offset,
                static_token_handle,
                dynamic_token,
            } => {
                out.put_u8(KIND_DATA_SEND_ENTRY);
                entry.encode(out);
                put_varint(out, *offset);
                put_varint(out, *static_token_handle);
                dynamic_token.encode(out);
            }
            Message::DataSendPayload { amount, bytes } => {
                out.put_u8(KIND_DATA_SEND_PAYLOAD);
                put_varint(out, *amount);
                put_bytes(out, bytes);
            }
            Message::DataBindPayloadRequest {
                entry,
                offset,
                capability,
            } => {
                out.put_u8(KIND_BIND_PAYLOAD_REQUEST);
                entry.encode(out);
                put_varint(out, *offset);
                put_varint(out, *capability);
            }
            Message::DataReplyPayload { handle } => {
                out.put_u8(KIND_REPLY_PAYLOAD);
                put_varint(out, *handle);
            }
        }
    }

    fn decode_body(reader: &mut Reader<'_>) -> std::result::Result<Self, CodeError> {
        let kind = reader.get_u8()?;
        let message = match kind {
            KIND_COMMITMENT_REVEAL => Message::CommitmentReveal {
                nonce: get_bytes(reader)?.to_vec(),
            },
            KIND_ISSUE_GUARANTEE => Message::ControlIssueGuarantee {
                channel: Channel::from_byte(reader.get_u8()?)?,
                amount: reader.get_varint()?,
            },
            KIND_ABSOLVE => Message::ControlAbsolve {
                channel: Channel::from_byte(reader.get_u8()?)?,
                amount: reader.get_varint()?,
            },
            KIND_PLEAD => Message::ControlPlead {
                channel: Channel::from_byte(reader.get_u8()?)?,
                target: reader.get_varint()?,
            },
            KIND_ANNOUNCE_DROPPING => Message::ControlAnnounceDropping {
                channel: Channel::from_byte(reader.get_u8()?)?,
            },
            KIND_APOLOGISE => Message::ControlApologise {
                channel: Channel::from_byte(reader.get_u8()?)?,
            },
            KIND_FREE => Message::ControlFree {
                handle: reader.get_varint()?,
                handle_type: HandleType::from_byte(reader.get_u8()?)?,
                mine: reader.get_bool()?,
            },
            KIND_SET_METADATA => Message::DataSetMetadata {
                payload: get_bytes(reader)?.to_vec(),
            },
            KIND_PAI_BIND_FRAGMENT => Message::PaiBindFragment {
                group_member: S::GroupMember::decode(reader)?,
                is_secondary: reader.get_bool()?,
            },
            KIND_PAI_REPLY_FRAGMENT => Message::PaiReplyFragment {
                handle: reader.get_varint()?,
                group_member: S::GroupMember::decode(reader)?,
            },
            KIND_PAI_REQUEST_SUBSPACE_CAP => Message::PaiRequestSubspaceCapability {
                handle: reader.get_varint()?,
            },
            KIND_PAI_REPLY_SUBSPACE_CAP => Message::PaiReplySubspaceCapability {
                handle: reader.get_varint()?,
                capability: S::SubspaceCapability::decode(reader)?,
                signature: S::Signature::decode(reader)?,
            },
            KIND_BIND_READ_CAPABILITY => Message::SetupBindReadCapability {
                capability: S::ReadCapability::decode(reader)?,
                handle: reader.get_varint()?,
                signature: S::Signature::decode(reader)?,
            },
            KIND_BIND_AREA_OF_INTEREST => Message::SetupBindAreaOfInterest {
                area_of_interest: AreaOfInterest::decode(reader)?,
                authorisation: reader.get_varint()?,
            },
            KIND_BIND_STATIC_TOKEN => Message::SetupBindStaticToken {
                static_token: S::StaticToken::decode(reader)?,
            },
            KIND_SEND_FINGERPRINT => Message::ReconciliationSendFingerprint {
                range: Range3d::decode(reader)?,
                fingerprint: S::Fingerprint::decode(reader)?,
                sender_handle: reader.get_varint()?,
                receiver_handle: reader.get_varint()?,
                covers: decode_covers(reader)?,
            },
            KIND_ANNOUNCE_ENTRIES => Message::ReconciliationAnnounceEntries {
                range: Range3d::decode(reader)?,
                count: reader.get_varint()?,
                want_response: reader.get_bool()?,
                will_sort: reader.get_bool()?,
                sender_handle: reader.get_varint()?,
                receiver_handle: reader.get_varint()?,
                covers: decode_covers(reader)?,
            },
            KIND_RECONCILIATION_SEND_ENTRY => Message::ReconciliationSendEntry {
                entry: LengthyEntry::decode(reader)?,
                static_token_handle: reader.get_varint()?,
                dynamic_token: S::DynamicToken::decode(reader)?,
            },
            KIND_RECONCILIATION_SEND_PAYLOAD => Message::ReconciliationSendPayload {
                amount: reader.get_varint()?,
                bytes: Bytes::copy_from_slice(get_bytes(reader)?),
            },
            KIND_DATA_SEND_ENTRY => Message::DataSendEntry {
                entry: SchemeEntry::<S>::decode(reader)?,
                offset: reader.get_varint()?,
                static_token_handle: reader.get_varint()?,
                dynamic_token: S::DynamicToken::decode(reader)?,
            },
            KIND_DATA_SEND_PAYLOAD => Message::DataSendPayload {
                amount: reader.get_varint()?,
                bytes: Bytes::copy_from_slice(get_bytes(reader)?),
            },
            KIND_BIND_PAYLOAD_REQUEST => Message::DataBindPayloadRequest {
                entry: SchemeEntry::<S>::decode(reader)?,
                offset: reader.get_varint()?,
                capability: reader.get_varint()?,
            },
            KIND_REPLY_PAYLOAD => Message::DataReplyPayload {
                handle: reader.get_varint()?,
            },
            _ => return Err(CodeError::Invalid("unknown message kind")),
        };
        Ok(message)
    }

    /// One framed message: varint length, kind byte, body.
    pub fn to_frame(&self) -> Bytes {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let mut frame = Vec::with_capacity(body.len() + 4);
        put_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        Bytes::from(frame)
    }
}

impl<S: Schemes> std::fmt::Debug for Message<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message::{}", self.kind_name())
    }
}

fn encode_covers(out: &mut Vec<u8>, covers: Option<u64>) {
    match covers {
        Some(value) => {
            put_bool(out, true);
            put_varint(out, value);
        }
        None => put_bool(out, false),
    }
}

fn decode_covers(reader: &mut Reader<'_>) -> std::result::Result<Option<u64>, CodeError> {
    Ok(if reader.get_bool()? {
        Some(reader.get_varint()?)
    } else {
        None
    })
}

/// Refuse frames past this size rather than buffering without bound.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Incremental frame parser over the inbound chunk stream.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete message, or `None` until more bytes arrive.
    pub fn next_message<S: Schemes>(&mut self) -> Result<Option<Message<S>>> {
        // Parse the length prefix without consuming it; it may be split
        // across chunks.
        let mut reader = Reader::new(&self.buffer);
        let length = match reader.get_varint() {
            Ok(length) => length,
            Err(CodeError::UnexpectedEnd) => return Ok(None),
            Err(error) => return Err(SyncError::protocol(error.to_string())),
        };
        let length = usize::try_from(length)
            .map_err(|_| SyncError::protocol("frame length overflows usize"))?;
        if length > MAX_FRAME_LEN {
            return Err(SyncError::protocol(format!(
                "frame of {length} bytes exceeds the {MAX_FRAME_LEN} byte cap"
            )));
        }
        let prefix_len = self.buffer.len() - reader.remaining();
        if reader.remaining() < length {
            return Ok(None);
        }
        let _ = self.buffer.split_to(prefix_len);
        let frame = self.buffer.split_to(length);
        let mut reader = Reader::new(&frame);
        let message = Message::<S>::decode_body(&mut reader)
            .map_err(|error| SyncError::protocol(format!("bad frame: {error}")))?;
        if !reader.is_empty() {
            return Err(SyncError::protocol("trailing bytes in frame"));
        }
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{id8, TestSchemes};
    use osier_common::{Area, AreaSubspace, Path, Range};

    fn round_trip(message: Message<TestSchemes>) -> Message<TestSchemes> {
        let frame = message.to_frame();
        let mut decoder = FrameDecoder::new();
        decoder.push_chunk(&frame);
        let decoded = decoder.next_message::<TestSchemes>().unwrap().unwrap();
        assert!(decoder.next_message::<TestSchemes>().unwrap().is_none());
        decoded
    }

    #[test]
    fn control_messages_round_trip() {
        let decoded = round_trip(Message::ControlIssueGuarantee {
            channel: Channel::StaticToken,
            amount: u64::MAX,
        });
        let Message::ControlIssueGuarantee { channel, amount } = decoded else {
            panic!("wrong kind");
        };
        assert_eq!(channel, Channel::StaticToken);
        assert_eq!(amount, u64::MAX);

        let decoded = round_trip(Message::ControlFree {
            handle: 9,
            handle_type: HandleType::AreaOfInterest,
            mine: true,
        });
        assert!(matches!(
            decoded,
            Message::ControlFree {
                handle: 9,
                handle_type: HandleType::AreaOfInterest,
                mine: true,
            }
        ));
    }

    #[test]
    fn fingerprint_message_round_trips() {
        let range = Range3d {
            subspaces: Range::new(id8("a"), osier_common::End::Closed(id8("b"))),
            paths: Range::open(Path::new([b"x".to_vec()])),
            times: Range::new(5, osier_common::End::Open),
        };
        let decoded = round_trip(Message::ReconciliationSendFingerprint {
            range: range.clone(),
            fingerprint: [7u8; 32],
            sender_handle: 3,
            receiver_handle: 4,
            covers: Some(11),
        });
        let Message::ReconciliationSendFingerprint {
            range: got_range,
            fingerprint,
            sender_handle,
            receiver_handle,
            covers,
        } = decoded
        else {
            panic!("wrong kind");
        };
        assert_eq!(got_range, range);
        assert_eq!(fingerprint, [7u8; 32]);
        assert_eq!((sender_handle, receiver_handle, covers), (3, 4, Some(11)));
    }

    #[test]
    fn aoi_message_round_trips() {
        let aoi = AreaOfInterest {
            area: Area {
                subspace: AreaSubspace::Id(id8("gemma")),
                path_prefix: Path::new([b"blog".to_vec()]),
                times: Range::full_time(),
            },
            max_count: 10,
            max_size: 0,
        };
        let decoded = round_trip(Message::SetupBindAreaOfInterest {
            area_of_interest: aoi.clone(),
            authorisation: 2,
        });
        let Message::SetupBindAreaOfInterest {
            area_of_interest,
            authorisation,
        } = decoded
        else {
            panic!("wrong kind");
        };
        assert_eq!(area_of_interest, aoi);
        assert_eq!(authorisation, 2);
    }

    #[test]
    fn frames_reassemble_across_chunk_boundaries() {
        let message = Message::<TestSchemes>::DataSendPayload {
            amount: 5,
            bytes: Bytes::from_static(b"hello"),
        };
        let frame = message.to_frame();
        let mut decoder = FrameDecoder::new();
        decoder.push_chunk(&frame[..3]);
        assert!(decoder.next_message::<TestSchemes>().unwrap().is_none());
        decoder.push_chunk(&frame[3..]);
        let decoded = decoder.next_message::<TestSchemes>().unwrap().unwrap();
        assert!(matches!(decoded, Message::DataSendPayload { amount: 5, .. }));
    }

    #[test]
    fn trailing_bytes_are_a_protocol_error() {
        let message = Message::<TestSchemes>::DataReplyPayload { handle: 1 };
        let mut frame = message.to_frame().to_vec();
        // Lengthen the frame so the body carries junk.
        frame[0] += 1;
        frame.push(0xee);
        let mut decoder = FrameDecoder::new();
        decoder.push_chunk(&frame);
        assert!(decoder.next_message::<TestSchemes>().is_err());
    }
}
