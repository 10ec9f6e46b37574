//! Binary encoding of the typed records that cross the peer channel.
//!
//! All multi-byte integers are big-endian. Top-level records are
//! `tag(u8) + body`. Allocation components additionally carry a body length
//! after the tag so a concatenated stream of them is self-delimiting:
//!
//! ```text
//! |tag(1)|body_len(4)|key_len(2)|key(n)|upto(8)|ts_ms(8)|
//! ```

use crate::record::types::{
    Allocation, BlockHeader, Checkpoint, Collect, CollectKind, Database, DatabaseKind, HaState, Member, NodeAddr,
    NodeBlock, NodeState, Precondition, Sid, Vote,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::TimeZone;

const TAG_VOTE: u8 = 1;
const TAG_DATABASE: u8 = 2;
const TAG_COLLECT: u8 = 3;
const TAG_ALLOCATION: u8 = 16;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("ran out of bytes while decoding {0}")]
    UnexpectedEnd(&'static str),
    #[error("unknown {context} value {value}")]
    BadDiscriminant { context: &'static str, value: u8 },
    #[error("found record tag {actual}, expected {expected}")]
    WrongTag { expected: u8, actual: u8 },
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("raw range does not end on a component boundary")]
    TruncatedComponent,
    #[error("allocation key is not valid utf-8")]
    BadKey,
    #[error("allocation key of {0} bytes exceeds the encodable maximum")]
    KeyTooLong(usize),
    #[error("timestamp {0}ms is unrepresentable")]
    BadTimestamp(i64),
}

fn need(buf: &impl Buf, n: usize, context: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::UnexpectedEnd(context));
    }
    Ok(())
}

fn expect_tag(buf: &mut Bytes, expected: u8) -> Result<(), CodecError> {
    need(buf, 1, "record tag")?;
    let actual = buf.get_u8();
    if actual != expected {
        return Err(CodecError::WrongTag { expected, actual });
    }
    Ok(())
}

fn expect_empty(buf: &Bytes) -> Result<(), CodecError> {
    if buf.remaining() > 0 {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}

// ------- Nested field helpers -------

fn put_member(buf: &mut BytesMut, member: &Member) {
    buf.put_i32(member.sid.into_inner());
    buf.put_slice(&member.ip.octets());
    buf.put_u16(member.ha_port);
    buf.put_u16(member.listen_port);
}

fn get_member(buf: &mut Bytes) -> Result<Member, CodecError> {
    need(buf, 12, "member")?;
    let sid = Sid::new(buf.get_i32());
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ok(Member {
        sid,
        ip: octets.into(),
        ha_port: buf.get_u16(),
        listen_port: buf.get_u16(),
    })
}

fn put_node_addr(buf: &mut BytesMut, addr: &NodeAddr) {
    put_member(buf, &addr.member);
    buf.put_u32(addr.weight);
    buf.put_u8(addr.state.as_u8());
    buf.put_i64(addr.last_update.timestamp_millis());
}

fn get_node_addr(buf: &mut Bytes) -> Result<NodeAddr, CodecError> {
    let member = get_member(buf)?;
    need(buf, 13, "node addr")?;
    let weight = buf.get_u32();
    let state_raw = buf.get_u8();
    let state = NodeState::from_u8(state_raw).ok_or(CodecError::BadDiscriminant {
        context: "node state",
        value: state_raw,
    })?;
    let ts_ms = buf.get_i64();
    let last_update = chrono::Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(CodecError::BadTimestamp(ts_ms))?;
    Ok(NodeAddr {
        member,
        weight,
        state,
        last_update,
    })
}

fn put_block_header(buf: &mut BytesMut, header: &BlockHeader) {
    buf.put_u32(header.block_index);
    buf.put_u32(header.component_count);
    buf.put_u32(header.begin_offset);
    buf.put_u32(header.end_offset);
    buf.put_i64(header.begin_ts_ms);
    buf.put_i64(header.end_ts_ms);
}

fn get_block_header(buf: &mut Bytes) -> Result<BlockHeader, CodecError> {
    need(buf, 32, "block header")?;
    Ok(BlockHeader {
        block_index: buf.get_u32(),
        component_count: buf.get_u32(),
        begin_offset: buf.get_u32(),
        end_offset: buf.get_u32(),
        begin_ts_ms: buf.get_i64(),
        end_ts_ms: buf.get_i64(),
    })
}

fn put_node_block(buf: &mut BytesMut, block: &NodeBlock) {
    buf.put_i32(block.sid.into_inner());
    buf.put_u16(block.headers.len() as u16);
    for header in &block.headers {
        put_block_header(buf, header);
    }
}

fn get_node_block(buf: &mut Bytes) -> Result<NodeBlock, CodecError> {
    need(buf, 6, "node block")?;
    let sid = Sid::new(buf.get_i32());
    let count = buf.get_u16() as usize;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(get_block_header(buf)?);
    }
    Ok(NodeBlock { sid, headers })
}

// ------- Top-level records -------

impl Vote {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + 12 * self.precondition.members.len());
        buf.put_u8(TAG_VOTE);
        buf.put_i32(self.leader.into_inner());
        buf.put_i64(self.offset);
        buf.put_i64(self.peer_epoch);
        buf.put_i64(self.elect_epoch);
        buf.put_u8(self.ha_state.as_u8());
        buf.put_i32(self.sid.into_inner());
        buf.put_u16(self.precondition.members.len() as u16);
        for member in &self.precondition.members {
            put_member(&mut buf, member);
        }
        buf.put_u32(self.precondition.block_file_size);
        buf.put_u32(self.precondition.max_sync_payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Vote, CodecError> {
        expect_tag(&mut buf, TAG_VOTE)?;
        need(&mut buf, 35, "vote")?;
        let leader = Sid::new(buf.get_i32());
        let offset = buf.get_i64();
        let peer_epoch = buf.get_i64();
        let elect_epoch = buf.get_i64();
        let state_raw = buf.get_u8();
        let ha_state = HaState::from_u8(state_raw).ok_or(CodecError::BadDiscriminant {
            context: "ha state",
            value: state_raw,
        })?;
        let sid = Sid::new(buf.get_i32());
        let member_count = buf.get_u16() as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            members.push(get_member(&mut buf)?);
        }
        need(&mut buf, 8, "precondition")?;
        let precondition = Precondition {
            members,
            block_file_size: buf.get_u32(),
            max_sync_payload: buf.get_u32(),
        };
        expect_empty(&buf)?;
        Ok(Vote {
            leader,
            offset,
            peer_epoch,
            elect_epoch,
            ha_state,
            sid,
            precondition,
        })
    }
}

impl Collect {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + 25 * self.addrs.len() + 40 * self.blocks.len());
        buf.put_u8(TAG_COLLECT);
        buf.put_u8(match self.kind {
            CollectKind::Request => 0,
            CollectKind::Response => 1,
        });
        buf.put_i32(self.leader.into_inner());
        buf.put_u16(self.addrs.len() as u16);
        for addr in &self.addrs {
            put_node_addr(&mut buf, addr);
        }
        buf.put_u16(self.blocks.len() as u16);
        for block in &self.blocks {
            put_node_block(&mut buf, block);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Collect, CodecError> {
        expect_tag(&mut buf, TAG_COLLECT)?;
        need(&mut buf, 7, "collect")?;
        let kind_raw = buf.get_u8();
        let kind = match kind_raw {
            0 => CollectKind::Request,
            1 => CollectKind::Response,
            other => {
                return Err(CodecError::BadDiscriminant {
                    context: "collect kind",
                    value: other,
                })
            }
        };
        let leader = Sid::new(buf.get_i32());
        let addr_count = buf.get_u16() as usize;
        let mut addrs = Vec::with_capacity(addr_count);
        for _ in 0..addr_count {
            addrs.push(get_node_addr(&mut buf)?);
        }
        need(&mut buf, 2, "collect blocks")?;
        let block_count = buf.get_u16() as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks.push(get_node_block(&mut buf)?);
        }
        expect_empty(&buf)?;
        Ok(Collect {
            kind,
            leader,
            addrs,
            blocks,
        })
    }
}

impl Database {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + 32 * self.headers.len());
        buf.put_u8(TAG_DATABASE);
        buf.put_u8(match self.kind {
            DatabaseKind::Checksum => 0,
            DatabaseKind::Append => 1,
        });
        buf.put_u32(self.checkpoint.block_index);
        buf.put_u32(self.checkpoint.end_offset);
        buf.put_u16(self.headers.len() as u16);
        for header in &self.headers {
            put_block_header(&mut buf, header);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Database, CodecError> {
        expect_tag(&mut buf, TAG_DATABASE)?;
        need(&mut buf, 11, "database")?;
        let kind_raw = buf.get_u8();
        let kind = match kind_raw {
            0 => DatabaseKind::Checksum,
            1 => DatabaseKind::Append,
            other => {
                return Err(CodecError::BadDiscriminant {
                    context: "database kind",
                    value: other,
                })
            }
        };
        let checkpoint = Checkpoint {
            block_index: buf.get_u32(),
            end_offset: buf.get_u32(),
        };
        let header_count = buf.get_u16() as usize;
        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            headers.push(get_block_header(&mut buf)?);
        }
        expect_empty(&buf)?;
        Ok(Database {
            kind,
            checkpoint,
            headers,
        })
    }
}

impl Allocation {
    /// Size of the encoded component, tag and length prefix included.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + 2 + self.key.len() + 8 + 8
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.key.len() > u16::MAX as usize {
            return Err(CodecError::KeyTooLong(self.key.len()));
        }
        let body_len = (2 + self.key.len() + 8 + 8) as u32;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(TAG_ALLOCATION);
        buf.put_u32(body_len);
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(self.key.as_bytes());
        buf.put_i64(self.upto);
        buf.put_i64(self.ts_ms);
        Ok(buf.freeze())
    }

    fn decode_from(buf: &mut Bytes) -> Result<Allocation, CodecError> {
        need(buf, 5, "allocation prefix")?;
        let tag = buf.get_u8();
        if tag != TAG_ALLOCATION {
            return Err(CodecError::WrongTag {
                expected: TAG_ALLOCATION,
                actual: tag,
            });
        }
        let body_len = buf.get_u32() as usize;
        if buf.remaining() < body_len || body_len < 18 {
            return Err(CodecError::TruncatedComponent);
        }
        let key_len = buf.get_u16() as usize;
        if body_len != 2 + key_len + 16 {
            return Err(CodecError::TruncatedComponent);
        }
        let key_bytes = buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| CodecError::BadKey)?;
        Ok(Allocation {
            key,
            upto: buf.get_i64(),
            ts_ms: buf.get_i64(),
        })
    }
}

/// Parses a replicated raw range into its component records. The range must end
/// exactly on a component boundary.
pub fn decode_allocation_stream(mut buf: Bytes) -> Result<Vec<Allocation>, CodecError> {
    let mut components = Vec::new();
    while buf.remaining() > 0 {
        components.push(Allocation::decode_from(&mut buf)?);
    }
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn member(sid: i32) -> Member {
        Member {
            sid: Sid::new(sid),
            ip: Ipv4Addr::new(10, 0, 0, sid as u8),
            ha_port: 7000 + sid as u16,
            listen_port: 8000 + sid as u16,
        }
    }

    fn precondition() -> Precondition {
        Precondition {
            members: vec![member(1), member(2), member(3)],
            block_file_size: 4 * 1024 * 1024,
            max_sync_payload: 64 * 1024,
        }
    }

    fn header(block_index: u32) -> BlockHeader {
        BlockHeader {
            block_index,
            component_count: 7 + block_index,
            begin_offset: 16,
            end_offset: 400 + block_index,
            begin_ts_ms: 1_650_000_000_000,
            end_ts_ms: 1_650_000_456_789,
        }
    }

    #[test]
    fn vote_round_trip() {
        let vote = Vote {
            leader: Sid::new(3),
            offset: 987_654_321,
            peer_epoch: 12,
            elect_epoch: 34,
            ha_state: HaState::Looking,
            sid: Sid::new(1),
            precondition: precondition(),
        };

        let decoded = Vote::decode(vote.encode()).unwrap();

        assert_eq!(decoded, vote);
    }

    #[test]
    fn collect_round_trip() {
        let now = Utc.timestamp_millis_opt(1_650_000_111_222).single().unwrap();
        let collect = Collect {
            kind: CollectKind::Response,
            leader: Sid::new(2),
            addrs: vec![
                NodeAddr {
                    member: member(1),
                    weight: 10,
                    state: NodeState::Normal,
                    last_update: now,
                },
                NodeAddr {
                    member: member(2),
                    weight: 0,
                    state: NodeState::Lost,
                    last_update: now,
                },
            ],
            blocks: vec![
                NodeBlock {
                    sid: Sid::new(1),
                    headers: vec![header(0), header(1)],
                },
                NodeBlock {
                    sid: Sid::new(2),
                    headers: vec![],
                },
            ],
        };

        let decoded = Collect::decode(collect.encode()).unwrap();

        assert_eq!(decoded, collect);
    }

    #[test]
    fn database_round_trip() {
        let database = Database {
            kind: DatabaseKind::Checksum,
            checkpoint: Checkpoint {
                block_index: 5,
                end_offset: 1234,
            },
            headers: vec![header(0), header(1), header(2)],
        };

        let decoded = Database::decode(database.encode()).unwrap();

        assert_eq!(decoded, database);
    }

    #[test]
    fn vote_rejects_wrong_tag() {
        let database = Database {
            kind: DatabaseKind::Append,
            checkpoint: Checkpoint {
                block_index: 0,
                end_offset: 16,
            },
            headers: vec![],
        };

        let result = Vote::decode(database.encode());

        assert_eq!(
            result,
            Err(CodecError::WrongTag {
                expected: TAG_VOTE,
                actual: TAG_DATABASE
            })
        );
    }

    #[test]
    fn vote_rejects_trailing_bytes() {
        let vote = Vote {
            leader: Sid::new(1),
            offset: 0,
            peer_epoch: 0,
            elect_epoch: 1,
            ha_state: HaState::Looking,
            sid: Sid::new(1),
            precondition: precondition(),
        };
        let mut bytes = BytesMut::from(&vote.encode()[..]);
        bytes.put_u8(0xFF);

        let result = Vote::decode(bytes.freeze());

        assert_eq!(result, Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn vote_rejects_unknown_state() {
        let vote = Vote {
            leader: Sid::new(1),
            offset: 0,
            peer_epoch: 0,
            elect_epoch: 1,
            ha_state: HaState::Looking,
            sid: Sid::new(1),
            precondition: precondition(),
        };
        let mut bytes = BytesMut::from(&vote.encode()[..]);
        // ha_state byte sits after tag(1) + leader(4) + offset(8) + epochs(16).
        bytes[29] = 9;

        let result = Vote::decode(bytes.freeze());

        assert_eq!(
            result,
            Err(CodecError::BadDiscriminant {
                context: "ha state",
                value: 9
            })
        );
    }

    #[test]
    fn truncated_vote_fails() {
        let vote = Vote {
            leader: Sid::new(1),
            offset: 0,
            peer_epoch: 0,
            elect_epoch: 1,
            ha_state: HaState::Looking,
            sid: Sid::new(1),
            precondition: precondition(),
        };
        let encoded = vote.encode();

        for cut in 1..encoded.len() {
            let result = Vote::decode(encoded.slice(0..cut));
            assert!(result.is_err(), "prefix of {} bytes decoded successfully", cut);
        }
    }

    #[test]
    fn allocation_stream_round_trip() {
        let allocations = vec![
            Allocation {
                key: "orders".to_string(),
                upto: 50_000,
                ts_ms: 1_650_000_000_001,
            },
            Allocation {
                key: "invoices".to_string(),
                upto: 125,
                ts_ms: 1_650_000_000_002,
            },
            Allocation {
                key: "".to_string(),
                upto: -1,
                ts_ms: 0,
            },
        ];
        let mut stream = BytesMut::new();
        for allocation in &allocations {
            stream.put_slice(&allocation.encode().unwrap());
        }

        let decoded = decode_allocation_stream(stream.freeze()).unwrap();

        assert_eq!(decoded, allocations);
    }

    #[test]
    fn allocation_stream_rejects_partial_tail() {
        let allocation = Allocation {
            key: "orders".to_string(),
            upto: 1,
            ts_ms: 2,
        };
        let encoded = allocation.encode().unwrap();
        let mut stream = BytesMut::new();
        stream.put_slice(&encoded);
        stream.put_slice(&encoded[..encoded.len() - 3]);

        let result = decode_allocation_stream(stream.freeze());

        assert_eq!(result, Err(CodecError::TruncatedComponent));
    }

    #[test]
    fn allocation_rejects_oversized_key() {
        let allocation = Allocation {
            key: "k".repeat(u16::MAX as usize + 1),
            upto: 1,
            ts_ms: 2,
        };

        let result = allocation.encode();

        assert_eq!(result, Err(CodecError::KeyTooLong(u16::MAX as usize + 1)));
    }
}
