use crate::record::{Member, MemberProfile, NodeAddr, NodeState, Sid};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

/// One cluster member as the application configures it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HaMemberInfo {
    pub sid: i32,
    pub ip_addr: Ipv4Addr,
    /// Port of the peer-to-peer HA channel.
    pub ha_port: u16,
    /// Port the member serves application traffic on. Carried through gossip
    /// for routing; this library never binds it.
    pub listen_port: u16,
    pub weight: u32,
}

impl From<HaMemberInfo> for MemberProfile {
    fn from(info: HaMemberInfo) -> Self {
        MemberProfile {
            member: Member {
                sid: Sid::new(info.sid),
                ip: info.ip_addr,
                ha_port: info.ha_port,
                listen_port: info.listen_port,
            },
            weight: info.weight,
        }
    }
}

impl From<MemberProfile> for HaMemberInfo {
    fn from(profile: MemberProfile) -> Self {
        HaMemberInfo {
            sid: profile.member.sid.into_inner(),
            ip_addr: profile.member.ip,
            ha_port: profile.member.ha_port,
            listen_port: profile.member.listen_port,
            weight: profile.weight,
        }
    }
}

/// Where to send writes when this node is not the leader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HaLeaderInfo {
    pub sid: i32,
    pub ip: Ipv4Addr,
    pub listen_port: u16,
}

impl From<&Member> for HaLeaderInfo {
    fn from(member: &Member) -> Self {
        HaLeaderInfo {
            sid: member.sid.into_inner(),
            ip: member.ip,
            listen_port: member.listen_port,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaNodeHealth {
    Normal,
    Lost,
    KickedOut,
}

impl From<NodeState> for HaNodeHealth {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Normal => HaNodeHealth::Normal,
            NodeState::Lost => HaNodeHealth::Lost,
            NodeState::KickedOut => HaNodeHealth::KickedOut,
        }
    }
}

/// One routing entry from the gossip tables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HaNodeInfo {
    pub sid: i32,
    pub ip: Ipv4Addr,
    pub ha_port: u16,
    pub listen_port: u16,
    pub weight: u32,
    pub health: HaNodeHealth,
    pub last_update: DateTime<Utc>,
}

impl From<NodeAddr> for HaNodeInfo {
    fn from(addr: NodeAddr) -> Self {
        HaNodeInfo {
            sid: addr.member.sid.into_inner(),
            ip: addr.member.ip,
            ha_port: addr.member.ha_port,
            listen_port: addr.member.listen_port,
            weight: addr.weight,
            health: HaNodeHealth::from(addr.state),
            last_update: addr.last_update,
        }
    }
}

/// Snapshot of the cluster as gossip sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HaClusterView {
    pub leader_sid: Option<i32>,
    pub nodes: Vec<HaNodeInfo>,
}
