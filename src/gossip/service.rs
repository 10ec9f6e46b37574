use crate::record::{BlockHeader, Collect, CollectKind, MemberProfile, NodeAddr, NodeBlock, NodeState, Sid};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

const TABLES_POISON: &str = "CollectService.tables lock poison";

#[derive(Default)]
struct Tables {
    /// Leader of the regime these tables describe. Tables from an older
    /// regime are cleared the moment a newer leader is adopted.
    leader: Option<Sid>,
    /// sid -> routing entry, every node we know of.
    nodes: HashMap<Sid, NodeAddr>,
    /// sid -> profile, live learners only. This is the load-balancing set.
    learners: HashMap<Sid, MemberProfile>,
    /// sid -> last reported block snapshot.
    blocks: HashMap<Sid, NodeBlock>,
}

/// The authoritative membership/routing state, shared by the collect tasks
/// and the client surface. All mutation happens under the write lock; reads
/// hand out clones.
pub(crate) struct CollectService {
    logger: slog::Logger,
    tables: RwLock<Tables>,
}

impl CollectService {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        CollectService {
            logger,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Records a leadership claim. A claim that differs from the recorded
    /// leader demotes the old leader's entry to Lost and clears the learner
    /// and block tables, since everything in them described the old regime.
    fn note_leadership(&self, tables: &mut Tables, claimed: Sid) {
        if tables.leader == Some(claimed) {
            return;
        }
        if let Some(old) = tables.leader {
            if let Some(entry) = tables.nodes.get_mut(&old) {
                entry.state = NodeState::Lost;
            }
            slog::info!(
                self.logger,
                "Leadership moved, dropping the old regime's tables";
                "old_leader" => old.into_inner(),
                "new_leader" => claimed.into_inner(),
            );
        }
        tables.learners.clear();
        tables.blocks.clear();
        tables.leader = Some(claimed);
    }

    /// Called when this node starts leading: adopts itself as leader and
    /// seeds the tables with its own entry.
    pub(crate) fn begin_leading(&self, me: &MemberProfile, headers: Vec<BlockHeader>, now: DateTime<Utc>) {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        let my_sid = me.member.sid;
        self.note_leadership(&mut tables, my_sid);
        tables.nodes.insert(
            my_sid,
            NodeAddr {
                member: me.member.clone(),
                weight: me.weight,
                state: NodeState::Normal,
                last_update: now,
            },
        );
        tables.blocks.insert(my_sid, NodeBlock { sid: my_sid, headers });
    }

    /// Called when this node starts learning under the given leader.
    pub(crate) fn begin_learning(&self, leader: Sid) {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        self.note_leadership(&mut tables, leader);
    }

    /// Leader side: folds one learner's collect request into the tables.
    pub(crate) fn record_request(&self, request: &Collect, now: DateTime<Utc>) {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        self.note_leadership(&mut tables, request.leader);
        for addr in &request.addrs {
            let sid = addr.member.sid;
            tables.nodes.insert(
                sid,
                NodeAddr {
                    member: addr.member.clone(),
                    weight: addr.weight,
                    state: NodeState::Normal,
                    last_update: now,
                },
            );
            if Some(sid) != tables.leader {
                tables.learners.insert(
                    sid,
                    MemberProfile {
                        member: addr.member.clone(),
                        weight: addr.weight,
                    },
                );
            }
        }
        for block in &request.blocks {
            tables.blocks.insert(block.sid, block.clone());
        }
    }

    /// Replaces the recorded block snapshot for one node.
    pub(crate) fn refresh_blocks(&self, sid: Sid, headers: Vec<BlockHeader>) {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        tables.blocks.insert(sid, NodeBlock { sid, headers });
    }

    /// Marks learners silent past the threshold as Lost and drops them from
    /// the load-balancing set. Returns the sids that were expired.
    pub(crate) fn expire_silent(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Sid> {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        let mut expired = Vec::new();
        for sid in tables.learners.keys() {
            let silent_ms = match tables.nodes.get(sid) {
                Some(entry) => (now - entry.last_update).num_milliseconds(),
                None => i64::MAX,
            };
            if silent_ms >= threshold.as_millis() as i64 {
                expired.push(*sid);
            }
        }
        for sid in &expired {
            if let Some(entry) = tables.nodes.get_mut(sid) {
                entry.state = NodeState::Lost;
            }
            tables.learners.remove(sid);
        }
        expired
    }

    /// Admin removal. The entry is kept as KickedOut for the grace period so
    /// the view keeps telling peers about the removal, then purged.
    pub(crate) fn kick_out(&self, sid: Sid, now: DateTime<Utc>) -> bool {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        let entry = match tables.nodes.get_mut(&sid) {
            Some(entry) => entry,
            None => return false,
        };
        entry.state = NodeState::KickedOut;
        entry.last_update = now;
        tables.learners.remove(&sid);
        true
    }

    /// Drops KickedOut entries older than the grace period. Returns the sids
    /// that were purged.
    pub(crate) fn purge_kicked_out(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Sid> {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        let purged: Vec<Sid> = tables
            .nodes
            .iter()
            .filter(|(_, entry)| {
                entry.state == NodeState::KickedOut
                    && (now - entry.last_update).num_milliseconds() >= grace.as_millis() as i64
            })
            .map(|(sid, _)| *sid)
            .collect();
        for sid in &purged {
            tables.nodes.remove(sid);
            tables.blocks.remove(sid);
        }
        purged
    }

    /// The full current view, for answering collect requests. None until a
    /// leader has been recorded.
    pub(crate) fn full_view(&self) -> Option<Collect> {
        let tables = self.tables.read().expect(TABLES_POISON);
        let leader = tables.leader?;
        let mut addrs: Vec<NodeAddr> = tables.nodes.values().cloned().collect();
        addrs.sort_by_key(|a| a.member.sid);
        let mut blocks: Vec<NodeBlock> = tables.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.sid);
        Some(Collect {
            kind: CollectKind::Response,
            leader,
            addrs,
            blocks,
        })
    }

    /// Learner side: replaces the tables wholesale with the leader's view.
    pub(crate) fn adopt_view(&self, view: &Collect) {
        let mut tables = self.tables.write().expect(TABLES_POISON);
        self.note_leadership(&mut tables, view.leader);
        tables.nodes = view.addrs.iter().map(|a| (a.member.sid, a.clone())).collect();
        tables.learners = view
            .addrs
            .iter()
            .filter(|a| a.state == NodeState::Normal && a.member.sid != view.leader)
            .map(|a| {
                (
                    a.member.sid,
                    MemberProfile {
                        member: a.member.clone(),
                        weight: a.weight,
                    },
                )
            })
            .collect();
        tables.blocks = view.blocks.iter().map(|b| (b.sid, b.clone())).collect();
    }

    /// Compares the adopted view against the locally configured member list.
    /// A difference means the config is stale; the returned list is what the
    /// config should become. KickedOut nodes are no longer members.
    pub(crate) fn config_drift(&self, configured: &[MemberProfile]) -> Option<Vec<MemberProfile>> {
        let tables = self.tables.read().expect(TABLES_POISON);
        if tables.leader.is_none() {
            return None;
        }
        let mut corrected: Vec<MemberProfile> = tables
            .nodes
            .values()
            .filter(|entry| entry.state != NodeState::KickedOut)
            .map(|entry| MemberProfile {
                member: entry.member.clone(),
                weight: entry.weight,
            })
            .collect();
        corrected.sort_by_key(|p| p.member.sid);
        let mut local: Vec<MemberProfile> = configured.to_vec();
        local.sort_by_key(|p| p.member.sid);
        if corrected == local {
            None
        } else {
            Some(corrected)
        }
    }

    /// Snapshot for the client surface: recorded leader plus every routing
    /// entry, sorted by sid.
    pub(crate) fn snapshot(&self) -> (Option<Sid>, Vec<NodeAddr>) {
        let tables = self.tables.read().expect(TABLES_POISON);
        let mut addrs: Vec<NodeAddr> = tables.nodes.values().cloned().collect();
        addrs.sort_by_key(|a| a.member.sid);
        (tables.leader, addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Member;
    use std::net::Ipv4Addr;

    fn profile(sid: i32, weight: u32) -> MemberProfile {
        MemberProfile {
            member: Member {
                sid: Sid::new(sid),
                ip: Ipv4Addr::LOCALHOST,
                ha_port: 7000 + sid as u16,
                listen_port: 8000 + sid as u16,
            },
            weight,
        }
    }

    fn request_from(profile: &MemberProfile, leader: Sid, now: DateTime<Utc>) -> Collect {
        Collect {
            kind: CollectKind::Request,
            leader,
            addrs: vec![NodeAddr {
                member: profile.member.clone(),
                weight: profile.weight,
                state: NodeState::Normal,
                last_update: now,
            }],
            blocks: vec![NodeBlock {
                sid: profile.member.sid,
                headers: Vec::new(),
            }],
        }
    }

    fn service() -> CollectService {
        CollectService::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn request_upserts_sender_into_the_view() {
        let service = service();
        let now = Utc::now();
        service.begin_leading(&profile(1, 1), Vec::new(), now);
        service.record_request(&request_from(&profile(2, 3), Sid::new(1), now), now);

        let view = service.full_view().unwrap();
        assert_eq!(view.leader, Sid::new(1));
        assert_eq!(view.addrs.len(), 2);
        assert_eq!(view.addrs[1].member.sid, Sid::new(2));
        assert_eq!(view.addrs[1].weight, 3);
        assert_eq!(view.addrs[1].state, NodeState::Normal);
        assert_eq!(view.blocks.len(), 2);
    }

    #[test]
    fn new_leadership_demotes_the_old_leader_and_clears_tables() {
        let service = service();
        let now = Utc::now();
        service.begin_leading(&profile(1, 1), Vec::new(), now);
        service.record_request(&request_from(&profile(2, 1), Sid::new(1), now), now);

        service.begin_learning(Sid::new(3));

        let (leader, addrs) = service.snapshot();
        assert_eq!(leader, Some(Sid::new(3)));
        let old = addrs.iter().find(|a| a.member.sid == Sid::new(1)).unwrap();
        assert_eq!(old.state, NodeState::Lost);
        // The regime-scoped tables started over.
        let view = service.full_view().unwrap();
        assert!(view.blocks.is_empty());
        let later = now + chrono::Duration::seconds(600);
        assert!(service.expire_silent(later, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn silent_learner_is_expired_and_stops_load_balancing() {
        let service = service();
        let t0 = Utc::now();
        service.begin_leading(&profile(1, 1), Vec::new(), t0);
        service.record_request(&request_from(&profile(2, 1), Sid::new(1), t0), t0);

        let just_before = t0 + chrono::Duration::seconds(119);
        assert!(service.expire_silent(just_before, Duration::from_secs(120)).is_empty());

        let past = t0 + chrono::Duration::seconds(121);
        let expired = service.expire_silent(past, Duration::from_secs(120));
        assert_eq!(expired, vec![Sid::new(2)]);

        let (_, addrs) = service.snapshot();
        let lost = addrs.iter().find(|a| a.member.sid == Sid::new(2)).unwrap();
        assert_eq!(lost.state, NodeState::Lost);
        // Expiring again is a no-op.
        assert!(service.expire_silent(past, Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn kicked_out_node_is_purged_after_the_grace_period() {
        let service = service();
        let t0 = Utc::now();
        service.begin_leading(&profile(1, 1), Vec::new(), t0);
        service.record_request(&request_from(&profile(2, 1), Sid::new(1), t0), t0);

        assert!(service.kick_out(Sid::new(2), t0));
        assert!(!service.kick_out(Sid::new(9), t0));

        let within_grace = t0 + chrono::Duration::seconds(200);
        assert!(service.purge_kicked_out(within_grace, Duration::from_secs(300)).is_empty());
        let (_, addrs) = service.snapshot();
        assert_eq!(addrs.iter().find(|a| a.member.sid == Sid::new(2)).unwrap().state, NodeState::KickedOut);

        let past_grace = t0 + chrono::Duration::seconds(301);
        assert_eq!(service.purge_kicked_out(past_grace, Duration::from_secs(300)), vec![Sid::new(2)]);
        let (_, addrs) = service.snapshot();
        assert!(addrs.iter().all(|a| a.member.sid != Sid::new(2)));
    }

    #[test]
    fn adopted_view_replaces_the_tables_wholesale() {
        let service = service();
        let now = Utc::now();
        service.begin_learning(Sid::new(1));

        let view = Collect {
            kind: CollectKind::Response,
            leader: Sid::new(1),
            addrs: vec![
                NodeAddr {
                    member: profile(1, 1).member,
                    weight: 1,
                    state: NodeState::Normal,
                    last_update: now,
                },
                NodeAddr {
                    member: profile(2, 4).member,
                    weight: 4,
                    state: NodeState::Normal,
                    last_update: now,
                },
                NodeAddr {
                    member: profile(3, 1).member,
                    weight: 1,
                    state: NodeState::Lost,
                    last_update: now,
                },
            ],
            blocks: vec![NodeBlock {
                sid: Sid::new(1),
                headers: Vec::new(),
            }],
        };
        service.adopt_view(&view);

        let (leader, addrs) = service.snapshot();
        assert_eq!(leader, Some(Sid::new(1)));
        assert_eq!(addrs.len(), 3);
        let rebuilt = service.full_view().unwrap();
        assert_eq!(rebuilt.addrs, view.addrs);
        assert_eq!(rebuilt.blocks, view.blocks);
    }

    #[test]
    fn drift_reports_the_corrected_member_list() {
        let service = service();
        let now = Utc::now();
        service.begin_leading(&profile(1, 1), Vec::new(), now);
        service.record_request(&request_from(&profile(2, 5), Sid::new(1), now), now);

        // Config agrees: no drift.
        assert_eq!(service.config_drift(&[profile(1, 1), profile(2, 5)]), None);

        // Config carries a stale weight: corrected list comes back.
        let corrected = service.config_drift(&[profile(1, 1), profile(2, 1)]).unwrap();
        assert_eq!(corrected, vec![profile(1, 1), profile(2, 5)]);

        // A kicked out node is no longer part of the corrected list.
        service.kick_out(Sid::new(2), now);
        let corrected = service.config_drift(&[profile(1, 1), profile(2, 5)]).unwrap();
        assert_eq!(corrected, vec![profile(1, 1)]);
    }
}
