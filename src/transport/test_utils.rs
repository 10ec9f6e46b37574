use crate::record::{Collect, Database, Member, Sid, Vote};
use crate::transport::api::{InboundVote, OutboundMessage, PeerTransport};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// In-memory stand-in for the connection manager. Records every send so a
/// test can assert on outbound traffic, and optionally routes self-sent votes
/// back like the real loopback path.
pub(crate) struct RecordingTransport {
    my_sid: Sid,
    members: Mutex<Vec<Sid>>,
    sent: Mutex<Vec<(Sid, OutboundMessage)>>,
    vote_loopback: Mutex<Option<mpsc::UnboundedSender<InboundVote>>>,
    linked: Mutex<HashSet<Sid>>,
    nudged: Mutex<Vec<Sid>>,
    all_idle: Mutex<bool>,
    swapped_members: Mutex<Option<Vec<Member>>>,
}

impl RecordingTransport {
    pub(crate) fn new(my_sid: Sid, members: Vec<Sid>) -> Self {
        RecordingTransport {
            my_sid,
            members: Mutex::new(members),
            sent: Mutex::new(Vec::new()),
            vote_loopback: Mutex::new(None),
            linked: Mutex::new(HashSet::new()),
            nudged: Mutex::new(Vec::new()),
            all_idle: Mutex::new(true),
            swapped_members: Mutex::new(None),
        }
    }

    pub(crate) fn attach_vote_loopback(&self, tx: mpsc::UnboundedSender<InboundVote>) {
        *self.vote_loopback.lock().unwrap() = Some(tx);
    }

    pub(crate) fn mark_linked(&self, sid: Sid) {
        self.linked.lock().unwrap().insert(sid);
    }

    pub(crate) fn set_all_idle(&self, idle: bool) {
        *self.all_idle.lock().unwrap() = idle;
    }

    pub(crate) fn take_sent(&self) -> Vec<(Sid, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn nudged(&self) -> Vec<Sid> {
        self.nudged.lock().unwrap().clone()
    }

    pub(crate) fn swapped_members(&self) -> Option<Vec<Member>> {
        self.swapped_members.lock().unwrap().clone()
    }

    /// Votes sent to the given peer, in send order.
    pub(crate) fn votes_sent_to(&self, sid: Sid) -> Vec<Vote> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == sid)
            .filter_map(|(_, msg)| match msg {
                OutboundMessage::Vote(vote) => Some(vote.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn databases_sent_to(&self, sid: Sid) -> Vec<(Database, Bytes)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == sid)
            .filter_map(|(_, msg)| match msg {
                OutboundMessage::Database(database, raw) => Some((database.clone(), raw.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn collects_sent_to(&self, sid: Sid) -> Vec<Collect> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == sid)
            .filter_map(|(_, msg)| match msg {
                OutboundMessage::Collect(collect) => Some(collect.clone()),
                _ => None,
            })
            .collect()
    }
}

impl PeerTransport for RecordingTransport {
    fn my_sid(&self) -> Sid {
        self.my_sid
    }

    fn member_sids(&self) -> Vec<Sid> {
        self.members.lock().unwrap().clone()
    }

    fn send_to(&self, to: Sid, msg: OutboundMessage) {
        if to == self.my_sid {
            if let OutboundMessage::Vote(vote) = &msg {
                if let Some(tx) = self.vote_loopback.lock().unwrap().as_ref() {
                    let _ = tx.send(InboundVote {
                        from: self.my_sid,
                        vote: vote.clone(),
                    });
                }
            }
        }
        self.sent.lock().unwrap().push((to, msg));
    }

    fn delivery_idle(&self, sid: Sid) -> bool {
        sid == self.my_sid || *self.all_idle.lock().unwrap()
    }

    fn has_live_connection(&self, sid: Sid) -> bool {
        sid == self.my_sid || self.linked.lock().unwrap().contains(&sid)
    }

    fn nudge_dialer(&self, sid: Sid) {
        self.nudged.lock().unwrap().push(sid);
    }

    fn update_members(&self, members: Vec<Member>) {
        *self.members.lock().unwrap() = members.iter().map(|m| m.sid).collect();
        *self.swapped_members.lock().unwrap() = Some(members);
    }
}
