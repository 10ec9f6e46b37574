use crate::record::{HaState, Precondition, Sid, Vote};
use std::collections::HashMap;

/// The (peer_epoch, offset, leader) triple a vote argues for. Ranked by
/// regime recency first, then log length, then sid as the tie breaker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct VoteProposal {
    pub leader: Sid,
    pub offset: i64,
    pub peer_epoch: i64,
}

impl VoteProposal {
    pub(crate) fn of(vote: &Vote) -> VoteProposal {
        VoteProposal {
            leader: vote.leader,
            offset: vote.offset,
            peer_epoch: vote.peer_epoch,
        }
    }

    /// Strict total order over proposals. Distinct proposals never tie, so
    /// every election round has exactly one winner.
    pub(crate) fn outranks(&self, other: &VoteProposal) -> bool {
        (self.peer_epoch, self.offset, self.leader) > (other.peer_epoch, other.offset, other.leader)
    }
}

#[derive(Clone, Debug)]
struct RecordedVote {
    proposal: VoteProposal,
    ha_state: HaState,
    elect_epoch: i64,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum LookingAction {
    /// Vote from an older round. Dropped without affecting vote accounting.
    Stale,
    /// The vote changed our proposal (or bumped our round); rebroadcast.
    Adopted,
    /// Recorded, proposal unchanged.
    Recorded,
}

/// What a concluded election settled on. `elect_epoch` doubles as the new
/// regime's peer epoch: every node that took part concluded at the same
/// round, so it identifies the regime cluster-wide.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ElectionDecision {
    pub leader: Sid,
    pub ha_state: HaState,
    pub elect_epoch: i64,
    pub offset: i64,
}

/// Vote accounting for one node across election rounds.
///
/// The logical clock survives between rounds and only moves forward, so a
/// node that re-enters an election can never be confused by its own older
/// votes. All the message plumbing lives elsewhere; this type is pure state
/// transitions, which is what the tests drive.
pub(crate) struct ElectionState {
    my_sid: Sid,
    logical_clock: i64,
    /// Own candidacy at round start. Epoch bumps re-compare against this,
    /// never against a proposal adopted from a peer in the dead round.
    initial: VoteProposal,
    proposal: VoteProposal,
    /// Latest vote per looking sender, current round only.
    received: HashMap<Sid, RecordedVote>,
    /// Latest vote per established (leading/learning) sender, any round.
    out_of_election: HashMap<Sid, RecordedVote>,
}

impl ElectionState {
    pub(crate) fn new(my_sid: Sid) -> Self {
        let zero = VoteProposal {
            leader: my_sid,
            offset: 0,
            peer_epoch: 0,
        };
        ElectionState {
            my_sid,
            logical_clock: 0,
            initial: zero.clone(),
            proposal: zero,
            received: HashMap::new(),
            out_of_election: HashMap::new(),
        }
    }

    /// Opens a new round: bumps the logical clock, proposes self, forgets
    /// every vote of the previous round.
    pub(crate) fn begin_round(&mut self, offset: i64, peer_epoch: i64) {
        self.logical_clock += 1;
        self.initial = VoteProposal {
            leader: self.my_sid,
            offset,
            peer_epoch,
        };
        self.proposal = self.initial.clone();
        self.received.clear();
        self.out_of_election.clear();
    }

    pub(crate) fn elect_epoch(&self) -> i64 {
        self.logical_clock
    }

    #[cfg(test)]
    pub(crate) fn proposal(&self) -> &VoteProposal {
        &self.proposal
    }

    pub(crate) fn self_vote(&self, precondition: Precondition) -> Vote {
        Vote {
            leader: self.proposal.leader,
            offset: self.proposal.offset,
            peer_epoch: self.proposal.peer_epoch,
            elect_epoch: self.logical_clock,
            ha_state: HaState::Looking,
            sid: self.my_sid,
            precondition,
        }
    }

    pub(crate) fn handle_looking(&mut self, from: Sid, vote: &Vote) -> LookingAction {
        let candidate = VoteProposal::of(vote);
        if vote.elect_epoch > self.logical_clock {
            self.logical_clock = vote.elect_epoch;
            self.received.clear();
            self.proposal = if candidate.outranks(&self.initial) {
                candidate.clone()
            } else {
                self.initial.clone()
            };
            self.record(from, vote);
            // The round moved under us; peers need to hear where we stand now.
            LookingAction::Adopted
        } else if vote.elect_epoch < self.logical_clock {
            LookingAction::Stale
        } else {
            let adopted = candidate.outranks(&self.proposal);
            if adopted {
                self.proposal = candidate;
            }
            self.record(from, vote);
            if adopted {
                LookingAction::Adopted
            } else {
                LookingAction::Recorded
            }
        }
    }

    fn record(&mut self, from: Sid, vote: &Vote) {
        self.received.insert(
            from,
            RecordedVote {
                proposal: VoteProposal::of(vote),
                ha_state: vote.ha_state,
                elect_epoch: vote.elect_epoch,
            },
        );
    }

    /// True iff a strict majority of members back the current proposal.
    pub(crate) fn proposal_has_quorum(&self, member_count: usize) -> bool {
        let backing = self
            .received
            .values()
            .filter(|r| r.proposal == self.proposal)
            .count();
        backing >= quorum(member_count)
    }

    /// Whether a still-queued vote should stop an imminent finalize.
    pub(crate) fn would_supersede(&self, vote: &Vote) -> bool {
        vote.elect_epoch > self.logical_clock
            || (vote.elect_epoch == self.logical_clock
                && VoteProposal::of(vote).outranks(&self.proposal))
    }

    /// Concludes the round on the current proposal.
    pub(crate) fn finalize(&mut self) -> ElectionDecision {
        self.decide(self.proposal.clone(), self.logical_clock)
    }

    /// A vote from a node that already settled on a leader. Two ways this
    /// concludes our round: the established votes of our own round reach
    /// quorum, or (at any epoch) a quorum of established nodes agree on the
    /// same regime. Both require the purported leader's own LEADING
    /// assertion, so two leaders can never be concluded for one epoch.
    pub(crate) fn handle_established(
        &mut self,
        from: Sid,
        vote: &Vote,
        member_count: usize,
    ) -> Option<ElectionDecision> {
        let candidate = VoteProposal::of(vote);
        if vote.elect_epoch == self.logical_clock {
            self.record(from, vote);
            if self.regime_has_quorum(&self.received, &candidate, None, member_count)
                && self.leader_asserted(&self.received, &candidate)
            {
                return Some(self.decide(candidate, vote.elect_epoch));
            }
        }
        self.out_of_election.insert(
            from,
            RecordedVote {
                proposal: candidate.clone(),
                ha_state: vote.ha_state,
                elect_epoch: vote.elect_epoch,
            },
        );
        if self.regime_has_quorum(
            &self.out_of_election,
            &candidate,
            Some(vote.elect_epoch),
            member_count,
        ) && self.leader_asserted(&self.out_of_election, &candidate)
        {
            self.logical_clock = vote.elect_epoch;
            return Some(self.decide(candidate, vote.elect_epoch));
        }
        None
    }

    fn regime_has_quorum(
        &self,
        votes: &HashMap<Sid, RecordedVote>,
        candidate: &VoteProposal,
        elect_epoch: Option<i64>,
        member_count: usize,
    ) -> bool {
        let agreeing = votes
            .values()
            .filter(|r| {
                r.proposal.leader == candidate.leader
                    && r.proposal.peer_epoch == candidate.peer_epoch
                    && elect_epoch.map(|e| r.elect_epoch == e).unwrap_or(true)
            })
            .count();
        agreeing >= quorum(member_count)
    }

    fn leader_asserted(&self, votes: &HashMap<Sid, RecordedVote>, candidate: &VoteProposal) -> bool {
        if candidate.leader == self.my_sid {
            // We are looking; we cannot vouch for our own leadership.
            return false;
        }
        match votes.get(&candidate.leader) {
            Some(r) => r.ha_state == HaState::Leading && r.proposal.peer_epoch == candidate.peer_epoch,
            None => false,
        }
    }

    fn decide(&mut self, proposal: VoteProposal, elect_epoch: i64) -> ElectionDecision {
        let ha_state = if proposal.leader == self.my_sid {
            HaState::Leading
        } else {
            HaState::Learning
        };
        ElectionDecision {
            leader: proposal.leader,
            ha_state,
            elect_epoch,
            offset: proposal.offset,
        }
    }
}

fn quorum(member_count: usize) -> usize {
    member_count / 2 + 1
}
