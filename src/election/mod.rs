mod responder;
mod round;
mod state;

pub(crate) use responder::run_vote_responder;
pub(crate) use round::look_for_leader;
pub(crate) use round::RoundOutcome;
pub(crate) use state::ElectionState;
