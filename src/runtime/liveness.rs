use crate::record::Sid;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;

/// Records when each peer was last heard from on the wire. Poked by the
/// transport on every decoded inbound frame; read by housekeeping to decide
/// whether the stack has gone stale.
pub(crate) struct LivenessTracker {
    inner: Mutex<LivenessInner>,
}

struct LivenessInner {
    last_heard: HashMap<Sid, Instant>,
    last_any: Option<Instant>,
}

impl LivenessTracker {
    pub(crate) fn new() -> Self {
        LivenessTracker {
            inner: Mutex::new(LivenessInner {
                last_heard: HashMap::new(),
                last_any: None,
            }),
        }
    }

    pub(crate) fn poke(&self, from: Sid) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("liveness lock poisoned");
        inner.last_heard.insert(from, now);
        inner.last_any = Some(now);
    }

    #[cfg(test)]
    pub(crate) fn poke_at(&self, from: Sid, at: Instant) {
        let mut inner = self.inner.lock().expect("liveness lock poisoned");
        inner.last_heard.insert(from, at);
        inner.last_any = Some(at);
    }

    pub(crate) fn last_heard(&self, sid: Sid) -> Option<Instant> {
        let inner = self.inner.lock().expect("liveness lock poisoned");
        inner.last_heard.get(&sid).copied()
    }

    pub(crate) fn last_heard_any(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("liveness lock poisoned");
        inner.last_any
    }
}
