use std::collections::VecDeque;
use std::future::Future;

use crate::protocol::IceCandidate;

/// Remote candidates held until the remote description is applied.
#[derive(Debug)]
pub struct IceCandidateBuffer {
    session_id: String,
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pending: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
        tracing::trace!(
            target = "session",
            session_id = %self.session_id,
            pending = self.pending.len(),
            "candidate buffered"
        );
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empties the buffer, then hands every candidate to `apply` in arrival
    /// order. Returns how many were applied.
    pub async fn flush_into<F, Fut>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = ()>,
    {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for candidate in pending {
            apply(candidate).await;
        }
        if count > 0 {
            tracing::debug!(target = "session", session_id = %self.session_id, count, "flushed buffered candidates");
        }
        count
    }

    /// Drops anything still pending. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn flush_preserves_arrival_order_and_empties() {
        let mut buffer = IceCandidateBuffer::new("s1");
        for n in 1..=4 {
            buffer.push(candidate(n));
        }
        assert_eq!(buffer.len(), 4);

        let mut applied = Vec::new();
        let count = buffer
            .flush_into(|candidate| {
                applied.push(candidate);
                async {}
            })
            .await;

        assert_eq!(count, 4);
        assert!(buffer.is_empty());
        assert_eq!(applied, (1..=4).map(candidate).collect::<Vec<_>>());

        let again = buffer.flush_into(|_| async {}).await;
        assert_eq!(again, 0);
    }

    #[test]
    fn clear_discards_pending() {
        let mut buffer = IceCandidateBuffer::new("s1");
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.session_id(), "s1");
    }
}
