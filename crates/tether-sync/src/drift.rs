//! Drift detection: periodic checksum comparison and the error budget.
//!
//! The host broadcasts its [`ChecksumSet`] every check interval. Each client
//! recomputes the same categories at the host's tick, diffs them, and answers
//! with the mismatch mask. The host feeds answers into a [`DriftBudget`],
//! which decides between partial resync and escalation to a hard sync.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_net::{DecodeError, EncodeError, Message, MessageKind, Outbox, PeerId, SessionContext};

use crate::category::CategoryMask;
use crate::checksum::{ChecksumSet, get_mismatched_categories};

/// `SyncResponse` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    /// Tick of the `SyncCheck` being answered.
    pub tick: i64,
    /// Categories whose local checksum disagreed.
    pub mismatched: CategoryMask,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Schedules host checks and answers them on clients.
#[derive(Debug)]
pub struct DriftDetector {
    interval: Duration,
    last_check: Instant,
    checks_sent: u64,
}

impl DriftDetector {
    /// A detector whose first check is due one interval after `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_check: now,
            checks_sent: 0,
        }
    }

    /// Returns `true` if a host check is due.
    pub fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_check) >= self.interval
    }

    /// Restart the interval from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_check = now;
    }

    /// Host: broadcast `checksums` as a `SyncCheck`.
    pub fn perform_check(
        &mut self,
        ctx: &SessionContext,
        checksums: &ChecksumSet,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), EncodeError> {
        outbox.send_to_all(Message::with_payload(
            MessageKind::SyncCheck,
            ctx.local_id,
            checksums.tick,
            checksums,
        )?);
        self.last_check = now;
        self.checks_sent += 1;
        tracing::debug!(
            tick = checksums.tick,
            categories = %checksums.categories(),
            "sync check broadcast"
        );
        Ok(())
    }

    /// Number of checks broadcast so far.
    pub fn checks_sent(&self) -> u64 {
        self.checks_sent
    }

    /// Client: diff the host's checksums against local ones and reply.
    ///
    /// `compute_local` receives the host tick so sampled categories use the
    /// same seed as the host. Returns the mismatch mask.
    pub fn handle_check(
        ctx: &SessionContext,
        message: &Message,
        compute_local: impl FnOnce(i64) -> ChecksumSet,
        outbox: &mut Outbox,
    ) -> Result<CategoryMask, DriftError> {
        let host: ChecksumSet = message.payload_as()?;
        let local = compute_local(host.tick);
        let mismatched = get_mismatched_categories(&host, &local);

        if mismatched.is_empty() {
            tracing::trace!(tick = host.tick, "sync check clean");
        } else {
            tracing::info!(tick = host.tick, categories = %mismatched, "checksum mismatch");
        }

        let response = SyncResponsePayload {
            tick: host.tick,
            mismatched,
        };
        outbox.send_to(
            ctx.host_id,
            Message::with_payload(MessageKind::SyncResponse, ctx.local_id, host.tick, &response)?,
        );
        Ok(mismatched)
    }
}

// ---------------------------------------------------------------------------
// Error budget
// ---------------------------------------------------------------------------

/// What the host should do about one client's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftVerdict {
    /// Categories to resync partially, tolerated ones included. Empty when
    /// escalating.
    pub resync: CategoryMask,
    /// The budget was exhausted: trigger one hard sync.
    pub escalate: bool,
}

/// Counts consecutive actionable mismatches per client.
///
/// The error budget is kept per client rather than session-wide: one
/// drifting client escalates on its own streak, and clean answers from the
/// others neither mask nor reset it. Escalation sends the hard sync to
/// everyone and so clears every streak.
///
/// Every mismatched category is resynced. Tolerated (continuous-field)
/// categories never count toward a streak and never reset one. A clean
/// response resets that client's streak.
#[derive(Debug)]
pub struct DriftBudget {
    threshold: u32,
    tolerated: CategoryMask,
    streaks: HashMap<PeerId, u32>,
    escalations: u64,
}

impl DriftBudget {
    /// A budget escalating on the mismatch after `threshold` consecutive ones.
    pub fn new(threshold: u32, tolerated: CategoryMask) -> Self {
        Self {
            threshold,
            tolerated,
            streaks: HashMap::new(),
            escalations: 0,
        }
    }

    /// Decode a `SyncResponse` and record it.
    pub fn handle_response(
        &mut self,
        peer: PeerId,
        message: &Message,
    ) -> Result<(SyncResponsePayload, DriftVerdict), DecodeError> {
        let response: SyncResponsePayload = message.payload_as()?;
        let verdict = self.record(peer, response.tick, response.mismatched);
        Ok((response, verdict))
    }

    /// Record one client's mismatch mask for `tick`.
    pub fn record(&mut self, peer: PeerId, tick: i64, mismatched: CategoryMask) -> DriftVerdict {
        let actionable = mismatched.without(self.tolerated);
        let tolerated = mismatched.without(actionable);
        if !tolerated.is_empty() {
            tracing::debug!(peer, tick, categories = %tolerated, "tolerated continuous-field drift");
        }

        if actionable.is_empty() {
            if mismatched.is_empty() {
                self.streaks.remove(&peer);
            }
            return DriftVerdict {
                resync: tolerated,
                escalate: false,
            };
        }

        let streak = self.streaks.entry(peer).or_insert(0);
        *streak += 1;
        let streak = *streak;

        if streak > self.threshold {
            tracing::warn!(
                peer,
                tick,
                streak,
                threshold = self.threshold,
                "drift budget exhausted, escalating to hard sync"
            );
            self.streaks.clear();
            self.escalations += 1;
            return DriftVerdict {
                resync: CategoryMask::NONE,
                escalate: true,
            };
        }

        tracing::info!(peer, tick, streak, categories = %actionable, "drift detected");
        DriftVerdict {
            resync: mismatched,
            escalate: false,
        }
    }

    /// Current consecutive-mismatch count for `peer`.
    pub fn streak(&self, peer: PeerId) -> u32 {
        self.streaks.get(&peer).copied().unwrap_or(0)
    }

    /// Times the budget escalated.
    pub fn escalations(&self) -> u64 {
        self.escalations
    }

    /// Forget a client.
    pub fn forget(&mut self, peer: PeerId) {
        self.streaks.remove(&peer);
    }

    /// Reset every streak (e.g. after a hard sync).
    pub fn reset(&mut self) {
        self.streaks.clear();
    }
}

/// Errors answering a sync check.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    /// The `SyncCheck` payload was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The response could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::SyncCategory;
    use crate::checksum::CategoryChecksum;

    fn tolerated() -> CategoryMask {
        CategoryMask::from_bits(16 | 32)
    }

    #[test]
    fn test_check_due_every_interval() {
        let start = Instant::now();
        let ctx = SessionContext::host(1);
        let mut detector = DriftDetector::new(Duration::from_secs(60), start);
        assert!(!detector.due(start + Duration::from_secs(59)));
        assert!(detector.due(start + Duration::from_secs(60)));

        let mut outbox = Outbox::new();
        let now = start + Duration::from_secs(60);
        detector
            .perform_check(&ctx, &ChecksumSet::new(3_600), now, &mut outbox)
            .unwrap();
        assert!(!detector.due(now + Duration::from_secs(1)));
        assert_eq!(outbox.len(), 1);
        assert_eq!(detector.checks_sent(), 1);
    }

    #[test]
    fn test_client_answers_with_mismatch_mask() {
        let ctx = SessionContext::client(2, 1);
        let host = ChecksumSet::new(500)
            .with(SyncCategory::Structures, CategoryChecksum::new(42))
            .with(SyncCategory::MobileEntities, CategoryChecksum::new(7));
        let msg = Message::with_payload(MessageKind::SyncCheck, 1, 500, &host).unwrap();

        let mut seen_tick = None;
        let mut outbox = Outbox::new();
        let mask = DriftDetector::handle_check(
            &ctx,
            &msg,
            |tick| {
                seen_tick = Some(tick);
                ChecksumSet::new(tick)
                    .with(SyncCategory::Structures, CategoryChecksum::new(42))
                    .with(SyncCategory::MobileEntities, CategoryChecksum::new(9))
            },
            &mut outbox,
        )
        .unwrap();

        assert_eq!(seen_tick, Some(500));
        assert_eq!(mask, SyncCategory::MobileEntities.into());
        let out = outbox.drain();
        assert_eq!(out[0].destination, tether_net::Destination::Peer(1));
        let response: SyncResponsePayload = out[0].message.payload_as().unwrap();
        assert_eq!(response.mismatched, mask);
    }

    #[test]
    fn test_eleventh_mismatch_escalates_once() {
        let mut budget = DriftBudget::new(10, tolerated());
        let structures: CategoryMask = SyncCategory::Structures.into();

        for i in 0..10 {
            let verdict = budget.record(2, i, structures);
            assert!(!verdict.escalate);
            assert_eq!(verdict.resync, structures);
        }
        assert_eq!(budget.streak(2), 10);

        let verdict = budget.record(2, 10, structures);
        assert!(verdict.escalate);
        assert!(verdict.resync.is_empty());
        assert_eq!(budget.streak(2), 0);
        assert_eq!(budget.escalations(), 1);
    }

    #[test]
    fn test_clean_response_resets_streak() {
        let mut budget = DriftBudget::new(10, tolerated());
        for i in 0..9 {
            budget.record(2, i, SyncCategory::LooseItems.into());
        }
        budget.record(2, 9, CategoryMask::NONE);
        assert_eq!(budget.streak(2), 0);
    }

    #[test]
    fn test_tolerated_categories_resync_but_never_escalate() {
        let mut budget = DriftBudget::new(2, tolerated());
        for i in 0..20 {
            let verdict = budget.record(3, i, SyncCategory::Gases.into());
            assert_eq!(
                verdict,
                DriftVerdict {
                    resync: SyncCategory::Gases.into(),
                    escalate: false
                }
            );
        }
        assert_eq!(budget.escalations(), 0);
        assert_eq!(budget.streak(3), 0);

        let mixed: CategoryMask = [SyncCategory::Liquids, SyncCategory::Structures]
            .into_iter()
            .collect();
        assert_eq!(budget.record(3, 21, mixed).resync, mixed);
        assert_eq!(budget.streak(3), 1);

        // Tolerated drift alone neither counts nor clears the streak.
        budget.record(3, 22, SyncCategory::Liquids.into());
        assert_eq!(budget.streak(3), 1);
    }

    #[test]
    fn test_streaks_are_per_client() {
        let mut budget = DriftBudget::new(10, tolerated());
        budget.record(2, 0, SyncCategory::Structures.into());
        budget.record(3, 0, CategoryMask::NONE);
        assert_eq!(budget.streak(2), 1);
        assert_eq!(budget.streak(3), 0);
    }
}
