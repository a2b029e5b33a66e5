use serde::{Deserialize, Serialize};

use crate::error::EscrowError;

/// Canonical milestone lifecycle states.
///
/// `Released` and `Refunded` are terminal. Reaching either has ledger side
/// effects, so those transitions are only ever applied by the payment
/// orchestrator as part of an atomic commit (`apply` is crate-private).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Created,
    Accepted,
    Funded,
    InProgress,
    Submitted,
    RevisionRequested,
    Disputed,
    Released,
    Refunded,
}

impl MilestoneStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepted => "accepted",
            Self::Funded => "funded",
            Self::InProgress => "in_progress",
            Self::Submitted => "submitted",
            Self::RevisionRequested => "revision_requested",
            Self::Disputed => "disputed",
            Self::Released => "released",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// True for the states a party may escalate into a dispute from.
    pub fn is_disputable(self) -> bool {
        matches!(self, Self::Funded | Self::InProgress | Self::Submitted)
    }
}

/// Events that drive the milestone lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneEvent {
    FreelancerAccept,
    Fund,
    StartWork,
    Submit,
    Approve,
    RequestRevision,
    Resume,
    RaiseDispute,
    ResolveRefund,
    ResolveRelease,
}

impl MilestoneEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::FreelancerAccept => "freelancer_accept",
            Self::Fund => "fund",
            Self::StartWork => "start_work",
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::RequestRevision => "request_revision",
            Self::Resume => "resume",
            Self::RaiseDispute => "raise_dispute",
            Self::ResolveRefund => "resolve_refund",
            Self::ResolveRelease => "resolve_release",
        }
    }
}

impl MilestoneStatus {
    /// The single transition function. Every legal (state, event) pair is
    /// listed here; anything else is an `InvalidTransition` naming the
    /// current state and the requested event.
    pub(crate) fn apply(self, event: MilestoneEvent) -> Result<MilestoneStatus, EscrowError> {
        use MilestoneEvent as E;
        use MilestoneStatus as S;

        let next = match (self, event) {
            (S::Created, E::FreelancerAccept) => S::Accepted,
            (S::Accepted, E::Fund) => S::Funded,
            (S::Funded, E::StartWork) => S::InProgress,
            (S::InProgress, E::Submit) => S::Submitted,
            (S::Submitted, E::Approve) => S::Released,
            (S::Submitted, E::RequestRevision) => S::RevisionRequested,
            (S::RevisionRequested, E::Resume) => S::InProgress,
            (from, E::RaiseDispute) if from.is_disputable() => S::Disputed,
            (S::Disputed, E::ResolveRefund) => S::Refunded,
            (S::Disputed, E::ResolveRelease) => S::Released,
            (from, event) => {
                return Err(EscrowError::invalid_transition(from.name(), event.name()))
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [MilestoneStatus; 9] = [
        MilestoneStatus::Created,
        MilestoneStatus::Accepted,
        MilestoneStatus::Funded,
        MilestoneStatus::InProgress,
        MilestoneStatus::Submitted,
        MilestoneStatus::RevisionRequested,
        MilestoneStatus::Disputed,
        MilestoneStatus::Released,
        MilestoneStatus::Refunded,
    ];

    const ALL_EVENTS: [MilestoneEvent; 10] = [
        MilestoneEvent::FreelancerAccept,
        MilestoneEvent::Fund,
        MilestoneEvent::StartWork,
        MilestoneEvent::Submit,
        MilestoneEvent::Approve,
        MilestoneEvent::RequestRevision,
        MilestoneEvent::Resume,
        MilestoneEvent::RaiseDispute,
        MilestoneEvent::ResolveRefund,
        MilestoneEvent::ResolveRelease,
    ];

    fn legal(from: MilestoneStatus, event: MilestoneEvent) -> Option<MilestoneStatus> {
        use MilestoneEvent as E;
        use MilestoneStatus as S;
        match (from, event) {
            (S::Created, E::FreelancerAccept) => Some(S::Accepted),
            (S::Accepted, E::Fund) => Some(S::Funded),
            (S::Funded, E::StartWork) => Some(S::InProgress),
            (S::InProgress, E::Submit) => Some(S::Submitted),
            (S::Submitted, E::Approve) => Some(S::Released),
            (S::Submitted, E::RequestRevision) => Some(S::RevisionRequested),
            (S::RevisionRequested, E::Resume) => Some(S::InProgress),
            (S::Funded | S::InProgress | S::Submitted, E::RaiseDispute) => Some(S::Disputed),
            (S::Disputed, E::ResolveRefund) => Some(S::Refunded),
            (S::Disputed, E::ResolveRelease) => Some(S::Released),
            _ => None,
        }
    }

    #[test]
    fn walks_the_happy_path() {
        let mut status = MilestoneStatus::Created;
        for event in [
            MilestoneEvent::FreelancerAccept,
            MilestoneEvent::Fund,
            MilestoneEvent::StartWork,
            MilestoneEvent::Submit,
            MilestoneEvent::Approve,
        ] {
            status = status.apply(event).unwrap();
        }
        assert_eq!(status, MilestoneStatus::Released);
    }

    #[test]
    fn revision_loops_back_to_in_progress() {
        let status = MilestoneStatus::Submitted
            .apply(MilestoneEvent::RequestRevision)
            .unwrap();
        assert_eq!(status, MilestoneStatus::RevisionRequested);

        let status = status.apply(MilestoneEvent::Resume).unwrap();
        assert_eq!(status, MilestoneStatus::InProgress);

        let status = status.apply(MilestoneEvent::Submit).unwrap();
        assert_eq!(status, MilestoneStatus::Submitted);
    }

    #[test]
    fn dispute_can_end_either_way() {
        let disputed = MilestoneStatus::Funded
            .apply(MilestoneEvent::RaiseDispute)
            .unwrap();
        assert_eq!(disputed, MilestoneStatus::Disputed);

        assert_eq!(
            disputed.apply(MilestoneEvent::ResolveRefund).unwrap(),
            MilestoneStatus::Refunded
        );
        assert_eq!(
            disputed.apply(MilestoneEvent::ResolveRelease).unwrap(),
            MilestoneStatus::Released
        );
    }

    #[test]
    fn every_pair_outside_the_table_is_rejected() {
        for from in ALL_STATES {
            for event in ALL_EVENTS {
                match legal(from, event) {
                    Some(expected) => assert_eq!(from.apply(event).unwrap(), expected),
                    None => {
                        let err = from.apply(event).unwrap_err();
                        match err {
                            EscrowError::InvalidTransition { from: f, event: e } => {
                                assert_eq!(f, from.name());
                                assert_eq!(e, event.name());
                            }
                            other => panic!("expected InvalidTransition, got {other:?}"),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_states_admit_no_events() {
        for from in [MilestoneStatus::Released, MilestoneStatus::Refunded] {
            for event in ALL_EVENTS {
                assert!(from.apply(event).is_err());
            }
        }
    }

    #[test]
    fn created_cannot_be_disputed() {
        assert!(MilestoneStatus::Created
            .apply(MilestoneEvent::RaiseDispute)
            .is_err());
        assert!(MilestoneStatus::Accepted
            .apply(MilestoneEvent::RaiseDispute)
            .is_err());
    }
}
