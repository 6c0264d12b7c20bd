use crate::config::StepPolicy;
use serde::{Deserialize, Serialize};

/// How a hop left the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopExit {
    /// Passed every check.
    Accepted,
    /// Revision bound reached; the last candidate is kept.
    AcceptedAfterExhaustion,
    /// Visual claims never verified; the hop is discarded.
    Dropped,
}

/// What a revision is asked to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    Rules,
    VisualClaims,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Generate,
    Validate {
        revisions: u32,
        visual_revisions: u32,
    },
    Revise {
        revisions: u32,
        visual_revisions: u32,
        kind: RevisionKind,
    },
    Done(HopExit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Generated,
    Passed,
    /// A rule or the text-only probe rejected the candidate.
    Failed,
    /// The hallucination check rejected the candidate.
    VisualRejected,
    Revised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBounds {
    pub max_revisions: u32,
    pub max_visual_revisions: u32,
}

impl From<&StepPolicy> for StepBounds {
    fn from(policy: &StepPolicy) -> Self {
        Self {
            max_revisions: policy.max_revisions,
            max_visual_revisions: policy.max_visual_revisions,
        }
    }
}

/// Next state of a hop. Events that do not apply leave the state as is.
pub fn transition(state: StepState, event: StepEvent, bounds: &StepBounds) -> StepState {
    use StepEvent as E;
    use StepState as S;

    match (state, event) {
        (S::Generate, E::Generated) => S::Validate {
            revisions: 0,
            visual_revisions: 0,
        },
        (S::Validate { .. }, E::Passed) => S::Done(HopExit::Accepted),
        (
            S::Validate {
                revisions,
                visual_revisions,
            },
            E::Failed,
        ) => {
            if revisions < bounds.max_revisions {
                S::Revise {
                    revisions: revisions + 1,
                    visual_revisions,
                    kind: RevisionKind::Rules,
                }
            } else {
                S::Done(HopExit::AcceptedAfterExhaustion)
            }
        }
        (
            S::Validate {
                revisions,
                visual_revisions,
            },
            E::VisualRejected,
        ) => {
            if visual_revisions < bounds.max_visual_revisions {
                S::Revise {
                    revisions,
                    visual_revisions: visual_revisions + 1,
                    kind: RevisionKind::VisualClaims,
                }
            } else {
                S::Done(HopExit::Dropped)
            }
        }
        (
            S::Revise {
                revisions,
                visual_revisions,
                ..
            },
            E::Revised,
        ) => S::Validate {
            revisions,
            visual_revisions,
        },
        (state, _) => state,
    }
}
