use serde::{Deserialize, Serialize};

/// Why a final candidate is sent back for refinement. Checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineTrigger {
    Structure,
    TextOnlyVeto,
    TooEasy,
    ReviewRejected,
}

/// How the refine loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineExit {
    Approved,
    /// The reviewer gave no recognizable decision.
    Inconclusive,
    /// A trigger fired with no refinements left.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineState {
    Compose,
    Check { refinements: u32 },
    Refine { refinements: u32, trigger: RefineTrigger },
    Done(RefineExit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineEvent {
    Composed,
    Triggered(RefineTrigger),
    Approved,
    Inconclusive,
    Refined,
}

/// Next state of the refine loop. Events that do not apply leave the
/// state as is.
pub fn transition(state: RefineState, event: RefineEvent, max_refinements: u32) -> RefineState {
    use RefineEvent as E;
    use RefineState as S;

    match (state, event) {
        (S::Compose, E::Composed) => S::Check { refinements: 0 },
        (S::Check { refinements }, E::Triggered(trigger)) => {
            if refinements < max_refinements {
                S::Refine {
                    refinements: refinements + 1,
                    trigger,
                }
            } else {
                S::Done(RefineExit::Exhausted)
            }
        }
        (S::Check { .. }, E::Approved) => S::Done(RefineExit::Approved),
        (S::Check { .. }, E::Inconclusive) => S::Done(RefineExit::Inconclusive),
        (S::Refine { refinements, .. }, E::Refined) => S::Check { refinements },
        (state, _) => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_without_refinement() {
        let state = transition(RefineState::Compose, RefineEvent::Composed, 2);
        assert_eq!(
            transition(state, RefineEvent::Approved, 2),
            RefineState::Done(RefineExit::Approved)
        );
    }

    #[test]
    fn test_refinement_bound() {
        let mut state = transition(RefineState::Compose, RefineEvent::Composed, 2);
        for expected in 1..=2 {
            state = transition(state, RefineEvent::Triggered(RefineTrigger::TooEasy), 2);
            assert_eq!(
                state,
                RefineState::Refine {
                    refinements: expected,
                    trigger: RefineTrigger::TooEasy
                }
            );
            state = transition(state, RefineEvent::Refined, 2);
        }
        assert_eq!(
            transition(state, RefineEvent::Triggered(RefineTrigger::Structure), 2),
            RefineState::Done(RefineExit::Exhausted)
        );
    }

    #[test]
    fn test_inconclusive_ends_loop() {
        let state = RefineState::Check { refinements: 1 };
        assert_eq!(
            transition(state, RefineEvent::Inconclusive, 2),
            RefineState::Done(RefineExit::Inconclusive)
        );
    }

    #[test]
    fn test_zero_refinements_allowed() {
        let state = transition(RefineState::Compose, RefineEvent::Composed, 0);
        assert_eq!(
            transition(state, RefineEvent::Triggered(RefineTrigger::ReviewRejected), 0),
            RefineState::Done(RefineExit::Exhausted)
        );
    }
}
