//! Emergency lifecycle transitions.
//!
//! Rows are evaluated in declaration order. The first row matching
//! `(from, event)` whose condition holds wins; when none does the event is
//! rejected and the context is left untouched. A rejection is an ordinary
//! outcome that callers branch on, not an error.

use crate::emergency::types::{EmergencyContext, EmergencyEvent, EmergencyState};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Guard {
    Always,
    RequiresAck,
    NoAckRequired,
    AcksPending,
    AllAcknowledged,
}

impl Guard {
    fn holds(self, ctx: &EmergencyContext) -> bool {
        match self {
            Guard::Always => true,
            Guard::RequiresAck => ctx.config.require_acknowledgment,
            Guard::NoAckRequired => !ctx.config.require_acknowledgment,
            Guard::AcksPending => ctx.pending_acks > 0,
            Guard::AllAcknowledged => ctx.pending_acks == 0,
        }
    }
}

struct Row {
    from: EmergencyState,
    event: EmergencyEvent,
    to: EmergencyState,
    guard: Guard,
}

const fn row(
    from: EmergencyState,
    event: EmergencyEvent,
    to: EmergencyState,
    guard: Guard,
) -> Row {
    Row {
        from,
        event,
        to,
        guard,
    }
}

use EmergencyEvent as E;
use EmergencyState as S;

static TRANSITIONS: [Row; 14] = [
    row(S::Initiated, E::StartBroadcast, S::Broadcasting, Guard::Always),
    row(S::Initiated, E::Cancel, S::Cancelled, Guard::Always),
    row(S::Broadcasting, E::BroadcastComplete, S::AwaitingAck, Guard::RequiresAck),
    row(S::Broadcasting, E::BroadcastComplete, S::Resolved, Guard::NoAckRequired),
    row(S::Broadcasting, E::Cancel, S::Cancelled, Guard::Always),
    row(S::AwaitingAck, E::AckReceived, S::AwaitingAck, Guard::AcksPending),
    row(S::AwaitingAck, E::AckReceived, S::Resolved, Guard::AllAcknowledged),
    row(S::AwaitingAck, E::AckTimeout, S::Escalating, Guard::Always),
    row(S::AwaitingAck, E::Resolve, S::Resolved, Guard::Always),
    row(S::AwaitingAck, E::Cancel, S::Cancelled, Guard::Always),
    row(S::Escalating, E::AckReceived, S::AwaitingAck, Guard::Always),
    row(S::Escalating, E::Escalate, S::Escalating, Guard::Always),
    row(S::Escalating, E::Resolve, S::Resolved, Guard::Always),
    row(S::Escalating, E::Cancel, S::Cancelled, Guard::Always),
];

/// Outcome of offering an event to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: EmergencyState,
        to: EmergencyState,
        event: EmergencyEvent,
    },
    Rejected {
        state: EmergencyState,
        event: EmergencyEvent,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// State after the transition (unchanged when rejected).
    pub fn state(&self) -> EmergencyState {
        match self {
            Transition::Applied { to, .. } => *to,
            Transition::Rejected { state, .. } => *state,
        }
    }
}

/// Target state for `event`, or `None` when no row matches.
pub fn next_state(ctx: &EmergencyContext, event: EmergencyEvent) -> Option<EmergencyState> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == ctx.state && r.event == event)
        .find(|r| r.guard.holds(ctx))
        .map(|r| r.to)
}

/// Apply `event` to the context. Entering a state stamps the matching timestamp;
/// an `Escalate` bumps the escalation level.
pub fn advance(
    ctx: &mut EmergencyContext,
    event: EmergencyEvent,
    now: OffsetDateTime,
) -> Transition {
    let Some(to) = next_state(ctx, event) else {
        tracing::debug!(
            name = "emergency.state.rejected",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Transition rejected",
            emergency_id = %ctx.id,
            state = ctx.state.as_str(),
            event = ?event,
        );
        return Transition::Rejected {
            state: ctx.state,
            event,
        };
    };

    let from = ctx.state;
    ctx.state = to;
    match (event, to) {
        (E::Escalate, _) => {
            ctx.escalation_level += 1;
            ctx.last_escalation_at = Some(now);
        }
        (_, S::Resolved) => ctx.resolved_at = Some(now),
        (_, S::Cancelled) => ctx.cancelled_at = Some(now),
        _ => {}
    }

    if from != to {
        tracing::info!(
            name = "emergency.state.transition",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Emergency state transition",
            emergency_id = %ctx.id,
            from = from.as_str(),
            to = to.as_str(),
            event = ?event,
        );
    }

    Transition::Applied { from, to, event }
}
