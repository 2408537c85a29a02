//! The per-area occupancy state machine
//!
//! [`OccupancyStateMachine::recompute`] is a step over the current inputs
//! and the time since occupancy evidence was last lost. The
//! clear and extended timers are kept as deadlines; the owning task sleeps
//! until [`OccupancyStateMachine::next_deadline`] and then calls
//! [`OccupancyStateMachine::fire_due`]. Dropping the machine drops both
//! timers with it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ma_core::AreaState;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

/// What the machine reads on every recompute
pub trait OccupancyInputs {
    fn control_enabled(&self) -> bool;

    /// `None` when nothing readable is tracked, which holds the state
    fn occupied_now(&self) -> Option<bool>;

    /// The first active override in priority order
    fn secondary_state(&self) -> Option<AreaState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AreaState,
    pub to: AreaState,
}

#[derive(Debug, Clone)]
pub struct OccupancyStateMachine {
    clear_timeout: Duration,
    extended_timeout: Duration,
    state: AreaState,
    last_off: Option<Instant>,
    last_off_time: Option<DateTime<Utc>>,
    clear_timer: Option<Instant>,
    extended_timer: Option<Instant>,
    /// The last readable evaluation found evidence
    evidence_seen: bool,
    /// `note_evidence_lost` ran since evidence was last seen
    loss_noted: bool,
}

impl OccupancyStateMachine {
    pub fn new(clear_timeout: Duration, extended_timeout: Duration) -> Self {
        Self {
            clear_timeout,
            extended_timeout,
            state: AreaState::Clear,
            last_off: None,
            last_off_time: None,
            clear_timer: None,
            extended_timer: None,
            evidence_seen: false,
            loss_noted: false,
        }
    }

    /// Seed from a persisted state before the first recompute.
    ///
    /// A `last_off_time` further back than the monotonic clock reaches is
    /// treated as infinitely old.
    pub fn seed(
        &mut self,
        state: AreaState,
        last_off_time: Option<DateTime<Utc>>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) {
        self.state = state;
        self.last_off_time = last_off_time;
        self.evidence_seen =
            state.is_occupied_class() && state != AreaState::Extended && last_off_time.is_none();
        self.loss_noted = false;
        self.last_off = last_off_time.and_then(|at| {
            let ago = (wall_now - at).to_std().unwrap_or(Duration::ZERO);
            now.checked_sub(ago)
        });
    }

    pub fn state(&self) -> AreaState {
        self.state
    }

    pub fn last_off_time(&self) -> Option<DateTime<Utc>> {
        self.last_off_time
    }

    pub fn clear_timeout(&self) -> Duration {
        self.clear_timeout
    }

    pub fn extended_timeout(&self) -> Duration {
        self.extended_timeout
    }

    pub fn clear_pending(&self) -> bool {
        self.clear_timer.is_some()
    }

    pub fn extended_pending(&self) -> bool {
        self.extended_timer.is_some()
    }

    /// The moment a tracked entity left its on-set
    pub fn note_evidence_lost(&mut self, now: Instant, wall_now: DateTime<Utc>) {
        trace!("Occupancy evidence lost");
        self.last_off = Some(now);
        self.last_off_time = Some(wall_now);
        self.clear_timer = None;
        self.loss_noted = true;
    }

    /// Start the grace window when evidence disappears without a tracked
    /// on to off change, e.g. through unavailable
    fn track_evidence(&mut self, occupied: Option<bool>, now: Instant) {
        match occupied {
            Some(true) => {
                self.evidence_seen = true;
                self.loss_noted = false;
            }
            Some(false) if self.evidence_seen => {
                if !self.loss_noted {
                    debug!("Evidence gone without an off transition, starting grace window");
                    self.note_evidence_lost(now, Utc::now());
                }
                self.evidence_seen = false;
            }
            _ => {}
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.clear_timer, self.extended_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drop expired timers and recompute
    pub fn fire_due(&mut self, inputs: &dyn OccupancyInputs, now: Instant) -> Option<Transition> {
        if self.clear_timer.is_some_and(|at| at <= now) {
            debug!("Clear timer fired");
            self.clear_timer = None;
        }
        if self.extended_timer.is_some_and(|at| at <= now) {
            debug!("Extended timer fired");
            self.extended_timer = None;
        }
        self.recompute(inputs, now)
    }

    pub fn cancel_timers(&mut self) {
        self.clear_timer = None;
        self.extended_timer = None;
    }

    /// Evaluate the inputs and move to the resulting state
    pub fn recompute(&mut self, inputs: &dyn OccupancyInputs, now: Instant) -> Option<Transition> {
        let next = self.evaluate(inputs, now);
        let from = self.state;
        self.state = next;
        (from != next).then_some(Transition { from, to: next })
    }

    fn evaluate(&mut self, inputs: &dyn OccupancyInputs, now: Instant) -> AreaState {
        let occupied_now = inputs.occupied_now();
        self.track_evidence(occupied_now, now);

        if !inputs.control_enabled() {
            self.cancel_timers();
            return AreaState::Manual;
        }

        let occupied = match occupied_now {
            Some(occupied) => occupied,
            None if self.state == AreaState::Manual => false,
            None => {
                debug!(state = %self.state, "No readable presence entity, holding state");
                return self.state;
            }
        };

        if occupied {
            self.cancel_timers();
            return inputs.secondary_state().unwrap_or(AreaState::Occupied);
        }

        let clear_at = self.clear_timeout;
        let extended_at = self.clear_timeout + self.extended_timeout;
        let elapsed = self.last_off.map(|at| now.saturating_duration_since(at));

        match elapsed {
            Some(elapsed) if elapsed < clear_at => {
                self.clear_timer = Some(now + (clear_at - elapsed));
                match self.state {
                    AreaState::Manual => AreaState::Occupied,
                    state => state,
                }
            }
            Some(elapsed) if elapsed < extended_at => {
                self.clear_timer = None;
                self.extended_timer = Some(now + (extended_at - elapsed));
                AreaState::Extended
            }
            _ => {
                self.cancel_timers();
                AreaState::Clear
            }
        }
    }
}
