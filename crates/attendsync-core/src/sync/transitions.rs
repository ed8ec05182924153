//! Resolve decision table.
//!
//! `decide` maps the phase of a request and facts gathered from local
//! state to the action the orchestrator takes. Rows are checked in order
//! and the first match wins; every phase ends with a catch-all row.

use crate::policy::RefreshAge;

/// Where a request falls in time. Future months are rejected before the
/// table is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PastMonth,
    CurrentWeekend,
    CurrentPreSchool,
    CurrentConsolidated,
    /// Check-in window or full window of a school day.
    CurrentPolling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PastMonth => "PAST_MONTH",
            Phase::CurrentWeekend => "CURRENT_WEEKEND",
            Phase::CurrentPreSchool => "CURRENT_PRE_SCHOOL",
            Phase::CurrentConsolidated => "CURRENT_CONSOLIDATED",
            Phase::CurrentPolling => "CURRENT_POLLING",
        }
    }
}

/// Local-only facts. Computing them performs no remote I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facts {
    /// At least one direction is stored for the month.
    pub aggregate_present: bool,
    /// Entry and exit agree on completed school days.
    pub in_sync: bool,
    pub polled_in_current_band: bool,
    pub refresh_age: Option<RefreshAge>,
    /// Recent school days are covered by the check-in aggregate.
    pub coverage: bool,
    pub weekend_carryover_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ServeLocal,
    RefetchHistory,
    /// Wipe both directions, then refetch.
    RepairAndRefetch,
    RefetchThenPollToday,
    PollToday,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ServeLocal => "SERVE_LOCAL",
            Action::RefetchHistory => "REFETCH_HISTORY",
            Action::RepairAndRefetch => "REPAIR_AND_REFETCH",
            Action::RefetchThenPollToday => "REFETCH_THEN_POLL_TODAY",
            Action::PollToday => "POLL_TODAY",
        }
    }
}

pub struct Transition {
    pub phase: Phase,
    pub when: fn(&Facts) -> bool,
    pub action: Action,
    pub reason: &'static str,
}

fn always(_: &Facts) -> bool {
    true
}

fn no_aggregate(f: &Facts) -> bool {
    !f.aggregate_present
}

fn out_of_sync(f: &Facts) -> bool {
    !f.in_sync
}

fn polled(f: &Facts) -> bool {
    f.polled_in_current_band
}

fn finalized(f: &Facts) -> bool {
    f.refresh_age == Some(RefreshAge::Later)
}

fn refreshed_same_month(f: &Facts) -> bool {
    f.refresh_age == Some(RefreshAge::Same)
}

fn covered(f: &Facts) -> bool {
    f.coverage
}

fn not_covered(f: &Facts) -> bool {
    !f.coverage
}

fn carryover(f: &Facts) -> bool {
    f.weekend_carryover_complete
}

pub static TRANSITIONS: &[Transition] = &[
    // Past month
    Transition {
        phase: Phase::PastMonth,
        when: no_aggregate,
        action: Action::RefetchHistory,
        reason: "no local aggregate",
    },
    Transition {
        phase: Phase::PastMonth,
        when: out_of_sync,
        action: Action::RepairAndRefetch,
        reason: "entry and exit disagree on school days",
    },
    Transition {
        phase: Phase::PastMonth,
        when: polled,
        action: Action::ServeLocal,
        reason: "already refreshed in the current band",
    },
    Transition {
        phase: Phase::PastMonth,
        when: finalized,
        action: Action::ServeLocal,
        reason: "refreshed after the month ended",
    },
    Transition {
        phase: Phase::PastMonth,
        when: refreshed_same_month,
        action: Action::RefetchHistory,
        reason: "refreshed while the month was open",
    },
    Transition {
        phase: Phase::PastMonth,
        when: always,
        action: Action::RefetchHistory,
        reason: "refreshed before the month started",
    },
    // Current month, weekend
    Transition {
        phase: Phase::CurrentWeekend,
        when: no_aggregate,
        action: Action::RefetchHistory,
        reason: "no local aggregate",
    },
    Transition {
        phase: Phase::CurrentWeekend,
        when: polled,
        action: Action::ServeLocal,
        reason: "already refreshed in the current band",
    },
    Transition {
        phase: Phase::CurrentWeekend,
        when: covered,
        action: Action::ServeLocal,
        reason: "recent school days covered",
    },
    Transition {
        phase: Phase::CurrentWeekend,
        when: carryover,
        action: Action::ServeLocal,
        reason: "friday end-of-day state already held",
    },
    Transition {
        phase: Phase::CurrentWeekend,
        when: always,
        action: Action::RefetchHistory,
        reason: "weekend gap must come from history",
    },
    // Current month, school day, before the check-in window
    Transition {
        phase: Phase::CurrentPreSchool,
        when: no_aggregate,
        action: Action::RefetchHistory,
        reason: "no local aggregate",
    },
    Transition {
        phase: Phase::CurrentPreSchool,
        when: covered,
        action: Action::ServeLocal,
        reason: "recent school days covered",
    },
    Transition {
        phase: Phase::CurrentPreSchool,
        when: polled,
        action: Action::ServeLocal,
        reason: "already refreshed in the current band",
    },
    Transition {
        phase: Phase::CurrentPreSchool,
        when: always,
        action: Action::RefetchHistory,
        reason: "recent school days missing",
    },
    // Current month, school day, consolidated
    Transition {
        phase: Phase::CurrentConsolidated,
        when: always,
        action: Action::RefetchHistory,
        reason: "today folded into history",
    },
    // Current month, school day, check-in or full window
    Transition {
        phase: Phase::CurrentPolling,
        when: no_aggregate,
        action: Action::RefetchThenPollToday,
        reason: "no local aggregate",
    },
    Transition {
        phase: Phase::CurrentPolling,
        when: polled,
        action: Action::PollToday,
        reason: "already refreshed in the current band",
    },
    Transition {
        phase: Phase::CurrentPolling,
        when: not_covered,
        action: Action::RefetchThenPollToday,
        reason: "recent school days missing",
    },
    Transition {
        phase: Phase::CurrentPolling,
        when: always,
        action: Action::PollToday,
        reason: "history sufficient, complete today",
    },
];

static FALLBACK: Transition = Transition {
    phase: Phase::CurrentConsolidated,
    when: always,
    action: Action::RefetchHistory,
    reason: "no rule matched",
};

pub fn decide(phase: Phase, facts: &Facts) -> &'static Transition {
    TRANSITIONS
        .iter()
        .find(|t| t.phase == phase && (t.when)(facts))
        .unwrap_or(&FALLBACK)
}
