//! Priority & escalation engine.
//!
//! One instance per monitored session, owned by the coordinator. The
//! engine answers a single question per detector signal: capture now,
//! and with what consequences? Every negative answer is data, never an
//! error; `evaluate_capture` has no side effects so a debounced detector
//! may re-evaluate the same signal freely, and `record_capture` is the
//! only mutation point. Readers observe state through copy-on-write
//! snapshots and never see a partial update.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::MonitorConfig;
use crate::{now_ms, PriorityTier, SnapshotReason, ViolationAction, ViolationType};

// -------------------- Decision --------------------

/// Why a capture was not approved. Only quota exhaustion is worth a log
/// line; tier and cooldown rejections are expected and high-frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionCause {
    QuotaExhausted,
    TierInactive,
    CooldownPending { remaining_ms: u64 },
}

impl RejectionCause {
    pub fn loggable(self) -> bool {
        matches!(self, RejectionCause::QuotaExhausted)
    }
}

impl fmt::Display for RejectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionCause::QuotaExhausted => write!(f, "snapshot quota exhausted"),
            RejectionCause::TierInactive => {
                write!(f, "tier inactive for current quota consumption")
            }
            RejectionCause::CooldownPending { remaining_ms } => {
                write!(f, "cooldown pending, {} ms remaining", remaining_ms)
            }
        }
    }
}

/// Outcome of evaluating one detector signal. Callers match exhaustively;
/// there is no error path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureDecision {
    Approved {
        tier: PriorityTier,
        violation: Option<ViolationType>,
        action: ViolationAction,
        /// Set only for critical-tier decisions that crossed a warning
        /// threshold; high-tier warnings surface through `action`.
        should_show_warning: bool,
    },
    Rejected {
        cause: RejectionCause,
    },
}

// -------------------- Published State --------------------

/// Per-violation running counts. A fixed struct rather than a map so the
/// published copy and the committed counters can never drift.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ViolationCounts {
    pub multiple_faces: u32,
    pub no_face: u32,
    pub looking_away: u32,
    pub face_distance: u32,
}

impl ViolationCounts {
    pub fn get(&self, violation: ViolationType) -> u32 {
        match violation {
            ViolationType::MultipleFaces => self.multiple_faces,
            ViolationType::NoFaceDetected => self.no_face,
            ViolationType::LookingAway => self.looking_away,
            ViolationType::FaceDistance => self.face_distance,
        }
    }

    fn bump(&mut self, violation: ViolationType) {
        match violation {
            ViolationType::MultipleFaces => self.multiple_faces += 1,
            ViolationType::NoFaceDetected => self.no_face += 1,
            ViolationType::LookingAway => self.looking_away += 1,
            ViolationType::FaceDistance => self.face_distance += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.multiple_faces + self.no_face + self.looking_away + self.face_distance
    }
}

/// Which tiers may still capture. Narrows as the quota depletes so the
/// highest-confidence violations can still be evidenced near the end.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct TierSet {
    pub critical: bool,
    pub high: bool,
    pub normal: bool,
}

impl TierSet {
    pub const ALL: TierSet = TierSet {
        critical: true,
        high: true,
        normal: true,
    };

    pub fn contains(self, tier: PriorityTier) -> bool {
        match tier {
            PriorityTier::Critical => self.critical,
            PriorityTier::High => self.high,
            PriorityTier::Normal => self.normal,
        }
    }

    /// Deterministic narrowing table, purely a function of snapshots taken.
    pub fn for_taken(taken: u32, cfg: &MonitorConfig) -> TierSet {
        TierSet {
            critical: true,
            high: taken <= cfg.high_tier_cutoff,
            normal: taken <= cfg.normal_tier_cutoff,
        }
    }
}

/// Immutable snapshot of the engine's state, published copy-on-write.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct EngineState {
    pub taken: u32,
    pub remaining: u32,
    pub active_tiers: TierSet,
    pub can_capture: bool,
    pub violation_counts: ViolationCounts,
    pub should_auto_submit: bool,
}

impl EngineState {
    fn fresh(cfg: &MonitorConfig) -> Self {
        Self {
            taken: 0,
            remaining: cfg.max_snapshots,
            active_tiers: TierSet::ALL,
            can_capture: true,
            violation_counts: ViolationCounts::default(),
            should_auto_submit: false,
        }
    }
}

/// Cheap-to-clone read handle. The writer swaps in a fresh `Arc` per
/// commit; readers on the UI path grab the current one and never block
/// the writer for longer than the pointer swap.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<RwLock<Arc<EngineState>>>,
}

impl StateHandle {
    fn new(initial: EngineState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn snapshot(&self) -> Arc<EngineState> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, state: EngineState) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(state);
    }
}

// -------------------- Engine --------------------

/// Session-scoped capture decision state. Never a process-wide singleton:
/// concurrent attempts on one device get independent instances.
pub struct PriorityEngine {
    cfg: MonitorConfig,
    taken: u32,
    last_capture_ms: BTreeMap<SnapshotReason, u64>,
    counts: ViolationCounts,
    auto_submit: bool,
    state: StateHandle,
}

impl PriorityEngine {
    pub fn new(cfg: MonitorConfig) -> Self {
        let state = StateHandle::new(EngineState::fresh(&cfg));
        Self {
            cfg,
            taken: 0,
            last_capture_ms: BTreeMap::new(),
            counts: ViolationCounts::default(),
            auto_submit: false,
            state,
        }
    }

    /// Evaluate one detector signal against current state. Pure read:
    /// repeated evaluation of the same signal returns the same decision.
    pub fn evaluate_capture(&self, reason: SnapshotReason) -> CaptureDecision {
        self.evaluate_capture_at(reason, now_ms())
    }

    pub fn evaluate_capture_at(&self, reason: SnapshotReason, now_ms: u64) -> CaptureDecision {
        if self.taken >= self.cfg.max_snapshots {
            return CaptureDecision::Rejected {
                cause: RejectionCause::QuotaExhausted,
            };
        }

        let tier = reason.tier();
        if !TierSet::for_taken(self.taken, &self.cfg).contains(tier) {
            return CaptureDecision::Rejected {
                cause: RejectionCause::TierInactive,
            };
        }

        let cooldown_ms = self.cfg.cooldown_ms(tier);
        if cooldown_ms > 0 {
            if let Some(last) = self.last_capture_ms.get(&reason) {
                let elapsed = now_ms.saturating_sub(*last);
                if elapsed < cooldown_ms {
                    return CaptureDecision::Rejected {
                        cause: RejectionCause::CooldownPending {
                            remaining_ms: cooldown_ms - elapsed,
                        },
                    };
                }
            }
        }

        let violation = reason.violation();
        let action = self.action_for(violation);
        let should_show_warning =
            tier == PriorityTier::Critical && action == ViolationAction::CaptureWithWarning;

        CaptureDecision::Approved {
            tier,
            violation,
            action,
            should_show_warning,
        }
    }

    /// Escalation ladder, evaluated against the provisional count the
    /// commit would reach. Counters are session-lifetime.
    fn action_for(&self, violation: Option<ViolationType>) -> ViolationAction {
        let Some(violation) = violation else {
            return ViolationAction::Capture;
        };
        let n = self.counts.get(violation) + 1;
        match violation {
            ViolationType::MultipleFaces => {
                if n >= self.cfg.multiple_faces_max {
                    ViolationAction::ForceSubmit
                } else if n >= self.cfg.multiple_faces_warn_at {
                    ViolationAction::CaptureWithWarning
                } else {
                    ViolationAction::Capture
                }
            }
            ViolationType::NoFaceDetected => {
                if n >= self.cfg.no_face_max {
                    ViolationAction::ForceSubmit
                } else if n >= self.cfg.no_face_warn_from {
                    ViolationAction::CaptureWithWarning
                } else {
                    ViolationAction::Capture
                }
            }
            // Gaze drift warns once frequent but never ends an attempt
            // on its own.
            ViolationType::LookingAway => {
                if n >= self.cfg.looking_away_warn_count {
                    ViolationAction::CaptureWithWarning
                } else {
                    ViolationAction::LogOnly
                }
            }
            ViolationType::FaceDistance => ViolationAction::LogOnly,
        }
    }

    /// Commit the effects of an approved decision: stamp the cooldown,
    /// commit the violation counter, consume quota for capturing actions
    /// (a `LogOnly` outcome records the violation without a snapshot),
    /// recompute the tier set and the sticky auto-submit flag, publish.
    pub fn record_capture(&mut self, reason: SnapshotReason) -> Arc<EngineState> {
        self.record_capture_at(reason, now_ms())
    }

    pub fn record_capture_at(&mut self, reason: SnapshotReason, now_ms: u64) -> Arc<EngineState> {
        let violation = reason.violation();
        let action = self.action_for(violation);

        self.last_capture_ms.insert(reason, now_ms);
        if let Some(violation) = violation {
            self.counts.bump(violation);
        }
        if action != ViolationAction::LogOnly {
            self.taken = (self.taken + 1).min(self.cfg.max_snapshots);
        }

        let crossed = self.counts.multiple_faces >= self.cfg.multiple_faces_max
            || self.counts.no_face >= self.cfg.no_face_max;
        if crossed && !self.auto_submit {
            log::warn!(
                "escalation threshold crossed (multiple_faces={}, no_face={}); forcing submission",
                self.counts.multiple_faces,
                self.counts.no_face
            );
        }
        self.auto_submit = self.auto_submit || crossed;

        self.publish()
    }

    /// Restore the freshly-constructed state. Session start only, never
    /// mid-session.
    pub fn reset(&mut self) -> Arc<EngineState> {
        self.taken = 0;
        self.last_capture_ms.clear();
        self.counts = ViolationCounts::default();
        self.auto_submit = false;
        self.publish()
    }

    pub fn state(&self) -> Arc<EngineState> {
        self.state.snapshot()
    }

    /// Clone a read handle for the UI-refresh path.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    fn publish(&mut self) -> Arc<EngineState> {
        let state = EngineState {
            taken: self.taken,
            remaining: self.cfg.max_snapshots - self.taken,
            active_tiers: TierSet::for_taken(self.taken, &self.cfg),
            can_capture: self.taken < self.cfg.max_snapshots,
            violation_counts: self.counts,
            should_auto_submit: self.auto_submit,
        };
        self.state.publish(state);
        self.state.snapshot()
    }
}
