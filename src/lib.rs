//! Exam Integrity Kernel (EIK)
//!
//! This crate implements the client-side decision core for proctored online
//! assessments: when to capture evidence, how repeated violations escalate,
//! and how captured artifacts are queued for durable upload.
//!
//! # Architecture
//!
//! The kernel enforces four invariants by construction:
//!
//! 1. **Quota**: a session never commits more snapshots than its quota.
//! 2. **Narrowing**: the active priority-tier set is a deterministic,
//!    monotonically-narrowing function of snapshots taken; only `reset`
//!    widens it.
//! 3. **Sticky auto-submit**: once a session crosses the forced-submission
//!    threshold the flag never clears without an explicit `reset`.
//! 4. **Rejection as data**: every negative capture outcome is a value,
//!    never an error; the detector loop cannot be destabilized by expected
//!    rejections.
//!
//! # Module Structure
//!
//! - `config`: policy constants, the pure calculators, file/env loading
//! - `evidence`: snapshot / room-scan / violation descriptors, session record
//! - `engine`: the priority & escalation engine and its published state
//! - `session`: the session coordinator driving the engine per signal
//! - `upload`: upload policy, device-condition gating, pending queue

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod engine;
pub mod evidence;
pub mod session;
pub mod upload;

pub use config::MonitorConfig;
pub use engine::{
    CaptureDecision, EngineState, PriorityEngine, RejectionCause, StateHandle, TierSet,
    ViolationCounts,
};
pub use evidence::{
    MonitoringSession, RoomScanRecording, SessionMetrics, SnapshotMeta, SnapshotRecord,
    VideoMeta, ViolationEvent,
};
pub use session::{
    CapturePipeline, RoomScanRequest, SessionCoordinator, SignalOutcome, SnapshotRequest,
    SubmissionHandler,
};
pub use upload::{
    DeviceConditions, EvidenceKind, NetworkRequirement, NetworkType, PendingUpload, UploadGate,
    UploadPolicy, UploadQueue,
};

// -------------------- Proctoring Signals --------------------

/// A condition reported by the external face/gaze detector, one per call.
/// Rate limiting is the engine's job, not the detector's.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnapshotReason {
    MultipleFaces,
    NoFace,
    LookingAway,
    FaceTooFar,
    FaceTooClose,
    PeriodicCheck,
    RandomVerification,
}

/// Priority tier governing cooldown length and eligibility as the snapshot
/// quota depletes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PriorityTier {
    Critical,
    High,
    Normal,
}

/// A proctoring-relevant condition, distinct from routine sampling.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ViolationType {
    MultipleFaces,
    NoFaceDetected,
    LookingAway,
    FaceDistance,
}

/// What the escalation ladder demands for one committed occurrence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ViolationAction {
    /// Record the violation only; no snapshot, no quota consumption.
    LogOnly,
    Capture,
    CaptureWithWarning,
    ForceSubmit,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    #[default]
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl SnapshotReason {
    /// Fixed reason -> tier table. Multiple/no face are the
    /// highest-confidence cheating signals and capture immediately;
    /// gaze/distance signals are ambiguous and rate-limited; routine
    /// sampling sits at the bottom.
    pub fn tier(self) -> PriorityTier {
        match self {
            SnapshotReason::MultipleFaces | SnapshotReason::NoFace => PriorityTier::Critical,
            SnapshotReason::LookingAway
            | SnapshotReason::FaceTooFar
            | SnapshotReason::FaceTooClose => PriorityTier::High,
            SnapshotReason::PeriodicCheck | SnapshotReason::RandomVerification => {
                PriorityTier::Normal
            }
        }
    }

    /// Fixed reason -> violation table. Periodic/random checks map to none.
    pub fn violation(self) -> Option<ViolationType> {
        match self {
            SnapshotReason::MultipleFaces => Some(ViolationType::MultipleFaces),
            SnapshotReason::NoFace => Some(ViolationType::NoFaceDetected),
            SnapshotReason::LookingAway => Some(ViolationType::LookingAway),
            SnapshotReason::FaceTooFar | SnapshotReason::FaceTooClose => {
                Some(ViolationType::FaceDistance)
            }
            SnapshotReason::PeriodicCheck | SnapshotReason::RandomVerification => None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "multiple_faces" | "multiple-faces" => Ok(Self::MultipleFaces),
            "no_face" | "no-face" => Ok(Self::NoFace),
            "looking_away" | "looking-away" => Ok(Self::LookingAway),
            "face_too_far" | "too-far" => Ok(Self::FaceTooFar),
            "face_too_close" | "too-close" => Ok(Self::FaceTooClose),
            "periodic_check" | "periodic" => Ok(Self::PeriodicCheck),
            "random_verification" | "random" => Ok(Self::RandomVerification),
            other => Err(anyhow!(
                "unknown snapshot reason '{}'; expected one of 'multiple_faces', 'no_face', \
                 'looking_away', 'face_too_far', 'face_too_close', 'periodic_check', \
                 'random_verification'",
                other
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotReason::MultipleFaces => "multiple_faces",
            SnapshotReason::NoFace => "no_face",
            SnapshotReason::LookingAway => "looking_away",
            SnapshotReason::FaceTooFar => "face_too_far",
            SnapshotReason::FaceTooClose => "face_too_close",
            SnapshotReason::PeriodicCheck => "periodic_check",
            SnapshotReason::RandomVerification => "random_verification",
        }
    }
}

impl ViolationType {
    pub fn describe(self) -> &'static str {
        match self {
            ViolationType::MultipleFaces => "multiple faces detected in frame",
            ViolationType::NoFaceDetected => "no face detected in frame",
            ViolationType::LookingAway => "student looking away from screen",
            ViolationType::FaceDistance => "face too far from or too close to camera",
        }
    }
}

// -------------------- Id Discipline --------------------

/// A conforming id is a scoped local identifier: `session:attempt_42`,
/// `exam:calc_101_final`, `student:u8842`. Free-form ids leak through
/// upload metadata, so we enforce a positive allowlist pattern.
pub fn validate_scoped_id(scope: &str, id: &str) -> Result<()> {
    // Compile once for hot paths.
    static SCOPED_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        SCOPED_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z]+:[a-z0-9_-]{1,64}$").unwrap());

    let lowered = id.to_lowercase();
    if !re.is_match(&lowered) || !lowered.starts_with(&format!("{}:", scope)) {
        return Err(anyhow!(
            "id '{}' must match ^{}:[a-z0-9_-]{{1,64}}$",
            id,
            scope
        ));
    }
    Ok(())
}

/// Random evidence id, e.g. `snap:9f2c4a1d0e6b8735`.
pub fn evidence_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}:{:016x}", prefix, u64::from_le_bytes(bytes))
}

// -------------------- Clock --------------------

/// Milliseconds since the Unix epoch. The engine's own `*_at` variants take
/// an explicit timestamp so tests never sleep.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_reason_maps_to_exactly_one_tier_and_at_most_one_violation() {
        let cases = [
            (SnapshotReason::MultipleFaces, PriorityTier::Critical),
            (SnapshotReason::NoFace, PriorityTier::Critical),
            (SnapshotReason::LookingAway, PriorityTier::High),
            (SnapshotReason::FaceTooFar, PriorityTier::High),
            (SnapshotReason::FaceTooClose, PriorityTier::High),
            (SnapshotReason::PeriodicCheck, PriorityTier::Normal),
            (SnapshotReason::RandomVerification, PriorityTier::Normal),
        ];
        for (reason, tier) in cases {
            assert_eq!(reason.tier(), tier, "{:?}", reason);
        }
        assert_eq!(SnapshotReason::PeriodicCheck.violation(), None);
        assert_eq!(SnapshotReason::RandomVerification.violation(), None);
        assert_eq!(
            SnapshotReason::FaceTooFar.violation(),
            SnapshotReason::FaceTooClose.violation()
        );
    }

    #[test]
    fn scoped_ids_enforce_allowlist() {
        assert!(validate_scoped_id("session", "session:attempt_42").is_ok());
        assert!(validate_scoped_id("session", "SESSION:ATTEMPT_42").is_ok());
        assert!(validate_scoped_id("exam", "session:attempt_42").is_err());
        assert!(validate_scoped_id("session", "session:has spaces").is_err());
        assert!(validate_scoped_id("student", "student:").is_err());
    }

    #[test]
    fn reason_parse_round_trips() {
        for reason in [
            SnapshotReason::MultipleFaces,
            SnapshotReason::NoFace,
            SnapshotReason::LookingAway,
            SnapshotReason::FaceTooFar,
            SnapshotReason::FaceTooClose,
            SnapshotReason::PeriodicCheck,
            SnapshotReason::RandomVerification,
        ] {
            assert_eq!(SnapshotReason::parse(reason.as_str()).unwrap(), reason);
        }
        assert!(SnapshotReason::parse("telepathy").is_err());
    }

    #[test]
    fn evidence_ids_are_prefixed_and_unique() {
        let a = evidence_id("snap");
        let b = evidence_id("snap");
        assert!(a.starts_with("snap:"));
        assert_ne!(a, b);
    }
}
