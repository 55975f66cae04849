//! Session coordinator: drives the engine against detector signals.
//!
//! The coordinator owns one `MonitoringSession` and one `PriorityEngine`
//! and is the single logical writer for both. Detector signals may arrive
//! bursty from a background analysis thread; the caller hands them to
//! `handle_signal` one at a time, and evaluate + record for one signal
//! complete before the next begins (`&mut self` enforces the critical
//! section). The capture hardware, encoder, and forced-submission surface
//! sit behind trait seams.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::MonitorConfig;
use crate::engine::{CaptureDecision, EngineState, PriorityEngine, RejectionCause, StateHandle};
use crate::evidence::{MonitoringSession, RoomScanRecording, SnapshotRecord, ViolationEvent};
use crate::upload::{EvidenceKind, UploadQueue};
use crate::{
    evidence_id, now_ms, PriorityTier, SnapshotReason, ViolationAction, ViolationType,
};

// -------------------- Collaborator Seams --------------------

/// Parameters for one approved front-camera capture.
#[derive(Clone, Debug)]
pub struct SnapshotRequest<'a> {
    pub session_id: &'a str,
    pub exam_id: &'a str,
    pub student_id: &'a str,
    pub reason: SnapshotReason,
    pub tier: PriorityTier,
    pub violation: Option<ViolationType>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub now_ms: u64,
}

/// Parameters for the one-shot room scan.
#[derive(Clone, Debug)]
pub struct RoomScanRequest<'a> {
    pub session_id: &'a str,
    pub exam_id: &'a str,
    pub student_id: &'a str,
    pub duration: Duration,
    pub scheduled_offset_ms: u64,
    pub expected_size_bytes: u64,
    pub now_ms: u64,
}

/// The external capture pipeline: camera hardware plus encoder. Failures
/// are infrastructure-level and handled by the coordinator; they never
/// consume quota.
pub trait CapturePipeline {
    fn capture_snapshot(&mut self, request: &SnapshotRequest<'_>) -> Result<SnapshotRecord>;
    fn record_room_scan(&mut self, request: &RoomScanRequest<'_>) -> Result<RoomScanRecording>;
}

/// The exam-session lifecycle surface. Invoked exactly once per session,
/// on the false -> true transition of the auto-submit flag.
pub trait SubmissionHandler {
    fn force_submit(&mut self, session_id: &str, why: &str) -> Result<()>;
}

/// What happened to one detector signal.
#[derive(Clone, Debug)]
pub enum SignalOutcome {
    /// A snapshot was captured and committed.
    Captured {
        snapshot_id: String,
        warning: bool,
        forced_submit: bool,
    },
    /// The violation was recorded without a snapshot (logged only).
    Logged { violation: ViolationType },
    /// Expected rejection; nothing committed.
    Dropped { cause: RejectionCause },
    /// The capture pipeline failed; nothing committed, quota untouched.
    CaptureFailed,
}

// -------------------- Coordinator --------------------

pub struct SessionCoordinator {
    cfg: MonitorConfig,
    session: MonitoringSession,
    engine: PriorityEngine,
    uploads: UploadQueue,
    submission: Box<dyn SubmissionHandler>,
    room_scan_offset: Option<Duration>,
    room_scan_attempted: bool,
    auto_submit_fired: bool,
}

impl SessionCoordinator {
    /// Start monitoring one attempt. Consults the storage gate, schedules
    /// the room scan at a random in-window offset, and builds a fresh
    /// engine (per-session state, never shared across attempts).
    pub fn start(
        cfg: MonitorConfig,
        session_id: &str,
        exam_id: &str,
        student_id: &str,
        exam_duration: Duration,
        available_storage_bytes: u64,
        submission: Box<dyn SubmissionHandler>,
    ) -> Result<Self> {
        if !cfg.has_enough_storage(available_storage_bytes, 1) {
            return Err(anyhow!(
                "insufficient storage to monitor {}: {} bytes available",
                session_id,
                available_storage_bytes
            ));
        }
        let session = MonitoringSession::new(
            session_id,
            exam_id,
            student_id,
            now_ms(),
            exam_duration,
            cfg.max_snapshots,
        )?;

        let room_scan_offset = cfg.random_recording_offset(exam_duration);
        match room_scan_offset {
            Some(offset) => log::info!(
                "room scan for {} scheduled {}s into the exam",
                session.session_id,
                offset.as_secs()
            ),
            None => log::info!(
                "exam shorter than {}s; room scan skipped for {}",
                cfg.min_exam_duration.as_secs(),
                session.session_id
            ),
        }

        let engine = PriorityEngine::new(cfg.clone());
        let uploads = UploadQueue::new(cfg.upload.clone());
        Ok(Self {
            cfg,
            session,
            engine,
            uploads,
            submission,
            room_scan_offset,
            room_scan_attempted: false,
            auto_submit_fired: false,
        })
    }

    /// Handle one detector signal end to end.
    pub fn handle_signal(
        &mut self,
        reason: SnapshotReason,
        pipeline: &mut dyn CapturePipeline,
    ) -> Result<SignalOutcome> {
        self.handle_signal_at(reason, pipeline, now_ms())
    }

    pub fn handle_signal_at(
        &mut self,
        reason: SnapshotReason,
        pipeline: &mut dyn CapturePipeline,
        now_ms: u64,
    ) -> Result<SignalOutcome> {
        if self.session.is_closed() {
            return Err(anyhow!(
                "signal delivered to closed session {}",
                self.session.session_id
            ));
        }

        let decision = self.engine.evaluate_capture_at(reason, now_ms);
        let (tier, violation, action, should_show_warning) = match decision {
            CaptureDecision::Rejected { cause } => {
                if cause.loggable() {
                    log::debug!(
                        "capture rejected for {} ({}): {}",
                        self.session.session_id,
                        reason.as_str(),
                        cause
                    );
                }
                return Ok(SignalOutcome::Dropped { cause });
            }
            CaptureDecision::Approved {
                tier,
                violation,
                action,
                should_show_warning,
            } => (tier, violation, action, should_show_warning),
        };

        if action == ViolationAction::LogOnly {
            self.engine.record_capture_at(reason, now_ms);
            // LogOnly decisions always carry a violation; routine checks
            // are never logged-only.
            let violation = violation
                .ok_or_else(|| anyhow!("logged-only decision without a violation type"))?;
            self.session.append_violation(ViolationEvent {
                id: evidence_id("viol"),
                occurred_at_ms: now_ms,
                violation,
                tier,
                description: violation.describe().to_string(),
                action,
                snapshot_id: None,
            })?;
            return Ok(SignalOutcome::Logged { violation });
        }

        let request = SnapshotRequest {
            session_id: &self.session.session_id,
            exam_id: &self.session.exam_id,
            student_id: &self.session.student_id,
            reason,
            tier,
            violation,
            width: self.cfg.snapshot_width,
            height: self.cfg.snapshot_height,
            quality: self.cfg.snapshot_quality,
            now_ms,
        };
        let snapshot = match pipeline.capture_snapshot(&request) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!(
                    "snapshot capture failed for {} ({}): {:#}",
                    self.session.session_id,
                    reason.as_str(),
                    err
                );
                return Ok(SignalOutcome::CaptureFailed);
            }
        };

        let state = self.engine.record_capture_at(reason, now_ms);
        let snapshot_id = snapshot.id.clone();
        if let Some(violation) = violation {
            self.session.append_violation(ViolationEvent {
                id: evidence_id("viol"),
                occurred_at_ms: now_ms,
                violation,
                tier,
                description: violation.describe().to_string(),
                action,
                snapshot_id: Some(snapshot_id.clone()),
            })?;
        }
        self.session.append_snapshot(snapshot)?;
        self.uploads
            .push(&snapshot_id, EvidenceKind::Snapshot, now_ms);

        let warning = should_show_warning || action == ViolationAction::CaptureWithWarning;
        if warning {
            self.session.metrics.warnings_shown += 1;
        }

        let forced_submit = self.fire_auto_submit_once(&state)?;
        Ok(SignalOutcome::Captured {
            snapshot_id,
            warning,
            forced_submit,
        })
    }

    /// Fire the one-shot room scan if its scheduled offset has elapsed.
    /// Returns true when a recording was committed this call.
    pub fn poll_room_scan(&mut self, pipeline: &mut dyn CapturePipeline) -> Result<bool> {
        self.poll_room_scan_at(pipeline, now_ms())
    }

    pub fn poll_room_scan_at(
        &mut self,
        pipeline: &mut dyn CapturePipeline,
        now_ms: u64,
    ) -> Result<bool> {
        if self.session.is_closed() || self.room_scan_attempted {
            return Ok(false);
        }
        let Some(offset) = self.room_scan_offset else {
            return Ok(false);
        };
        let due_at = self.session.started_at_ms + offset.as_millis() as u64;
        if now_ms < due_at {
            return Ok(false);
        }

        // One attempt window only; a failed scan is not rescheduled.
        self.room_scan_attempted = true;
        let request = RoomScanRequest {
            session_id: &self.session.session_id,
            exam_id: &self.session.exam_id,
            student_id: &self.session.student_id,
            duration: self.cfg.recording_duration,
            scheduled_offset_ms: offset.as_millis() as u64,
            expected_size_bytes: self.cfg.expected_recording_size(self.cfg.recording_duration),
            now_ms,
        };
        match pipeline.record_room_scan(&request) {
            Ok(recording) => {
                let recording_id = recording.id.clone();
                self.session.set_room_scan(recording)?;
                self.uploads
                    .push(&recording_id, EvidenceKind::RoomScan, now_ms);
                log::info!(
                    "room scan recorded for {} at +{}ms",
                    self.session.session_id,
                    now_ms.saturating_sub(self.session.started_at_ms)
                );
                Ok(true)
            }
            Err(err) => {
                log::warn!(
                    "room scan failed for {}: {:#}",
                    self.session.session_id,
                    err
                );
                Ok(false)
            }
        }
    }

    fn fire_auto_submit_once(&mut self, state: &Arc<EngineState>) -> Result<bool> {
        if !state.should_auto_submit || self.auto_submit_fired {
            return Ok(false);
        }
        self.auto_submit_fired = true;
        self.session.metrics.auto_submitted = true;
        log::warn!(
            "forcing submission of {} after repeated critical violations",
            self.session.session_id
        );
        self.submission
            .force_submit(&self.session.session_id, "repeated critical violations")
            .with_context(|| {
                format!("forced submission of {}", self.session.session_id)
            })?;
        Ok(true)
    }

    pub fn state(&self) -> Arc<EngineState> {
        self.engine.state()
    }

    /// Read handle for the UI-refresh path; safe to poll while signals
    /// are being handled.
    pub fn state_handle(&self) -> StateHandle {
        self.engine.state_handle()
    }

    pub fn session(&self) -> &MonitoringSession {
        &self.session
    }

    pub fn uploads(&mut self) -> &mut UploadQueue {
        &mut self.uploads
    }

    /// End the attempt: the session record becomes immutable and further
    /// signals are refused.
    pub fn close(mut self) -> MonitoringSession {
        self.session.close();
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{SnapshotMeta, VideoMeta};
    use crate::UploadStatus;

    const T0: u64 = 1_700_000_000_000;
    const PLENTY_OF_STORAGE: u64 = 1 << 40;

    /// Capture pipeline that fabricates descriptors, optionally failing.
    struct SyntheticPipeline {
        captures: u32,
        fail_next: bool,
    }

    impl SyntheticPipeline {
        fn new() -> Self {
            Self {
                captures: 0,
                fail_next: false,
            }
        }
    }

    impl CapturePipeline for SyntheticPipeline {
        fn capture_snapshot(&mut self, request: &SnapshotRequest<'_>) -> Result<SnapshotRecord> {
            if self.fail_next {
                self.fail_next = false;
                return Err(anyhow!("camera busy"));
            }
            self.captures += 1;
            Ok(SnapshotRecord {
                id: evidence_id("snap"),
                session_id: request.session_id.to_string(),
                exam_id: request.exam_id.to_string(),
                student_id: request.student_id.to_string(),
                file_path: format!("/evidence/snap_{}.jpg", self.captures),
                encrypted_path: None,
                size_bytes: 50_000,
                captured_at_ms: request.now_ms,
                reason: request.reason,
                tier: request.tier,
                violation: request.violation,
                upload_status: UploadStatus::Pending,
                uploaded_at_ms: None,
                meta: SnapshotMeta {
                    width: request.width,
                    height: request.height,
                    quality: request.quality,
                    face_detected: request.reason != SnapshotReason::NoFace,
                    face_count: if request.reason == SnapshotReason::MultipleFaces {
                        2
                    } else {
                        1
                    },
                    confidence: 0.9,
                    looking_away: request.reason == SnapshotReason::LookingAway,
                },
            })
        }

        fn record_room_scan(
            &mut self,
            request: &RoomScanRequest<'_>,
        ) -> Result<RoomScanRecording> {
            Ok(RoomScanRecording {
                id: evidence_id("scan"),
                session_id: request.session_id.to_string(),
                exam_id: request.exam_id.to_string(),
                student_id: request.student_id.to_string(),
                file_path: "/evidence/room_scan.mp4".to_string(),
                encrypted_path: None,
                size_bytes: request.expected_size_bytes,
                duration_ms: request.duration.as_millis() as u64,
                scheduled_offset_ms: request.scheduled_offset_ms,
                recorded_at_ms: request.now_ms,
                upload_status: UploadStatus::Pending,
                uploaded_at_ms: None,
                compression_ratio: 0.8,
                meta: VideoMeta {
                    width: 1280,
                    height: 720,
                    fps: 30,
                    bitrate_bps: 2_000_000,
                },
            })
        }
    }

    #[derive(Default)]
    struct RecordingSubmission {
        submissions: Vec<String>,
    }

    struct SharedSubmission(std::sync::Arc<std::sync::Mutex<RecordingSubmission>>);

    impl SubmissionHandler for SharedSubmission {
        fn force_submit(&mut self, session_id: &str, _why: &str) -> Result<()> {
            self.0
                .lock()
                .expect("submission lock")
                .submissions
                .push(session_id.to_string());
            Ok(())
        }
    }

    fn coordinator() -> (
        SessionCoordinator,
        std::sync::Arc<std::sync::Mutex<RecordingSubmission>>,
    ) {
        let submissions = std::sync::Arc::new(std::sync::Mutex::new(RecordingSubmission::default()));
        let coordinator = SessionCoordinator::start(
            MonitorConfig::default(),
            "session:attempt_1",
            "exam:calc_101",
            "student:u8842",
            Duration::from_secs(3600),
            PLENTY_OF_STORAGE,
            Box::new(SharedSubmission(submissions.clone())),
        )
        .expect("coordinator");
        (coordinator, submissions)
    }

    #[test]
    fn refuses_to_start_without_storage() {
        let result = SessionCoordinator::start(
            MonitorConfig::default(),
            "session:attempt_1",
            "exam:calc_101",
            "student:u8842",
            Duration::from_secs(3600),
            1024,
            Box::new(SharedSubmission(Default::default())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn captured_signal_commits_snapshot_violation_and_upload() {
        let (mut c, _) = coordinator();
        let mut pipeline = SyntheticPipeline::new();

        let outcome = c
            .handle_signal_at(SnapshotReason::MultipleFaces, &mut pipeline, T0)
            .unwrap();
        let snapshot_id = match outcome {
            SignalOutcome::Captured {
                snapshot_id,
                warning,
                forced_submit,
            } => {
                assert!(!warning);
                assert!(!forced_submit);
                snapshot_id
            }
            other => panic!("expected capture, got {:?}", other),
        };

        let session = c.session();
        assert_eq!(session.snapshots().len(), 1);
        assert_eq!(session.violations().len(), 1);
        assert_eq!(
            session.violations()[0].snapshot_id.as_deref(),
            Some(snapshot_id.as_str())
        );
        assert_eq!(c.state().taken, 1);
        assert_eq!(c.uploads().len(), 1);
    }

    #[test]
    fn pipeline_failure_consumes_no_quota() {
        let (mut c, _) = coordinator();
        let mut pipeline = SyntheticPipeline::new();
        pipeline.fail_next = true;

        let outcome = c
            .handle_signal_at(SnapshotReason::MultipleFaces, &mut pipeline, T0)
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::CaptureFailed));
        assert_eq!(c.state().taken, 0);
        assert_eq!(c.session().snapshots().len(), 0);
        assert_eq!(c.state().violation_counts.multiple_faces, 0);

        // The very next signal is evaluated fresh and captures.
        let outcome = c
            .handle_signal_at(SnapshotReason::MultipleFaces, &mut pipeline, T0)
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Captured { .. }));
    }

    #[test]
    fn forced_submission_fires_exactly_once() {
        let (mut c, submissions) = coordinator();
        let mut pipeline = SyntheticPipeline::new();

        for i in 0..3u64 {
            c.handle_signal_at(SnapshotReason::MultipleFaces, &mut pipeline, T0 + i)
                .unwrap();
        }
        assert!(c.state().should_auto_submit);
        assert!(c.session().metrics.auto_submitted);

        // Further critical captures do not re-submit.
        c.handle_signal_at(SnapshotReason::NoFace, &mut pipeline, T0 + 10)
            .unwrap();
        assert_eq!(
            submissions.lock().unwrap().submissions,
            vec!["session:attempt_1".to_string()]
        );
    }

    #[test]
    fn logged_only_signal_skips_the_pipeline() {
        let (mut c, _) = coordinator();
        let mut pipeline = SyntheticPipeline::new();

        let outcome = c
            .handle_signal_at(SnapshotReason::FaceTooFar, &mut pipeline, T0)
            .unwrap();
        assert!(matches!(
            outcome,
            SignalOutcome::Logged {
                violation: ViolationType::FaceDistance
            }
        ));
        assert_eq!(pipeline.captures, 0);
        assert_eq!(c.session().snapshots().len(), 0);
        assert_eq!(c.session().violations().len(), 1);
        assert_eq!(c.uploads().len(), 0);
    }

    #[test]
    fn room_scan_fires_once_inside_window() {
        let (mut c, _) = coordinator();
        let mut pipeline = SyntheticPipeline::new();
        let started = c.session().started_at_ms;

        // Not due yet at session start.
        assert!(!c.poll_room_scan_at(&mut pipeline, started).unwrap());

        // Well past the latest possible offset (85% of 60 minutes).
        let late = started + 52 * 60 * 1000;
        assert!(c.poll_room_scan_at(&mut pipeline, late).unwrap());
        let scan = c.session().room_scan().expect("room scan");
        assert!(scan.scheduled_offset_ms >= 9 * 60 * 1000);
        assert!(scan.scheduled_offset_ms <= 51 * 60 * 1000);
        assert_eq!(c.uploads().len(), 1);

        // Never a second recording.
        assert!(!c.poll_room_scan_at(&mut pipeline, late + 1000).unwrap());
    }

    #[test]
    fn short_exam_never_schedules_a_scan() {
        let submissions = std::sync::Arc::new(std::sync::Mutex::new(RecordingSubmission::default()));
        let mut c = SessionCoordinator::start(
            MonitorConfig::default(),
            "session:attempt_short",
            "exam:quiz_5",
            "student:u8842",
            Duration::from_secs(10 * 60),
            PLENTY_OF_STORAGE,
            Box::new(SharedSubmission(submissions)),
        )
        .expect("coordinator");
        let mut pipeline = SyntheticPipeline::new();
        let far_future = c.session().started_at_ms + 86_400_000;
        assert!(!c.poll_room_scan_at(&mut pipeline, far_future).unwrap());
        assert!(c.session().room_scan().is_none());
    }

    #[test]
    fn closed_session_refuses_signals() {
        let (c, _) = coordinator();
        let session = c.close();
        assert!(session.is_closed());
    }
}
