//! Evidence descriptors and the per-attempt session record.
//!
//! Everything here is plain data shaped for the storage and upload
//! collaborators. Descriptors are immutable after creation except for
//! upload-status transitions; the session record owns its snapshot and
//! violation lists exclusively and refuses mutation once closed.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    validate_scoped_id, PriorityTier, SnapshotReason, UploadStatus, ViolationAction,
    ViolationType,
};

// -------------------- Snapshot --------------------

/// Capture-technical metadata stamped by the capture pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMeta {
    pub width: u32,
    pub height: u32,
    /// JPEG quality 1..=100.
    pub quality: u8,
    pub face_detected: bool,
    pub face_count: u32,
    /// Detector confidence 0..=1 for the primary face.
    pub confidence: f32,
    pub looking_away: bool,
}

/// One front-camera capture committed under an approved decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub session_id: String,
    pub exam_id: String,
    pub student_id: String,
    pub file_path: String,
    /// Set by the storage collaborator once the plain file is sealed.
    pub encrypted_path: Option<String>,
    pub size_bytes: u64,
    pub captured_at_ms: u64,
    pub reason: SnapshotReason,
    pub tier: PriorityTier,
    pub violation: Option<ViolationType>,
    pub upload_status: UploadStatus,
    pub uploaded_at_ms: Option<u64>,
    pub meta: SnapshotMeta,
}

impl SnapshotRecord {
    pub fn mark_uploading(&mut self) {
        self.upload_status = UploadStatus::Uploading;
    }

    pub fn mark_uploaded(&mut self, now_ms: u64) {
        self.upload_status = UploadStatus::Uploaded;
        self.uploaded_at_ms = Some(now_ms);
    }

    pub fn mark_upload_failed(&mut self) {
        self.upload_status = UploadStatus::Failed;
    }
}

// -------------------- Room Scan --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u64,
}

/// The single scheduled back-camera recording for a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomScanRecording {
    pub id: String,
    pub session_id: String,
    pub exam_id: String,
    pub student_id: String,
    pub file_path: String,
    pub encrypted_path: Option<String>,
    pub size_bytes: u64,
    pub duration_ms: u64,
    /// Offset from session start at which the scan was scheduled.
    pub scheduled_offset_ms: u64,
    pub recorded_at_ms: u64,
    pub upload_status: UploadStatus,
    pub uploaded_at_ms: Option<u64>,
    pub compression_ratio: f32,
    pub meta: VideoMeta,
}

impl RoomScanRecording {
    pub fn mark_uploaded(&mut self, now_ms: u64) {
        self.upload_status = UploadStatus::Uploaded;
        self.uploaded_at_ms = Some(now_ms);
    }
}

// -------------------- Violations --------------------

/// One committed violation occurrence. Append-only within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: String,
    pub occurred_at_ms: u64,
    pub violation: ViolationType,
    pub tier: PriorityTier,
    pub description: String,
    pub action: ViolationAction,
    /// Snapshot that evidenced this violation, when one was captured.
    pub snapshot_id: Option<String>,
}

// -------------------- Metrics --------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub snapshots_taken: u32,
    pub violations_recorded: u32,
    pub warnings_shown: u32,
    pub room_scan_recorded: bool,
    pub auto_submitted: bool,
    pub bytes_captured: u64,
}

// -------------------- Session Record --------------------

/// One exam attempt under observation. The session exclusively owns its
/// snapshot and violation lists; collaborators append through the methods
/// below, never directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringSession {
    pub session_id: String,
    pub exam_id: String,
    pub student_id: String,
    pub started_at_ms: u64,
    pub exam_duration: Duration,
    snapshot_quota: u32,
    room_scan: Option<RoomScanRecording>,
    snapshots: Vec<SnapshotRecord>,
    violations: Vec<ViolationEvent>,
    pub metrics: SessionMetrics,
    closed: bool,
}

impl MonitoringSession {
    pub fn new(
        session_id: &str,
        exam_id: &str,
        student_id: &str,
        started_at_ms: u64,
        exam_duration: Duration,
        snapshot_quota: u32,
    ) -> Result<Self> {
        validate_scoped_id("session", session_id)?;
        validate_scoped_id("exam", exam_id)?;
        validate_scoped_id("student", student_id)?;
        if exam_duration.is_zero() {
            return Err(anyhow!("exam duration must be greater than zero"));
        }
        if snapshot_quota == 0 {
            return Err(anyhow!("snapshot quota must be >= 1"));
        }
        Ok(Self {
            session_id: session_id.to_lowercase(),
            exam_id: exam_id.to_lowercase(),
            student_id: student_id.to_lowercase(),
            started_at_ms,
            exam_duration,
            snapshot_quota,
            room_scan: None,
            snapshots: Vec::new(),
            violations: Vec::new(),
            metrics: SessionMetrics::default(),
            closed: false,
        })
    }

    pub fn append_snapshot(&mut self, snapshot: SnapshotRecord) -> Result<()> {
        self.ensure_open()?;
        if snapshot.session_id != self.session_id {
            return Err(anyhow!(
                "snapshot {} belongs to {}, not {}",
                snapshot.id,
                snapshot.session_id,
                self.session_id
            ));
        }
        if self.snapshots.len() as u32 >= self.snapshot_quota {
            return Err(anyhow!(
                "snapshot quota ({}) already consumed for {}",
                self.snapshot_quota,
                self.session_id
            ));
        }
        self.metrics.snapshots_taken += 1;
        self.metrics.bytes_captured += snapshot.size_bytes;
        self.snapshots.push(snapshot);
        Ok(())
    }

    pub fn append_violation(&mut self, violation: ViolationEvent) -> Result<()> {
        self.ensure_open()?;
        self.metrics.violations_recorded += 1;
        self.violations.push(violation);
        Ok(())
    }

    pub fn set_room_scan(&mut self, recording: RoomScanRecording) -> Result<()> {
        self.ensure_open()?;
        if self.room_scan.is_some() {
            return Err(anyhow!(
                "room scan already recorded for {}",
                self.session_id
            ));
        }
        self.metrics.room_scan_recorded = true;
        self.metrics.bytes_captured += recording.size_bytes;
        self.room_scan = Some(recording);
        Ok(())
    }

    /// Close the attempt. The record is immutable afterwards.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot_quota(&self) -> u32 {
        self.snapshot_quota
    }

    pub fn room_scan(&self) -> Option<&RoomScanRecording> {
        self.room_scan.as_ref()
    }

    pub fn snapshots(&self) -> &[SnapshotRecord] {
        &self.snapshots
    }

    pub fn violations(&self) -> &[ViolationEvent] {
        &self.violations
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(anyhow!("session {} is closed", self.session_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence_id;

    fn test_session(quota: u32) -> MonitoringSession {
        MonitoringSession::new(
            "session:attempt_1",
            "exam:calc_101",
            "student:u8842",
            1_000,
            Duration::from_secs(3600),
            quota,
        )
        .expect("session")
    }

    fn test_snapshot(session_id: &str) -> SnapshotRecord {
        SnapshotRecord {
            id: evidence_id("snap"),
            session_id: session_id.to_string(),
            exam_id: "exam:calc_101".to_string(),
            student_id: "student:u8842".to_string(),
            file_path: "/evidence/snap.jpg".to_string(),
            encrypted_path: None,
            size_bytes: 48_000,
            captured_at_ms: 2_000,
            reason: SnapshotReason::PeriodicCheck,
            tier: PriorityTier::Normal,
            violation: None,
            upload_status: UploadStatus::Pending,
            uploaded_at_ms: None,
            meta: SnapshotMeta {
                width: 640,
                height: 480,
                quality: 80,
                face_detected: true,
                face_count: 1,
                confidence: 0.93,
                looking_away: false,
            },
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(MonitoringSession::new(
            "attempt_1",
            "exam:calc_101",
            "student:u8842",
            0,
            Duration::from_secs(3600),
            10,
        )
        .is_err());
        assert!(MonitoringSession::new(
            "session:attempt_1",
            "exam:calc 101",
            "student:u8842",
            0,
            Duration::from_secs(3600),
            10,
        )
        .is_err());
    }

    #[test]
    fn quota_bounds_committed_snapshots() {
        let mut session = test_session(2);
        session
            .append_snapshot(test_snapshot("session:attempt_1"))
            .unwrap();
        session
            .append_snapshot(test_snapshot("session:attempt_1"))
            .unwrap();
        assert!(session
            .append_snapshot(test_snapshot("session:attempt_1"))
            .is_err());
        assert_eq!(session.snapshots().len(), 2);
        assert_eq!(session.metrics.snapshots_taken, 2);
        assert_eq!(session.metrics.bytes_captured, 96_000);
    }

    #[test]
    fn snapshot_ownership_is_checked() {
        let mut session = test_session(10);
        assert!(session
            .append_snapshot(test_snapshot("session:someone_else"))
            .is_err());
    }

    #[test]
    fn at_most_one_room_scan() {
        let mut session = test_session(10);
        let recording = RoomScanRecording {
            id: evidence_id("scan"),
            session_id: session.session_id.clone(),
            exam_id: session.exam_id.clone(),
            student_id: session.student_id.clone(),
            file_path: "/evidence/scan.mp4".to_string(),
            encrypted_path: None,
            size_bytes: 6_000_000,
            duration_ms: 30_000,
            scheduled_offset_ms: 600_000,
            recorded_at_ms: 601_000,
            upload_status: UploadStatus::Pending,
            uploaded_at_ms: None,
            compression_ratio: 0.8,
            meta: VideoMeta {
                width: 1280,
                height: 720,
                fps: 30,
                bitrate_bps: 2_000_000,
            },
        };
        session.set_room_scan(recording.clone()).unwrap();
        assert!(session.set_room_scan(recording).is_err());
        assert!(session.metrics.room_scan_recorded);
    }

    #[test]
    fn closed_session_rejects_appends() {
        let mut session = test_session(10);
        session.close();
        assert!(session.is_closed());
        assert!(session
            .append_snapshot(test_snapshot("session:attempt_1"))
            .is_err());
        assert!(session
            .append_violation(ViolationEvent {
                id: evidence_id("viol"),
                occurred_at_ms: 3_000,
                violation: ViolationType::LookingAway,
                tier: PriorityTier::High,
                description: ViolationType::LookingAway.describe().to_string(),
                action: ViolationAction::LogOnly,
                snapshot_id: None,
            })
            .is_err());
    }

    #[test]
    fn upload_status_transitions_stamp_timestamps() {
        let mut snapshot = test_snapshot("session:attempt_1");
        snapshot.mark_uploading();
        assert_eq!(snapshot.upload_status, UploadStatus::Uploading);
        snapshot.mark_uploaded(9_000);
        assert_eq!(snapshot.upload_status, UploadStatus::Uploaded);
        assert_eq!(snapshot.uploaded_at_ms, Some(9_000));
    }
}
