//! demo - end-to-end synthetic run for the Exam Integrity Kernel

use anyhow::{anyhow, Result};
use clap::Parser;
use std::time::Duration;

use integrity_kernel::{
    evidence_id, now_ms, CapturePipeline, DeviceConditions, MonitorConfig, NetworkType,
    RoomScanRecording, RoomScanRequest, SessionCoordinator, SignalOutcome, SnapshotMeta,
    SnapshotReason, SnapshotRecord, SnapshotRequest, SubmissionHandler, UploadGate,
    UploadStatus, VideoMeta,
};

const DEFAULT_SIGNALS: &str = "periodic,looking_away,looking_away,no_face,looking_away,\
                               multiple_faces,periodic,multiple_faces,no_face,multiple_faces";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Exam duration in seconds.
    #[arg(long, default_value_t = 3600)]
    duration_secs: u64,
    /// Milliseconds of simulated time between detector signals.
    #[arg(long, default_value_t = 40_000)]
    step_ms: u64,
    /// Comma-separated detector signal script.
    #[arg(long, env = "PROCTOR_SIGNALS")]
    signals: Option<String>,
    /// Available storage reported to the pre-check, in bytes.
    #[arg(long, default_value_t = 1 << 32)]
    storage_bytes: u64,
}

/// Fabricates descriptors instead of touching camera hardware.
struct SyntheticPipeline {
    captures: u32,
}

impl CapturePipeline for SyntheticPipeline {
    fn capture_snapshot(&mut self, request: &SnapshotRequest<'_>) -> Result<SnapshotRecord> {
        self.captures += 1;
        Ok(SnapshotRecord {
            id: evidence_id("snap"),
            session_id: request.session_id.to_string(),
            exam_id: request.exam_id.to_string(),
            student_id: request.student_id.to_string(),
            file_path: format!("demo_out/snap_{:02}.jpg", self.captures),
            encrypted_path: None,
            size_bytes: 48_000,
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

    fn record_room_scan(&mut self, request: &RoomScanRequest<'_>) -> Result<RoomScanRecording> {
        Ok(RoomScanRecording {
            id: evidence_id("scan"),
            session_id: request.session_id.to_string(),
            exam_id: request.exam_id.to_string(),
            student_id: request.student_id.to_string(),
            file_path: "demo_out/room_scan.mp4".to_string(),
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

struct PrintingSubmission;

impl SubmissionHandler for PrintingSubmission {
    fn force_submit(&mut self, session_id: &str, why: &str) -> Result<()> {
        eprintln!("demo: FORCED SUBMISSION of {} ({})", session_id, why);
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.step_ms == 0 {
        return Err(anyhow!("step-ms must be >= 1"));
    }

    let script = args.signals.as_deref().unwrap_or(DEFAULT_SIGNALS);
    let signals = script
        .split(',')
        .map(SnapshotReason::parse)
        .collect::<Result<Vec<_>>>()?;

    stage("start monitoring");
    let cfg = MonitorConfig::load()?;
    let mut coordinator = SessionCoordinator::start(
        cfg,
        "session:demo_attempt",
        "exam:demo_final",
        "student:demo",
        Duration::from_secs(args.duration_secs),
        args.storage_bytes,
        Box::new(PrintingSubmission),
    )?;
    let mut pipeline = SyntheticPipeline { captures: 0 };

    stage("replay detector script");
    let started = now_ms();
    let mut now = started;
    for reason in &signals {
        now += args.step_ms;
        coordinator.poll_room_scan_at(&mut pipeline, now)?;
        let elapsed_s = (now - started) / 1000;
        match coordinator.handle_signal_at(*reason, &mut pipeline, now)? {
            SignalOutcome::Captured {
                snapshot_id,
                warning,
                forced_submit,
            } => {
                eprintln!(
                    "demo: +{:>4}s {:<20} captured {}{}{}",
                    elapsed_s,
                    reason.as_str(),
                    snapshot_id,
                    if warning { " [warning]" } else { "" },
                    if forced_submit { " [forced submit]" } else { "" },
                );
            }
            SignalOutcome::Logged { violation } => {
                eprintln!(
                    "demo: +{:>4}s {:<20} logged ({:?})",
                    elapsed_s,
                    reason.as_str(),
                    violation
                );
            }
            SignalOutcome::Dropped { cause } => {
                eprintln!(
                    "demo: +{:>4}s {:<20} dropped: {}",
                    elapsed_s,
                    reason.as_str(),
                    cause
                );
            }
            SignalOutcome::CaptureFailed => {
                eprintln!(
                    "demo: +{:>4}s {:<20} capture failed",
                    elapsed_s,
                    reason.as_str()
                );
            }
        }
    }

    // Run out the rest of the exam so a late-scheduled room scan fires.
    let exam_end = started + args.duration_secs * 1000;
    coordinator.poll_room_scan_at(&mut pipeline, exam_end)?;

    stage("drain upload queue");
    let healthy = DeviceConditions {
        network: NetworkType::Unmetered,
        battery_level: 0.9,
    };
    let mut uploaded = 0u32;
    while coordinator.uploads().policy().gate(&healthy) == UploadGate::Allow {
        let Some(entry) = coordinator.uploads().next_due(exam_end) else {
            break;
        };
        let artifact_id = entry.artifact_id.clone();
        coordinator.uploads().mark_uploaded(&artifact_id);
        uploaded += 1;
    }

    let state = coordinator.state();
    let session = coordinator.close();

    println!("demo summary:");
    println!("  signals replayed: {}", signals.len());
    println!(
        "  snapshots committed: {} ({} remaining)",
        state.taken, state.remaining
    );
    println!("  violations recorded: {}", session.violations().len());
    println!("  warnings shown: {}", session.metrics.warnings_shown);
    println!(
        "  room scan: {}",
        match session.room_scan() {
            Some(scan) => format!("recorded at +{}s", scan.scheduled_offset_ms / 1000),
            None => "not recorded".to_string(),
        }
    );
    println!("  artifacts uploaded: {}", uploaded);
    println!("  auto-submit: {}", state.should_auto_submit);
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
