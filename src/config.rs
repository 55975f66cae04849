use anyhow::{anyhow, Result};
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::upload::{NetworkRequirement, UploadPolicy};
use crate::PriorityTier;

const DEFAULT_MAX_SNAPSHOTS: u32 = 10;
const DEFAULT_CRITICAL_COOLDOWN_MS: u64 = 0;
const DEFAULT_HIGH_COOLDOWN_MS: u64 = 30_000;
const DEFAULT_NORMAL_COOLDOWN_MS: u64 = 300_000;
const DEFAULT_MULTIPLE_FACES_WARN_AT: u32 = 2;
const DEFAULT_MULTIPLE_FACES_MAX: u32 = 3;
const DEFAULT_NO_FACE_WARN_FROM: u32 = 3;
const DEFAULT_NO_FACE_MAX: u32 = 5;
const DEFAULT_LOOKING_AWAY_WARN_COUNT: u32 = 3;
const DEFAULT_NORMAL_TIER_CUTOFF: u32 = 5;
const DEFAULT_HIGH_TIER_CUTOFF: u32 = 8;
const DEFAULT_MIN_EXAM_SECS: u64 = 15 * 60;
const DEFAULT_RECORDING_WINDOW_EARLY: f64 = 0.15;
const DEFAULT_RECORDING_WINDOW_LATE: f64 = 0.85;
const DEFAULT_RECORDING_SECS: u64 = 30;
const DEFAULT_VIDEO_BITRATE_BPS: u64 = 2_000_000;
const DEFAULT_AUDIO_BITRATE_BPS: u64 = 128_000;
const DEFAULT_COMPRESSION_QUALITY: f64 = 0.8;
const DEFAULT_SNAPSHOT_BUDGET_BYTES: u64 = 512 * 1024;
const DEFAULT_SNAPSHOT_WIDTH: u32 = 640;
const DEFAULT_SNAPSHOT_HEIGHT: u32 = 480;
const DEFAULT_SNAPSHOT_QUALITY: u8 = 80;
const DEFAULT_STORAGE_SAFETY_MARGIN: f64 = 1.2;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    snapshots: Option<SnapshotsConfigFile>,
    escalation: Option<EscalationConfigFile>,
    room_scan: Option<RoomScanConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotsConfigFile {
    max: Option<u32>,
    high_cooldown_ms: Option<u64>,
    normal_cooldown_ms: Option<u64>,
    budget_bytes: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct EscalationConfigFile {
    no_face_max: Option<u32>,
    looking_away_warn_count: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RoomScanConfigFile {
    min_exam_secs: Option<u64>,
    recording_secs: Option<u64>,
    video_bitrate_bps: Option<u64>,
    audio_bitrate_bps: Option<u64>,
    compression_quality: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    max_retries: Option<u32>,
    backoff_secs: Option<Vec<u64>>,
    require_unmetered: Option<bool>,
    min_battery: Option<f32>,
    timeout_secs: Option<u64>,
}

/// Static monitoring policy: quotas, cooldowns, escalation thresholds,
/// room-scan scheduling window, media budgets, upload policy.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_snapshots: u32,
    pub critical_cooldown_ms: u64,
    pub high_cooldown_ms: u64,
    pub normal_cooldown_ms: u64,
    /// Second committed multiple-faces occurrence warns; `multiple_faces_max`
    /// forces submission.
    pub multiple_faces_warn_at: u32,
    pub multiple_faces_max: u32,
    pub no_face_warn_from: u32,
    pub no_face_max: u32,
    pub looking_away_warn_count: u32,
    /// Normal tier stays active while snapshots taken <= this cutoff.
    pub normal_tier_cutoff: u32,
    /// High tier stays active while snapshots taken <= this cutoff.
    pub high_tier_cutoff: u32,
    pub min_exam_duration: Duration,
    pub recording_window_early: f64,
    pub recording_window_late: f64,
    pub recording_duration: Duration,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub compression_quality: f64,
    pub snapshot_budget_bytes: u64,
    pub snapshot_width: u32,
    pub snapshot_height: u32,
    pub snapshot_quality: u8,
    pub storage_safety_margin: f64,
    pub upload: UploadPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            critical_cooldown_ms: DEFAULT_CRITICAL_COOLDOWN_MS,
            high_cooldown_ms: DEFAULT_HIGH_COOLDOWN_MS,
            normal_cooldown_ms: DEFAULT_NORMAL_COOLDOWN_MS,
            multiple_faces_warn_at: DEFAULT_MULTIPLE_FACES_WARN_AT,
            multiple_faces_max: DEFAULT_MULTIPLE_FACES_MAX,
            no_face_warn_from: DEFAULT_NO_FACE_WARN_FROM,
            no_face_max: DEFAULT_NO_FACE_MAX,
            looking_away_warn_count: DEFAULT_LOOKING_AWAY_WARN_COUNT,
            normal_tier_cutoff: DEFAULT_NORMAL_TIER_CUTOFF,
            high_tier_cutoff: DEFAULT_HIGH_TIER_CUTOFF,
            min_exam_duration: Duration::from_secs(DEFAULT_MIN_EXAM_SECS),
            recording_window_early: DEFAULT_RECORDING_WINDOW_EARLY,
            recording_window_late: DEFAULT_RECORDING_WINDOW_LATE,
            recording_duration: Duration::from_secs(DEFAULT_RECORDING_SECS),
            video_bitrate_bps: DEFAULT_VIDEO_BITRATE_BPS,
            audio_bitrate_bps: DEFAULT_AUDIO_BITRATE_BPS,
            compression_quality: DEFAULT_COMPRESSION_QUALITY,
            snapshot_budget_bytes: DEFAULT_SNAPSHOT_BUDGET_BYTES,
            snapshot_width: DEFAULT_SNAPSHOT_WIDTH,
            snapshot_height: DEFAULT_SNAPSHOT_HEIGHT,
            snapshot_quality: DEFAULT_SNAPSHOT_QUALITY,
            storage_safety_margin: DEFAULT_STORAGE_SAFETY_MARGIN,
            upload: UploadPolicy::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from the file named by `PROCTOR_CONFIG` (JSON,
    /// all fields optional), then apply env overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(snapshots) = file.snapshots {
            if let Some(max) = snapshots.max {
                cfg.max_snapshots = max;
            }
            if let Some(ms) = snapshots.high_cooldown_ms {
                cfg.high_cooldown_ms = ms;
            }
            if let Some(ms) = snapshots.normal_cooldown_ms {
                cfg.normal_cooldown_ms = ms;
            }
            if let Some(bytes) = snapshots.budget_bytes {
                cfg.snapshot_budget_bytes = bytes;
            }
            if let Some(width) = snapshots.width {
                cfg.snapshot_width = width;
            }
            if let Some(height) = snapshots.height {
                cfg.snapshot_height = height;
            }
            if let Some(quality) = snapshots.quality {
                cfg.snapshot_quality = quality;
            }
        }
        if let Some(escalation) = file.escalation {
            if let Some(max) = escalation.no_face_max {
                cfg.no_face_max = max;
            }
            if let Some(count) = escalation.looking_away_warn_count {
                cfg.looking_away_warn_count = count;
            }
        }
        if let Some(room_scan) = file.room_scan {
            if let Some(secs) = room_scan.min_exam_secs {
                cfg.min_exam_duration = Duration::from_secs(secs);
            }
            if let Some(secs) = room_scan.recording_secs {
                cfg.recording_duration = Duration::from_secs(secs);
            }
            if let Some(bps) = room_scan.video_bitrate_bps {
                cfg.video_bitrate_bps = bps;
            }
            if let Some(bps) = room_scan.audio_bitrate_bps {
                cfg.audio_bitrate_bps = bps;
            }
            if let Some(quality) = room_scan.compression_quality {
                cfg.compression_quality = quality;
            }
        }
        if let Some(upload) = file.upload {
            if let Some(retries) = upload.max_retries {
                cfg.upload.max_retries = retries;
            }
            if let Some(secs) = upload.backoff_secs {
                cfg.upload.backoff = secs.into_iter().map(Duration::from_secs).collect();
            }
            if let Some(true) = upload.require_unmetered {
                cfg.upload.network = NetworkRequirement::UnmeteredOnly;
            }
            if let Some(level) = upload.min_battery {
                cfg.upload.min_battery = level;
            }
            if let Some(secs) = upload.timeout_secs {
                cfg.upload.timeout = Duration::from_secs(secs);
            }
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("PROCTOR_MAX_SNAPSHOTS") {
            self.max_snapshots = raw
                .parse()
                .map_err(|_| anyhow!("PROCTOR_MAX_SNAPSHOTS must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("PROCTOR_NO_FACE_MAX") {
            self.no_face_max = raw
                .parse()
                .map_err(|_| anyhow!("PROCTOR_NO_FACE_MAX must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("PROCTOR_MIN_EXAM_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|_| anyhow!("PROCTOR_MIN_EXAM_SECS must be an integer number of seconds"))?;
            self.min_exam_duration = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("PROCTOR_UPLOAD_RETRIES") {
            self.upload.max_retries = raw
                .parse()
                .map_err(|_| anyhow!("PROCTOR_UPLOAD_RETRIES must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("PROCTOR_REQUIRE_UNMETERED") {
            if raw == "1" || raw.eq_ignore_ascii_case("true") {
                self.upload.network = NetworkRequirement::UnmeteredOnly;
            }
        }
        if let Ok(raw) = std::env::var("PROCTOR_MIN_BATTERY") {
            self.upload.min_battery = raw
                .parse()
                .map_err(|_| anyhow!("PROCTOR_MIN_BATTERY must be a fraction in 0..=1"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_snapshots == 0 {
            return Err(anyhow!("snapshot quota must be >= 1"));
        }
        if self.normal_tier_cutoff > self.high_tier_cutoff {
            return Err(anyhow!(
                "normal tier cutoff ({}) cannot exceed high tier cutoff ({})",
                self.normal_tier_cutoff,
                self.high_tier_cutoff
            ));
        }
        if self.high_tier_cutoff >= self.max_snapshots {
            return Err(anyhow!(
                "high tier cutoff ({}) must be below the snapshot quota ({})",
                self.high_tier_cutoff,
                self.max_snapshots
            ));
        }
        if !(0.0..1.0).contains(&self.recording_window_early)
            || !(0.0..1.0).contains(&self.recording_window_late)
            || self.recording_window_early >= self.recording_window_late
        {
            return Err(anyhow!("recording window fractions must satisfy 0 <= early < late < 1"));
        }
        if !(0.0..=1.0).contains(&self.compression_quality) || self.compression_quality == 0.0 {
            return Err(anyhow!("compression quality must be in (0, 1]"));
        }
        if self.multiple_faces_warn_at >= self.multiple_faces_max {
            return Err(anyhow!("multiple-faces warn threshold must be below its maximum"));
        }
        if self.no_face_warn_from >= self.no_face_max {
            return Err(anyhow!("no-face warn threshold must be below its maximum"));
        }
        if self.looking_away_warn_count == 0 {
            return Err(anyhow!("looking-away warn count must be >= 1"));
        }
        self.upload.validate()?;
        Ok(())
    }

    pub fn cooldown_ms(&self, tier: PriorityTier) -> u64 {
        match tier {
            PriorityTier::Critical => self.critical_cooldown_ms,
            PriorityTier::High => self.high_cooldown_ms,
            PriorityTier::Normal => self.normal_cooldown_ms,
        }
    }

    // -------------------- Calculators --------------------

    /// Pick the random point in the exam window at which the one-shot room
    /// scan records. `None` means the exam is too short to scan. Recording
    /// at an unpredictable offset deters timing around it; the very start
    /// and end of the window are avoided because little is visible there.
    pub fn random_recording_offset(&self, exam_duration: Duration) -> Option<Duration> {
        if exam_duration < self.min_exam_duration {
            return None;
        }
        let total_ms = exam_duration.as_millis() as u64;
        let lo = (total_ms as f64 * self.recording_window_early) as u64;
        let hi = (total_ms as f64 * self.recording_window_late) as u64;
        let offset_ms = rand::thread_rng().gen_range(lo..=hi);
        Some(Duration::from_millis(offset_ms))
    }

    /// Expected encoded size of a recording of the given duration, from the
    /// configured bitrate budgets. Used for storage pre-checks only.
    pub fn expected_recording_size(&self, duration: Duration) -> u64 {
        let bytes_per_sec = (self.video_bitrate_bps + self.audio_bitrate_bps) / 8;
        let raw = bytes_per_sec as f64 * duration.as_secs_f64();
        (raw * self.compression_quality) as u64
    }

    /// Worst-case recording size, ignoring the compression discount.
    pub fn max_recording_size(&self) -> u64 {
        let bytes_per_sec = (self.video_bitrate_bps + self.audio_bitrate_bps) / 8;
        bytes_per_sec * self.recording_duration.as_secs()
    }

    /// Conservative storage gate: max video size plus the full snapshot
    /// quota at budget, per session, inflated by the safety margin.
    /// Never errors.
    pub fn has_enough_storage(&self, available_bytes: u64, session_count: u64) -> bool {
        let per_session =
            self.max_recording_size() + self.max_snapshots as u64 * self.snapshot_budget_bytes;
        let needed = per_session as f64 * session_count as f64 * self.storage_safety_margin;
        available_bytes as f64 >= needed
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
