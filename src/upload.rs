//! Upload policy and the pending-evidence queue.
//!
//! The kernel does not move bytes; the durable uploader does. This module
//! holds the rules that uploader must honor (retry budget, backoff
//! schedule, network/battery gates, per-upload timeout) and the queue of
//! artifacts awaiting upload. Gating outcomes are data, mirroring the
//! engine's rejection-as-data discipline.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_SECS: [u64; 3] = [120, 300, 600];
const DEFAULT_MIN_BATTERY: f32 = 0.15;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

// -------------------- Gating --------------------

/// Which networks the uploader may use.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkRequirement {
    #[default]
    Any,
    UnmeteredOnly,
}

impl NetworkRequirement {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "unmetered" | "unmetered-only" | "wifi" => Ok(Self::UnmeteredOnly),
            other => Err(anyhow!(
                "unsupported network requirement '{}'; expected 'any' or 'unmetered-only'",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkType {
    Unmetered,
    Metered,
    Offline,
}

/// Device state sampled by the uploader before each attempt.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConditions {
    pub network: NetworkType,
    /// Battery charge fraction 0..=1.
    pub battery_level: f32,
}

/// Whether an upload attempt may proceed right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadGate {
    Allow,
    Defer { why: String },
}

// -------------------- Policy --------------------

/// Retry/backoff and gating rules for the durable uploader.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub max_retries: u32,
    /// Delay before retry N is `backoff[N-1]`, clamped to the last entry.
    pub backoff: Vec<Duration>,
    pub network: NetworkRequirement,
    pub min_battery: f32,
    pub timeout: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            network: NetworkRequirement::default(),
            min_battery: DEFAULT_MIN_BATTERY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.backoff.is_empty() {
            return Err(anyhow!("upload backoff schedule cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.min_battery) {
            return Err(anyhow!("minimum battery level must be a fraction in 0..=1"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("upload timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Delay before the given retry (1-based). `None` once the retry
    /// budget is spent.
    pub fn retry_delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let idx = (retry as usize - 1).min(self.backoff.len() - 1);
        Some(self.backoff[idx])
    }

    /// Gate one attempt on current device conditions. Never errors.
    pub fn gate(&self, conditions: &DeviceConditions) -> UploadGate {
        match (conditions.network, self.network) {
            (NetworkType::Offline, _) => {
                return UploadGate::Defer {
                    why: "device offline".to_string(),
                }
            }
            (NetworkType::Metered, NetworkRequirement::UnmeteredOnly) => {
                return UploadGate::Defer {
                    why: "metered network; unmetered required".to_string(),
                }
            }
            _ => {}
        }
        if conditions.battery_level < self.min_battery {
            return UploadGate::Defer {
                why: format!(
                    "battery {:.0}% below minimum {:.0}%",
                    conditions.battery_level * 100.0,
                    self.min_battery * 100.0
                ),
            };
        }
        UploadGate::Allow
    }
}

// -------------------- Pending Queue --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvidenceKind {
    Snapshot,
    RoomScan,
}

/// One artifact awaiting durable upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingUpload {
    pub artifact_id: String,
    pub kind: EvidenceKind,
    /// Failed attempts so far.
    pub attempts: u32,
    pub next_attempt_at_ms: u64,
}

/// FIFO of artifacts the uploader drains. Failures reschedule per the
/// policy's backoff; an artifact past its retry budget is dropped from
/// the queue (the session record still references it).
pub struct UploadQueue {
    policy: UploadPolicy,
    pending: Vec<PendingUpload>,
}

impl UploadQueue {
    pub fn new(policy: UploadPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, artifact_id: &str, kind: EvidenceKind, now_ms: u64) {
        self.pending.push(PendingUpload {
            artifact_id: artifact_id.to_string(),
            kind,
            attempts: 0,
            next_attempt_at_ms: now_ms,
        });
    }

    /// Next entry whose attempt time has arrived, oldest first.
    pub fn next_due(&self, now_ms: u64) -> Option<&PendingUpload> {
        self.pending
            .iter()
            .find(|entry| entry.next_attempt_at_ms <= now_ms)
    }

    pub fn mark_uploaded(&mut self, artifact_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.artifact_id != artifact_id);
        self.pending.len() != before
    }

    /// Record one failed attempt. Returns false once the artifact has
    /// exhausted its retries and left the queue.
    pub fn mark_failed(&mut self, artifact_id: &str, now_ms: u64) -> bool {
        let Some(entry) = self
            .pending
            .iter_mut()
            .find(|entry| entry.artifact_id == artifact_id)
        else {
            return false;
        };
        entry.attempts += 1;
        match self.policy.retry_delay(entry.attempts) {
            Some(delay) => {
                entry.next_attempt_at_ms = now_ms + delay.as_millis() as u64;
                true
            }
            None => {
                log::warn!(
                    "upload of {} abandoned after {} attempts",
                    artifact_id,
                    entry.attempts
                );
                self.pending.retain(|entry| entry.artifact_id != artifact_id);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[PendingUpload] {
        &self.pending
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_follow_the_schedule() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.retry_delay(1), Some(Duration::from_secs(120)));
        assert_eq!(policy.retry_delay(2), Some(Duration::from_secs(300)));
        assert_eq!(policy.retry_delay(3), Some(Duration::from_secs(600)));
        assert_eq!(policy.retry_delay(4), None);
        assert_eq!(policy.retry_delay(0), None);
    }

    #[test]
    fn gate_defers_on_network_and_battery() {
        let mut policy = UploadPolicy::default();
        let healthy = DeviceConditions {
            network: NetworkType::Unmetered,
            battery_level: 0.9,
        };
        assert_eq!(policy.gate(&healthy), UploadGate::Allow);

        assert!(matches!(
            policy.gate(&DeviceConditions {
                network: NetworkType::Offline,
                battery_level: 0.9,
            }),
            UploadGate::Defer { .. }
        ));

        assert!(matches!(
            policy.gate(&DeviceConditions {
                network: NetworkType::Unmetered,
                battery_level: 0.05,
            }),
            UploadGate::Defer { .. }
        ));

        policy.network = NetworkRequirement::UnmeteredOnly;
        assert!(matches!(
            policy.gate(&DeviceConditions {
                network: NetworkType::Metered,
                battery_level: 0.9,
            }),
            UploadGate::Defer { .. }
        ));
    }

    #[test]
    fn queue_backs_off_then_drops() {
        let mut queue = UploadQueue::new(UploadPolicy::default());
        queue.push("snap:01", EvidenceKind::Snapshot, 1_000);
        assert_eq!(queue.next_due(1_000).unwrap().artifact_id, "snap:01");

        assert!(queue.mark_failed("snap:01", 1_000));
        assert!(queue.next_due(1_000).is_none());
        assert_eq!(queue.next_due(1_000 + 120_000).unwrap().attempts, 1);

        assert!(queue.mark_failed("snap:01", 130_000));
        assert!(queue.mark_failed("snap:01", 500_000));
        // Fourth failure exceeds the 3-retry budget.
        assert!(!queue.mark_failed("snap:01", 1_200_000));
        assert!(queue.is_empty());
    }

    #[test]
    fn uploaded_artifacts_leave_the_queue() {
        let mut queue = UploadQueue::new(UploadPolicy::default());
        queue.push("snap:01", EvidenceKind::Snapshot, 0);
        queue.push("scan:02", EvidenceKind::RoomScan, 0);
        assert!(queue.mark_uploaded("snap:01"));
        assert!(!queue.mark_uploaded("snap:01"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].artifact_id, "scan:02");
    }

    #[test]
    fn network_requirement_parses() {
        assert_eq!(
            NetworkRequirement::parse("unmetered-only").unwrap(),
            NetworkRequirement::UnmeteredOnly
        );
        assert_eq!(NetworkRequirement::parse("ANY").unwrap(), NetworkRequirement::Any);
        assert!(NetworkRequirement::parse("carrier-pigeon").is_err());
    }
}
