//! Cloud anchor service that needs no backend.
//!
//! Hosting encodes the pose into the cloud id:
//!
//! ```text
//! offline:<16 x 8 hex digits, the f32 bits of each matrix cell>:<uuid>
//! ```
//!
//! The trailing UUID makes every hosting call return a fresh id, even for
//! the same pose.  Resolving parses the pose back out.  Because both devices
//! see the same pose, the "shared" anchor sits at the same coordinates in
//! both tracking frames, which is what a real service would arrange.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arpet_core::domain::anchor::POSE_LEN;
use arpet_core::Pose;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::application::cloud_anchor::{CloudAnchorService, CloudServiceError};

const PREFIX: &str = "offline:";
const CELL_HEX: usize = 8;

/// A [`CloudAnchorService`] that round-trips poses through the id.
#[derive(Debug)]
pub struct OfflineCloudService {
    online: AtomicBool,
    latency: Duration,
}

impl Default for OfflineCloudService {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineCloudService {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            latency: Duration::ZERO,
        }
    }

    /// Delays every host and resolve call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulates losing or regaining internet access.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    async fn round_trip(&self) -> Result<(), CloudServiceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.has_internet_connection() {
            Ok(())
        } else {
            Err(CloudServiceError::Offline)
        }
    }
}

fn encode_id(pose: &Pose) -> String {
    let mut id = String::with_capacity(PREFIX.len() + POSE_LEN * CELL_HEX + 33);
    id.push_str(PREFIX);
    for cell in pose.as_array() {
        // Writing to a String cannot fail.
        let _ = write!(id, "{:08x}", cell.to_bits());
    }
    id.push(':');
    id.push_str(&Uuid::new_v4().simple().to_string());
    id
}

fn decode_id(cloud_id: &str) -> Option<Pose> {
    let (cells, suffix) = cloud_id.strip_prefix(PREFIX)?.split_once(':')?;
    if cells.len() != POSE_LEN * CELL_HEX || Uuid::parse_str(suffix).is_err() {
        return None;
    }

    let mut matrix = [0f32; POSE_LEN];
    for (i, cell) in matrix.iter_mut().enumerate() {
        let hex = cells.get(i * CELL_HEX..(i + 1) * CELL_HEX)?;
        *cell = f32::from_bits(u32::from_str_radix(hex, 16).ok()?);
    }
    Some(Pose(matrix))
}

#[async_trait]
impl CloudAnchorService for OfflineCloudService {
    fn has_internet_connection(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    async fn host_anchor(&self, pose: Pose) -> Result<String, CloudServiceError> {
        self.round_trip().await?;
        let id = encode_id(&pose);
        debug!("hosted offline anchor {id}");
        Ok(id)
    }

    async fn resolve_anchor(&self, cloud_id: &str) -> Result<Pose, CloudServiceError> {
        self.round_trip().await?;
        decode_id(cloud_id).ok_or_else(|| CloudServiceError::NotFound(cloud_id.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
