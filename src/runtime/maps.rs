//! Map fetch coordinator.
//!
//! When a pose references a frame with no known map, the connector is asked
//! for it in the background. At most one fetch per `(robot_id, frame_id)` is
//! in flight; fetched images are written to a scratch directory that lives
//! until the connector disconnects.

use anyhow::Context;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::context::FleetContext;
use crate::sync::lock;

const SCRATCH_PREFIX: &str = "fleet-connector-maps-";

type PendingSet = Arc<Mutex<HashSet<(String, String)>>>;

enum Scratch {
    Unused,
    Ready(TempDir),
    /// Disconnected; no more files may be written until the next connect.
    Closed,
}

/// Pending fetches and scratch storage of one runtime.
pub(crate) struct MapCoordinator {
    pending: PendingSet,
    scratch: Mutex<Scratch>,
}

/// Claim on a pending fetch, released on drop.
pub(crate) struct PendingFetch {
    pending: PendingSet,
    robot_id: String,
    frame_id: String,
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        lock(&self.pending).remove(&(self.robot_id.clone(), self.frame_id.clone()));
    }
}

impl MapCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            scratch: Mutex::new(Scratch::Unused),
        }
    }

    /// Pending `(robot_id, frame_id)` pairs, sorted.
    pub(crate) fn pending(&self) -> Vec<(String, String)> {
        let mut pending: Vec<_> = lock(&self.pending).iter().cloned().collect();
        pending.sort();
        pending
    }

    /// Mark a fetch as pending. `None` when one is already in flight.
    pub(crate) fn try_claim(&self, robot_id: &str, frame_id: &str) -> Option<PendingFetch> {
        let key = (robot_id.to_string(), frame_id.to_string());
        if !lock(&self.pending).insert(key) {
            return None;
        }
        Some(PendingFetch {
            pending: self.pending.clone(),
            robot_id: robot_id.to_string(),
            frame_id: frame_id.to_string(),
        })
    }

    /// Allow scratch storage again after a previous disconnect.
    pub(crate) fn reopen(&self) {
        let mut scratch = lock(&self.scratch);
        if matches!(*scratch, Scratch::Closed) {
            *scratch = Scratch::Unused;
        }
    }

    /// The scratch directory, created on first use.
    pub(crate) fn scratch_dir(&self) -> std::io::Result<PathBuf> {
        let mut scratch = lock(&self.scratch);
        match &*scratch {
            Scratch::Ready(dir) => Ok(dir.path().to_path_buf()),
            Scratch::Closed => Err(std::io::Error::other(
                "map scratch storage is closed (connector disconnected)",
            )),
            Scratch::Unused => {
                let dir = tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?;
                let path = dir.path().to_path_buf();
                tracing::debug!(path = %path.display(), "Created map scratch directory");
                *scratch = Scratch::Ready(dir);
                Ok(path)
            }
        }
    }

    /// Delete the scratch directory if it was created. Returns its path.
    pub(crate) fn close_scratch(&self) -> Option<PathBuf> {
        let previous = std::mem::replace(&mut *lock(&self.scratch), Scratch::Closed);
        let Scratch::Ready(dir) = previous else {
            return None;
        };
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to remove map scratch directory",
            );
        }
        Some(path)
    }
}

/// File name of a fetched map image inside the scratch directory.
fn map_file_name(frame_id: &str) -> String {
    let stem: String = frame_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.png")
}

/// Schedule a background fetch of the map for `frame_id`.
///
/// Dropped silently (debug log) when no loop is attached, and a no-op when a
/// fetch for the same robot and frame is already pending.
pub(crate) fn schedule_fetch(ctx: &FleetContext, robot_id: &str, frame_id: &str) {
    let Some(handle) = ctx.loop_handle() else {
        tracing::debug!(robot_id, frame_id, "No running loop, dropping map fetch");
        return;
    };
    let Some(claim) = ctx.maps().try_claim(robot_id, frame_id) else {
        tracing::debug!(robot_id, frame_id, "Map fetch already pending");
        return;
    };

    tracing::info!(robot_id, frame_id, "Fetching map");
    let ctx = ctx.clone();
    handle.spawn(async move {
        if let Err(e) = fetch_and_publish(&ctx, &claim.robot_id, &claim.frame_id).await {
            tracing::warn!(
                robot_id = %claim.robot_id,
                frame_id = %claim.frame_id,
                "Map fetch failed: {:#}",
                e
            );
        }
    });
}

async fn fetch_and_publish(
    ctx: &FleetContext,
    robot_id: &str,
    frame_id: &str,
) -> anyhow::Result<()> {
    let fetched = ctx.connector().fetch_map(ctx, robot_id, frame_id).await?;
    let Some(map) = fetched else {
        tracing::info!(robot_id, frame_id, "No map available for frame");
        return Ok(());
    };

    let dir = ctx
        .maps()
        .scratch_dir()
        .context("Failed to prepare map scratch storage")?;
    let path = dir.join(map_file_name(frame_id));
    tokio::fs::write(&path, &map.image)
        .await
        .with_context(|| format!("Failed to write map image to {}", path.display()))?;

    ctx.insert_map(frame_id, map.into_resident(path));
    ctx.publish_robot_map(robot_id, frame_id, true)?;
    Ok(())
}
