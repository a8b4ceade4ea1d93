//! Throughput and pending-growth over a metrics window.

use batchgrid_state::{MetricsSnapshot, WindowView};

/// Load figures averaged over consecutive snapshot pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkloadStats {
    /// Containers released per interval.
    pub throughput: f32,
    /// Pending containers added per interval beyond what free memory will
    /// absorb. Only growth counts; shrinking backlogs contribute zero.
    pub pending_growth: f32,
    /// Number of snapshot pairs averaged.
    pub pairs: usize,
}

impl WorkloadStats {
    /// Compute stats for a window. `None` with fewer than two snapshots.
    pub fn from_window(window: &WindowView<MetricsSnapshot>) -> Option<Self> {
        Self::from_snapshots(window.values())
    }

    pub fn from_snapshots<'a>(
        snapshots: impl IntoIterator<Item = &'a MetricsSnapshot>,
    ) -> Option<Self> {
        let mut prev: Option<&MetricsSnapshot> = None;
        let mut throughput = 0.0f32;
        let mut pending_growth = 0.0f32;
        let mut pairs = 0usize;

        for snap in snapshots {
            if let Some(prev) = prev {
                throughput += snap
                    .aggregate_containers_released
                    .saturating_sub(prev.aggregate_containers_released)
                    as f32;
                let growth = unabsorbed_growth(snap, prev);
                if growth > 0 {
                    pending_growth += growth as f32;
                }
                pairs += 1;
            }
            prev = Some(snap);
        }

        if pairs == 0 {
            return None;
        }
        Some(Self {
            throughput: throughput / pairs as f32,
            pending_growth: pending_growth / pairs as f32,
            pairs,
        })
    }

    /// Throughput minus pending growth. Higher is better.
    pub fn performance(&self) -> f32 {
        self.throughput - self.pending_growth
    }
}

/// Pending containers in `snap` that available memory cannot absorb,
/// minus the pending count of `prev`.
fn unabsorbed_growth(snap: &MetricsSnapshot, prev: &MetricsSnapshot) -> i32 {
    if snap.pending_containers <= 0 {
        return 0;
    }
    let mb_per_container = snap.pending_mb / snap.pending_containers;
    let will_consume = if mb_per_container > 0 {
        snap.available_mb / mb_per_container
    } else {
        0
    };
    snap.pending_containers
        .saturating_sub(will_consume)
        .saturating_sub(prev.pending_containers)
}
