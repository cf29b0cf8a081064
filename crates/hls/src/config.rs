//! HSO configuration, following the nested `HlsConfig`/`HlsPlaylistConfig`/
//! `HlsFetcherConfig` layering the teacher uses, sized to the knobs SPEC_FULL
//! §6/§8 names for the orchestrator.

use std::time::Duration;

use crate::error::HlsError;

/// Policy for picking the initial/adaptive variant, mirroring the teacher's
/// `HlsVariantSelectionPolicy` shape. Defaults to `LowestBitrate` here (see
/// DESIGN.md Open Question #4) so the orchestrator starts at the bottom of
/// the ladder per HLS recommended practice.
#[derive(Debug, Clone, Default)]
pub enum HlsVariantSelectionPolicy {
    HighestBitrate,
    #[default]
    LowestBitrate,
    ClosestToBitrate(u64),
    AudioOnly,
    VideoOnly,
    MatchingResolution { width: u32, height: u32 },
    Custom(String),
}

/// Top-level configuration for the HLS Segment Orchestrator.
#[derive(Debug, Clone)]
pub struct HlsOrchestratorConfig {
    /// Prefetch depth; bound of the CacheQueue. Schema-clamped to ≥ 2.
    pub fragments_cache: usize,
    /// Adaptation hysteresis coefficient, `L = targetduration * tol`.
    pub bitrate_switch_tolerance: f64,
    /// Variant selection / adaptation starting policy.
    pub variant_selection_policy: HlsVariantSelectionPolicy,
    /// Minimum interval between live-playlist refreshes.
    pub live_refresh_interval: Duration,
    /// Refresh backoff factor schedule applied to `update_failed_count`.
    pub refresh_backoff_factors: Vec<f64>,
    /// Timeout for the initial playlist fetch.
    pub initial_playlist_fetch_timeout: Duration,
}

impl Default for HlsOrchestratorConfig {
    fn default() -> Self {
        Self {
            fragments_cache: 3,
            bitrate_switch_tolerance: 0.4,
            variant_selection_policy: HlsVariantSelectionPolicy::default(),
            live_refresh_interval: Duration::from_secs(1),
            refresh_backoff_factors: vec![0.5, 1.5, 3.0, 3.0],
            initial_playlist_fetch_timeout: Duration::from_secs(15),
        }
    }
}

impl HlsOrchestratorConfig {
    /// Validates numeric knobs per §8's boundary behaviours ("setting 0 or 1
    /// is rejected by the schema").
    pub fn validate(&self) -> Result<(), HlsError> {
        if self.fragments_cache < 2 {
            return Err(HlsError::configuration(format!(
                "fragments_cache must be >= 2, got {}",
                self.fragments_cache
            )));
        }
        if !(0.0..=1.0).contains(&self.bitrate_switch_tolerance) {
            return Err(HlsError::configuration(format!(
                "bitrate_switch_tolerance must be in [0,1], got {}",
                self.bitrate_switch_tolerance
            )));
        }
        if self.refresh_backoff_factors.is_empty() {
            return Err(HlsError::configuration(
                "refresh_backoff_factors must not be empty",
            ));
        }
        Ok(())
    }

    /// The backoff factor for a given `update_failed_count`, repeating the
    /// last configured factor once the schedule is exhausted.
    pub fn backoff_factor(&self, update_failed_count: u32) -> f64 {
        let idx = (update_failed_count as usize).min(self.refresh_backoff_factors.len() - 1);
        self.refresh_backoff_factors[idx]
    }
}
