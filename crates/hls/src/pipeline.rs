//! Segment pipeline (C3): bounded prefetch cache, Emitter/Updater
//! cooperating tasks, adaptive bitrate switching, and live-refresh backoff.
//! Grounded on `mesio::hls::playlist.rs`'s `monitor_media_playlist`
//! task-loop shape and `AdaptiveRefreshTracker` idiom, but implementing
//! SPEC_FULL §4.3's own exact adaptation rule and backoff schedule.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HlsOrchestratorConfig;
use crate::error::HlsError;
use crate::fetcher::Fetcher;
use crate::playlist::{self, ClientState, NextSegment, Variant};

/// Emitter state machine (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Caching,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CachedSegment {
    pub bytes: Bytes,
    pub duration_ns: i64,
    pub discontinuous: bool,
}

#[derive(Debug)]
pub enum PipelineEvent {
    Segment(CachedSegment),
    VariantChanged { uri: String, bandwidth: u64 },
    /// A fatal error terminated the pipeline (§7 "Surfaced" list); the
    /// Emitter drains whatever is already cached, then this precedes `Eos`.
    Error(HlsError),
    Eos,
}

/// One whole-or-nothing step of the adaptation rule (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptAction {
    StepUp,
    StepDown,
    None,
}

/// Pure adaptation-rule step: `D = scheduled_time - now`, `L = targetduration
/// * tol`. Separated from the task loop so it can be tested without wall
/// clock timing.
pub fn adaptation_step(d_ns: i64, l_ns: i64, accumulated_delay_ns: i64) -> (AdaptAction, i64) {
    if d_ns > l_ns {
        (AdaptAction::StepUp, 0)
    } else if d_ns < 0 {
        let new_acc = accumulated_delay_ns + (-d_ns);
        if new_acc > l_ns {
            (AdaptAction::StepDown, 0)
        } else {
            (AdaptAction::None, new_acc)
        }
    } else {
        let new_acc = (accumulated_delay_ns - d_ns).max(0);
        (AdaptAction::None, new_acc)
    }
}

/// Pure backoff-schedule lookup: `next_update = targetduration * factor`,
/// factor taken from `config.refresh_backoff_factors[update_failed_count]`
/// (clamped to the last entry).
pub fn refresh_backoff(
    target_duration_secs: u64,
    update_failed_count: u32,
    config: &HlsOrchestratorConfig,
) -> Duration {
    let factor = config.backoff_factor(update_failed_count);
    Duration::from_secs_f64(target_duration_secs as f64 * factor)
}

struct CacheQueue {
    items: VecDeque<CachedSegment>,
    capacity: usize,
    end_of_playlist: bool,
}

impl CacheQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            end_of_playlist: false,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

struct Shared {
    queue: Mutex<CacheQueue>,
    not_empty: Notify,
    not_full: Notify,
    state: Mutex<PipelineState>,
    token: CancellationToken,
}

/// Drives one HSO playback session: an Emitter task pops the queue in
/// order; an Updater task refreshes the live playlist, fetches the next
/// segment, and runs the adaptation rule.
pub struct Pipeline {
    config: HlsOrchestratorConfig,
    fetcher: Arc<Fetcher>,
}

impl Pipeline {
    /// Fails with `HlsError::Configuration` if `config` doesn't pass
    /// [`HlsOrchestratorConfig::validate`] (e.g. `fragments_cache` < 2, which
    /// would otherwise panic `mpsc::channel` in [`Pipeline::run`]).
    pub fn new(config: HlsOrchestratorConfig, fetcher: Arc<Fetcher>) -> Result<Self, HlsError> {
        config.validate()?;
        Ok(Self { config, fetcher })
    }

    /// Starts the pipeline against an already-selected variant (`client`)
    /// and the full bandwidth ladder (ascending; empty/single-entry for a
    /// playlist with no master indirection). Returns a receiver of
    /// [`PipelineEvent`]s in strict playback order, terminated by `Eos`.
    pub fn run(
        self,
        client: ClientState,
        ladder: Vec<Variant>,
        token: CancellationToken,
    ) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(self.config.fragments_cache);
        let shared = Arc::new(Shared {
            queue: Mutex::new(CacheQueue::new(self.config.fragments_cache)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            state: Mutex::new(PipelineState::Idle),
            token: token.clone(),
        });

        {
            let shared = Arc::clone(&shared);
            let config = self.config.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let tx = tx.clone();
            tokio::spawn(async move {
                updater_loop(shared, config, fetcher, client, ladder, tx).await;
            });
        }
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                emitter_loop(shared, tx).await;
            });
        }

        rx
    }
}

async fn set_state(shared: &Shared, new_state: PipelineState) {
    *shared.state.lock().await = new_state;
}

async fn emitter_loop(shared: Arc<Shared>, tx: mpsc::Sender<PipelineEvent>) {
    set_state(&shared, PipelineState::Caching).await;
    loop {
        let popped = {
            let mut queue = shared.queue.lock().await;
            queue.items.pop_front()
        };

        let Some(segment) = popped else {
            let is_eos = shared.queue.lock().await.end_of_playlist;
            if is_eos {
                set_state(&shared, PipelineState::Draining).await;
                break;
            }
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => break,
                _ = shared.not_empty.notified() => continue,
            }
        };

        set_state(&shared, PipelineState::Running).await;
        shared.not_full.notify_one();
        if tx.send(PipelineEvent::Segment(segment)).await.is_err() {
            break;
        }
    }

    let _ = tx.send(PipelineEvent::Eos).await;
    set_state(&shared, PipelineState::Stopped).await;
}

async fn updater_loop(
    shared: Arc<Shared>,
    config: HlsOrchestratorConfig,
    fetcher: Arc<Fetcher>,
    mut client: ClientState,
    ladder: Vec<Variant>,
    tx: mpsc::Sender<PipelineEvent>,
) {
    let mut current_idx = ladder
        .iter()
        .position(|v| v.uri == client.variant.uri)
        .unwrap_or(0);
    let mut accumulated_delay_ns: i64 = 0;
    let mut initial_caching = true;

    loop {
        if shared.token.is_cancelled() {
            return;
        }

        let next = playlist::next_segment(&mut client);
        let segment_uri = match next {
            NextSegment::Segment {
                uri,
                duration_ns,
                discontinuous,
            } => Some((uri, duration_ns, discontinuous)),
            NextSegment::EndOfPlaylist => {
                if client.variant.is_live() {
                    if !refresh_live_playlist(&shared, &config, &fetcher, &mut client, &tx).await {
                        return;
                    }
                    continue;
                }
                let mut queue = shared.queue.lock().await;
                queue.end_of_playlist = true;
                shared.not_empty.notify_one();
                return;
            }
        };

        let Some((uri, duration_ns, discontinuous)) = segment_uri else {
            continue;
        };

        let scheduled_at = Instant::now();
        let fetch_result = tokio::select! {
            biased;
            _ = shared.token.cancelled() => return,
            result = fetcher.fetch(&uri) => result,
        };

        let bytes = match fetch_result {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.is_fatal() {
                    if initial_caching {
                        warn!(%uri, error = %e, "could not cache first fragments");
                    } else {
                        warn!(%uri, error = %e, "fragment fetch failed mid-stream");
                    }
                    let fatal = HlsError::fragment_fetch_failed(uri.clone(), e.to_string());
                    let _ = tx.send(PipelineEvent::Error(fatal)).await;
                }
                let mut queue = shared.queue.lock().await;
                queue.end_of_playlist = true;
                shared.not_empty.notify_one();
                return;
            }
        };
        initial_caching = false;

        {
            let mut queue = shared.queue.lock().await;
            while queue.is_full() && !shared.token.is_cancelled() {
                drop(queue);
                tokio::select! {
                    biased;
                    _ = shared.token.cancelled() => return,
                    _ = shared.not_full.notified() => {},
                }
                queue = shared.queue.lock().await;
            }
            queue.items.push_back(CachedSegment {
                bytes,
                duration_ns,
                discontinuous,
            });
        }
        shared.not_empty.notify_one();

        // Adaptation rule: D = scheduled_time - now, measured against the
        // time the download was allowed to start.
        let now = Instant::now();
        let d_ns = duration_ns - now.saturating_duration_since(scheduled_at).as_nanos() as i64;
        let l_ns =
            (client.variant.target_duration_secs as f64 * config.bitrate_switch_tolerance * 1e9)
                as i64;
        let (action, new_acc) = adaptation_step(d_ns, l_ns, accumulated_delay_ns);
        accumulated_delay_ns = new_acc;

        match action {
            AdaptAction::StepUp if current_idx + 1 < ladder.len() => {
                current_idx += 1;
                if let Some((uri, bandwidth)) =
                    switch_variant(&fetcher, &mut client, &ladder, current_idx).await
                {
                    let _ = tx.send(PipelineEvent::VariantChanged { uri, bandwidth }).await;
                }
            }
            AdaptAction::StepDown if current_idx > 0 => {
                current_idx -= 1;
                if let Some((uri, bandwidth)) =
                    switch_variant(&fetcher, &mut client, &ladder, current_idx).await
                {
                    let _ = tx.send(PipelineEvent::VariantChanged { uri, bandwidth }).await;
                }
            }
            _ => {}
        }
    }
}

/// Fetches and switches `client` onto `ladder[new_idx]`, returning the new
/// variant's `(uri, bandwidth)` on success for the out-of-band notification
/// (§4.3). The discontinuity marker on the next emitted segment (§4.1/§4.3)
/// comes from `ClientState::switch_variant` itself.
async fn switch_variant(
    fetcher: &Fetcher,
    client: &mut ClientState,
    ladder: &[Variant],
    new_idx: usize,
) -> Option<(String, u64)> {
    let target = &ladder[new_idx];
    let Ok(bytes) = fetcher.fetch(&target.uri).await else {
        warn!(uri = %target.uri, "variant switch fetch failed, staying on current variant");
        return None;
    };
    let uri = url::Url::parse(&target.uri).ok()?;
    match playlist::parse(&bytes, &uri) {
        Ok(playlist::Playlist::Media(variant)) => {
            info!(uri = %target.uri, bandwidth = target.bandwidth, "switching variant");
            client.switch_variant(variant);
            Some((target.uri.clone(), target.bandwidth))
        }
        _ => {
            warn!(uri = %target.uri, "variant switch target is not a media playlist");
            None
        }
    }
}

/// Returns `false` if the caller should stop the Updater (cancelled,
/// non-retryable refresh error, or fatal failure already surfaced via
/// `tx`); `true` to keep looping with the configured backoff.
async fn refresh_live_playlist(
    shared: &Shared,
    config: &HlsOrchestratorConfig,
    fetcher: &Fetcher,
    client: &mut ClientState,
    tx: &mpsc::Sender<PipelineEvent>,
) -> bool {
    let uri = match url::Url::parse(&client.variant.uri) {
        Ok(u) => u,
        Err(_) => return false,
    };

    let fetch_result = tokio::select! {
        biased;
        _ = shared.token.cancelled() => return false,
        result = fetcher.fetch(client.variant.uri.as_str()) => result,
    };

    let refresh_error = match fetch_result {
        Ok(bytes) => match playlist::update(client, &bytes, &uri) {
            Ok(changed) => {
                if changed {
                    client.update_failed_count = 0;
                } else {
                    client.update_failed_count += 1;
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "live playlist refresh parse failed");
                client.update_failed_count += 1;
                Some(e)
            }
        },
        Err(e) => {
            warn!(error = %e, "live playlist refresh failed");
            client.update_failed_count += 1;
            Some(e)
        }
    };

    // A retryable error keeps the backoff loop going (§4.3's own schedule,
    // not an added retry policy); anything else stops the Updater, and a
    // fatal one (i.e. not a plain cancellation) is surfaced to the caller.
    if let Some(e) = refresh_error {
        if !e.is_retryable() {
            if e.is_fatal() {
                warn!(error = %e, "live playlist refresh failed with a non-retryable error, stopping");
                let _ = tx.send(PipelineEvent::Error(e)).await;
            }
            return false;
        }
    }

    let delay = refresh_backoff(
        client.variant.target_duration_secs,
        client.update_failed_count,
        config,
    );
    debug!(?delay, failed_count = client.update_failed_count, "scheduling next refresh");
    tokio::select! {
        biased;
        _ = shared.token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
