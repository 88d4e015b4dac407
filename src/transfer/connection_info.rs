//! Per-connection request window for one download.
//!
//! The window starts small in block mode and doubles each time a full window
//! of requests has been answered. Once it covers a whole piece the connection
//! switches to whole-piece requests and keeps doubling up to a cap. A decrease
//! halves it and starts two timers: one makes the connection available again
//! after a cooldown, the other re-permits growth after a longer jittered delay.
//! Both timers carry the decrease epoch they were started in and do nothing if
//! a newer decrease happened meanwhile.

use log::debug;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

use crate::core::TransferConfig;

pub type AvailableCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct WindowState {
    window: usize,
    whole_piece: bool,
    in_flight: usize,
    nb_answers: usize,
    available: bool,
    authorised: bool,
    can_increase: bool,
    epoch: u64,
    last_decrease: Option<Instant>,
    cooldown_steps: u32,
    increase_steps: u32,
}

#[derive(Default)]
struct Timers {
    reask: Option<JoinHandle<()>>,
    increase: Option<JoinHandle<()>>,
}

pub struct ConnectionInfo {
    conn: Uuid,
    blocks_per_piece: usize,
    min_block_window: usize,
    max_piece_window: usize,
    decrease_interval: Duration,
    cooldown_base: Duration,
    cooldown_max: Duration,
    increase_base: Duration,
    increase_max: Duration,
    state: Arc<Mutex<WindowState>>,
    timers: Mutex<Timers>,
    on_available: Option<AvailableCallback>,
}

impl ConnectionInfo {
    pub fn new(conn: Uuid, blocks_per_piece: usize, config: &TransferConfig) -> Self {
        Self {
            conn,
            blocks_per_piece: blocks_per_piece.max(1),
            min_block_window: config.min_block_window,
            max_piece_window: config.max_piece_window,
            decrease_interval: config.decrease_interval(),
            cooldown_base: Duration::from_millis(config.cooldown_base_ms),
            cooldown_max: Duration::from_millis(config.cooldown_max_ms),
            increase_base: Duration::from_millis(config.increase_retry_base_ms),
            increase_max: Duration::from_millis(config.increase_retry_max_ms),
            state: Arc::new(Mutex::new(WindowState {
                window: config.initial_window,
                whole_piece: false,
                in_flight: 0,
                nb_answers: 0,
                available: true,
                authorised: true,
                can_increase: true,
                epoch: 0,
                last_decrease: None,
                cooldown_steps: 0,
                increase_steps: 0,
            })),
            timers: Mutex::new(Timers::default()),
            on_available: None,
        }
    }

    /// Called when the connection becomes available again after a cooldown.
    pub fn with_on_available(mut self, callback: AvailableCallback) -> Self {
        self.on_available = Some(callback);
        self
    }

    pub fn conn(&self) -> Uuid {
        self.conn
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut WindowState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    pub fn window(&self) -> usize {
        self.with_state(|s| s.window).unwrap_or(0)
    }

    pub fn is_whole_piece(&self) -> bool {
        self.with_state(|s| s.whole_piece).unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.with_state(|s| s.in_flight).unwrap_or(0)
    }

    pub fn is_available(&self) -> bool {
        self.with_state(|s| s.available).unwrap_or(false)
    }

    pub fn is_authorised(&self) -> bool {
        self.with_state(|s| s.authorised).unwrap_or(false)
    }

    pub fn can_increase(&self) -> bool {
        self.with_state(|s| s.can_increase).unwrap_or(false)
    }

    pub fn set_authorised(&self, authorised: bool) {
        self.with_state(|s| s.authorised = authorised);
    }

    pub fn can_request_block(&self) -> bool {
        self.with_state(|s| s.available && s.authorised && s.in_flight < s.window)
            .unwrap_or(false)
    }

    pub fn on_request_sent(&self) {
        self.with_state(|s| s.in_flight += 1);
    }

    /// A request was given up on without an answer.
    pub fn request_abandoned(&self) {
        self.with_state(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }

    pub fn update_nb_answer(&self) {
        let grow = self
            .with_state(|s| {
                s.in_flight = s.in_flight.saturating_sub(1);
                s.nb_answers += 1;
                s.nb_answers >= s.window && s.can_increase
            })
            .unwrap_or(false);
        if grow {
            self.increase_level();
        }
    }

    pub fn increase_level(&self) {
        let blocks = self.blocks_per_piece;
        let cap = self.max_piece_window;
        self.with_state(|s| {
            s.nb_answers = 0;
            if s.whole_piece {
                s.window = (s.window * 2).min(cap);
            } else {
                s.window *= 2;
                if s.window >= blocks {
                    s.whole_piece = true;
                    s.window = 1;
                }
            }
        });
        debug!(
            "Window for {} raised to {} ({})",
            self.conn,
            self.window(),
            if self.is_whole_piece() { "pieces" } else { "blocks" }
        );
    }

    /// Shrinks the window. Returns false when the last decrease is too recent.
    pub fn decrease_level(&self) -> bool {
        let now = Instant::now();
        let blocks = self.blocks_per_piece;
        let floor = self.min_block_window;
        let interval = self.decrease_interval;

        let decision = self.with_state(|s| {
            if let Some(last) = s.last_decrease {
                if now.duration_since(last) < interval {
                    return None;
                }
            }

            if s.whole_piece {
                if s.window > 1 {
                    s.window /= 2;
                } else {
                    s.whole_piece = false;
                    s.window = (blocks / 2).max(floor);
                }
            } else {
                s.window = (s.window / 2).max(floor);
            }
            s.nb_answers = 0;
            s.available = false;
            s.can_increase = false;
            s.epoch += 1;
            s.last_decrease = Some(now);

            let cooldown = backoff(self.cooldown_base, s.cooldown_steps, self.cooldown_max);
            let retry = backoff(self.increase_base, s.increase_steps, self.increase_max);
            s.cooldown_steps += 1;
            s.increase_steps += 1;
            Some((s.epoch, s.window, cooldown, retry))
        });

        let (epoch, window, cooldown, retry) = match decision.flatten() {
            Some(d) => d,
            None => return false,
        };
        let jitter_ms = rand::thread_rng().gen_range(0..=retry.as_millis() as u64 / 2);
        let retry = retry + Duration::from_millis(jitter_ms);

        debug!(
            "Window for {} lowered to {} (epoch {}, cooldown {:?}, growth in {:?})",
            self.conn, window, epoch, cooldown, retry
        );

        let reask = {
            let state = self.state.clone();
            let callback = self.on_available.clone();
            tokio::spawn(async move {
                sleep(cooldown).await;
                let current = match state.lock() {
                    Ok(mut s) if s.epoch == epoch => {
                        s.available = true;
                        true
                    }
                    _ => false,
                };
                if current {
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            })
        };

        let increase = {
            let state = self.state.clone();
            tokio::spawn(async move {
                sleep(retry).await;
                if let Ok(mut s) = state.lock() {
                    if s.epoch == epoch {
                        s.can_increase = true;
                        s.cooldown_steps = 0;
                        s.increase_steps = 0;
                    }
                }
            })
        };

        if let Ok(mut timers) = self.timers.lock() {
            if let Some(old) = timers.reask.replace(reask) {
                old.abort();
            }
            if let Some(old) = timers.increase.replace(increase) {
                old.abort();
            }
        }
        true
    }

    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.reask.take() {
                handle.abort();
            }
            if let Some(handle) = timers.increase.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ConnectionInfo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn backoff(base: Duration, steps: u32, max: Duration) -> Duration {
    base.saturating_mul(1u32 << steps.min(16)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info(blocks: usize) -> ConnectionInfo {
        ConnectionInfo::new(Uuid::new_v4(), blocks, &TransferConfig::default())
    }

    fn answer(info: &ConnectionInfo, n: usize) {
        for _ in 0..n {
            info.on_request_sent();
            info.update_nb_answer();
        }
    }

    #[tokio::test]
    async fn test_window_grows_into_whole_piece_mode() {
        let info = info(16);
        assert_eq!(info.window(), 4);
        assert!(!info.is_whole_piece());

        answer(&info, 4);
        assert_eq!(info.window(), 8);
        answer(&info, 8);
        assert!(info.is_whole_piece());
        assert_eq!(info.window(), 1);

        for _ in 0..200 {
            answer(&info, 1);
            assert!(info.window() <= 16);
        }
        assert_eq!(info.window(), 16);
    }

    #[tokio::test]
    async fn test_window_respects_in_flight_limit() {
        let info = info(16);
        for _ in 0..4 {
            assert!(info.can_request_block());
            info.on_request_sent();
        }
        assert!(!info.can_request_block());
        info.request_abandoned();
        assert!(info.can_request_block());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_is_rate_limited_and_floored() {
        let info = info(16);
        assert!(info.decrease_level());
        assert_eq!(info.window(), 2);
        assert!(!info.is_available());
        assert!(!info.decrease_level());

        tokio::time::advance(Duration::from_millis(3_100)).await;
        assert!(info.decrease_level());
        assert_eq!(info.window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_leaves_whole_piece_mode() {
        let info = info(16);
        answer(&info, 4);
        answer(&info, 8);
        assert!(info.is_whole_piece());

        assert!(info.decrease_level());
        assert!(!info.is_whole_piece());
        assert_eq!(info.window(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_restores_availability() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let info = info(16).with_on_available(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        info.decrease_level();
        assert!(!info.can_request_block());
        sleep(Duration::from_millis(250)).await;
        assert!(info.is_available());
        assert!(info.can_request_block());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_increase_timer_is_ignored() {
        let config = TransferConfig {
            increase_retry_base_ms: 10_000,
            increase_retry_max_ms: 60_000,
            ..TransferConfig::default()
        };
        let info = ConnectionInfo::new(Uuid::new_v4(), 16, &config);

        info.decrease_level();
        sleep(Duration::from_millis(3_100)).await;
        info.decrease_level();

        // The first timer (due by 15s) belongs to an older epoch.
        sleep(Duration::from_millis(13_000)).await;
        assert!(!info.can_increase());

        // The second one is due by 3.1s + 20s + 10s.
        sleep(Duration::from_millis(20_000)).await;
        assert!(info.can_increase());
    }
}
