use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    requests: u32,
}

/// Requests-per-minute limiter for completion calls.
///
/// Once the budget for the current minute is spent, callers wait for the
/// next window instead of being rejected.
pub struct RpmLimiter {
    max_rpm: u32,
    window: Mutex<Window>,
}

impl RpmLimiter {
    pub fn new(max_rpm: u32) -> Self {
        Self {
            max_rpm: max_rpm.max(1),
            window: Mutex::new(Window {
                started: Instant::now(),
                requests: 0,
            }),
        }
    }

    pub fn max_rpm(&self) -> u32 {
        self.max_rpm
    }

    /// Wait until a request slot is available, then take it.
    pub async fn acquire(&self) {
        // Held across the sleep; other callers queue behind it.
        let mut window = self.window.lock().await;
        if window.started.elapsed() >= WINDOW {
            window.started = Instant::now();
            window.requests = 0;
        }

        if window.requests >= self.max_rpm {
            info!("Max RPM reached, waiting for next minute to start.");
            let next = window.started + WINDOW;
            tokio::time::sleep_until(next).await;
            window.started = Instant::now();
            window.requests = 0;
        }
        window.requests += 1;
    }

    /// Requests taken in the current window.
    pub async fn used(&self) -> u32 {
        self.window.lock().await.requests
    }
}
