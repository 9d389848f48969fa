use log::info;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute token budget shared by every request the gateway makes.
pub struct RateLimiter {
    max_tpm: u32,
    requests: Mutex<VecDeque<(Instant, u32)>>,
    total_tokens_used: Mutex<u32>,
}

impl RateLimiter {
    pub fn new(max_tpm: u32) -> Self {
        Self {
            max_tpm,
            requests: Mutex::new(VecDeque::new()),
            total_tokens_used: Mutex::new(0),
        }
    }

    pub fn max_tpm(&self) -> u32 {
        self.max_tpm
    }

    pub async fn wait_if_needed(&self, estimated_tokens: u32) {
        let mut requests = self.requests.lock().await;
        let now = Instant::now();
        prune(&mut requests, now);

        let current_tpm: u32 = requests.iter().map(|(_, tokens)| tokens).sum();

        if current_tpm + estimated_tokens > self.max_tpm {
            if let Some((oldest_time, _)) = requests.front() {
                let elapsed = now.duration_since(*oldest_time);
                if elapsed < WINDOW {
                    let wait_time = WINDOW - elapsed + Duration::from_millis(100);
                    info!(
                        "TPM limit reached ({}/{}), waiting {}ms",
                        current_tpm,
                        self.max_tpm,
                        wait_time.as_millis()
                    );
                    tokio::time::sleep(wait_time).await;
                    prune(&mut requests, Instant::now());
                }
            }
        }

        requests.push_back((Instant::now(), estimated_tokens));
        *self.total_tokens_used.lock().await += estimated_tokens;
    }

    /// Swaps the estimate of the most recent request for the usage the API reported.
    pub async fn record_actual(&self, actual_tokens: u32) {
        let mut requests = self.requests.lock().await;
        if let Some(back) = requests.back_mut() {
            let mut total = self.total_tokens_used.lock().await;
            *total = total.saturating_sub(back.1) + actual_tokens;
            back.1 = actual_tokens;
        }
    }

    pub async fn current_tpm(&self) -> u32 {
        let requests = self.requests.lock().await;
        let now = Instant::now();

        requests
            .iter()
            .filter(|(time, _)| now.duration_since(*time) < WINDOW)
            .map(|(_, tokens)| tokens)
            .sum()
    }

    pub async fn total_tokens(&self) -> u32 {
        *self.total_tokens_used.lock().await
    }
}

fn prune(requests: &mut VecDeque<(Instant, u32)>, now: Instant) {
    while let Some((time, _)) = requests.front() {
        if now.duration_since(*time) >= WINDOW {
            requests.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_within_budget_do_not_wait() {
        let limiter = RateLimiter::new(1000);
        let started = Instant::now();

        limiter.wait_if_needed(300).await;
        limiter.wait_if_needed(400).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.current_tpm().await, 700);
        assert_eq!(limiter.total_tokens().await, 700);
    }

    #[tokio::test]
    async fn test_record_actual_replaces_latest_estimate() {
        let limiter = RateLimiter::new(1000);
        limiter.wait_if_needed(100).await;
        limiter.wait_if_needed(200).await;

        limiter.record_actual(50).await;

        assert_eq!(limiter.current_tpm().await, 150);
        assert_eq!(limiter.total_tokens().await, 150);
    }

    #[tokio::test]
    async fn test_record_actual_without_requests_is_noop() {
        let limiter = RateLimiter::new(10);
        limiter.record_actual(5).await;
        assert_eq!(limiter.total_tokens().await, 0);
        assert_eq!(limiter.max_tpm(), 10);
    }
}
