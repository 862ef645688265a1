//! "Time to next request" countdown shown to the operator.

use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Countdown {
    interval: Duration,
    remaining: Option<Duration>,
}

impl Countdown {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            remaining: None,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    pub fn reset(&mut self, delay: Duration) {
        self.remaining = Some(delay);
    }

    pub fn clear(&mut self) {
        self.remaining = None;
    }

    /// Subtract one interval, never going below zero.
    pub fn tick(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining >= self.interval {
                *remaining -= self.interval;
            }
        }
        self.remaining
    }
}

/// Repeating tick task; aborted on drop.
#[derive(Debug)]
pub struct Ticker {
    task: JoinHandle<()>,
}

impl Ticker {
    pub fn start<F>(period: Duration, on_tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                on_tick();
            }
        });
        Self { task }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
