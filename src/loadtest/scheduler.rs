//! Randomized request scheduling.

use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use super::{RequestWindow, TemplateRef};

/// Identifies one armed timer so stale firings can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Owned handle to the single pending "next request" timer.
///
/// Dropping or cancelling the handle aborts the sleeper. A firing that was
/// already queued before cancellation still carries the old [`TimerId`].
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    delay: Duration,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One planned request-and-reschedule cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub template: TemplateRef,
    pub next_delay: Duration,
}

pub struct Scheduler<R> {
    window: RequestWindow,
    rng: R,
    next_timer: u64,
}

impl<R: Rng> Scheduler<R> {
    pub fn new(window: RequestWindow, rng: R) -> Self {
        Self {
            window,
            rng,
            next_timer: 0,
        }
    }

    pub fn window(&self) -> RequestWindow {
        self.window
    }

    pub fn set_window(&mut self, window: RequestWindow) {
        self.window = window;
    }

    /// Pick a template and the delay before the following cycle.
    ///
    /// Returns `None` for an empty template set: no request, no reschedule.
    pub fn plan(&mut self, templates: &[TemplateRef]) -> Option<Cycle> {
        if templates.is_empty() {
            return None;
        }
        let template = templates[self.rng.gen_range(0..templates.len())].clone();
        let next_delay = self.next_delay();
        Some(Cycle {
            template,
            next_delay,
        })
    }

    /// Uniform in `[0, window)` with millisecond resolution.
    pub fn next_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(0..self.window.as_millis()))
    }

    /// Spawn a sleeper that calls `on_fire` with its id once `delay` elapses.
    pub fn arm<F>(&mut self, delay: Duration, on_fire: F) -> TimerHandle
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(id);
        });
        TimerHandle { id, delay, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn scheduler(secs: u64) -> Scheduler<StdRng> {
        Scheduler::new(RequestWindow::new(secs).unwrap(), StdRng::seed_from_u64(11))
    }

    #[test]
    fn test_empty_template_set_plans_nothing() {
        assert_eq!(scheduler(5).plan(&[]), None);
    }

    #[test]
    fn test_delay_within_window() {
        let mut s = scheduler(5);
        for _ in 0..1000 {
            assert!(s.next_delay() < Duration::from_secs(5));
        }
    }

    #[test]
    fn test_plan_picks_from_every_template() {
        let templates = vec![
            TemplateRef::new("a", "A"),
            TemplateRef::new("b", "B"),
            TemplateRef::new("c", "C"),
        ];
        let mut s = scheduler(20);
        let picked: HashSet<String> = (0..200)
            .filter_map(|_| s.plan(&templates))
            .map(|c| c.template.id)
            .collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_single_template() {
        let templates = vec![TemplateRef::new("t1", "Invoice")];
        let cycle = scheduler(5).plan(&templates).unwrap();
        assert_eq!(cycle.template.id, "t1");
        assert!(cycle.next_delay < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = scheduler(5);
        let handle = s.arm(Duration::from_millis(1500), move |id| {
            let _ = tx.send(id);
        });
        let expected = handle.id();

        assert_eq!(rx.recv().await, Some(expected));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = scheduler(5);
        let handle = s.arm(Duration::from_millis(1500), move |id| {
            let _ = tx.send(id);
        });
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timer_ids_are_distinct() {
        let mut s = scheduler(5);
        let a = s.arm(Duration::from_secs(60), |_| {});
        let b = s.arm(Duration::from_secs(60), |_| {});
        assert_ne!(a.id(), b.id());
    }
}
