//! The load-test event loop.
//!
//! A [`Driver`] owns the history, the scheduler and the session state. Every
//! input (operator commands, timer firings, print responses, stream frames)
//! arrives as a [`DriverEvent`] on one channel and is handled to completion
//! before the next one is read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::correlator::{Correlation, Correlator, Identity};
use super::countdown::{Countdown, Ticker};
use super::history::{EntryId, HistoryError, HistoryObserver, HistoryStats, HistoryStore};
use super::scheduler::{Scheduler, TimerHandle, TimerId};
use super::sse::{EventSource, StreamEvent};
use super::{
    ConnectionState, ControlError, PrintApi, RequestWindow, TemplateRef, UserId,
    COUNTDOWN_INTERVAL,
};
use crate::api::ApiError;

/// Commands accepted on the operator channel, for usage hints.
pub const COMMAND_USAGE: &str = "start, stop, toggle, window N, refresh, stats, quit";

/// Operator controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Toggle,
    SetWindow(u64),
    RefreshTemplates,
    Stats,
    Shutdown,
}

impl std::str::FromStr for Command {
    type Err = String;

    /// Parse an operator line such as `start` or `window 30`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("start") => Command::Start,
            Some("stop") => Command::Stop,
            Some("toggle") => Command::Toggle,
            Some("refresh") => Command::RefreshTemplates,
            Some("stats") => Command::Stats,
            Some("quit") | Some("exit") => Command::Shutdown,
            Some("window") => {
                let secs = words
                    .next()
                    .ok_or_else(|| "usage: window <seconds>".to_string())?;
                let secs = secs
                    .parse()
                    .map_err(|_| format!("not a number of seconds: {secs}"))?;
                Command::SetWindow(secs)
            }
            Some(other) => return Err(format!("unknown command: {other}")),
            None => return Err("empty command".to_string()),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument: {extra}"));
        }
        Ok(command)
    }
}

/// Everything the driver loop reacts to.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    Command(Command),
    /// An operator line that did not parse.
    InvalidInput(String),
    TimerFired(TimerId),
    CountdownTick,
    PrintResolved {
        entry: EntryId,
        result: Result<String, ApiError>,
    },
    TemplatesLoaded(Result<Vec<TemplateRef>, ApiError>),
    Stream(StreamEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Nothing emitted yet.
    Idle,
    Running,
    Stopped,
    /// Paused because the completion stream dropped.
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Reasons the start control is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartBlocker {
    NoTemplates,
    ConnectionNotOpen,
    IdentityMismatch,
}

impl fmt::Display for StartBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartBlocker::NoTemplates => write!(f, "no active templates"),
            StartBlocker::ConnectionNotOpen => write!(f, "completion stream is not open"),
            StartBlocker::IdentityMismatch => {
                write!(f, "completion stream is bound to another user id")
            }
        }
    }
}

/// Operator-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    TemplatesUnavailable(String),
    IdentityMismatch { expected: UserId, subscribed: UserId },
    StreamClosed(String),
    Rejected(String),
    Stats(HistoryStats),
}

/// Receives session-level changes. All methods default to no-ops.
pub trait SessionObserver: Send {
    fn state_changed(&mut self, _state: SessionState) {}
    fn connection_changed(&mut self, _connection: ConnectionState) {}
    fn templates_changed(&mut self, _templates: &[TemplateRef]) {}
    /// A new request timer was armed with this delay.
    fn request_scheduled(&mut self, _delay: Duration) {}
    fn countdown(&mut self, _remaining: Option<Duration>) {}
    fn notice(&mut self, _notice: &Notice) {}
}

/// Cloneable sender for operator commands.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl DriverHandle {
    /// Returns `false` once the driver has exited.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(DriverEvent::Command(command)).is_ok()
    }

    /// Parse an operator line and forward it; a line that does not parse is
    /// reported by the driver as a rejected notice.
    pub fn submit(&self, line: &str) -> bool {
        let event = match line.parse::<Command>() {
            Ok(command) => DriverEvent::Command(command),
            Err(e) => DriverEvent::InvalidInput(e),
        };
        self.tx.send(event).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(Command::Stop)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }
}

pub struct Driver<R> {
    api: Arc<dyn PrintApi>,
    scheduler: Scheduler<R>,
    correlator: Correlator,
    history: HistoryStore,
    templates: Vec<TemplateRef>,
    connection: ConnectionState,
    state: SessionState,
    timer: Option<TimerHandle>,
    countdown: Countdown,
    ticker: Option<Ticker>,
    autostart: bool,
    held_by_operator: bool,
    observers: Vec<Box<dyn SessionObserver>>,
    stream: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<DriverEvent>,
    rx: mpsc::UnboundedReceiver<DriverEvent>,
}

impl<R: Rng + Send + 'static> Driver<R> {
    pub fn new(api: Arc<dyn PrintApi>, user_id: UserId, window: RequestWindow, rng: R) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            api,
            scheduler: Scheduler::new(window, rng),
            correlator: Correlator::new(user_id),
            history: HistoryStore::new(),
            templates: Vec::new(),
            connection: ConnectionState::Connecting,
            state: SessionState::Idle,
            timer: None,
            countdown: Countdown::new(COUNTDOWN_INTERVAL),
            ticker: None,
            autostart: false,
            held_by_operator: false,
            observers: Vec::new(),
            stream: None,
            tx,
            rx,
        }
    }

    /// Start automatically whenever nothing blocks it, unless the operator
    /// stopped the scheduler explicitly.
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn observe(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn observe_history(&mut self, observer: Box<dyn HistoryObserver>) {
        self.history.subscribe(observer);
    }

    pub fn user_id(&self) -> UserId {
        self.correlator.user_id()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn templates(&self) -> &[TemplateRef] {
        &self.templates
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn window(&self) -> RequestWindow {
        self.scheduler.window()
    }

    /// Delay of the currently armed timer, if any.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.timer.as_ref().map(|t| t.delay())
    }

    pub fn time_to_next_request(&self) -> Option<Duration> {
        self.countdown.remaining()
    }

    /// Subscribe to the completion stream; frames are fed into this driver.
    pub fn attach_stream(&mut self, source: EventSource) {
        let tx = self.tx.clone();
        let task = source.spawn(move |event| {
            let _ = tx.send(DriverEvent::Stream(event));
        });
        if let Some(previous) = self.stream.replace(task) {
            previous.abort();
        }
    }

    /// Everything currently preventing a start.
    pub fn start_blockers(&self) -> Vec<StartBlocker> {
        let mut blockers = Vec::new();
        if self.templates.is_empty() {
            blockers.push(StartBlocker::NoTemplates);
        }
        if self.connection != ConnectionState::Open {
            blockers.push(StartBlocker::ConnectionNotOpen);
        }
        if !matches!(self.correlator.identity(), Identity::Matches) {
            blockers.push(StartBlocker::IdentityMismatch);
        }
        blockers
    }

    /// Run one cycle right away if no timer is armed.
    pub fn start(&mut self) -> Result<(), ControlError> {
        if self.timer.is_some() {
            debug!("scheduler already running");
            return Ok(());
        }
        let blockers = self.start_blockers();
        if !blockers.is_empty() {
            return Err(ControlError::Blocked { blockers });
        }
        self.held_by_operator = false;
        info!(window_secs = self.scheduler.window().secs(), "scheduler started");
        self.run_cycle();
        Ok(())
    }

    /// Cancel the pending timer. In-flight requests are left alone.
    pub fn stop(&mut self) {
        self.disarm();
        if self.state == SessionState::Running {
            info!("scheduler stopped");
            self.set_state(SessionState::Stopped);
        }
    }

    pub fn set_window(&mut self, secs: u64) -> Result<(), ControlError> {
        if self.timer.is_some() {
            return Err(ControlError::WindowLocked);
        }
        let window = RequestWindow::new(secs)?;
        self.scheduler.set_window(window);
        info!(window_secs = secs, "request window changed");
        Ok(())
    }

    /// Ask the API for the current set of active templates.
    pub fn refresh_templates(&self) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = api.active_templates().await;
            let _ = tx.send(DriverEvent::TemplatesLoaded(result));
        });
    }

    /// Handle the next queued event. Returns `false` once the loop should end.
    pub async fn step(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => self.dispatch(event),
            None => false,
        }
    }

    /// Process events until shutdown, then hand back the history.
    pub async fn run(mut self) -> HistoryStore {
        info!(user_id = %self.user_id(), "load-test driver running");
        while self.step().await {}
        self.teardown();
        self.history
    }

    pub(crate) fn dispatch(&mut self, event: DriverEvent) -> bool {
        match event {
            DriverEvent::Command(command) => return self.on_command(command),
            DriverEvent::InvalidInput(reason) => {
                warn!(%reason, "operator input rejected");
                let notice = Notice::Rejected(format!("{reason} (commands: {COMMAND_USAGE})"));
                self.notify(|o| o.notice(&notice));
            }
            DriverEvent::TimerFired(id) => self.on_timer(id),
            DriverEvent::CountdownTick => {
                let remaining = self.countdown.tick();
                self.notify(|o| o.countdown(remaining));
            }
            DriverEvent::PrintResolved { entry, result } => self.on_print_resolved(entry, result),
            DriverEvent::TemplatesLoaded(result) => self.on_templates_loaded(result),
            DriverEvent::Stream(event) => self.on_stream(event),
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        debug!(?command, "operator command");
        let outcome = match command {
            Command::Start => self.start(),
            Command::Stop => {
                self.held_by_operator = true;
                self.stop();
                Ok(())
            }
            Command::Toggle => {
                if self.timer.is_some() {
                    self.held_by_operator = true;
                    self.stop();
                    Ok(())
                } else {
                    self.start()
                }
            }
            Command::SetWindow(secs) => self.set_window(secs),
            Command::RefreshTemplates => {
                self.refresh_templates();
                Ok(())
            }
            Command::Stats => {
                let notice = Notice::Stats(self.history.stats());
                self.notify(|o| o.notice(&notice));
                Ok(())
            }
            Command::Shutdown => {
                info!("load-test driver shutting down");
                return false;
            }
        };
        if let Err(e) = outcome {
            warn!(error = %e, "command rejected");
            let notice = Notice::Rejected(e.to_string());
            self.notify(|o| o.notice(&notice));
        }
        true
    }

    fn on_timer(&mut self, id: TimerId) {
        match &self.timer {
            Some(timer) if timer.id() == id => {
                self.timer = None;
                self.run_cycle();
            }
            _ => debug!(?id, "ignoring stale timer"),
        }
    }

    /// Emit one request and arm the next timer.
    fn run_cycle(&mut self) {
        let Some(cycle) = self.scheduler.plan(&self.templates) else {
            warn!("no active templates, scheduler halted");
            self.disarm();
            if self.state == SessionState::Running {
                self.set_state(SessionState::Stopped);
            }
            return;
        };

        let entry = self.history.append(cycle.template.clone(), Utc::now());
        info!(
            entry = entry.index(),
            template = %cycle.template.id,
            next_ms = cycle.next_delay.as_millis() as u64,
            "print requested"
        );

        let api = self.api.clone();
        let tx = self.tx.clone();
        let user_id = self.correlator.user_id();
        let template_id = cycle.template.id;
        tokio::spawn(async move {
            let result = api.print(&template_id, user_id).await;
            let _ = tx.send(DriverEvent::PrintResolved { entry, result });
        });

        let tx = self.tx.clone();
        let timer = self.scheduler.arm(cycle.next_delay, move |id| {
            let _ = tx.send(DriverEvent::TimerFired(id));
        });
        self.timer = Some(timer);
        let delay = cycle.next_delay;
        self.notify(|o| o.request_scheduled(delay));

        self.countdown.reset(cycle.next_delay);
        if self.ticker.is_none() {
            let tx = self.tx.clone();
            self.ticker = Some(Ticker::start(COUNTDOWN_INTERVAL, move || {
                let _ = tx.send(DriverEvent::CountdownTick);
            }));
        }
        let remaining = self.countdown.remaining();
        self.notify(|o| o.countdown(remaining));
        self.set_state(SessionState::Running);
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.ticker = None;
        if self.countdown.remaining().is_some() {
            self.countdown.clear();
            self.notify(|o| o.countdown(None));
        }
    }

    fn on_print_resolved(&mut self, entry: EntryId, result: Result<String, ApiError>) {
        let now = Utc::now();
        let outcome = match result {
            Ok(token) => {
                debug!(entry = entry.index(), %token, "print registered");
                match self.history.register(entry, token, now) {
                    Err(HistoryError::DuplicateToken { token, holder }) => {
                        error!(entry = entry.index(), holder = holder.index(), %token, "duplicate token");
                        self.history
                            .fail(entry, format!("duplicate token {token}"), now)
                    }
                    other => other,
                }
            }
            Err(e) => {
                warn!(entry = entry.index(), error = %e, "print request failed");
                self.history.fail(entry, e.to_string(), now)
            }
        };
        if let Err(e) = outcome {
            error!(error = %e, "history update rejected");
        }
    }

    fn on_templates_loaded(&mut self, result: Result<Vec<TemplateRef>, ApiError>) {
        match result {
            Ok(templates) => {
                info!(count = templates.len(), "active templates loaded");
                self.templates = templates;
            }
            Err(e) => {
                warn!(error = %e, "failed to load active templates");
                self.templates.clear();
                let notice = Notice::TemplatesUnavailable(e.to_string());
                self.notify(|o| o.notice(&notice));
            }
        }
        let templates = self.templates.clone();
        self.notify(|o| o.templates_changed(&templates));
        self.maybe_autostart();
    }

    fn on_stream(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Open { subscribed_as } => {
                info!("completion stream open");
                self.set_connection(ConnectionState::Open);
                if let Some(subscribed) = subscribed_as {
                    if let Identity::Mismatch { subscribed } = self.correlator.bind(subscribed) {
                        let expected = self.correlator.user_id();
                        error!(%expected, %subscribed, "completion stream bound to another user id");
                        let notice = Notice::IdentityMismatch {
                            expected,
                            subscribed,
                        };
                        self.notify(|o| o.notice(&notice));
                    }
                }
                if self.state == SessionState::Reconnecting {
                    self.set_state(self.resting_state());
                }
                self.refresh_templates();
            }
            StreamEvent::Error(reason) => {
                warn!(%reason, "completion stream reconnecting");
                self.set_connection(ConnectionState::Reconnecting);
                self.disarm();
                self.set_state(SessionState::Reconnecting);
            }
            StreamEvent::Closed(reason) => {
                error!(%reason, "completion stream closed");
                self.set_connection(ConnectionState::Closed);
                self.disarm();
                self.set_state(self.resting_state());
                let notice = Notice::StreamClosed(reason);
                self.notify(|o| o.notice(&notice));
            }
            StreamEvent::Message(frame) => {
                if frame.event != "message" {
                    debug!(event = %frame.event, "ignoring non-message frame");
                    return;
                }
                match self
                    .correlator
                    .correlate(&mut self.history, &frame.data, Utc::now())
                {
                    Ok(Correlation::Matched(entry)) => {
                        debug!(entry = entry.index(), "print completed");
                    }
                    Ok(Correlation::Unmatched { token }) => {
                        warn!(%token, data = %frame.data, "no registered request for completion event");
                    }
                    Ok(Correlation::Ignored) => {
                        debug!(data = %frame.data, "completion event without token");
                    }
                    Err(e) => warn!(error = %e, data = %frame.data, "malformed completion event"),
                }
            }
        }
    }

    fn maybe_autostart(&mut self) {
        if self.autostart
            && !self.held_by_operator
            && self.timer.is_none()
            && self.start_blockers().is_empty()
        {
            if let Err(e) = self.start() {
                debug!(error = %e, "autostart skipped");
            }
        }
    }

    fn resting_state(&self) -> SessionState {
        if self.history.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Stopped
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.notify(|o| o.state_changed(state));
        }
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            self.connection = connection;
            self.notify(|o| o.connection_changed(connection));
        }
    }

    fn notify<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut dyn SessionObserver),
    {
        for observer in self.observers.iter_mut() {
            f(observer.as_mut());
        }
    }

    fn teardown(&mut self) {
        self.disarm();
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::RequestState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const USER: u32 = 4242;

    /// Print API double: hands out sequential tokens unless a scripted
    /// failure is queued, and can hold responses until released.
    #[derive(Default)]
    struct FakeApi {
        templates: Mutex<Vec<TemplateRef>>,
        fail_templates: Mutex<bool>,
        failures: Mutex<VecDeque<ApiError>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        /// Answer every print with this token instead of a sequential one.
        fixed_token: Option<String>,
    }

    impl FakeApi {
        fn with_templates(ids: &[&str]) -> Self {
            let api = Self::default();
            *api.templates.lock().unwrap() = ids
                .iter()
                .map(|id| TemplateRef::new(*id, format!("Template {id}")))
                .collect();
            api
        }
    }

    #[async_trait::async_trait]
    impl PrintApi for FakeApi {
        async fn active_templates(&self) -> Result<Vec<TemplateRef>, ApiError> {
            if *self.fail_templates.lock().unwrap() {
                return Err(ApiError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok(self.templates.lock().unwrap().clone())
        }

        async fn print(&self, _template_id: &str, user_id: UserId) -> Result<String, ApiError> {
            assert_eq!(user_id, UserId::new(USER));
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            if let Some(token) = &self.fixed_token {
                return Ok(token.clone());
            }
            Ok(format!("tok-{n}"))
        }
    }

    #[derive(Default, Clone)]
    struct Recorded {
        states: Arc<Mutex<Vec<SessionState>>>,
        notices: Arc<Mutex<Vec<Notice>>>,
        countdowns: Arc<Mutex<Vec<Option<Duration>>>>,
        scheduled: Arc<Mutex<Vec<Duration>>>,
    }

    impl SessionObserver for Recorded {
        fn state_changed(&mut self, state: SessionState) {
            self.states.lock().unwrap().push(state);
        }
        fn request_scheduled(&mut self, delay: Duration) {
            self.scheduled.lock().unwrap().push(delay);
        }
        fn countdown(&mut self, remaining: Option<Duration>) {
            self.countdowns.lock().unwrap().push(remaining);
        }
        fn notice(&mut self, notice: &Notice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    fn driver(api: Arc<FakeApi>, window: u64) -> Driver<StdRng> {
        Driver::new(
            api,
            UserId::new(USER),
            RequestWindow::new(window).unwrap(),
            StdRng::seed_from_u64(3),
        )
    }

    fn open() -> DriverEvent {
        DriverEvent::Stream(StreamEvent::Open {
            subscribed_as: Some(UserId::new(USER)),
        })
    }

    fn message(data: &str) -> DriverEvent {
        DriverEvent::Stream(StreamEvent::Message(crate::loadtest::sse::SseFrame {
            event: "message".into(),
            data: data.into(),
            id: None,
        }))
    }

    /// Open the stream and wait for the template refresh to land.
    async fn connect(d: &mut Driver<StdRng>) {
        d.dispatch(open());
        while d.templates().is_empty() {
            assert!(d.step().await);
        }
    }

    /// Step until `done` holds; time is paused so sleeps advance instantly.
    async fn pump_until<F>(d: &mut Driver<StdRng>, mut done: F)
    where
        F: FnMut(&Driver<StdRng>) -> bool,
    {
        for _ in 0..10_000 {
            if done(d) {
                return;
            }
            assert!(d.step().await);
        }
        panic!("condition not reached");
    }

    /// Handle queued events until the driver has been idle for a second.
    async fn drain(d: &mut Driver<StdRng>) {
        while let Ok(true) = tokio::time::timeout(Duration::from_secs(1), d.step()).await {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_emits_one_request_and_arms_one_timer() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api.clone(), 5);
        connect(&mut d).await;

        d.start().unwrap();

        assert_eq!(d.history().len(), 1);
        let entry = &d.history().entries()[0];
        assert_eq!(entry.state(), RequestState::Requested);
        assert_eq!(entry.template.id, "t1");
        assert!(d.pending_delay().unwrap() < Duration::from_secs(5));
        assert_eq!(d.state(), SessionState::Running);

        // A second start while armed is a no-op.
        d.start().unwrap();
        assert_eq!(d.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_blocked_until_ready() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);

        let err = d.start().unwrap_err();
        assert_eq!(
            err,
            ControlError::Blocked {
                blockers: vec![
                    StartBlocker::NoTemplates,
                    StartBlocker::ConnectionNotOpen,
                    StartBlocker::IdentityMismatch,
                ]
            }
        );
        assert!(d.history().is_empty());

        connect(&mut d).await;
        assert!(d.start_blockers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_cycle_appends_one_entry() {
        let api = Arc::new(FakeApi::with_templates(&["t1", "t2", "t3"]));
        let mut d = driver(api.clone(), 5);
        connect(&mut d).await;
        d.start().unwrap();

        pump_until(&mut d, |d| d.history().len() == 10).await;
        d.stop();
        drain(&mut d).await;

        assert_eq!(d.history().len(), 10);
        assert_eq!(api.calls.load(Ordering::SeqCst), 10);
        assert!(d
            .history()
            .entries()
            .iter()
            .all(|e| e.state() == RequestState::Registered));
        assert!(d.pending_delay().is_none());
        assert_eq!(d.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_and_completion() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 60);
        connect(&mut d).await;
        d.start().unwrap();
        d.stop();

        pump_until(&mut d, |d| {
            d.history().entries()[0].state() == RequestState::Registered
        })
        .await;
        assert_eq!(d.history().entries()[0].token(), Some("tok-0"));

        d.dispatch(message(r#"{"token":"tok-0"}"#));
        let entry = &d.history().entries()[0];
        assert_eq!(entry.state(), RequestState::Done);
        assert_eq!(entry.succeeded(), Some(true));

        let revision = d.history().revision();
        d.dispatch(message(r#"{"token":"tok-0"}"#));
        assert_eq!(d.history().revision(), revision);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_error_is_still_done() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 60);
        connect(&mut d).await;
        d.start().unwrap();
        d.stop();
        pump_until(&mut d, |d| d.history().entries()[0].token().is_some()).await;

        d.dispatch(message(r#"{"token":"tok-0","error":"template broken"}"#));
        let entry = &d.history().entries()[0];
        assert_eq!(entry.state(), RequestState::Done);
        assert_eq!(entry.succeeded(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_marks_error_and_keeps_running() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        api.failures.lock().unwrap().push_back(ApiError::Status {
            status: 500,
            body: "boom".into(),
        });
        let mut d = driver(api, 5);
        connect(&mut d).await;
        d.start().unwrap();

        pump_until(&mut d, |d| d.history().len() >= 2).await;
        pump_until(&mut d, |d| d.history().entries()[0].is_terminal()).await;

        assert_eq!(d.history().entries()[0].state(), RequestState::Error);
        assert_eq!(d.state(), SessionState::Running);

        // A stale token cannot revive an errored entry.
        d.dispatch(message(r#"{"token":"tok-0"}"#));
        assert_eq!(d.history().entries()[0].state(), RequestState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_token_fails_the_later_entry() {
        let api = Arc::new(FakeApi {
            fixed_token: Some("tok-same".into()),
            ..FakeApi::with_templates(&["t1"])
        });
        let mut d = driver(api, 5);
        connect(&mut d).await;
        d.start().unwrap();

        pump_until(&mut d, |d| d.history().len() >= 2).await;
        d.stop();
        pump_until(&mut d, |d| {
            d.history().entries()[..2]
                .iter()
                .all(|e| e.state() != RequestState::Requested)
        })
        .await;

        let entries = d.history().entries();
        assert_eq!(entries[0].state(), RequestState::Registered);
        assert_eq!(entries[0].token(), Some("tok-same"));
        assert_eq!(entries[1].state(), RequestState::Error);
        match &entries[1].progress {
            crate::loadtest::history::Progress::Error { error, .. } => {
                assert_eq!(error, "duplicate token tok-same");
            }
            other => panic!("expected Error, got {other:?}"),
        }

        // The completion still reaches the entry that holds the token.
        d.dispatch(message(r#"{"token":"tok-same"}"#));
        assert_eq!(d.history().entries()[0].state(), RequestState::Done);
        assert_eq!(d.history().entries()[1].state(), RequestState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_lose_in_flight_request() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(FakeApi {
            gate: Some(gate.clone()),
            ..FakeApi::with_templates(&["t1"])
        });
        let mut d = driver(api, 5);
        connect(&mut d).await;
        d.start().unwrap();
        d.stop();
        assert_eq!(d.history().entries()[0].state(), RequestState::Requested);

        gate.notify_one();
        pump_until(&mut d, |d| {
            d.history().entries()[0].state() == RequestState::Registered
        })
        .await;
        assert_eq!(d.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_pauses_scheduler() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api.clone(), 5);
        let recorded = Recorded::default();
        d.observe(Box::new(recorded.clone()));
        connect(&mut d).await;
        d.start().unwrap();

        d.dispatch(DriverEvent::Stream(StreamEvent::Error("reset".into())));
        assert!(d.pending_delay().is_none());
        assert_eq!(d.state(), SessionState::Reconnecting);
        assert_eq!(d.connection(), ConnectionState::Reconnecting);
        assert!(d.start().is_err());

        // Nothing fires while disconnected.
        tokio::time::sleep(Duration::from_secs(120)).await;
        while let Ok(event) = d.rx.try_recv() {
            d.dispatch(event);
        }
        assert_eq!(d.history().len(), 1);

        d.dispatch(open());
        assert_eq!(d.state(), SessionState::Stopped);
        d.start().unwrap();
        assert_eq!(d.history().len(), 2);

        let states = recorded.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                SessionState::Running,
                SessionState::Reconnecting,
                SessionState::Stopped,
                SessionState::Running,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_template_set_halts_without_reschedule() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api.clone(), 5);
        connect(&mut d).await;
        d.start().unwrap();

        api.templates.lock().unwrap().clear();
        d.refresh_templates();
        pump_until(&mut d, |d| d.templates().is_empty()).await;

        pump_until(&mut d, |d| d.pending_delay().is_none()).await;
        assert_eq!(d.history().len(), 1);
        assert_eq!(d.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_fetch_failure_is_noticed() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        *api.fail_templates.lock().unwrap() = true;
        let mut d = driver(api.clone(), 5);
        let recorded = Recorded::default();
        d.observe(Box::new(recorded.clone()));

        d.dispatch(open());
        assert!(d.step().await);

        assert!(d.templates().is_empty());
        assert!(matches!(
            recorded.notices.lock().unwrap().as_slice(),
            [Notice::TemplatesUnavailable(_)]
        ));
        assert_eq!(d.start_blockers(), vec![StartBlocker::NoTemplates]);

        *api.fail_templates.lock().unwrap() = false;
        assert!(d.dispatch(DriverEvent::Command(Command::RefreshTemplates)));
        assert!(d.step().await);
        assert_eq!(d.templates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_mismatch_blocks_start() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);
        let recorded = Recorded::default();
        d.observe(Box::new(recorded.clone()));

        d.dispatch(DriverEvent::Stream(StreamEvent::Open {
            subscribed_as: Some(UserId::new(USER + 1)),
        }));
        assert!(d.step().await);

        assert_eq!(d.start_blockers(), vec![StartBlocker::IdentityMismatch]);
        assert!(recorded
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| matches!(n, Notice::IdentityMismatch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_locked_while_running() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);
        connect(&mut d).await;

        d.set_window(30).unwrap();
        assert_eq!(d.window().secs(), 30);
        assert_eq!(d.set_window(3), Err(ControlError::WindowOutOfRange { secs: 3 }));

        d.start().unwrap();
        assert_eq!(d.set_window(10), Err(ControlError::WindowLocked));
        d.stop();
        d.set_window(10).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_ignored() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);
        connect(&mut d).await;
        d.start().unwrap();
        let stale = d.timer.as_ref().unwrap().id();
        d.stop();

        d.dispatch(DriverEvent::TimerFired(stale));
        assert_eq!(d.history().len(), 1);
        assert!(d.pending_delay().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_runs_only_while_armed() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);
        let recorded = Recorded::default();
        d.observe(Box::new(recorded.clone()));
        connect(&mut d).await;
        d.start().unwrap();

        let armed = d.pending_delay().unwrap();
        assert_eq!(d.time_to_next_request(), Some(armed));
        d.stop();
        assert_eq!(d.time_to_next_request(), None);
        assert_eq!(recorded.countdowns.lock().unwrap().last(), Some(&None));
        assert!(d.ticker.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_armed_timer_is_announced() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5);
        let recorded = Recorded::default();
        d.observe(Box::new(recorded.clone()));
        connect(&mut d).await;
        d.start().unwrap();

        let mut armed = vec![d.pending_delay().unwrap()];
        for len in 2..=6 {
            pump_until(&mut d, |d| d.history().len() == len).await;
            armed.push(d.pending_delay().unwrap());
        }
        d.stop();

        assert_eq!(*recorded.scheduled.lock().unwrap(), armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autostart_respects_operator_stop() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 5).with_autostart(true);
        connect(&mut d).await;
        assert_eq!(d.state(), SessionState::Running);

        d.dispatch(DriverEvent::Command(Command::Stop));
        d.dispatch(DriverEvent::Stream(StreamEvent::Error("reset".into())));
        d.dispatch(open());
        drain(&mut d).await;
        assert_eq!(d.state(), SessionState::Stopped);
        assert_eq!(d.history().len(), 1);

        // An explicit start clears the hold; the next reconnect resumes.
        d.start().unwrap();
        d.dispatch(DriverEvent::Stream(StreamEvent::Error("reset".into())));
        d.dispatch(open());
        pump_until(&mut d, |d| d.state() == SessionState::Running).await;
        assert_eq!(d.history().len(), 3);
    }

    #[test]
    fn test_parse_operator_commands() {
        assert_eq!("start".parse::<Command>(), Ok(Command::Start));
        assert_eq!("  window 30 ".parse::<Command>(), Ok(Command::SetWindow(30)));
        assert_eq!("quit".parse::<Command>(), Ok(Command::Shutdown));
        assert_eq!("refresh".parse::<Command>(), Ok(Command::RefreshTemplates));
        assert!("window".parse::<Command>().is_err());
        assert!("window soon".parse::<Command>().is_err());
        assert!("stop now".parse::<Command>().is_err());
        assert!("launch".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsed_operator_line_is_noticed() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let mut d = driver(api, 20);
        let rec = Recorded::default();
        d.observe(Box::new(rec.clone()));
        let handle = d.handle();

        assert!(handle.submit("jump"));
        assert!(handle.submit("window 30"));
        assert!(d.step().await);
        assert!(d.step().await);

        let notices = rec.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        match &notices[0] {
            Notice::Rejected(text) => {
                assert!(text.starts_with("unknown command: jump"));
                assert!(text.contains(COMMAND_USAGE));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(d.window().secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_loop() {
        let api = Arc::new(FakeApi::with_templates(&["t1"]));
        let d = driver(api, 5);
        let handle = d.handle();
        let task = tokio::spawn(d.run());
        assert!(handle.shutdown());
        let history = task.await.unwrap();
        assert!(history.is_empty());
    }
}
