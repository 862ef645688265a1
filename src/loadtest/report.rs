//! Terminal rendering of load-test results.

use std::io::Write;
use std::time::Duration;

use super::driver::{Notice, SessionObserver, SessionState};
use super::history::{HistoryEntry, HistoryObserver, HistoryStats, Progress};
use super::{ConnectionState, TemplateRef};

/// Column header for [`format_row`].
pub fn header() -> String {
    format!(
        "{:<5} | {:<24} | {:<10} | {:<12} | {:<10} | {:<10} | Details\n{:-<5}-|-{:-<24}-|-{:-<10}-|-{:-<12}-|-{:-<10}-|-{:-<10}-|-{:-<40}",
        "#", "Template", "State", "Requested", "Register", "Complete", "", "", "", "", "", "", ""
    )
}

/// One results-table row.
///
/// `Done` rows link to the rendered output, or show the error the service
/// reported for it; `Error` rows show the transport failure.
pub fn format_row(entry: &HistoryEntry, base_url: &str) -> String {
    let registration = entry
        .registration_latency()
        .map(|d| format!("+{} ms", d.num_milliseconds()))
        .unwrap_or_default();
    let completion = entry
        .completion_latency()
        .map(|d| format!("+{:.1} s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_default();

    let details = match &entry.progress {
        Progress::Requested => String::new(),
        Progress::Registered { token, .. } => format!("token {token}"),
        Progress::Error { error, .. } => format!("request failed: {error}"),
        Progress::Done { token, message, .. } => match &message.error {
            Some(error) => format!("print failed: {error}"),
            None => output_url(base_url, token),
        },
    };

    format!(
        "{:<5} | {:<24} | {:<10} | {:<12} | {:<10} | {:<10} | {}",
        entry.id.index() + 1,
        truncate(&entry.template.title, 24),
        entry.state().to_string().to_uppercase(),
        entry.requested_at.format("%H:%M:%S%.3f").to_string(),
        registration,
        completion,
        details
    )
}

/// `{base}/print/output/{token}`
pub fn output_url(base_url: &str, token: &str) -> String {
    format!("{}/print/output/{token}", base_url.trim_end_matches('/'))
}

pub fn format_stats(stats: &HistoryStats) -> String {
    let mut summary = format!(
        "{} request{}: {} pending, {} registered, {} failed, {} done ({} ok, {} with errors)",
        stats.total,
        if stats.total == 1 { "" } else { "s" },
        stats.requested,
        stats.registered,
        stats.errored,
        stats.done_ok + stats.done_failed,
        stats.done_ok,
        stats.done_failed,
    );
    if let Some(ms) = stats.mean_registration_ms {
        summary.push_str(&format!(", mean registration: {:.0} ms", ms));
    }
    if let Some(ms) = stats.mean_completion_ms {
        summary.push_str(&format!(", mean completion: {:.2} s", ms / 1000.0));
    }
    summary
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push('~');
    out
}

/// Prints one line per history update, either as a table row or as JSON.
pub struct ResultsPrinter<W> {
    out: W,
    base_url: String,
    json: bool,
}

impl<W: Write + Send> ResultsPrinter<W> {
    pub fn new(out: W, base_url: impl Into<String>, json: bool) -> Self {
        Self {
            out,
            base_url: base_url.into(),
            json,
        }
    }

    fn write_entry(&mut self, revision: u64, entry: &HistoryEntry) -> std::io::Result<()> {
        if self.json {
            let line = serde_json::json!({ "revision": revision, "entry": entry });
            writeln!(self.out, "{line}")
        } else {
            if revision == 1 {
                writeln!(self.out, "{}", header())?;
            }
            writeln!(self.out, "{}", format_row(entry, &self.base_url))
        }
    }
}

impl<W: Write + Send> HistoryObserver for ResultsPrinter<W> {
    fn history_changed(&mut self, revision: u64, entry: &HistoryEntry, _history: &[HistoryEntry]) {
        if let Err(e) = self.write_entry(revision, entry) {
            tracing::warn!(error = %e, "failed to write result row");
        }
    }
}

/// Reports session transitions and notices on a line-oriented sink.
pub struct StatusPrinter<W> {
    out: W,
}

impl<W: Write + Send> StatusPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn line(&mut self, text: String) {
        if let Err(e) = writeln!(self.out, "{text}") {
            tracing::warn!(error = %e, "failed to write status line");
        }
    }
}

impl<W: Write + Send> SessionObserver for StatusPrinter<W> {
    fn state_changed(&mut self, state: SessionState) {
        self.line(format!("[session] {state}"));
    }

    fn connection_changed(&mut self, connection: ConnectionState) {
        self.line(format!("[stream] {connection}"));
    }

    fn templates_changed(&mut self, templates: &[TemplateRef]) {
        let titles: Vec<&str> = templates.iter().map(|t| t.title.as_str()).collect();
        self.line(format!(
            "[templates] {} active: {}",
            templates.len(),
            titles.join(", ")
        ));
    }

    fn request_scheduled(&mut self, delay: Duration) {
        self.line(format!("[next] request in {:.1} s", delay.as_secs_f64()));
    }

    fn notice(&mut self, notice: &Notice) {
        let text = match notice {
            Notice::TemplatesUnavailable(e) => format!("[warn] cannot load active templates: {e}"),
            Notice::IdentityMismatch {
                expected,
                subscribed,
            } => format!("[error] stream is bound to user {subscribed}, expected {expected}"),
            Notice::StreamClosed(reason) => format!("[error] completion stream closed: {reason}"),
            Notice::Rejected(reason) => format!("[warn] {reason}"),
            Notice::Stats(stats) => format!("[stats] {}", format_stats(stats)),
        };
        self.line(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::correlator::CompletionMessage;
    use crate::loadtest::HistoryStore;
    use chrono::{DateTime, Utc};

    const BASE: &str = "http://localhost:4000";

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn store() -> HistoryStore {
        let mut store = HistoryStore::new();
        let ok = store.append(TemplateRef::new("t1", "Invoice"), at(0));
        let bad = store.append(TemplateRef::new("t2", "Receipt"), at(0));
        let err = store.append(TemplateRef::new("t1", "Invoice"), at(0));
        store.register(ok, "abc123".into(), at(42)).unwrap();
        store.register(bad, "def456".into(), at(10)).unwrap();
        store.fail(err, "connection refused".into(), at(5)).unwrap();
        store.complete(
            CompletionMessage {
                token: "abc123".into(),
                error: None,
            },
            at(2542),
        );
        store.complete(
            CompletionMessage {
                token: "def456".into(),
                error: Some("render failed".into()),
            },
            at(1010),
        );
        store
    }

    #[test]
    fn test_done_row_links_output() {
        let store = store();
        let row = format_row(&store.entries()[0], BASE);
        assert!(row.contains("Invoice"));
        assert!(row.contains("DONE"));
        assert!(row.contains("+42 ms"));
        assert!(row.contains("+2.5 s"));
        assert!(row.contains("http://localhost:4000/print/output/abc123"));
    }

    #[test]
    fn test_embedded_error_row() {
        let store = store();
        let row = format_row(&store.entries()[1], BASE);
        assert!(row.contains("print failed: render failed"));
        assert!(!row.contains("/print/output/"));
    }

    #[test]
    fn test_error_row() {
        let store = store();
        let row = format_row(&store.entries()[2], BASE);
        assert!(row.contains("ERROR"));
        assert!(row.contains("connection refused"));
    }

    #[test]
    fn test_output_url_trims_slash() {
        assert_eq!(
            output_url("http://h:4000/", "tok"),
            "http://h:4000/print/output/tok"
        );
    }

    #[test]
    fn test_format_stats() {
        let summary = format_stats(&store().stats());
        assert!(summary.contains("3 requests"));
        assert!(summary.contains("1 failed"));
        assert!(summary.contains("2 done (1 ok, 1 with errors)"));
        assert!(summary.contains("mean registration: 26 ms"));
        assert!(summary.contains("mean completion: 1.75 s"));
    }

    #[test]
    fn test_format_stats_single() {
        let summary = format_stats(&HistoryStats {
            total: 1,
            requested: 1,
            ..Default::default()
        });
        assert!(summary.starts_with("1 request:"));
        assert!(!summary.contains("mean"));
    }

    #[test]
    fn test_truncate_long_title() {
        let t = truncate("A very long template title indeed", 10);
        assert_eq!(t.chars().count(), 10);
        assert!(t.ends_with('~'));
    }

    #[test]
    fn test_results_printer_json_lines() {
        let shared = SharedBuf(std::sync::Arc::new(std::sync::Mutex::new(Vec::new())));
        let mut store = HistoryStore::new();
        store.subscribe(Box::new(ResultsPrinter::new(shared.clone(), BASE, true)));
        let id = store.append(TemplateRef::new("t1", "Invoice"), at(0));
        store.fail(id, "timeout".into(), at(1)).unwrap();

        let lines: Vec<serde_json::Value> = shared
            .text()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["revision"], 1);
        assert_eq!(lines[0]["entry"]["state"], "REQUESTED");
        assert_eq!(lines[1]["entry"]["state"], "ERROR");
        assert_eq!(lines[1]["entry"]["error"], "timeout");
    }

    #[test]
    fn test_results_printer_writes_header_once() {
        let shared = SharedBuf(std::sync::Arc::new(std::sync::Mutex::new(Vec::new())));
        let mut store = HistoryStore::new();
        store.subscribe(Box::new(ResultsPrinter::new(shared.clone(), BASE, false)));
        let id = store.append(TemplateRef::new("t1", "Invoice"), at(0));
        store.register(id, "abc".into(), at(1)).unwrap();

        let text = shared.text();
        assert_eq!(text.matches("Template").count(), 1);
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("REGISTERED"));
    }

    #[test]
    fn test_status_printer_notices() {
        let shared = SharedBuf(std::sync::Arc::new(std::sync::Mutex::new(Vec::new())));
        let mut printer = StatusPrinter::new(shared.clone());
        printer.state_changed(SessionState::Running);
        printer.notice(&Notice::StreamClosed("status 404".into()));

        let text = shared.text();
        assert!(text.contains("[session] running"));
        assert!(text.contains("completion stream closed: status 404"));
    }

    #[test]
    fn test_status_printer_reports_every_scheduled_request() {
        let shared = SharedBuf(std::sync::Arc::new(std::sync::Mutex::new(Vec::new())));
        let mut printer = StatusPrinter::new(shared.clone());
        printer.request_scheduled(Duration::from_millis(3200));
        printer.countdown(Some(Duration::from_millis(3100)));
        printer.countdown(Some(Duration::from_millis(3000)));
        // Shorter than what the countdown still showed.
        printer.request_scheduled(Duration::from_millis(40));
        printer.countdown(None);

        let text = shared.text();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("[next] request in 3.2 s"));
        assert!(text.contains("[next] request in 0.0 s"));
    }

    #[derive(Clone)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
