//! Scripted location source shared by collector unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::collector::{FetchError, LocationPage, LocationSource};
use crate::storage::{Cursor, LocationRecord};

pub(crate) fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
}

pub(crate) fn sample_records() -> Vec<LocationRecord> {
    vec![
        LocationRecord::new("truck-1", at(8, 0, 0), 52.52, 13.405).with_speed(40.0),
        LocationRecord::new("truck-2", at(8, 0, 5), 48.137, 11.575).with_heading(180.0),
        LocationRecord::new("truck-3", at(8, 0, 9), 50.110, 8.682),
    ]
}

/// Collects formatted log output of the current thread.
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's events into a fresh capture until the guard drops.
    pub(crate) fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Captured lines containing `message`.
    pub(crate) fn lines_with(&self, message: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(message))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Replays a fixed list of responses, then returns empty pages.
pub(crate) struct ScriptedSource {
    script: Mutex<VecDeque<Result<LocationPage, FetchError>>>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetched_at: Mutex<Vec<tokio::time::Instant>>,
    cursors: Mutex<Vec<Option<Cursor>>>,
}

impl ScriptedSource {
    pub(crate) fn new(script: Vec<Result<LocationPage, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetched_at: Mutex::new(Vec::new()),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Make every fetch take `latency` of (virtual) time.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_times(&self) -> Vec<tokio::time::Instant> {
        self.fetched_at.lock().unwrap().clone()
    }

    pub(crate) fn cursors(&self) -> Vec<Option<Cursor>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LocationSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_locations(&self, cursor: Option<&Cursor>) -> Result<LocationPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched_at
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        self.cursors.lock().unwrap().push(cursor.cloned());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(LocationPage::default()))
    }
}
