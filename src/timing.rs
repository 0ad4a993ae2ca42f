//! Nested major/minor span recorder. Supersedes
//! `original_source/proxy/timing/timing.go`'s flat `map[Time]Duration`:
//! every major phase (Dial host, Write request, ...) owns its own
//! ordered list of minor sub-spans instead of sharing one flat map.

use std::time::{Duration, Instant};

use serde::Serialize;

struct OpenMinor {
    name: String,
    start: Instant,
}

struct OpenMajor {
    name: String,
    start: Instant,
    minors: Vec<MinorSpan>,
    open_minor: Option<OpenMinor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MinorSpan {
    pub name: String,
    pub start_ms: u128,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct MajorSpan {
    pub name: String,
    pub start_ms: u128,
    pub duration_ms: u128,
    pub minors: Vec<MinorSpan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingExport {
    pub spans: Vec<MajorSpan>,
    pub total_ms: u128,
}

/// Recorder for one request's lifetime. Not `Send` across await points by
/// design choice of its owner (the engine task) — it is only ever
/// touched from the single task driving that connection's state machine.
pub struct Timing {
    epoch: Instant,
    closed: Vec<MajorSpan>,
    open: Option<OpenMajor>,
}

impl Timing {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            closed: Vec::new(),
            open: None,
        }
    }

    /// Starts a new major span. Panics if a major span is already open —
    /// major spans do not nest, only their minors do.
    pub fn start(&mut self, name: &str) {
        assert!(self.open.is_none(), "timing: major span already open, call stop() first");
        self.open = Some(OpenMajor {
            name: name.to_string(),
            start: Instant::now(),
            minors: Vec::new(),
            open_minor: None,
        });
    }

    /// Closes the current major span. Panics if a minor span is still
    /// open inside it.
    pub fn stop(&mut self) {
        let open = self.open.take().expect("timing: stop() with no open major span");
        assert!(open.open_minor.is_none(), "timing: major span closed with an open minor span");
        self.closed.push(MajorSpan {
            name: open.name,
            start_ms: (open.start - self.epoch).as_millis(),
            duration_ms: open.start.elapsed().as_millis(),
            minors: open.minors,
        });
    }

    pub fn substart(&mut self, name: &str) {
        let open = self.open.as_mut().expect("timing: substart() with no open major span");
        assert!(open.open_minor.is_none(), "timing: minor span already open, call substop() first");
        open.open_minor = Some(OpenMinor {
            name: name.to_string(),
            start: Instant::now(),
        });
    }

    pub fn substop(&mut self) {
        let epoch = self.epoch;
        let open = self.open.as_mut().expect("timing: substop() with no open major span");
        let minor = open.open_minor.take().expect("timing: substop() with no open minor span");
        open.minors.push(MinorSpan {
            name: minor.name,
            start_ms: (minor.start - epoch).as_millis(),
            duration_ms: minor.start.elapsed().as_millis(),
        });
    }

    pub fn export(&self) -> TimingExport {
        let total_ms = match (self.closed.first(), self.closed.last()) {
            (Some(first), Some(last)) => (last.start_ms + last.duration_ms).saturating_sub(first.start_ms),
            _ => 0,
        };
        TimingExport {
            spans: self.closed.clone(),
            total_ms,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}
