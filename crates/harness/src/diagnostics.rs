//! Failure diagnostics
//!
//! Best effort by construction: a capture that fails or hangs is logged and
//! dropped so it can never replace the failure being diagnosed. Only the
//! first failure of a run is captured; later calls leave it in place.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactKind, ArtifactSink, Trigger};
use crate::events::EventLog;
use crate::page::{CaptureTarget, Page};

pub const FAILURE_SCREENSHOT: &str = "failure.png";
pub const EVENT_DUMP: &str = "events.log";

pub struct Diagnostics {
    sink: ArtifactSink,
    log: EventLog,
    timeout: Duration,
    captured: Mutex<Option<Vec<Artifact>>>,
}

impl Diagnostics {
    /// `sink` should already be scoped to the scenario.
    pub fn new(sink: ArtifactSink, log: EventLog, timeout: Duration) -> Self {
        Self {
            sink,
            log,
            timeout,
            captured: Mutex::new(None),
        }
    }

    /// Full-page screenshot plus a dump of the event log.
    pub async fn capture(&self, page: &dyn Page) -> Vec<Artifact> {
        if let Some(done) = self.captured.lock().as_ref() {
            debug!("Failure already diagnosed, keeping {} artifact(s)", done.len());
            return done.clone();
        }
        let mut artifacts = Vec::new();

        match tokio::time::timeout(self.timeout, page.screenshot(&CaptureTarget::FullPage)).await {
            Ok(Ok(png)) => {
                if let Some(artifact) =
                    self.write(FAILURE_SCREENSHOT, &png, ArtifactKind::Screenshot)
                {
                    artifacts.push(artifact);
                }
            }
            Ok(Err(e)) => warn!("Failure screenshot could not be taken: {}", e),
            Err(_) => warn!(
                "Failure screenshot timed out after {} ms",
                self.timeout.as_millis()
            ),
        }

        artifacts.extend(self.write_log());
        *self.captured.lock() = Some(artifacts.clone());
        artifacts
    }

    /// Event log only, for failures before any page exists.
    pub fn dump_log(&self) -> Option<Artifact> {
        if self.captured.lock().is_some() {
            return None;
        }
        let artifact = self.write_log();
        *self.captured.lock() = Some(artifact.iter().cloned().collect());
        artifact
    }

    /// What the diagnosed failure left behind, empty if none was captured
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.captured.lock().clone().unwrap_or_default()
    }

    fn write_log(&self) -> Option<Artifact> {
        let mut text = self.log.lines().join("\n");
        text.push('\n');
        self.write(EVENT_DUMP, text.as_bytes(), ArtifactKind::Log)
    }

    fn write(&self, name: &str, data: &[u8], kind: ArtifactKind) -> Option<Artifact> {
        match self.sink.write(Path::new(name), data, kind, Trigger::Failure) {
            Ok(artifact) => {
                info!("Saved failure artifact {}", artifact.path.display());
                Some(artifact)
            }
            Err(e) => {
                warn!("Could not write failure artifact {}: {}", name, e);
                None
            }
        }
    }
}
