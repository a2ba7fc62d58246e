use anyhow::Result;
use chrono::Utc;
use pixelmuse_core::{EventEnvelope, TelemetryConfig, runtime_dir};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a log line means to the user. `Debug` lines reach stderr only in
/// verbose mode; `Warn` lines always reach stderr and the log file. Backend
/// errors shown to the user as a generic bubble are recorded as warnings
/// with their real cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Warn,
}

/// Session logger: appends structured events to `.pixelmuse/observe.log` and
/// optionally mirrors each one to a telemetry endpoint.
pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(workspace: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry,
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn record_event(&self, event: &EventEnvelope) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))?;
        self.post_telemetry(event);
        Ok(())
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Debug => {
                if self.verbose {
                    eprintln!("[pixelmuse] {msg}");
                }
            }
            LogLevel::Warn => {
                eprintln!("[pixelmuse WARN] {msg}");
                let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
            }
        }
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Fire-and-forget: the POST happens in a background thread so it never
    /// blocks the UI thread, and a send failure only leaves a log line.
    fn post_telemetry(&self, event: &EventEnvelope) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        let body = json!({
            "name": "pixelmuse.event",
            "at": Utc::now().to_rfc3339(),
            "payload": {
                "session_id": event.session_id,
                "seq_no": event.seq_no,
                "kind": event.kind,
            },
        });
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}
