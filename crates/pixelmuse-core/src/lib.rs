use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Fixed bubble shown for any transport or parse failure of a backend call.
pub const REQUEST_ERROR_BUBBLE: &str = "Sorry, there was an error processing your request.";
/// Fixed bubble shown when the speech recognizer reports an error.
pub const VOICE_ERROR_BUBBLE: &str = "Sorry, there was an error processing your voice input.";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".pixelmuse")
}

// ─── Submission routing ──────────────────────────────────────────────────────

/// Which backend operation a submission maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    /// Text-to-image: POST JSON to `/generate`.
    Generate,
    /// Image editing: POST multipart to `/edit`.
    Edit,
}

/// One validated user submission: trimmed prompt text plus an optional
/// attached image. Construct via [`Submission::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub prompt: String,
    pub image: Option<PathBuf>,
}

impl Submission {
    /// Collects a submission from the raw input line and the pending image.
    /// Returns `None` when both are empty — an empty submission is silently
    /// ignored, never an error.
    pub fn plan(text: &str, image: Option<PathBuf>) -> Option<Self> {
        let prompt = text.trim().to_string();
        if prompt.is_empty() && image.is_none() {
            return None;
        }
        Some(Self { prompt, image })
    }

    /// Any attached image routes to the edit endpoint, with or without text.
    pub fn kind(&self) -> SubmissionKind {
        if self.image.is_some() {
            SubmissionKind::Edit
        } else {
            SubmissionKind::Generate
        }
    }
}

// ─── Backend response model ──────────────────────────────────────────────────

/// Wire shape returned by both `/generate` and `/edit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filenames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal render outcome of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// One image bubble per filename, in response order.
    Images(Vec<String>),
    /// Application error text, shown verbatim as an AI bubble.
    Error(String),
    /// Neither filenames nor error: render nothing.
    Silent,
}

impl BackendResponse {
    pub fn interpret(&self) -> Outcome {
        if self.message.is_some()
            && let Some(filenames) = &self.filenames
        {
            return Outcome::Images(filenames.clone());
        }
        if let Some(error) = &self.error {
            return Outcome::Error(error.clone());
        }
        Outcome::Silent
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub ui: UiConfig,
    pub voice: VoiceConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the image-generation service.
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// When true, disable spinner animations (accessibility/reduced-motion).
    pub reduced_motion: bool,
    /// Whether the gallery panel starts visible.
    pub gallery_visible: bool,
    /// Where `/download` saves images. Empty = `~/Downloads`, falling back
    /// to the workspace directory.
    pub downloads_dir: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            reduced_motion: false,
            gallery_visible: false,
            downloads_dir: String::new(),
        }
    }
}

impl UiConfig {
    pub fn resolve_downloads_dir(&self, workspace: &Path) -> PathBuf {
        if !self.downloads_dir.trim().is_empty() {
            return PathBuf::from(self.downloads_dir.trim());
        }
        dirs::download_dir().unwrap_or_else(|| workspace.to_path_buf())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    /// External transcriber command. It must record one utterance and print
    /// the final transcript on stdout.
    pub command: String,
    pub language: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "pixelmuse-transcribe".to_string(),
            language: "en-US".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_timeout_seconds() -> u64 {
    120
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".pixelmuse/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Load settings layered defaults → legacy TOML → user → project → local,
    /// deep-merged as JSON so partial files override only what they name.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// Load if any settings file exists, otherwise write and return defaults.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

// ─── Observability events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    SubmissionSent {
        request_id: u64,
        mode: String,
    },
    ResponseReceived {
        request_id: u64,
        image_count: usize,
    },
    RequestFailed {
        request_id: u64,
        reason: String,
    },
    ImageSaved {
        filename: String,
    },
    ImageSelected {
        filename: String,
    },
    DictationStarted,
    DictationFinished {
        transcribed: bool,
    },
}
