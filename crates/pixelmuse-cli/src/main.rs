use anyhow::{Context, Result};
use clap::Parser;
use pixelmuse_client::{HttpBackend, ImageBackend, download_image};
use pixelmuse_core::{
    AppConfig, EventEnvelope, EventKind, Outcome, Submission, SubmissionKind,
};
use pixelmuse_observe::{LogLevel, Observer};
use pixelmuse_ui::{ImageAction, ShellOptions, UiEvent, run_chat_shell};
use pixelmuse_voice::{CommandEngine, DictationEvent, DictationSession};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pixelmuse")]
#[command(about = "Chat client for an image generation and editing service", long_about = None)]
struct Cli {
    /// Workspace directory (settings and logs live under .pixelmuse/ here).
    #[arg(short = 'C', long = "workspace", default_value = ".")]
    workspace: PathBuf,

    /// Override the backend base URL for this invocation.
    #[arg(long = "base-url")]
    base_url: Option<String>,

    /// Disable spinner animations.
    #[arg(long = "reduced-motion")]
    reduced_motion: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Write default settings to .pixelmuse/settings.json and exit.
    #[arg(long = "init")]
    init: bool,

    /// Print the effective settings as JSON and exit.
    #[arg(long = "config")]
    config: bool,

    /// Non-interactive mode: submit one generation prompt, print the
    /// response JSON to stdout, then exit.
    #[arg(short = 'p', long = "print")]
    print_prompt: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", pixelmuse_errors::handle(&err));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", cli.workspace.display()))?;

    if cli.init {
        let cfg = AppConfig::default();
        cfg.save(&workspace)?;
        println!(
            "wrote {}",
            AppConfig::project_settings_path(&workspace).display()
        );
        return Ok(());
    }

    let mut cfg = AppConfig::ensure(&workspace)?;
    if let Some(base_url) = &cli.base_url {
        cfg.backend.base_url = base_url.trim_end_matches('/').to_string();
    }
    if cli.reduced_motion {
        cfg.ui.reduced_motion = true;
    }

    if cli.config {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        return Ok(());
    }

    let mut observer = Observer::new(&workspace, &cfg.telemetry)?;
    observer.set_verbose(cli.verbose);
    let observer = Arc::new(observer);
    let backend = Arc::new(HttpBackend::new(&cfg.backend)?);

    if let Some(prompt) = &cli.print_prompt {
        return run_print_mode(backend.as_ref(), prompt);
    }

    run_chat(workspace, cfg, backend, observer)
}

/// One-shot generation for scripts: the raw response JSON goes to stdout,
/// transport failures exit non-zero with the standard error bubble.
fn run_print_mode(backend: &HttpBackend, prompt: &str) -> Result<()> {
    let Some(submission) = Submission::plan(prompt, None) else {
        anyhow::bail!("empty prompt");
    };
    let response = backend
        .generate(&submission.prompt)
        .context(pixelmuse_core::REQUEST_ERROR_BUBBLE)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Outcome::Error(_) = response.interpret() {
        std::process::exit(2);
    }
    Ok(())
}

fn run_chat(
    workspace: PathBuf,
    cfg: AppConfig,
    backend: Arc<HttpBackend>,
    observer: Arc<Observer>,
) -> Result<()> {
    let session_id = Uuid::new_v4();
    let seq = Arc::new(AtomicU64::new(0));
    let next_request = AtomicU64::new(1);
    let (ui_tx, ui_rx) = mpsc::channel::<UiEvent>();
    let downloads_dir = cfg.ui.resolve_downloads_dir(&workspace);

    let recorder = Recorder {
        observer: Arc::clone(&observer),
        seq: Arc::clone(&seq),
        session_id,
    };

    // Dictation: engine events are bridged onto the UI channel; the session
    // state machine is shared with the mic-toggle closure.
    let engine = CommandEngine::new(cfg.voice.command.clone(), cfg.voice.language.clone());
    let session = Arc::new(Mutex::new(DictationSession::new(Box::new(engine))));
    let voice_available =
        cfg.voice.enabled && session.lock().map(|s| s.available()).unwrap_or(false);
    let (voice_tx, voice_rx) = mpsc::channel::<DictationEvent>();
    {
        let ui_tx = ui_tx.clone();
        let session = Arc::clone(&session);
        let recorder = recorder.clone();
        let transcribed = AtomicBool::new(false);
        thread::spawn(move || {
            while let Ok(event) = voice_rx.recv() {
                if let Ok(mut session) = session.lock() {
                    session.on_event(&event);
                }
                match &event {
                    DictationEvent::Transcript(_) => transcribed.store(true, Ordering::SeqCst),
                    DictationEvent::Ended => {
                        recorder.record(EventKind::DictationFinished {
                            transcribed: transcribed.swap(false, Ordering::SeqCst),
                        });
                    }
                    DictationEvent::Error(_) => {}
                }
                if ui_tx.send(UiEvent::Dictation(event)).is_err() {
                    break;
                }
            }
        });
    }

    let opts = ShellOptions {
        reduced_motion: cfg.ui.reduced_motion,
        gallery_visible: cfg.ui.gallery_visible,
        voice_available,
        backend_label: cfg.backend.base_url.clone(),
    };

    let on_submit = {
        let backend = Arc::clone(&backend);
        let observer = Arc::clone(&observer);
        let recorder = recorder.clone();
        let ui_tx = ui_tx.clone();
        move |submission: &Submission| -> u64 {
            let request = next_request.fetch_add(1, Ordering::SeqCst);
            let mode = match submission.kind() {
                SubmissionKind::Generate => "generate",
                SubmissionKind::Edit => "edit",
            };
            recorder.record(EventKind::SubmissionSent {
                request_id: request,
                mode: mode.to_string(),
            });

            let backend = Arc::clone(&backend);
            let observer = Arc::clone(&observer);
            let recorder = recorder.clone();
            let ui_tx = ui_tx.clone();
            let submission = submission.clone();
            thread::spawn(move || {
                let result = match submission.kind() {
                    SubmissionKind::Generate => backend.generate(&submission.prompt),
                    SubmissionKind::Edit => match &submission.image {
                        Some(image) => backend.edit(image, &submission.prompt),
                        None => backend.generate(&submission.prompt),
                    },
                };
                match result {
                    Ok(response) => {
                        let outcome = response.interpret();
                        let filenames = match &outcome {
                            Outcome::Images(filenames) => filenames.clone(),
                            _ => Vec::new(),
                        };
                        recorder.record(EventKind::ResponseReceived {
                            request_id: request,
                            image_count: filenames.len(),
                        });
                        if ui_tx.send(UiEvent::Completed { request, outcome }).is_err() {
                            return;
                        }
                        // Bubbles carry the bytes; fetched sequentially so
                        // they land in response order.
                        for filename in filenames {
                            match backend.fetch_image(&filename) {
                                Ok(data) => {
                                    let _ = ui_tx.send(UiEvent::ImageBubble { filename, data });
                                }
                                Err(err) => {
                                    observer.log(
                                        LogLevel::Warn,
                                        &format!("image fetch failed for {filename}: {err}"),
                                    );
                                    let _ = ui_tx.send(UiEvent::ActionFailed {
                                        message: format!("could not load {filename}"),
                                    });
                                }
                            }
                        }
                    }
                    Err(err) => {
                        // The user sees the fixed bubble; the log keeps the cause.
                        observer.log(
                            LogLevel::Warn,
                            &format!("request {request} failed: {err:#}"),
                        );
                        recorder.record(EventKind::RequestFailed {
                            request_id: request,
                            reason: err.to_string(),
                        });
                        let _ = ui_tx.send(UiEvent::TransportFailed { request });
                    }
                }
            });
            request
        }
    };

    let on_image_action = {
        let backend = Arc::clone(&backend);
        let recorder = recorder.clone();
        let ui_tx = ui_tx.clone();
        move |action: ImageAction| {
            let backend = Arc::clone(&backend);
            let recorder = recorder.clone();
            let ui_tx = ui_tx.clone();
            let downloads_dir = downloads_dir.clone();
            thread::spawn(move || match action {
                ImageAction::Download(filename) => {
                    match download_image(backend.as_ref(), &filename, &downloads_dir) {
                        Ok(path) => {
                            recorder.record(EventKind::ImageSaved {
                                filename: filename.clone(),
                            });
                            let _ = ui_tx.send(UiEvent::ImageSaved { filename, path });
                        }
                        Err(err) => {
                            let _ = ui_tx.send(UiEvent::ActionFailed {
                                message: format!("could not save {filename}: {err}"),
                            });
                        }
                    }
                }
                ImageAction::Select(filename) => {
                    match fetch_to_temp(backend.as_ref(), &filename) {
                        Ok(path) => {
                            recorder.record(EventKind::ImageSelected {
                                filename: filename.clone(),
                            });
                            let _ = ui_tx.send(UiEvent::ImageSelected { filename, path });
                        }
                        Err(err) => {
                            let _ = ui_tx.send(UiEvent::ActionFailed {
                                message: format!("could not select {filename}: {err}"),
                            });
                        }
                    }
                }
            });
        }
    };

    let on_mic_toggle = {
        let session = Arc::clone(&session);
        let recorder = recorder.clone();
        let ui_tx = ui_tx.clone();
        move || -> bool {
            let Ok(mut session) = session.lock() else {
                return false;
            };
            let was_listening = session.is_listening();
            match session.toggle(&voice_tx) {
                Ok(state) => {
                    if !was_listening && state == pixelmuse_voice::DictationState::Listening {
                        recorder.record(EventKind::DictationStarted);
                    }
                    // After a stop request the engine winds down via its
                    // Ended event; show the stop immediately.
                    !was_listening && session.is_listening()
                }
                Err(err) => {
                    // Spawn failure: surface the standard voice bubble.
                    let _ = ui_tx.send(UiEvent::Dictation(DictationEvent::Error(err.to_string())));
                    false
                }
            }
        }
    };

    run_chat_shell(opts, ui_rx, on_submit, on_image_action, on_mic_toggle)
}

/// Session event log shared by the worker threads. Logging never blocks or
/// fails a user-visible operation.
#[derive(Clone)]
struct Recorder {
    observer: Arc<Observer>,
    seq: Arc<AtomicU64>,
    session_id: Uuid,
}

impl Recorder {
    fn record(&self, kind: EventKind) {
        let envelope = EventEnvelope {
            seq_no: self.seq.fetch_add(1, Ordering::SeqCst),
            at: chrono::Utc::now(),
            session_id: self.session_id,
            kind,
        };
        if let Err(err) = self.observer.record_event(&envelope) {
            self.observer
                .log(LogLevel::Debug, &format!("event log failed: {err}"));
        }
    }
}

/// Fetch a generated image into a temp file so a follow-up prompt can edit it.
fn fetch_to_temp(backend: &dyn ImageBackend, filename: &str) -> Result<PathBuf> {
    let name = pixelmuse_client::safe_filename(filename)?;
    let data = backend.fetch_image(filename)?;
    let path = std::env::temp_dir().join(format!("pixelmuse-{}-{name}", Uuid::new_v4()));
    std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
