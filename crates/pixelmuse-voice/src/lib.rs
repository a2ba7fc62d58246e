use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

/// Events sent from a dictation session back to the UI event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictationEvent {
    /// A final transcript was recognized. The UI fills the input line with it
    /// and submits automatically.
    Transcript(String),
    /// The recognizer reported an error. Rendered as a fixed AI bubble.
    Error(String),
    /// The session ended (with or without a transcript).
    Ended,
}

/// A speech recognizer. The engine is an external collaborator; the trait
/// exists so the session state machine can be driven by a fake in tests.
pub trait DictationEngine: Send {
    /// Whether the recognizer can be used at all. Checked once at startup;
    /// when false the mic control is permanently disabled.
    fn available(&self) -> bool;

    /// Start one recognition session. Events arrive on `tx` from a
    /// background thread; every session eventually sends `Ended`.
    fn start(&mut self, tx: mpsc::Sender<DictationEvent>) -> Result<()>;

    /// Stop the active session, if any.
    fn stop(&mut self);
}

/// Engine backed by an external transcriber command. The command records one
/// utterance and prints the final transcript on stdout; a non-zero exit is a
/// recognizer error unless we killed it ourselves via `stop`.
pub struct CommandEngine {
    command: String,
    language: String,
    child: Arc<Mutex<Option<Child>>>,
    stopping: Arc<AtomicBool>,
}

impl CommandEngine {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
            child: Arc::new(Mutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DictationEngine for CommandEngine {
    fn available(&self) -> bool {
        !self.command.trim().is_empty() && which::which(self.command.trim()).is_ok()
    }

    fn start(&mut self, tx: mpsc::Sender<DictationEvent>) -> Result<()> {
        self.stopping.store(false, Ordering::SeqCst);
        let mut child = Command::new(self.command.trim())
            .arg("--language")
            .arg(&self.language)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning transcriber '{}'", self.command))?;
        let stdout = child.stdout.take();
        if let Ok(mut slot) = self.child.lock() {
            *slot = Some(child);
        }

        let slot = Arc::clone(&self.child);
        let stopping = Arc::clone(&self.stopping);
        thread::spawn(move || {
            let mut transcript = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut transcript);
            }
            let status = slot
                .lock()
                .ok()
                .and_then(|mut guard| guard.take())
                .map(|mut child| child.wait());

            match status {
                Some(Ok(exit)) if exit.success() => {
                    let transcript = transcript.trim();
                    if !transcript.is_empty() {
                        let _ = tx.send(DictationEvent::Transcript(transcript.to_string()));
                    }
                }
                Some(Ok(exit)) => {
                    if !stopping.load(Ordering::SeqCst) {
                        let _ = tx.send(DictationEvent::Error(format!(
                            "transcriber exited with {exit}"
                        )));
                    }
                }
                Some(Err(err)) => {
                    let _ = tx.send(DictationEvent::Error(format!("transcriber failed: {err}")));
                }
                // stop() already reaped the child
                None => {}
            }
            let _ = tx.send(DictationEvent::Ended);
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.child.lock()
            && let Some(child) = slot.as_mut()
        {
            let _ = child.kill();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DictationState {
    #[default]
    Idle,
    Listening,
}

/// The mic control's state machine: `idle → listening → idle`, at most one
/// session active. Clicking while listening stops rather than starts.
pub struct DictationSession {
    engine: Box<dyn DictationEngine>,
    state: DictationState,
    available: bool,
}

impl DictationSession {
    pub fn new(engine: Box<dyn DictationEngine>) -> Self {
        let available = engine.available();
        Self {
            engine,
            state: DictationState::Idle,
            available,
        }
    }

    /// Capability detected at startup; never re-checked.
    pub fn available(&self) -> bool {
        self.available
    }

    pub fn state(&self) -> DictationState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state == DictationState::Listening
    }

    /// The mic control was activated. Starts a session when idle, stops the
    /// active one when listening. Without capability this is a no-op and the
    /// session never starts.
    pub fn toggle(&mut self, tx: &mpsc::Sender<DictationEvent>) -> Result<DictationState> {
        if !self.available {
            return Ok(self.state);
        }
        match self.state {
            DictationState::Idle => {
                self.engine.start(tx.clone())?;
                self.state = DictationState::Listening;
            }
            DictationState::Listening => {
                self.engine.stop();
                // state resets when the engine's Ended event arrives
            }
        }
        Ok(self.state)
    }

    /// Feed an engine event through the state machine. Terminal events reset
    /// the session to idle.
    pub fn on_event(&mut self, event: &DictationEvent) {
        match event {
            DictationEvent::Transcript(_) => {}
            DictationEvent::Error(_) | DictationEvent::Ended => {
                self.state = DictationState::Idle;
            }
        }
    }
}
