//! Inline-viewport chat shell for the image chat client.
//!
//! The bottom few terminal rows are managed by ratatui (activity line,
//! input prompt, status bar); everything above is native terminal
//! scrollback, so generated output can be scrolled and selected with the
//! terminal's own facilities. Transcript entries are printed into
//! scrollback via `insert_before` exactly once.

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use pixelmuse_core::{Outcome, REQUEST_ERROR_BUBBLE, Submission, VOICE_ERROR_BUBBLE};
use pixelmuse_voice::DictationEvent;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Paragraph, Widget, Wrap};
use ratatui::{TerminalOptions, Viewport};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        // Show cursor in case it was hidden
        let _ = crossterm::execute!(io::stdout(), crossterm::cursor::Show);
    }
}

const INPUT_MAX_HEIGHT: u16 = 4;
const ACTIVITY_HEIGHT: u16 = 1;
// activity + separator + input + separator + status
const INLINE_VIEWPORT_HEIGHT: u16 = ACTIVITY_HEIGHT + INPUT_MAX_HEIGHT + 3;

// ─── Transcript model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    Ai,
    System,
    Error,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub kind: MessageKind,
    pub text: String,
}

/// Pure shell state: the transcript, the gallery of generated images, and
/// the set of submissions still waiting on the backend. Kept free of any
/// terminal handles so the state machine is directly testable.
#[derive(Debug, Clone, Default)]
pub struct ChatShell {
    pub transcript: Vec<TranscriptEntry>,
    /// Filenames of every generated image this session, in arrival order.
    /// `/download <n>` and `/select <n>` index into this list (1-based).
    pub gallery: Vec<String>,
    pub gallery_visible: bool,
    /// Image attached to the next submission (via `/attach` or `/select`).
    pub pending_image: Option<PathBuf>,
    /// Request ids of submissions whose responses have not arrived yet.
    /// Rendered as the activity spinner; out-of-order completion only
    /// clears the matching id.
    pub pending_requests: Vec<u64>,
    pub spinner_tick: usize,
    /// When true, disable spinner animations (accessibility/reduced-motion).
    pub reduced_motion: bool,
    pub listening: bool,
}

impl ChatShell {
    pub fn push_user(&mut self, line: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            kind: MessageKind::User,
            text: line.into(),
        });
    }

    pub fn push_ai(&mut self, line: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            kind: MessageKind::Ai,
            text: line.into(),
        });
    }

    pub fn push_system(&mut self, line: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            kind: MessageKind::System,
            text: line.into(),
        });
    }

    pub fn push_error(&mut self, line: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            kind: MessageKind::Error,
            text: line.into(),
        });
    }

    /// A submission left for the backend; show its loading marker.
    pub fn begin_request(&mut self, request: u64) {
        self.pending_requests.push(request);
    }

    /// Remove the loading marker for `request`. Safe to call more than once
    /// and for ids that were already cleared.
    pub fn clear_loading(&mut self, request: u64) {
        self.pending_requests.retain(|id| *id != request);
    }

    pub fn is_busy(&self) -> bool {
        !self.pending_requests.is_empty()
    }

    /// Fold one finished submission into the transcript. Image filenames
    /// join the gallery in response order; their bubbles arrive separately
    /// once the bytes are fetched. An application error is echoed verbatim
    /// as an AI bubble; the silent case renders nothing.
    pub fn apply_outcome(&mut self, request: u64, outcome: &Outcome) {
        self.clear_loading(request);
        match outcome {
            Outcome::Images(filenames) => {
                for filename in filenames {
                    self.gallery.push(filename.clone());
                }
            }
            Outcome::Error(text) => self.push_ai(text.clone()),
            Outcome::Silent => {}
        }
    }

    /// A submission died at the transport level: the marker goes away and
    /// the fixed error bubble stands in for the answer.
    pub fn apply_transport_failure(&mut self, request: u64) {
        self.clear_loading(request);
        self.push_ai(REQUEST_ERROR_BUBBLE);
    }

    /// Flip the gallery panel; returns the new visibility.
    pub fn toggle_gallery(&mut self) -> bool {
        self.gallery_visible = !self.gallery_visible;
        self.gallery_visible
    }

    /// Numbered gallery listing for the panel and for `/download` hints.
    pub fn gallery_lines(&self) -> Vec<String> {
        if self.gallery.is_empty() {
            return vec!["(no generated images yet)".to_string()];
        }
        self.gallery
            .iter()
            .enumerate()
            .map(|(idx, name)| format!("{}. {name}", idx + 1))
            .collect()
    }

    /// 1-based gallery lookup used by `/download <n>` and `/select <n>`.
    pub fn gallery_item(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.gallery.get(index - 1).map(String::as_str)
    }

    fn spinner_frame(&self) -> &'static str {
        if self.reduced_motion {
            return "●";
        }
        const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
        FRAMES[self.spinner_tick % FRAMES.len()]
    }
}

// ─── Slash commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Help,
    /// Attach a local image to the next submission.
    Attach(String),
    Detach,
    /// Save gallery image n to the downloads directory.
    Download(usize),
    /// Re-attach gallery image n for further editing.
    Select(usize),
    Gallery,
    Voice,
    Clear,
    Exit,
    Unknown(String),
}

impl UiCommand {
    pub fn parse(input: &str) -> Option<Self> {
        let line = input.trim();
        if !line.starts_with('/') {
            return None;
        }
        let mut parts = line[1..].split_whitespace();
        let name = parts.next()?.to_ascii_lowercase();
        let args = parts.map(ToString::to_string).collect::<Vec<_>>();
        // Everything after the command token, whitespace preserved inside.
        let rest = line[1..]
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");

        let cmd = match name.as_str() {
            "help" => Self::Help,
            "attach" => {
                if rest.is_empty() {
                    Self::Unknown("attach needs a file path".to_string())
                } else {
                    Self::Attach(rest.to_string())
                }
            }
            "detach" => Self::Detach,
            "download" | "save" => match parse_index(&args) {
                Some(n) => Self::Download(n),
                None => Self::Unknown(format!("{name} needs an image number")),
            },
            "select" | "edit" => match parse_index(&args) {
                Some(n) => Self::Select(n),
                None => Self::Unknown(format!("{name} needs an image number")),
            },
            "gallery" => Self::Gallery,
            "voice" | "mic" => Self::Voice,
            "clear" => Self::Clear,
            "exit" | "quit" => Self::Exit,
            other => Self::Unknown(format!("unknown command: /{other}")),
        };
        Some(cmd)
    }

    pub fn help_lines() -> Vec<&'static str> {
        vec![
            "/attach <path>   attach a local image; the next prompt edits it",
            "/detach          drop the attached image",
            "/download <n>    save gallery image n to the downloads folder",
            "/select <n>      re-attach gallery image n for further editing",
            "/gallery         toggle the gallery panel (Ctrl+G)",
            "/voice           start or stop voice dictation (Ctrl+T)",
            "/clear           clear the transcript",
            "/exit            leave the session (Ctrl+C)",
        ]
    }
}

fn parse_index(args: &[String]) -> Option<usize> {
    args.first()?.parse::<usize>().ok().filter(|n| *n > 0)
}

// ─── UI events ───────────────────────────────────────────────────────────────

/// Gallery action handed to the runtime; the result comes back as a
/// [`UiEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAction {
    Download(String),
    Select(String),
}

/// Events sent into the shell loop from background workers.
#[derive(Debug)]
pub enum UiEvent {
    /// The backend answered submission `request` (any HTTP status with a
    /// parseable body).
    Completed { request: u64, outcome: Outcome },
    /// The call for submission `request` failed at the transport level.
    TransportFailed { request: u64 },
    /// Bytes of one generated image, sent per filename in response order.
    ImageBubble { filename: String, data: Vec<u8> },
    ImageSaved { filename: String, path: PathBuf },
    ImageSelected { filename: String, path: PathBuf },
    /// A download/select worker failed; shown as an error bubble.
    ActionFailed { message: String },
    Dictation(DictationEvent),
}

// ─── Line styling & scrollback flushing ──────────────────────────────────────

fn style_transcript_line(entry: &TranscriptEntry) -> Line<'static> {
    let (prefix, prefix_style, body_style) = match entry.kind {
        MessageKind::User => (
            "❯ ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
            Style::default().fg(Color::White),
        ),
        MessageKind::Ai => ("  ", Style::default(), Style::default().fg(Color::White)),
        MessageKind::System => (
            "⚙ ",
            Style::default().fg(Color::DarkGray),
            Style::default().fg(Color::DarkGray),
        ),
        MessageKind::Error => (
            "✗ ",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            Style::default().fg(Color::Red),
        ),
    };
    Line::from(vec![
        Span::styled(prefix.to_string(), prefix_style),
        Span::styled(entry.text.clone(), body_style),
    ])
}

fn wrapped_line_height(line: &Line<'_>, width: u16) -> u16 {
    if width == 0 {
        return 0;
    }
    let width = width as usize;
    let content_width = line.width().max(1);
    let rows = (content_width.saturating_sub(1) / width) + 1;
    u16::try_from(rows).unwrap_or(u16::MAX)
}

fn wrapped_text_rows(text: &str, width: u16) -> usize {
    if width == 0 {
        return 0;
    }
    let width = width as usize;
    let mut rows = 0usize;
    for segment in text.split('\n') {
        let len = segment.chars().count();
        rows = rows.saturating_add((len.saturating_sub(1) / width) + 1);
    }
    rows.max(1)
}

fn insert_wrapped_lines_above(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    lines: &[Line<'static>],
) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let viewport_width = terminal.size()?.width.max(1);
    let height = lines
        .iter()
        .map(|line| wrapped_line_height(line, viewport_width) as u32)
        .sum::<u32>()
        .min(u16::MAX as u32) as u16;
    if height == 0 {
        return Ok(());
    }
    terminal.insert_before(height, |buf| {
        let area = buf.area;
        let bottom = area.y.saturating_add(area.height);
        let mut y = area.y;
        for line in lines {
            if y >= bottom {
                break;
            }
            let logical_height = wrapped_line_height(line, area.width).max(1);
            let remaining = bottom.saturating_sub(y);
            let render_height = logical_height.min(remaining);
            if render_height == 0 {
                break;
            }
            let line_area = Rect::new(area.x, y, area.width, render_height);
            Paragraph::new(line.clone())
                .wrap(Wrap { trim: false })
                .render(line_area, buf);
            y = y.saturating_add(logical_height);
        }
    })?;
    Ok(())
}

/// Print new transcript entries above the inline viewport so they land in
/// native terminal scrollback.
fn flush_transcript_above(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    shell: &ChatShell,
    last_printed_idx: &mut usize,
) -> Result<()> {
    if *last_printed_idx >= shell.transcript.len() {
        return Ok(());
    }
    let mut lines: Vec<Line<'static>> = Vec::new();
    for entry in &shell.transcript[*last_printed_idx..] {
        for sub in entry.text.split('\n') {
            lines.push(style_transcript_line(&TranscriptEntry {
                kind: entry.kind,
                text: sub.to_string(),
            }));
        }
    }
    *last_printed_idx = shell.transcript.len();
    insert_wrapped_lines_above(terminal, &lines)
}

// ─── Terminal image rendering ────────────────────────────────────────────────

/// Terminal image protocol support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProtocol {
    /// iTerm2 inline image protocol (also supported by WezTerm, mintty).
    Iterm2,
    /// Kitty graphics protocol.
    Kitty,
    /// No inline image support — describe the image in text instead.
    None,
}

/// Detect which image protocol the current terminal supports.
pub fn detect_image_protocol() -> ImageProtocol {
    if let Ok(program) = std::env::var("TERM_PROGRAM") {
        let lower = program.to_ascii_lowercase();
        if lower.contains("iterm") || lower.contains("wezterm") || lower.contains("mintty") {
            return ImageProtocol::Iterm2;
        }
        if lower.contains("kitty") {
            return ImageProtocol::Kitty;
        }
    }
    if let Ok(term) = std::env::var("TERM")
        && term.contains("kitty")
    {
        return ImageProtocol::Kitty;
    }
    if std::env::var("KITTY_WINDOW_ID").is_ok() {
        return ImageProtocol::Kitty;
    }
    ImageProtocol::None
}

/// Build the escape sequence that renders `data` inline, if `protocol`
/// supports one.
pub fn render_inline_image(data: &[u8], protocol: ImageProtocol) -> Option<String> {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(data);

    match protocol {
        ImageProtocol::Iterm2 => {
            // ESC ] 1337 ; File=[args] : <base64> BEL
            Some(format!(
                "\x1b]1337;File=inline=1;size={};preserveAspectRatio=1:{b64}\x07",
                data.len()
            ))
        }
        ImageProtocol::Kitty => {
            // Base64 is ASCII, so byte chunks stay valid UTF-8. The payload
            // goes out in 4096-byte chunks; m=1 marks every chunk but the last.
            let chunks: Vec<&[u8]> = b64.as_bytes().chunks(4096).collect();
            let mut output = String::new();
            for (idx, chunk) in chunks.iter().enumerate() {
                let payload = std::str::from_utf8(chunk).unwrap_or_default();
                let more = if idx + 1 < chunks.len() { 1 } else { 0 };
                if idx == 0 {
                    // a=T: transmit and display, f=100: auto-detect format
                    output.push_str(&format!("\x1b_Ga=T,f=100,m={more};{payload}\x1b\\"));
                } else {
                    output.push_str(&format!("\x1b_Gm={more};{payload}\x1b\\"));
                }
            }
            Some(output)
        }
        ImageProtocol::None => None,
    }
}

/// Print an image inline to stdout if the terminal supports it. Returns
/// whether the image was displayed.
pub fn display_image_inline(data: &[u8]) -> bool {
    let protocol = detect_image_protocol();
    if let Some(escape) = render_inline_image(data, protocol) {
        use std::io::Write;
        let mut out = io::stdout();
        let _ = out.write_all(escape.as_bytes());
        let _ = writeln!(out);
        let _ = out.flush();
        true
    } else {
        false
    }
}

// ─── Shell event loop ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub reduced_motion: bool,
    pub gallery_visible: bool,
    /// Detected once at startup; when false the mic control stays disabled.
    pub voice_available: bool,
    /// Base URL shown in the welcome banner.
    pub backend_label: String,
}

/// Run the interactive shell until the user exits.
///
/// `on_submit` hands a validated submission to the runtime and returns the
/// request id the eventual [`UiEvent::Completed`] will carry. `on_image_action`
/// starts a download/select worker. `on_mic_toggle` flips dictation and
/// returns whether the recognizer is now listening.
pub fn run_chat_shell<F, A, M>(
    opts: ShellOptions,
    ui_rx: mpsc::Receiver<UiEvent>,
    mut on_submit: F,
    mut on_image_action: A,
    mut on_mic_toggle: M,
) -> Result<()>
where
    F: FnMut(&Submission) -> u64,
    A: FnMut(ImageAction),
    M: FnMut() -> bool,
{
    // SIGINT sets a flag instead of killing the process so the terminal is
    // restored on the way out.
    let sigint_flag = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        let flag = Arc::clone(&sigint_flag);
        signal_hook::flag::register(signal_hook::consts::SIGINT, flag)?;
    }

    // Restore the terminal before any panic message is printed.
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = crossterm::execute!(io::stdout(), crossterm::cursor::Show);
        prev_hook(info);
    }));

    // Clear terminal and print a welcome banner so it feels like a fresh
    // session. \x1b[3J (clear scrollback) is skipped on purpose; it is a
    // non-standard extension that misbehaves in some emulators.
    {
        use std::io::Write;
        let mut out = io::stdout();
        out.write_all(b"\x1b[2J\x1b[H")?;
        let version = env!("CARGO_PKG_VERSION");
        writeln!(out)?;
        writeln!(
            out,
            "\x1b[1;35m  ▒▒ pixelmuse\x1b[0m v{version}  \x1b[90mimage chat\x1b[0m"
        )?;
        writeln!(out, "\x1b[90m  backend: {}\x1b[0m", opts.backend_label)?;
        if !opts.voice_available {
            writeln!(out, "\x1b[90m  voice dictation unavailable (no transcriber on PATH)\x1b[0m")?;
        }
        writeln!(out)?;
        out.flush()?;
    }

    enable_raw_mode()?;
    let _guard = TerminalGuard;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INLINE_VIEWPORT_HEIGHT),
        },
    )?;

    let mut shell = ChatShell {
        reduced_motion: opts.reduced_motion,
        gallery_visible: opts.gallery_visible,
        ..Default::default()
    };
    let mut input = String::new();
    let mut cursor_pos: usize = 0;
    let mut history: VecDeque<String> = VecDeque::new();
    let mut history_cursor: Option<usize> = None;
    let mut saved_input = String::new();
    let mut info_line =
        String::from(" Ctrl+C exit | Ctrl+G gallery | Ctrl+T voice | /help commands");
    let mut tick_count: usize = 0;
    let mut cursor_visible;
    // Only entries past this index still need printing via insert_before.
    let mut last_printed_idx: usize = 0;

    shell.push_system("type a prompt to generate an image, /help for commands");

    loop {
        if sigint_flag.swap(false, Ordering::SeqCst) {
            break;
        }

        tick_count = tick_count.wrapping_add(1);
        shell.spinner_tick = tick_count;
        cursor_visible = tick_count % 16 < 8;

        // Drain events from backend and dictation workers.
        while let Ok(ev) = ui_rx.try_recv() {
            match ev {
                UiEvent::Completed { request, outcome } => {
                    shell.apply_outcome(request, &outcome);
                }
                UiEvent::TransportFailed { request } => {
                    shell.apply_transport_failure(request);
                }
                UiEvent::ImageBubble { filename, data } => {
                    let index = shell
                        .gallery
                        .iter()
                        .position(|name| *name == filename)
                        .map(|i| i + 1);
                    let label = match index {
                        Some(n) => format!("{n}. {filename}"),
                        None => filename.clone(),
                    };
                    if display_image_inline(&data) {
                        shell.push_ai(format!("🖼 {label}"));
                    } else {
                        shell.push_ai(format!("🖼 {label} ({} bytes)", data.len()));
                    }
                    if let Some(n) = index {
                        shell.push_system(format!("/download {n} to save, /select {n} to edit"));
                    }
                }
                UiEvent::ImageSaved { filename, path } => {
                    shell.push_system(format!("saved {filename} to {}", path.display()));
                }
                UiEvent::ImageSelected { filename, path } => {
                    if let Ok(bytes) = std::fs::read(&path) {
                        let _ = display_image_inline(&bytes);
                    }
                    shell.pending_image = Some(path);
                    shell.push_system(format!(
                        "{filename} attached; the next prompt edits it (/detach to drop)"
                    ));
                }
                UiEvent::ActionFailed { message } => {
                    shell.push_error(message);
                }
                UiEvent::Dictation(DictationEvent::Transcript(text)) => {
                    // Voice input submits immediately, same as pressing Enter.
                    if let Some(submission) = Submission::plan(&text, shell.pending_image.take()) {
                        shell.push_user(describe_submission(&submission));
                        let request = on_submit(&submission);
                        shell.begin_request(request);
                    }
                }
                UiEvent::Dictation(DictationEvent::Error(_)) => {
                    shell.listening = false;
                    shell.push_ai(VOICE_ERROR_BUBBLE);
                }
                UiEvent::Dictation(DictationEvent::Ended) => {
                    shell.listening = false;
                }
            }
        }

        flush_transcript_above(&mut terminal, &shell, &mut last_printed_idx)?;

        terminal.draw(|frame| {
            let area = frame.area();
            if area.width == 0 || area.height < 5 {
                return;
            }
            let width = area.width;
            let max_input_rows = area.height.saturating_sub(4).min(INPUT_MAX_HEIGHT).max(1);

            // Row 0: activity (spinner / attachment / listening)
            // Row 1: separator
            // Rows 2..: input prompt (wrapped)
            // Row -2: separator
            // Row -1: status bar
            let activity_area = Rect::new(area.x, area.y, width, 1);
            let mut activity_spans: Vec<Span> = Vec::new();
            if shell.is_busy() {
                activity_spans.push(Span::styled(
                    format!(
                        " {} generating ({} pending)…",
                        shell.spinner_frame(),
                        shell.pending_requests.len()
                    ),
                    Style::default().fg(Color::Magenta),
                ));
            }
            if shell.listening {
                activity_spans.push(Span::styled(
                    " 🎤 listening…",
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD),
                ));
            }
            if let Some(image) = &shell.pending_image {
                activity_spans.push(Span::styled(
                    format!(" 📎 {}", image.display()),
                    Style::default().fg(Color::Green),
                ));
            }
            if activity_spans.is_empty() {
                activity_spans.push(Span::styled(" ", Style::default()));
            }
            frame.render_widget(Paragraph::new(Line::from(activity_spans)), activity_area);

            let separator =
                Line::from(Span::styled("─".repeat(width as usize), Style::default().fg(Color::DarkGray)));
            frame.render_widget(
                Paragraph::new(separator.clone()),
                Rect::new(area.x, area.y + 1, width, 1),
            );

            // Input with a manually drawn blinking block cursor.
            let prompt = "❯ ";
            let prompt_width = prompt.chars().count() as u16;
            let input_width = width.saturating_sub(prompt_width).max(1);
            let input_rows =
                (wrapped_text_rows(&input, input_width) as u16).min(max_input_rows);
            let input_area = Rect::new(area.x, area.y + 2, width, input_rows);
            let chars: Vec<char> = input.chars().collect();
            let at = cursor_pos.min(chars.len());
            let before: String = chars[..at].iter().collect();
            let under: String = chars.get(at).map(|c| c.to_string()).unwrap_or_else(|| " ".to_string());
            let after: String = if at < chars.len() {
                chars[at + 1..].iter().collect()
            } else {
                String::new()
            };
            let cursor_style = if cursor_visible {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            let input_line = Line::from(vec![
                Span::styled(
                    prompt,
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw(before),
                Span::styled(under, cursor_style),
                Span::raw(after),
            ]);
            frame.render_widget(
                Paragraph::new(input_line).wrap(Wrap { trim: false }),
                input_area,
            );

            frame.render_widget(
                Paragraph::new(separator),
                Rect::new(area.x, area.y + 2 + input_rows, width, 1),
            );

            let status_area = Rect::new(area.x, area.y + 3 + input_rows, width, 1);
            let mic = if !opts.voice_available {
                "mic off"
            } else if shell.listening {
                "mic live"
            } else {
                "mic ready"
            };
            let right = format!("gallery {} | {mic} ", shell.gallery.len());
            let left_width = (width as usize).saturating_sub(right.chars().count());
            let left: String = info_line.chars().take(left_width).collect();
            let pad = left_width.saturating_sub(left.chars().count());
            let status_line = Line::from(vec![
                Span::styled(left, Style::default().fg(Color::DarkGray)),
                Span::raw(" ".repeat(pad)),
                Span::styled(right, Style::default().fg(Color::DarkGray)),
            ]);
            frame.render_widget(Paragraph::new(status_line), status_area);
        })?;

        if !event::poll(Duration::from_millis(33))? {
            continue;
        }
        let key = match event::read()? {
            Event::Resize(_, _) => continue,
            Event::Paste(pasted) => {
                input.insert_str(byte_index(&input, cursor_pos), &pasted);
                cursor_pos += pasted.chars().count();
                continue;
            }
            Event::Key(key) => key,
            _ => continue,
        };
        // Ignore release/repeat on platforms that send them.
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match (key.code, ctrl) {
            (KeyCode::Char('c'), true) | (KeyCode::Char('d'), true) => break,
            (KeyCode::Char('g'), true) => {
                toggle_gallery_panel(&mut shell, &mut info_line);
            }
            (KeyCode::Char('t'), true) => {
                toggle_mic(&mut shell, &mut info_line, opts.voice_available, &mut on_mic_toggle);
            }
            (KeyCode::Enter, _) => {
                let line = input.clone();
                input.clear();
                cursor_pos = 0;
                history_cursor = None;
                if let Some(cmd) = UiCommand::parse(&line) {
                    if !line.trim().is_empty() {
                        history.push_back(line.trim().to_string());
                    }
                    match cmd {
                        UiCommand::Exit => break,
                        UiCommand::Help => {
                            for help in UiCommand::help_lines() {
                                shell.push_system(help);
                            }
                        }
                        UiCommand::Attach(raw) => {
                            let path = PathBuf::from(raw.trim());
                            if path.is_file() {
                                // Best-effort preview of the not-yet-uploaded file.
                                if let Ok(bytes) = std::fs::read(&path) {
                                    let _ = display_image_inline(&bytes);
                                }
                                info_line = format!("attached {}", path.display());
                                shell.pending_image = Some(path);
                            } else {
                                shell.push_error(format!(
                                    "cannot attach {}: file not found",
                                    path.display()
                                ));
                            }
                        }
                        UiCommand::Detach => {
                            shell.pending_image = None;
                            info_line = "attachment dropped".to_string();
                        }
                        UiCommand::Download(n) => {
                            match shell.gallery_item(n).map(str::to_string) {
                                Some(filename) => {
                                    info_line = format!("saving {filename}…");
                                    on_image_action(ImageAction::Download(filename));
                                }
                                None => shell.push_error(format!("no gallery image {n}")),
                            }
                        }
                        UiCommand::Select(n) => {
                            match shell.gallery_item(n).map(str::to_string) {
                                Some(filename) => {
                                    info_line = format!("fetching {filename}…");
                                    on_image_action(ImageAction::Select(filename));
                                }
                                None => shell.push_error(format!("no gallery image {n}")),
                            }
                        }
                        UiCommand::Gallery => {
                            toggle_gallery_panel(&mut shell, &mut info_line);
                        }
                        UiCommand::Voice => {
                            toggle_mic(
                                &mut shell,
                                &mut info_line,
                                opts.voice_available,
                                &mut on_mic_toggle,
                            );
                        }
                        UiCommand::Clear => {
                            shell.transcript.clear();
                            last_printed_idx = 0;
                            info_line = "transcript cleared".to_string();
                        }
                        UiCommand::Unknown(msg) => shell.push_error(msg),
                    }
                    continue;
                }
                // An empty submission is silently ignored; the attachment and
                // input are cleared optimistically once a request leaves.
                let Some(submission) = Submission::plan(&line, shell.pending_image.clone()) else {
                    continue;
                };
                history.push_back(line.trim().to_string());
                shell.pending_image = None;
                shell.push_user(describe_submission(&submission));
                let request = on_submit(&submission);
                shell.begin_request(request);
            }
            (KeyCode::Up, _) => {
                if !history.is_empty() {
                    match history_cursor {
                        None => {
                            saved_input = input.clone();
                            history_cursor = Some(history.len() - 1);
                        }
                        Some(idx) if idx > 0 => history_cursor = Some(idx - 1),
                        Some(_) => {}
                    }
                    if let Some(idx) = history_cursor {
                        input = history[idx].clone();
                        cursor_pos = input.chars().count();
                    }
                }
            }
            (KeyCode::Down, _) => {
                if let Some(idx) = history_cursor {
                    if idx + 1 < history.len() {
                        history_cursor = Some(idx + 1);
                        input = history[idx + 1].clone();
                    } else {
                        history_cursor = None;
                        input = saved_input.clone();
                    }
                    cursor_pos = input.chars().count();
                }
            }
            (KeyCode::Left, _) => cursor_pos = cursor_pos.saturating_sub(1),
            (KeyCode::Right, _) => cursor_pos = (cursor_pos + 1).min(input.chars().count()),
            (KeyCode::Home, _) => cursor_pos = 0,
            (KeyCode::End, _) => cursor_pos = input.chars().count(),
            (KeyCode::Backspace, _) => {
                if cursor_pos > 0 {
                    let at = byte_index(&input, cursor_pos - 1);
                    input.remove(at);
                    cursor_pos -= 1;
                }
            }
            (KeyCode::Delete, _) => {
                if cursor_pos < input.chars().count() {
                    let at = byte_index(&input, cursor_pos);
                    input.remove(at);
                }
            }
            (KeyCode::Char(ch), false) => {
                let at = byte_index(&input, cursor_pos);
                input.insert(at, ch);
                cursor_pos += 1;
            }
            _ => {}
        }
    }

    // Leave the viewport content in scrollback and part cleanly.
    flush_transcript_above(&mut terminal, &shell, &mut last_printed_idx)?;
    drop(terminal);
    disable_raw_mode()?;
    println!();
    Ok(())
}

fn toggle_gallery_panel(shell: &mut ChatShell, info_line: &mut String) {
    if shell.toggle_gallery() {
        let lines = shell.gallery_lines();
        for line in lines {
            shell.push_system(format!("[gallery] {line}"));
        }
        *info_line = "gallery shown".to_string();
    } else {
        *info_line = "gallery hidden".to_string();
    }
}

fn toggle_mic<M>(shell: &mut ChatShell, info_line: &mut String, available: bool, on_mic_toggle: &mut M)
where
    M: FnMut() -> bool,
{
    if !available {
        *info_line = "voice input unavailable (no transcriber on PATH)".to_string();
        return;
    }
    shell.listening = on_mic_toggle();
    *info_line = if shell.listening {
        "listening… (Ctrl+T to stop)".to_string()
    } else {
        "dictation stopped".to_string()
    };
}

/// Transcript echo for a submission: the prompt text, or a note about the
/// attachment when the prompt is empty.
fn describe_submission(submission: &Submission) -> String {
    match (&submission.image, submission.prompt.is_empty()) {
        (Some(image), true) => format!("[edit {}]", image.display()),
        (Some(image), false) => format!("{} [editing {}]", submission.prompt, image.display()),
        (None, _) => submission.prompt.clone(),
    }
}

fn byte_index(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_preserves_push_order_and_kinds() {
        let mut shell = ChatShell::default();
        shell.push_user("a red fox");
        shell.push_ai("🖼 1. result.png");
        shell.push_system("saved result.png");
        shell.push_error("no gallery image 9");
        let kinds: Vec<MessageKind> = shell.transcript.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::User,
                MessageKind::Ai,
                MessageKind::System,
                MessageKind::Error
            ]
        );
    }

    #[test]
    fn clear_loading_is_idempotent_and_id_scoped() {
        let mut shell = ChatShell::default();
        shell.begin_request(1);
        shell.begin_request(2);
        shell.clear_loading(1);
        shell.clear_loading(1);
        assert_eq!(shell.pending_requests, vec![2]);
        assert!(shell.is_busy());
        shell.clear_loading(2);
        assert!(!shell.is_busy());
    }

    #[test]
    fn out_of_order_completion_only_clears_its_own_marker() {
        let mut shell = ChatShell::default();
        shell.begin_request(10);
        shell.begin_request(11);
        // the later submission answers first
        shell.apply_outcome(11, &Outcome::Images(vec!["b.png".to_string()]));
        assert_eq!(shell.pending_requests, vec![10]);
        shell.apply_outcome(10, &Outcome::Images(vec!["a.png".to_string()]));
        assert_eq!(shell.gallery, vec!["b.png", "a.png"]);
    }

    #[test]
    fn image_outcome_joins_gallery_in_response_order() {
        let mut shell = ChatShell::default();
        shell.begin_request(1);
        shell.apply_outcome(
            1,
            &Outcome::Images(vec!["a.png".to_string(), "b.png".to_string()]),
        );
        assert_eq!(shell.gallery, vec!["a.png", "b.png"]);
        assert!(shell.transcript.is_empty(), "bubbles arrive with the bytes");
    }

    #[test]
    fn error_outcome_is_echoed_verbatim_as_ai_bubble() {
        let mut shell = ChatShell::default();
        shell.begin_request(1);
        shell.apply_outcome(1, &Outcome::Error("No image generated".to_string()));
        assert_eq!(shell.transcript.len(), 1);
        assert_eq!(shell.transcript[0].kind, MessageKind::Ai);
        assert_eq!(shell.transcript[0].text, "No image generated");
    }

    #[test]
    fn silent_outcome_renders_nothing() {
        let mut shell = ChatShell::default();
        shell.begin_request(1);
        shell.apply_outcome(1, &Outcome::Silent);
        assert!(shell.transcript.is_empty());
        assert!(shell.gallery.is_empty());
        assert!(!shell.is_busy());
    }

    #[test]
    fn transport_failure_clears_loading_and_shows_one_fixed_bubble() {
        let mut shell = ChatShell::default();
        shell.begin_request(1);
        shell.begin_request(2);
        shell.apply_transport_failure(1);
        assert_eq!(shell.pending_requests, vec![2]);
        assert_eq!(shell.transcript.len(), 1);
        assert_eq!(shell.transcript[0].kind, MessageKind::Ai);
        assert_eq!(shell.transcript[0].text, REQUEST_ERROR_BUBBLE);
        assert!(shell.gallery.is_empty());
    }

    #[test]
    fn gallery_toggle_round_trips() {
        let mut shell = ChatShell::default();
        assert!(shell.toggle_gallery());
        assert!(!shell.toggle_gallery());
        assert!(!shell.gallery_visible);
    }

    #[test]
    fn gallery_lookup_is_one_based() {
        let mut shell = ChatShell::default();
        shell.gallery = vec!["a.png".to_string(), "b.png".to_string()];
        assert_eq!(shell.gallery_item(1), Some("a.png"));
        assert_eq!(shell.gallery_item(2), Some("b.png"));
        assert_eq!(shell.gallery_item(0), None);
        assert_eq!(shell.gallery_item(3), None);
        assert_eq!(shell.gallery_lines(), vec!["1. a.png", "2. b.png"]);
    }

    #[test]
    fn empty_gallery_lists_a_placeholder() {
        let shell = ChatShell::default();
        assert_eq!(shell.gallery_lines(), vec!["(no generated images yet)"]);
    }

    #[test]
    fn reduced_motion_pins_the_spinner() {
        let mut shell = ChatShell {
            reduced_motion: true,
            ..Default::default()
        };
        shell.spinner_tick = 3;
        assert_eq!(shell.spinner_frame(), "●");
        shell.spinner_tick = 7;
        assert_eq!(shell.spinner_frame(), "●");
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(UiCommand::parse("hello"), None);
        assert_eq!(UiCommand::parse("/help"), Some(UiCommand::Help));
        assert_eq!(
            UiCommand::parse("/attach ./shots/cat 1.png"),
            Some(UiCommand::Attach("./shots/cat 1.png".to_string()))
        );
        assert_eq!(
            UiCommand::parse("/Attach cat.png"),
            Some(UiCommand::Attach("cat.png".to_string()))
        );
        assert_eq!(UiCommand::parse("/download 2"), Some(UiCommand::Download(2)));
        assert_eq!(UiCommand::parse("/save 2"), Some(UiCommand::Download(2)));
        assert_eq!(UiCommand::parse("/select 1"), Some(UiCommand::Select(1)));
        assert_eq!(UiCommand::parse("/gallery"), Some(UiCommand::Gallery));
        assert_eq!(UiCommand::parse("/quit"), Some(UiCommand::Exit));
    }

    #[test]
    fn malformed_commands_surface_as_unknown() {
        assert!(matches!(
            UiCommand::parse("/download"),
            Some(UiCommand::Unknown(_))
        ));
        assert!(matches!(
            UiCommand::parse("/download zero"),
            Some(UiCommand::Unknown(_))
        ));
        assert!(matches!(
            UiCommand::parse("/select 0"),
            Some(UiCommand::Unknown(_))
        ));
        assert!(matches!(
            UiCommand::parse("/frobnicate"),
            Some(UiCommand::Unknown(_))
        ));
    }

    #[test]
    fn iterm2_escape_carries_size_and_payload() {
        let escape = render_inline_image(b"png-bytes", ImageProtocol::Iterm2).expect("escape");
        assert!(escape.starts_with("\x1b]1337;File=inline=1;size=9;"));
        assert!(escape.ends_with('\x07'));
    }

    #[test]
    fn kitty_escape_chunks_large_payloads() {
        // 4000 raw bytes → ~5334 base64 chars → two chunks.
        let data = vec![0_u8; 4000];
        let escape = render_inline_image(&data, ImageProtocol::Kitty).expect("escape");
        assert!(escape.starts_with("\x1b_Ga=T,f=100,m=1;"));
        assert!(escape.contains("\x1b_Gm=0;"));
        assert_eq!(escape.matches("\x1b_G").count(), 2);
    }

    #[test]
    fn no_protocol_means_no_escape() {
        assert_eq!(render_inline_image(b"data", ImageProtocol::None), None);
    }

    #[test]
    fn submissions_echo_prompt_and_attachment() {
        let text_only = Submission::plan("a red fox", None).expect("submission");
        assert_eq!(describe_submission(&text_only), "a red fox");
        let image_only =
            Submission::plan("", Some(PathBuf::from("cat.png"))).expect("submission");
        assert_eq!(describe_submission(&image_only), "[edit cat.png]");
        let both =
            Submission::plan("bluer", Some(PathBuf::from("cat.png"))).expect("submission");
        assert_eq!(describe_submission(&both), "bluer [editing cat.png]");
    }

    #[test]
    fn wrapped_text_rows_counts_soft_wrap_and_newlines() {
        assert_eq!(wrapped_text_rows("abcdefghij", 10), 1);
        assert_eq!(wrapped_text_rows("abcdefghijk", 10), 2);
        assert_eq!(wrapped_text_rows("abc\ndef", 10), 2);
    }

    #[test]
    fn wrapped_line_height_tracks_soft_wrapping() {
        let line = Line::from("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(wrapped_line_height(&line, 10), 3);
        assert_eq!(wrapped_line_height(&Line::from(""), 10), 1);
        assert_eq!(wrapped_line_height(&line, 0), 0);
    }

    #[test]
    fn styled_lines_use_kind_prefixes() {
        let user = style_transcript_line(&TranscriptEntry {
            kind: MessageKind::User,
            text: "hi".to_string(),
        });
        assert_eq!(user.spans[0].content, "❯ ");
        let err = style_transcript_line(&TranscriptEntry {
            kind: MessageKind::Error,
            text: "bad".to_string(),
        });
        assert_eq!(err.spans[0].content, "✗ ");
    }
}
