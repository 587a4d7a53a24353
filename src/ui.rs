//! Front ends for the labeling session: a raw-mode terminal screen, and a
//! line-token reader used when stdin is not a terminal.

use anyhow::{Context, Result};
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::{Child, Command as Process, Stdio};

use crate::category::{Category, Subphase};
use crate::session::{ClassificationSession, Command, Outcome, SubphasePolicy};

pub const KEY_HELP: &str = "→/d ←/a ±1  ↓/↑ ±10  PgDn/PgUp ±100  ]/[ ±1000  7/8/9 +10/+100/+1000  \
                            i/m/f sub-phase  1-5 category  0 null  q quit";

fn char_command(c: char) -> Option<Command> {
    let c = c.to_ascii_lowercase();
    match c {
        'd' => Some(Command::Move(1)),
        'a' => Some(Command::Move(-1)),
        ']' => Some(Command::Move(1000)),
        '[' => Some(Command::Move(-1000)),
        '7' => Some(Command::Move(10)),
        '8' => Some(Command::Move(100)),
        '9' => Some(Command::Move(1000)),
        'q' => Some(Command::Quit),
        _ => Category::from_id(c)
            .map(Command::Classify)
            .or_else(|| Subphase::from_key(c).map(Command::SelectSubphase)),
    }
}

/// Maps a terminal key press. Releases and unbound keys yield `None`.
pub fn key_command(key: &KeyEvent) -> Option<Command> {
    if !matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(Command::Quit);
    }
    match key.code {
        KeyCode::Right => Some(Command::Move(1)),
        KeyCode::Left => Some(Command::Move(-1)),
        KeyCode::Down => Some(Command::Move(10)),
        KeyCode::Up => Some(Command::Move(-10)),
        KeyCode::PageDown => Some(Command::Move(100)),
        KeyCode::PageUp => Some(Command::Move(-100)),
        KeyCode::Esc => Some(Command::Quit),
        KeyCode::Char(c) => char_command(c),
        _ => None,
    }
}

/// Maps one whitespace-separated token of scripted input. Besides the key
/// characters, category and sub-phase names are accepted.
pub fn token_command(token: &str) -> Option<Command> {
    match token.to_ascii_lowercase().as_str() {
        "right" => Some(Command::Move(1)),
        "left" => Some(Command::Move(-1)),
        "down" => Some(Command::Move(10)),
        "up" => Some(Command::Move(-10)),
        "pgdn" | "pagedown" => Some(Command::Move(100)),
        "pgup" | "pageup" => Some(Command::Move(-100)),
        "esc" | "quit" => Some(Command::Quit),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => char_command(c),
                _ => Category::from_name(other)
                    .map(Command::Classify)
                    .or_else(|| Subphase::from_name(other).map(Command::SelectSubphase)),
            }
        }
    }
}

pub trait Frontend {
    /// Next command, or `None` once input is exhausted.
    fn next_command(&mut self) -> Result<Option<Command>>;
    fn render(&mut self, session: &ClassificationSession, message: &str) -> Result<()>;
}

fn status_line(session: &ClassificationSession) -> String {
    match session.current_entry() {
        Some(entry) => match entry.subphase {
            Some(sub) => format!("{} ({}) / {}", entry.category.name(), entry.category.id(), sub),
            None => format!("{} ({})", entry.category.name(), entry.category.id()),
        },
        None => "unclassified".to_string(),
    }
}

fn dimensions(path: &Path) -> String {
    match image::image_dimensions(path) {
        Ok((w, h)) => format!("{}x{}", w, h),
        Err(e) => {
            debug!("cannot read dimensions of {}: {}", path.display(), e);
            "unreadable".to_string()
        }
    }
}

fn screen_lines(session: &ClassificationSession, message: &str) -> Vec<String> {
    let frame = session.current_frame();
    let counts = session.store().counts();
    let mut lines = vec![
        format!(
            "Frame {}/{}  {}",
            session.current_index() + 1,
            session.len(),
            frame.name
        ),
        format!("Image: {}", dimensions(&frame.path)),
        format!("Label: {}", status_line(session)),
        format!(
            "Pending sub-phase: {}  (policy: {})",
            session
                .pending_subphase()
                .map(|s| s.name())
                .unwrap_or("-"),
            match session.policy() {
                SubphasePolicy::Optional => "optional",
                SubphasePolicy::Required => "required",
            }
        ),
        String::new(),
    ];
    for (category, n) in counts.iter() {
        let mut line = format!("  {} {:<32} {}", category.id(), category.name(), n);
        if !category.is_null() {
            let subs: Vec<String> = Subphase::ALL
                .iter()
                .map(|s| format!("{}={}", s.key(), counts.get_subphase(category, *s)))
                .collect();
            line.push_str(&format!("  [{}]", subs.join(" ")));
        }
        lines.push(line);
    }
    lines.push(format!("  total {}", counts.total()));
    lines.push(String::new());
    lines.push(message.to_string());
    lines.push(KEY_HELP.to_string());
    lines
}

/// Restores the terminal on every exit path.
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("enable raw mode")?;
        if let Err(e) = execute!(std::io::stdout(), EnterAlternateScreen, Hide) {
            let _ = disable_raw_mode();
            return Err(e).context("enter alternate screen");
        }
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

pub struct TerminalUi {
    _guard: RawModeGuard,
}

impl TerminalUi {
    pub fn open() -> Result<Self> {
        Ok(Self {
            _guard: RawModeGuard::enter()?,
        })
    }
}

impl Frontend for TerminalUi {
    fn next_command(&mut self) -> Result<Option<Command>> {
        loop {
            if let Event::Key(key) = event::read().context("read terminal event")? {
                if let Some(cmd) = key_command(&key) {
                    return Ok(Some(cmd));
                }
            }
        }
    }

    fn render(&mut self, session: &ClassificationSession, message: &str) -> Result<()> {
        let mut out = std::io::stdout();
        let (cols, rows) = terminal::size().unwrap_or((100, 30));
        queue!(out, Clear(ClearType::All))?;
        for (row, line) in screen_lines(session, message).iter().enumerate() {
            if row >= rows as usize {
                break;
            }
            let clipped: String = line.chars().take(cols as usize).collect();
            queue!(out, MoveTo(0, row as u16), Print(clipped))?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Scripted input: whitespace-separated key tokens, plain output.
pub struct LineUi<R, W> {
    input: R,
    output: W,
    pending: VecDeque<String>,
}

impl<R: BufRead, W: Write> LineUi<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            pending: VecDeque::new(),
        }
    }
}

impl<R: BufRead, W: Write> Frontend for LineUi<R, W> {
    fn next_command(&mut self) -> Result<Option<Command>> {
        loop {
            while let Some(token) = self.pending.pop_front() {
                match token_command(&token) {
                    Some(cmd) => return Ok(Some(cmd)),
                    None => warn!("ignoring unknown key {:?}", token),
                }
            }
            let mut line = String::new();
            if self.input.read_line(&mut line).context("read input")? == 0 {
                return Ok(None);
            }
            self.pending
                .extend(line.split_whitespace().map(str::to_string));
        }
    }

    fn render(&mut self, session: &ClassificationSession, message: &str) -> Result<()> {
        writeln!(
            self.output,
            "[{}/{}] {} | {} | pending={}{}",
            session.current_index() + 1,
            session.len(),
            session.current_frame().name,
            status_line(session),
            session
                .pending_subphase()
                .map(|s| s.name())
                .unwrap_or("-"),
            if message.is_empty() {
                String::new()
            } else {
                format!(" | {}", message)
            }
        )?;
        Ok(())
    }
}

/// External image viewer, one process per displayed frame.
pub struct Viewer {
    program: String,
    child: Option<Child>,
}

impl Viewer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }

    pub fn show(&mut self, path: &Path) -> Result<()> {
        self.close();
        let child = Process::new(&self.program)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("viewer {} failed to start", self.program))?;
        self.child = Some(child);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub commits: usize,
    pub reclassified: usize,
    pub rejected: usize,
    pub last_index: usize,
}

/// Drives the session until quit or end of input, then performs the final
/// save. Store failures end the loop and are returned.
pub fn run_session(
    session: &mut ClassificationSession,
    frontend: &mut dyn Frontend,
    mut viewer: Option<&mut Viewer>,
) -> Result<SessionSummary> {
    let mut summary = SessionSummary::default();
    let mut message = String::new();
    let mut shown: Option<usize> = None;

    while !session.is_finished() {
        if shown != Some(session.current_index()) {
            if let Some(v) = viewer.as_deref_mut() {
                // Logging would tear the raw-mode screen; show it in the status line.
                if let Err(e) = v.show(&session.current_frame().path) {
                    message = format!("{:#}", e);
                }
            }
            shown = Some(session.current_index());
        }
        frontend.render(session, &message)?;

        let command = frontend.next_command()?.unwrap_or(Command::Quit);
        message = match session.apply(command)? {
            Outcome::Moved { from, to } if from == to => "no more frames that way".to_string(),
            Outcome::Moved { .. } => String::new(),
            Outcome::SubphasePending(sub) => format!("sub-phase {} selected", sub),
            Outcome::Committed { entry, previous } => {
                summary.commits += 1;
                let label = match entry.subphase {
                    Some(sub) => format!("{}/{}", entry.category, sub),
                    None => entry.category.to_string(),
                };
                match previous {
                    Some(old) => {
                        summary.reclassified += 1;
                        format!("{}: {} -> {}", entry.frame, old, label)
                    }
                    None => format!("{}: {}", entry.frame, label),
                }
            }
            Outcome::Rejected(reason) => {
                summary.rejected += 1;
                reason.to_string()
            }
            Outcome::Quit => String::new(),
        };
    }

    session.finish()?;
    summary.last_index = session.current_index();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::scan_frames;
    use crate::store::ClassificationStore;
    use tempfile::TempDir;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn terminal_keys_map_to_commands() {
        assert_eq!(key_command(&press(KeyCode::Right)), Some(Command::Move(1)));
        assert_eq!(key_command(&press(KeyCode::Char('a'))), Some(Command::Move(-1)));
        assert_eq!(key_command(&press(KeyCode::Up)), Some(Command::Move(-10)));
        assert_eq!(key_command(&press(KeyCode::PageDown)), Some(Command::Move(100)));
        assert_eq!(key_command(&press(KeyCode::Char('['))), Some(Command::Move(-1000)));
        assert_eq!(key_command(&press(KeyCode::Char('8'))), Some(Command::Move(100)));
        assert_eq!(
            key_command(&press(KeyCode::Char('3'))),
            Some(Command::Classify(Category::DespejoAcontecendo))
        );
        assert_eq!(
            key_command(&press(KeyCode::Char('0'))),
            Some(Command::Classify(Category::Null))
        );
        assert_eq!(
            key_command(&press(KeyCode::Char('M'))),
            Some(Command::SelectSubphase(Subphase::Meio))
        );
        assert_eq!(key_command(&press(KeyCode::Esc)), Some(Command::Quit));
        assert_eq!(
            key_command(&KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Command::Quit)
        );
        assert_eq!(key_command(&press(KeyCode::Char('x'))), None);

        let mut release = press(KeyCode::Right);
        release.kind = KeyEventKind::Release;
        assert_eq!(key_command(&release), None);
    }

    #[test]
    fn tokens_map_like_keys() {
        assert_eq!(token_command("pgup"), Some(Command::Move(-100)));
        assert_eq!(token_command("9"), Some(Command::Move(1000)));
        assert_eq!(token_command("f"), Some(Command::SelectSubphase(Subphase::Fim)));
        assert_eq!(token_command("Q"), Some(Command::Quit));
        assert_eq!(
            token_command("forno_vazio"),
            Some(Command::Classify(Category::FornoVazio))
        );
        assert_eq!(token_command("meio"), Some(Command::SelectSubphase(Subphase::Meio)));
        assert_eq!(token_command("12"), None);
    }

    fn session_over(dir: &TempDir, n: u64) -> ClassificationSession {
        for i in 1..=n {
            std::fs::write(
                dir.path().join(format!("round_1_{}_20240101_1200{:02}.jpg", i, i)),
                b"x",
            )
            .expect("write frame");
        }
        let frames = scan_frames(dir.path()).expect("scan");
        let store = ClassificationStore::empty(dir.path().join("store.json"));
        ClassificationSession::new(frames, store, SubphasePolicy::Required).expect("session")
    }

    #[test]
    fn scripted_session_labels_and_saves_on_eof() {
        let tmp = TempDir::new().expect("tempdir");
        let mut session = session_over(&tmp, 4);
        let script = "1\ni 1 m 2\nleft f 2\n0\n";
        let mut out = Vec::new();
        let summary = {
            let mut ui = LineUi::new(script.as_bytes(), &mut out);
            run_session(&mut session, &mut ui, None).expect("run")
        };

        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.commits, 4);
        assert_eq!(summary.reclassified, 1);
        let counts = session.store().counts();
        assert_eq!(counts.get(Category::FornoEnchendo), 1);
        assert_eq!(counts.get(Category::SinterizacaoAcontecendo), 1);
        assert_eq!(counts.get(Category::Null), 1);
        assert_eq!(
            counts.get_subphase(Category::SinterizacaoAcontecendo, Subphase::Fim),
            1
        );

        let reloaded = ClassificationStore::load(tmp.path().join("store.json")).expect("reload");
        assert_eq!(reloaded.len(), 3);
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("select a sub-phase"), "{text}");
    }

    #[test]
    fn viewer_failure_lands_in_the_status_line() {
        let tmp = TempDir::new().expect("tempdir");
        let mut session = session_over(&tmp, 2);
        let mut viewer = Viewer::new("/nonexistent/phasecap-viewer");
        let mut out = Vec::new();
        {
            let mut ui = LineUi::new("q\n".as_bytes(), &mut out);
            run_session(&mut session, &mut ui, Some(&mut viewer)).expect("run");
        }
        let text = String::from_utf8(out).expect("utf8");
        assert!(
            text.contains("viewer /nonexistent/phasecap-viewer failed to start"),
            "{text}"
        );
    }
}
