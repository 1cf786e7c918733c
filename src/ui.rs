use crate::protocol::Role;
use crate::session::{ChatTurn, Session, SessionEvent};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 5;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn turn_line_specs(turn: &ChatTurn) -> Vec<LineSpec> {
    let (header, color) = match turn.role {
        Role::User => ("You:", Color::Blue),
        Role::System => ("System:", Color::Gray),
        Role::Assistant if turn.is_error => ("Assistant:", Color::Red),
        Role::Assistant if turn.is_execution_result => ("Assistant:", Color::Cyan),
        Role::Assistant => ("Assistant:", Color::Yellow),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let mut lines = vec![LineSpec::new(header, header_style)];
    for line in turn.text.lines() {
        lines.push(LineSpec::new(format!("  {line}"), body_style));
    }

    if let Some(code) = &turn.code_block {
        let code_style = Style::default().fg(Color::Green);
        lines.push(LineSpec::new(
            "  ─ code (ctrl-r runs the latest block) ─",
            code_style.add_modifier(Modifier::BOLD),
        ));
        for line in code.lines() {
            lines.push(LineSpec::new(format!("  {line}"), code_style));
        }
    }
    lines
}

fn turn_text(turn: &ChatTurn) -> Text<'static> {
    let lines = turn_line_specs(turn)
        .into_iter()
        .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
        .collect::<Vec<_>>();
    Text::from(lines)
}

fn rendered_height(turn: &ChatTurn, width: u16) -> u16 {
    let width = width.max(1) as usize;
    turn_line_specs(turn)
        .iter()
        .map(|spec| spec.text.len().max(1).div_ceil(width))
        .sum::<usize>() as u16
}

/// Multi-line input editor backing the prompt box.
struct InputBuffer {
    lines: Vec<String>,
    row: usize,
    col: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            row: 0,
            col: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.row];
        if self.col >= line.len() {
            line.push(c);
        } else {
            line.insert(self.col, c);
        }
        self.col += 1;
    }

    fn delete_char(&mut self) {
        if self.col > 0 {
            self.lines[self.row].remove(self.col - 1);
            self.col -= 1;
        } else if self.row > 0 {
            let tail = self.lines.remove(self.row);
            self.row -= 1;
            self.col = self.lines[self.row].len();
            self.lines[self.row].push_str(&tail);
        }
    }

    fn break_line(&mut self) {
        let tail = self.lines[self.row].split_off(self.col);
        self.lines.insert(self.row + 1, tail);
        self.row += 1;
        self.col = 0;
    }

    fn move_left(&mut self) {
        if self.col > 0 {
            self.col -= 1;
        } else if self.row > 0 {
            self.row -= 1;
            self.col = self.lines[self.row].len();
        }
    }

    fn move_right(&mut self) {
        if self.col < self.lines[self.row].len() {
            self.col += 1;
        } else if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = 0;
        }
    }

    fn move_up(&mut self) {
        if self.row > 0 {
            self.row -= 1;
            self.col = self.col.min(self.lines[self.row].len());
        }
    }

    fn move_down(&mut self) {
        if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = self.col.min(self.lines[self.row].len());
        }
    }

    fn contents(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Type a message (enter sends, ctrl-r runs code, esc quits)",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|line| Line::from(line.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

struct App {
    input: InputBuffer,
    should_quit: bool,
    busy: bool,
    session: Arc<Session>,
    events: broadcast::Receiver<SessionEvent>,
    // Most recent turn carrying a runnable code block.
    runnable: Option<Uuid>,
}

impl App {
    fn new(session: Arc<Session>) -> Self {
        let events = session.subscribe();
        Self {
            input: InputBuffer::new(),
            should_quit: false,
            busy: false,
            session,
            events,
            runnable: None,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let area = f.area();
        let title = if self.busy {
            " Input [waiting for the model...] "
        } else {
            " Input "
        };

        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, area);

        let x = (area.x + self.input.col as u16 + 1).min(area.x + area.width.saturating_sub(2));
        let y = (area.y + self.input.row as u16 + 1).min(area.y + area.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn append_turn(&mut self, terminal: &mut TuiTerminal, turn: &ChatTurn) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = rendered_height(turn, width).saturating_add(1);
        let mut text = turn_text(turn);
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        if turn.has_code {
            self.runnable = Some(turn.id);
        }
        Ok(())
    }

    fn drain_session_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        loop {
            match self.events.try_recv() {
                Ok(SessionEvent::TurnAppended(turn)) => self.append_turn(terminal, &turn)?,
                Ok(SessionEvent::BusyChanged(busy)) => self.busy = busy,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "ui fell behind the session event feed");
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        self.drain_session_events(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    match key.code {
                        KeyCode::Char('c') => {
                            self.should_quit = true;
                            return Ok(false);
                        }
                        KeyCode::Char('r') => {
                            if let Some(turn_id) = self.runnable {
                                let session = Arc::clone(&self.session);
                                tokio::spawn(async move {
                                    session.execute_code(turn_id).await;
                                });
                            }
                            return Ok(true);
                        }
                        _ => {}
                    }
                }

                match key.code {
                    KeyCode::Esc => {
                        self.should_quit = true;
                        return Ok(false);
                    }
                    KeyCode::Enter => {
                        if key.modifiers.contains(KeyModifiers::SHIFT) {
                            self.input.break_line();
                        } else if !self.busy && !self.input.is_empty() {
                            let message = self.input.contents();
                            self.input.clear();
                            let session = Arc::clone(&self.session);
                            tokio::spawn(async move {
                                session.send_user_message(&message).await;
                            });
                        }
                    }
                    KeyCode::Char(c) => self.input.insert_char(c),
                    KeyCode::Backspace => self.input.delete_char(),
                    KeyCode::Left => self.input.move_left(),
                    KeyCode::Right => self.input.move_right(),
                    KeyCode::Up => self.input.move_up(),
                    KeyCode::Down => self.input.move_down(),
                    KeyCode::Home => self.input.col = 0,
                    KeyCode::End => self.input.col = self.input.lines[self.input.row].len(),
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

pub fn run_tui(session: Arc<Session>) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT),
        },
    )?;

    let mut app = App::new(session);

    let _guard = TerminalGuard;

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    disable_raw_mode()?;
    io::stdout().flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::InputBuffer;

    #[test]
    fn input_buffer_edits_across_lines() {
        let mut buffer = InputBuffer::new();
        for ch in "first".chars() {
            buffer.insert_char(ch);
        }
        buffer.break_line();
        for ch in "second".chars() {
            buffer.insert_char(ch);
        }
        assert_eq!(buffer.contents(), "first\nsecond");

        // Backspace at the start of a line joins it with the previous one.
        for _ in 0.."second".len() {
            buffer.delete_char();
        }
        buffer.delete_char();
        assert_eq!(buffer.contents(), "first");
        assert!(!buffer.is_empty());
    }

    #[test]
    fn input_buffer_clear_resets_cursor() {
        let mut buffer = InputBuffer::new();
        for ch in "abc".chars() {
            buffer.insert_char(ch);
        }
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.contents(), "");
    }
}
