//! Interactive shell over one SSH channel.
//!
//! [`LineEditor`] turns raw keystrokes into lines, echo and control events.
//! [`Shell`] feeds finished lines to the session and produces the bytes to
//! send back. Neither knows about SSH, so both are tested directly.

use tracing::{debug, info_span, warn};
use wana_kernel::Session;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const TAB: u8 = 0x09;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Longest line kept; further input is dropped until Enter.
const MAX_LINE: usize = 4096;

/// What a chunk of keystrokes amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Text to echo back as typed.
    Echo(String),
    /// Enter was pressed.
    Line(String),
    /// Ctrl-C; the buffer was discarded.
    Interrupt,
    /// Ctrl-D on an empty line.
    Eof,
    /// Tab; the buffer is left as is.
    Complete,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    /// Saw ESC.
    Start,
    /// Inside `ESC [ ...` until a final byte.
    Csi,
}

/// Minimal line discipline: echo, backspace, Ctrl-C, Ctrl-D, Tab.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    escape: Escape,
    /// Bytes of an incomplete UTF-8 sequence split across packets.
    pending: Vec<u8>,
    /// Last byte was CR, so a following LF belongs to the same Enter.
    after_cr: bool,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append text to the buffer as if typed, e.g. a completion.
    pub fn insert(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Process raw bytes from the peer.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Input> {
        let mut events = Vec::new();
        let mut echo = String::new();

        for &byte in data {
            match self.escape {
                Escape::Start => {
                    self.escape = if byte == b'[' || byte == b'O' {
                        Escape::Csi
                    } else {
                        Escape::None
                    };
                    continue;
                }
                Escape::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            let after_cr = std::mem::take(&mut self.after_cr);
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    flush(&mut echo, &mut events);
                    self.pending.clear();
                    self.after_cr = byte == b'\r';
                    events.push(Input::Line(std::mem::take(&mut self.buffer)));
                }
                CTRL_C => {
                    flush(&mut echo, &mut events);
                    self.buffer.clear();
                    self.pending.clear();
                    events.push(Input::Interrupt);
                }
                CTRL_D => {
                    if self.buffer.is_empty() {
                        flush(&mut echo, &mut events);
                        events.push(Input::Eof);
                    }
                }
                TAB => {
                    flush(&mut echo, &mut events);
                    events.push(Input::Complete);
                }
                BACKSPACE | DEL => {
                    if self.buffer.pop().is_some() {
                        echo.push_str("\x08 \x08");
                    }
                }
                ESC => self.escape = Escape::Start,
                b if b < 0x20 => {}
                b => {
                    self.pending.push(b);
                    match std::str::from_utf8(&self.pending) {
                        Ok(text) => {
                            if self.buffer.len() + text.len() <= MAX_LINE {
                                self.buffer.push_str(text);
                                echo.push_str(text);
                            }
                            self.pending.clear();
                        }
                        Err(e) if e.error_len().is_some() => self.pending.clear(),
                        Err(_) => {}
                    }
                }
            }
        }
        flush(&mut echo, &mut events);
        events
    }
}

fn flush(echo: &mut String, events: &mut Vec<Input>) {
    if !echo.is_empty() {
        events.push(Input::Echo(std::mem::take(echo)));
    }
}

/// Convert bare `\n` to `\r\n` for a terminal.
pub fn to_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev = '\0';
    for c in text.chars() {
        if c == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(c);
        prev = c;
    }
    out
}

/// Bytes to send after one round of input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub text: String,
    /// The session ended; close the channel after sending `text`.
    pub close: bool,
}

/// One interactive shell session.
pub struct Shell {
    session: Session,
    editor: LineEditor,
    pty: bool,
}

impl Shell {
    pub fn new(session: Session, pty: bool) -> Self {
        Self {
            session,
            editor: LineEditor::new(),
            pty,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn term(&self, text: &str) -> String {
        if self.pty { to_crlf(text) } else { text.to_string() }
    }

    /// Login message, if any, followed by the first prompt.
    pub async fn greeting(&self) -> String {
        let session = self.session.clone();
        let text = tokio::task::spawn_blocking(move || {
            let mut text = session.login_message().unwrap_or_default();
            text.push_str(&session.prompt());
            text
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "greeting task failed");
            String::new()
        });
        self.term(&text)
    }

    /// Handle raw input from the peer.
    pub async fn feed(&mut self, data: &[u8]) -> ShellOutput {
        let mut out = ShellOutput::default();
        for input in self.editor.feed(data) {
            match input {
                Input::Echo(text) if self.pty => out.text.push_str(&text),
                Input::Echo(_) => {}
                Input::Line(line) => {
                    if self.pty {
                        out.text.push_str("\r\n");
                    }
                    let (output, closed) = self.run_line(line).await;
                    out.text.push_str(&self.term(&output));
                    if closed {
                        out.close = true;
                        return out;
                    }
                }
                Input::Interrupt => {
                    out.text.push_str("^C\r\n");
                    let prompt = self.prompt().await;
                    out.text.push_str(&self.term(&prompt));
                }
                Input::Eof => {
                    out.text.push_str(&self.term("logout\n"));
                    self.session.exit();
                    out.close = true;
                    return out;
                }
                Input::Complete => {
                    let completion = self.complete().await;
                    out.text.push_str(&completion);
                }
            }
        }
        out
    }

    /// Render the prompt off the async runtime; prompt hooks run scripts.
    async fn prompt(&self) -> String {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.prompt())
            .await
            .unwrap_or_else(|e| {
                warn!(session = %self.session.id(), error = %e, "prompt task failed");
                String::new()
            })
    }

    /// Dispatch a line off the async runtime; returns output plus prompt.
    async fn run_line(&self, line: String) -> (String, bool) {
        let session = self.session.clone();
        let span = info_span!("shell.line", session = %session.id());
        let joined = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            session.dispatch(&line);
            let mut text = session.take_output();
            let closed = session.is_closed();
            if !closed {
                text.push_str(&session.prompt());
            }
            (text, closed)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "dispatch task failed");
                (self.prompt().await, false)
            }
        }
    }

    /// Complete the command name being typed.
    ///
    /// One match completes inline. Several matches extend the buffer to
    /// their common prefix, or are listed and the prompt redrawn.
    async fn complete(&mut self) -> String {
        let partial = self.editor.buffer().to_string();
        if partial.is_empty() || partial.contains(' ') {
            return String::new();
        }

        let names: Vec<String> = self
            .session
            .registry()
            .match_prefix(&partial)
            .into_iter()
            .map(|e| e.name)
            .collect();
        debug!(partial = %partial, matches = names.len(), "tab completion");

        match names.as_slice() {
            [] => "\x07".to_string(),
            [only] => {
                let rest = format!("{} ", &only[partial.len()..]);
                self.editor.insert(&rest);
                rest
            }
            many => {
                let common = common_prefix(many);
                if common.len() > partial.len() {
                    let rest = common[partial.len()..].to_string();
                    self.editor.insert(&rest);
                    return rest;
                }
                let prompt = self.prompt().await;
                let listing = format!("\n{}\n{}{}", many.join("  "), prompt, partial);
                self.term(&listing)
            }
        }
    }
}

fn common_prefix(names: &[String]) -> &str {
    let Some(first) = names.first() else {
        return "";
    };
    let mut len = first.len();
    for name in &names[1..] {
        len = first
            .char_indices()
            .zip(name.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map(|((i, a), _)| i + a.len_utf8())
            .unwrap_or(0)
            .min(len);
    }
    &first[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wana_kernel::{CmdArgs, Config, Host, Mode, Node, Vfs};

    fn session() -> Session {
        let root = Node::directory("", "root", "root", Mode::dir(0o755))
            .with_child(Node::directory("bin", "root", "root", Mode::dir(0o755)));
        let vfs = Arc::new(Vfs::new(root, "/home/{}"));

        let mut config = Config::new("test");
        for name in ["cat", "cd", "chmod", "chown"] {
            config.register_command(
                name,
                "/bin",
                Arc::new(|_: &CmdArgs, _: &Session| -> anyhow::Result<()> { Ok(()) }),
            );
        }
        config.register_command(
            "echo",
            "/bin",
            Arc::new(|args: &CmdArgs, s: &Session| -> anyhow::Result<()> {
                s.writeln(&args.positional().join(" "));
                Ok(())
            }),
        );
        config.register_command(
            "exit",
            "/bin",
            Arc::new(|_: &CmdArgs, s: &Session| -> anyhow::Result<()> {
                s.exit();
                Ok(())
            }),
        );
        let host = Host::builder(vfs).hostname("box").config(config).build().unwrap();
        Session::new(Arc::new(host), "alice", "192.0.2.1")
    }

    #[test]
    fn test_editor_lines_and_echo() {
        let mut editor = LineEditor::new();
        assert_eq!(
            editor.feed(b"ls -la\r"),
            vec![Input::Echo("ls -la".into()), Input::Line("ls -la".into())]
        );
        // CRLF is one Enter
        assert_eq!(editor.feed(b"\npwd\r\n"), vec![
            Input::Echo("pwd".into()),
            Input::Line("pwd".into())
        ]);
    }

    #[test]
    fn test_editor_backspace_and_control() {
        let mut editor = LineEditor::new();
        let events = editor.feed(b"lx\x7fs\x03");
        assert_eq!(
            events,
            vec![Input::Echo("lx\x08 \x08s".into()), Input::Interrupt]
        );
        assert_eq!(editor.buffer(), "");

        // backspace on an empty line echoes nothing
        assert!(editor.feed(b"\x7f").is_empty());
        assert_eq!(editor.feed(b"x\x04"), vec![Input::Echo("x".into())]);
        editor.feed(b"\x7f");
        assert_eq!(editor.feed(b"\x04"), vec![Input::Eof]);
    }

    #[test]
    fn test_editor_swallows_escapes() {
        let mut editor = LineEditor::new();
        // up arrow, then F1 in SS3 form
        assert_eq!(
            editor.feed(b"\x1b[Aa\x1bOPb"),
            vec![Input::Echo("ab".into())]
        );
    }

    #[test]
    fn test_editor_utf8_across_packets() {
        let mut editor = LineEditor::new();
        let bytes = "é".as_bytes();
        assert!(editor.feed(&bytes[..1]).is_empty());
        assert_eq!(editor.feed(&bytes[1..]), vec![Input::Echo("é".into())]);
    }

    #[test]
    fn test_crlf() {
        assert_eq!(to_crlf("a\nb\r\nc"), "a\r\nb\r\nc");
    }

    #[test]
    fn test_common_prefix() {
        let names = vec!["chmod".to_string(), "chown".to_string()];
        assert_eq!(common_prefix(&names), "ch");
        assert_eq!(common_prefix(&[]), "");
    }

    #[tokio::test]
    async fn test_shell_round_trip() {
        let mut shell = Shell::new(session(), true);
        assert_eq!(shell.greeting().await, "alice@box:/$ ");

        let out = shell.feed(b"echo hi\r").await;
        assert_eq!(out.text, "echo hi\r\nhi\r\nalice@box:/$ ");
        assert!(!out.close);

        let out = shell.feed(b"nope\r").await;
        assert_eq!(out.text, "nope\r\nnope: command not found\r\nalice@box:/$ ");

        let out = shell.feed(b"exit\r").await;
        assert_eq!(out.text, "exit\r\n");
        assert!(out.close);
    }

    #[tokio::test]
    async fn test_shell_without_pty() {
        let mut shell = Shell::new(session(), false);
        let out = shell.feed(b"echo plain\n").await;
        assert_eq!(out.text, "plain\nalice@box:/$ ");
    }

    #[tokio::test]
    async fn test_tab_completion() {
        let mut shell = Shell::new(session(), true);
        assert_eq!(shell.feed(b"ec\t").await.text, "echo ");
        assert_eq!(shell.editor.buffer(), "echo ");

        let mut shell = Shell::new(session(), true);
        let out = shell.feed(b"ch\t").await;
        assert_eq!(out.text, "ch\r\nchmod  chown\r\nalice@box:/$ ch");
        assert_eq!(shell.editor.buffer(), "ch");

        let mut shell = Shell::new(session(), true);
        assert_eq!(shell.feed(b"zz\t").await.text, "zz\x07");
    }

    #[tokio::test]
    async fn test_ctrl_c_redraws_prompt() {
        let mut shell = Shell::new(session(), true);
        let out = shell.feed(b"echo x\x03").await;
        assert_eq!(out.text, "echo x^C\r\nalice@box:/$ ");
        assert!(!out.close);
        assert!(shell.session().history().is_empty());
    }

    #[tokio::test]
    async fn test_ctrl_d_closes() {
        let mut shell = Shell::new(session(), true);
        let out = shell.feed(b"\x04").await;
        assert_eq!(out.text, "logout\r\n");
        assert!(out.close);
        assert!(shell.session().is_closed());
    }
}
