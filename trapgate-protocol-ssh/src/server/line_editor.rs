use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use tracing::*;
use trapgate_common::{completion_diff, strip_ansi};

const MAX_HISTORY_LENGTH: usize = 1000;

/// Byte-level terminal transport. `recv_byte` returns `None` on EOF.
#[async_trait]
pub trait TerminalIo: Send {
    async fn recv_byte(&mut self) -> Result<Option<u8>>;
    async fn send(&mut self, data: &[u8]) -> Result<()>;
}

/// Round-trips a partial command against the backend shell and returns
/// the probed command together with the raw capture.
#[async_trait]
pub trait CompletionSource: Send {
    async fn complete(&mut self, cwd: &str, command: String) -> Result<(String, String)>;
}

/// Server-side readline over a raw SSH channel. The buffer is a sequence
/// of byte groups: live input inserts one byte per group and leaves
/// multibyte sequences to the client terminal to interpret; history
/// recall regroups per character.
pub struct LineEditor<T, C> {
    io: T,
    completer: C,
    prompt: String,
    cwd: String,
    buffer: Vec<Vec<u8>>,
    cursor: usize,
    prev_rendered_len: usize,
    history: VecDeque<String>,
    history_index: Option<usize>,
}

impl<T: TerminalIo, C: CompletionSource> LineEditor<T, C> {
    pub fn new(io: T, completer: C, prompt: String, cwd: String) -> Self {
        LineEditor {
            io,
            completer,
            prompt,
            cwd,
            buffer: vec![],
            cursor: 0,
            prev_rendered_len: 0,
            history: VecDeque::new(),
            history_index: None,
        }
    }

    pub fn update_prompt(&mut self, prompt: String) {
        self.prompt = prompt;
    }

    pub fn update_cwd(&mut self, cwd: String) {
        self.cwd = cwd;
    }

    /// Reads one line. `None` means the client went away.
    pub async fn read(&mut self) -> Result<Option<String>> {
        self.buffer.clear();
        self.cursor = 0;
        self.history_index = None;
        self.io.send(b"\r\x1b[2K").await?;
        self.io.send(self.prompt.as_bytes()).await?;

        loop {
            let Some(byte) = self.io.recv_byte().await? else {
                return Ok(None);
            };

            match byte {
                0x1b => {
                    if !self.handle_escape_sequence().await? {
                        return Ok(None);
                    }
                }
                b'\n' | b'\r' => {
                    self.io.send(b"\r\n").await?;
                    let line = self.buffer_string();
                    if !line.is_empty() {
                        self.history.push_back(line.clone());
                        if self.history.len() > MAX_HISTORY_LENGTH {
                            self.history.pop_front();
                        }
                    }
                    return Ok(Some(line));
                }
                0x7f | 0x08 => {
                    self.handle_backspace().await?;
                }
                b'\t' => {
                    self.handle_tab_completion().await?;
                }
                byte => {
                    self.handle_insert(byte).await?;
                }
            }
        }
    }

    /// Writes straight through to the client, bypassing the edit buffer.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.io.send(data).await
    }

    /// Resets SGR attributes on the client terminal.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.io.send(b"\x1b[0m").await
    }

    pub fn into_io(self) -> T {
        self.io
    }

    fn buffer_string(&self) -> String {
        String::from_utf8_lossy(&self.buffer.concat()).into_owned()
    }

    async fn handle_insert(&mut self, byte: u8) -> Result<()> {
        self.buffer.insert(self.cursor, vec![byte]);
        self.cursor += 1;

        if self.cursor == self.buffer.len() {
            self.io.send(&[byte]).await?;
        } else {
            let remainder = self.buffer[self.cursor - 1..].concat();
            self.io.send(&remainder).await?;
            self.io
                .send(format!("\x1b[{}D", remainder.len() - 1).as_bytes())
                .await?;
        }
        Ok(())
    }

    async fn handle_backspace(&mut self) -> Result<()> {
        if self.cursor == 0 {
            return Ok(());
        }
        self.buffer.remove(self.cursor - 1);
        self.cursor -= 1;

        if self.cursor == self.buffer.len() {
            self.io.send(b"\x08 \x08").await?;
        } else {
            let mut data = vec![0x08];
            data.extend_from_slice(&self.buffer[self.cursor..].concat());
            data.push(b' ');
            let shift = data.len() - 1;
            self.io.send(&data).await?;
            self.io.send(format!("\x1b[{shift}D").as_bytes()).await?;
        }
        Ok(())
    }

    /// Exactly two bytes follow an ESC; longer CSI tails are not
    /// understood and their remainder is consumed as ordinary input.
    /// Returns `false` on EOF.
    async fn handle_escape_sequence(&mut self) -> Result<bool> {
        let Some(first) = self.io.recv_byte().await? else {
            return Ok(false);
        };
        let Some(second) = self.io.recv_byte().await? else {
            return Ok(false);
        };

        match [first, second] {
            [b'[', b'A'] => {
                if !self.history.is_empty() {
                    let index = match self.history_index {
                        None => self.history.len() - 1,
                        Some(index) => index.saturating_sub(1),
                    };
                    self.history_index = Some(index);
                    self.load_history_entry(index).await?;
                }
            }
            [b'[', b'B'] => {
                if !self.history.is_empty() {
                    let next = match self.history_index {
                        None => Some(0),
                        Some(index) if index + 1 < self.history.len() => Some(index + 1),
                        Some(_) => None,
                    };
                    if let Some(next) = next {
                        self.history_index = Some(next);
                        self.load_history_entry(next).await?;
                    }
                }
            }
            [b'[', b'C'] => {
                if self.cursor < self.buffer.len() {
                    self.cursor += 1;
                    self.io.send(b"\x1b[C").await?;
                }
            }
            [b'[', b'D'] => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.io.send(b"\x1b[D").await?;
                }
            }
            [b'[', b'3'] => {
                let Some(tail) = self.io.recv_byte().await? else {
                    return Ok(false);
                };
                if tail == b'~' && self.cursor < self.buffer.len() {
                    self.handle_delete().await?;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    async fn handle_delete(&mut self) -> Result<()> {
        self.buffer.remove(self.cursor);

        if self.cursor == self.buffer.len() {
            self.io.send(b" \x08").await?;
        } else {
            let mut remainder = self.buffer[self.cursor..].concat();
            remainder.push(b' ');
            self.io.send(&remainder).await?;
            self.io
                .send(format!("\x1b[{}D", remainder.len()).as_bytes())
                .await?;
        }
        Ok(())
    }

    async fn load_history_entry(&mut self, index: usize) -> Result<()> {
        let Some(entry) = self.history.get(index).cloned() else {
            debug!(index, "History index out of range");
            return Ok(());
        };
        self.buffer = entry
            .chars()
            .map(|c| c.to_string().into_bytes())
            .collect();
        self.cursor = self.buffer.len();
        self.redraw().await
    }

    async fn redraw(&mut self) -> Result<()> {
        self.io.send(b"\r").await?;
        self.io.send(self.prompt.as_bytes()).await?;

        let rendered = self.buffer.concat();
        self.io.send(&rendered).await?;

        // Erase columns left over from a longer previous render.
        if self.prev_rendered_len > rendered.len() {
            let diff = self.prev_rendered_len - rendered.len();
            self.io.send(" ".repeat(diff).as_bytes()).await?;
            self.io.send(format!("\x1b[{diff}D").as_bytes()).await?;
        }

        let back: usize = self.buffer[self.cursor..].iter().map(Vec::len).sum();
        if back > 0 {
            self.io.send(format!("\x1b[{back}D").as_bytes()).await?;
        }

        self.prev_rendered_len = rendered.len();
        Ok(())
    }

    async fn handle_tab_completion(&mut self) -> Result<()> {
        let full_input = self.buffer_string();
        let Some(last_token) = full_input.split_whitespace().last().map(str::to_owned) else {
            return Ok(());
        };

        let probe = format!("{full_input}\t");
        let (command, raw_output) = match self.completer.complete(&self.cwd, probe).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(%error, "Tab completion probe failed");
                return Ok(());
            }
        };

        let cleaned = strip_ansi(&raw_output);
        let diff = completion_diff(command.trim(), cleaned.trim()).to_owned();
        if diff.is_empty() {
            return Ok(());
        }

        let buffer_str = self.buffer_string();
        let Some(token_start) = buffer_str.rfind(&last_token) else {
            return Ok(());
        };
        let Some(mut index) = self.element_index_at(token_start + last_token.len()) else {
            return Ok(());
        };
        for ch in diff.chars() {
            self.buffer.insert(index, ch.to_string().into_bytes());
            index += 1;
        }
        self.cursor = index;
        self.redraw().await
    }

    /// Maps a byte offset of the rendered buffer back to a group index.
    fn element_index_at(&self, byte_offset: usize) -> Option<usize> {
        let mut total = 0;
        for (index, group) in self.buffer.iter().enumerate() {
            if total == byte_offset {
                return Some(index);
            }
            total += group.len();
        }
        (total == byte_offset).then_some(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct ScriptedTerminal {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl ScriptedTerminal {
        fn new(input: &[u8]) -> Self {
            ScriptedTerminal {
                input: input.iter().copied().collect(),
                output: vec![],
            }
        }
    }

    #[async_trait]
    impl TerminalIo for ScriptedTerminal {
        async fn recv_byte(&mut self) -> Result<Option<u8>> {
            Ok(self.input.pop_front())
        }

        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.output.extend_from_slice(data);
            Ok(())
        }
    }

    struct NoCompletion;

    #[async_trait]
    impl CompletionSource for NoCompletion {
        async fn complete(&mut self, _cwd: &str, command: String) -> Result<(String, String)> {
            Ok((command, String::new()))
        }
    }

    struct StaticCompletion {
        raw_output: String,
    }

    #[async_trait]
    impl CompletionSource for StaticCompletion {
        async fn complete(&mut self, _cwd: &str, command: String) -> Result<(String, String)> {
            Ok((command, self.raw_output.clone()))
        }
    }

    fn editor(input: &[u8]) -> LineEditor<ScriptedTerminal, NoCompletion> {
        LineEditor::new(
            ScriptedTerminal::new(input),
            NoCompletion,
            "$ ".to_owned(),
            "~".to_owned(),
        )
    }

    #[tokio::test]
    async fn test_cursor_left_then_insert() {
        let mut editor = editor(b"abc\x1b[Dx\r\x1b[A\r");

        assert_eq!(editor.read().await.unwrap().as_deref(), Some("abxc"));
        // The line was pushed to history and can be recalled.
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("abxc"));
    }

    #[tokio::test]
    async fn test_history_recall_two_up() {
        let mut editor = editor(b"ls\rpwd\r\x1b[A\x1b[A\r");

        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ls"));
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("pwd"));
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ls"));
    }

    #[tokio::test]
    async fn test_backspace_at_end() {
        let mut editor = editor(b"abc\x08\x08\r");
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_backspace_mid_line() {
        let mut editor = editor(b"abc\x1b[D\x7f\r");
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ac"));
    }

    #[tokio::test]
    async fn test_delete_key_removes_under_cursor() {
        let mut editor = editor(b"abc\x1b[D\x1b[3~\r");
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ab"));
    }

    #[tokio::test]
    async fn test_empty_line_not_pushed_to_history() {
        let mut editor = editor(b"\rok\r\x1b[A\x1b[A\r");

        assert_eq!(editor.read().await.unwrap().as_deref(), Some(""));
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ok"));
        // Two UPs cannot go past the single real entry.
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut editor = editor(b"");
        assert_eq!(editor.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_escape_sequence() {
        let mut editor = editor(b"ls\x1b[");
        assert_eq!(editor.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tab_completion_inserts_suffix() {
        let mut editor = LineEditor::new(
            ScriptedTerminal::new(b"ls /tm\t\r"),
            StaticCompletion {
                raw_output: "ls /tmp/".to_owned(),
            },
            "$ ".to_owned(),
            "~".to_owned(),
        );

        assert_eq!(editor.read().await.unwrap().as_deref(), Some("ls /tmp/"));
    }

    #[tokio::test]
    async fn test_tab_completion_with_ansi_noise() {
        let mut editor = LineEditor::new(
            ScriptedTerminal::new(b"cat fi\t\r"),
            StaticCompletion {
                raw_output: "\x1b[0mcat file.txt\x1b[K".to_owned(),
            },
            "$ ".to_owned(),
            "~".to_owned(),
        );

        assert_eq!(
            editor.read().await.unwrap().as_deref(),
            Some("cat file.txt")
        );
    }

    #[tokio::test]
    async fn test_tab_without_input_is_ignored() {
        let mut editor = editor(b"\t\r");
        assert_eq!(editor.read().await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_redraw_erases_stale_columns() {
        let mut editor = editor(b"abcdef\rxy\r\x1b[A\x1b[A\x1b[B\r");

        assert_eq!(editor.read().await.unwrap().as_deref(), Some("abcdef"));
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("xy"));
        // UP UP shows "abcdef", DOWN shrinks back to "xy": four stale
        // columns must be blanked and the cursor pulled back.
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("xy"));
        let output = String::from_utf8_lossy(&editor.into_io().output).into_owned();
        assert!(output.contains("    \x1b[4D"));
    }

    #[tokio::test]
    async fn test_cleanup_resets_attributes() {
        let mut editor = editor(b"");
        editor.cleanup().await.unwrap();
        assert_eq!(editor.into_io().output, b"\x1b[0m");
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let mut script = Vec::new();
        for i in 0..(MAX_HISTORY_LENGTH + 5) {
            script.extend_from_slice(format!("c{i}\r").as_bytes());
        }
        // Walk all the way up: the oldest surviving entry is c5.
        for _ in 0..(MAX_HISTORY_LENGTH + 10) {
            script.extend_from_slice(b"\x1b[A");
        }
        script.push(b'\r');

        let mut editor = editor(&script);
        for i in 0..(MAX_HISTORY_LENGTH + 5) {
            assert_eq!(
                editor.read().await.unwrap().as_deref(),
                Some(format!("c{i}").as_str())
            );
        }
        assert_eq!(editor.read().await.unwrap().as_deref(), Some("c5"));
    }
}
