use once_cell::sync::Lazy;
use regex::Regex;
use trapgate_common::remove_prompt;

/// Assumes the backend renders `user@host:cwd$ ` prompts; anything else
/// falls back to `~`.
#[allow(clippy::unwrap_used)]
static PROMPT_CWD: Lazy<Regex> = Lazy::new(|| Regex::new(r"@[^:]+:(.*?)[\$#] ?").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    pub cwd: String,
}

/// A chunk ends the receive loop when it carries a shell prompt marker.
pub fn contains_prompt(chunk: &[u8]) -> bool {
    chunk.windows(2).any(|w| w == b"$ " || w == b"# ")
}

/// Recovers command output and working directory from a PTY transcript.
/// `prompt_chunk` is the chunk the prompt marker was detected in.
pub fn parse_transcript(output: &[u8], prompt_chunk: &[u8], sent_command: &str) -> CommandResult {
    let prompt_text = String::from_utf8_lossy(prompt_chunk);
    let prompt_text = prompt_text.trim();

    let lines: Vec<&[u8]> = output.split(|b| *b == b'\n').collect();
    let mut kept: Vec<String> = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let text = String::from_utf8_lossy(line);
        // The backend echoes the sent command; suppress it.
        if !sent_command.is_empty() && text.trim().contains(sent_command) {
            continue;
        }
        if index + 1 == lines.len() {
            kept.push(remove_prompt(&text));
        } else {
            kept.push(text.into_owned());
        }
    }

    let cwd = PROMPT_CWD
        .captures(prompt_text)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().trim().to_owned())
        .unwrap_or_else(|| "~".to_owned());

    CommandResult {
        output: kept.join("\n"),
        cwd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_line_is_suppressed_and_cwd_scraped() {
        let transcript = b"echo hi\r\nhi\r\nuser@box:/tmp$ ";
        let result = parse_transcript(transcript, transcript, "echo hi");
        assert!(result.output.contains("hi"));
        assert!(!result.output.contains("echo hi"));
        assert_eq!(result.cwd, "/tmp");
    }

    #[test]
    fn test_colored_prompt_line_is_removed() {
        let transcript = b"ls\r\nfile.txt\r\n\x1b[41muser@box:~$ ";
        let result = parse_transcript(transcript, transcript, "ls");
        assert_eq!(result.output, "file.txt\r\n");
        assert_eq!(result.cwd, "~");
    }

    #[test]
    fn test_unrecognized_prompt_defaults_to_home() {
        let transcript = b"output\r\n> ";
        let result = parse_transcript(transcript, b"> ", "cmd");
        assert_eq!(result.cwd, "~");
    }

    #[test]
    fn test_root_prompt_marker() {
        let transcript = b"whoami\r\nroot\r\nroot@box:/etc# ";
        assert!(contains_prompt(transcript));
        let result = parse_transcript(transcript, transcript, "whoami");
        assert_eq!(result.cwd, "/etc");
        assert!(result.output.contains("root"));
    }

    #[test]
    fn test_contains_prompt() {
        assert!(contains_prompt(b"user@box:~$ "));
        assert!(contains_prompt(b"x# y"));
        assert!(!contains_prompt(b"plain output"));
        assert!(!contains_prompt(b"$"));
    }
}
