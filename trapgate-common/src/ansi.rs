use once_cell::sync::Lazy;
use regex::Regex;

#[allow(clippy::unwrap_used)]
static CSI_SEQUENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

/// The color family the shell backend prefixes its prompt with.
#[allow(clippy::unwrap_used)]
static PROMPT_COLOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[4.").unwrap());

/// Removes all ECMA-48 escape sequences.
pub fn strip_ansi(text: &str) -> String {
    CSI_SEQUENCE.replace_all(text, "").into_owned()
}

/// Truncates the line at the last prompt-color marker and trims the tail.
/// Lines without a marker pass through unchanged.
pub fn remove_prompt(text: &str) -> String {
    match PROMPT_COLOR.find_iter(text).last() {
        Some(m) => text[..m.start()].trim_end().to_owned(),
        None => text.to_owned(),
    }
}

/// The suffix the backend appended to `original`, or `""` when `completed`
/// does not extend it.
pub fn completion_diff<'a>(original: &str, completed: &'a str) -> &'a str {
    completed.strip_prefix(original).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_colors() {
        assert_eq!(strip_ansi("\x1b[31mRED\x1b[0m"), "RED");
    }

    #[test]
    fn test_strip_ansi_cursor_and_two_byte_sequences() {
        assert_eq!(strip_ansi("a\x1b[10Db\x1bMc"), "abc");
        assert_eq!(strip_ansi("\x1b[1;31mbold red\x1b[2K"), "bold red");
    }

    #[test]
    fn test_strip_ansi_idempotent() {
        let noisy = "\x1b[32muser@host\x1b[0m:\x1b[34m~\x1b[0m$ ls\x1b[K";
        assert_eq!(strip_ansi(&strip_ansi(noisy)), strip_ansi(noisy));
    }

    #[test]
    fn test_remove_prompt_cuts_at_last_marker() {
        assert_eq!(remove_prompt("foo \x1b[41mbar"), "foo");
        assert_eq!(remove_prompt("a\x1b[40mb\x1b[42mc"), "a\u{1b}[40mb");
    }

    #[test]
    fn test_remove_prompt_without_marker() {
        assert_eq!(remove_prompt("plain text"), "plain text");
    }

    #[test]
    fn test_completion_diff() {
        assert_eq!(completion_diff("ls /tm", "ls /tmp/"), "p/");
        assert_eq!(completion_diff("ls /tm", "cat /etc"), "");
        assert_eq!(completion_diff("", "whole"), "whole");
    }
}
