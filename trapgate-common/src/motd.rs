use std::path::Path;

use once_cell::sync::Lazy;
use time::format_description::{self, FormatItem};
use time::OffsetDateTime;
use tracing::*;

#[allow(clippy::unwrap_used)]
static BANNER_TIME_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse(
        "[weekday repr:short] [month repr:short] [day] [hour]:[minute]:[second] UTC [year]",
    )
    .unwrap()
});

/// Banner lines for a new shell session. Each line of the MOTD file is a
/// template taking `{now}` and `{hostname}`; an unreadable file yields a
/// single fallback line.
pub fn motd_lines(path: &Path, hostname: &str) -> Vec<String> {
    let now = OffsetDateTime::now_utc()
        .format(&BANNER_TIME_FORMAT)
        .unwrap_or_default();
    match std::fs::read_to_string(path) {
        Ok(contents) => render_motd(&contents, hostname, &now),
        Err(error) => {
            warn!(%error, path=%path.display(), "Failed to read MOTD file, using fallback banner");
            vec![format!("Welcome. (Host: 192.168.100.3 Time: {now})")]
        }
    }
}

fn render_motd(contents: &str, hostname: &str, now: &str) -> Vec<String> {
    // Hostname is padded to 10 columns including the trailing colon.
    let formatted_hostname = format!("{:<10}", format!("{hostname}:"));
    contents
        .lines()
        .map(|line| {
            line.replace("{now}", now)
                .replace("{hostname}", &formatted_hostname)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_templates_are_rendered() {
        let lines = render_motd(
            "Last login: {now}\nSystem: {hostname} ok\n",
            "ns340412",
            "Mon Jan 02 15:04:05 UTC 2006",
        );
        assert_eq!(
            lines,
            vec![
                "Last login: Mon Jan 02 15:04:05 UTC 2006".to_owned(),
                "System: ns340412: ok".to_owned(),
            ]
        );
    }

    #[test]
    fn test_hostname_padding() {
        let lines = render_motd("[{hostname}]", "ab", "now");
        assert_eq!(lines, vec!["[ab:       ]".to_owned()]);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let lines = motd_lines(Path::new("/nonexistent/motd.txt"), "host");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Welcome. (Host: 192.168.100.3 Time: "));
    }

    #[test]
    fn test_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "hello {{hostname}}").unwrap();
        let lines = motd_lines(file.path(), "srv");
        assert_eq!(lines, vec!["hello srv:      ".to_owned()]);
    }
}
