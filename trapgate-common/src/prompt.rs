/// Renders `user@host:cwd$ `, the shape the backend prompt scraper
/// assumes. Hostname is truncated by the caller.
pub fn format_prompt(username: &str, hostname: &str, cwd: &str) -> String {
    format!("{username}@{hostname}:{cwd}$ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prompt() {
        assert_eq!(format_prompt("root", "ns340412", "~"), "root@ns340412:~$ ");
        assert_eq!(
            format_prompt("admin", "box", "/var/log"),
            "admin@box:/var/log$ "
        );
    }
}
