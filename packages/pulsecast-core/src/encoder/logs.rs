//! Encoder log inspection.
//!
//! Logs are append-only plain text owned by the supervisor; everything here
//! only reads. Besides tailing for subscribers, this module scrapes two
//! things out of the logs: the most recent error line (stored on the session
//! row when a stream dies) and the progress stats the encoder prints
//! (`bitrate=`, `fps=`, `speed=`) for the monitoring snapshot.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Keywords that mark a log line as an error candidate, checked
/// case-insensitively.
const ERROR_KEYWORDS: &[&str] = &["error", "failed", "timeout", "invalid", "cannot", "could not"];

/// Returns the last `n` lines of a file, oldest first.
pub fn tail_file(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}

/// Finds the most recent log file for a session in `log_dir`.
///
/// Log names embed the session id and a sortable timestamp
/// (`session_<id>_<YYYYmmdd_HHMMSS>.log`), so the lexicographic maximum is
/// the newest.
pub fn latest_log_for_session(log_dir: &Path, session_id: i64) -> Option<PathBuf> {
    let prefix = format!("session_{}_", session_id);
    let entries = std::fs::read_dir(log_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .max()
}

/// Extracts the most recent error-looking line from the tail of a log.
///
/// Falls back to the very last line when nothing matches a keyword, so a
/// crash always captures *something* actionable.
pub fn last_error_line(lines: &[String]) -> Option<String> {
    for line in lines.iter().rev() {
        let lower = line.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return Some(line.trim().to_string());
        }
    }
    lines
        .last()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Encoder progress stats scraped from a log tail.
///
/// Absent tokens are reported as the literal string `N/A` so dashboards can
/// render the field unconditionally.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EncoderStats {
    pub bitrate: String,
    pub fps: String,
    pub speed: String,
}

impl Default for EncoderStats {
    fn default() -> Self {
        Self {
            bitrate: "N/A".to_string(),
            fps: "N/A".to_string(),
            speed: "N/A".to_string(),
        }
    }
}

/// Scrapes `bitrate=`, `fps=` and `speed=` values from a log tail.
///
/// The encoder prints progress lines like
/// `frame=  123 fps= 30 q=28.0 size=1024kB time=00:00:04.10 bitrate=2048.0kbits/s speed=1.0x`;
/// the last occurrence of each token wins.
pub fn scrape_stats(lines: &[String]) -> EncoderStats {
    let joined = lines.join("\n");
    let mut stats = EncoderStats::default();
    if let Some(v) = last_token_value(&joined, "bitrate=") {
        stats.bitrate = v;
    }
    if let Some(v) = last_token_value(&joined, "fps=") {
        stats.fps = v;
    }
    if let Some(v) = last_token_value(&joined, "speed=") {
        stats.speed = v;
    }
    stats
}

fn last_token_value(haystack: &str, token: &str) -> Option<String> {
    let idx = haystack.rfind(token)?;
    let rest = &haystack[idx + token.len()..];
    let value = rest.split_whitespace().next()?;
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tail_returns_last_n_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_1_20250601_120000.log");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "line {}", i).unwrap();
        }

        let tail = tail_file(&path, 3).unwrap();
        assert_eq!(tail, lines(&["line 7", "line 8", "line 9"]));

        // Asking for more lines than exist returns everything.
        assert_eq!(tail_file(&path, 100).unwrap().len(), 10);
    }

    #[test]
    fn latest_log_picks_newest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "session_5_20250601_120000.log",
            "session_5_20250602_080000.log",
            "session_6_20250603_090000.log",
        ] {
            std::fs::File::create(dir.path().join(name)).unwrap();
        }

        let latest = latest_log_for_session(dir.path(), 5).unwrap();
        assert!(latest.ends_with("session_5_20250602_080000.log"));
        assert!(latest_log_for_session(dir.path(), 7).is_none());
    }

    #[test]
    fn last_error_prefers_keyword_lines() {
        let tail = lines(&[
            "frame= 100 fps=30",
            "Connection to tcp://ingest failed: Broken pipe",
            "frame= 101 fps=30",
        ]);
        assert_eq!(
            last_error_line(&tail).unwrap(),
            "Connection to tcp://ingest failed: Broken pipe"
        );
    }

    #[test]
    fn last_error_falls_back_to_final_line() {
        let tail = lines(&["frame= 100 fps=30", "frame= 101 fps=30"]);
        assert_eq!(last_error_line(&tail).unwrap(), "frame= 101 fps=30");
        assert_eq!(last_error_line(&[]), None);
    }

    #[test]
    fn stats_scraped_from_progress_line() {
        let tail = lines(&[
            "frame=  123 fps= 30 q=28.0 size=1024kB time=00:00:04.10 bitrate=2048.0kbits/s speed=1.0x",
        ]);
        let stats = scrape_stats(&tail);
        assert_eq!(stats.bitrate, "2048.0kbits/s");
        assert_eq!(stats.fps, "30");
        assert_eq!(stats.speed, "1.0x");
    }

    #[test]
    fn stats_use_last_occurrence() {
        let tail = lines(&[
            "bitrate=1000.0kbits/s speed=0.9x",
            "bitrate=2000.0kbits/s speed=1.0x",
        ]);
        let stats = scrape_stats(&tail);
        assert_eq!(stats.bitrate, "2000.0kbits/s");
        assert_eq!(stats.speed, "1.0x");
    }

    #[test]
    fn missing_tokens_stay_not_available() {
        let stats = scrape_stats(&lines(&["[warning] something unrelated"]));
        assert_eq!(stats, EncoderStats::default());
    }
}
