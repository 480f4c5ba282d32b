#![forbid(unsafe_code)]

//! Builds yt-dlp argument vectors, runs the tool, and parses its
//! line-oriented JSON output.
//!
//! Arguments are always passed as a discrete vector straight to the spawn
//! primitive; no shell is involved, so escaping is never a correctness
//! concern. Search and info judge success by the exit code; download ignores
//! the exit code entirely and only trusts the presence of the output file,
//! because yt-dlp's status is unreliable once post-processing is involved.

use crate::resolver::{self, SongIdentifier};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;

/// Number of trailing output lines attached to a failed download report.
const DOWNLOAD_DIAGNOSTIC_LINES: usize = 3;

/// Length of the excerpt attached when a located JSON line refuses to parse.
const PARSE_EXCERPT_CHARS: usize = 100;

/// Operation-level failures reported to API clients. The `Display` text is
/// the client-facing error message; `details` carries captured tool output
/// when there is any.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Search query cannot be empty")]
    EmptyQuery,
    #[error("Song not found")]
    SongNotFound,
    #[error("Could not extract video ID")]
    NoVideoId,
    #[error("Failed to search songs")]
    SearchFailed { details: String },
    #[error("Failed to fetch song information")]
    InfoUnavailable { details: String },
    #[error("Failed to parse song information")]
    InfoUnparseable { details: String },
    #[error("Failed to download song")]
    DownloadFailed { details: String },
}

impl FetchError {
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::EmptyQuery | Self::SongNotFound | Self::NoVideoId => None,
            Self::SearchFailed { details }
            | Self::InfoUnavailable { details }
            | Self::InfoUnparseable { details }
            | Self::DownloadFailed { details } => Some(details),
        }
    }
}

/// One entry of a flat-playlist search response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: u64,
    pub duration_string: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub view_count: u64,
}

/// Full metadata for a single video.
#[derive(Debug, Clone, Serialize)]
pub struct SongInfo {
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub duration: u64,
    pub duration_string: String,
    pub thumbnail: Option<String>,
    pub channel: String,
    pub channel_url: Option<String>,
    pub view_count: u64,
    pub upload_date: Option<String>,
    pub url: String,
}

/// Identifier resolution outcome: the URL to hand to yt-dlp plus the video
/// ID when one could be determined. A missing ID is fatal for downloads only.
#[derive(Debug, Clone)]
pub struct ResolvedSong {
    pub url: String,
    pub video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSearchHit {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
    thumbnails: Option<Vec<RawThumbnail>>,
    view_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    channel_url: Option<String>,
    view_count: Option<u64>,
    upload_date: Option<String>,
}

struct ToolOutput {
    success: bool,
    /// stdout lines followed by stderr lines; diagnostics and the info-line
    /// scan both operate on this combined view.
    lines: Vec<String>,
}

impl ToolOutput {
    fn joined(&self) -> String {
        self.lines.join("\n")
    }

    fn tail(&self, count: usize) -> String {
        let skip = self.lines.len().saturating_sub(count);
        self.lines[skip..].join("\n")
    }
}

/// Handle to the external extraction tool.
pub struct YtDlp {
    program: PathBuf,
    cookies: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, cookies: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: cookies.into(),
        }
    }

    /// The cookie file is optional; the argument is only emitted when the
    /// file actually exists so a fresh checkout works without one.
    fn base_args(&self) -> Vec<String> {
        if self.cookies.is_file() {
            vec![
                "--cookies".to_string(),
                self.cookies.to_string_lossy().into_owned(),
            ]
        } else {
            Vec::new()
        }
    }

    pub fn search_args(&self, query: &str, limit: u32) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            ["--dump-json", "--flat-playlist", "--no-playlist"]
                .iter()
                .map(|arg| arg.to_string()),
        );
        args.push(format!("ytsearch{limit}:{query}"));
        args
    }

    pub fn info_args(&self, url: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            ["--dump-json", "--no-playlist", "--skip-unavailable-fragments"]
                .iter()
                .map(|arg| arg.to_string()),
        );
        args.push(url.to_string());
        args
    }

    pub fn download_args(&self, url: &str, dest: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            ["-x", "--audio-format", "mp3", "--audio-quality", "192K", "-o"]
                .iter()
                .map(|arg| arg.to_string()),
        );
        args.push(dest.to_string_lossy().into_owned());
        args.push("--no-playlist".to_string());
        args.push(url.to_string());
        args
    }

    fn run(&self, args: &[String]) -> std::io::Result<ToolOutput> {
        let output = Command::new(&self.program).args(args).output()?;
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        Ok(ToolOutput {
            success: output.status.success(),
            lines,
        })
    }

    /// Flat-playlist search. Zero valid result lines is still a success;
    /// only a failed process signals a search error.
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchResult>, FetchError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(FetchError::EmptyQuery);
        }

        let sanitized = resolver::sanitize_query(trimmed);
        let args = self.search_args(&sanitized, limit);
        let output = self
            .run(&args)
            .map_err(|err| FetchError::SearchFailed {
                details: err.to_string(),
            })?;
        if !output.success {
            return Err(FetchError::SearchFailed {
                details: output.joined(),
            });
        }

        Ok(parse_search_lines(&output.lines))
    }

    /// Fetches full metadata for one already-resolved URL.
    pub fn fetch_info(&self, url: &str) -> Result<SongInfo, FetchError> {
        let args = self.info_args(url);
        let output = self
            .run(&args)
            .map_err(|err| FetchError::InfoUnavailable {
                details: err.to_string(),
            })?;
        if !output.success {
            return Err(FetchError::InfoUnavailable {
                details: output.joined(),
            });
        }

        let line = select_info_line(&output.lines).ok_or_else(|| FetchError::InfoUnparseable {
            details: output.joined(),
        })?;

        let raw: RawVideoInfo =
            serde_json::from_str(line).map_err(|_| FetchError::InfoUnparseable {
                details: format!(
                    "Output: {}",
                    line.chars().take(PARSE_EXCERPT_CHARS).collect::<String>()
                ),
            })?;

        Ok(build_song_info(raw))
    }

    /// Extracts audio to `dest`. The exit code is ignored on purpose:
    /// success is judged solely by the output file existing afterwards.
    pub fn download_audio(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let args = self.download_args(url, dest);
        let tail = match self.run(&args) {
            Ok(output) => output.tail(DOWNLOAD_DIAGNOSTIC_LINES),
            Err(err) => err.to_string(),
        };

        if dest.is_file() {
            Ok(())
        } else {
            Err(FetchError::DownloadFailed { details: tail })
        }
    }

    /// Turns an arbitrary `song` parameter into a URL yt-dlp understands.
    /// Free text costs one search invocation with limit 1.
    pub fn resolve(&self, input: &str) -> Result<ResolvedSong, FetchError> {
        match resolver::classify(input) {
            SongIdentifier::VideoId(id) => Ok(ResolvedSong {
                url: resolver::canonical_url(&id),
                video_id: Some(id),
            }),
            SongIdentifier::Url(url) => {
                let video_id = resolver::extract_video_id(&url);
                Ok(ResolvedSong { url, video_id })
            }
            SongIdentifier::Query(query) => {
                let results = self.search(&query, 1)?;
                let first = results.into_iter().next().ok_or(FetchError::SongNotFound)?;
                Ok(ResolvedSong {
                    url: first.url,
                    video_id: Some(first.id),
                })
            }
        }
    }
}

/// Parses one JSON object per line, silently dropping lines that fail to
/// parse or carry no `id`. Order of the surviving lines is preserved.
pub fn parse_search_lines(lines: &[String]) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for line in lines {
        let Ok(raw) = serde_json::from_str::<RawSearchHit>(line) else {
            continue;
        };
        let Some(id) = raw.id.filter(|id| !id.is_empty()) else {
            continue;
        };
        let duration = raw.duration.map(|secs| secs as u64).unwrap_or(0);
        results.push(SearchResult {
            url: resolver::canonical_url(&id),
            id,
            title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
            duration,
            duration_string: format_duration(duration),
            channel: raw
                .channel
                .or(raw.uploader)
                .unwrap_or_else(|| "Unknown".to_string()),
            thumbnail: raw
                .thumbnails
                .and_then(|thumbs| thumbs.into_iter().next())
                .and_then(|thumb| thumb.url),
            view_count: raw.view_count.unwrap_or(0),
        });
    }
    results
}

/// Locates the JSON payload in combined tool output: the first line starting
/// with `{` wins, skipping blanks and WARNING noise; otherwise the very last
/// non-empty line is accepted if it at least contains `{`.
fn select_info_line(lines: &[String]) -> Option<&str> {
    for line in lines {
        if line.trim().is_empty() || line.starts_with("WARNING") {
            continue;
        }
        if line.starts_with('{') {
            return Some(line);
        }
    }

    lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .filter(|line| line.contains('{'))
        .map(String::as_str)
}

fn build_song_info(raw: RawVideoInfo) -> SongInfo {
    let duration = raw.duration.map(|secs| secs as u64).unwrap_or(0);
    let url = resolver::canonical_url(raw.id.as_deref().unwrap_or(""));
    SongInfo {
        id: raw.id,
        title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
        description: raw.description.unwrap_or_default(),
        duration,
        duration_string: format_duration(duration),
        thumbnail: raw.thumbnail,
        channel: raw
            .channel
            .or(raw.uploader)
            .unwrap_or_else(|| "Unknown".to_string()),
        channel_url: raw.channel_url,
        view_count: raw.view_count.unwrap_or(0),
        upload_date: raw.upload_date,
        url,
    }
}

/// `H:MM:SS` above an hour, `M:SS` below; hours are never zero-padded.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn install_stub(dir: &Path, script: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn search_hit(id: &str, title: &str) -> String {
        format!(
            r#"{{"id":"{id}","title":"{title}","duration":212,"channel":"Chan","view_count":5,"thumbnails":[{{"url":"https://i.ytimg.com/{id}.jpg"}}]}}"#
        )
    }

    #[test]
    fn format_duration_matches_expected_rendering() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(59), "0:59");
        assert_eq!(format_duration(60), "1:00");
        assert_eq!(format_duration(3661), "1:01:01");
    }

    #[test]
    fn search_args_embed_sanitized_query_and_limit() {
        let ytdlp = YtDlp::new("yt-dlp", "/nonexistent/cookies.txt");
        let args = ytdlp.search_args("shape of you", 5);
        assert_eq!(
            args,
            vec![
                "--dump-json",
                "--flat-playlist",
                "--no-playlist",
                "ytsearch5:shape of you",
            ]
        );
    }

    #[test]
    fn cookies_argument_appears_only_when_file_exists() {
        let dir = tempdir().unwrap();
        let cookies = dir.path().join("cookies.txt");
        fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();

        let ytdlp = YtDlp::new("yt-dlp", &cookies);
        let args = ytdlp.info_args("https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(args[0], "--cookies");
        assert_eq!(args[1], cookies.to_string_lossy());

        let without = YtDlp::new("yt-dlp", dir.path().join("missing.txt"));
        let args = without.info_args("https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(args[0], "--dump-json");
    }

    #[test]
    fn download_args_request_mp3_at_192k() {
        let ytdlp = YtDlp::new("yt-dlp", "/nonexistent/cookies.txt");
        let args = ytdlp.download_args(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            Path::new("/tmp/dQw4w9WgXcQ.mp3"),
        );
        assert_eq!(
            args,
            vec![
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "-o",
                "/tmp/dQw4w9WgXcQ.mp3",
                "--no-playlist",
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            ]
        );
    }

    #[test]
    fn parse_search_lines_skips_malformed_entries() {
        let lines = vec![
            search_hit("aaaaaaaaaaa", "First"),
            "this is not json".to_string(),
            search_hit("bbbbbbbbbbb", "Second"),
            r#"{"title":"no id here"}"#.to_string(),
            search_hit("ccccccccccc", "Third"),
        ];
        let results = parse_search_lines(&lines);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "aaaaaaaaaaa");
        assert_eq!(results[1].id, "bbbbbbbbbbb");
        assert_eq!(results[2].id, "ccccccccccc");
        assert_eq!(results[0].duration_string, "3:32");
        assert_eq!(
            results[0].url,
            "https://www.youtube.com/watch?v=aaaaaaaaaaa"
        );
        assert_eq!(
            results[0].thumbnail.as_deref(),
            Some("https://i.ytimg.com/aaaaaaaaaaa.jpg")
        );
    }

    #[test]
    fn parse_search_lines_tolerates_empty_output() {
        assert!(parse_search_lines(&[]).is_empty());
        assert!(parse_search_lines(&["WARNING: throttled".to_string()]).is_empty());
    }

    #[test]
    fn select_info_line_skips_warnings_and_blanks() {
        let lines = vec![
            String::new(),
            "WARNING: unavailable fragments".to_string(),
            r#"{"id":"dQw4w9WgXcQ"}"#.to_string(),
        ];
        assert_eq!(
            select_info_line(&lines),
            Some(r#"{"id":"dQw4w9WgXcQ"}"#)
        );
    }

    #[test]
    fn select_info_line_falls_back_to_last_line() {
        let lines = vec![
            "[youtube] extracting".to_string(),
            "  tail with payload {\"id\":\"x\"}".to_string(),
        ];
        assert_eq!(
            select_info_line(&lines),
            Some("  tail with payload {\"id\":\"x\"}")
        );

        let no_json = vec!["[youtube] extracting".to_string(), "plain noise".to_string()];
        assert_eq!(select_info_line(&no_json), None);
    }

    #[test]
    fn empty_query_is_rejected_before_spawning() {
        let ytdlp = YtDlp::new("/definitely/not/a/binary", "/no/cookies");
        let err = ytdlp.search("   ", 10).unwrap_err();
        assert!(matches!(err, FetchError::EmptyQuery));
    }

    #[cfg(unix)]
    #[test]
    fn search_runs_stub_and_parses_lines() {
        let dir = tempdir().unwrap();
        let script = format!(
            "#!/usr/bin/env bash\necho '{}'\necho 'not json'\necho '{}'\n",
            search_hit("aaaaaaaaaaa", "First"),
            search_hit("bbbbbbbbbbb", "Second"),
        );
        let stub = install_stub(dir.path(), &script);

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let results = ytdlp.search("anything", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].title, "Second");
    }

    #[cfg(unix)]
    #[test]
    fn search_failure_carries_captured_output() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "#!/usr/bin/env bash\necho 'ERROR: no internet' >&2\nexit 1\n",
        );

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let err = ytdlp.search("anything", 10).unwrap_err();
        match err {
            FetchError::SearchFailed { details } => {
                assert!(details.contains("no internet"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn fetch_info_parses_stub_payload() {
        let dir = tempdir().unwrap();
        let payload = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna","description":"classic","duration":212,"thumbnail":"https://i.ytimg.com/t.jpg","channel":"Rick","channel_url":"https://youtube.com/@rick","view_count":1000,"upload_date":"20091025"}"#;
        let script = format!(
            "#!/usr/bin/env bash\necho 'WARNING: slow connection' >&2\necho '{payload}'\n"
        );
        let stub = install_stub(dir.path(), &script);

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let info = ytdlp
            .fetch_info("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .unwrap();
        assert_eq!(info.id.as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(info.title, "Never Gonna");
        assert_eq!(info.duration_string, "3:32");
        assert_eq!(info.upload_date.as_deref(), Some("20091025"));
        assert_eq!(info.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[cfg(unix)]
    #[test]
    fn fetch_info_reports_parse_failure_with_excerpt() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "#!/usr/bin/env bash\necho '{broken json that goes on'\n",
        );

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let err = ytdlp
            .fetch_info("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .unwrap_err();
        match err {
            FetchError::InfoUnparseable { details } => {
                assert!(details.starts_with("Output: {broken json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn download_success_requires_only_the_file() {
        let dir = tempdir().unwrap();
        // Nonzero exit with the file present still counts as success.
        let stub = install_stub(
            dir.path(),
            "#!/usr/bin/env bash\nwhile [[ $# -gt 0 ]]; do\n  if [[ \"$1\" == \"-o\" ]]; then shift; echo mp3 > \"$1\"; fi\n  shift\ndone\nexit 1\n",
        );

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let dest = dir.path().join("dQw4w9WgXcQ.mp3");
        ytdlp
            .download_audio("https://www.youtube.com/watch?v=dQw4w9WgXcQ", &dest)
            .unwrap();
        assert!(dest.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn download_without_file_reports_last_lines() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "#!/usr/bin/env bash\necho one\necho two\necho three\necho four\nexit 0\n",
        );

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let dest = dir.path().join("missing.mp3");
        let err = ytdlp
            .download_audio("https://www.youtube.com/watch?v=dQw4w9WgXcQ", &dest)
            .unwrap_err();
        match err {
            FetchError::DownloadFailed { details } => {
                assert_eq!(details, "two\nthree\nfour");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolve_bare_id_never_spawns() {
        // Program path does not exist; resolution must not need it.
        let ytdlp = YtDlp::new("/definitely/not/a/binary", "/no/cookies");
        let resolved = ytdlp.resolve("dQw4w9WgXcQ").unwrap();
        assert_eq!(resolved.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(resolved.video_id.as_deref(), Some("dQw4w9WgXcQ"));
    }

    #[test]
    fn resolve_url_extracts_id() {
        let ytdlp = YtDlp::new("/definitely/not/a/binary", "/no/cookies");
        let resolved = ytdlp.resolve("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(resolved.url, "https://youtu.be/dQw4w9WgXcQ");
        assert_eq!(resolved.video_id.as_deref(), Some("dQw4w9WgXcQ"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_free_text_uses_first_search_hit() {
        let dir = tempdir().unwrap();
        let script = format!(
            "#!/usr/bin/env bash\necho '{}'\n",
            search_hit("aaaaaaaaaaa", "First")
        );
        let stub = install_stub(dir.path(), &script);

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let resolved = ytdlp.resolve("some song name").unwrap();
        assert_eq!(resolved.video_id.as_deref(), Some("aaaaaaaaaaa"));
        assert_eq!(
            resolved.url,
            "https://www.youtube.com/watch?v=aaaaaaaaaaa"
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolve_free_text_with_no_hits_is_not_found() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "#!/usr/bin/env bash\nexit 0\n");

        let ytdlp = YtDlp::new(&stub, dir.path().join("cookies.txt"));
        let err = ytdlp.resolve("no such song anywhere").unwrap_err();
        assert!(matches!(err, FetchError::SongNotFound));
        assert!(err.to_string().contains("Song not found"));
    }
}
