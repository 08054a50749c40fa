//! Shared file utility functions
//!
//! Extension checks, filename sanitization and byte formatting used by the
//! classifier, the path formatter and the placement engine.

use std::path::Path;

/// Video file extensions (lowercase, without the dot)
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "m2ts", "mpg", "mpeg",
];

/// Subtitle file extensions (lowercase, without the dot)
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt", "ass", "ssa", "sub"];

/// Lowercase extension of a path, if any
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
}

/// Check if a file is a video file based on extension
pub fn is_video_file(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Check if a file is a subtitle file based on extension
pub fn is_subtitle_file(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| SUBTITLE_EXTENSIONS.contains(&ext.as_str()))
}

/// File or directory name without a media extension.
///
/// Directory names such as `Movie.Name.2020.1080p` keep their last dotted
/// segment, only recognised video/subtitle extensions are stripped.
pub fn media_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if is_video_file(path) || is_subtitle_file(path) {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or(name)
    } else {
        name
    }
}

/// Sanitize a string for use as a path component
///
/// Strips the characters Plex-style libraries cannot hold (`<>:"/\|?*`) and
/// then lets `sanitize_filename` handle control characters, reserved names
/// and trailing dots.
pub fn sanitize_for_filename(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    sanitize_filename::sanitize(collapsed)
}

/// Format bytes into a human-readable string
///
/// # Example
/// ```
/// use shelver::services::file_utils::format_bytes;
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1073741824), "1.0 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("movie.mkv")));
        assert!(is_video_file(Path::new("MOVIE.MKV")));
        assert!(is_video_file(Path::new("/path/to/video.mp4")));
        assert!(is_video_file(Path::new("show.S01E01.1080p.ts")));
        assert!(!is_video_file(Path::new("music.mp3")));
        assert!(!is_video_file(Path::new("no_extension")));
    }

    #[test]
    fn test_is_subtitle_file() {
        assert!(is_subtitle_file(Path::new("movie.en.srt")));
        assert!(is_subtitle_file(Path::new("movie.ASS")));
        assert!(!is_subtitle_file(Path::new("movie.idx.txt")));
    }

    #[test]
    fn test_media_stem() {
        assert_eq!(media_stem(Path::new("/in/Movie.Name.2020.mkv")), "Movie.Name.2020");
        assert_eq!(
            media_stem(Path::new("/in/Movie.Name.2020.1080p")),
            "Movie.Name.2020.1080p"
        );
    }

    #[test]
    fn test_sanitize_for_filename() {
        assert_eq!(sanitize_for_filename("Mission: Impossible"), "Mission Impossible");
        assert_eq!(sanitize_for_filename("AC/DC Live"), "ACDC Live");
        assert_eq!(sanitize_for_filename("What If...?"), "What If...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1099511627776), "1.0 TB");
    }
}
