use crate::error::{Result, TransferError};
use crate::transfer::constants::{MAX_FILENAME_LENGTH, MAX_FILE_SIZE};
use std::path::{Component, Path, PathBuf};

/// Validate file info against security limits (size and name length)
pub fn validate_transfer_info(file_name: &str, file_size: u64) -> Result<()> {
    if file_size > MAX_FILE_SIZE {
        return Err(TransferError::Rejected(format!(
            "File rejected: {} ({} GB) exceeds maximum allowed size of {} GB",
            file_name,
            file_size / (1024 * 1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024 * 1024)
        )));
    }

    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::Rejected(format!(
            "File rejected: Filename too long ({} chars, max {})",
            file_name.len(),
            MAX_FILENAME_LENGTH
        )));
    }
    Ok(())
}

/// Open the destination for writing.
///
/// `offset == 0` truncate-creates the file (0o600 on Unix). A non-zero offset
/// keeps the first `offset` bytes, drops anything past them, and positions
/// writes at the end.
pub fn open_destination(path: &Path, offset: u64) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);

    if offset > 0 {
        let file = options.open(path)?;
        file.set_len(offset)?;
        drop(file);
        return std::fs::OpenOptions::new().append(true).open(path);
    }

    options.create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Sanitize file name to prevent path traversal attacks and ensure safety
pub fn sanitize_file_name(file_name: &str) -> String {
    // Last component only, splitting on both separators
    let file_name = file_name
        .split(|c| c == '/' || c == '\\')
        .last()
        .unwrap_or("unknown_file");

    if file_name.is_empty() {
        return "unknown_file".to_string();
    }

    let mut clean_name: String = file_name
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();

    // See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        clean_name = truncate_keeping_extension(&clean_name);
    }

    clean_name
}

fn truncate_at_char_boundary(value: &mut String, max: usize) {
    let mut cutoff = max;
    while !value.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    value.truncate(cutoff);
}

fn truncate_keeping_extension(name: &str) -> String {
    if let Some(idx) = name.rfind('.') {
        let ext_len = name.len() - idx;
        if ext_len < 20 && ext_len < MAX_FILENAME_LENGTH {
            let mut base = name[..idx].to_string();
            truncate_at_char_boundary(&mut base, MAX_FILENAME_LENGTH - ext_len);
            base.push_str(&name[idx..]);
            return base;
        }
    }
    let mut clean = name.to_string();
    truncate_at_char_boundary(&mut clean, MAX_FILENAME_LENGTH);
    clean
}

/// Turn a sender-supplied relative directory into a path that stays under
/// the downloads root. `None` means the path tries to escape it.
pub fn sanitize_relative_path(relative: &str) -> Option<PathBuf> {
    let normalized = relative.replace('\\', "/");
    let mut clean = PathBuf::new();
    for part in normalized.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        let component = Path::new(part).components().next();
        match component {
            Some(Component::Normal(_)) if part.chars().all(|c| !c.is_control()) => {
                clean.push(part)
            }
            _ => return None,
        }
    }
    Some(clean)
}

/// Relative directory of `file` inside the tree rooted at `root`, prefixed
/// with the root's own name, using `/` separators.
pub fn relative_dir_for(root: &Path, file: &Path) -> String {
    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut parts = vec![root_name];
    if let Some(parent) = file.parent().and_then(|p| p.strip_prefix(root).ok()) {
        parts.extend(
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned()),
        );
    }
    parts.retain(|p| !p.is_empty());
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_transfer_info() {
        assert!(validate_transfer_info("valid.txt", 1024).is_ok());
        assert!(validate_transfer_info("huge.txt", MAX_FILE_SIZE + 1).is_err());

        let long_name = "a".repeat(MAX_FILENAME_LENGTH + 1);
        assert!(validate_transfer_info(&long_name, 1024).is_err());
    }

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\Windows\\System32\\cmd.exe"), "cmd.exe");
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_dangerous() {
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name("."), "unknown_file");
        assert_eq!(sanitize_file_name(""), "unknown_file");
        assert_eq!(sanitize_file_name("/"), "unknown_file");
        assert_eq!(sanitize_file_name("con"), "unknown_file");
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
    }

    #[test]
    fn test_sanitize_file_name_unicode_truncate() {
        let mut long_unicode = "🦀".repeat(100);
        long_unicode.push_str(".txt");

        let sanitized = sanitize_file_name(&long_unicode);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));
        let base = sanitized.trim_end_matches(".txt");
        assert_eq!(base.chars().last(), Some('🦀'));
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(
            sanitize_relative_path("photos/2024"),
            Some(PathBuf::from("photos").join("2024"))
        );
        assert_eq!(
            sanitize_relative_path("photos\\raw\\"),
            Some(PathBuf::from("photos").join("raw"))
        );
        assert_eq!(sanitize_relative_path(""), Some(PathBuf::new()));
        assert_eq!(sanitize_relative_path("./a/./b"), Some(PathBuf::from("a").join("b")));
        assert_eq!(sanitize_relative_path("../etc"), None);
        assert_eq!(sanitize_relative_path("a/../../b"), None);
    }

    #[test]
    fn test_relative_dir_for() {
        let root = Path::new("/home/u/album");
        assert_eq!(relative_dir_for(root, Path::new("/home/u/album/a.jpg")), "album");
        assert_eq!(
            relative_dir_for(root, Path::new("/home/u/album/2024/july/b.jpg")),
            "album/2024/july"
        );
    }

    #[test]
    fn test_open_destination_truncates_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        {
            use std::io::Write;
            let mut file = open_destination(&path, 4).unwrap();
            file.write_all(b"AB").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"0123AB");

        {
            let _file = open_destination(&path, 0).unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[cfg(unix)]
    #[test]
    fn test_open_destination_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secure.bin");
        let _file = open_destination(&path, 0).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(10, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(500, 1.0), "500 B/s");
        assert_eq!(format_transfer_speed(2_000_000, 1.0), "2.00 MB/s");
    }
}
