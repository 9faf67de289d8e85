//! Wire-format helpers shared by the server and client: header names,
//! mode/CSV encoding, and the error-to-status mapping.

use flocons_core::types::{DataSource, FileMode, DEFAULT_FILE_MIME_TYPE, DIRECTORY_MIME_TYPE};
use flocons_core::{FileInfo, StorageError};
use std::time::{Duration, UNIX_EPOCH};

pub const FILES_PREFIX: &str = "/files";
pub const TRAVERSED_NODE_PARAMETER: &str = "traversed-node";

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_CONTENT_MODE: &str = "X-Content-Mode";
pub const HEADER_LAST_MODIFIED: &str = "Last-Modified";
pub const HEADER_LOCATION: &str = "Location";

/// Maps the shared error taxonomy to an HTTP status, per the taxonomy in
/// the storage engine's error type - this supersedes the narrower mapping
/// the original server used (which only distinguished not-exist,
/// permission, and conflict).
pub fn error_to_status(err: &StorageError) -> u16 {
    match err {
        StorageError::NotFound(_) => 404,
        StorageError::Permission(_) => 403,
        StorageError::IsDir(_) | StorageError::IsNotDir(_) | StorageError::AlreadyExists(_) => 409,
        StorageError::Transport { status, .. } => *status,
        StorageError::Internal(_) | StorageError::ConfigInvalid(_) => 500,
    }
}

/// Decode a client-sent mode: the permission bits come from the
/// `X-Content-Mode` header (octal), the directory flag from whether
/// `Content-Type` names the directory MIME type.
pub fn header_to_file_mode(content_type: Option<&str>, content_mode: Option<&str>) -> FileMode {
    let mime_type = content_type.unwrap_or(DEFAULT_FILE_MIME_TYPE);
    let is_dir = mime_type == DIRECTORY_MIME_TYPE;

    let bits = content_mode
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .unwrap_or(if is_dir { 0o755 } else { 0o644 });

    FileMode::from_bits(bits, is_dir)
}

/// The header set describing `fi`, as `(name, value)` pairs ready to
/// attach to a response or outgoing request.
pub fn file_info_to_headers(fi: &FileInfo) -> Vec<(String, String)> {
    let mut headers = vec![
        (HEADER_CONTENT_MODE.to_string(), format!("{:o}", fi.mode().permission_bits())),
        (HEADER_LAST_MODIFIED.to_string(), httpdate::fmt_http_date(fi.mod_time())),
    ];
    if fi.is_dir() {
        headers.push((HEADER_CONTENT_TYPE.to_string(), DIRECTORY_MIME_TYPE.to_string()));
        headers.push((HEADER_CONTENT_LENGTH.to_string(), "0".to_string()));
    } else {
        let content_type = mime_guess::from_path(fi.name())
            .first_raw()
            .unwrap_or(DEFAULT_FILE_MIME_TYPE);
        headers.push((HEADER_CONTENT_TYPE.to_string(), content_type.to_string()));
        headers.push((HEADER_CONTENT_LENGTH.to_string(), fi.size().to_string()));
    }
    headers
}

/// Reconstruct a minimal `FileInfo` (no data source attached) from a
/// response's headers, given the basename of the requested path.
pub fn headers_to_file_info(
    name: &str,
    content_type: Option<&str>,
    content_mode: Option<&str>,
    content_length: Option<&str>,
    last_modified: Option<&str>,
) -> FileInfo {
    let mode = header_to_file_mode(content_type, content_mode);
    let size = content_length.and_then(|v| v.parse().ok()).unwrap_or(0);
    let mod_time = last_modified
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .unwrap_or(UNIX_EPOCH);
    FileInfo::new(name, mode, size, mod_time, DataSource::default())
}

/// Directory listing body: five fields per row, no header, per the wire
/// format `{type, name, mode_octal, size, mtime_unix}`.
pub fn files_info_to_csv(files: &[FileInfo]) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for fi in files {
        let type_identifier = if fi.is_dir() { "d" } else { "-" };
        let mtime = fi
            .mod_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        writer
            .write_record(&[
                type_identifier.to_string(),
                fi.name().to_string(),
                format!("{:o}", fi.mode().permission_bits()),
                fi.size().to_string(),
                mtime.to_string(),
            ])
            .map_err(|e| StorageError::internal(format!("could not encode directory listing: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| StorageError::internal(format!("could not flush directory listing: {e}")))
}

pub fn csv_to_files_info(data: &[u8]) -> Result<Vec<FileInfo>, StorageError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(false).from_reader(data);
    let mut out = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| StorageError::internal(format!("malformed directory listing row: {e}")))?;
        if record.len() != 5 {
            return Err(StorageError::internal("directory listing row has wrong field count"));
        }
        let is_dir = &record[0] == "d";
        let name = record[1].to_string();
        let mode_bits = u32::from_str_radix(&record[2], 8)
            .map_err(|e| StorageError::internal(format!("bad mode field: {e}")))?;
        let size: i64 = record[3]
            .parse()
            .map_err(|e| StorageError::internal(format!("bad size field: {e}")))?;
        let mtime: u64 = record[4]
            .parse()
            .map_err(|e| StorageError::internal(format!("bad mtime field: {e}")))?;
        out.push(FileInfo::new(
            name,
            FileMode::from_bits(mode_bits, is_dir),
            size,
            UNIX_EPOCH + Duration::from_secs(mtime),
            DataSource::default(),
        ));
    }
    Ok(out)
}

/// Join `FILES_PREFIX` and a storage-relative path into a request path.
pub fn path_to_url_path(p: &str) -> String {
    let trimmed = p.trim_start_matches('/');
    if trimmed.is_empty() {
        FILES_PREFIX.to_string()
    } else {
        format!("{FILES_PREFIX}/{trimmed}")
    }
}

/// Strip the `/files` prefix off a request path, yielding the
/// storage-relative path the engine expects.
pub fn url_path_to_path(request_path: &str) -> String {
    request_path.strip_prefix(FILES_PREFIX).unwrap_or(request_path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn mode_round_trips_through_headers() {
        let fi = FileInfo::new(
            "a.txt",
            FileMode::from_bits(0o644, false),
            4,
            SystemTime::now(),
            DataSource::default(),
        );
        let headers = file_info_to_headers(&fi);
        let get = |k: &str| headers.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get(HEADER_CONTENT_MODE), Some("644"));
        assert_eq!(get(HEADER_CONTENT_LENGTH), Some("4"));

        let mode = header_to_file_mode(get(HEADER_CONTENT_TYPE), get(HEADER_CONTENT_MODE));
        assert_eq!(mode.permission_bits(), 0o644);
        assert!(!mode.is_dir());
    }

    #[test]
    fn directory_mode_sets_dir_bit_and_zero_length() {
        let fi = FileInfo::new(
            "sub",
            FileMode::from_bits(0o755, true),
            0,
            SystemTime::now(),
            DataSource::default(),
        );
        let headers = file_info_to_headers(&fi);
        let get = |k: &str| headers.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get(HEADER_CONTENT_TYPE), Some(DIRECTORY_MIME_TYPE));
        assert_eq!(get(HEADER_CONTENT_LENGTH), Some("0"));
    }

    #[test]
    fn csv_round_trips_directory_listing() {
        let files = vec![
            FileInfo::new("sub", FileMode::from_bits(0o755, true), 0, UNIX_EPOCH, DataSource::default()),
            FileInfo::new("a.txt", FileMode::from_bits(0o644, false), 3, UNIX_EPOCH, DataSource::default()),
        ];
        let csv = files_info_to_csv(&files).unwrap();
        let decoded = csv_to_files_info(&csv).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_dir());
        assert_eq!(decoded[1].name(), "a.txt");
        assert_eq!(decoded[1].size(), 3);
    }

    #[test]
    fn path_helpers_add_and_strip_prefix() {
        assert_eq!(path_to_url_path("a/b.txt"), "/files/a/b.txt");
        assert_eq!(url_path_to_path("/files/a/b.txt"), "/a/b.txt");
    }
}
