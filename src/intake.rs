/// Upload intake: turns an incoming file into a validated `ScriptUpload`
use crate::config::types::{FileKind, Result, ScriptUpload, ScriptboxError};
use std::io::Read;
use std::path::Path;

/// Reduce a client-supplied filename to a safe base name.
///
/// Path components are dropped, whitespace becomes `_`, anything outside
/// `[A-Za-z0-9._-]` is removed, and leading dots/underscores are stripped.
pub fn secure_filename(raw: &str) -> String {
    let base = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    cleaned.trim_start_matches(['.', '_']).to_string()
}

fn kind_for(filename: &str) -> Result<FileKind> {
    let (_, extension) = filename.rsplit_once('.').ok_or_else(|| {
        ScriptboxError::InvalidUpload(format!("{filename}: missing file extension"))
    })?;
    FileKind::from_extension(extension).ok_or_else(|| {
        ScriptboxError::InvalidUpload(format!(
            "{filename}: only .py or .sql files are accepted"
        ))
    })
}

/// Validate raw upload bytes
pub fn accept_bytes(
    user_id: &str,
    filename: &str,
    content: Vec<u8>,
    max_upload_bytes: u64,
) -> Result<ScriptUpload> {
    if user_id.trim().is_empty() {
        return Err(ScriptboxError::InvalidUpload(
            "user identifier is empty".to_string(),
        ));
    }

    let safe_name = secure_filename(filename);
    if safe_name.is_empty() {
        return Err(ScriptboxError::InvalidUpload(format!(
            "filename {filename:?} has no usable characters"
        )));
    }
    let kind = kind_for(&safe_name)?;

    if content.len() as u64 > max_upload_bytes {
        return Err(ScriptboxError::InvalidUpload(format!(
            "{safe_name}: {} bytes exceeds the {} byte upload limit",
            content.len(),
            max_upload_bytes
        )));
    }

    log::debug!(
        "Accepted upload {} ({}, {} bytes) for user {}",
        safe_name,
        kind,
        content.len(),
        user_id
    );
    Ok(ScriptUpload::new(user_id, safe_name, kind, content))
}

/// Read and validate an upload from disk without reading past the size cap
pub fn accept_file(user_id: &str, path: &Path, max_upload_bytes: u64) -> Result<ScriptUpload> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ScriptboxError::InvalidUpload(format!("{} is not a file path", path.display()))
        })?;

    // Check the extension before touching the file contents.
    kind_for(&secure_filename(&filename))?;

    let file = std::fs::File::open(path)?;
    let mut content = Vec::new();
    file.take(max_upload_bytes.saturating_add(1))
        .read_to_end(&mut content)?;

    accept_bytes(user_id, &filename, content, max_upload_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_filename_strips_paths_and_specials() {
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("C:\\Users\\me\\job.sql"), "job.sql");
        assert_eq!(secure_filename("my report (1).py"), "my_report_1.py");
        assert_eq!(secure_filename("..hidden.py"), "hidden.py");
        assert_eq!(secure_filename("$$$"), "");
    }

    #[test]
    fn rejects_unsupported_extension() {
        let err = accept_bytes("u1", "run.sh", b"ls".to_vec(), 1024).unwrap_err();
        assert!(matches!(err, ScriptboxError::InvalidUpload(_)));
    }

    #[test]
    fn rejects_missing_extension() {
        assert!(accept_bytes("u1", "Makefile", b"all:".to_vec(), 1024).is_err());
    }

    #[test]
    fn rejects_oversized_upload() {
        let err = accept_bytes("u1", "big.py", vec![b'#'; 2048], 1024).unwrap_err();
        assert!(err.to_string().contains("upload limit"));
    }

    #[test]
    fn rejects_empty_user() {
        assert!(accept_bytes("  ", "a.py", b"x = 1".to_vec(), 1024).is_err());
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let upload = accept_bytes("u1", "Query.SQL", b"SELECT 1;".to_vec(), 1024).unwrap();
        assert_eq!(upload.kind(), FileKind::Sql);
        assert_eq!(upload.filename(), "Query.SQL");
    }

    #[test]
    fn accept_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.py");
        std::fs::write(&path, b"print('hi')\n").unwrap();

        let upload = accept_file("u1", &path, 1024).unwrap();
        assert_eq!(upload.kind(), FileKind::Python);
        assert_eq!(upload.content(), b"print('hi')\n");
    }

    #[test]
    fn accept_file_caps_read_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.sql");
        std::fs::write(&path, vec![b'-'; 4096]).unwrap();

        assert!(accept_file("u1", &path, 100).is_err());
    }
}
