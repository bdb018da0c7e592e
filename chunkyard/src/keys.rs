use chrono::{DateTime, Datelike, Utc};

use crate::SessionId;

/// Strategy for deriving the durable object key of an upload
pub trait ObjectKeyStrategy: Send + Sync {
    /// Generate the object key for a session
    fn object_key(&self, session_id: &SessionId, filename: &str, started_at: DateTime<Utc>) -> String;
}

/// Default key strategy: uploads/year/month/session_id/filename
///
/// The session id keeps keys unique even when identically named files are
/// uploaded within the same instant.
#[derive(Debug, Clone)]
pub struct DefaultKeyStrategy;

impl ObjectKeyStrategy for DefaultKeyStrategy {
    fn object_key(&self, session_id: &SessionId, filename: &str, started_at: DateTime<Utc>) -> String {
        format!(
            "uploads/{:04}/{:02}/{}/{}",
            started_at.year(),
            started_at.month(),
            session_id,
            sanitize_filename(filename)
        )
    }
}

/// Reduce a client-supplied filename to a safe single key segment.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_embeds_session_and_date() {
        let id = SessionId::from("upl_abc");
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        let key = DefaultKeyStrategy.object_key(&id, "lecture.mp4", at);
        assert_eq!(key, "uploads/2026/03/upl_abc/lecture.mp4");
    }

    #[test]
    fn same_filename_different_sessions_never_collide() {
        let at = Utc::now();
        let a = DefaultKeyStrategy.object_key(&SessionId::new(), "lecture.mp4", at);
        let b = DefaultKeyStrategy.object_key(&SessionId::new(), "lecture.mp4", at);
        assert_ne!(a, b);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\videos\\week 1.mp4"), "week_1.mp4");
        assert_eq!(sanitize_filename("..."), "upload.bin");
        assert_eq!(sanitize_filename(""), "upload.bin");
    }
}
