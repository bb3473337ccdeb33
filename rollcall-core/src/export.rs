//! Attendance spreadsheet download.

use tracing::{info, warn};

use crate::error::{Result, RollcallError};
use crate::gateway::{AttendanceGateway, ClassroomId};

/// Characters that are not allowed in the saved file name.
const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

const FALLBACK_NAME: &str = "attendance";

/// Downloaded spreadsheet, ready to be written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Strip characters file systems reject, collapse whitespace and trim.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !FORBIDDEN.contains(c)).collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        collapsed
    }
}

/// File name for a classroom export: `<name>.xls`, defaulting to
/// `attendance_<classroom>`.
pub fn export_filename(classroom: ClassroomId, name: Option<&str>) -> String {
    let base = match name {
        Some(name) => sanitize_filename(name),
        None => sanitize_filename(&format!("attendance_{classroom}")),
    };
    format!("{base}.xls")
}

/// Fetch a classroom's attendance export.
///
/// A JSON body is always an error payload, even on a 2xx status.
pub async fn download_attendance(
    gateway: &dyn AttendanceGateway,
    classroom: ClassroomId,
    name: Option<&str>,
) -> Result<ExportFile> {
    let payload = gateway.download_export(classroom).await?;

    let is_json = payload
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    if is_json {
        let error = serde_json::from_slice::<serde_json::Value>(&payload.bytes)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));
        warn!(classroom = %classroom, "Export endpoint returned an error payload");
        return Err(RollcallError::Status { status: 200, error });
    }

    let filename = export_filename(classroom, name);
    info!(
        classroom = %classroom,
        bytes = payload.bytes.len(),
        filename = %filename,
        "Attendance export downloaded"
    );
    Ok(ExportFile {
        filename,
        bytes: payload.bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;
    use crate::gateway::MockGateway;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("  Math: 7/A  "), "Math 7A");
        assert_eq!(sanitize_filename("a  \t b"), "a b");
        assert_eq!(sanitize_filename("<>:\"|?*"), "attendance");
        assert_eq!(sanitize_filename(""), "attendance");
    }

    #[test]
    fn test_export_filename_defaults() {
        assert_eq!(export_filename(ClassroomId(7), None), "attendance_7.xls");
        assert_eq!(export_filename(ClassroomId(7), Some("Physics 101")), "Physics 101.xls");
        assert_eq!(export_filename(ClassroomId(7), Some("???")), "attendance.xls");
    }

    #[tokio::test]
    async fn test_download_without_sessions_fails() {
        let gateway = MockGateway::default();
        let err = download_attendance(&gateway, ClassroomId(3), None).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            err.user_message(Operation::DownloadExport),
            "No attendance sessions found for this classroom."
        );
    }

    #[tokio::test]
    async fn test_download_after_session() {
        let gateway = MockGateway::default();
        gateway.start_session(ClassroomId(3)).await.unwrap();

        let file = download_attendance(&gateway, ClassroomId(3), Some("Chem"))
            .await
            .unwrap();
        assert_eq!(file.filename, "Chem.xls");
        assert!(!file.bytes.is_empty());
    }
}
