//! Fire-and-wait application launches and default-handler URL opening.
//!
//! Launched applications are not assumed to be console tools, so their
//! streams are never captured, even when running unelevated.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use super::{ExecError, ProcessEngine};

/// URL schemes handed to the OS default handler.
const ALLOWED_URL_SCHEMES: &[&str] = &["http", "https", "mailto", "ftp", "file"];

impl ProcessEngine {
    /// Launches `path` with `arguments` (split with shell-words rules) and
    /// waits for it to exit. Returns the exit code when the OS reports one.
    pub async fn launch_application(
        &self,
        path: &str,
        arguments: &str,
        elevate: bool,
    ) -> Result<Option<i32>, ExecError> {
        let args = shlex::split(arguments).ok_or_else(|| {
            ExecError::InvalidArguments(format!("unbalanced quotes in '{arguments}'"))
        })?;

        let (program, args) = shell_launch(path, &args);
        let (program, args) = if elevate {
            self.elevation().wrap(&program, &args)
        } else {
            (program, args)
        };

        debug!("Launching {program} {args:?}");
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let status = child.wait().await.map_err(|source| ExecError::Wait {
            program: program.clone(),
            source,
        })?;

        if elevate && self.elevation().refused(status.code()) {
            return Err(ExecError::ElevationRefused {
                program: path.to_string(),
                code: status.code().unwrap_or_default(),
            });
        }

        info!(
            exit_code = ?status.code(),
            "Executed application: {path} with arguments: {arguments}"
        );
        Ok(status.code())
    }

    /// Validates `url` and hands it to the OS default handler.
    ///
    /// Returns once the handler has been started; the browser (or mail
    /// client) lifetime is not tracked.
    pub async fn open_url(&self, url: &str) -> Result<(), ExecError> {
        let parsed = validate_url(url)?;
        let target = parsed.to_string();

        tokio::task::spawn_blocking(move || webbrowser::open(&target))
            .await
            .map_err(|e| ExecError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| ExecError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        info!("Opened URL: {url}");
        Ok(())
    }
}

/// Builds the shell-style launch of `path`.
///
/// On Windows everything goes through `start`, which resolves documents,
/// folders and bare program names. Elsewhere executables and names found on
/// `PATH` are spawned directly, and an existing file without an execute bit
/// (or a folder) is handed to the desktop opener (`open` on macOS,
/// `xdg-open` otherwise). The opener may return before the document's
/// application exits.
fn shell_launch(path: &str, args: &[String]) -> (String, Vec<String>) {
    if cfg!(windows) {
        let mut full = vec![
            "/C".to_string(),
            "start".to_string(),
            String::new(),
            "/WAIT".to_string(),
            path.to_string(),
        ];
        full.extend(args.iter().cloned());
        ("cmd.exe".to_string(), full)
    } else if is_document(Path::new(path)) {
        let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        let mut full = vec![path.to_string()];
        full.extend(args.iter().cloned());
        (opener.to_string(), full)
    } else {
        (path.to_string(), args.to_vec())
    }
}

#[cfg(unix)]
fn is_document(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => true,
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 == 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_document(_path: &Path) -> bool {
    false
}

pub(crate) fn validate_url(url: &str) -> Result<url::Url, ExecError> {
    let parsed = url::Url::parse(url.trim()).map_err(|e| ExecError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !ALLOWED_URL_SCHEMES.contains(&parsed.scheme()) {
        return Err(ExecError::InvalidUrl {
            url: url.to_string(),
            reason: format!("scheme '{}' is not allowed", parsed.scheme()),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_accepts_http() {
        assert_eq!(
            validate_url("https://example.com/docs").unwrap().host_str(),
            Some("example.com")
        );
        assert!(validate_url("mailto:team@example.com").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_garbage() {
        assert!(matches!(
            validate_url("not a url"),
            Err(ExecError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_validate_url_rejects_script_schemes() {
        let err = validate_url("javascript:alert(1)").unwrap_err();
        assert!(err.to_string().contains("javascript"));
    }

    #[tokio::test]
    async fn test_open_url_invalid_never_launches() {
        let engine = ProcessEngine::default();
        assert!(engine.open_url("::::").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_application_waits_for_exit() {
        let engine = ProcessEngine::default();
        let code = engine
            .launch_application("/bin/sh", "-c 'exit 4'", false)
            .await
            .unwrap();
        assert_eq!(code, Some(4));
    }

    #[tokio::test]
    async fn test_launch_application_missing_binary() {
        let engine = ProcessEngine::default();
        let err = engine
            .launch_application("/nonexistent/toolbar-kit-app", "", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_launch_application_unbalanced_quotes() {
        let engine = ProcessEngine::default();
        let err = engine
            .launch_application("/bin/true", "\"open", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidArguments(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_application_elevated_uses_strategy() {
        let engine = ProcessEngine::new(
            super::super::ElevationStrategy::Prefix {
                program: "env".to_string(),
                args: vec![],
            },
            std::time::Duration::from_secs(5),
        );
        let code = engine
            .launch_application("/bin/sh", "-c 'exit 0'", true)
            .await
            .unwrap();
        assert_eq!(code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_application_elevation_refused() {
        let engine = ProcessEngine::new(
            super::super::ElevationStrategy::Prefix {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 126".to_string()],
            },
            std::time::Duration::from_secs(5),
        );
        let err = engine
            .launch_application("/bin/true", "", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ElevationRefused { code: 126, .. }));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn test_shell_launch_opens_documents_with_default_handler() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("notes.txt");
        std::fs::write(&doc, "hello").unwrap();
        let doc = doc.display().to_string();

        let (program, args) = shell_launch(&doc, &[]);
        assert_eq!(program, "xdg-open");
        assert_eq!(args, vec![doc]);

        let folder = dir.path().display().to_string();
        assert_eq!(shell_launch(&folder, &[]).0, "xdg-open");
        assert_eq!(shell_launch("/bin/sh", &[]).0, "/bin/sh");
        assert_eq!(shell_launch("gedit", &[]).0, "gedit");
    }

    #[test]
    fn test_shell_launch_passes_args_through() {
        let (program, args) = shell_launch("/usr/bin/gedit", &["a.txt".to_string()]);
        if cfg!(windows) {
            assert_eq!(program, "cmd.exe");
            assert_eq!(args.last().unwrap(), "a.txt");
        } else {
            assert_eq!(program, "/usr/bin/gedit");
            assert_eq!(args, vec!["a.txt"]);
        }
    }
}
