/// How a command is handed to the OS privilege mechanism.
///
/// Every strategy launches without stream redirection: the elevated child
/// either gets its own console (Windows) or talks to a graphical/polkit
/// agent. The caller only learns that the wrapper exited.
#[derive(Debug, Clone, PartialEq)]
pub enum ElevationStrategy {
    /// Windows UAC prompt via `Start-Process -Verb RunAs -Wait`.
    RunAs,
    /// `program args... <target> <target args...>` (pkexec, sudo, doas...)
    Prefix { program: String, args: Vec<String> },
}

impl ElevationStrategy {
    /// UAC on Windows, pkexec on Linux, sudo on other Unix systems.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::RunAs
        } else if cfg!(target_os = "linux") {
            Self::Prefix {
                program: "pkexec".to_string(),
                args: Vec::new(),
            }
        } else {
            Self::Prefix {
                program: "sudo".to_string(),
                args: Vec::new(),
            }
        }
    }

    /// Wraps `program args` into the invocation that elevates it.
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        match self {
            Self::RunAs => {
                let mut script = format!("$p = Start-Process -FilePath {}", ps_quote(program));
                if !args.is_empty() {
                    let list = args.iter().map(|a| ps_quote(a)).collect::<Vec<_>>().join(",");
                    script.push_str(&format!(" -ArgumentList {list}"));
                }
                script.push_str(&format!(
                    " -Verb RunAs -Wait -PassThru; if (-not $p) {{ exit {UAC_CANCELLED} }}; exit $p.ExitCode"
                ));
                (
                    "powershell.exe".to_string(),
                    vec![
                        "-NoProfile".to_string(),
                        "-NonInteractive".to_string(),
                        "-Command".to_string(),
                        script,
                    ],
                )
            }
            Self::Prefix {
                program: elevator,
                args: elevator_args,
            } => {
                let mut full = elevator_args.clone();
                full.push(program.to_string());
                full.extend(args.iter().cloned());
                (elevator.clone(), full)
            }
        }
    }

    /// Whether the wrapper's exit code means the privilege prompt was
    /// declined or the elevator itself failed, rather than the target exiting.
    pub fn refused(&self, code: Option<i32>) -> bool {
        match (self, code) {
            (Self::RunAs, Some(code)) => code == UAC_CANCELLED,
            // pkexec exits 126 when the dialog is dismissed and 127 when not authorized
            (Self::Prefix { .. }, Some(code)) => code == 126 || code == 127,
            (_, None) => false,
        }
    }
}

/// ERROR_CANCELLED, which the RunAs wrapper exits with when UAC is declined.
const UAC_CANCELLED: i32 = 1223;

/// PowerShell single-quoted literal: embedded quotes are doubled.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
