//! User-facing text for fatal backend diagnostics.
//!
//! Windows installs fail in ways the message alone does not explain (antivirus,
//! firewall, elevation), so diagnostics there carry a troubleshooting list.

use std::path::Path;

/// Target family the diagnostic is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Which troubleshooting list applies to a failure.
#[derive(Debug, Clone, Copy)]
pub enum Hint<'a> {
    None,
    MissingExecutable,
    SpawnFailed {
        executable: &'a Path,
    },
    Crashed {
        database_path: &'a Path,
        key_file: &'a Path,
    },
}

/// Append the platform's troubleshooting list for `hint` to `message`.
pub fn render(message: &str, hint: Hint<'_>, platform: Platform) -> String {
    if platform != Platform::Windows {
        return message.to_string();
    }
    let steps: Vec<String> = match hint {
        Hint::None => return message.to_string(),
        Hint::MissingExecutable => vec![
            "Check if antivirus is blocking the executable".to_string(),
            "Ensure you have proper permissions".to_string(),
            "Try running as administrator".to_string(),
        ],
        Hint::SpawnFailed { executable } => vec![
            "Make sure no antivirus is blocking the app".to_string(),
            "Try running as administrator".to_string(),
            "Check Windows Defender settings".to_string(),
            format!(
                "Verify the backend executable exists at: {}",
                executable.display()
            ),
        ],
        Hint::Crashed {
            database_path,
            key_file,
        } => vec![
            "Check if Windows Firewall is blocking network access".to_string(),
            format!(
                "Verify SQLite database path is accessible: {}",
                database_path.display()
            ),
            format!("Verify encryption key exists at: {}", key_file.display()),
            "Run the app as administrator".to_string(),
        ],
    };

    let mut out = format!("{message}\n\nWindows troubleshooting:");
    for step in steps {
        out.push_str("\n- ");
        out.push_str(&step);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_platforms_get_the_bare_message() {
        let rendered = render(
            "backend missing",
            Hint::MissingExecutable,
            Platform::Other,
        );
        assert_eq!(rendered, "backend missing");
    }

    #[test]
    fn windows_crash_hint_names_database_and_key() {
        let rendered = render(
            "The backend server stopped unexpectedly (code: 1).",
            Hint::Crashed {
                database_path: Path::new("C:/data/securesignin.db"),
                key_file: Path::new("C:/app/keys/encryption.key"),
            },
            Platform::Windows,
        );
        assert!(rendered.starts_with("The backend server stopped unexpectedly (code: 1)."));
        assert!(rendered.contains("Windows troubleshooting:"));
        assert!(rendered.contains("C:/data/securesignin.db"));
        assert!(rendered.contains("C:/app/keys/encryption.key"));
    }

    #[test]
    fn windows_without_hint_is_unchanged() {
        assert_eq!(render("x", Hint::None, Platform::Windows), "x");
    }
}
