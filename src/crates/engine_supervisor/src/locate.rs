use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};

/// Resolve the external engine binary.
///
/// Order: configured override, `<exe dir>/core/<name>`, `<exe dir>/<name>`, then `PATH`.
pub fn locate_engine(config: &SupervisorConfig) -> SupervisorResult<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let file_name = executable_name(&config.engine_name);

    if let Some(configured) = &config.engine_binary {
        let candidate = resolve_against(exe_dir.as_deref(), configured);
        if candidate.is_file() {
            return Ok(candidate);
        }
        debug!(path = %candidate.display(), "configured engine binary not found");
    }

    if let Some(dir) = &exe_dir {
        for candidate in [dir.join("core").join(&file_name), dir.join(&file_name)] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    search_path(&file_name).ok_or_else(|| {
        SupervisorError::unavailable(format!("{} executable not found", config.engine_name))
    })
}

/// Run `<binary> version` and scrape the version token from its output.
pub fn engine_version(binary: &Path) -> Option<String> {
    let output = Command::new(binary).arg("version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_version(&text)
}

/// First token following the word `version`, case-insensitively.
pub fn parse_version(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("version") {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn resolve_against(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn search_path(file_name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}
