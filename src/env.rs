/*!
Read-only environment facts captured once at startup: base directory, app
name, platform, and whether the app was launched by the OS task scheduler.

`AppEnv::resolve` maps UI-supplied relative paths into the base directory and
refuses anything that would escape it.
*/
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::errors::BridgeError;
use crate::util::clean_relative;

/// Launch argument the task scheduler entry passes to the executable.
pub const TASK_SCHEDULER_ARG: &str = "tasksch";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEnv {
    #[serde(skip)]
    pub from_task_scheduler: bool,
    pub app_name: String,
    pub app_version: String,
    pub base_path: PathBuf,
    pub os: String,
    pub arch: String,
}

impl AppEnv {
    /// Environment rooted at `base`, for embedding and tests.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        AppEnv {
            from_task_scheduler: false,
            app_name: env!("CARGO_PKG_NAME").to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            base_path: base.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Derive the environment from the running executable and its launch arguments.
    /// `base_override` replaces the executable directory when given.
    pub fn detect<I, S>(args: I, base_override: Option<PathBuf>) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exe = std::env::current_exe()?;
        let exe_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut env = AppEnv::with_base(base_override.unwrap_or(exe_dir));
        if let Some(name) = exe.file_name().and_then(|s| s.to_str()) {
            env.app_name = name.to_string();
        }
        env.from_task_scheduler = args.into_iter().any(|a| a.as_ref() == TASK_SCHEDULER_ARG);
        Ok(env)
    }

    /// Resolve a UI path: absolute paths pass through, relative ones are joined
    /// to the base directory and must stay inside it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BridgeError> {
        let p = Path::new(path);
        if p.is_absolute() {
            return Ok(p.to_path_buf());
        }
        let escape = || BridgeError::Message(format!("Path error: {path}"));
        // `C:foo` and `\foo` are relative on Windows but would replace the base on push.
        if p
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        {
            return Err(escape());
        }
        let parts = clean_relative(path).ok_or_else(escape)?;
        let mut out = self.base_path.clone();
        for part in parts {
            out.push(part);
        }
        if !out.starts_with(&self.base_path) {
            return Err(escape());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_stays_in_base() {
        let env = AppEnv::with_base("/opt/app");
        assert_eq!(
            env.resolve("data/sing-box/config.json").unwrap(),
            PathBuf::from("/opt/app/data/sing-box/config.json")
        );
        assert_eq!(
            env.resolve("data/../bin/core").unwrap(),
            PathBuf::from("/opt/app/bin/core")
        );
        assert!(env.resolve("../outside").is_err());
    }

    #[cfg(windows)]
    #[test]
    fn test_resolve_refuses_drive_relative_and_rooted() {
        let env = AppEnv::with_base("D:\\app");
        assert!(env.resolve("C:foo").is_err());
        assert!(env.resolve("C:..").is_err());
        assert!(env.resolve("\\foo").is_err());
        assert!(env.resolve("data/C:foo").is_err());
        assert_eq!(env.resolve("data\\x").unwrap(), PathBuf::from("D:\\app\\data\\x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_colon_name_is_plain_component() {
        let env = AppEnv::with_base("/opt/app");
        assert_eq!(env.resolve("C:foo").unwrap(), PathBuf::from("/opt/app/C:foo"));
        assert!(env.resolve("C:foo/../../x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_absolute_passthrough() {
        let env = AppEnv::with_base("/opt/app");
        assert_eq!(env.resolve("/usr/bin/env").unwrap(), PathBuf::from("/usr/bin/env"));
    }

    #[test]
    fn test_detect_task_scheduler_flag() {
        let env = AppEnv::detect(["corebridge", "tasksch"], Some(PathBuf::from("/x"))).unwrap();
        assert!(env.from_task_scheduler);
        assert_eq!(env.base_path, PathBuf::from("/x"));
        let env = AppEnv::detect(["corebridge"], None).unwrap();
        assert!(!env.from_task_scheduler);
    }
}
