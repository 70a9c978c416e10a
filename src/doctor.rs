use std::path::Path;

use crate::config::BridgeConfig;
use crate::env::AppEnv;
use crate::host::CALLS;

/// Build facts baked in by build.rs.
pub fn build_info() -> [(&'static str, &'static str); 4] {
    [
        ("date", env!("COREBRIDGE_BUILD_DATE")),
        ("target", env!("COREBRIDGE_BUILD_TARGET")),
        ("profile", env!("COREBRIDGE_BUILD_PROFILE")),
        ("rustc", env!("COREBRIDGE_BUILD_RUSTC")),
    ]
}

/// Diagnostics report. Kept separate from printing so it can be checked in tests.
pub fn report(env: &AppEnv, config: &BridgeConfig, config_path: Option<&Path>, verbose: bool) -> Vec<String> {
    let mut out = Vec::new();
    out.push("corebridge doctor".to_string());
    out.push(String::new());
    out.push(format!("  version: v{}", env!("CARGO_PKG_VERSION")));
    out.push(format!("  host:    {} / {}", env.os, env.arch));
    out.push(format!("  app:     {} v{}", env.app_name, env.app_version));
    out.push(format!("  base:    {}", env.base_path.display()));
    out.push(format!(
        "  launched by task scheduler: {}",
        if env.from_task_scheduler { "yes" } else { "no" }
    ));
    out.push(String::new());

    out.push("  build:".to_string());
    for (k, v) in build_info() {
        out.push(format!("    {k}: {v}"));
    }
    out.push(String::new());

    match config_path {
        Some(p) if p.exists() => out.push(format!("  config: {}", p.display())),
        Some(p) => out.push(format!("  config: {} (missing, using defaults)", p.display())),
        None => out.push("  config: (defaults)".to_string()),
    }
    out.push(format!("    bridge timeout:   {}s", config.bridge_timeout_secs));
    out.push(format!("    max body:         {} bytes", config.max_body_bytes));
    out.push(format!("    max upload:       {} bytes", config.default_max_upload_bytes));
    out.push(format!("    request timeout:  {}s", config.request_timeout_secs));
    out.push(format!("    progress step:    {} bytes", config.progress_threshold_bytes));
    out.push(format!(
        "    kill polling:     {}ms .. {}ms",
        config.kill_poll_initial_ms, config.kill_poll_ceiling_ms
    ));
    out.push(format!("    header timeout:   {}s", config.header_read_timeout_secs));

    if verbose {
        out.push(String::new());
        out.push(format!("  calls: {}", CALLS.join(", ")));
        for var in ["HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY", "NO_PROXY", "RUST_LOG"] {
            let v = std::env::var(var).unwrap_or_default();
            if !v.is_empty() {
                out.push(format!("  env {var}={v}"));
            }
        }
    }
    out
}

pub fn run_doctor(env: &AppEnv, config: &BridgeConfig, config_path: Option<&Path>, verbose: bool) {
    for line in report(env, config, config_path, verbose) {
        eprintln!("{line}");
    }
    eprintln!("doctor: completed diagnostics.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_env_and_config() {
        let env = AppEnv::with_base("/opt/app");
        let cfg = BridgeConfig::default();
        let lines = report(&env, &cfg, None, false);
        assert!(lines.iter().any(|l| l.contains("/opt/app")));
        assert!(lines.iter().any(|l| l.contains("bridge timeout:   60s")));
        assert!(lines.iter().any(|l| l.contains("(defaults)")));
        assert!(!lines.iter().any(|l| l.contains("calls:")));
    }

    #[test]
    fn test_verbose_report_lists_calls() {
        let env = AppEnv::with_base("/opt/app");
        let lines = report(&env, &BridgeConfig::default(), Some(Path::new("/nonexistent/b.yaml")), true);
        assert!(lines.iter().any(|l| l.contains("missing, using defaults")));
        assert!(lines.iter().any(|l| l.contains("KillProcess")));
    }
}
