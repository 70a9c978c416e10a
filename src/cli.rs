use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "corebridge",
    version,
    about = "Bridge a desktop UI to embedded HTTP servers, outbound HTTP and supervised core processes."
)]
pub(crate) struct Cli {
    /// Base directory for relative paths (defaults to the executable's directory)
    #[arg(long = "base-dir", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Bridge configuration file (defaults to <base>/data/bridge.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print detailed execution info
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Serve the JSON-lines protocol on stdin/stdout (default)
    // The task scheduler entry launches `corebridge tasksch`.
    #[command(alias = "tasksch")]
    Serve,
    /// Run diagnostics to check environment and configuration
    Doctor,
}

impl Cli {
    pub fn config_path(&self, base: &Path) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| base.join("data").join("bridge.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_task_scheduler_launch_serve() {
        let cli = Cli::try_parse_from(["corebridge"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["corebridge", "tasksch"]).unwrap();
        assert_eq!(cli.command, Some(Command::Serve));
    }

    #[test]
    fn test_doctor_with_global_flags() {
        let cli =
            Cli::try_parse_from(["corebridge", "doctor", "--verbose", "--base-dir", "/opt/app"])
                .unwrap();
        assert_eq!(cli.command, Some(Command::Doctor));
        assert!(cli.verbose);
        assert_eq!(
            cli.config_path(cli.base_dir.as_deref().unwrap()),
            PathBuf::from("/opt/app/data/bridge.yaml")
        );
    }

    #[test]
    fn test_explicit_config_wins() {
        let cli = Cli::try_parse_from(["corebridge", "--config", "/etc/b.yaml"]).unwrap();
        assert_eq!(cli.config_path(Path::new("/x")), PathBuf::from("/etc/b.yaml"));
    }
}
