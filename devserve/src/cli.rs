//! Command-line surface.

use clap::{Parser, Subcommand, crate_version};
use devserve_core::config::Protocol;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "devserve",
    color = clap::ColorChoice::Auto,
    about = format!("devserve {}: stable ports and supervised lifecycles for local dev servers", crate_version!())
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global_options: GlobalOptions,
}

#[derive(Clone, Debug, Parser)]
pub struct GlobalOptions {
    #[arg(short, long, global = true, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Force CI mode: direct-spawn backend, no on-disk configuration.",
        overrides_with = "no_ci"
    )]
    pub ci: bool,

    #[arg(
        long,
        global = true,
        help = "Force daemon mode even when a CI environment is detected.",
        overrides_with = "ci"
    )]
    pub no_ci: bool,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    #[command(about = "Start a server, reusing an existing one when it matches.")]
    Start {
        #[arg(
            num_args = 1..,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Command to run; may contain {{port}}, {{url}} and other placeholders."
        )]
        command: Vec<String>,

        #[arg(short, long, help = "Name for the server; generated when omitted.")]
        name: Option<String>,

        #[arg(short, long, help = "Explicit port, validated against the configured range.")]
        port: Option<u32>,

        #[arg(long, value_enum, help = "Override the configured protocol.")]
        protocol: Option<CliProtocol>,

        #[arg(
            short,
            long = "env",
            value_name = "KEY=VALUE",
            help = "Environment variable; repeatable. Values may contain placeholders."
        )]
        env: Vec<String>,

        #[arg(short, long = "tag", help = "Tag for batch operations; repeatable.")]
        tags: Vec<String>,

        #[arg(short, long, help = "Free-form description.")]
        description: Option<String>,
    },

    #[command(about = "Stop servers; their registrations are kept.")]
    Stop {
        name: Option<String>,
        #[command(flatten)]
        filter: BatchFilter,
    },

    #[command(about = "Restart servers in place, preserving their environment.")]
    Restart {
        name: Option<String>,
        #[command(flatten)]
        filter: BatchFilter,
    },

    #[command(about = "Stop servers and remove their registrations.")]
    Rm {
        name: Option<String>,
        #[command(flatten)]
        filter: BatchFilter,
    },

    #[command(about = "List registered servers and their live status.")]
    Ls {
        #[arg(long, help = "Only servers carrying this tag.")]
        tag: Option<String>,

        #[arg(long, help = "Only servers registered in this directory.")]
        cwd: Option<PathBuf>,

        #[arg(
            long,
            value_name = "GLOB",
            help = "Only servers whose command matches this glob, e.g. '*{vite,storybook}*'."
        )]
        cmd: Option<String>,
    },

    #[command(about = "Print a server's logs.")]
    Logs {
        name: String,

        #[arg(short, long, help = "Keep following the log as it grows.")]
        follow: bool,

        #[arg(long, help = "Show stderr instead of stdout.")]
        err: bool,
    },

    #[command(about = "Truncate logs for one server, or for all of them.")]
    Flush { name: Option<String> },

    #[command(about = "Show configuration drift since a server last started.")]
    Drift { name: String },

    #[command(about = "Inspect or change the global configuration.")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Clone, Debug, Parser)]
pub struct BatchFilter {
    #[arg(long, help = "Target every registered server.")]
    pub all: bool,

    #[arg(long, help = "Target servers carrying this tag.")]
    pub tag: Option<String>,

    #[arg(
        long,
        value_name = "GLOB",
        help = "Target servers whose command matches this glob."
    )]
    pub cmd: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommand {
    #[command(about = "Print one configuration value.")]
    Get { key: String },

    #[command(about = "Set one configuration value and save.")]
    Set { key: String, value: String },

    #[command(about = "Print the full configuration as JSON.")]
    Show,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum CliProtocol {
    Http,
    Https,
}

impl From<CliProtocol> for Protocol {
    fn from(protocol: CliProtocol) -> Self {
        match protocol {
            CliProtocol::Http => Protocol::Http,
            CliProtocol::Https => Protocol::Https,
        }
    }
}

/// Parse repeated `KEY=VALUE` arguments into a map.
pub fn parse_env_pairs(
    pairs: &[String],
) -> Result<std::collections::BTreeMap<String, String>, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("invalid --env '{}', expected KEY=VALUE", pair)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_parse() {
        let env = parse_env_pairs(&["A=1".into(), "URL=http://x:3000/a=b".into()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["URL"], "http://x:3000/a=b");
        assert!(parse_env_pairs(&["NOEQUALS".into()]).is_err());
        assert!(parse_env_pairs(&["=value".into()]).is_err());
    }

    #[test]
    fn cli_parses_start_with_flags() {
        let cli = Cli::try_parse_from([
            "devserve", "start", "--name", "web", "--port", "4123", "--env", "A=1", "--tag",
            "frontend", "npm", "start",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                command,
                name,
                port,
                env,
                tags,
                ..
            } => {
                assert_eq!(command, vec!["npm".to_string(), "start".to_string()]);
                assert_eq!(name.as_deref(), Some("web"));
                assert_eq!(port, Some(4123));
                assert_eq!(env, vec!["A=1".to_string()]);
                assert_eq!(tags, vec!["frontend".to_string()]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn ci_flags_override_each_other() {
        let cli = Cli::try_parse_from(["devserve", "--ci", "--no-ci", "ls"]).unwrap();
        assert!(!cli.global_options.ci);
        assert!(cli.global_options.no_ci);
    }
}
