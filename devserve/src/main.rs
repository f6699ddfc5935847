use clap::Parser;
use miette::{IntoDiagnostic, Result, bail, miette};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use devserve::cli::{BatchFilter, Cli, Commands, ConfigCommand, parse_env_pairs};
use devserve::log;
use devserve::{BatchOutcome, Devserve, Selection, StartAction, StartRequest};
use devserve_core::ci::{CiOverride, is_ci};
use devserve_core::config::{GlobalConfig, LoadOptions};
use devserve_core::registry::{ListFilter, Registry};
use devserve_processes::{
    ChildRegistry, DaemonBackend, ProcessBackend, ShutdownSweep, SpawnBackend, log_tailer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init(cli.global_options.verbose, cli.global_options.quiet);

    let ci_mode = is_ci(CiOverride {
        ci: cli.global_options.ci,
        no_ci: cli.global_options.no_ci,
    });

    let config = GlobalConfig::load(LoadOptions { ci_mode })?;
    let registry_path = Registry::default_path()?;
    let state_dir = registry_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let registry = Registry::open(registry_path)?;

    // In CI mode servers run as direct children and must not outlive this
    // invocation; the sweep tears them down on exit, signal or panic.
    let mut sweep: Option<Arc<ShutdownSweep>> = None;
    let backend: Box<dyn ProcessBackend> = if ci_mode {
        let children = ChildRegistry::new();
        let guard = ShutdownSweep::new(Arc::clone(&children));
        guard.install_signals();
        guard.install_panic_hook();
        sweep = Some(guard);
        Box::new(SpawnBackend::new(&state_dir, children)?)
    } else {
        Box::new(DaemonBackend::new())
    };

    let mut app = Devserve::new(config, registry, backend, ci_mode);
    let cwd = std::env::current_dir().into_diagnostic()?;

    let result = run(&mut app, &cwd, cli.command).await;
    if let Some(sweep) = &sweep {
        sweep.sweep();
    }
    result
}

async fn run(app: &mut Devserve, cwd: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Start {
            command,
            name,
            port,
            protocol,
            env,
            tags,
            description,
        } => {
            let request = StartRequest {
                command: command.join(" "),
                cwd: cwd.to_path_buf(),
                env: parse_env_pairs(&env).map_err(|e| miette!(e))?,
                name,
                port,
                protocol: protocol.map(Into::into),
                tags: tags.into_iter().collect(),
                description,
            };
            let outcome = app.start(request).await?;
            let entry = &outcome.entry;
            println!(
                "{} '{}' at {}://{}:{}",
                capitalize(&outcome.action.to_string()),
                entry.name,
                entry.protocol,
                entry.hostname,
                entry.port
            );
            if outcome.env_changed {
                info!("Environment changed; the server was recreated with the new values");
            }
            if outcome.port_reassigned {
                info!("Preferred port was taken; assigned {} instead", entry.port);
            }
            if app.ci_mode() && outcome.action != StartAction::Existing {
                info!(
                    "CI mode: '{}' runs attached to this invocation; Ctrl-C stops it",
                    entry.name
                );
                wait_while_online(app, entry.cwd.clone(), entry.name.clone()).await?;
            }
            Ok(())
        }

        Commands::Stop { name, filter } => {
            let outcomes = app.stop(cwd, &selection(name, filter)).await?;
            report("Stopped", "stop", &outcomes)
        }

        Commands::Restart { name, filter } => {
            let outcomes = app.restart(cwd, &selection(name, filter)).await?;
            report("Restarted", "restart", &outcomes)
        }

        Commands::Rm { name, filter } => {
            let outcomes = app.remove(cwd, &selection(name, filter)).await?;
            report("Removed", "remove", &outcomes)
        }

        Commands::Ls { tag, cwd, cmd } => {
            let filter = ListFilter {
                tag,
                cwd,
                cmd_glob: cmd,
            };
            let rows = app.list(&filter).await?;
            if rows.is_empty() {
                println!("No servers registered.");
                return Ok(());
            }
            println!(
                "{:<24} {:<8} {:>6}  {:<8} {}",
                "NAME", "STATUS", "PORT", "PID", "COMMAND"
            );
            for (entry, info) in rows {
                let pid = info
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<8} {:>6}  {:<8} {}",
                    entry.name,
                    info.status.to_string(),
                    entry.port,
                    pid,
                    entry.resolved_command
                );
            }
            Ok(())
        }

        Commands::Logs { name, follow, err } => {
            let info = app.describe(cwd, &name).await?;
            let path = if err { info.err_log } else { info.out_log };
            let Some(path) = path else {
                bail!("No log file recorded for '{}'; has it been started?", name);
            };
            if follow {
                let cancel = tokio_util::sync::CancellationToken::new();
                let canceller = cancel.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    canceller.cancel();
                });
                log_tailer::follow(&path, cancel, |line| println!("{}", line)).await
            } else {
                let contents = tokio::fs::read_to_string(&path).await.into_diagnostic()?;
                print!("{}", contents);
                Ok(())
            }
        }

        Commands::Flush { name } => {
            app.flush_logs(cwd, name.as_deref()).await?;
            println!("Flushed logs.");
            Ok(())
        }

        Commands::Drift { name } => {
            println!("{}", app.drift_report(cwd, &name)?);
            Ok(())
        }

        Commands::Config { command } => match command {
            ConfigCommand::Get { key } => {
                println!("{}", app.config().get(&key)?);
                Ok(())
            }
            ConfigCommand::Set { key, value } => {
                app.config_mut().set(&key, &value)?;
                app.config().save()?;
                println!("Set {} = {}", key, value);
                Ok(())
            }
            ConfigCommand::Show => {
                let json = serde_json::to_string_pretty(app.config()).into_diagnostic()?;
                println!("{}", json);
                Ok(())
            }
        },
    }
}

fn selection(name: Option<String>, filter: BatchFilter) -> Selection {
    Selection {
        name,
        all: filter.all,
        tag: filter.tag,
        cmd: filter.cmd,
    }
}

fn report(done: &str, verb: &str, outcomes: &[BatchOutcome]) -> Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(()) => println!("{} '{}'", done, outcome.name),
            Err(e) => {
                failed += 1;
                eprintln!("Failed to {} '{}': {}", verb, outcome.name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} server(s) failed", failed, outcomes.len());
    }
    Ok(())
}

/// Block until the server stops or a termination signal arrives. The signal
/// handlers installed by the shutdown sweep exit the process themselves.
async fn wait_while_online(app: &Devserve, cwd: PathBuf, name: String) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !app.describe(&cwd, &name).await?.status.is_online() {
            info!("'{}' exited", name);
            return Ok(());
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
