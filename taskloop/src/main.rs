//! `taskloop` binary: run a checklist unattended, inspect or clear the run lock.
//!
//! All tuning lives in the TOML run config (`.taskloop/config.toml` by
//! default); flags only pick the project, the task file and the config path.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskloop::controller::{Controller, RunDeps};
use taskloop::core::types::RunResult;
use taskloop::error::{LockError, RunError};
use taskloop::exit_codes;
use taskloop::io::agent::CommandSessionFactory;
use taskloop::io::config::load_config;
use taskloop::io::git::{Git, VersionControl};
use taskloop::io::lock::{LockManager, LockState};
use taskloop::io::memory::{MemoryStore, NotesMemoryStore};
use taskloop::io::process::ShellCommandRunner;
use taskloop::io::progress::LogProgress;
use taskloop::logging;
use tracing::{info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Drive a coding agent through a markdown checklist unattended"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through the unchecked tasks in a checklist.
    Run {
        /// Markdown checklist, relative to the project directory.
        #[arg(default_value = "TASKS.md")]
        task_file: PathBuf,

        /// Project directory the agent works in.
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,

        /// Run config, relative to the project directory.
        #[arg(long, default_value = ".taskloop/config.toml")]
        config: PathBuf,
    },
    /// Show who holds the run lock.
    Status,
    /// Remove the run lock regardless of its owner.
    Unlock,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            task_file,
            project_dir,
            config,
        } => {
            logging::init("warn,taskloop=info");
            cmd_run(&project_dir, &task_file, &config)
        }
        Command::Status => {
            logging::init("warn");
            cmd_status()
        }
        Command::Unlock => {
            logging::init("warn");
            cmd_unlock()
        }
    };
    match code {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit_code(exit_codes::INVALID)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn cmd_run(project_dir: &Path, task_file: &Path, config_path: &Path) -> Result<i32> {
    let root = project_dir
        .canonicalize()
        .with_context(|| format!("resolve project directory {}", project_dir.display()))?;
    let config = load_config(&root.join(config_path))?;

    let git = Git::new(&root, GIT_TIMEOUT);
    let vcs: Option<Arc<dyn VersionControl>> = if git.is_repo() {
        Some(Arc::new(git))
    } else {
        warn!("not a git repository: rollback, commits and AI review are disabled");
        None
    };
    let memory_dir = root.join(&config.prompt.memory_dir);
    let memory: Option<Arc<dyn MemoryStore>> = memory_dir
        .is_dir()
        .then(|| Arc::new(NotesMemoryStore::new(memory_dir)) as Arc<dyn MemoryStore>);
    let deps = RunDeps {
        sessions: Arc::new(CommandSessionFactory::new(config.agent.command.clone())?),
        vcs,
        commands: Arc::new(ShellCommandRunner::new(config.verify.output_limit_bytes)),
        progress: Arc::new(LogProgress),
        memory,
        lock: LockManager::default(),
    };
    let controller = Controller::new(root, task_file, config, deps);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    let outcome = runtime.block_on(async {
        let abort = controller.abort_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, aborting after the current call");
                abort.cancel();
            }
        });
        controller.run().await
    });

    match outcome {
        Ok(result) => {
            print_json(&result)?;
            Ok(if result.completed_all {
                exit_codes::OK
            } else {
                exit_codes::INCOMPLETE
            })
        }
        Err(RunError::Lock(err @ (LockError::Held { .. } | LockError::Contended))) => {
            eprintln!("{err}");
            Ok(exit_codes::LOCKED)
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_status() -> Result<i32> {
    let manager = LockManager::default();
    match manager.inspect()? {
        LockState::Free => println!("no run in progress ({})", manager.path().display()),
        LockState::Held(record) => println!(
            "run in progress: pid {} since {} ({})",
            record.pid, record.started_at, record.label
        ),
        LockState::Stale {
            record: Some(record),
            reason,
        } => println!(
            "stale lock from pid {} since {} ({reason}); the next run reclaims it",
            record.pid, record.started_at
        ),
        LockState::Stale { record: None, reason } => {
            println!("unreadable lock file ({reason}); the next run reclaims it");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_unlock() -> Result<i32> {
    match LockManager::default().force_release()? {
        Some(record) => println!("removed lock held by pid {} ({})", record.pid, record.label),
        None => println!("no lock to remove"),
    }
    Ok(exit_codes::OK)
}

fn print_json(result: &RunResult) -> Result<()> {
    let payload = serde_json::to_string_pretty(result).context("serialize run result")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["taskloop", "run"]);
        match cli.command {
            Command::Run {
                task_file,
                project_dir,
                config,
            } => {
                assert_eq!(task_file, PathBuf::from("TASKS.md"));
                assert_eq!(project_dir, PathBuf::from("."));
                assert_eq!(config, PathBuf::from(".taskloop/config.toml"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_paths() {
        let cli = Cli::parse_from(["taskloop", "run", "docs/PLAN.md", "--project-dir", "/work"]);
        assert!(matches!(
            cli.command,
            Command::Run { ref task_file, .. } if task_file == Path::new("docs/PLAN.md")
        ));
    }

    #[test]
    fn parse_status_and_unlock() {
        assert!(matches!(Cli::parse_from(["taskloop", "status"]).command, Command::Status));
        assert!(matches!(Cli::parse_from(["taskloop", "unlock"]).command, Command::Unlock));
    }
}
