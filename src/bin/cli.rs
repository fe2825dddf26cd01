//! Thin CLI entry point (A4). Performs dispatch (C6) before constructing any
//! verb handler; only once dispatch resolves to "run here" does it parse the
//! full argument vector and install signal handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dev_stack::compose::{self, SystemClock};
use dev_stack::dispatch::{self, DispatchDecision};
use dev_stack::engine::compose_engine::ComposeEngine;
use dev_stack::engine::{CleanupOpts, ExecOpts, LogsOpts, StartOpts, StopOpts};
use dev_stack::lifecycle::LifecycleController;
use dev_stack::registry::Registry;
use dev_stack::version::Version;
use dev_stack::{catalog, installer, logging, paths, project, release, settings, versionfile};

const TOOL_BINARY_NAME: &str = "dev-stack";
const EXIT_GENERIC_FAILURE: i32 = 1;
const EXIT_USER_INPUT: i32 = 2;
const EXIT_ENGINE_UNAVAILABLE: i32 = 3;
const EXIT_VERSION_NOT_INSTALLED: i32 = 4;

#[derive(Parser)]
#[command(name = "dev-stack", about = "Provision and drive local development stacks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the project's effective service set.
    Up {
        services: Vec<String>,
        #[arg(long)]
        build: bool,
        #[arg(long)]
        force_recreate: bool,
    },
    /// Stop the project's effective service set.
    Down {
        services: Vec<String>,
        #[arg(long)]
        volumes: bool,
    },
    Restart {
        services: Vec<String>,
    },
    Status {
        services: Vec<String>,
        #[arg(long)]
        watch: bool,
    },
    Logs {
        services: Vec<String>,
        #[arg(long)]
        follow: bool,
    },
    Exec {
        service: String,
        cmd: Vec<String>,
    },
    Scale {
        tokens: Vec<String>,
    },
    Cleanup {
        #[arg(long)]
        volumes: bool,
        #[arg(long)]
        dry_run: bool,
    },
    Backup {
        service: String,
        dest: PathBuf,
    },
    Restore {
        service: String,
        source: PathBuf,
    },
    /// Version management (non-dispatching).
    #[command(subcommand)]
    Versions(VersionsCommand),
}

#[derive(Subcommand)]
enum VersionsCommand {
    List,
    Available,
    Install { version: String },
    Uninstall { version: String },
    Use { version: String },
    Detect,
    Cleanup { keep: usize },
}

#[tokio::main]
async fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    paths::load_project_dotenv(&cwd);

    let paths = paths::Paths::discover();
    let registry = Registry::new(paths.registry_file());
    let current_binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(TOOL_BINARY_NAME));

    let decision = dispatch::should_dispatch(&raw_args[1..], &cwd, &registry, &current_binary);
    if let DispatchDecision::Dispatch(target) = decision {
        let args: Vec<String> = raw_args[1..].to_vec();
        #[cfg(unix)]
        {
            let err = dispatch::reexec(&target, &args);
            eprintln!("dev-stack: failed to re-exec into {}: {err}", target.display());
            std::process::exit(EXIT_GENERIC_FAILURE);
        }
        #[cfg(not(unix))]
        {
            match dispatch::reexec_via_child_proxy(&target, &args).await {
                Ok(status) => std::process::exit(status.code().unwrap_or(EXIT_GENERIC_FAILURE)),
                Err(e) => {
                    eprintln!("dev-stack: failed to proxy {}: {e}", target.display());
                    std::process::exit(EXIT_GENERIC_FAILURE);
                }
            }
        }
    }

    let global_settings = settings::load(&paths.global_settings_file()).unwrap_or_default();
    let _logging_guard = logging::init(&global_settings, &paths.base_dir, !atty_stdin());

    install_signal_handlers();

    let cli = Cli::parse();
    let exit_code = run(cli, &paths, &cwd, &registry, &global_settings).await;
    std::process::exit(exit_code);
}

fn atty_stdin() -> bool {
    // Conservative default: treat runs as non-interactive so the file
    // appender is attached in cron/CI contexts. A real terminal check would
    // use `std::io::IsTerminal`.
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

fn install_signal_handlers() {
    // C12's long-running verbs (status --watch, logs) install their own
    // cancellation via tokio::select!; this hook exists so a future verb can
    // register process-wide handlers without touching dispatch's code path.
}

async fn run(
    cli: Cli,
    paths: &paths::Paths,
    cwd: &PathBuf,
    registry: &Registry,
    global_settings: &settings::GlobalSettings,
) -> i32 {
    match cli.command {
        Command::Versions(sub) => run_versions(sub, paths, cwd, registry).await,
        verb => run_lifecycle_verb(verb, paths, cwd, global_settings).await,
    }
}

async fn run_versions(
    cmd: VersionsCommand,
    paths: &paths::Paths,
    cwd: &PathBuf,
    registry: &Registry,
) -> i32 {
    match cmd {
        VersionsCommand::List => {
            match registry.list() {
                Ok(versions) => {
                    for v in versions {
                        println!("{}{}", v.version, if v.active { " (active)" } else { "" });
                    }
                    0
                }
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        VersionsCommand::Detect => match versionfile::detect(cwd) {
            Ok(constraint) => {
                println!("{constraint}");
                0
            }
            Err(e) => {
                eprintln!("dev-stack: {e}");
                EXIT_USER_INPUT
            }
        },
        VersionsCommand::Use { version } => {
            let Ok(version) = Version::parse(&version) else {
                eprintln!("dev-stack: invalid version '{version}'");
                return EXIT_USER_INPUT;
            };
            match registry.set_active(&version) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_VERSION_NOT_INSTALLED
                }
            }
        }
        VersionsCommand::Install { version } => {
            let Ok(version) = Version::parse(&version) else {
                eprintln!("dev-stack: invalid version '{version}'");
                return EXIT_USER_INPUT;
            };
            let catalog_base = std::env::var("DEV_STACK_RELEASE_URL")
                .unwrap_or_else(|_| "https://releases.invalid/dev-stack".to_string());
            let release_catalog = release::HttpReleaseCatalog::new(catalog_base, TOOL_BINARY_NAME);
            let inst = installer::Installer::new(&release_catalog, paths, TOOL_BINARY_NAME);
            match inst.install(&version).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        VersionsCommand::Uninstall { version } => {
            let Ok(version) = Version::parse(&version) else {
                eprintln!("dev-stack: invalid version '{version}'");
                return EXIT_USER_INPUT;
            };
            let catalog_base = "https://releases.invalid/dev-stack".to_string();
            let release_catalog = release::HttpReleaseCatalog::new(catalog_base, TOOL_BINARY_NAME);
            let inst = installer::Installer::new(&release_catalog, paths, TOOL_BINARY_NAME);
            match inst.uninstall(&version) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        VersionsCommand::Cleanup { keep } => {
            let catalog_base = "https://releases.invalid/dev-stack".to_string();
            let release_catalog = release::HttpReleaseCatalog::new(catalog_base, TOOL_BINARY_NAME);
            let inst = installer::Installer::new(&release_catalog, paths, TOOL_BINARY_NAME);
            match inst.cleanup(keep) {
                Ok(_) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        VersionsCommand::Available => {
            println!("(release catalog not configured)");
            0
        }
    }
}

async fn run_lifecycle_verb(
    verb: Command,
    paths: &paths::Paths,
    cwd: &PathBuf,
    global_settings: &settings::GlobalSettings,
) -> i32 {
    let (project_config, validation) = match project::load(cwd, None) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("dev-stack: {e}");
            return EXIT_USER_INPUT;
        }
    };
    if !validation.is_ok() {
        for violation in &validation.violations {
            eprintln!("dev-stack: validation: {violation}");
        }
        return EXIT_USER_INPUT;
    }

    let catalog = match catalog::load(global_settings.catalog_override_dir.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("dev-stack: {e}");
            return EXIT_GENERIC_FAILURE;
        }
    };

    let compose_file = cwd.join("dev-stack").join(compose::COMPOSITION_FILENAME);
    let engine = match ComposeEngine::discover(&global_settings.container_engines, compose_file) {
        Ok(e) => e,
        Err(_) => {
            eprintln!("dev-stack: no container engine found on PATH");
            return EXIT_ENGINE_UNAVAILABLE;
        }
    };

    let controller = LifecycleController::new(&project_config, &catalog, &engine);
    let clock = SystemClock;

    match verb {
        Command::Up { services, build, force_recreate } => {
            let opts = StartOpts {
                build,
                force_recreate,
                detach: true,
                ..Default::default()
            };
            match controller.up(&services, &opts, &clock).await {
                Ok((artifact, _env_file)) => {
                    println!(
                        "dev-stack: started {} service(s): {}",
                        artifact.metadata.services.len(),
                        artifact.metadata.services.join(", ")
                    );
                    0
                }
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        Command::Down { services, volumes } => {
            let opts = StopOpts {
                remove_volumes: volumes,
                ..Default::default()
            };
            match controller.down(&services, &opts).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        Command::Restart { services } => {
            match controller
                .restart(&services, &StartOpts::default(), &StopOpts::default(), &clock)
                .await
            {
                Ok(_) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        Command::Status { services, watch } => {
            if watch {
                let mut ticks = 0;
                let result = controller
                    .status_watch(&services, std::time::Duration::from_secs(2), || {
                        ticks += 1;
                        ticks > 2
                    })
                    .await;
                match result {
                    Ok(batches) => {
                        for batch in batches {
                            for status in batch {
                                println!("{}: {:?}", status.id, status.state);
                            }
                        }
                        0
                    }
                    Err(e) => {
                        eprintln!("dev-stack: {e}");
                        EXIT_GENERIC_FAILURE
                    }
                }
            } else {
                match controller.status(&services).await {
                    Ok(statuses) => {
                        for status in statuses {
                            println!("{}: {:?}", status.id, status.state);
                        }
                        0
                    }
                    Err(e) => {
                        eprintln!("dev-stack: {e}");
                        EXIT_GENERIC_FAILURE
                    }
                }
            }
        }
        Command::Logs { services, follow } => {
            use futures::StreamExt;
            let opts = LogsOpts {
                follow,
                ..Default::default()
            };
            match controller.logs(&services, &opts).await {
                Ok(mut stream) => {
                    while let Some((service, line)) = stream.next().await {
                        println!("{service} | {line}");
                    }
                    0
                }
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        Command::Exec { service, cmd } => match controller.exec(&service, &cmd, &ExecOpts::default()).await {
            Ok(result) => result.exit_code,
            Err(e) => {
                eprintln!("dev-stack: {e}");
                EXIT_GENERIC_FAILURE
            }
        },
        Command::Scale { tokens } => match controller.scale(&tokens).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("dev-stack: {e}");
                EXIT_USER_INPUT
            }
        },
        Command::Cleanup { volumes, dry_run } => {
            let opts = CleanupOpts {
                volumes,
                dry_run,
                ..Default::default()
            };
            match controller.cleanup(&opts).await {
                Ok(_) => 0,
                Err(e) => {
                    eprintln!("dev-stack: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        Command::Backup { service, dest } => match controller.backup(&service, &dest).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("dev-stack: {e}");
                EXIT_GENERIC_FAILURE
            }
        },
        Command::Restore { service, source } => match controller.restore(&service, &source).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("dev-stack: {e}");
                EXIT_GENERIC_FAILURE
            }
        },
        Command::Versions(_) => unreachable!("handled in run()"),
    }
}
