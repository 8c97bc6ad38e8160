use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use sx_core::commands::{self, AddRootRequest, GcMode, GcRequest};
use sx_core::{CommandStatus, ExecutionOutcome, GcCoordinator, GcSettings, LocalStore, StoreConfig};

mod cli;

use cli::{CommandGroupCli, GcArgs, SxCli};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = SxCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let outcome = execute(&cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("sx_core={level},sx={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn execute(command: &CommandGroupCli) -> anyhow::Result<ExecutionOutcome> {
    let config = StoreConfig::from_env()?;
    let settings = GcSettings::from_env()?;
    let store = Arc::new(LocalStore::open(&config, &settings)?);
    let coordinator = Arc::new(GcCoordinator::new(store, config, settings));
    install_interrupt_handler(&coordinator);

    match command {
        CommandGroupCli::Gc(args) => commands::gc(&coordinator, &gc_request(args)),
        CommandGroupCli::AddRoot(args) => commands::add_root(
            &coordinator,
            &AddRootRequest {
                path: args.path.clone(),
                link: args.link.clone(),
            },
        ),
        CommandGroupCli::AutoGc(args) => commands::auto_gc(&coordinator, args.wait),
    }
}

/// Ctrl-C stops a running sweep at its next checkpoint, so gc.lock and the
/// registration socket are released on the way out.
fn install_interrupt_handler(coordinator: &GcCoordinator) {
    let interrupt = coordinator.interrupt().clone();
    if let Err(err) = ctrlc::set_handler(move || {
        if interrupt.is_triggered() {
            std::process::exit(130);
        }
        interrupt.trigger();
    }) {
        tracing::warn!(%err, "failed to install the Ctrl-C handler");
    }
}

fn gc_request(args: &GcArgs) -> GcRequest {
    let mode = if args.print_roots {
        GcMode::PrintRoots
    } else if args.print_live {
        GcMode::PrintLive
    } else if args.print_dead {
        GcMode::PrintDead
    } else if args.delete {
        GcMode::Delete(args.paths.clone())
    } else {
        GcMode::CollectDead
    };
    GcRequest {
        mode,
        max_freed: args.max_freed,
        ignore_liveness: args.ignore_liveness,
        skip_alive: args.skip_alive,
    }
}

fn command_name(command: &CommandGroupCli) -> &'static str {
    match command {
        CommandGroupCli::Gc(_) => "gc",
        CommandGroupCli::AddRoot(_) => "add-root",
        CommandGroupCli::AutoGc(_) => "auto-gc",
    }
}

fn emit_output(cli: &SxCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();

    if cli.json {
        let payload = sx_core::to_json_response(command_name(&cli.command), outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if outcome.status != CommandStatus::Ok {
        eprintln!("error: {}", outcome.message);
        if let Some(hint) = hint_from_details(&outcome.details) {
            eprintln!("Hint: {hint}");
        }
    } else if !cli.quiet && !outcome.message.is_empty() {
        if is_passthrough(&outcome.details) {
            println!("{}", outcome.message);
        } else {
            println!("sx {}: {}", command_name(&cli.command), outcome.message);
        }
    }

    Ok(code)
}

fn hint_from_details(details: &serde_json::Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(serde_json::Value::as_str)
}

fn is_passthrough(details: &serde_json::Value) -> bool {
    details
        .as_object()
        .and_then(|map| map.get("passthrough"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
