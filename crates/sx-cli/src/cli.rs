use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const SX_BEFORE_HELP: &str = concat!(
    "sx ",
    env!("CARGO_PKG_VERSION"),
    " – content-addressed store maintenance\n\n",
    "  gc               Delete unreachable store paths, or report roots and liveness.\n",
    "  add-root         Keep a store path alive through a symlink outside the store.\n",
    "  auto-gc          Collect if free space dropped below SX_MIN_FREE.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = SX_BEFORE_HELP
)]
pub struct SxCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(about = "Collect garbage or inspect what a collection would keep.")]
    Gc(GcArgs),
    #[command(about = "Register a permanent root for a store path.")]
    AddRoot(AddRootArgs),
    #[command(about = "Run the free-space driven collector once.")]
    AutoGc(AutoGcArgs),
}

#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct GcArgs {
    #[arg(long, help = "List every root and what it points to", group = "mode")]
    pub print_roots: bool,
    #[arg(long, help = "List the paths a collection would keep", group = "mode")]
    pub print_live: bool,
    #[arg(long, help = "List the paths a collection would delete", group = "mode")]
    pub print_dead: bool,
    #[arg(
        long,
        help = "Delete only the given paths",
        group = "mode",
        requires = "paths"
    )]
    pub delete: bool,
    #[arg(value_name = "PATH", help = "Store paths (or links to them) for --delete")]
    pub paths: Vec<String>,
    #[arg(
        long,
        value_name = "BYTES",
        value_parser = parse_bytes,
        help = "Stop after freeing this much (accepts K/M/G/T suffixes)"
    )]
    pub max_freed: Option<u64>,
    #[arg(
        long,
        requires = "delete",
        help = "Delete the given paths even if roots reach them"
    )]
    pub ignore_liveness: bool,
    #[arg(
        long,
        requires = "delete",
        help = "Skip paths that are still alive instead of failing"
    )]
    pub skip_alive: bool,
}

#[derive(Args, Debug)]
pub struct AddRootArgs {
    #[arg(value_name = "PATH", help = "Store path to keep alive")]
    pub path: String,
    #[arg(value_name = "LINK", help = "Symlink to create; it points at PATH")]
    pub link: PathBuf,
}

#[derive(Args, Debug)]
pub struct AutoGcArgs {
    #[arg(long, help = "Wait for the collection to finish")]
    pub wait: bool,
}

fn parse_bytes(value: &str) -> Result<u64, String> {
    sx_core::config::parse_size(value).map_err(|err| err.to_string())
}
