//! Command-line interface definitions for the `longhorn-br` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `longhorn-br` binary.
#[derive(Debug, Parser)]
#[command(
    name = "longhorn-br",
    about = "Back up Longhorn volumes and their claims, and restore them into a cluster",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Base URL of the Longhorn manager API.
    #[arg(long, global = true, value_name = "URL")]
    pub(crate) api_endpoint: Option<String>,
    /// Path to the kubeconfig used to reach the cluster.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) kubeconfig: Option<Utf8PathBuf>,
    /// Workflow to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Workflows exposed by the binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Snapshot and back up every volume, then write the artifact.
    #[command(name = "backup", visible_alias = "bak")]
    Backup(ArtifactArgs),
    /// Recreate volumes and claims from the artifact.
    #[command(name = "restore", visible_alias = "recover")]
    Restore(ArtifactArgs),
}

/// Arguments shared by both workflows.
#[derive(Debug, Args)]
pub(crate) struct ArtifactArgs {
    /// Artifact to write (backup) or read (restore).
    #[arg(long, value_name = "PATH")]
    pub(crate) artifact: Option<Utf8PathBuf>,
}
