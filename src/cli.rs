//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use prefetch_core::PrefetchItemState;

/// Seconds one-shot commands wait for in-flight requests by default.
pub const DEFAULT_WAIT_SECS: u64 = 60;

/// Prefetch web pages for offline reading.
///
/// Candidate URLs are rendered into archives by a remote service,
/// downloaded within a daily quota and imported as offline pages.
#[derive(Parser, Debug)]
#[command(name = "prefetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/prefetch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured one
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Seconds to wait for in-flight requests, downloads and imports (0-3600)
    #[arg(long, global = true, default_value_t = DEFAULT_WAIT_SECS, value_parser = clap::value_parser!(u64).range(0..=3600))]
    pub wait: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Suggest candidate URLs and request bundles for them
    Add(AddArgs),

    /// Invalidate every not-yet-requested URL of a namespace
    RemoveUnprocessed {
        /// Client namespace
        namespace: String,
    },

    /// Delete every item suggested by one client
    Remove {
        /// Client namespace
        namespace: String,
        /// Client id within the namespace
        id: String,
    },

    /// Report that the service finished a bundle operation
    Notify {
        /// Operation name from the push message
        operation: String,
    },

    /// Run reconciliation, expiration and a forward pass once
    Maintain,

    /// Run the pipeline with periodic maintenance until interrupted
    Run,

    /// Show item counts per state
    Status(OutputArgs),

    /// List items
    List {
        /// Only items in this state (e.g. new_request, downloading)
        #[arg(long)]
        state: Option<PrefetchItemState>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show the available download quota in bytes
    Quota,

    /// Report finished items and print their histograms
    Metrics,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Client namespace the URLs belong to
    #[arg(short, long)]
    pub namespace: String,

    /// URLs to suggest; each URL is its own client id
    pub urls: Vec<String>,

    /// JSON file with `[{"id":..,"url":..,"title":..}]` entries ("-" for stdin)
    #[arg(long, value_name = "PATH")]
    pub from_json: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct OutputArgs {
    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_status_parses_with_defaults() {
        let cli = Cli::try_parse_from(["prefetch", "status"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
        assert_eq!(cli.wait, DEFAULT_WAIT_SECS);
        assert!(matches!(cli.command, Command::Status(OutputArgs { json: false })));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let cli = Cli::try_parse_from(["prefetch", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbose, 2);

        let cli = Cli::try_parse_from(["prefetch", "status", "--verbose"]).unwrap();
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn test_cli_add_collects_urls_and_namespace() {
        let cli = Cli::try_parse_from([
            "prefetch",
            "add",
            "-n",
            "suggested_articles",
            "https://a.test/",
            "https://b.test/",
        ])
        .unwrap();
        let Command::Add(args) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(args.namespace, "suggested_articles");
        assert_eq!(args.urls.len(), 2);
        assert!(args.from_json.is_none());
    }

    #[test]
    fn test_cli_list_parses_state_filter() {
        let cli = Cli::try_parse_from(["prefetch", "list", "--state", "received_bundle", "--json"]).unwrap();
        let Command::List { state, output } = cli.command else {
            panic!("expected list");
        };
        assert_eq!(state, Some(PrefetchItemState::ReceivedBundle));
        assert!(output.json);
    }

    #[test]
    fn test_cli_list_rejects_unknown_state() {
        let result = Cli::try_parse_from(["prefetch", "list", "--state", "bogus"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_global_db_and_wait() {
        let cli = Cli::try_parse_from(["prefetch", "quota", "--db", "/tmp/p.db", "--wait", "5"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/p.db")));
        assert_eq!(cli.wait, 5);
    }

    #[test]
    fn test_cli_wait_out_of_range_is_rejected() {
        let result = Cli::try_parse_from(["prefetch", "quota", "--wait", "4000"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        let result = Cli::try_parse_from(["prefetch"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_remove_takes_namespace_and_id() {
        let cli = Cli::try_parse_from(["prefetch", "remove", "ns", "c1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Remove { ref namespace, ref id } if namespace == "ns" && id == "c1"
        ));
    }
}
