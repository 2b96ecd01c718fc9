use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[arg(help = "JSON batch file produced by an ingestor")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestCodeArgs {
    #[arg(help = "JSON code batch file")]
    pub file: PathBuf,

    #[arg(
        long,
        help = "Number call edges per caller from source lines before ingesting"
    )]
    pub assign_call_orders: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LinkArgs {
    #[arg(long, default_value = "link", help = "Batch id recorded on link edges")]
    pub batch_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TraverseArgs {
    #[arg(help = "Function name or endpoint such as 'POST /orders'")]
    pub reference: String,

    #[arg(long, help = "Restrict name resolution to one service")]
    pub service: Option<String>,

    #[arg(long, help = "Maximum depth (defaults to traversal.default_max_depth)")]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RootsOfArgs {
    #[arg(help = "Function name or endpoint")]
    pub reference: String,

    #[arg(long, help = "Restrict name resolution to one service")]
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LongestChainsArgs {
    #[arg(short = 'n', long, default_value_t = 10, help = "Number of chains (1..=200)")]
    pub top: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct WorkflowsArgs {
    #[arg(
        long,
        conflicts_with_all = ["service", "details", "verify"],
        help = "Workflows containing this function, with its step"
    )]
    pub function: Option<String>,

    #[arg(
        long,
        conflicts_with_all = ["details", "verify"],
        help = "Workflows touching this service"
    )]
    pub service: Option<String>,

    #[arg(
        long,
        conflicts_with = "verify",
        help = "Full steps of the workflow started by or containing this function"
    )]
    pub details: Option<String>,

    #[arg(long, help = "Check a stored workflow against the live call graph")]
    pub verify: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TraceArgs {
    #[arg(help = "Trace identifier")]
    pub trace_id: String,

    #[arg(long, help = "Report root-to-failure call paths instead of the summary")]
    pub failures: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct CheckTraceArgs {
    #[arg(help = "Trace identifier")]
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Replace the stored code graph with a code batch
    IngestCode(IngestCodeArgs),
    /// Append a batch of log events
    IngestLogs(IngestArgs),
    /// Rebuild executed_in, logged_error and service_context edges
    Link(LinkArgs),
    /// Callees of a function in call order
    Forward(TraverseArgs),
    /// Callers of a function, farthest first
    Backward(TraverseArgs),
    /// API-exposed functions nothing calls
    Roots,
    /// Functions that call nothing
    Leaves,
    /// Root/leaf class of every code node
    Classify,
    /// Nearest API entry points above a function
    RootsOf(RootsOfArgs),
    /// Deepest root-to-leaf call chains
    LongestChains(LongestChainsArgs),
    /// Call cycles in the code graph
    Cycles,
    /// Rebuild the workflow catalog
    Materialize,
    /// Query the workflow catalog
    Workflows(WorkflowsArgs),
    /// Summarize one trace
    Trace(TraceArgs),
    /// List stored traces
    Traces,
    /// Verify the next_log chain of one trace
    CheckTrace(CheckTraceArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Code and log graph for root-cause analysis")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .tracelink/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, LogFormat};

    #[test]
    fn traversal_flags_parse() {
        let cli = Cli::try_parse_from([
            "tracelinkd",
            "forward",
            "place_order",
            "--service",
            "orchestrator",
            "--depth",
            "3",
            "--log-format",
            "json",
        ])
        .expect("forward flags should parse");

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Forward(args) => {
                assert_eq!(args.reference, "place_order");
                assert_eq!(args.service.as_deref(), Some("orchestrator"));
                assert_eq!(args.depth, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn endpoint_references_are_single_arguments() {
        let cli = Cli::try_parse_from(["tracelinkd", "roots-of", "POST /orders"])
            .expect("roots-of should parse");
        assert!(matches!(
            cli.command,
            Commands::RootsOf(ref args) if args.reference == "POST /orders"
        ));
        assert_eq!(cli.log_format.as_str(), "human");
    }

    #[test]
    fn workflow_query_flags_are_exclusive() {
        let cli = Cli::try_parse_from(["tracelinkd", "workflows", "--details", "assess_risk"])
            .expect("details should parse");
        assert!(matches!(
            cli.command,
            Commands::Workflows(ref args) if args.details.as_deref() == Some("assess_risk")
        ));

        assert!(
            Cli::try_parse_from([
                "tracelinkd",
                "workflows",
                "--function",
                "a",
                "--service",
                "b"
            ])
            .is_err()
        );
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn longest_chains_defaults_to_ten() {
        let cli = Cli::try_parse_from(["tracelinkd", "longest-chains"])
            .expect("longest-chains should parse");
        assert!(matches!(cli.command, Commands::LongestChains(ref args) if args.top == 10));
    }
}
