use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

use crate::services::records::RecordStatus;

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "docflow",
    version,
    author,
    about = "Event-driven document extraction consumer"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Consume document events, extract, record, and notify.
    Consume(ConsumeArgs),
    /// Run the status HTTP server only.
    Serve,
    /// Extract a local file once and print the structured result.
    Extract(ExtractArgs),
    /// Append a document event to the spool.
    Enqueue(EnqueueArgs),
    /// Inspect processing records.
    Records(RecordsArgs),
    /// List partition checkpoints.
    Checkpoints,
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Drain every partition once and exit instead of running indefinitely.
    #[arg(long)]
    pub drain: bool,
    /// Also serve the status HTTP routes while consuming.
    #[arg(long)]
    pub serve: bool,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// PDF, JPEG, or PNG file to send to the extraction service.
    #[arg(value_name = "FILE")]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Partition to append to.
    #[arg(long, default_value = "0")]
    pub partition: String,
    /// Document identifier (`doc_id`).
    #[arg(long)]
    pub doc_id: String,
    /// File reference (`file_name`), e.g. `bucket.com/inbox/scan.pdf`.
    #[arg(long)]
    pub file_name: String,
    /// Owning entity id (`uid`).
    #[arg(long)]
    pub uid: Option<String>,
    /// Event id (`_id`).
    #[arg(long)]
    pub event_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecordsArgs {
    #[command(subcommand)]
    pub command: RecordsCommands,
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommands {
    /// Print the record for one document.
    Get {
        #[arg(value_name = "DOC_ID")]
        document_id: String,
    },
    /// List records with the given status.
    List {
        #[arg(long, value_parser = parse_status)]
        status: RecordStatus,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn parse_status(raw: &str) -> Result<RecordStatus, String> {
    raw.parse::<RecordStatus>()
        .map_err(|_| format!("unknown status `{raw}` (pending, completed, failed, error)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_list_with_status() {
        let cli = Cli::try_parse_from(["docflow", "-vv", "records", "list", "--status", "failed"])
            .expect("parse");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Records(RecordsArgs {
                command: RecordsCommands::List { status, limit },
            })) => {
                assert_eq!(status, RecordStatus::Failed);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(Cli::try_parse_from(["docflow", "records", "list", "--status", "done"]).is_err());
    }

    #[test]
    fn consume_flags_default_off() {
        let cli = Cli::try_parse_from(["docflow", "consume"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Consume(ConsumeArgs {
                drain: false,
                serve: false
            }))
        ));
    }
}
