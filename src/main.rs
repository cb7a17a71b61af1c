use clap::{ArgAction, Parser, Subcommand};
use snapcow::checkpoint::FileCheckpointStore;
use snapcow::device::FileDevice;
use snapcow::merge::{CancelToken, MergeConfig, MergeCoordinator, RunOutcome};
use snapcow::op::OpKind;
use snapcow::parser::{CowParser, ParsedCow};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "snapcow", about = "Inspect and merge copy-on-write overlay logs")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a log's header, operation mix and tail status
    Inspect {
        cow: PathBuf,
        /// Check that this label is confirmed and report where merging resumes
        #[arg(long)]
        resume_label: Option<u64>,
    },
    /// Merge a log into a base image, resuming from the state file
    Merge {
        #[arg(long)]
        base:   PathBuf,
        #[arg(long)]
        cow:    PathBuf,
        /// Checkpoint file; the scratch sidecar lives next to it
        #[arg(long)]
        state:  PathBuf,
        /// JSON merge configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { cow, resume_label } => {
            let mut parser = CowParser::new();
            if let Some(label) = resume_label {
                parser = parser.resume_from(label);
            }
            let parsed = parse_file(&parser, &cow)?;
            print_summary(&cow, &parsed);
            if resume_label.is_some() {
                println!("  Resume index   {}", parsed.resume_index);
            }
        }

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge { base, cow, state, config } => {
            let config = match config {
                Some(path) => MergeConfig::from_json(&std::fs::read(path)?)?,
                None       => MergeConfig::default(),
            };
            let parsed = parse_file(&CowParser::new(), &cow)?;
            let device = FileDevice::open(&base, parsed.header.block_size)?;
            let store = FileCheckpointStore::new(state);

            let mut merge = MergeCoordinator::new(parsed, device, store, config)?;
            let outcome = merge.run(&CancelToken::new())?;
            let p = merge.progress();
            println!(
                "{:?}: {}/{} operations, {} label(s), {:.1}%",
                outcome, p.ops_merged, p.total_ops, p.labels_completed, p.percent()
            );
            if outcome == RunOutcome::AwaitingLog {
                println!("Log has an unconfirmed tail; rerun once it is extended.");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_file(parser: &CowParser, path: &Path) -> Result<ParsedCow, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    Ok(parser.parse(BufReader::new(file))?)
}

fn print_summary(path: &Path, parsed: &ParsedCow) {
    let h = &parsed.header;
    println!("── COW log ──────────────────────────────────────────────");
    println!("  Path           {}", path.display());
    println!("  Format version {}.{}", h.version.major, h.version.minor);
    println!("  Block size     {} B", h.block_size);
    println!("  Cluster size   {}", h.cluster_size);
    println!("  Compression    {}", parsed.algorithm.name());
    println!("  Op count       {} (header)", h.op_count);
    println!(
        "  Checksum       {}",
        h.checksum.map(hex::encode).unwrap_or_else(|| "none".into())
    );
    println!("  Finalized      {}", parsed.finalized);
    println!("  Last label     {}", parsed.last_label.map_or("none".into(), |l| l.to_string()));

    let mut mix: BTreeMap<&'static str, usize> = BTreeMap::new();
    for op in &parsed.ops {
        *mix.entry(op.kind().name()).or_default() += 1;
    }
    println!("  Operations     {}", parsed.ops.len());
    for kind in [OpKind::Copy, OpKind::Replace, OpKind::Zero, OpKind::Xor, OpKind::Label, OpKind::ClusterEnd] {
        if let Some(n) = mix.get(kind.name()) {
            println!("    {:<12} {}", kind.name(), n);
        }
    }

    match &parsed.truncated {
        Some(tail) => println!(
            "  Tail           {} op(s) discarded at offset {}{}",
            tail.discarded_ops,
            tail.offset,
            if tail.incomplete_record { ", last record incomplete" } else { "" }
        ),
        None => println!("  Tail           clean"),
    }
}
