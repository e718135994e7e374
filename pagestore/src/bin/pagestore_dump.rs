//! Offline inspection of a resource's fragment file.
//!
//! Reads the file directly, without a buffer pool: useful for looking at
//! what a commit actually persisted, and safe to run against a file a live
//! process has open (the file is append-only and this tool never writes).

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use pagestore::config::defaults::DEFAULT_CONFIG_FILE;
use pagestore::disk::ResourceStorage;
use utils::revision::Revision;

#[derive(Parser)]
#[command(about = "Inspect pagestore resource files", version)]
struct CliOpts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a resource file's revision roots and fragment inventory.
    Dump {
        path: Utf8PathBuf,
        /// Also list every fragment of every page.
        #[arg(long)]
        fragments: bool,
    },
    /// Print the commented default pool configuration file.
    DefaultConfig,
}

#[derive(serde::Serialize)]
struct RootOutput {
    revision: Revision,
    commit_timestamp_millis: u64,
    fragments: u32,
}

#[derive(serde::Serialize)]
struct FragmentOutput {
    revision: Revision,
    kind: String,
    offset: u64,
}

#[derive(serde::Serialize)]
struct PageOutput {
    log_key: i32,
    page_key: i64,
    fragment_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    fragments: Option<Vec<FragmentOutput>>,
}

#[derive(serde::Serialize)]
struct DumpOutput {
    path: Utf8PathBuf,
    committed_revision: Revision,
    revision_roots: Vec<RootOutput>,
    pages: Vec<PageOutput>,
}

fn main() -> anyhow::Result<()> {
    let cli = CliOpts::parse();
    match cli.command {
        Command::Dump { path, fragments } => dump(path, fragments),
        Command::DefaultConfig => {
            println!("{}", DEFAULT_CONFIG_FILE.trim());
            Ok(())
        }
    }
}

fn dump(path: Utf8PathBuf, with_fragments: bool) -> anyhow::Result<()> {
    let storage = ResourceStorage::open(&path)
        .with_context(|| format!("could not open resource file {path}"))?;
    let committed = storage.committed_revision();

    let revision_roots = (1..=committed.as_i64())
        .filter_map(|r| storage.revision_root(Revision(r)))
        .map(|root| RootOutput {
            revision: root.revision,
            commit_timestamp_millis: root.commit_timestamp_millis,
            fragments: root.fragments,
        })
        .collect();

    let pages = storage
        .fragment_inventory()
        .into_iter()
        .map(|(log_key, page_key, fragment_count)| PageOutput {
            log_key,
            page_key,
            fragment_count,
            fragments: with_fragments.then(|| {
                storage
                    .fragment_index(log_key, page_key)
                    .into_iter()
                    .map(|meta| FragmentOutput {
                        revision: meta.revision,
                        kind: format!("{:?}", meta.kind),
                        offset: meta.offset,
                    })
                    .collect()
            }),
        })
        .collect();

    let output = DumpOutput {
        path,
        committed_revision: committed,
        revision_roots,
        pages,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("serialize output")?
    );
    Ok(())
}
