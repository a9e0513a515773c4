use structopt::StructOpt;

use mailmirror::core::models::{IngestReport, TimelineGrouping};
use mailmirror::{Archive, Config, Error, Pattern, Stats};

/// Offline maintenance of the mail mirror: the file cache and its index.
#[derive(StructOpt)]
#[structopt(name = "mailmirror", max_term_width = 80)]
enum Command {
    /// Index every cached message.
    Ingest,
    /// Clear the index and re-ingest the whole cache.
    Rebuild,
    /// Full-text search over subject, body and sender.
    Search {
        query: Vec<String>,
        #[structopt(short, long, default_value = "20")]
        limit: usize,
    },
    /// Cache stats for one pattern, or index-wide aggregates.
    Stats {
        #[structopt(short, long)]
        pattern: Option<String>,
    },
    /// Check every pattern directory and re-index inconsistencies.
    Repair {
        /// Only report; change nothing.
        #[structopt(long)]
        dry_run: bool,
    },
    /// List cached messages for a pattern, newest first.
    List {
        pattern: String,
        #[structopt(short, long, default_value = "50")]
        limit: usize,
    },
    /// Message volume by day, week or month.
    Timeline {
        #[structopt(long, default_value = "month")]
        by: TimelineGrouping,
        #[structopt(short, long, default_value = "12")]
        limit: usize,
    },
    /// Attachment metadata, optionally filtered by MIME type prefix.
    Attachments {
        #[structopt(long)]
        mime: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let command = Command::from_args();
    if let Err(e) = run(command).await {
        eprintln!("mailmirror: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), Error> {
    let config = Config::resolve()?;
    let archive = Archive::open(&config)?;

    match command {
        Command::Ingest => print_ingest(&archive.ingest_cache().await?),
        Command::Rebuild => print_ingest(&archive.rebuild().await?),
        Command::Search { query, limit } => {
            for hit in archive.search(&query.join(" "), limit).await? {
                println!(
                    "{}  {}  {}  {}",
                    format_timestamp(hit.timestamp),
                    hit.id,
                    hit.from,
                    hit.subject
                );
            }
        }
        Command::Stats { pattern } => {
            let pattern = pattern.as_deref().map(Pattern::parse).transpose()?;
            match archive.stats(pattern.as_ref()).await? {
                Stats::Pattern(stats) => {
                    println!("messages:   {}", stats.count);
                    println!("total size: {} bytes", stats.total_size);
                    println!("oldest:     {}", format_opt(stats.oldest));
                    println!("newest:     {}", format_opt(stats.newest));
                    println!(
                        "last sync:  {}",
                        stats.last_sync.as_deref().unwrap_or("never")
                    );
                }
                Stats::Global(stats) => {
                    println!("messages: {}", stats.total);
                    println!("threads:  {}", stats.threads);
                    println!("domains:  {}", stats.unique_domains);
                    if let Some((oldest, newest)) = stats.date_range {
                        println!(
                            "range:    {} .. {}",
                            format_timestamp(oldest),
                            format_timestamp(newest)
                        );
                    }
                    println!("top senders:");
                    for s in &stats.top_senders {
                        println!("  {:>6}  {} {}", s.count, s.email, s.name);
                    }
                    println!("top domains:");
                    for d in &stats.top_domains {
                        println!("  {:>6}  {}", d.count, d.domain);
                    }
                }
            }
        }
        Command::Repair { dry_run } => {
            if dry_run {
                for (dir, report) in archive.verify()? {
                    println!(
                        "{}: {} missing files, {} unindexed files",
                        dir.display(),
                        report.missing_files.len(),
                        report.unindexed_files.len()
                    );
                }
            } else {
                for (dir, report) in archive.repair().await? {
                    println!(
                        "{}: {} dropped, {} re-indexed, {} unreadable",
                        dir.display(),
                        report.dropped.len(),
                        report.reindexed.len(),
                        report.unreadable.len()
                    );
                }
            }
        }
        Command::List { pattern, limit } => {
            let pattern = Pattern::parse(&pattern)?;
            let mut records = archive.load_cached(&pattern)?;
            for record in records.by_ref().take(limit) {
                println!(
                    "{}  {}  {}  {}",
                    format_timestamp(record.timestamp),
                    record.id,
                    record.from,
                    record.subject
                );
            }
            for skipped in records.skipped() {
                println!("  skipped {}: {}", skipped.id, skipped.reason);
            }
        }
        Command::Timeline { by, limit } => {
            for bucket in archive.index().timeline(by, limit).await? {
                println!("{:<10}  {:>6}", bucket.period, bucket.count);
            }
        }
        Command::Attachments { mime } => {
            for listing in archive.index().attachments(mime.as_deref()).await? {
                println!(
                    "{}  {}  {}  {} bytes  ({})",
                    format_timestamp(listing.timestamp),
                    listing.attachment.mime_type,
                    listing.attachment.filename,
                    listing.attachment.size,
                    listing.subject
                );
            }
        }
    }
    Ok(())
}

fn print_ingest(report: &IngestReport) {
    println!(
        "{} inserted, {} updated, {} failed",
        report.inserted,
        report.updated,
        report.failed.len()
    );
    for failed in &report.failed {
        println!("  failed {}: {}", failed.id, failed.reason);
    }
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_opt(millis: Option<i64>) -> String {
    millis.map(format_timestamp).unwrap_or_else(|| "-".into())
}
