//! CLI entry point for `mboxprune`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use mboxprune::config::{Config, HeaderMode};
use mboxprune::model::record::MessageSummary;
use mboxprune::progress::{AtomicProgress, ProgressFn, ProgressReporter};
use mboxprune::search::filter::{FilterField, FilterMode, FilterRule, FilterSet};
use mboxprune::search::fulltext::ContentQuery;
use mboxprune::session::ArchiveSession;

#[derive(Parser)]
#[command(
    name = "mboxprune",
    version,
    about = "Filter, export and prune very large MBOX archives"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Keep only byte ranges in memory and re-read headers when needed
    #[arg(long, global = true)]
    lazy: bool,

    /// Only split messages at "From " lines that follow a blank line
    #[arg(long, global = true)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show statistics
    Stats {
        path: PathBuf,
        #[arg(long)]
        json: bool,
        /// Number of top senders to show
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// List messages, optionally filtered
    List {
        path: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
        /// Show at most this many rows
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print one message
    Show {
        path: PathBuf,
        /// Sequence number as shown by `list`
        sequence: u64,
    },
    /// Write the selected messages to a new file
    Export {
        path: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        select: SelectArgs,
    },
    /// Rewrite the archive in place, keeping only the selected messages
    Apply {
        path: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        select: SelectArgs,
        /// Confirm the rewrite
        #[arg(long)]
        yes: bool,
        /// Copy the original here before rewriting
        #[arg(long, value_name = "FILE")]
        backup: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Subject contains TEXT (repeatable, all must match)
    #[arg(long, value_name = "TEXT")]
    subject: Vec<String>,
    /// Subject does not contain TEXT
    #[arg(long, value_name = "TEXT")]
    not_subject: Vec<String>,
    /// From contains TEXT
    #[arg(long, value_name = "TEXT")]
    from: Vec<String>,
    /// From does not contain TEXT
    #[arg(long, value_name = "TEXT")]
    not_from: Vec<String>,
    /// To contains TEXT
    #[arg(long, value_name = "TEXT")]
    to: Vec<String>,
    /// To does not contain TEXT
    #[arg(long, value_name = "TEXT")]
    not_to: Vec<String>,
    /// Match header text case-sensitively
    #[arg(long)]
    case_sensitive: bool,
    /// Dated on or after this day (undated messages always match)
    #[arg(long, value_name = "YYYY-MM-DD")]
    since: Option<NaiveDate>,
    /// Body contains all of these comma-separated words
    #[arg(long, value_name = "WORDS")]
    body: Option<String>,
    /// Body contains none of these comma-separated words
    #[arg(long, value_name = "WORDS")]
    not_body: Option<String>,
}

impl FilterArgs {
    fn filter_set(&self) -> FilterSet {
        let groups = [
            (FilterField::Subject, FilterMode::Contains, &self.subject),
            (FilterField::Subject, FilterMode::NotContains, &self.not_subject),
            (FilterField::From, FilterMode::Contains, &self.from),
            (FilterField::From, FilterMode::NotContains, &self.not_from),
            (FilterField::To, FilterMode::Contains, &self.to),
            (FilterField::To, FilterMode::NotContains, &self.not_to),
        ];
        let mut set = FilterSet::new();
        for (field, mode, patterns) in groups {
            for pattern in patterns {
                set = set.with_rule(
                    FilterRule::new(field, mode, pattern.as_str())
                        .case_sensitive(self.case_sensitive),
                );
            }
        }
        set.since = self.since;
        set
    }

    fn body_queries(&self) -> Vec<ContentQuery> {
        let mut queries = Vec::new();
        if let Some(words) = &self.body {
            queries.push(ContentQuery::parse(words, FilterMode::Contains));
        }
        if let Some(words) = &self.not_body {
            queries.push(ContentQuery::parse(words, FilterMode::NotContains));
        }
        queries.retain(|q| !q.is_empty());
        queries
    }

    fn is_empty(&self) -> bool {
        self.filter_set().is_empty() && self.body_queries().is_empty()
    }
}

#[derive(Args, Debug, Default)]
struct SelectArgs {
    /// Remove the messages the filters match instead of keeping them
    #[arg(long)]
    remove_matching: bool,
    /// Also remove this message (repeatable)
    #[arg(long, value_name = "SEQ")]
    exclude: Vec<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = mboxprune::config::load_config();
    if cli.lazy {
        config.scan.header_mode = HeaderMode::Lazy;
    }
    if cli.strict {
        config.scan.strict_boundaries = true;
    }

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let cancel = AtomicProgress::shared();
    let handle = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || handle.cancel()) {
        tracing::warn!(error = %e, "Could not install Ctrl-C handler");
    }

    match cli.command {
        Commands::Stats { path, json, top } => cmd_stats(&path, &config, &cancel, json, top),
        Commands::List {
            path,
            filter,
            json,
            limit,
        } => cmd_list(&path, &config, &cancel, &filter, json, limit),
        Commands::Show { path, sequence } => cmd_show(&path, &config, &cancel, sequence),
        Commands::Export {
            path,
            output,
            filter,
            select,
        } => cmd_export(&path, &config, &cancel, &output, &filter, &select),
        Commands::Apply {
            path,
            filter,
            select,
            yes,
            backup,
        } => cmd_apply(
            &path,
            &config,
            &cancel,
            &filter,
            &select,
            yes,
            backup.as_deref(),
        ),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = mboxprune::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mboxprune.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxprune", &mut std::io::stdout());
    Ok(())
}

fn cmd_manpage() -> anyhow::Result<()> {
    let man = clap_mangen::Man::new(Cli::command());
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn byte_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{eta}})"
            ))
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb
}

/// Run `op` with a byte progress bar that also honors Ctrl-C.
fn with_progress<T>(
    label: &str,
    cancel: &AtomicProgress,
    op: impl FnOnce(&mut dyn ProgressReporter) -> mboxprune::error::Result<T>,
) -> anyhow::Result<T> {
    let pb = byte_bar(label);
    let mut reporter = ProgressFn::new(|done, total| {
        pb.set_length(total);
        pb.set_position(done);
        !cancel.is_cancelled()
    });
    let result = op(&mut reporter);
    pb.finish_and_clear();
    Ok(result?)
}

fn open_session(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
) -> anyhow::Result<ArchiveSession> {
    with_progress("Indexing", cancel, |progress| {
        ArchiveSession::open(path, config, progress)
    })
}

/// Sequence numbers matching the header filters and then the body filters.
fn matching_sequences(
    session: &mut ArchiveSession,
    filter: &FilterArgs,
    cancel: &AtomicProgress,
) -> anyhow::Result<Vec<u64>> {
    let mut sequences = session.filter(&filter.filter_set())?;
    for query in filter.body_queries() {
        sequences = with_progress("Searching bodies", cancel, |progress| {
            session.search_content(&query, &sequences, progress)
        })?;
    }
    Ok(sequences)
}

/// Turn filter and selection flags into the session's selection.
fn select(
    session: &mut ArchiveSession,
    filter: &FilterArgs,
    select: &SelectArgs,
    cancel: &AtomicProgress,
) -> anyhow::Result<()> {
    if select.remove_matching && filter.is_empty() {
        anyhow::bail!("--remove-matching needs at least one filter");
    }
    if !filter.is_empty() {
        let matches = matching_sequences(session, filter, cancel)?;
        if select.remove_matching {
            session.set_selection(&matches, false)?;
        } else {
            session.select_only(&matches)?;
        }
    }
    session.set_selection(&select.exclude, false)?;
    Ok(())
}

fn cmd_stats(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
    json: bool,
    top: usize,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut session = open_session(path, config, cancel)?;
    let stats = session.stats(top)?;
    let elapsed = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};
    let fmt_date = |d: Option<chrono::DateTime<chrono::Utc>>| {
        d.map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!();
    println!("  {:<20} {}", "File", path.display());
    println!("  {:<20} {}", "Size", format_size(stats.total_bytes, BINARY));
    println!("  {:<20} {}", "Messages", stats.message_count);
    println!(
        "  {:<20} {}",
        "Largest message",
        format_size(stats.largest_message, BINARY)
    );
    println!("  {:<20} {}", "Oldest", fmt_date(stats.oldest));
    println!("  {:<20} {}", "Newest", fmt_date(stats.newest));
    println!("  {:<20} {}", "Undated", stats.undated);
    println!("  {:<20} {:.2?}", "Indexed in", elapsed);
    if !stats.top_senders.is_empty() {
        println!();
        println!("  Top senders:");
        for (sender, count) in &stats.top_senders {
            println!("    {:>6}  {}", count, sender);
        }
    }
    println!();
    Ok(())
}

fn cmd_list(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
    filter: &FilterArgs,
    json: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut session = open_session(path, config, cancel)?;
    let summaries: Vec<MessageSummary> = if filter.body_queries().is_empty() {
        let set = filter.filter_set();
        session
            .list_messages(Some(&set))
            .take(limit.unwrap_or(usize::MAX))
            .collect::<mboxprune::error::Result<_>>()?
    } else {
        let sequences = matching_sequences(&mut session, filter, cancel)?;
        sequences
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|&seq| -> mboxprune::error::Result<MessageSummary> {
                let headers = session.header_values(seq)?;
                let record = session.index().record(seq)?;
                Ok(MessageSummary::new(record, &headers))
            })
            .collect::<mboxprune::error::Result<_>>()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        print_summaries_table(&summaries);
    }
    Ok(())
}

fn cmd_show(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
    sequence: u64,
) -> anyhow::Result<()> {
    let mut session = open_session(path, config, cancel)?;
    let message = session.read_message(sequence)?;

    if let Some(delimiter) = &message.delimiter {
        println!("{delimiter}");
    }
    for header in &message.headers {
        println!("{}: {}", header.name, header.value);
    }
    println!();
    print!("{}", String::from_utf8_lossy(&message.raw_body));
    Ok(())
}

fn cmd_export(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
    output: &Path,
    filter: &FilterArgs,
    select_args: &SelectArgs,
) -> anyhow::Result<()> {
    let mut session = open_session(path, config, cancel)?;
    select(&mut session, filter, select_args, cancel)?;

    let plan = session.build_plan();
    println!(
        "  Exporting {} of {} message(s) to {}",
        plan.len(),
        session.message_count(),
        output.display()
    );

    let written = with_progress("Exporting", cancel, |progress| {
        session.export_to(output, progress)
    })?;

    use humansize::{format_size, BINARY};
    println!("  Wrote {}", format_size(written, BINARY));
    session.close();
    Ok(())
}

fn cmd_apply(
    path: &Path,
    config: &Config,
    cancel: &AtomicProgress,
    filter: &FilterArgs,
    select_args: &SelectArgs,
    yes: bool,
    backup: Option<&Path>,
) -> anyhow::Result<()> {
    let mut session = open_session(path, config, cancel)?;
    select(&mut session, filter, select_args, cancel)?;

    let total = session.message_count();
    let kept = session.selection().selected_count();
    if !yes {
        println!(
            "  {} of {} message(s) would be removed from {}",
            total - kept,
            total,
            path.display()
        );
        anyhow::bail!("refusing to rewrite the archive without --yes");
    }

    if let Some(backup) = backup {
        with_progress("Backing up", cancel, |progress| {
            session.backup_to(backup, progress)
        })?;
        println!("  Backup written to {}", backup.display());
    }

    let outcome = with_progress("Rewriting", cancel, |progress| {
        session.apply_in_place(progress)
    })?;

    use humansize::{format_size, BINARY};
    println!();
    println!("  {:<20} {}", "Kept", outcome.kept);
    println!("  {:<20} {}", "Removed", outcome.removed);
    println!(
        "  {:<20} {} -> {}",
        "Size",
        format_size(outcome.old_size, BINARY),
        format_size(outcome.new_size, BINARY)
    );
    println!();
    session.close();
    Ok(())
}

fn print_summaries_table(summaries: &[MessageSummary]) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {} message(s)", summaries.len());
    println!();
    if summaries.is_empty() {
        return;
    }

    println!(
        "  {:>6} {:<16} {:<25} {:<40} {:>9}",
        "#", "Date", "From", "Subject", "Size"
    );
    println!("  {}", "-".repeat(100));
    for s in summaries {
        let date = s
            .parsed_date
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {:>6} {:<16} {} {} {:>9}",
            s.sequence,
            date,
            pad(&s.from, 25),
            pad(&s.subject, 40),
            format_size(s.size, BINARY)
        );
    }
    println!();
}

/// Truncate to `width` terminal columns (with "...") and pad with spaces.
fn pad(s: &str, width: usize) -> String {
    let mut out = if UnicodeWidthStr::width(s) <= width {
        s.to_string()
    } else {
        let mut result = String::new();
        let mut used = 0;
        for ch in s.chars() {
            let w = UnicodeWidthChar::width(ch).unwrap_or(0);
            if used + w + 3 > width {
                break;
            }
            result.push(ch);
            used += w;
        }
        result.push_str("...");
        result
    };
    let used = UnicodeWidthStr::width(out.as_str());
    out.push_str(&" ".repeat(width.saturating_sub(used)));
    out
}
