#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]
#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use svnsplit::term_out::{self, ProgressPrint};
use svnsplit::{authors, cli, importer, rules, svn};

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let start = std::time::Instant::now();

    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders --help and --version through the error path too.
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion => Ok(()),
                _ => Err(RunError::Usage),
            };
        }
    };

    let term_out = term_out::init(start, !args.no_progress);
    let progress_print = term_out.get_progress_print();

    let error_count = Arc::new(AtomicU64::new(0));
    if let Err(e) = init_logger(
        args.stderr_log_level(),
        args.log_file.as_deref(),
        progress_print.clone(),
        error_count.clone(),
    ) {
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let result = run(&args, progress_print);

    term_out.finish();

    result?;
    if error_count.load(Ordering::Relaxed) != 0 && !args.exit_success {
        return Err(RunError::Generic);
    }
    Ok(())
}

fn run(args: &cli::Cli, progress_print: ProgressPrint) -> Result<(), RunError> {
    tracing::info!("reading ruleset...");
    let rules_raw = std::fs::read_to_string(&args.rules).map_err(|e| {
        tracing::error!("failed to read {:?}: {e}", args.rules);
        RunError::Generic
    })?;
    let ruleset = rules::Ruleset::load(&rules_raw).map_err(|e| {
        tracing::error!("failed to load ruleset {:?}: {e}", args.rules);
        RunError::Generic
    })?;
    tracing::info!("done reading ruleset");

    if args.dump_rules {
        print!("{}", ruleset.matcher());
        return Ok(());
    }

    if let Some(ref match_path) = args.match_path {
        let rev = args.match_rev.unwrap_or(u32::MAX);
        match ruleset.matcher().longest_match(match_path.as_bytes(), rev) {
            Some(m) => {
                println!(
                    "the path was matched: /{} -> {} {} /{}",
                    String::from_utf8_lossy(&m.rule.svn_prefix),
                    m.rule.repo,
                    m.rule.ref_name,
                    String::from_utf8_lossy(&m.git_path()),
                );
                return Ok(());
            }
            None => {
                println!("the path wasn't matched");
                return Err(RunError::Generic);
            }
        }
    }

    let authors = match args.authors {
        None => authors::AuthorMap::new(),
        Some(ref authors_path) => {
            let authors_file = std::fs::OpenOptions::new()
                .read(true)
                .open(authors_path)
                .map_err(|e| {
                    tracing::error!("failed to open authors file {authors_path:?}: {e}");
                    RunError::Generic
                })?;

            authors::AuthorMap::parse(&mut std::io::BufReader::new(authors_file)).map_err(
                |e| {
                    tracing::error!("failed to read authors file {authors_path:?}: {e}");
                    RunError::Generic
                },
            )?
        }
    };

    let options = importer::Options {
        git_executable: args.git.clone().unwrap_or_else(|| "git".into()),
        work_dir: ".".into(),
        dry_run: args.dry_run,
        add_metadata: args.add_metadata,
        add_metadata_notes: args.add_metadata_notes,
        commit_interval: args.commit_interval,
        resume_from: args.resume_from,
        max_rev: args.max_rev,
        debug_rules: args.debug_rules,
        coverage: args.coverage,
        svn_branches: args.svn_branches,
    };

    tracing::info!("opening SVN repository at {:?}", args.svnrepo);
    let mut svn_repo = svn::look::SvnLook::new(&args.svnrepo);

    let mut imp = importer::Importer::new(
        &options,
        &ruleset,
        &mut svn_repo,
        &authors,
        progress_print,
        None,
    );

    imp.run().map_err(|e| {
        tracing::error!("{e}");
        imp.restore_logs();
        RunError::Generic
    })
}

fn init_logger(
    stderr_level: tracing::Level,
    file_path: Option<&std::path::Path>,
    progress_print: ProgressPrint,
    error_count: Arc<AtomicU64>,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_sub = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(MakeLogPrinter::new(progress_print))
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            stderr_level,
        ));

    let file_sub = if let Some(file_path) = file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    tracing::Level::DEBUG,
                )),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(ErrorCounter { error_count })
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}

/// Any logged error makes the whole run exit nonzero (unless
/// `--exit-success`), even when the import itself kept going.
struct ErrorCounter {
    error_count: Arc<AtomicU64>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCounter {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct MakeLogPrinter {
    progress_print: ProgressPrint,
}

impl MakeLogPrinter {
    fn new(progress_print: ProgressPrint) -> Self {
        Self { progress_print }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogPrinter {
    type Writer = LogPrinter<'a>;

    fn make_writer(&'a self) -> LogPrinter<'a> {
        LogPrinter {
            progress_print: &self.progress_print,
            buf: Vec::new(),
        }
    }
}

struct LogPrinter<'a> {
    progress_print: &'a ProgressPrint,
    buf: Vec<u8>,
}

impl Drop for LogPrinter<'_> {
    fn drop(&mut self) {
        self.progress_print.print_raw_line(self.buf.clone());
    }
}

impl std::io::Write for LogPrinter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.buf.extend(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
