use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(name = "svnsplit", version)]
pub struct Cli {
    #[arg(
        long = "svnrepo",
        value_name = "PATH",
        help = "Path to the source Subversion repository"
    )]
    pub svnrepo: PathBuf,
    #[arg(
        long = "rules",
        value_name = "FILE",
        help = "File with the conversion rules"
    )]
    pub rules: PathBuf,
    #[arg(
        long = "git",
        value_name = "PATH",
        help = "Git executable to use (\"git\" by default)"
    )]
    pub git: Option<PathBuf>,
    #[arg(
        long = "authors",
        value_name = "FILE",
        help = "Map between svn usernames and author names/emails"
    )]
    pub authors: Option<PathBuf>,
    #[arg(
        long = "resume-from",
        value_name = "REVISION",
        help = "Start importing at this svn revision number"
    )]
    pub resume_from: Option<u32>,
    #[arg(
        long = "max-rev",
        value_name = "REVISION",
        help = "Stop importing at this svn revision number"
    )]
    pub max_rev: Option<u32>,
    #[arg(
        long = "commit-interval",
        value_name = "NUMBER",
        default_value_t = 10000,
        help = "Flush the fast-import caches to disk every NUMBER of commits"
    )]
    pub commit_interval: u64,
    #[arg(long = "dry-run", help = "Write no Git repositories")]
    pub dry_run: bool,
    #[arg(
        long = "add-metadata",
        help = "Append svn commit info to every git commit message"
    )]
    pub add_metadata: bool,
    #[arg(
        long = "add-metadata-notes",
        help = "Attach svn commit info to every git commit as a note"
    )]
    pub add_metadata_notes: bool,
    #[arg(long = "coverage", help = "Dump an analysis of rule coverage")]
    pub coverage: bool,
    #[arg(
        long = "debug-rules",
        help = "Log what rule is being used for each path"
    )]
    pub debug_rules: bool,
    #[arg(long = "dump-rules", help = "Dump the contents of the rule trie and exit")]
    pub dump_rules: bool,
    #[arg(
        long = "match-path",
        value_name = "PATH",
        help = "Path to match in a quick ruleset test"
    )]
    pub match_path: Option<String>,
    #[arg(
        long = "match-rev",
        value_name = "REVISION",
        help = "Optional revision to match in a quick ruleset test"
    )]
    pub match_rev: Option<u32>,
    #[arg(
        long = "svn-branches",
        help = "Use the contents of SVN when creating branches (tags included)"
    )]
    pub svn_branches: bool,
    #[arg(
        long = "quiet",
        short = 'q',
        conflicts_with_all = ["verbose", "extra_verbose"],
        help = "Only log warnings and errors"
    )]
    pub quiet: bool,
    #[arg(
        long = "verbose",
        short = 'V',
        conflicts_with = "extra_verbose",
        help = "Log debug messages"
    )]
    pub verbose: bool,
    #[arg(long = "extra-verbose", short = 'X', help = "Log trace messages")]
    pub extra_verbose: bool,
    #[arg(
        long = "exit-success",
        help = "Exit with 0, even if errors occurred"
    )]
    pub exit_success: bool,
    #[arg(long = "no-progress", help = "Do not print progress")]
    pub no_progress: bool,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        help = "File to write logs (besides stderr)"
    )]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn stderr_log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::WARN
        } else if self.extra_verbose {
            tracing::Level::TRACE
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
