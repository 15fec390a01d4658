/// Conditions that abort the whole run. Everything else is logged and the
/// importer keeps going with the affected ref forced into a safe state.
#[derive(Debug)]
pub enum Fatal {
    ConflictingSuperModule {
        repo: String,
        existing: String,
        conflicting: String,
    },
    ConflictingSubmodulePath {
        repo: String,
        existing: Vec<u8>,
        conflicting: Vec<u8>,
    },
    BranchFromMissing {
        repo: String,
        branch: String,
        branch_from: String,
    },
    MarkSpaceExhausted {
        repo: String,
    },
    RuleCycle {
        kind: &'static str,
        cycle: Vec<String>,
    },
    CreateRepo {
        git_dir: std::path::PathBuf,
        error: std::io::Error,
    },
    ChannelIo {
        repo: String,
        error: std::io::Error,
    },
    ChannelClosed {
        repo: String,
    },
    LogFile {
        path: std::path::PathBuf,
        error: std::io::Error,
    },
    Svn(crate::svn::SvnError),
}

impl std::error::Error for Fatal {}

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ConflictingSuperModule {
                ref repo,
                ref existing,
                ref conflicting,
            } => {
                write!(
                    f,
                    "conflicting super-module specifications for repository \"{repo}\": \
                     \"{existing}\" and \"{conflicting}\"",
                )
            }
            Self::ConflictingSubmodulePath {
                ref repo,
                ref existing,
                ref conflicting,
            } => {
                write!(
                    f,
                    "conflicting submodule path declarations for repository \"{repo}\": \
                     \"{}\" and \"{}\"",
                    existing.escape_ascii(),
                    conflicting.escape_ascii(),
                )
            }
            Self::BranchFromMissing {
                ref repo,
                ref branch,
                ref branch_from,
            } => {
                write!(
                    f,
                    "{branch} in repository {repo} is branching from {branch_from} \
                     but the latter doesn't exist, can't continue",
                )
            }
            Self::MarkSpaceExhausted { ref repo } => {
                write!(f, "mark space exhausted in repository {repo}")
            }
            Self::RuleCycle {
                kind,
                ref cycle,
            } => {
                write!(f, "cycle in {kind}: {}", cycle.join(" -> "))
            }
            Self::CreateRepo {
                ref git_dir,
                ref error,
            } => {
                write!(f, "failed to create git repository at {git_dir:?}: {error}")
            }
            Self::ChannelIo {
                ref repo,
                ref error,
            } => {
                write!(f, "failed to talk to fast-import for repository {repo}: {error}")
            }
            Self::ChannelClosed { ref repo } => {
                write!(f, "fast-import for repository {repo} closed its output early")
            }
            Self::LogFile {
                ref path,
                ref error,
            } => {
                write!(f, "failed to process log file {path:?}: {error}")
            }
            Self::Svn(ref e) => e.fmt(f),
        }
    }
}

impl From<crate::svn::SvnError> for Fatal {
    #[inline]
    fn from(e: crate::svn::SvnError) -> Self {
        Self::Svn(e)
    }
}
