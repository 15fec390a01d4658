use std::ffi::OsString;

pub mod look;

/// File modes as they appear in fast-import `M` lines.
pub const MODE_NORMAL: u32 = 0o100644;
pub const MODE_EXECUTABLE: u32 = 0o100755;
pub const MODE_SYMLINK: u32 = 0o120000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Modify,
    Delete,
    Replace,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// One changed path of an svn revision, in the order svn reports them.
#[derive(Debug, PartialEq, Eq)]
pub struct Change {
    pub action: ChangeAction,
    pub kind: NodeKind,
    pub path: Vec<u8>,
    pub copy_from: Option<(Vec<u8>, u32)>,
}

pub struct RevProps {
    pub author: Option<Vec<u8>>,
    pub epoch: i64,
    pub log: Vec<u8>,
}

pub struct FileContent {
    pub mode: u32,
    pub data: Vec<u8>,
}

/// Read side of the conversion: everything the dispatcher needs to know
/// about the source repository.
pub trait Svn {
    fn latest_revision(&mut self) -> Result<u32, SvnError>;

    fn uuid(&mut self) -> Option<uuid::Uuid>;

    fn rev_props(&mut self, rev: u32) -> Result<RevProps, SvnError>;

    fn changes(&mut self, rev: u32) -> Result<Vec<Change>, SvnError>;

    fn cat(&mut self, rev: u32, path: &[u8]) -> Result<FileContent, SvnError>;

    /// All files (not directories) below `dir` at `rev`, as paths relative
    /// to the repository root.
    fn tree(&mut self, rev: u32, dir: &[u8]) -> Result<Vec<Vec<u8>>, SvnError>;
}

#[derive(Debug)]
pub enum SvnError {
    SpawnProcess {
        arg0: OsString,
        error: std::io::Error,
    },
    ProcessFailed {
        arg0: OsString,
        status: std::process::ExitStatus,
        stderr: Vec<u8>,
    },
    BadOutput {
        what: &'static str,
        output: Vec<u8>,
    },
}

impl std::error::Error for SvnError {}

impl std::fmt::Display for SvnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SpawnProcess {
                ref arg0,
                ref error,
            } => {
                write!(f, "failed to spawn process {arg0:?}: {error}")
            }
            Self::ProcessFailed {
                ref arg0,
                ref status,
                ref stderr,
            } => {
                write!(
                    f,
                    "{arg0:?} finished with {status}: {}",
                    stderr.escape_ascii(),
                )
            }
            Self::BadOutput {
                what,
                ref output,
            } => {
                write!(f, "unparseable {what}: \"{}\"", output.escape_ascii())
            }
        }
    }
}
