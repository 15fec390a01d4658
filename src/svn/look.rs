use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use super::{
    Change, ChangeAction, FileContent, NodeKind, RevProps, Svn, SvnError, MODE_EXECUTABLE,
    MODE_NORMAL, MODE_SYMLINK,
};

/// `Svn` implementation backed by the `svnlook` command-line tool running
/// against a local repository.
pub struct SvnLook {
    repo_path: PathBuf,
    uuid: Option<Option<uuid::Uuid>>,
}

impl SvnLook {
    pub fn new(repo_path: &std::path::Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            uuid: None,
        }
    }

    fn run(&self, args: &[&OsStr]) -> Result<Vec<u8>, SvnError> {
        let output = std::process::Command::new("svnlook")
            .args(args)
            .arg(&self.repo_path)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| SvnError::SpawnProcess {
                arg0: "svnlook".into(),
                error: e,
            })?;

        if !output.status.success() {
            return Err(SvnError::ProcessFailed {
                arg0: arg0_desc(args),
                status: output.status,
                stderr: output.stderr,
            });
        }

        Ok(output.stdout)
    }

    /// Like `run`, but a failing exit status means "not there" rather than
    /// an error (`svnlook propget` exits nonzero for unset properties).
    fn run_optional(&self, args: &[&OsStr]) -> Result<Option<Vec<u8>>, SvnError> {
        let output = std::process::Command::new("svnlook")
            .args(args)
            .arg(&self.repo_path)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| SvnError::SpawnProcess {
                arg0: "svnlook".into(),
                error: e,
            })?;

        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }

    fn propget(&self, rev: u32, prop: &str, path: &[u8]) -> Result<Option<Vec<u8>>, SvnError> {
        let rev_arg = rev.to_string();
        self.run_optional(&[
            OsStr::new("propget"),
            OsStr::new("-r"),
            OsStr::new(&rev_arg),
            OsStr::new(prop),
            bytes_as_os_str(path),
        ])
    }
}

fn arg0_desc(args: &[&OsStr]) -> OsString {
    let mut desc = OsString::from("svnlook");
    if let Some(subcommand) = args.first() {
        desc.push(" ");
        desc.push(subcommand);
    }
    desc
}

#[cfg(unix)]
fn bytes_as_os_str(bytes: &[u8]) -> &OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(bytes)
}

impl Svn for SvnLook {
    fn latest_revision(&mut self) -> Result<u32, SvnError> {
        let raw = self.run(&[OsStr::new("youngest")])?;
        parse_u32_line(&raw).ok_or(SvnError::BadOutput {
            what: "youngest revision",
            output: raw,
        })
    }

    fn uuid(&mut self) -> Option<uuid::Uuid> {
        if let Some(cached) = self.uuid {
            return cached;
        }

        let uuid = self
            .run(&[OsStr::new("uuid")])
            .ok()
            .and_then(|raw| uuid::Uuid::try_parse_ascii(raw.trim_ascii()).ok());
        self.uuid = Some(uuid);
        uuid
    }

    fn rev_props(&mut self, rev: u32) -> Result<RevProps, SvnError> {
        let rev_arg = rev.to_string();
        let raw = self.run(&[OsStr::new("info"), OsStr::new("-r"), OsStr::new(&rev_arg)])?;
        parse_info(&raw).ok_or(SvnError::BadOutput {
            what: "revision info",
            output: raw,
        })
    }

    fn changes(&mut self, rev: u32) -> Result<Vec<Change>, SvnError> {
        let rev_arg = rev.to_string();
        let raw = self.run(&[
            OsStr::new("changed"),
            OsStr::new("--copy-info"),
            OsStr::new("-r"),
            OsStr::new(&rev_arg),
        ])?;
        parse_changed(&raw).ok_or(SvnError::BadOutput {
            what: "changed paths",
            output: raw,
        })
    }

    fn cat(&mut self, rev: u32, path: &[u8]) -> Result<FileContent, SvnError> {
        let rev_arg = rev.to_string();
        let mut data = self.run(&[
            OsStr::new("cat"),
            OsStr::new("-r"),
            OsStr::new(&rev_arg),
            bytes_as_os_str(path),
        ])?;

        let mode = if self.propget(rev, "svn:special", path)?.is_some() {
            // Symlinks are stored as "link <target>".
            if let Some(target) = data.strip_prefix(b"link ") {
                data = target.to_vec();
                MODE_SYMLINK
            } else {
                MODE_NORMAL
            }
        } else if self.propget(rev, "svn:executable", path)?.is_some() {
            MODE_EXECUTABLE
        } else {
            MODE_NORMAL
        };

        Ok(FileContent { mode, data })
    }

    fn tree(&mut self, rev: u32, dir: &[u8]) -> Result<Vec<Vec<u8>>, SvnError> {
        let rev_arg = rev.to_string();
        let raw = self.run(&[
            OsStr::new("tree"),
            OsStr::new("--full-paths"),
            OsStr::new("-r"),
            OsStr::new(&rev_arg),
            bytes_as_os_str(dir),
        ])?;

        Ok(parse_tree(&raw))
    }
}

fn parse_u32_line(raw: &[u8]) -> Option<u32> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

/// `svnlook info` prints author, date, log size and the log message, one
/// per line (the log spanning the rest of the output).
fn parse_info(raw: &[u8]) -> Option<RevProps> {
    let (author_line, rem) = split_line(raw)?;
    let (date_line, rem) = split_line(rem)?;
    let (_log_size_line, log) = split_line(rem)?;

    let author = if author_line.is_empty() {
        None
    } else {
        Some(author_line.to_vec())
    };

    let epoch = if date_line.is_empty() {
        0
    } else {
        parse_svn_date(date_line)?
    };

    let log = log.strip_suffix(b"\n").unwrap_or(log);

    Some(RevProps {
        author,
        epoch,
        log: log.to_vec(),
    })
}

/// Dates come as `2011-04-23 13:24:50 +0200 (Sat, 23 Apr 2011)`; the
/// parenthesized part is decoration.
fn parse_svn_date(raw: &[u8]) -> Option<i64> {
    let raw = std::str::from_utf8(raw).ok()?;
    let raw = raw.split(" (").next().unwrap().trim();
    let date = chrono::DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f %z").ok()?;
    Some(date.timestamp())
}

fn split_line(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let nl = raw.iter().position(|&b| b == b'\n')?;
    Some((&raw[..nl], &raw[(nl + 1)..]))
}

/// `svnlook changed --copy-info` lines: two status columns, a `+` column
/// for copies, then the path; copies are followed by an indented
/// `(from <path>:r<rev>)` line.
fn parse_changed(raw: &[u8]) -> Option<Vec<Change>> {
    let mut changes = Vec::<Change>::new();

    for line in raw.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }

        if let Some(copy_line) = line.strip_prefix(b"    (from ") {
            let copy_line = copy_line.strip_suffix(b")")?;
            let colon = copy_line.iter().rposition(|&b| b == b':')?;
            let src_path = &copy_line[..colon];
            let src_rev: u32 = std::str::from_utf8(copy_line[(colon + 1)..].strip_prefix(b"r")?)
                .ok()?
                .parse()
                .ok()?;
            let last = changes.last_mut()?;
            last.copy_from = Some((src_path.to_vec(), src_rev));
            continue;
        }

        if line.len() < 4 {
            return None;
        }
        let action = match line[0] {
            b'A' => ChangeAction::Add,
            b'R' => ChangeAction::Replace,
            b'D' => ChangeAction::Delete,
            b'U' | b'_' => ChangeAction::Modify,
            _ => return None,
        };

        let mut path = &line[4..];
        let kind = if let Some(dir_path) = path.strip_suffix(b"/") {
            path = dir_path;
            NodeKind::Dir
        } else {
            NodeKind::File
        };

        changes.push(Change {
            action,
            kind,
            path: path.to_vec(),
            copy_from: None,
        });
    }

    Some(changes)
}

fn parse_tree(raw: &[u8]) -> Vec<Vec<u8>> {
    raw.split(|&b| b == b'\n')
        .filter(|line| !line.is_empty() && !line.ends_with(b"/"))
        .map(|line| line.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_changed, parse_info, parse_svn_date, parse_tree};
    use crate::svn::{Change, ChangeAction, NodeKind};

    #[test]
    fn test_parse_info() {
        let raw = b"jdoe\n2011-04-23 13:24:50 +0200 (Sat, 23 Apr 2011)\n11\nfix the bug\n";
        let props = parse_info(raw).unwrap();
        assert_eq!(props.author.as_deref(), Some(b"jdoe".as_slice()));
        assert_eq!(props.epoch, 1303557890);
        assert_eq!(props.log, b"fix the bug");
    }

    #[test]
    fn test_parse_info_no_author() {
        let raw = b"\n\n0\n\n";
        let props = parse_info(raw).unwrap();
        assert_eq!(props.author, None);
        assert_eq!(props.epoch, 0);
        assert_eq!(props.log, b"");
    }

    #[test]
    fn test_parse_svn_date() {
        assert_eq!(
            parse_svn_date(b"1970-01-01 00:00:10 +0000 (Thu, 01 Jan 1970)"),
            Some(10),
        );
        assert_eq!(parse_svn_date(b"1970-01-01 01:00:00.123456 +0100"), Some(0));
        assert_eq!(parse_svn_date(b"garbage"), None);
    }

    #[test]
    fn test_parse_changed() {
        let raw = b"A   trunk/new.c\n\
                    U   trunk/old.c\n\
                    _U  trunk/props-only.c\n\
                    D   trunk/gone/\n\
                    A + branches/b/\n\
                    \x20   (from trunk:r7)\n";
        let changes = parse_changed(raw).unwrap();
        assert_eq!(
            changes,
            vec![
                Change {
                    action: ChangeAction::Add,
                    kind: NodeKind::File,
                    path: b"trunk/new.c".to_vec(),
                    copy_from: None,
                },
                Change {
                    action: ChangeAction::Modify,
                    kind: NodeKind::File,
                    path: b"trunk/old.c".to_vec(),
                    copy_from: None,
                },
                Change {
                    action: ChangeAction::Modify,
                    kind: NodeKind::File,
                    path: b"trunk/props-only.c".to_vec(),
                    copy_from: None,
                },
                Change {
                    action: ChangeAction::Delete,
                    kind: NodeKind::Dir,
                    path: b"trunk/gone".to_vec(),
                    copy_from: None,
                },
                Change {
                    action: ChangeAction::Add,
                    kind: NodeKind::Dir,
                    path: b"branches/b".to_vec(),
                    copy_from: Some((b"trunk".to_vec(), 7)),
                },
            ],
        );
    }

    #[test]
    fn test_parse_tree() {
        let raw = b"trunk/\ntrunk/a.c\ntrunk/sub/\ntrunk/sub/b.c\n";
        assert_eq!(
            parse_tree(raw),
            vec![b"trunk/a.c".to_vec(), b"trunk/sub/b.c".to_vec()],
        );
    }
}
