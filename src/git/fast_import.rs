use std::collections::VecDeque;
use std::io::{BufRead as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::Fatal;
use crate::FHashMap;

/// Some versions of git-fast-import are buggy for larger mark values, so
/// file marks count down from here and commit marks count up from zero.
pub const MAX_MARK: u32 = (1 << 20) - 2;

/// Mark used for commits on `refs/notes/commits`; it sits just outside the
/// regular mark space so it can be reused for every note.
pub const NOTES_MARK: u32 = MAX_MARK + 1;

pub fn marks_file_name(repo_name: &str) -> String {
    format!("marks-{}", repo_name.replace('/', "_"))
}

pub fn log_file_name(repo_name: &str) -> String {
    format!("log-{}", repo_name.replace('/', "_"))
}

/// How the per-repository byte streams are materialized: real
/// `git fast-import` children, or in-memory sinks (`--dry-run` and tests).
#[derive(Clone)]
pub enum ChannelFactory {
    Real { git: PathBuf },
    Sink(SinkRegistry),
}

impl ChannelFactory {
    pub(crate) fn create(
        &self,
        repo_name: &str,
        git_dir: &Path,
        log_path: &Path,
    ) -> FastImport {
        FastImport {
            repo_name: repo_name.into(),
            git_dir: git_dir.to_path_buf(),
            log_path: log_path.to_path_buf(),
            factory: self.clone(),
            state: State::NotRunning,
            started_once: false,
        }
    }

    pub(crate) fn is_real(&self) -> bool {
        matches!(*self, Self::Real { .. })
    }
}

#[derive(Clone, Default)]
pub struct SinkRegistry {
    inner: Arc<Mutex<FHashMap<String, SinkHandle>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a repository's captured stream, created on first use.
    pub fn handle(&self, repo_name: &str) -> SinkHandle {
        self.inner
            .lock()
            .unwrap()
            .entry(repo_name.into())
            .or_default()
            .clone()
    }
}

#[derive(Clone, Default)]
pub struct SinkHandle {
    inner: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    written: Vec<u8>,
    ls_responses: VecDeque<Vec<u8>>,
}

impl SinkHandle {
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Queues the line the next `ls` round-trip will read back. A sink with
    /// no queued responses behaves like a channel that cannot answer `ls`
    /// at all (the dry-run case).
    pub fn push_ls_response(&self, line: impl Into<Vec<u8>>) {
        self.inner
            .lock()
            .unwrap()
            .ls_responses
            .push_back(line.into());
    }

    fn write(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().written.extend_from_slice(bytes);
    }

    fn pop_ls_response(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().ls_responses.pop_front()
    }

    fn has_ls_responses(&self) -> bool {
        !self.inner.lock().unwrap().ls_responses.is_empty()
    }
}

enum State {
    NotRunning,
    Child {
        child: std::process::Child,
        stdin: std::process::ChildStdin,
        responses: mpsc::Receiver<Vec<u8>>,
    },
    Sink(SinkHandle),
}

/// Write side of one `git fast-import` process (or its in-memory stand-in),
/// plus the response endpoint for `ls` round-trips. Everything the process
/// prints that is not an `ls` response (i.e. `progress` echoes) is appended
/// to the repository's log file, which is what incremental resume reads.
pub struct FastImport {
    repo_name: String,
    git_dir: PathBuf,
    log_path: PathBuf,
    factory: ChannelFactory,
    state: State,
    started_once: bool,
}

impl FastImport {
    pub(crate) fn is_running(&self) -> bool {
        !matches!(self.state, State::NotRunning)
    }

    /// Starts the process if it is not running. Returns true when it was
    /// (re)started, in which case the caller replays branch tips.
    pub(crate) fn ensure_started(&mut self) -> Result<bool, Fatal> {
        if self.is_running() {
            return Ok(false);
        }

        match self.factory {
            ChannelFactory::Sink(ref registry) => {
                self.state = State::Sink(registry.handle(&self.repo_name));
            }
            ChannelFactory::Real { ref git } => {
                if self.started_once {
                    // The marks file may be mid-write; resuming later is
                    // safer than feeding a fresh process half a revision.
                    return Err(Fatal::ChannelClosed {
                        repo: self.repo_name.clone(),
                    });
                }

                let marks_file = marks_file_name(&self.repo_name);
                let mut child = std::process::Command::new(git)
                    .arg("fast-import")
                    .arg(format!("--import-marks={marks_file}"))
                    .arg(format!("--export-marks={marks_file}"))
                    .arg("--force")
                    .arg("--quiet")
                    .current_dir(&self.git_dir)
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::inherit())
                    .spawn()
                    .map_err(|e| Fatal::ChannelIo {
                        repo: self.repo_name.clone(),
                        error: e,
                    })?;

                let stdin = child.stdin.take().unwrap();
                let stdout = child.stdout.take().unwrap();

                let (response_sender, responses) = mpsc::channel();
                let log_path = self.log_path.clone();
                let repo_name = self.repo_name.clone();
                std::thread::Builder::new()
                    .name(format!("fast-import out {repo_name}"))
                    .spawn(move || drain_stdout(stdout, &log_path, &response_sender))
                    .expect("failed to spawn thread");

                self.state = State::Child {
                    child,
                    stdin,
                    responses,
                };
            }
        }

        self.started_once = true;
        Ok(true)
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<(), Fatal> {
        tracing::trace!(
            "{}: writing {} bytes to fast-import",
            self.repo_name,
            bytes.len(),
        );
        self.write_no_log(bytes)
    }

    pub(crate) fn write_no_log(&mut self, bytes: &[u8]) -> Result<(), Fatal> {
        match self.state {
            State::NotRunning => Err(Fatal::ChannelClosed {
                repo: self.repo_name.clone(),
            }),
            State::Child { ref mut stdin, .. } => {
                stdin.write_all(bytes).map_err(|e| Fatal::ChannelIo {
                    repo: self.repo_name.clone(),
                    error: e,
                })
            }
            State::Sink(ref handle) => {
                handle.write(bytes);
                Ok(())
            }
        }
    }

    pub(crate) fn commit(
        &mut self,
        ref_name: &str,
        mark: u32,
        author: &str,
        epoch: i64,
        message: &[u8],
    ) -> Result<(), Fatal> {
        let mut buf = Vec::with_capacity(128 + message.len());
        buf.extend_from_slice(b"commit ");
        buf.extend_from_slice(ref_name.as_bytes());
        buf.extend_from_slice(format!("\nmark :{mark}\n").as_bytes());
        buf.extend_from_slice(format!("committer {author} {epoch} +0000\n").as_bytes());
        buf.extend_from_slice(format!("data {}\n", message.len()).as_bytes());
        buf.extend_from_slice(message);
        buf.push(b'\n');
        self.write(&buf)
    }

    pub(crate) fn reset(&mut self, ref_name: &str, mark: u32) -> Result<(), Fatal> {
        self.write(format!("reset {ref_name}\nfrom :{mark}\n\n").as_bytes())
    }

    pub(crate) fn file_delete(&mut self, path: &[u8]) -> Result<(), Fatal> {
        let mut buf = Vec::with_capacity(path.len() + 3);
        buf.extend_from_slice(b"D ");
        buf.extend_from_slice(path);
        buf.push(b'\n');
        self.write(&buf)
    }

    pub(crate) fn checkpoint(&mut self) -> Result<(), Fatal> {
        self.write(b"checkpoint\n")
    }

    /// Whether `ls` round-trips will get an answer. Dry-run sinks cannot
    /// answer, which disables empty-commit elision.
    pub(crate) fn supports_ls(&self) -> bool {
        match self.state {
            State::NotRunning => false,
            State::Child { .. } => true,
            State::Sink(ref handle) => handle.has_ls_responses(),
        }
    }

    pub(crate) fn send_ls(&mut self, path: &[u8]) -> Result<(), Fatal> {
        let mut buf = Vec::with_capacity(path.len() + 6);
        buf.extend_from_slice(b"ls \"");
        buf.extend_from_slice(path);
        buf.extend_from_slice(b"\"\n");
        self.write(&buf)
    }

    pub(crate) fn read_response(&mut self) -> Result<Vec<u8>, Fatal> {
        match self.state {
            State::NotRunning => Err(Fatal::ChannelClosed {
                repo: self.repo_name.clone(),
            }),
            State::Child { ref responses, .. } => {
                responses.recv().map_err(|_| Fatal::ChannelClosed {
                    repo: self.repo_name.clone(),
                })
            }
            State::Sink(ref handle) => {
                handle.pop_ls_response().ok_or(Fatal::ChannelClosed {
                    repo: self.repo_name.clone(),
                })
            }
        }
    }

    /// Flushes and stops the process. Used both by cache eviction and at
    /// the end of the run; fast-import only writes its marks file on a
    /// clean shutdown, so this must happen before the engine exits.
    pub(crate) fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::NotRunning) {
            State::NotRunning => {}
            State::Sink(_) => {}
            State::Child {
                mut child,
                mut stdin,
                responses,
            } => {
                let _ = stdin.write_all(b"checkpoint\n");
                let _ = stdin.flush();
                drop(stdin);

                if wait_child(&mut child, Duration::from_secs(30)).is_none() {
                    let _ = child.kill();
                    if wait_child(&mut child, Duration::from_millis(200)).is_none() {
                        tracing::warn!(
                            "git fast-import for repository {} did not die",
                            self.repo_name,
                        );
                    }
                }
                drop(responses);
            }
        }
        // A clean close may be followed by a restart (cache eviction); only
        // an unexpected death while running is unrecoverable.
        self.started_once = false;
    }
}

impl Drop for FastImport {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_child(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Option<std::process::ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        if start.elapsed() >= timeout {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Runs on a thread per child: `progress` echoes land in the log file (the
/// resume journal), everything else is an `ls` response.
fn drain_stdout(
    stdout: std::process::ChildStdout,
    log_path: &Path,
    responses: &mpsc::Sender<Vec<u8>>,
) {
    let mut log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .ok();

    let mut reader = std::io::BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if line.starts_with(b"progress ") {
            if let Some(ref mut log_file) = log_file {
                let _ = log_file.write_all(&line);
            }
        } else {
            let mut response = line.clone();
            if response.ends_with(b"\n") {
                response.pop();
            }
            if responses.send(response).is_err() {
                break;
            }
        }
    }

    if let Some(mut log_file) = log_file {
        let _ = log_file.flush();
    }
}

/// Last usable commit mark recorded in a marks file. A corrupt file
/// (unparseable, duplicate or unsorted marks) is reported and treated as
/// empty, which disables incremental resume for the repository.
pub fn last_valid_mark(marks_path: &Path) -> u32 {
    let Ok(raw) = std::fs::read(marks_path) else {
        return 0;
    };

    let mut prev_mark = 0u32;
    for (line_i, line) in raw.split(|&b| b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }

        let mark = line
            .strip_prefix(b":")
            .and_then(|rem| rem.split(|&b| b == b' ').next())
            .and_then(|m| std::str::from_utf8(m).ok())
            .and_then(|m| m.parse::<u32>().ok())
            .unwrap_or(0);

        if mark == 0 {
            tracing::warn!("{marks_path:?} line {}: marks file corrupt?", line_i + 1);
            return 0;
        }
        if mark == prev_mark {
            tracing::warn!("{marks_path:?} line {}: marks file has duplicates", line_i + 1);
            return 0;
        }
        if mark < prev_mark {
            tracing::warn!("{marks_path:?} line {}: marks file not sorted", line_i + 1);
            return 0;
        }

        // The first gap is where the high file-mark range begins.
        if mark > prev_mark + 1 {
            break;
        }

        prev_mark = mark;
    }

    prev_mark
}

/// Full mark-to-sha table of a marks file, for gitlink fixup.
pub fn read_marks(marks_path: &Path) -> std::io::Result<FHashMap<u32, Vec<u8>>> {
    let raw = std::fs::read(marks_path)?;

    let mut marks = FHashMap::default();
    for line in raw.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let Some(rem) = line.strip_prefix(b":") else {
            continue;
        };
        let mut fields = rem.split(|&b| b == b' ');
        let mark = fields
            .next()
            .and_then(|m| std::str::from_utf8(m).ok())
            .and_then(|m| m.parse::<u32>().ok());
        let sha = fields.next();
        if let (Some(mark), Some(sha)) = (mark, sha) {
            marks.insert(mark, sha.to_vec());
        }
    }

    Ok(marks)
}

/// Extracts the trailing 40-hex SHA of an `ls` response, tolerating both
/// `<mode> <type> <sha>\t<path>` and bare `...\t<sha>` shapes.
pub(crate) fn parse_ls_tree_sha(response: &[u8]) -> Option<Vec<u8>> {
    fn is_hex(b: u8) -> bool {
        b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
    }

    let mut end = response.len();
    while end >= 40 {
        if is_hex(response[end - 1]) {
            let start = end - 40;
            if response[start..end].iter().all(|&b| is_hex(b))
                && (start == 0 || !is_hex(response[start - 1]))
            {
                return Some(response[start..end].to_vec());
            }
            while end > 0 && is_hex(response[end - 1]) {
                end -= 1;
            }
        } else {
            end -= 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{last_valid_mark, parse_ls_tree_sha, read_marks};
    use std::io::Write as _;

    const SHA_A: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
    const SHA_B: &str = "8e3dbeb5e19042a45c6e8e1f6f21b6dcfed8ab82";

    fn write_marks(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_last_valid_mark() {
        let file = write_marks(&format!(":1 {SHA_A}\n:2 {SHA_B}\n:3 {SHA_A}\n"));
        assert_eq!(last_valid_mark(file.path()), 3);
    }

    #[test]
    fn test_last_valid_mark_stops_at_gap() {
        let file = write_marks(&format!(":1 {SHA_A}\n:2 {SHA_B}\n:1048574 {SHA_A}\n"));
        assert_eq!(last_valid_mark(file.path()), 2);
    }

    #[test]
    fn test_corrupt_marks_treated_as_empty() {
        let file = write_marks(&format!(":1 {SHA_A}\n:1 {SHA_B}\n"));
        assert_eq!(last_valid_mark(file.path()), 0);

        let file = write_marks(&format!(":2 {SHA_A}\n:1 {SHA_B}\n"));
        assert_eq!(last_valid_mark(file.path()), 0);

        let file = write_marks(&format!("1 {SHA_A}\n"));
        assert_eq!(last_valid_mark(file.path()), 0);
    }

    #[test]
    fn test_missing_marks_file_is_empty() {
        assert_eq!(last_valid_mark(std::path::Path::new("/nonexistent/marks")), 0);
    }

    #[test]
    fn test_read_marks() {
        let file = write_marks(&format!(":1 {SHA_A}\n:7 {SHA_B}\n"));
        let marks = read_marks(file.path()).unwrap();
        assert_eq!(marks.get(&1).map(Vec::as_slice), Some(SHA_A.as_bytes()));
        assert_eq!(marks.get(&7).map(Vec::as_slice), Some(SHA_B.as_bytes()));
        assert_eq!(marks.get(&2), None);
    }

    #[test]
    fn test_parse_ls_tree_sha() {
        let line = format!("040000 tree {SHA_A}\t\"\"");
        assert_eq!(parse_ls_tree_sha(line.as_bytes()).as_deref(), Some(SHA_A.as_bytes()));

        let line = format!("whatever\t{SHA_B}");
        assert_eq!(parse_ls_tree_sha(line.as_bytes()).as_deref(), Some(SHA_B.as_bytes()));

        assert_eq!(parse_ls_tree_sha(b"missing foo"), None);
        assert_eq!(parse_ls_tree_sha(b""), None);
    }
}
