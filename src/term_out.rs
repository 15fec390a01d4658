use std::io::Write as _;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Spawns the thread that owns stderr. Log lines and the single redrawn
/// status line both go through it, so they never tear each other.
pub fn init(start: Instant, enable_status: bool) -> Handle {
    let (sender, receiver) = mpsc::channel();

    let join_handle = std::thread::Builder::new()
        .name("term out".into())
        .spawn(move || thread_main(start, enable_status, receiver))
        .expect("failed to spawn thread");

    Handle {
        join_handle,
        sender,
    }
}

const REDRAW_PERIOD: Duration = Duration::from_millis(100);

enum Command {
    Status(String),
    RawLine(Vec<u8>),
    Finish,
}

fn thread_main(start: Instant, enable_status: bool, receiver: mpsc::Receiver<Command>) {
    let mut stderr = std::io::stderr();
    let mut status = None::<String>;
    let mut drawn = false;
    let mut last_draw = start;

    loop {
        let cmd = if status.is_some() {
            match receiver.recv_timeout(REDRAW_PERIOD.saturating_sub(last_draw.elapsed())) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => Some(Command::Finish),
            }
        } else {
            match receiver.recv() {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvError) => Some(Command::Finish),
            }
        };

        match cmd {
            Some(Command::Status(new_status)) => {
                if enable_status {
                    status = Some(new_status);
                }
            }
            Some(Command::RawLine(line)) => {
                if drawn {
                    check_io(crossterm::queue!(
                        stderr,
                        crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
                        crossterm::cursor::MoveToColumn(0),
                    ));
                    drawn = false;
                }
                check_io(stderr.write_all(&line));
                check_io(stderr.flush());
            }
            Some(Command::Finish) => {
                if drawn {
                    check_io(crossterm::queue!(
                        stderr,
                        crossterm::style::Print('\n'),
                        crossterm::cursor::MoveToColumn(0),
                    ));
                    check_io(stderr.flush());
                }
                break;
            }
            None => {}
        }

        if let Some(ref line) = status {
            if last_draw.elapsed() >= REDRAW_PERIOD || !drawn {
                check_io(crossterm::queue!(
                    stderr,
                    crossterm::cursor::MoveToColumn(0),
                    crossterm::style::Print(render_status(start, line)),
                    crossterm::terminal::Clear(crossterm::terminal::ClearType::UntilNewLine),
                ));
                check_io(stderr.flush());
                drawn = true;
                last_draw = Instant::now();
            }
        }
    }
}

fn render_status(start: Instant, line: &str) -> String {
    let elapsed = start.elapsed().as_secs();
    let secs = elapsed % 60;
    let mins = (elapsed / 60) % 60;
    let hours = elapsed / 3600;

    format!("[{hours:02}:{mins:02}:{secs:02}] {line}")
}

fn check_io<T>(r: std::io::Result<T>) -> T {
    r.expect("stderr write failed")
}

pub struct Handle {
    join_handle: std::thread::JoinHandle<()>,
    sender: mpsc::Sender<Command>,
}

impl Handle {
    pub fn finish(self) {
        self.sender
            .send(Command::Finish)
            .expect("term out endpoint closed");
        self.join_handle.join().expect("term out thread panicked");
    }

    pub fn get_progress_print(&self) -> ProgressPrint {
        ProgressPrint {
            sender: Some(self.sender.clone()),
        }
    }
}

/// Cloneable endpoint handed to everything that reports progress. A
/// disconnected instance (`ProgressPrint::sink()`) swallows output, which
/// is what the tests use.
#[derive(Clone)]
pub struct ProgressPrint {
    sender: Option<mpsc::Sender<Command>>,
}

impl ProgressPrint {
    pub fn sink() -> Self {
        Self { sender: None }
    }

    pub fn set_status(&self, status: String) {
        if let Some(ref sender) = self.sender {
            sender
                .send(Command::Status(status))
                .expect("term out endpoint closed");
        }
    }

    pub fn print_raw_line(&self, line: Vec<u8>) {
        if let Some(ref sender) = self.sender {
            sender
                .send(Command::RawLine(line))
                .expect("term out endpoint closed");
        }
    }
}
