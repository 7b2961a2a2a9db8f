//! Non-blocking filesystem operations.
//!
//! Operations run on a worker thread, and complete on the event loop thread through a
//! `Deferred`. Failures only surface as rejections.
//!
//! Files opened with `open` live on the worker thread, and are referred to by `Fd`.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    thread,
    time::SystemTime,
};

use bytes::Bytes;
use mio::Waker;
use thiserror::Error;
use tracing::{event, instrument, Level};
use weft::Deferred;

use crate::Context;

/// Read the names of the entries in a directory, not including `.` and `..`.
///
/// The order of the names is unspecified.
#[instrument("fs::readdir", skip_all)]
pub fn readdir(cx: &Context, path: impl AsRef<Path>) -> Deferred<Vec<String>, FsError> {
    let path = path.as_ref().to_path_buf();
    submit_path(cx, "readdir", Job::ReadDir(path.clone()), path, |output| {
        match output {
            Output::Names(names) => Some(names),
            _ => None,
        }
    })
}

/// Get metadata for a path, following symlinks.
#[instrument("fs::stat", skip_all)]
pub fn stat(cx: &Context, path: impl AsRef<Path>) -> Deferred<Stats, FsError> {
    let path = path.as_ref().to_path_buf();
    submit_path(cx, "stat", Job::Stat(path.clone()), path, |output| match output {
        Output::Stats(stats) => Some(stats),
        _ => None,
    })
}

/// Create a directory, the parent directory must already exist.
#[instrument("fs::mkdir", skip_all)]
pub fn mkdir(cx: &Context, path: impl AsRef<Path>) -> Deferred<(), FsError> {
    let path = path.as_ref().to_path_buf();
    submit_path(cx, "mkdir", Job::Mkdir(path.clone()), path, expect_done)
}

/// Remove an empty directory.
#[instrument("fs::rmdir", skip_all)]
pub fn rmdir(cx: &Context, path: impl AsRef<Path>) -> Deferred<(), FsError> {
    let path = path.as_ref().to_path_buf();
    submit_path(cx, "rmdir", Job::Rmdir(path.clone()), path, expect_done)
}

/// Remove a file.
#[instrument("fs::unlink", skip_all)]
pub fn unlink(cx: &Context, path: impl AsRef<Path>) -> Deferred<(), FsError> {
    let path = path.as_ref().to_path_buf();
    submit_path(cx, "unlink", Job::Unlink(path.clone()), path, expect_done)
}

/// Rename a file or directory, replacing `to` if it exists.
#[instrument("fs::rename", skip_all)]
pub fn rename(
    cx: &Context,
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
) -> Deferred<(), FsError> {
    let from = from.as_ref().to_path_buf();
    let to = to.as_ref().to_path_buf();
    submit_path(cx, "rename", Job::Rename(from.clone(), to), from, expect_done)
}

/// Open a file with `options`, resolving with a descriptor for the other file operations.
///
/// On unix, permissions for created files can be set through `OpenOptionsExt::mode`.
#[instrument("fs::open", skip_all)]
pub fn open(cx: &Context, path: impl AsRef<Path>, options: &OpenOptions) -> Deferred<Fd, FsError> {
    let path = path.as_ref().to_path_buf();
    let job = Job::Open(path.clone(), options.clone());
    submit_path(cx, "open", job, path, |output| match output {
        Output::Fd(fd) => Some(fd),
        _ => None,
    })
}

/// Read up to `len` bytes, at `position` or else at the file's cursor.
///
/// Resolves with fewer bytes than requested near the end of the file, and with none at the end.
#[instrument("fs::read", skip_all)]
pub fn read(cx: &Context, fd: Fd, len: usize, position: Option<u64>) -> Deferred<Bytes, FsError> {
    submit_fd(cx, "read", Job::Read(fd, len, position), fd, |output| {
        match output {
            Output::Data(data) => Some(data),
            _ => None,
        }
    })
}

/// Write all of `data`, at `position` or else at the file's cursor, resolving with its length.
#[instrument("fs::write", skip_all)]
pub fn write(
    cx: &Context,
    fd: Fd,
    data: impl Into<Bytes>,
    position: Option<u64>,
) -> Deferred<usize, FsError> {
    let job = Job::Write(fd, data.into(), position);
    submit_fd(cx, "write", job, fd, |output| match output {
        Output::Written(len) => Some(len),
        _ => None,
    })
}

/// Close a descriptor, after which it's no longer valid.
#[instrument("fs::close", skip_all)]
pub fn close(cx: &Context, fd: Fd) -> Deferred<(), FsError> {
    submit_fd(cx, "close", Job::Close(fd), fd, expect_done)
}

/// Descriptor of a file opened through `open`.
///
/// Only valid for the event loop that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(u64);

fn expect_done(output: Output) -> Option<()> {
    match output {
        Output::Done => Some(()),
        _ => None,
    }
}

fn submit_path<T>(
    cx: &Context,
    op: &'static str,
    job: Job,
    path: PathBuf,
    map: fn(Output) -> Option<T>,
) -> Deferred<T, FsError>
where
    T: 'static,
{
    submit(cx, op, job, map, move |source| FsError::Io { op, path, source })
}

fn submit_fd<T>(
    cx: &Context,
    op: &'static str,
    job: Job,
    fd: Fd,
    map: fn(Output) -> Option<T>,
) -> Deferred<T, FsError>
where
    T: 'static,
{
    submit(cx, op, job, map, move |source| FsError::File { op, fd, source })
}

fn submit<T, E>(
    cx: &Context,
    op: &'static str,
    job: Job,
    map: fn(Output) -> Option<T>,
    on_error: E,
) -> Deferred<T, FsError>
where
    T: 'static,
    E: FnOnce(io::Error) -> FsError + 'static,
{
    let deferred = Deferred::new();

    let target = deferred.clone();
    let callback = move |result: io::Result<Output>| {
        let result = result
            .map_err(on_error)
            .and_then(|output| map(output).ok_or(FsError::UnexpectedOutput { op }));

        match result {
            Ok(value) => target.resolve(value),
            Err(error) => target.reject(error),
        };
    };

    if let Err(error) = cx.fs().submit(job, Box::new(callback)) {
        deferred.reject(error);
    }

    deferred
}

/// Filesystem operation failure.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("failed to {op} {path:?}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to {op} {fd:?}")]
    File {
        op: &'static str,
        fd: Fd,
        #[source]
        source: io::Error,
    },
    #[error("filesystem worker is not running")]
    WorkerGone,
    #[error("unexpected result from {op}")]
    UnexpectedOutput { op: &'static str },
}

impl FsError {
    /// The I/O error kind, if this was an I/O failure.
    pub fn kind(&self) -> Option<io::ErrorKind> {
        match self {
            FsError::Io { source, .. } | FsError::File { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Metadata of a filesystem entry.
#[derive(Debug, Clone)]
pub struct Stats {
    pub len: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub readonly: bool,
    pub modified: Option<SystemTime>,
}

enum Job {
    ReadDir(PathBuf),
    Stat(PathBuf),
    Mkdir(PathBuf),
    Rmdir(PathBuf),
    Unlink(PathBuf),
    Rename(PathBuf, PathBuf),
    Open(PathBuf, OpenOptions),
    Read(Fd, usize, Option<u64>),
    Write(Fd, Bytes, Option<u64>),
    Close(Fd),
}

enum Output {
    Names(Vec<String>),
    Stats(Stats),
    Fd(Fd),
    Data(Bytes),
    Written(usize),
    Done,
}

/// Files opened by jobs, owned by the worker thread.
#[derive(Default)]
struct Files {
    open: HashMap<u64, File>,
    next: u64,
}

impl Files {
    fn get(&mut self, fd: Fd) -> io::Result<&mut File> {
        self.open.get_mut(&fd.0).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "file descriptor is not open")
        })
    }
}

impl Job {
    fn run(self, files: &mut Files) -> io::Result<Output> {
        match self {
            Job::ReadDir(path) => {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(path)? {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    names.push(name);
                }
                Ok(Output::Names(names))
            }
            Job::Stat(path) => {
                let metadata = std::fs::metadata(path)?;
                let stats = Stats {
                    len: metadata.len(),
                    is_file: metadata.is_file(),
                    is_dir: metadata.is_dir(),
                    readonly: metadata.permissions().readonly(),
                    modified: metadata.modified().ok(),
                };
                Ok(Output::Stats(stats))
            }
            Job::Mkdir(path) => std::fs::create_dir(path).map(|_| Output::Done),
            Job::Rmdir(path) => std::fs::remove_dir(path).map(|_| Output::Done),
            Job::Unlink(path) => std::fs::remove_file(path).map(|_| Output::Done),
            Job::Rename(from, to) => std::fs::rename(from, to).map(|_| Output::Done),
            Job::Open(path, options) => {
                let file = options.open(path)?;

                let fd = files.next;
                files.next += 1;
                files.open.insert(fd, file);

                Ok(Output::Fd(Fd(fd)))
            }
            Job::Read(fd, len, position) => {
                let file = files.get(fd)?;
                if let Some(position) = position {
                    file.seek(SeekFrom::Start(position))?;
                }

                let mut buffer = vec![0; len];
                let read = loop {
                    match file.read(&mut buffer) {
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                        result => break result?,
                    }
                };
                buffer.truncate(read);

                Ok(Output::Data(Bytes::from(buffer)))
            }
            Job::Write(fd, data, position) => {
                let file = files.get(fd)?;
                if let Some(position) = position {
                    file.seek(SeekFrom::Start(position))?;
                }

                file.write_all(&data)?;
                Ok(Output::Written(data.len()))
            }
            Job::Close(fd) => {
                let file = files.open.remove(&fd.0);
                let file = file.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "file descriptor is not open")
                })?;

                file.sync_all()?;
                Ok(Output::Done)
            }
        }
    }
}

type Callback = Box<dyn FnOnce(io::Result<Output>)>;

struct Submission {
    id: u64,
    job: Job,
}

struct Completion {
    id: u64,
    result: io::Result<Output>,
}

/// Worker thread and completion tracking for filesystem jobs.
pub(crate) struct FsPool {
    waker: Arc<Waker>,
    worker: RefCell<Option<Worker>>,
    pending: RefCell<HashMap<u64, Callback>>,
    next_id: Cell<u64>,
}

struct Worker {
    jobs: mpsc::Sender<Submission>,
    completions: Receiver<Completion>,
}

impl FsPool {
    pub fn new(waker: Waker) -> Self {
        Self {
            waker: Arc::new(waker),
            worker: RefCell::new(None),
            pending: RefCell::default(),
            next_id: Cell::new(0),
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    fn submit(&self, job: Job, callback: Callback) -> Result<(), FsError> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut worker = self.worker.borrow_mut();
        if worker.is_none() {
            *worker = Some(self.spawn_worker()?);
        }
        let Some(worker) = worker.as_ref() else {
            return Err(FsError::WorkerGone);
        };

        worker
            .jobs
            .send(Submission { id, job })
            .map_err(|_| FsError::WorkerGone)?;
        self.pending.borrow_mut().insert(id, callback);

        Ok(())
    }

    fn spawn_worker(&self) -> Result<Worker, FsError> {
        event!(Level::DEBUG, "starting filesystem worker");

        let (jobs, job_receiver) = mpsc::channel::<Submission>();
        let (completion_sender, completions) = mpsc::channel();
        let waker = self.waker.clone();

        thread::Builder::new()
            .name("weft-fs".to_string())
            .spawn(move || {
                let mut files = Files::default();

                for Submission { id, job } in job_receiver {
                    let result = job.run(&mut files);

                    if completion_sender.send(Completion { id, result }).is_err() {
                        break;
                    }

                    if let Err(error) = waker.wake() {
                        event!(Level::ERROR, ?error, "failed to wake event loop");
                    }
                }
            })
            .map_err(|source| FsError::Io {
                op: "spawn worker",
                path: PathBuf::new(),
                source,
            })?;

        Ok(Worker { jobs, completions })
    }

    /// Run the callbacks of all completed jobs.
    pub fn dispatch(&self) {
        loop {
            let next = match self.worker.borrow().as_ref() {
                Some(worker) => worker.completions.try_recv(),
                None => return,
            };

            let completion = match next {
                Ok(completion) => completion,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.fail_pending();
                    return;
                }
            };

            let callback = self.pending.borrow_mut().remove(&completion.id);
            let Some(callback) = callback else {
                event!(Level::WARN, id = completion.id, "completion for unknown job");
                continue;
            };

            event!(Level::TRACE, id = completion.id, "filesystem job completed");
            callback(completion.result);
        }
    }

    fn fail_pending(&self) {
        event!(Level::ERROR, "filesystem worker stopped unexpectedly");

        self.worker.borrow_mut().take();
        let pending: Vec<_> = self.pending.borrow_mut().drain().collect();

        for (_, callback) in pending {
            let error = io::Error::new(io::ErrorKind::Other, "filesystem worker stopped");
            callback(Err(error));
        }
    }
}
