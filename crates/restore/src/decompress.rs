//! Bounded pool of decoder side-processes.
//!
//! Each compressed file is decoded by a child process whose stdout is bound
//! to a private named pipe; the worker reads the pipe. Slots are gated by a
//! semaphore so a wide restore cannot fork an unbounded number of decoders.
//!
//! Opening protocol: acquire a slot, create the pipe, open the read end
//! non-blocking (so it cannot hang on a missing writer), hand the write end
//! to the spawned decoder, health-check the child shortly after spawn, then
//! poll the read end with a bounded timeout until the decoder produces bytes
//! or closes. Every exit path releases the slot, unlinks the pipe, and kills
//! the child; the returned stream does the same on drop.

use std::{
    ffi::CString,
    io,
    os::unix::{
        ffi::OsStrExt,
        fs::OpenOptionsExt,
        io::AsRawFd,
    },
    path::{
        Path,
        PathBuf,
    },
    process::Stdio,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::Relaxed,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use anyhow::Context;
use common::knobs::{
    DECOMPRESS_HEALTH_CHECK_DELAY,
    DECOMPRESS_OPEN_TIMEOUT,
};
use tokio::{
    process::{
        Child,
        Command,
    },
    sync::{
        OwnedSemaphorePermit,
        Semaphore,
    },
};

use crate::jobs::Compression;

pub struct DecompressPool {
    semaphore: Arc<Semaphore>,
    pipe_dir: PathBuf,
    counter: AtomicU64,
    open_timeout: Duration,
    health_check_delay: Duration,
    decoder_override: Option<Vec<String>>,
}

impl DecompressPool {
    pub fn new(capacity: usize, pipe_dir: PathBuf) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            pipe_dir,
            counter: AtomicU64::new(0),
            open_timeout: *DECOMPRESS_OPEN_TIMEOUT,
            health_check_delay: *DECOMPRESS_HEALTH_CHECK_DELAY,
            decoder_override: None,
        }
    }

    /// Pool that runs `decoder` instead of the real decompressors, with
    /// explicit timing bounds.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_decoder(
        capacity: usize,
        pipe_dir: PathBuf,
        decoder: Vec<String>,
        open_timeout: Duration,
        health_check_delay: Duration,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            pipe_dir,
            counter: AtomicU64::new(0),
            open_timeout,
            health_check_delay,
            decoder_override: Some(decoder),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Open `path` for reading, decoding through a side-process when the file
    /// is compressed. Plain files bypass the pool entirely.
    pub async fn open(
        &self,
        path: &Path,
        compression: Compression,
    ) -> anyhow::Result<DecompressedStream> {
        let decoder = match &self.decoder_override {
            Some(argv) if compression != Compression::None => Some(argv.clone()),
            _ => compression.decoder(),
        };
        let Some(decoder) = decoder else {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            return Ok(DecompressedStream {
                file,
                side_process: None,
            });
        };

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("decompression pool closed")?;

        let pipe_path = self.pipe_dir.join(format!(
            "parload-{}-{}.fifo",
            std::process::id(),
            self.counter.fetch_add(1, Relaxed),
        ));
        mkfifo(&pipe_path)
            .with_context(|| format!("cannot create pipe {}", pipe_path.display()))?;
        // From here on the pipe is unlinked on every path.
        let pipe = PipeGuard {
            path: pipe_path.clone(),
        };

        // Read end first: a non-blocking read open succeeds with no writer,
        // and holding it lets the decoder's write end open without blocking.
        let reader = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)
            .with_context(|| format!("cannot open pipe {}", pipe_path.display()))?;
        let writer = std::fs::OpenOptions::new()
            .write(true)
            .open(&pipe_path)
            .with_context(|| format!("cannot open pipe writer {}", pipe_path.display()))?;

        let (program, args) = decoder
            .split_first()
            .context("empty decoder command line")?;
        let mut child = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn decoder {program}"))?;

        // Health check: a decoder that dies right away (bad binary, unreadable
        // input) is reported here rather than as an opaque pipe timeout.
        tokio::time::sleep(self.health_check_delay).await;
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                anyhow::bail!(
                    "decoder {program} for {} exited early with {status}",
                    path.display(),
                );
            }
            // A tiny input can be fully decoded and buffered in the pipe
            // before the check fires; that is success, not death.
        }

        // Wait for the decoder to produce bytes (or EOF for an empty stream).
        let open_timeout = self.open_timeout;
        let (reader, ready) = tokio::task::spawn_blocking(move || {
            let ready = wait_readable(&reader, open_timeout);
            (reader, ready)
        })
        .await?;
        match ready {
            Ok(true) => {},
            Ok(false) => {
                _ = child.start_kill();
                anyhow::bail!(
                    "timed out after {:?} waiting for decoder output for {}",
                    open_timeout,
                    path.display(),
                );
            },
            Err(e) => {
                _ = child.start_kill();
                return Err(e).context("polling decompression pipe");
            },
        }
        clear_nonblocking(&reader).context("clearing O_NONBLOCK on decompression pipe")?;

        Ok(DecompressedStream {
            file: tokio::fs::File::from_std(reader),
            side_process: Some(SideProcess {
                child,
                _pipe: pipe,
                _permit: permit,
            }),
        })
    }
}

/// A readable dump file, either plain or the read end of a decoder pipe.
/// Dropping it releases the pipe, the child, and the pool slot.
#[derive(Debug)]
pub struct DecompressedStream {
    file: tokio::fs::File,
    side_process: Option<SideProcess>,
}

#[derive(Debug)]
struct SideProcess {
    child: Child,
    _pipe: PipeGuard,
    _permit: OwnedSemaphorePermit,
}

impl DecompressedStream {
    pub fn reader(&mut self) -> &mut tokio::fs::File {
        &mut self.file
    }

    pub fn is_decoded(&self) -> bool {
        self.side_process.is_some()
    }

    /// Reap the decoder after reading to EOF; a failed decoder means the
    /// bytes read were truncated and the job must be treated as failed.
    pub async fn finish(mut self) -> anyhow::Result<()> {
        let Some(mut side_process) = self.side_process.take() else {
            return Ok(());
        };
        let status = side_process.child.wait().await?;
        anyhow::ensure!(status.success(), "decoder exited with {status}");
        Ok(())
    }
}

#[derive(Debug)]
struct PipeGuard {
    path: PathBuf,
}

impl Drop for PipeGuard {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::mkfifo(path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Poll `file` for readability (data or EOF) within `timeout`. Returns
/// `Ok(false)` on timeout. Polls in slices so an interrupted syscall cannot
/// stretch the deadline.
fn wait_readable(file: &std::fs::File, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut pollfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let slice_ms = remaining.as_millis().min(100) as i32;
        pollfd.revents = 0;
        let rc = unsafe { libc::poll(&mut pollfd, 1, slice_ms) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if rc == 0 {
            continue;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::other("poll error on decompression pipe"));
        }
        // POLLHUP without POLLIN is a decoder that closed without writing:
        // an empty decoded stream, which reads as immediate EOF.
        if pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            return Ok(true);
        }
    }
}

fn clear_nonblocking(file: &std::fs::File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
