//! Local control socket for the watched address.
//!
//! One request per connection, one line each way:
//! `get` answers the stored address, `set <value>` answers `ok` or
//! `error: <reason>`. The socket is created owner-only.

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::Error;
use crate::param::Param;

const SOCKET_MODE: u32 = 0o600;

/// How long a client may take to send its request or read the reply.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server<B: Backend> {
    listener: UnixListener,
    path: PathBuf,
    param: Param<B>,
    timeout: Duration,
}

impl<B: Backend> Server<B> {
    pub fn bind<P: AsRef<Path>>(path: P, param: Param<B>) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let io_err = |e| Error::Io(path.clone(), e);

        // a socket left behind by an earlier run; anything else is not ours
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                fs::remove_file(&path).map_err(io_err)?;
            }
        }

        let listener = UnixListener::bind(&path).map_err(io_err)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(SOCKET_MODE)).map_err(io_err)?;

        tracing::info!("control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            param,
            timeout: CLIENT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves requests one at a time, for as long as the process runs.
    pub fn serve(&self) {
        self.serve_while(|| true)
    }

    /// Serves requests one at a time while `running` holds. Accept failures
    /// are logged and retried after a short pause.
    pub fn serve_while<F: FnMut() -> bool>(&self, mut running: F) {
        while running() {
            if let Err(err) = self.serve_next() {
                tracing::warn!("control socket accept failed: {}", err);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }

    /// Accepts and answers a single request. Failures on the connection
    /// itself are logged and do not stop the server.
    pub fn serve_next(&self) -> Result<(), Error> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| Error::Io(self.path.clone(), e))?;

        if let Err(err) = self.handle(stream) {
            tracing::warn!("control connection failed: {}", err);
        }
        Ok(())
    }

    fn handle(&self, stream: UnixStream) -> io::Result<()> {
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line)?;

        let reply = self.respond(line.trim());
        let mut stream = stream;
        stream.write_all(reply.as_bytes())?;
        stream.write_all(b"\n")
    }

    pub fn respond(&self, request: &str) -> String {
        let mut parts = request.splitn(2, char::is_whitespace);
        match (parts.next(), parts.next().map(str::trim)) {
            (Some("get"), None) => self.param.show(),
            (Some("set"), Some(value)) if !value.is_empty() => match self.param.set(value) {
                Ok(()) => "ok".to_owned(),
                Err(err) => {
                    tracing::warn!("rejected write `{}`: {}", value, err);
                    format!("error: {}", err)
                }
            },
            _ => "error: unknown command".to_owned(),
        }
    }
}

/// Sends one request to a running server and returns its reply line.
pub fn request<P: AsRef<Path>>(path: P, line: &str) -> Result<String, Error> {
    let path = path.as_ref();
    let io_err = |e| Error::Io(path.to_owned(), e);

    let mut stream = UnixStream::connect(path).map_err(io_err)?;
    stream.write_all(line.as_bytes()).map_err(io_err)?;
    stream.write_all(b"\n").map_err(io_err)?;
    stream.shutdown(Shutdown::Write).map_err(io_err)?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).map_err(io_err)?;

    let reply = reply.trim();
    if let Some(reason) = reply.strip_prefix("error: ") {
        Err(Error::Control(reason.to_owned()))
    } else {
        Ok(reply.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::event::Event;
    use crate::test_utils::{manager, FakeBackend, RecordingSink};

    fn server(
        dir: &tempfile::TempDir,
    ) -> (Server<FakeBackend>, FakeBackend, Arc<RecordingSink>) {
        let backend = FakeBackend::default();
        let events = Arc::new(RecordingSink::default());
        let manager = manager(&backend, &events);
        manager.configure(0).unwrap();
        events.take();

        let server = Server::bind(dir.path().join("mwatch.sock"), Param::new(manager)).unwrap();
        (server, backend, events)
    }

    #[test]
    fn socket_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _) = server(&dir);

        let mode = fs::metadata(server.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);
    }

    #[test]
    fn replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _, _) = server(&dir);
        drop(first);

        let (second, _, _) = server(&dir);
        assert!(second.path().exists());
    }

    #[test]
    fn answers_protocol_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (server, backend, events) = server(&dir);

        assert_eq!(server.respond("get"), "0x0");
        assert_eq!(server.respond("set 0x1000"), "ok");
        assert_eq!(server.respond("get"), "0x1000");
        assert!(server.respond("set bogus").starts_with("error: unable to parse"));
        assert_eq!(server.respond("set"), "error: unknown command");
        assert_eq!(server.respond("frobnicate"), "error: unknown command");

        backend.fail_next(Errno::ENOSPC);
        assert!(server
            .respond("set 0x2000")
            .starts_with("error: failed to register"));

        let writes = events
            .take()
            .into_iter()
            .filter(|e| matches!(e, Event::ParamWrite { .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn round_trips_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _) = server(&dir);
        let path = server.path().to_owned();

        let worker = thread::spawn(move || {
            server.serve_next().unwrap();
            server.serve_next().unwrap();
            server.serve_next().unwrap();
            server
        });

        assert_eq!(request(&path, "set 0x4000").unwrap(), "ok");
        assert_eq!(request(&path, "get").unwrap(), "0x4000");
        assert!(matches!(
            request(&path, "set 0xq"),
            Err(Error::Control(reason)) if reason.contains("0xq")
        ));

        let server = worker.join().unwrap();
        assert_eq!(server.param.get(), 0x4000);
    }

    #[test]
    fn silent_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _) = server(&dir);
        let server = server.with_timeout(Duration::from_millis(50));
        let path = server.path().to_owned();

        let worker = thread::spawn(move || {
            server.serve_next().unwrap();
            server.serve_next().unwrap();
        });

        // connects but never finishes a request line
        let mut idle = UnixStream::connect(&path).unwrap();
        idle.write_all(b"set 0x").unwrap();

        assert_eq!(request(&path, "set 0x5000").unwrap(), "ok");
        worker.join().unwrap();
        drop(idle);
    }

    #[test]
    fn accept_failures_do_not_stop_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _) = server(&dir);

        // with nothing pending, a non-blocking accept fails every time
        server.listener.set_nonblocking(true).unwrap();
        let mut attempts = 0;
        server.serve_while(|| {
            attempts += 1;
            attempts <= 3
        });
        assert_eq!(attempts, 4);

        server.listener.set_nonblocking(false).unwrap();
        let path = server.path().to_owned();
        let worker = thread::spawn(move || {
            let mut served = false;
            server.serve_while(|| !std::mem::replace(&mut served, true));
            server
        });

        assert_eq!(request(&path, "set 0x6000").unwrap(), "ok");
        let server = worker.join().unwrap();
        assert_eq!(server.param.get(), 0x6000);
    }

    #[test]
    fn rejected_write_keeps_registration() {
        let dir = tempfile::tempdir().unwrap();
        let (server, backend, _) = server(&dir);

        server.respond("set 0x1000");
        server.respond("set nope");

        assert_eq!(backend.live(), 1);
        assert_eq!(backend.last_breakpoint().map(|bp| bp.address()), Some(0x1000));
        assert_eq!(server.param.get(), 0x1000);
    }
}
