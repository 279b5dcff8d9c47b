//! End-to-end client scenarios against a scripted fake server.
//!
//! The fake server speaks the wire format straight through the codec rather
//! than the client's `Peer`, so these tests also pin down the frame layout.

use std::os::fd::FromRawFd;
use std::path::PathBuf;

use bytes::BytesMut;
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use rmx::client::bringup::ServerStart;
use rmx::client::{self, ClientOptions};
use rmx::ipc::codec::{self, Frame};
use rmx::ipc::message::{ClientFlags, MsgType, PROTOCOL_VERSION};

struct NeverStart;

impl ServerStart for NeverStart {
    fn start(&self, _socket_path: &std::path::Path) -> std::io::Result<std::os::unix::net::UnixStream> {
        panic!("server start not expected");
    }
}

struct FakeServer {
    stream: UnixStream,
    buf: BytesMut,
}

impl FakeServer {
    async fn accept(listener: &UnixListener) -> FakeServer {
        let (stream, _) = listener.accept().await.unwrap();
        FakeServer {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = codec::try_decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            if n == 0 {
                assert!(self.buf.is_empty(), "client closed mid-frame");
                return None;
            }
        }
    }

    async fn expect(&mut self, kind: MsgType) -> Frame {
        let frame = self.recv().await.expect("client closed the channel");
        assert_eq!(
            frame.kind, kind as u32,
            "expected {kind:?}, got {:?}",
            MsgType::from_raw(frame.kind)
        );
        frame
    }

    async fn send_as(&mut self, kind: MsgType, peer_id: u32, payload: &[u8]) {
        let wire = codec::encode(kind, peer_id, payload).unwrap();
        self.stream.write_all(&wire).await.unwrap();
    }

    async fn send(&mut self, kind: MsgType, payload: &[u8]) {
        self.send_as(kind, PROTOCOL_VERSION, payload).await;
    }

    /// Consume the identify burst, asserting its fixed order, and return the
    /// flags word.
    async fn read_identify(&mut self) -> u32 {
        let flags = self.expect(MsgType::IdentifyFlags).await;
        assert_eq!(flags.payload.len(), 4);
        let flags = u32::from_ne_bytes(flags.payload.try_into().unwrap());

        for kind in [
            MsgType::IdentifyTerm,
            MsgType::IdentifyTtyName,
            MsgType::IdentifyCwd,
        ] {
            let frame = self.expect(kind).await;
            assert_eq!(*frame.payload.last().unwrap(), 0);
        }

        let stdin = self.expect(MsgType::IdentifyStdin).await;
        assert!(stdin.payload.is_empty());

        let pid = self.expect(MsgType::IdentifyClientPid).await;
        assert_eq!(pid.payload.len(), 4);

        loop {
            let frame = self.recv().await.unwrap();
            match MsgType::from_raw(frame.kind) {
                Some(MsgType::IdentifyEnviron) => {
                    assert_eq!(*frame.payload.last().unwrap(), 0);
                }
                Some(MsgType::IdentifyDone) => {
                    assert!(frame.payload.is_empty());
                    return flags;
                }
                other => panic!("unexpected frame in identify burst: {other:?}"),
            }
        }
    }
}

fn options(socket_path: PathBuf, command: &[&str]) -> ClientOptions {
    ClientOptions {
        socket_path,
        flags: ClientFlags::empty(),
        shell_command: None,
        command: command.iter().map(|s| s.to_string()).collect(),
    }
}

fn listener() -> (tempfile::TempDir, PathBuf, UnixListener) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    let listener = UnixListener::bind(&path).unwrap();
    (dir, path, listener)
}

#[tokio::test]
#[serial]
async fn clean_attach_and_detach() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;

        let command = server.expect(MsgType::Command).await;
        assert_eq!(&command.payload[..4], &1u32.to_ne_bytes());
        assert_eq!(&command.payload[4..], b"attach-session\0");

        server.send(MsgType::Ready, &[]).await;
        server.expect(MsgType::Resize).await;

        server.send(MsgType::Detach, b"work\0").await;
        server.expect(MsgType::Exiting).await;
        server.send(MsgType::Exited, &[]).await;
    });

    let code = client::run(options(path, &["attach-session"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 0);
    server.await.unwrap();
}

#[tokio::test]
#[serial]
async fn version_mismatch_exits_one() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;
        server.expect(MsgType::Command).await;
        server.send_as(MsgType::Version, 7, &[]).await;
    });

    let code = client::run(options(path, &["list-sessions"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 1);
    server.await.unwrap();
}

#[tokio::test]
#[serial]
async fn vanished_server_reports_lost_server() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;
        server.expect(MsgType::Command).await;
        server.send(MsgType::Ready, &[]).await;
        server.expect(MsgType::Resize).await;
        // Die without a word.
    });

    let code = client::run(options(path, &["attach-session"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 1);
    server.await.unwrap();
}

#[tokio::test]
#[serial]
async fn server_shutdown_while_attached() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;
        server.expect(MsgType::Command).await;
        server.send(MsgType::Ready, &[]).await;
        server.expect(MsgType::Resize).await;
        server.send(MsgType::Shutdown, &[]).await;
        server.expect(MsgType::Exiting).await;
        server.send(MsgType::Exited, &[]).await;
    });

    let code = client::run(options(path, &["attach-session"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 1);
    server.await.unwrap();
}

#[tokio::test]
#[serial]
async fn identify_reports_flags() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let flags = server.read_identify().await;
        assert_eq!(flags & 0x1, 0x1);
        server.expect(MsgType::Command).await;
        server.send(MsgType::Exit, &[]).await;
    });

    let mut opts = options(path, &["list-sessions"]);
    opts.flags.insert(ClientFlags::LOGIN);
    let code = client::run(opts, &NeverStart).await.unwrap();
    assert_eq!(code, 0);
    server.await.unwrap();
}

#[tokio::test]
#[serial]
async fn sigterm_while_attached_exits_one() {
    let (_dir, path, listener) = listener();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;
        server.expect(MsgType::Command).await;
        server.send(MsgType::Ready, &[]).await;
        server.expect(MsgType::Resize).await;

        // The client is attached now; terminate it from outside.
        unsafe { libc::raise(libc::SIGTERM) };

        server.expect(MsgType::Exiting).await;
        server.send(MsgType::Exited, &[]).await;
    });

    let code = client::run(options(path, &["attach-session"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 1);
    server.await.unwrap();
}

/// Redirect fd 0 at a pipe for the duration of a flow-control test.
struct StdinRedirect {
    saved: i32,
}

impl StdinRedirect {
    fn to_pipe() -> (StdinRedirect, std::fs::File) {
        unsafe {
            let mut fds = [0i32; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            let saved = libc::dup(libc::STDIN_FILENO);
            assert!(saved >= 0);
            assert!(libc::dup2(fds[0], libc::STDIN_FILENO) >= 0);
            libc::close(fds[0]);
            (
                StdinRedirect { saved },
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }
}

impl Drop for StdinRedirect {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved, libc::STDIN_FILENO);
            libc::close(self.saved);
        }
    }
}

#[tokio::test]
#[serial]
async fn stdin_flow_control_forwards_until_eof() {
    use std::io::Write;

    let (_dir, path, listener) = listener();

    let (redirect, mut writer) = StdinRedirect::to_pipe();
    writer.write_all(b"hi").unwrap();
    drop(writer);

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.read_identify().await;
        server.expect(MsgType::Command).await;

        // Ask for input; the pump starts paused.
        server.send(MsgType::Stdin, &[]).await;

        let chunk = server.expect(MsgType::Stdin).await;
        assert_eq!(&chunk.payload[..8], &2i64.to_ne_bytes());
        assert_eq!(&chunk.payload[8..], b"hi");

        let eof = server.expect(MsgType::Stdin).await;
        assert_eq!(eof.payload, 0i64.to_ne_bytes());

        server.send(MsgType::Exit, &5i32.to_ne_bytes()).await;
    });

    let code = client::run(options(path, &["list-sessions"]), &NeverStart)
        .await
        .unwrap();
    assert_eq!(code, 5);
    server.await.unwrap();
    drop(redirect);
}
