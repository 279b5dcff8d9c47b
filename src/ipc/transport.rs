//! Framed peer channel over a Unix stream socket.
//!
//! Sends and receives [`Frame`]s and supports attaching a single file
//! descriptor to a frame as `SCM_RIGHTS` ancillary data. Receiving is
//! buffered so `recv` stays cancel-safe inside a `select!` loop.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd};

use bytes::BytesMut;
use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::ipc::codec::{self, Frame};
use crate::ipc::message::{MsgType, PROTOCOL_VERSION};

pub struct Peer {
    stream: UnixStream,
    inbuf: BytesMut,
}

impl Peer {
    pub fn new(stream: UnixStream) -> Peer {
        Peer {
            stream,
            inbuf: BytesMut::with_capacity(codec::MAX_FRAME_SIZE),
        }
    }

    /// Adopt a connected socket that is already in non-blocking mode.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Peer> {
        Ok(Peer::new(UnixStream::from_std(stream)?))
    }

    pub async fn send(&mut self, kind: MsgType, payload: &[u8]) -> Result<()> {
        let wire = codec::encode(kind, PROTOCOL_VERSION, payload)?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Send a frame with `fd` attached as ancillary data. The descriptor is
    /// duplicated into the receiving process by the kernel; the caller may
    /// close its copy as soon as this returns.
    pub async fn send_fd(&mut self, kind: MsgType, payload: &[u8], fd: BorrowedFd<'_>) -> Result<()> {
        let wire = codec::encode(kind, PROTOCOL_VERSION, payload)?;
        let fds = [fd.as_raw_fd()];
        let sent = loop {
            self.stream.writable().await?;
            let res = self.stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&wire)];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
            match res {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        };
        // The descriptor travels with the first byte; any remainder is plain
        // stream data.
        if sent < wire.len() {
            self.stream.write_all(&wire[sent..]).await?;
        }
        Ok(())
    }

    /// Receive the next frame. `Ok(None)` means the peer closed the channel
    /// at a frame boundary; closing mid-frame is a protocol error.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = codec::try_decode(&mut self.inbuf)? {
                return Ok(Some(frame));
            }
            let n = self.stream.read_buf(&mut self.inbuf).await?;
            if n == 0 {
                if self.inbuf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol("connection closed mid-frame".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    use nix::sys::socket::{ControlMessageOwned, RecvMsg};

    async fn pair() -> (Peer, Peer) {
        let (a, b) = UnixStream::pair().unwrap();
        (Peer::new(a), Peer::new(b))
    }

    /// Receive one message plus any SCM_RIGHTS descriptors from the raw
    /// socket on the far side of the pair.
    fn recv_with_fds(stream: &UnixStream) -> (Vec<u8>, Vec<i32>) {
        use std::io::IoSliceMut;
        let mut data = vec![0u8; 4096];
        let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 4]);
        let mut iov = [IoSliceMut::new(&mut data)];
        let msg: RecvMsg<UnixAddr> = nix::sys::socket::recvmsg(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .unwrap();
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().unwrap() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }
        let n = msg.bytes;
        data.truncate(n);
        (data, fds)
    }

    #[tokio::test]
    async fn roundtrip_frames() {
        let (mut a, mut b) = pair().await;
        a.send(MsgType::Stdout, b"payload").await.unwrap();
        a.send(MsgType::Resize, &[]).await.unwrap();
        let first = b.recv().await.unwrap().unwrap();
        assert_eq!(first.kind, MsgType::Stdout as u32);
        assert_eq!(first.peer_id, PROTOCOL_VERSION);
        assert_eq!(first.payload, b"payload");
        let second = b.recv().await.unwrap().unwrap();
        assert_eq!(second.kind, MsgType::Resize as u32);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (a, mut b) = pair().await;
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mid_frame_close_is_error() {
        let (mut a, mut b) = pair().await;
        let wire = codec::encode(MsgType::Stdout, PROTOCOL_VERSION, b"payload").unwrap();
        // Write a truncated frame straight onto the socket, then close.
        a.stream.write_all(&wire[..wire.len() - 3]).await.unwrap();
        drop(a);
        assert!(b.recv().await.is_err());
    }

    #[tokio::test]
    async fn send_fd_attaches_exactly_one_descriptor() {
        let (mut a, b) = pair().await;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();
        file.flush().unwrap();

        a.send_fd(MsgType::IdentifyStdin, &[], file.as_fd())
            .await
            .unwrap();
        // Let the non-blocking send settle before the blocking recvmsg.
        tokio::task::yield_now().await;

        let (data, fds) = recv_with_fds(&b.stream);
        assert_eq!(data.len(), codec::HEADER_SIZE);
        assert_eq!(fds.len(), 1);

        // The received descriptor refers to the same file.
        let mut received = unsafe {
            use std::os::fd::FromRawFd;
            std::fs::File::from_raw_fd(fds[0])
        };
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "through the socket");
    }

    #[tokio::test]
    async fn plain_send_carries_no_descriptor() {
        let (mut a, b) = pair().await;
        a.send(MsgType::Wakeup, &[]).await.unwrap();
        tokio::task::yield_now().await;
        let (data, fds) = recv_with_fds(&b.stream);
        assert_eq!(data.len(), codec::HEADER_SIZE);
        assert!(fds.is_empty());
    }
}
