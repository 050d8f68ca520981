use std::io::{self, IoSlice};
use std::net::{Shutdown, SocketAddr};

use bytes::BytesMut;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

use super::ByteChannel;

impl ByteChannel for TcpStream {
    fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.try_read_buf(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.try_write_vectored(bufs)
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        TcpStream::ready(self, interest).await
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        socket2::SockRef::from(self).shutdown(how)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}
