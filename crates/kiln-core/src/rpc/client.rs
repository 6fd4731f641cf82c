//! Client half of the collection channel.
//!
//! Used by tooling and tests to act as a service SDK would: declare resources,
//! open registration streams, and attempt data-plane calls.

use std::net::SocketAddr;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::messages::{
    Call, DeclareRequest, Registration, Reply, ResourceDeclaration, StreamKind, StreamMessage,
};
use super::{FrameReader, FrameWriter, RpcError};

#[derive(Debug, Clone, Copy)]
pub struct CollectionClient {
    addr: SocketAddr,
}

impl CollectionClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Declare a resource and wait for the acknowledgement.
    pub async fn declare(&self, name: &str, resource: ResourceDeclaration) -> Result<(), RpcError> {
        self.unary(Call::Declare(DeclareRequest::new(name, resource)))
            .await
    }

    /// Issue a single call and map an error reply to [`RpcError::Rejected`].
    pub async fn unary(&self, call: Call) -> Result<(), RpcError> {
        let mut conn = Connection::open(self.addr).await?;
        conn.writer.send(&call).await?;
        match conn.reader.next::<Reply>().await? {
            Some(Reply::Error(status)) => Err(RpcError::Rejected(status)),
            Some(_) => Ok(()),
            None => Err(RpcError::Closed),
        }
    }

    /// Open a registration stream without sending anything on it yet.
    pub async fn open_stream(&self, kind: StreamKind) -> Result<RegistrationStream, RpcError> {
        let mut conn = Connection::open(self.addr).await?;
        conn.writer.send(&Call::Serve(kind)).await?;
        Ok(RegistrationStream { conn })
    }

    /// Open a stream of the registration's kind and register on it.
    ///
    /// The returned stream stays open until dropped, like a live handler.
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<RegistrationStream, RpcError> {
        let mut stream = self.open_stream(registration.stream_kind()).await?;
        stream
            .send(&StreamMessage::RegistrationRequest(registration))
            .await?;
        match stream.recv().await? {
            Some(Reply::RegistrationResponse) => Ok(stream),
            Some(Reply::Error(status)) => Err(RpcError::Rejected(status)),
            Some(Reply::Ack) | None => Err(RpcError::Closed),
        }
    }
}

/// An open registration stream.
pub struct RegistrationStream {
    conn: Connection,
}

impl RegistrationStream {
    pub async fn send(&mut self, message: &StreamMessage) -> Result<(), RpcError> {
        self.conn.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<Reply>, RpcError> {
        self.conn.reader.next().await
    }

    /// Close the client side of the stream.
    pub async fn close(mut self) -> Result<(), RpcError> {
        self.conn.writer.close().await
    }
}

struct Connection {
    reader: FrameReader<BufReader<OwnedReadHalf>>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(BufReader::new(read)),
            writer: FrameWriter::new(write),
        })
    }
}
