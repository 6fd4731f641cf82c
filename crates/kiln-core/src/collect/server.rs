//! Resource collection server.
//!
//! Stands in for every resource RPC surface a service can call while it is
//! under collection. Declarations and registrations are recorded into a
//! [`RequirementsRecorder`]; data-plane calls are rejected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::requirements::{RequirementsRecorder, ServiceRequirements};
use super::stream::{RegistrationStreamMachine, StreamState, Transition};
use crate::rpc::messages::{Call, Reply, Status, StreamKind, StreamMessage};
use crate::rpc::{FrameReader, FrameWriter, RpcError};

type Reader = FrameReader<BufReader<OwnedReadHalf>>;
type Writer = FrameWriter<OwnedWriteHalf>;

/// One collection server per service under collection.
pub struct CollectionServer {
    local_addr: SocketAddr,
    recorder: Arc<RequirementsRecorder>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl CollectionServer {
    /// Bind to `bind` (port 0 picks an ephemeral port) and start accepting.
    pub async fn start(
        bind: SocketAddr,
        service_name: &str,
        service_type: &str,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let recorder = Arc::new(RequirementsRecorder::new(service_name, service_type));
        let shutdown = CancellationToken::new();

        debug!(service = %service_name, addr = %local_addr, "Collection server listening");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&recorder),
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            recorder,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn recorder(&self) -> &Arc<RequirementsRecorder> {
        &self.recorder
    }

    /// Stop accepting, close open streams, and return what was collected.
    pub async fn shutdown(self) -> ServiceRequirements {
        self.shutdown.cancel();
        if let Err(err) = self.accept_task.await {
            warn!(error = %err, "Collection server task failed");
        }
        match Arc::try_unwrap(self.recorder) {
            Ok(recorder) => recorder.into_requirements(),
            Err(shared) => shared.snapshot(),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    recorder: Arc<RequirementsRecorder>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "Accepted collection connection");
                    connections.spawn(handle_connection(
                        socket,
                        Arc::clone(&recorder),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(error = %err, "Failed to accept collection connection"),
            },
        }
        while connections.try_join_next().is_some() {}
    }
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    socket: TcpStream,
    recorder: Arc<RequirementsRecorder>,
    shutdown: CancellationToken,
) {
    let (read, write) = socket.into_split();
    let mut reader = FrameReader::new(BufReader::new(read));
    let mut writer = FrameWriter::new(write);

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        served = serve_call(&mut reader, &mut writer, &recorder) => served,
    };
    if let Err(err) = result {
        debug!(error = %err, "Collection connection ended with an error");
    }
}

async fn serve_call(
    reader: &mut Reader,
    writer: &mut Writer,
    recorder: &RequirementsRecorder,
) -> Result<(), RpcError> {
    let call = match reader.next::<Call>().await {
        Ok(Some(call)) => call,
        Ok(None) => return Ok(()),
        Err(RpcError::Decode(err)) => {
            let status = Status::invalid_argument(format!("malformed call: {err}"));
            return writer.send(&Reply::Error(status)).await;
        }
        Err(err @ RpcError::FrameTooLarge { .. }) => {
            let status = Status::invalid_argument(err.to_string());
            return writer.send(&Reply::Error(status)).await;
        }
        Err(err) => return Err(err),
    };

    match call {
        Call::Declare(request) => {
            debug!(resource = %request.name, "Recorded resource declaration");
            recorder.declare(request);
            writer.send(&Reply::Ack).await
        }
        Call::Serve(kind) => serve_stream(kind, reader, writer, recorder).await,
        other => {
            let operation = other.data_plane_operation().unwrap_or("Unknown");
            let status = illegal_call(&recorder.service_name(), operation);
            warn!(operation, "{}", status.message);
            writer.send(&Reply::Error(status)).await
        }
    }
}

async fn serve_stream(
    kind: StreamKind,
    reader: &mut Reader,
    writer: &mut Writer,
    recorder: &RequirementsRecorder,
) -> Result<(), RpcError> {
    let mut machine = RegistrationStreamMachine::new(kind);
    loop {
        let message = match reader.next::<StreamMessage>().await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(RpcError::Decode(err)) if machine.state() == StreamState::AwaitingRegistration => {
                let status = Status::invalid_argument(format!("malformed stream message: {err}"));
                return writer.send(&Reply::Error(status)).await;
            }
            Err(err @ RpcError::FrameTooLarge { .. }) => {
                warn!(stream = %kind, error = %err, "Closing stream");
                let status = Status::invalid_argument(err.to_string());
                return writer.send(&Reply::Error(status)).await;
            }
            Err(err) => return Err(err),
        };

        match machine.on_message(message) {
            Transition::Register(registration) => {
                debug!(stream = %kind, "Recorded registration");
                recorder.register(registration);
                writer
                    .send(&RegistrationStreamMachine::acknowledgement())
                    .await?;
            }
            Transition::Violation(status) => {
                warn!(stream = %kind, "{}", status.message);
                return writer.send(&Reply::Error(status)).await;
            }
            Transition::Ignore => debug!(stream = %kind, "Ignoring message on registered stream"),
        }
    }
}

/// Error returned for any data-plane call made while under collection.
pub fn illegal_call(service: &str, operation: &str) -> Status {
    Status::failed_precondition(format!(
        "service {service} attempted to call {operation} at build time: \
         runtime calls are not allowed while requirements are being collected"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::Code;

    #[test]
    fn illegal_call_names_service_and_operation() {
        let status = illegal_call("proj_orders", "Storage::Write");
        assert_eq!(status.code, Code::FailedPrecondition);
        assert!(status.message.contains("proj_orders"));
        assert!(status.message.contains("Storage::Write"));
    }
}
