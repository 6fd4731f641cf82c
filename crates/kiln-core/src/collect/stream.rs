//! Registration stream state machine.
//!
//! A registration stream must open with a registration request of the
//! stream's own kind. Anything else is a protocol violation that ends the
//! stream; after registration, further messages are ignored because no
//! events are ever delivered while a service is under collection.

use crate::rpc::messages::{Registration, Reply, Status, StreamKind, StreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingRegistration,
    Registered,
    Closed,
}

/// What the server should do after a message was received.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Record the registration and reply with a registration response.
    Register(Registration),
    /// Reply with the error and close the stream.
    Violation(Status),
    /// Nothing to do.
    Ignore,
}

#[derive(Debug)]
pub struct RegistrationStreamMachine {
    kind: StreamKind,
    state: StreamState,
}

impl RegistrationStreamMachine {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            state: StreamState::AwaitingRegistration,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn on_message(&mut self, message: StreamMessage) -> Transition {
        match (self.state, message) {
            (StreamState::AwaitingRegistration, StreamMessage::RegistrationRequest(reg))
                if reg.stream_kind() == self.kind =>
            {
                self.state = StreamState::Registered;
                Transition::Register(reg)
            }
            (StreamState::AwaitingRegistration, StreamMessage::RegistrationRequest(reg)) => {
                self.state = StreamState::Closed;
                Transition::Violation(Status::invalid_argument(format!(
                    "{} stream received a {} registration",
                    self.kind,
                    reg.stream_kind()
                )))
            }
            (StreamState::AwaitingRegistration, StreamMessage::EventResponse(_)) => {
                self.state = StreamState::Closed;
                Transition::Violation(Status::invalid_argument(format!(
                    "first message on a {} stream must be a registration request",
                    self.kind
                )))
            }
            (StreamState::Registered, _) | (StreamState::Closed, _) => Transition::Ignore,
        }
    }

    /// Reply sent for a successful registration.
    pub fn acknowledgement() -> Reply {
        Reply::RegistrationResponse
    }
}
