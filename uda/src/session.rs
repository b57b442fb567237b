//! Explicit per-connection state machine. Both ends drive the same variant
//! set through `step`; an event that is not legal in the current state is a
//! protocol error and the connection must close.

use crate::errors::{Result, UdaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Authenticating,
    Idle,
    InRequest,
    AwaitingHeader,
    StreamingMeta,
    StreamingData,
    StreamingStructures,
    PostRequest,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Socket opened.
    Connect,
    /// Authentication slots inserted between Connecting and Idle.
    BeginAuth,
    /// Startup exchange (and any authentication) completed.
    Establish,
    /// CLIENT_BLOCK + REQUEST_BLOCK issued / received.
    BeginRequest,
    /// Request flushed; the server acknowledgement is next.
    AwaitReply,
    /// SERVER_BLOCK passed; metadata sidecars follow.
    Metadata,
    /// DATA_BLOCK passed.
    Data,
    /// Compound payload follows the data block.
    Structures,
    /// The request's records are fully drained.
    Finish,
    /// NEXT_PROTOCOL(SLEEP) issued; the connection idles.
    Sleep,
    /// NEXT_PROTOCOL(CLOSEDOWN), EOF, or a fatal error.
    Close,
}

impl SessionState {
    pub fn step(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent::*;
        use SessionState::*;
        let next = match (self, event) {
            (_, Close) => Closed,
            (Closed, Connect) => Connecting,
            (Connecting, BeginAuth) => Authenticating,
            (Connecting | Authenticating, Establish) => Idle,
            (Idle | Sleeping, BeginRequest) => InRequest,
            (InRequest, AwaitReply) => AwaitingHeader,
            (AwaitingHeader, Metadata) => StreamingMeta,
            (AwaitingHeader | StreamingMeta, Data) => StreamingData,
            (StreamingData, Structures) => StreamingStructures,
            (StreamingData | StreamingStructures, Finish) => PostRequest,
            (PostRequest, Sleep) => Sleeping,
            (state, event) => {
                return Err(UdaError::Protocol(format!(
                    "event {event:?} is not valid in state {state:?}"
                )))
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionState::*;

    #[test]
    fn full_request_cycle_walks_the_states() {
        let mut state = Closed;
        for event in [
            Connect,
            Establish,
            BeginRequest,
            AwaitReply,
            Metadata,
            Data,
            Structures,
            Finish,
            Sleep,
        ] {
            state = state.step(event).unwrap();
        }
        assert_eq!(state, Sleeping);
        // The next request starts straight from the sleeping state.
        assert_eq!(state.step(BeginRequest).unwrap(), InRequest);
    }

    #[test]
    fn invalid_events_are_protocol_errors() {
        assert!(Closed.step(BeginRequest).is_err());
        assert!(Idle.step(Data).is_err());
        assert!(StreamingStructures.step(Metadata).is_err());
    }

    #[test]
    fn close_is_legal_from_every_state() {
        for state in [
            Closed,
            Connecting,
            Authenticating,
            Idle,
            InRequest,
            AwaitingHeader,
            StreamingMeta,
            StreamingData,
            StreamingStructures,
            PostRequest,
            Sleeping,
        ] {
            assert_eq!(state.step(Close).unwrap(), Closed);
        }
    }

    #[test]
    fn authentication_slots_sit_between_connecting_and_idle() {
        let state = Closed.step(Connect).unwrap().step(BeginAuth).unwrap();
        assert_eq!(state, Authenticating);
        assert_eq!(state.step(Establish).unwrap(), Idle);
    }
}
