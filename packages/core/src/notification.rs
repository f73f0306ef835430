//! UDP notification datagrams.
//!
//! A datagram is a short form-encoded payload:
//! `reason=get&queue=<name>&ns_node=<host:port>`. There is no
//! acknowledgement and no ordering guarantee; receivers drop anything
//! they cannot parse.

use url::form_urlencoded;

use crate::address::ServerAddress;
use crate::error::ProtocolError;

/// Largest datagram a receiver needs to accept.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// What became available on the originating server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A job can be fetched with `GET2`.
    Get,
    /// A finished job can be fetched with `READ`.
    Read,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Get => "get",
            NotificationKind::Read => "read",
        }
    }
}

/// One notification datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub queue: String,
    /// Originating server.
    pub server: ServerAddress,
}

impl Notification {
    pub fn new(kind: NotificationKind, queue: impl Into<String>, server: ServerAddress) -> Self {
        Self {
            kind,
            queue: queue.into(),
            server,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("reason", self.kind.as_str())
            .append_pair("queue", &self.queue)
            .append_pair("ns_node", &self.server.to_string())
            .finish()
            .into_bytes()
    }

    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut kind = None;
        let mut queue = None;
        let mut server = None;
        for (key, value) in form_urlencoded::parse(datagram) {
            match key.as_ref() {
                "reason" => {
                    kind = Some(match value.as_ref() {
                        "get" => NotificationKind::Get,
                        "read" => NotificationKind::Read,
                        other => return Err(ProtocolError::invalid("reason", other)),
                    })
                }
                "queue" => queue = Some(value.into_owned()),
                "ns_node" => server = Some(value.parse::<ServerAddress>()?),
                _ => {}
            }
        }
        Ok(Notification {
            kind: kind.ok_or(ProtocolError::MissingField("reason"))?,
            queue: queue.ok_or(ProtocolError::MissingField("queue"))?,
            server: server.ok_or(ProtocolError::MissingField("ns_node"))?,
        })
    }
}
