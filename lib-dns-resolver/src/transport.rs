//! The transport adapter: one query datagram out, one response
//! datagram back, over UDP.  Stateless - a fresh ephemeral socket is
//! bound for every exchange, so concurrent resolutions cannot see
//! each other's responses.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use dns_wire::deserialise;
use dns_wire::types::{Message, MAX_DATAGRAM_SIZE};

/// Overall deadline for one exchange, covering the send and however
/// many receives it takes to see a matching transaction id.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A nameserver endpoint to exchange single datagrams with.  One
/// exchange may be outstanding per call; the adapter holds no state
/// between exchanges.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Upstream {
    address: SocketAddr,
}

impl Upstream {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    /// Resolve a `host:port` endpoint string, as found in
    /// configuration, taking the first address it yields.
    pub async fn lookup(endpoint: &str) -> Result<Self, ExchangeError> {
        match lookup_host(endpoint).await {
            Ok(mut addresses) => match addresses.next() {
                Some(address) => Ok(Self { address }),
                None => Err(ExchangeError::Unresolvable(None)),
            },
            Err(error) => Err(ExchangeError::Unresolvable(Some(error))),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Send the encoded query and wait for the response carrying the
    /// same transaction id.  Datagrams with any other id are
    /// discarded and the wait continues - a response from a previous
    /// timed-out exchange, or a spoof attempt, must not be taken for
    /// the answer.
    ///
    /// The result keeps the raw datagram beside the decoded message
    /// so that names embedded in RDATA can be scanned later.
    pub async fn exchange(&self, query: &Message) -> Result<Exchange, ExchangeError> {
        match timeout(EXCHANGE_TIMEOUT, self.exchange_notimeout(query)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Receive(io::ErrorKind::TimedOut.into())),
        }
    }

    /// Timeout-less version of `exchange`.
    async fn exchange_notimeout(&self, query: &Message) -> Result<Exchange, ExchangeError> {
        let serialised = query.to_octets();

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(ExchangeError::Send)?;
        socket
            .connect(self.address)
            .await
            .map_err(ExchangeError::Send)?;
        socket
            .send(&serialised)
            .await
            .map_err(ExchangeError::Send)?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let size = socket.recv(&mut buf).await.map_err(ExchangeError::Receive)?;
            let datagram = Bytes::copy_from_slice(&buf[..size]);
            let message = Message::from_octets(&datagram).map_err(ExchangeError::Decode)?;

            if message.header.id == query.header.id {
                return Ok(Exchange { message, datagram });
            }

            tracing::debug!(
                got = %message.header.id,
                expected = %query.header.id,
                "discarding datagram with mismatched transaction id"
            );
        }
    }
}

/// A completed exchange: the decoded response and the datagram it
/// was decoded from.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub message: Message,
    pub datagram: Bytes,
}

/// An error that can occur during a single exchange.
#[derive(Debug)]
pub enum ExchangeError {
    /// The endpoint string did not resolve to an address.
    Unresolvable(Option<io::Error>),
    /// Binding, connecting, or sending the query datagram failed.
    Send(io::Error),
    /// Receiving the response datagram failed, including hitting the
    /// exchange deadline.
    Receive(io::Error),
    /// The response datagram was malformed.
    Decode(deserialise::Error),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExchangeError::Unresolvable(Some(error)) => {
                write!(f, "could not resolve endpoint: {error}")
            }
            ExchangeError::Unresolvable(None) => {
                write!(f, "endpoint resolved to no addresses")
            }
            ExchangeError::Send(error) => write!(f, "could not send query: {error}"),
            ExchangeError::Receive(error) => write!(f, "could not receive response: {error}"),
            ExchangeError::Decode(error) => write!(f, "could not decode response: {error}"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::Unresolvable(Some(error))
            | ExchangeError::Send(error)
            | ExchangeError::Receive(error) => Some(error),
            ExchangeError::Unresolvable(None) => None,
            ExchangeError::Decode(error) => Some(error),
        }
    }
}
