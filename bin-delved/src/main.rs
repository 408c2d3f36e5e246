use bytes::Bytes;
use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use dns_resolver::{resolve, Upstream};
use dns_wire::types::*;

/// Whether to answer from the hardcoded delegation table or to run
/// the iterative resolver.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Mode {
    Upstream,
    Recursive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Upstream => write!(f, "upstream"),
            Mode::Recursive => write!(f, "recursive"),
        }
    }
}

impl FromStr for Mode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(Mode::Upstream),
            "recursive" => Ok(Mode::Recursive),
            _ => Err("expected one of 'upstream', 'recursive'"),
        }
    }
}

/// What upstream mode serves, whatever the question: a delegation of
/// `com.` pointing at Google's public resolver, plus the matching A
/// record.  The NS RDATA is the bare address form the resolver
/// accepts in place of a nameserver name.
fn delegation_table() -> Vec<ResourceRecord> {
    let google = Ipv4Addr::new(8, 8, 8, 8);
    vec![
        ResourceRecord {
            name: DomainName::from_dotted_string("com.").unwrap(),
            rtype: RecordType::NS,
            rclass: RecordClass::IN,
            ttl: 300,
            data: Bytes::copy_from_slice(&google.octets()),
        },
        ResourceRecord {
            name: DomainName::from_dotted_string("dns.google.com.").unwrap(),
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl: 300,
            data: Bytes::copy_from_slice(&google.octets()),
        },
    ]
}

/// Work out which question to answer.  A message with no questions
/// gets an empty response; more than one question is refused, since
/// answering some and silently dropping the rest would be worse.
fn triage(query: &Message) -> Result<Option<&Question>, Rcode> {
    match query.questions.len() {
        0 => Ok(None),
        1 => Ok(Some(&query.questions[0])),
        _ => Err(Rcode::NotImplemented),
    }
}

async fn respond(args: &ListenArgs, query: &Message) -> Message {
    let mut response = query.make_response();
    response.header.recursion_available = args.mode == Mode::Recursive;

    match triage(query) {
        Err(rcode) => {
            tracing::info!(questions = %query.questions.len(), %rcode, "refusing query");
            response.header.rcode = rcode;
        }
        Ok(None) => (),
        Ok(Some(question)) => match args.mode {
            Mode::Upstream => {
                tracing::info!(%question, "answering from delegation table");
                response.answers = delegation_table();
            }
            Mode::Recursive => {
                match resolve(args.bootstrap, args.upstream_port, question).await {
                    Ok(answer) => {
                        tracing::info!(%question, answers = %answer.answers.len(), "resolved");
                        response.answers = answer.answers;
                        response.authority = answer.authority;
                        response.additional = answer.additional;
                    }
                    Err(error) => {
                        tracing::info!(%question, %error, "resolution failed");
                        response.header.rcode = Rcode::ServerFailure;
                    }
                }
            }
        },
    }

    response.sync_counts();
    response
}

async fn handle_raw_message(args: &ListenArgs, buf: &[u8]) -> Option<Message> {
    match Message::from_octets(buf) {
        Ok(msg) => {
            if msg.header.is_response {
                // Do not respond to response messages: an inbound
                // message could spoof its source address / port to
                // match this server's, and so make it respond to
                // itself, which triggers another response, etc
                None
            } else if msg.header.opcode == Opcode::Standard {
                Some(respond(args, &msg).await)
            } else {
                let mut response = msg.make_response();
                response.header.rcode = Rcode::NotImplemented;
                response.sync_counts();
                Some(response)
            }
        }
        Err(error) => {
            tracing::debug!(%error, "could not decode query");
            error.id().map(Message::make_format_error_response)
        }
    }
}

async fn listen_udp_task(args: Arc<ListenArgs>, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((size, peer)) => {
                tracing::debug!(?peer, "UDP request");
                let datagram = buf[..size].to_vec();
                let socket = socket.clone();
                let args = args.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_raw_message(&args, &datagram).await {
                        if let Err(error) = socket.send_to(&response.to_octets(), peer).await {
                            tracing::debug!(?peer, ?error, "UDP send error");
                        }
                    }
                });
            }
            Err(error) => tracing::debug!(?error, "UDP recv error"),
        }
    }
}

/// Arguments for `listen_udp_task` and the responder.
#[derive(Debug, Copy, Clone)]
struct ListenArgs {
    mode: Mode,
    bootstrap: SocketAddr,
    upstream_port: u16,
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        var.split(',').map(String::from).collect()
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        logger.json().init();
    } else if log_format.contains("compact") {
        logger.compact().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A toy DNS server.
///
/// In "upstream" mode it answers every query from a hardcoded
/// delegation table, which makes it a bootstrap endpoint for testing
/// the resolver.  In "recursive" mode it resolves each question
/// iteratively, following delegation chains from the bootstrap
/// endpoint, and relays the final answer.
///
/// It speaks UDP only, and it does not support IPv6 nameservers.
struct Args {
    /// Interface to listen on (in `ip:port` form)
    #[clap(short, long, value_parser, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 5003)), env = "DELVED_INTERFACE")]
    interface: SocketAddr,

    /// Answer from the delegation table ("upstream") or run the
    /// iterative resolver ("recursive")
    #[clap(short, long, value_parser, default_value_t = Mode::Recursive, env = "DELVED_MODE")]
    mode: Mode,

    /// Nameserver to start every resolution from (in `host:port`
    /// form); only consulted in recursive mode
    #[clap(
        short,
        long,
        value_parser,
        default_value = "127.0.0.1:5005",
        env = "DELVED_BOOTSTRAP_ENDPOINT"
    )]
    bootstrap_endpoint: String,

    /// Which port to contact follow-up nameservers on
    #[clap(long, value_parser, default_value_t = 53, env = "DELVED_UPSTREAM_DNS_PORT")]
    upstream_dns_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let bootstrap = match Upstream::lookup(&args.bootstrap_endpoint).await {
        Ok(upstream) => upstream.address(),
        Err(error) => {
            tracing::error!(endpoint = %args.bootstrap_endpoint, %error, "could not resolve bootstrap endpoint");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, mode = %args.mode, "binding DNS UDP socket");
    let udp = match UdpSocket::bind(args.interface).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    let listen_args = Arc::new(ListenArgs {
        mode: args.mode,
        bootstrap,
        upstream_port: args.upstream_dns_port,
    });

    listen_udp_task(listen_args, udp).await;
}

#[cfg(test)]
mod tests {
    use dns_wire::types::test_util::*;

    use super::*;

    fn test_args(mode: Mode) -> ListenArgs {
        ListenArgs {
            mode,
            bootstrap: SocketAddr::from((Ipv4Addr::LOCALHOST, 5005)),
            upstream_port: 53,
        }
    }

    #[test]
    fn triage_accepts_zero_or_one_question() {
        let mut query = Message::from_question(1, question("example.com", RecordType::A));

        assert!(matches!(triage(&query), Ok(Some(_))));

        query.questions.clear();
        query.sync_counts();
        assert!(matches!(triage(&query), Ok(None)));
    }

    #[test]
    fn triage_refuses_multiple_questions() {
        let mut query = Message::from_question(1, question("example.com", RecordType::A));
        query.questions.push(question("example.net", RecordType::A));
        query.sync_counts();

        assert_eq!(Err(Rcode::NotImplemented), triage(&query));
    }

    #[test]
    fn delegation_table_rdata_shapes() {
        let table = delegation_table();

        assert_eq!(RecordType::NS, table[0].rtype);
        assert_eq!(4, table[0].data.len());
        assert_eq!(
            Some(Ipv4Addr::new(8, 8, 8, 8)),
            table[1].a_address()
        );
    }

    #[tokio::test]
    async fn upstream_mode_answers_from_the_table() {
        let query = Message::from_question(7, question("dns.google.com", RecordType::A));
        let response = respond(&test_args(Mode::Upstream), &query).await;

        assert!(response.header.is_response);
        assert_eq!(7, response.header.id);
        assert_eq!(2, response.header.ancount);
        assert_eq!(delegation_table(), response.answers);
        assert!(!response.header.recursion_available);
    }

    #[tokio::test]
    async fn multi_question_query_is_not_implemented() {
        let mut query = Message::from_question(7, question("example.com", RecordType::A));
        query.questions.push(question("example.net", RecordType::A));
        query.sync_counts();

        let response = respond(&test_args(Mode::Upstream), &query).await;

        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn non_standard_opcode_is_not_implemented() {
        let mut query = Message::from_question(7, question("example.com", RecordType::A));
        query.header.opcode = Opcode::Status;

        let response = handle_raw_message(&test_args(Mode::Upstream), &query.to_octets())
            .await
            .unwrap();

        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[tokio::test]
    async fn responses_are_dropped() {
        let mut query = Message::from_question(7, question("example.com", RecordType::A));
        query.header.is_response = true;

        assert!(handle_raw_message(&test_args(Mode::Upstream), &query.to_octets())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn undecodable_query_gets_format_error() {
        // a header promising a question that is not there
        let datagram = [0, 9, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];

        let response = handle_raw_message(&test_args(Mode::Upstream), &datagram)
            .await
            .unwrap();

        assert_eq!(9, response.header.id);
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }
}
