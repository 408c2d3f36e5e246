//! The iterative resolver.  Starting from a bootstrap nameserver it
//! repeats: send the question, and either accept a matching answer
//! or chase the best delegation the response offers.
//!
//! Delegations are NS records.  Their RDATA is properly a nameserver
//! name, resolved through glue in the additional section or, failing
//! that, a sub-resolution; but the hardcoded delegation tables this
//! grew up against put a bare IPv4 address there instead, so a
//! 4-octet RDATA that does not scan as a name is still honoured as
//! one.

use async_recursion::async_recursion;
use rand::Rng;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use dns_wire::deserialise::rdata_offsets;
use dns_wire::types::*;

use crate::transport::{Exchange, ExchangeError, Upstream};

/// Maximum number of exchanges one `resolve` call may make, counting
/// nameserver-name sub-resolutions.  Guards against malicious
/// delegation cycles.
pub const MAX_HOPS: usize = 16;

/// Iteratively resolve a question, starting from the bootstrap
/// endpoint.  Each hop issues a fresh standard query (new random id,
/// recursion desired) and waits for its response before deciding the
/// next endpoint, which is contacted on `upstream_port`.
///
/// Resolution never retries a failed hop: any exchange failure fails
/// the whole call.
///
/// # Errors
///
/// See `ResolutionError`.  Failures carry the last response received
/// so callers can inspect partial information.
pub async fn resolve(
    bootstrap: SocketAddr,
    upstream_port: u16,
    question: &Question,
) -> Result<Message, ResolutionError> {
    let mut hops = MAX_HOPS;
    resolve_with_budget(bootstrap, upstream_port, question, &mut hops).await
}

/// The hop loop, sharing one budget with any sub-resolutions it
/// spawns for glue-less nameserver names.
#[async_recursion]
async fn resolve_with_budget(
    bootstrap: SocketAddr,
    upstream_port: u16,
    question: &Question,
    hops: &mut usize,
) -> Result<Message, ResolutionError> {
    let mut endpoint = bootstrap;
    let mut last_response = None;

    loop {
        if *hops == 0 {
            tracing::debug!(%question, "hop budget exhausted");
            return Err(ResolutionError::TooManyHops {
                response: last_response,
            });
        }
        *hops -= 1;

        let query = Message::from_question(rand::rng().random(), question.clone());
        let exchange = match Upstream::new(endpoint).exchange(&query).await {
            Ok(exchange) => exchange,
            Err(error) => {
                return Err(ResolutionError::Exchange {
                    error,
                    response: last_response,
                })
            }
        };

        tracing::trace!(
            %endpoint,
            answers = %exchange.message.answers.len(),
            authority = %exchange.message.authority.len(),
            "got response"
        );

        if has_answer(question, &exchange.message) {
            return Ok(exchange.message);
        }

        let target = best_delegation(&question.name, &exchange.message)
            .and_then(|delegation| delegation_target(&delegation, &exchange));
        let response = exchange.message;

        let address = match target {
            None => {
                tracing::debug!(%question, %endpoint, "no answer and no delegation to follow");
                return Err(ResolutionError::DeadEnd { response });
            }
            Some(NextHop::Address(address)) => address,
            Some(NextHop::Name(nsdname)) => {
                tracing::debug!(%nsdname, "delegation without glue, resolving the nameserver");
                let ns_question = Question {
                    name: nsdname.clone(),
                    qtype: RecordType::A,
                    qclass: RecordClass::IN,
                };

                match resolve_with_budget(bootstrap, upstream_port, &ns_question, hops).await {
                    Ok(ns_response) => {
                        let found = ns_response
                            .answers
                            .iter()
                            .filter(|rr| rr.name == nsdname)
                            .find_map(ResourceRecord::a_address);
                        match found {
                            Some(address) => address,
                            None => return Err(ResolutionError::DeadEnd { response }),
                        }
                    }
                    Err(ResolutionError::TooManyHops { .. }) => {
                        return Err(ResolutionError::TooManyHops {
                            response: Some(response),
                        })
                    }
                    Err(_) => return Err(ResolutionError::DeadEnd { response }),
                }
            }
        };

        tracing::trace!(%address, "following delegation");
        endpoint = SocketAddr::from((address, upstream_port));
        last_response = Some(response);
    }
}

/// True if any answer record is an A record for exactly the question
/// name, compared label-wise.
fn has_answer(question: &Question, response: &Message) -> bool {
    response
        .answers
        .iter()
        .any(|rr| rr.rtype == RecordType::A && rr.name == question.name)
}

/// The NS record to follow, if any.  Delegations properly live in
/// the authority section, so it is consulted first; the answer
/// section is a fallback for servers that put them there.  Within a
/// section the record whose name shares the longest label suffix
/// with the question name wins, first occurrence on ties.
fn best_delegation<'a>(qname: &DomainName, response: &'a Message) -> Option<Delegation<'a>> {
    pick_ns(qname, &response.authority, Section::Authority)
        .or_else(|| pick_ns(qname, &response.answers, Section::Answer))
}

fn pick_ns<'a>(
    qname: &DomainName,
    rrs: &'a [ResourceRecord],
    section: Section,
) -> Option<Delegation<'a>> {
    let mut best: Option<(Delegation<'a>, usize)> = None;

    for (index, rr) in rrs.iter().enumerate() {
        if rr.rtype != RecordType::NS {
            continue;
        }

        let suffix_len = qname.shared_suffix_len(&rr.name);
        // only a strictly longer suffix displaces the incumbent
        if best.as_ref().map_or(true, |(_, b)| suffix_len > *b) {
            best = Some((Delegation { rr, section, index }, suffix_len));
        }
    }

    best.map(|(delegation, _)| delegation)
}

/// A chosen NS record, remembered by section and position so its
/// RDATA offset can be recovered from the raw datagram.
struct Delegation<'a> {
    rr: &'a ResourceRecord,
    section: Section,
    index: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Section {
    Answer,
    Authority,
}

/// Where a delegation points.
#[derive(Debug, Clone, Eq, PartialEq)]
enum NextHop {
    Address(Ipv4Addr),
    Name(DomainName),
}

/// Interpret the chosen NS record's RDATA.  A name that fills the
/// RDATA exactly is a nameserver name: glue A records in the
/// additional section give its address directly, otherwise the name
/// itself must be resolved.  RDATA that is not one name but is
/// exactly 4 octets is taken as a literal IPv4 address.
fn delegation_target(delegation: &Delegation, exchange: &Exchange) -> Option<NextHop> {
    let offsets = rdata_offsets(&exchange.datagram).ok()?;
    let offset = match delegation.section {
        Section::Answer => offsets.answers.get(delegation.index).copied()?,
        Section::Authority => offsets.authority.get(delegation.index).copied()?,
    };

    match DomainName::scan_counted(&exchange.datagram, offset) {
        Ok((nsdname, consumed)) if consumed == delegation.rr.data.len() => {
            let glue = exchange
                .message
                .additional
                .iter()
                .filter(|rr| rr.name == nsdname)
                .find_map(ResourceRecord::a_address);

            match glue {
                Some(address) => Some(NextHop::Address(address)),
                None => Some(NextHop::Name(nsdname)),
            }
        }
        _ => {
            let octets: [u8; 4] = delegation.rr.data.as_ref().try_into().ok()?;
            Some(NextHop::Address(Ipv4Addr::from(octets)))
        }
    }
}

/// An error that can occur when resolving a question.  Every variant
/// carries the last response received, when there was one, so the
/// caller can inspect partial results.
#[derive(Debug)]
pub enum ResolutionError {
    /// The latest response had neither a matching A record nor any
    /// NS record to follow.
    DeadEnd { response: Message },
    /// The delegation chain exceeded the hop budget.
    TooManyHops { response: Option<Message> },
    /// An exchange with a nameserver failed.
    Exchange {
        error: ExchangeError,
        response: Option<Message>,
    },
}

impl ResolutionError {
    /// The last response received before the failure, if any.
    pub fn last_response(&self) -> Option<&Message> {
        match self {
            ResolutionError::DeadEnd { response } => Some(response),
            ResolutionError::TooManyHops { response }
            | ResolutionError::Exchange { response, .. } => response.as_ref(),
        }
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolutionError::DeadEnd { .. } => write!(f, "dead end: no answer and no delegation"),
            ResolutionError::TooManyHops { .. } => {
                write!(f, "delegation chain exceeded {MAX_HOPS} hops")
            }
            ResolutionError::Exchange { error, .. } => write!(f, "exchange failed: {error}"),
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolutionError::Exchange { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use dns_wire::types::test_util::*;

    use super::*;

    #[test]
    fn has_answer_requires_exact_name_and_a_type() {
        let question = question("dns.google.com", RecordType::A);
        let mut response = Message::from_question(1, question.clone()).make_response();

        assert!(!has_answer(&question, &response));

        response.answers.push(a_record("google.com", Ipv4Addr::new(8, 8, 8, 8)));
        response.answers.push(ns_record_raw("com", Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!has_answer(&question, &response));

        response.answers.push(a_record("dns.google.com", Ipv4Addr::new(8, 8, 8, 8)));
        assert!(has_answer(&question, &response));
    }

    #[test]
    fn best_delegation_takes_longest_suffix() {
        let response = response_with(
            &[
                ns_record_raw("net", Ipv4Addr::new(1, 1, 1, 1)),
                ns_record_raw("google.com", Ipv4Addr::new(2, 2, 2, 2)),
                ns_record_raw("com", Ipv4Addr::new(3, 3, 3, 3)),
            ],
            &[],
            &[],
        );

        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();
        assert_eq!(domain("google.com"), delegation.rr.name);
        assert_eq!(Section::Answer, delegation.section);
        assert_eq!(1, delegation.index);
    }

    #[test]
    fn best_delegation_breaks_ties_by_first_occurrence() {
        let response = response_with(
            &[
                ns_record_raw("google.com", Ipv4Addr::new(1, 1, 1, 1)),
                ns_record_raw("google.com", Ipv4Addr::new(2, 2, 2, 2)),
            ],
            &[],
            &[],
        );

        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();
        assert_eq!(0, delegation.index);
    }

    #[test]
    fn best_delegation_keeps_zero_suffix_candidates() {
        // an unrelated NS record is still a candidate when nothing
        // matches better
        let response = response_with(&[ns_record_raw("example.net", Ipv4Addr::new(1, 1, 1, 1))], &[], &[]);

        assert!(best_delegation(&domain("dns.google.com"), &response.message).is_some());
    }

    #[test]
    fn best_delegation_prefers_authority_section() {
        let response = response_with(
            &[ns_record_raw("dns.google.com", Ipv4Addr::new(1, 1, 1, 1))],
            &[ns_record_raw("com", Ipv4Addr::new(2, 2, 2, 2))],
            &[],
        );

        // the answer-section record matches better, but delegations
        // live in authority
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();
        assert_eq!(Section::Authority, delegation.section);
        assert_eq!(domain("com"), delegation.rr.name);
    }

    #[test]
    fn best_delegation_falls_back_to_answers() {
        let response = response_with(
            &[ns_record_raw("com", Ipv4Addr::new(8, 8, 8, 8))],
            &[a_record("unrelated.example", Ipv4Addr::new(9, 9, 9, 9))],
            &[],
        );

        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();
        assert_eq!(Section::Answer, delegation.section);
    }

    #[test]
    fn best_delegation_needs_an_ns_record() {
        let response = response_with(&[a_record("com", Ipv4Addr::new(1, 1, 1, 1))], &[], &[]);

        assert!(best_delegation(&domain("dns.google.com"), &response.message).is_none());
    }

    #[test]
    fn delegation_target_treats_bare_ipv4_rdata_as_address() {
        let response = response_with(&[ns_record_raw("com", Ipv4Addr::new(8, 8, 8, 8))], &[], &[]);
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();

        assert_eq!(
            Some(NextHop::Address(Ipv4Addr::new(8, 8, 8, 8))),
            delegation_target(&delegation, &response)
        );
    }

    #[test]
    fn delegation_target_prefers_glue() {
        let response = response_with(
            &[],
            &[ns_record("com", "a.gtld-servers.net")],
            &[
                a_record("b.gtld-servers.net", Ipv4Addr::new(192, 33, 14, 30)),
                a_record("a.gtld-servers.net", Ipv4Addr::new(192, 5, 6, 30)),
            ],
        );
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();

        assert_eq!(
            Some(NextHop::Address(Ipv4Addr::new(192, 5, 6, 30))),
            delegation_target(&delegation, &response)
        );
    }

    #[test]
    fn delegation_target_returns_name_when_glue_is_absent() {
        let response = response_with(&[], &[ns_record("com", "a.gtld-servers.net")], &[]);
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();

        assert_eq!(
            Some(NextHop::Name(domain("a.gtld-servers.net"))),
            delegation_target(&delegation, &response)
        );
    }

    #[test]
    fn delegation_target_ignores_glue_of_other_names() {
        let response = response_with(
            &[],
            &[ns_record("com", "a.gtld-servers.net")],
            &[a_record("b.gtld-servers.net", Ipv4Addr::new(192, 33, 14, 30))],
        );
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();

        assert_eq!(
            Some(NextHop::Name(domain("a.gtld-servers.net"))),
            delegation_target(&delegation, &response)
        );
    }

    #[test]
    fn delegation_target_scans_compressed_nameserver_names() {
        // hand-built response: question "example.com A IN", one
        // authority NS record whose RDATA is "ns1" + a pointer to
        // the question name at offset 12
        #[rustfmt::skip]
        let datagram: Vec<u8> = vec![
            0, 1, 0x80, 0x00, 0, 1, 0, 0, 0, 1, 0, 0,
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
            0, 1,
            0, 1,
            0xC0, 0x0C, // name: pointer to "example.com"
            0, 2,       // NS
            0, 1,       // IN
            0, 0, 1, 0x2C,
            0, 6,       // RDLENGTH
            3, b'n', b's', b'1', 0xC0, 0x0C,
        ];

        let exchange = Exchange {
            message: Message::from_octets(&datagram).unwrap(),
            datagram: Bytes::from(datagram),
        };
        let delegation = best_delegation(&domain("example.com"), &exchange.message).unwrap();

        assert_eq!(
            Some(NextHop::Name(domain("ns1.example.com"))),
            delegation_target(&delegation, &exchange)
        );
    }

    #[test]
    fn delegation_target_rejects_name_shorter_than_rdata() {
        // a valid name followed by trailing octets is not "exactly
        // one name", and is not 4 octets either
        let mut rdata = domain("ns1.example.com").to_octets();
        rdata.extend_from_slice(&[1, 2, 3]);
        let response = response_with(&[], &[record("com", RecordType::NS, &rdata)], &[]);
        let delegation = best_delegation(&domain("dns.google.com"), &response.message).unwrap();

        assert_eq!(None, delegation_target(&delegation, &response));
    }

    /// Build an `Exchange` the way the transport would: encode the
    /// message, then decode the resulting datagram.
    fn response_with(
        answers: &[ResourceRecord],
        authority: &[ResourceRecord],
        additional: &[ResourceRecord],
    ) -> Exchange {
        let mut message =
            Message::from_question(1, question("dns.google.com", RecordType::A)).make_response();
        message.answers = answers.into();
        message.authority = authority.into();
        message.additional = additional.into();
        message.sync_counts();

        let datagram = message.to_octets();
        Exchange {
            message: Message::from_octets(&datagram).unwrap(),
            datagram: Bytes::from(datagram),
        }
    }
}
