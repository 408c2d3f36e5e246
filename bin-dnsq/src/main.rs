use clap::Parser;
use std::fmt::Write as _;
use std::process;

use dns_resolver::{resolve, Upstream};
use dns_wire::types::*;

/// RDATA is opaque in this codec, so only A records get a friendly
/// rendering; everything else is printed in the RFC 3597 generic
/// form, `\# <length> <hex octets>`.
fn format_rdata(rr: &ResourceRecord) -> String {
    if let Some(address) = rr.a_address() {
        return address.to_string();
    }

    let mut out = format!("\\# {}", rr.data.len());
    if !rr.data.is_empty() {
        out.push(' ');
        for octet in &rr.data {
            // infallible for String
            let _ = write!(out, "{octet:02x}");
        }
    }
    out
}

fn print_section(heading: &str, rrs: &[ResourceRecord]) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            rr.name,
            rr.ttl,
            rr.rclass,
            rr.rtype,
            format_rdata(rr)
        );
    }
}

fn print_sections(response: &Message) {
    print_section("ANSWER", &response.answers);
    print_section("AUTHORITY", &response.authority);
    print_section("ADDITIONAL", &response.additional);
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS iterative lookup utility
///
/// Chases delegation chains from the bootstrap nameserver and prints
/// whatever the final response holds.  On failure the error and any
/// partial response are printed, and the exit code is 1.
///
/// It does not support querying nameservers over IPv6.
struct Args {
    /// Domain name to resolve
    #[clap(value_parser)]
    domain: DomainName,

    /// Query type to resolve
    #[clap(default_value_t = RecordType::A, value_parser)]
    qtype: RecordType,

    /// Nameserver to start the resolution from (in `host:port` form)
    #[clap(short, long, value_parser, default_value = "127.0.0.1:5005")]
    bootstrap_endpoint: String,

    /// Which port to contact follow-up nameservers on
    #[clap(long, value_parser, default_value_t = 53)]
    upstream_dns_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let question = Question {
        name: args.domain,
        qtype: args.qtype,
        qclass: RecordClass::IN,
    };

    let bootstrap = match Upstream::lookup(&args.bootstrap_endpoint).await {
        Ok(upstream) => upstream.address(),
        Err(error) => {
            eprintln!("could not resolve bootstrap endpoint: {error}");
            process::exit(1);
        }
    };

    println!(";; QUESTION");
    println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);

    match resolve(bootstrap, args.upstream_dns_port, &question).await {
        Ok(response) => print_sections(&response),
        Err(error) => {
            println!("\n; {error}");
            if let Some(response) = error.last_response() {
                print_sections(response);
            }
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use dns_wire::types::test_util::*;

    use super::*;

    #[test]
    fn format_rdata_renders_a_records_dotted() {
        let rr = a_record("dns.google.com", std::net::Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!("8.8.8.8", format_rdata(&rr));
    }

    #[test]
    fn format_rdata_renders_other_records_generically() {
        let rr = record("example.com", RecordType::TXT, &[0xDE, 0xAD]);
        assert_eq!("\\# 2 dead", format_rdata(&rr));

        let empty = record("example.com", RecordType::NULL, &[]);
        assert_eq!("\\# 0", format_rdata(&empty));
    }
}
