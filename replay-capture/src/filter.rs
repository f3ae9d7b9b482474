use std::{fmt, net::IpAddr, str::FromStr};

use crate::{CaptureError, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Src,
    Dst,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Tcp,
    Port(Direction, u16),
    Host(Direction, IpAddr),
}

/// A packet filter supporting a subset of the BPF expression syntax:
///
/// ```text
/// expr := term ("and" term)*
/// term := "tcp" | ["src" | "dst"] "port" N | ["src" | "dst"] "host" ADDR
/// ```
///
/// The empty expression matches every packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    expr: String,
    terms: Vec<Term>,
}

impl Filter {
    /// Parses a filter expression.
    pub fn parse(expr: &str) -> Result<Self, CaptureError> {
        let mut terms = Vec::new();
        let mut tokens = expr.split_whitespace();

        let Some(mut token) = tokens.next() else {
            return Ok(Self::default());
        };

        loop {
            terms.push(parse_term(token, &mut tokens)?);

            match tokens.next() {
                None => break,
                Some("and") => {
                    token = tokens
                        .next()
                        .ok_or_else(|| CaptureError::Filter("dangling 'and'".to_string()))?;
                }
                Some(other) => {
                    return Err(CaptureError::Filter(format!("expected 'and', found {other:?}")))
                }
            }
        }

        Ok(Self { expr: expr.trim().to_string(), terms })
    }

    /// Filter accepting TCP traffic to the given port, as used for `--input-raw`.
    pub fn tcp_dst_port(port: u16) -> Self {
        Self {
            expr: format!("tcp and dst port {port}"),
            terms: vec![Term::Tcp, Term::Port(Direction::Dst, port)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Returns `true` if the packet satisfies every term.
    pub fn matches(&self, packet: &Packet) -> bool {
        self.terms.iter().all(|term| match term {
            Term::Tcp => packet.transport().is_some(),
            Term::Port(dir, port) => packet.transport().map_or(false, |tcp| match dir {
                Direction::Src => tcp.source_port == *port,
                Direction::Dst => tcp.destination_port == *port,
                Direction::Any => tcp.source_port == *port || tcp.destination_port == *port,
            }),
            Term::Host(dir, ip) => packet.network().map_or(false, |net| match dir {
                Direction::Src => net.source == *ip,
                Direction::Dst => net.destination == *ip,
                Direction::Any => net.source == *ip || net.destination == *ip,
            }),
        })
    }
}

impl FromStr for Filter {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn parse_term<'a>(
    first: &'a str,
    rest: &mut impl Iterator<Item = &'a str>,
) -> Result<Term, CaptureError> {
    let (dir, keyword) = match first {
        "tcp" => return Ok(Term::Tcp),
        "src" => (Direction::Src, rest.next()),
        "dst" => (Direction::Dst, rest.next()),
        other => (Direction::Any, Some(other)),
    };

    let keyword = keyword.ok_or_else(|| CaptureError::Filter(format!("incomplete term after {first:?}")))?;
    let value = rest
        .next()
        .ok_or_else(|| CaptureError::Filter(format!("missing value after {keyword:?}")))?;

    match keyword {
        "port" => value
            .parse()
            .map(|port| Term::Port(dir, port))
            .map_err(|_| CaptureError::Filter(format!("invalid port {value:?}"))),
        "host" => value
            .parse()
            .map(|ip| Term::Host(dir, ip))
            .map_err(|_| CaptureError::Filter(format!("invalid host {value:?}"))),
        other => Err(CaptureError::Filter(format!("unsupported primitive {other:?}"))),
    }
}
