//! Text control-plane protocol.
//!
//! A request is a proto frame of type [`message_type::INFO`] whose body lists
//! query names, one per line. The response body holds `name\tvalue\n` lines.
//! Multi-valued answers use `;` between entries and `:` inside an entry, for
//! example `host:port;host:port` or `namespace:partition;...`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Host;
use crate::error::{Error, Result};
use crate::wire::{PROTO_HEADER_LEN, ProtoHeader, frame, message_type};

/// Names and values returned by one info exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoResponse {
    values: BTreeMap<String, String>,
}

impl InfoResponse {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Like [`InfoResponse::get`] but a missing name is a protocol error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::protocol(format!("info response missing '{name}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }
}

/// Builds the request body: names separated by `,`, `;` or newlines become one per line.
pub fn encode_request(names: &str) -> Vec<u8> {
    let mut body = String::with_capacity(names.len() + 1);
    for name in names
        .split([',', ';', '\n'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        body.push_str(name);
        body.push('\n');
    }
    body.into_bytes()
}

/// Parses a response body into its name/value pairs.
pub fn parse_response(body: &[u8]) -> Result<InfoResponse> {
    let text =
        std::str::from_utf8(body).map_err(|_| Error::protocol("info response is not UTF-8"))?;
    let values = text
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect();
    Ok(InfoResponse { values })
}

/// Runs one info exchange against `addr`, bounded by `deadline` overall.
pub async fn request(addr: SocketAddr, names: &str, deadline: Duration) -> Result<InfoResponse> {
    match timeout(deadline, exchange(addr, names)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%addr, names, "info request timed out");
            Err(Error::Timeout)
        }
    }
}

async fn exchange(addr: SocketAddr, names: &str) -> Result<InfoResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let request = frame(message_type::INFO, &encode_request(names));
    stream.write_all(&request).await?;

    let mut header = [0u8; PROTO_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let header = ProtoHeader::decode(header, message_type::INFO)?;

    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).await?;
    parse_response(&body)
}

/// Parses a `services` value into peer hosts.
pub fn parse_services(value: &str) -> Result<Vec<Host>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<Host>()
                .map_err(|_| Error::protocol(format!("bad service entry '{entry}'")))
        })
        .collect()
}

/// Parses a `replicas-read`/`replicas-write` value into `(namespace, partition)` pairs.
pub fn parse_replicas(value: &str) -> Result<Vec<(String, u32)>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (namespace, pid) = entry
                .rsplit_once(':')
                .ok_or_else(|| Error::protocol(format!("bad replica entry '{entry}'")))?;
            let pid = pid
                .parse()
                .map_err(|_| Error::protocol(format!("bad partition id in '{entry}'")))?;
            if namespace.is_empty() {
                return Err(Error::protocol(format!("empty namespace in '{entry}'")));
            }
            Ok((namespace.to_string(), pid))
        })
        .collect()
}

/// Parses a numeric info value.
pub fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("'{name}' is not a number: '{value}'")))
}
