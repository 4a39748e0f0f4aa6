//! Line-oriented parser for the proxy config format
//!
//! Only the block kinds the engine manages are given structure; everything
//! inside a location besides `proxy_pass` (header rewrites, timeouts) is
//! kept verbatim as opaque trailing lines. A line the parser does not
//! recognize at top level is a fatal error - the file is owned by this
//! engine and an unexpected shape means someone else edited it.

use crate::topology::Endpoint;

use super::model::{Block, Location, ProxyConfig, ProxyError, Upstream, VirtualServer};

pub fn parse(input: &str) -> Result<ProxyConfig, ProxyError> {
    let mut blocks = Vec::new();
    let mut lines = input.lines().enumerate();

    while let Some((n, raw)) = lines.next() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("upstream ") {
            let name = rest
                .strip_suffix('{')
                .map(str::trim)
                .filter(|n| !n.is_empty() && !n.contains(char::is_whitespace))
                .ok_or_else(|| err(n, format!("malformed upstream header: `{}`", line)))?;
            blocks.push(Block::Upstream(parse_upstream(name, &mut lines)?));
        } else if line == "server {" {
            blocks.push(Block::Server(parse_server(n, &mut lines)?));
        } else {
            return Err(err(n, format!("unexpected top-level directive: `{}`", line)));
        }
    }

    Ok(ProxyConfig { blocks })
}

fn parse_upstream<'a>(
    name: &str,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<Upstream, ProxyError> {
    let mut upstream = Upstream::new(name);
    for (n, raw) in lines.by_ref() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            return Ok(upstream);
        }
        let directive = line
            .strip_suffix(';')
            .ok_or_else(|| err(n, format!("directive missing `;`: `{}`", line)))?
            .trim();
        if let Some(address) = directive.strip_prefix("server ") {
            let endpoint = parse_endpoint(n, address.trim())?;
            if upstream.contains_host(&endpoint.host) {
                return Err(err(
                    n,
                    format!("duplicate server host {} in upstream {}", endpoint.host, name),
                ));
            }
            upstream.servers.push(endpoint);
        } else if upstream.method.is_none() && upstream.servers.is_empty() {
            upstream.method = Some(directive.to_string());
        } else {
            return Err(err(n, format!("unexpected upstream directive: `{}`", line)));
        }
    }
    Err(ProxyError::Parse {
        line: 0,
        message: format!("unterminated upstream block `{}`", name),
    })
}

fn parse_server<'a>(
    header_line: usize,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<VirtualServer, ProxyError> {
    let mut listen = None;
    let mut name = None;
    let mut locations = Vec::new();
    let mut extra = Vec::new();

    while let Some((n, raw)) = lines.next() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            let listen = listen
                .ok_or_else(|| err(header_line, "server block missing listen directive".to_string()))?;
            return Ok(VirtualServer {
                name,
                listen,
                locations,
                extra,
            });
        }
        if let Some(rest) = line.strip_prefix("location ") {
            let path = rest
                .strip_suffix('{')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| err(n, format!("malformed location header: `{}`", line)))?;
            locations.push(parse_location(path, lines)?);
            continue;
        }
        let directive = line
            .strip_suffix(';')
            .ok_or_else(|| err(n, format!("directive missing `;`: `{}`", line)))?
            .trim();
        if let Some(port) = directive.strip_prefix("listen ") {
            listen = Some(
                port.trim()
                    .parse()
                    .map_err(|_| err(n, format!("invalid listen port: `{}`", port.trim())))?,
            );
        } else if let Some(value) = directive.strip_prefix("server_name ") {
            name = Some(value.trim().to_string());
        } else {
            extra.push(line.to_string());
        }
    }
    Err(err(header_line, "unterminated server block".to_string()))
}

fn parse_location<'a>(
    path: &str,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<Location, ProxyError> {
    let mut location = Location {
        path: path.to_string(),
        proxy_pass: None,
        extra: Vec::new(),
    };
    for (n, raw) in lines.by_ref() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            return Ok(location);
        }
        if line.ends_with('{') {
            return Err(err(n, format!("nested block inside location: `{}`", line)));
        }
        if let Some(target) = line
            .strip_prefix("proxy_pass ")
            .and_then(|r| r.strip_suffix(';'))
        {
            location.proxy_pass = Some(target.trim().to_string());
        } else {
            // opaque passthrough, preserved verbatim
            location.extra.push(line.to_string());
        }
    }
    Err(ProxyError::Parse {
        line: 0,
        message: format!("unterminated location block `{}`", path),
    })
}

fn parse_endpoint(n: usize, address: &str) -> Result<Endpoint, ProxyError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| err(n, format!("server address missing port: `{}`", address)))?;
    let port = port
        .parse()
        .map_err(|_| err(n, format!("invalid server port: `{}`", port)))?;
    if host.is_empty() {
        return Err(err(n, format!("server address missing host: `{}`", address)));
    }
    Ok(Endpoint::new(host, port))
}

fn err(zero_based_line: usize, message: String) -> ProxyError {
    ProxyError::Parse {
        line: zero_based_line + 1,
        message,
    }
}
