//! Reverse-proxy configuration model
//!
//! Upstream groups and virtual-server blocks with value semantics: every
//! mutator returns a modified copy, so callers never alias a shared config.
//! Rendering is canonical and stable - rendering a parsed, unchanged config
//! reproduces it byte for byte, which is what lets the reconciliation
//! engine detect "nothing changed" by comparing text.

use std::path::Path;

use thiserror::Error;

use crate::topology::Endpoint;

use super::parser;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to access proxy config: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy config parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("upstream `{upstream}` already contains a server for host {host}")]
    DuplicateServer { upstream: String, host: String },

    #[error("upstream `{upstream}` has no server for host {host}")]
    NoSuchServer { upstream: String, host: String },
}

/// A named load-balanced backend group.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub name: String,
    /// Selection method directive, e.g. `least_conn`, kept verbatim
    pub method: Option<String>,
    pub servers: Vec<Endpoint>,
}

impl Upstream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: None,
            servers: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn server_for_host(&self, host: &str) -> Option<&Endpoint> {
        self.servers.iter().find(|s| s.host == host)
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.server_for_host(host).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Add a backend. An upstream never holds two endpoints with the same
    /// host, so adding an already-present host is a user input error.
    pub fn with_server(&self, endpoint: Endpoint) -> Result<Self, ProxyError> {
        if self.contains_host(&endpoint.host) {
            return Err(ProxyError::DuplicateServer {
                upstream: self.name.clone(),
                host: endpoint.host,
            });
        }
        let mut copy = self.clone();
        copy.servers.push(endpoint);
        Ok(copy)
    }

    /// Remove the backend for a host. Removing an absent host is a user
    /// input error.
    pub fn without_server(&self, host: &str) -> Result<Self, ProxyError> {
        if !self.contains_host(host) {
            return Err(ProxyError::NoSuchServer {
                upstream: self.name.clone(),
                host: host.to_string(),
            });
        }
        let mut copy = self.clone();
        copy.servers.retain(|s| s.host != host);
        Ok(copy)
    }

    /// Upsert a backend: replace the port of an existing entry for the same
    /// host in place, or append a new entry. Used by reconciliation, which
    /// must converge rather than reject.
    pub fn with_updated(&self, endpoint: Endpoint) -> Self {
        let mut copy = self.clone();
        match copy.servers.iter_mut().find(|s| s.host == endpoint.host) {
            Some(existing) => existing.port = endpoint.port,
            None => copy.servers.push(endpoint),
        }
        copy
    }

    /// Keep only the backends matching the predicate.
    pub fn retain_servers(&self, keep: impl Fn(&Endpoint) -> bool) -> Self {
        let mut copy = self.clone();
        copy.servers.retain(|s| keep(s));
        copy
    }
}

/// A `location` mapping inside a virtual server. Directives other than
/// `proxy_pass` are carried verbatim in `extra`.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub path: String,
    pub proxy_pass: Option<String>,
    pub extra: Vec<String>,
}

impl Location {
    pub fn new(path: impl Into<String>, proxy_pass: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            proxy_pass: Some(proxy_pass.into()),
            extra: Vec::new(),
        }
    }
}

/// A `server { }` block: listen port plus location mappings. Typically one
/// exists per worker endpoint as a direct reverse proxy, next to the named
/// upstreams used for balanced routing.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualServer {
    pub name: Option<String>,
    pub listen: u16,
    pub locations: Vec<Location>,
    /// Directives outside any location, carried verbatim
    pub extra: Vec<String>,
}

impl VirtualServer {
    pub fn location(&self, path: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.path == path)
    }
}

/// One top-level block of the config file, in file order.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Upstream(Upstream),
    Server(VirtualServer),
}

/// The whole proxy configuration, recreated from the file on every pass
/// and discarded after write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub blocks: Vec<Block>,
}

impl ProxyConfig {
    /// Parse config text. Pure function - no I/O.
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        parser::parse(input)
    }

    pub fn read(path: &Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn write(&self, path: &Path) -> Result<(), ProxyError> {
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&Upstream> {
        self.blocks.iter().find_map(|b| match b {
            Block::Upstream(u) if u.name == name => Some(u),
            _ => None,
        })
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Upstream> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Upstream(u) => Some(u),
            _ => None,
        })
    }

    pub fn server(&self, name: &str) -> Option<&VirtualServer> {
        self.blocks.iter().find_map(|b| match b {
            Block::Server(s) if s.name.as_deref() == Some(name) => Some(s),
            _ => None,
        })
    }

    /// Replace the upstream with the same name in place, or append it as a
    /// new block at the end.
    pub fn with_upstream(&self, upstream: Upstream) -> Self {
        let mut copy = self.clone();
        match copy.blocks.iter_mut().find_map(|b| match b {
            Block::Upstream(u) if u.name == upstream.name => Some(u),
            _ => None,
        }) {
            Some(existing) => *existing = upstream,
            None => copy.blocks.push(Block::Upstream(upstream)),
        }
        copy
    }

    pub fn without_upstream(&self, name: &str) -> Self {
        let mut copy = self.clone();
        copy.blocks
            .retain(|b| !matches!(b, Block::Upstream(u) if u.name == name));
        copy
    }

    /// Render canonical config text. Pure function - no I/O.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match block {
                Block::Upstream(u) => render_upstream(&mut out, u),
                Block::Server(s) => render_server(&mut out, s),
            }
        }
        out
    }
}

fn render_upstream(out: &mut String, upstream: &Upstream) {
    out.push_str(&format!("upstream {} {{\n", upstream.name));
    if let Some(method) = &upstream.method {
        out.push_str(&format!("    {};\n", method));
    }
    for server in &upstream.servers {
        out.push_str(&format!("    server {};\n", server));
    }
    out.push_str("}\n");
}

fn render_server(out: &mut String, server: &VirtualServer) {
    out.push_str("server {\n");
    out.push_str(&format!("    listen {};\n", server.listen));
    if let Some(name) = &server.name {
        out.push_str(&format!("    server_name {};\n", name));
    }
    for line in &server.extra {
        out.push_str(&format!("    {}\n", line));
    }
    for location in &server.locations {
        out.push_str(&format!("    location {} {{\n", location.path));
        if let Some(target) = &location.proxy_pass {
            out.push_str(&format!("        proxy_pass {};\n", target));
        }
        for line in &location.extra {
            out.push_str(&format!("        {}\n", line));
        }
        out.push_str("    }\n");
    }
    out.push_str("}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16) -> Endpoint {
        Endpoint::new(host, port)
    }

    fn sample_upstream() -> Upstream {
        Upstream::new("shop-ui")
            .with_method("least_conn")
            .with_server(ep("shop-prod-01.example.com", 47110))
            .unwrap()
            .with_server(ep("shop-prod-02.example.com", 47111))
            .unwrap()
    }

    #[test]
    fn test_with_server_rejects_duplicate_host() {
        let upstream = sample_upstream();
        let result = upstream.with_server(ep("shop-prod-01.example.com", 50000));
        assert!(matches!(result, Err(ProxyError::DuplicateServer { .. })));
    }

    #[test]
    fn test_without_server_rejects_absent_host() {
        let upstream = sample_upstream();
        let result = upstream.without_server("shop-prod-09.example.com");
        assert!(matches!(result, Err(ProxyError::NoSuchServer { .. })));
    }

    #[test]
    fn test_mutators_leave_original_untouched() {
        let upstream = sample_upstream();
        let trimmed = upstream.without_server("shop-prod-01.example.com").unwrap();
        assert_eq!(upstream.servers.len(), 2);
        assert_eq!(trimmed.servers.len(), 1);
    }

    #[test]
    fn test_with_updated_replaces_port_in_place() {
        let upstream = sample_upstream();
        let updated = upstream.with_updated(ep("shop-prod-01.example.com", 50000));
        assert_eq!(updated.servers[0].port, 50000);
        assert_eq!(updated.servers[0].host, "shop-prod-01.example.com");
        assert_eq!(updated.servers.len(), 2);
    }

    #[test]
    fn test_with_updated_appends_new_host() {
        let upstream = sample_upstream();
        let updated = upstream.with_updated(ep("shop-prod-03.example.com", 47112));
        assert_eq!(updated.servers.len(), 3);
        assert_eq!(updated.servers[2].host, "shop-prod-03.example.com");
    }

    #[test]
    fn test_config_with_upstream_replaces_in_place() {
        let config = ProxyConfig {
            blocks: vec![
                Block::Upstream(sample_upstream()),
                Block::Upstream(Upstream::new("shop-api")),
            ],
        };
        let replacement = Upstream::new("shop-ui");
        let updated = config.with_upstream(replacement);
        assert_eq!(updated.blocks.len(), 2);
        assert!(matches!(&updated.blocks[0], Block::Upstream(u) if u.name == "shop-ui" && u.is_empty()));
    }

    #[test]
    fn test_config_without_upstream() {
        let config = ProxyConfig {
            blocks: vec![Block::Upstream(sample_upstream())],
        };
        let updated = config.without_upstream("shop-ui");
        assert!(updated.blocks.is_empty());
        assert!(updated.upstream("shop-ui").is_none());
    }

    #[test]
    fn test_render_upstream() {
        let config = ProxyConfig {
            blocks: vec![Block::Upstream(sample_upstream())],
        };
        let expected = "upstream shop-ui {\n    least_conn;\n    server shop-prod-01.example.com:47110;\n    server shop-prod-02.example.com:47111;\n}\n";
        assert_eq!(config.render(), expected);
    }

    #[test]
    fn test_render_server_block() {
        let server = VirtualServer {
            name: Some("shop-prod-01".to_string()),
            listen: 8080,
            locations: vec![Location {
                path: "/shop".to_string(),
                proxy_pass: Some("http://shop-ui".to_string()),
                extra: vec!["proxy_set_header X-Forwarded-For $remote_addr;".to_string()],
            }],
            extra: Vec::new(),
        };
        let config = ProxyConfig {
            blocks: vec![Block::Server(server)],
        };
        let rendered = config.render();
        assert!(rendered.contains("    location /shop {\n"));
        assert!(rendered.contains("        proxy_pass http://shop-ui;\n"));
        assert!(rendered.contains("        proxy_set_header X-Forwarded-For $remote_addr;\n"));
    }
}
