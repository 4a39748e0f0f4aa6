use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

use crate::deployer::Deployment;
use crate::topology::NodeRef;

#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(about = "Reconcile application-server clusters against a reverse-proxy load balancer")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file with deployer credentials
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PathOpts {
    /// Path to the topology file
    #[arg(long, value_name = "FILE", default_value = "topology.yml")]
    pub topology: PathBuf,

    /// Path to the proxy configuration file the engine owns
    #[arg(long, value_name = "FILE", default_value = "proxy.conf")]
    pub proxy_config: PathBuf,

    /// Directory holding the compose project of the cluster
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub compose_dir: PathBuf,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ReloadOpts {
    /// Command that reloads the proxy
    #[arg(long, value_name = "CMD", default_value = "nginx -s reload")]
    pub reload_cmd: String,

    /// Reload through a bridge socket instead of running the command
    #[arg(long, value_name = "ADDR")]
    pub reload_via: Option<SocketAddr>,

    /// Seconds to wait for a reload to finish
    #[arg(long, value_name = "SECS", default_value = "30")]
    pub reload_timeout: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct NodeOpts {
    /// Cluster key, e.g. `shop.example.com/shop`
    pub cluster: String,

    /// Stage name within the cluster, e.g. `prod`
    pub stage: String,

    /// One-based node index within the stage
    pub index: u32,

    /// Deployment (upstream) name the operation targets
    pub deployment: String,
}

impl NodeOpts {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            cluster: self.cluster.clone(),
            stage: self.stage.clone(),
            index: self.index,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reconciliation engine
    Run {
        #[command(flatten)]
        paths: PathOpts,

        #[command(flatten)]
        reload: ReloadOpts,

        /// Reconcile once and exit instead of watching the topology file
        #[arg(long)]
        once: bool,

        /// Seconds between topology file checks
        #[arg(long, value_name = "SECS", default_value = "10")]
        interval: u64,
    },

    /// Run the privileged reload bridge
    Bridge {
        /// Address to listen on; non-loopback peers are rejected
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9302")]
        listen: SocketAddr,

        /// Command that reloads the proxy
        #[arg(long, value_name = "CMD", default_value = "nginx -s reload")]
        reload_cmd: String,

        /// Seconds to wait for a reload to finish
        #[arg(long, value_name = "SECS", default_value = "30")]
        reload_timeout: u64,
    },

    /// Put a node back into its deployment's upstream
    Balance {
        #[command(flatten)]
        paths: PathOpts,

        #[command(flatten)]
        reload: ReloadOpts,

        #[command(flatten)]
        node: NodeOpts,
    },

    /// Take a node out of its deployment's upstream
    Unbalance {
        #[command(flatten)]
        paths: PathOpts,

        #[command(flatten)]
        reload: ReloadOpts,

        #[command(flatten)]
        node: NodeOpts,
    },

    /// Switch a node's deployment to a version, out of traffic
    Deploy {
        #[command(flatten)]
        paths: PathOpts,

        #[command(flatten)]
        reload: ReloadOpts,

        #[command(flatten)]
        node: NodeOpts,

        /// Version to deploy
        version: String,
    },

    /// Remove a deployment from a node
    Undeploy {
        #[command(flatten)]
        paths: PathOpts,

        #[command(flatten)]
        reload: ReloadOpts,

        #[command(flatten)]
        node: NodeOpts,
    },

    /// Show desired vs. running state of every stage
    Status {
        /// Path to the topology file
        #[arg(long, value_name = "FILE", default_value = "topology.yml")]
        topology: PathBuf,

        /// Directory holding the compose project of the cluster
        #[arg(long, value_name = "DIR", default_value = ".")]
        compose_dir: PathBuf,
    },
}

// ============================================================================
// Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// One stage's desired vs. observed state, ready for display.
#[derive(Debug)]
pub struct StageStatus {
    pub cluster: String,
    pub stage: String,
    pub desired: u32,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug)]
pub struct NodeStatus {
    pub index: u32,
    pub hostname: String,
    pub port: u16,
    /// None when the node's deployer could not be queried.
    pub deployments: Option<Vec<(String, Deployment)>>,
}

/// Format the status report.
/// Pure function - returns a formatted string.
pub fn format_status(stages: &[StageStatus]) -> String {
    let mut output = String::new();

    for status in stages {
        output.push_str(&format!(
            "{} / {} ({} running, {} desired)\n",
            status.cluster,
            status.stage,
            status.nodes.len(),
            status.desired
        ));
        for node in &status.nodes {
            output.push_str(&format!(
                "  [{}] {}:{}\n",
                node.index, node.hostname, node.port
            ));
            match &node.deployments {
                Some(deployments) => {
                    for (name, deployment) in deployments {
                        match &deployment.error {
                            Some(error) => output.push_str(&format!(
                                "      {} {} - ERROR: {}\n",
                                name, deployment.version, error
                            )),
                            None => output
                                .push_str(&format!("      {} {}\n", name, deployment.version)),
                        }
                    }
                }
                None => output.push_str("      (deployer unreachable)\n"),
            }
        }
        output.push('\n');
    }

    if stages.is_empty() {
        output.push_str("No stages defined.\n");
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clap_run_defaults() {
        let args = Args::parse_from(["shepherd", "run"]);
        match args.command {
            Command::Run {
                paths,
                reload,
                once,
                interval,
            } => {
                assert_eq!(paths.topology, PathBuf::from("topology.yml"));
                assert_eq!(paths.proxy_config, PathBuf::from("proxy.conf"));
                assert_eq!(reload.reload_cmd, "nginx -s reload");
                assert!(reload.reload_via.is_none());
                assert!(!once);
                assert_eq!(interval, 10);
            }
            other => panic!("expected Run, got {:?}", other),
        }
    }

    #[test]
    fn test_clap_verbose_is_global() {
        let args = Args::parse_from(["shepherd", "run", "-vv"]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_clap_balance_node() {
        let args = Args::parse_from([
            "shepherd",
            "balance",
            "shop.example.com/shop",
            "prod",
            "2",
            "shop-ui",
        ]);
        match args.command {
            Command::Balance { node, .. } => {
                let node_ref = node.node_ref();
                assert_eq!(node_ref.cluster, "shop.example.com/shop");
                assert_eq!(node_ref.stage, "prod");
                assert_eq!(node_ref.index, 2);
                assert_eq!(node.deployment, "shop-ui");
            }
            other => panic!("expected Balance, got {:?}", other),
        }
    }

    #[test]
    fn test_clap_deploy_version() {
        let args = Args::parse_from([
            "shepherd",
            "deploy",
            "shop.example.com/shop",
            "prod",
            "1",
            "shop-ui",
            "1.4.2",
        ]);
        match args.command {
            Command::Deploy { version, .. } => assert_eq!(version, "1.4.2"),
            other => panic!("expected Deploy, got {:?}", other),
        }
    }

    #[test]
    fn test_clap_bridge_defaults() {
        let args = Args::parse_from(["shepherd", "bridge"]);
        match args.command {
            Command::Bridge { listen, .. } => {
                assert_eq!(listen, "127.0.0.1:9302".parse::<SocketAddr>().unwrap());
            }
            other => panic!("expected Bridge, got {:?}", other),
        }
    }

    #[test]
    fn test_format_status() {
        let stages = vec![StageStatus {
            cluster: "shop.example.com/shop".to_string(),
            stage: "prod".to_string(),
            desired: 2,
            nodes: vec![
                NodeStatus {
                    index: 1,
                    hostname: "shop01.example.com".to_string(),
                    port: 32768,
                    deployments: Some(vec![(
                        "shop-ui".to_string(),
                        Deployment {
                            group: "com.example.shop".to_string(),
                            artifact: "shop-ui".to_string(),
                            version: "1.4.2".to_string(),
                            kind: "war".to_string(),
                            error: None,
                        },
                    )]),
                },
                NodeStatus {
                    index: 2,
                    hostname: "shop02.example.com".to_string(),
                    port: 32769,
                    deployments: None,
                },
            ],
        }];

        let output = format_status(&stages);
        assert!(output.contains("shop.example.com/shop / prod (2 running, 2 desired)"));
        assert!(output.contains("[1] shop01.example.com:32768"));
        assert!(output.contains("shop-ui 1.4.2"));
        assert!(output.contains("(deployer unreachable)"));
    }

    #[test]
    fn test_format_status_empty() {
        assert_eq!(format_status(&[]), "No stages defined.\n");
    }
}
