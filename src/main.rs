use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shepherd::bridge::{self, BridgeClient, CommandReloader, ProxyReloader};
use shepherd::cli::{format_status, Args, Command, NodeStatus, PathOpts, ReloadOpts, StageStatus};
use shepherd::deployer::{Deployer, HttpDeployer};
use shepherd::reconcile::{spawn_watch_loop, Reconciler};
use shepherd::runtime::{ComposeProbe, ShellRunner};
use shepherd::topology::TopologyFile;
use shepherd::workflow::DeployWorkflow;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args.command).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            paths,
            reload,
            once,
            interval,
        } => run_engine(paths, reload, once, interval).await,

        Command::Bridge {
            listen,
            reload_cmd,
            reload_timeout,
        } => {
            let runner = Arc::new(ShellRunner);
            let reloader: Arc<dyn ProxyReloader> = Arc::new(CommandReloader::new(
                runner,
                &reload_cmd,
                Duration::from_secs(reload_timeout),
            ));
            let listener = tokio::net::TcpListener::bind(listen).await?;
            info!("reload bridge listening on {}", listen);
            bridge::serve(listener, reloader).await?;
            Ok(())
        }

        Command::Balance {
            paths,
            reload,
            node,
        } => {
            let workflow = build_workflow(&paths, &reload)?;
            workflow.balance(&node.node_ref(), &node.deployment).await?;
            Ok(())
        }

        Command::Unbalance {
            paths,
            reload,
            node,
        } => {
            let workflow = build_workflow(&paths, &reload)?;
            workflow
                .unbalance(&node.node_ref(), &node.deployment)
                .await?;
            Ok(())
        }

        Command::Deploy {
            paths,
            reload,
            node,
            version,
        } => {
            let workflow = build_workflow(&paths, &reload)?;
            workflow
                .deploy(&node.node_ref(), &node.deployment, &version)
                .await?;
            Ok(())
        }

        Command::Undeploy {
            paths,
            reload,
            node,
        } => {
            let workflow = build_workflow(&paths, &reload)?;
            workflow
                .undeploy(&node.node_ref(), &node.deployment)
                .await?;
            Ok(())
        }

        Command::Status {
            topology,
            compose_dir,
        } => {
            let stages = collect_status(&topology, &compose_dir).await?;
            println!("{}", format_status(&stages));
            Ok(())
        }
    }
}

async fn run_engine(
    paths: PathOpts,
    reload: ReloadOpts,
    once: bool,
    interval: u64,
) -> anyhow::Result<()> {
    ensure_exists(&paths.topology, "topology file")?;
    ensure_exists(&paths.proxy_config, "proxy config")?;

    let probe = build_probe(&paths);
    let reloader = build_reloader(&reload);
    let lock = Arc::new(Mutex::new(()));
    let reconciler = Arc::new(Reconciler::new(
        paths.topology.clone(),
        paths.proxy_config.clone(),
        probe,
        reloader,
        lock,
    ));

    if once {
        let report = reconciler.reconcile().await?;
        info!(
            "pass complete: {} scale command(s), proxy {}",
            report.scaled.len(),
            if report.reloaded {
                "reloaded"
            } else {
                "unchanged"
            }
        );
        return Ok(());
    }

    let shutdown = spawn_watch_loop(
        reconciler,
        paths.topology.clone(),
        Duration::from_secs(interval),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown.send(());
    Ok(())
}

async fn collect_status(topology: &Path, compose_dir: &Path) -> anyhow::Result<Vec<StageStatus>> {
    let topology = TopologyFile::load(topology)?;
    let runner = Arc::new(ShellRunner);
    let probe = ComposeProbe::new(runner, compose_dir.to_path_buf());
    let deployer = HttpDeployer::new();

    let mut stages = Vec::new();
    for cluster in topology.clusters()? {
        for stage in &cluster.stages {
            let service = cluster.service_name(stage);
            let instances = probe.list_instances(&service).await?;

            let mut nodes = Vec::new();
            for instance in instances {
                let hostname = stage.node_hostname(instance.index);
                let url = format!("http://{}:{}", hostname, cluster.slot.plain);
                // a dead deployer on one node must not kill the report
                let deployments = match deployer.deployments(&url).await {
                    Ok(map) => {
                        let mut list: Vec<_> = map.into_iter().collect();
                        list.sort_by(|a, b| a.0.cmp(&b.0));
                        Some(list)
                    }
                    Err(e) => {
                        warn!("deployer on {} unreachable: {}", hostname, e);
                        None
                    }
                };
                nodes.push(NodeStatus {
                    index: instance.index,
                    hostname,
                    port: instance.port,
                    deployments,
                });
            }

            stages.push(StageStatus {
                cluster: cluster.key.clone(),
                stage: stage.name.clone(),
                desired: stage.count,
                nodes,
            });
        }
    }
    Ok(stages)
}

fn build_workflow(paths: &PathOpts, reload: &ReloadOpts) -> anyhow::Result<DeployWorkflow> {
    ensure_exists(&paths.topology, "topology file")?;
    ensure_exists(&paths.proxy_config, "proxy config")?;
    let deployer: Arc<dyn Deployer> = Arc::new(HttpDeployer::new());
    Ok(DeployWorkflow::new(
        paths.topology.clone(),
        paths.proxy_config.clone(),
        build_probe(paths),
        build_reloader(reload),
        deployer,
        Arc::new(Mutex::new(())),
    ))
}

fn build_probe(paths: &PathOpts) -> ComposeProbe {
    let runner = Arc::new(ShellRunner);
    ComposeProbe::new(runner, paths.compose_dir.clone())
}

fn build_reloader(reload: &ReloadOpts) -> Arc<dyn ProxyReloader> {
    match reload.reload_via {
        Some(addr) => Arc::new(
            BridgeClient::new(addr).with_timeout(Duration::from_secs(reload.reload_timeout)),
        ),
        None => {
            let runner = Arc::new(ShellRunner);
            Arc::new(CommandReloader::new(
                runner,
                &reload.reload_cmd,
                Duration::from_secs(reload.reload_timeout),
            ))
        }
    }
}

fn ensure_exists(path: &PathBuf, what: &str) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("{} {} does not exist", what, path.display());
    }
    Ok(())
}
