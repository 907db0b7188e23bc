use std::env::var;
use std::time::Duration;

use clap::Parser;
use eyre::Result as EyreResult;
use tokio::net::TcpListener;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

use snapmesh::config::{Action, RootCommand};
use snapmesh::network::RegistryServer;
use snapmesh::workload::{self, Mesh, WorkloadConfig};

#[tokio::main]
async fn main() -> EyreResult<()> {
    setup()?;

    let command = RootCommand::parse();

    match command.action {
        Action::Registry(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            RegistryServer::new().serve(listener).await?;
        }
        Action::Run(args) => {
            let config = WorkloadConfig::from(&args.workload);
            config.validate()?;
            let mut mesh = Mesh::tcp(
                args.registry,
                args.host,
                args.start_port,
                config.peers,
                Duration::from_millis(args.link_timeout_ms),
            )
            .await?;
            report(workload::run(&mut mesh, &config).await, mesh).await?;
        }
        Action::Local(args) => {
            let config = WorkloadConfig::from(&args);
            config.validate()?;
            let mut mesh = Mesh::local(config.peers).await?;
            report(workload::run(&mut mesh, &config).await, mesh).await?;
        }
    }

    Ok(())
}

async fn report(result: EyreResult<Vec<snapmesh::snapshot::LocalSnapshot>>, mesh: Mesh) -> EyreResult<()> {
    mesh.shutdown().await;

    for snapshot in result? {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    Ok(())
}

fn setup() -> EyreResult<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "snapmesh=info".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer())
        .init();

    color_eyre::install()?;

    Ok(())
}
