//! Entry point for the `aetherd` daemon.

use std::process::ExitCode;
use std::sync::Arc;

use aether_broker::amqp::{shutdown_signal, AmqpServer};
use aether_broker::config::{Mode, Settings};
use aether_broker::error::BrokerError;
use aether_broker::router::Router;
use aether_broker::routes::create_router;
use aether_compute::host::{
    bring_up_public_switch, dependency_help_text, ensure_public_tap, missing_dependencies,
    BINARY_DEPENDENCIES,
};
use aether_compute::{
    CommandRunner, ComputeError, Iproute2Network, LibguestfsImageTool, OverlayManager, QemuControl,
    RouterAdvertisements, SysinfoProcessTable, SystemRunner, SystemdServiceManager, VmManager,
    VpnPool,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("AETHER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::parse();
    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "aetherd failed");
            eprintln!("aetherd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), BrokerError> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    match settings.mode() {
        Mode::SetupNetwork {
            bridge,
            phys,
            ip,
            gateway,
        } => {
            let network = Iproute2Network::new(runner, settings.sudo);
            network
                .bridged_network(&bridge, &phys, ip.as_deref(), gateway.as_deref())
                .await?;
            Ok(())
        }
        Mode::Serve => {
            let manager = bootstrap(&settings, runner).await?;
            let server = AmqpServer::connect(&settings.amqp_url).await?;
            server.run(&Router::new(manager)).await
        }
        Mode::Http { listen } => {
            let manager = bootstrap(&settings, runner).await?;
            let listener = tokio::net::TcpListener::bind(listen).await?;
            tracing::info!(addr = %listen, "aetherd listening");
            axum::serve(listener, create_router(manager))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            Ok(())
        }
    }
}

/// Check the host and bring up the public switch, then wire the engine.
async fn bootstrap(
    settings: &Settings,
    runner: Arc<dyn CommandRunner>,
) -> Result<VmManager, BrokerError> {
    let required: Vec<&str> = BINARY_DEPENDENCIES
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| *name != "radvd" || settings.ipv6_prefix.is_some())
        .collect();
    let missing = missing_dependencies(&required);
    if !missing.is_empty() {
        eprintln!("{}\n", dependency_help_text(&missing));
        return Err(BrokerError::MissingDependencies(
            missing.into_iter().map(str::to_owned).collect(),
        ));
    }

    let config = Arc::new(settings.host_config());
    for dir in [&config.user_image_dir, &config.vpn_config_dir, &config.runtime_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let network = Iproute2Network::new(Arc::clone(&runner), settings.sudo);
    if let Err(e) = ensure_public_tap(&network, &config).await {
        if matches!(e, ComputeError::DeviceNotFound(_)) {
            eprintln!(
                "aether needs the tap device {tap}. You can create it with:\n\n    \
                 sudo ip tuntap add dev {tap} mode tap user $USER\n    \
                 sudo ip link set dev {tap} up\n",
                tap = config.public_tap
            );
        }
        return Err(e.into());
    }

    let services = Arc::new(SystemdServiceManager::new(
        settings.unit_dir(),
        Arc::clone(&runner),
    ));
    bring_up_public_switch(services.as_ref(), &config).await?;

    let mut overlays = OverlayManager::new(
        VpnPool::with_capacity(settings.vpn_pool_size),
        Arc::clone(&config),
        services.clone(),
        Arc::clone(&runner),
    );
    if let Some(site) = settings.ipv6_prefix {
        let adverts = RouterAdvertisements::new(site, &settings.radvd_user, settings.sudo)?;
        overlays = overlays.with_router_advertisements(adverts);
    }
    Ok(VmManager::new(
        Arc::clone(&config),
        services,
        Arc::new(LibguestfsImageTool::new(runner)),
        Arc::new(SysinfoProcessTable),
        Arc::new(QemuControl::new(config)),
        overlays,
    ))
}
