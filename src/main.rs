use std::net::TcpListener;
use std::process;
use std::sync::Arc;

use pingora::services::background::background_service;
use pingora_core::server::configuration::{Opt, ServerConf};
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use conductor::config::Config;
use conductor::logging;
use conductor::proxy::balancer;
use conductor::proxy::router::MountTable;
use conductor::proxy::sync::RegistrySync;
use conductor::registry::ConsulRegistry;
use conductor::service::http::HttpService;

const CODE_NAME: &str = "The Canadian Dream";

fn main() {
    let config = Config::load();

    if config.version {
        println!("Conductor {}, '{}'", env!("CARGO_PKG_VERSION"), CODE_NAME);
        return;
    }

    if let Err(e) = logging::init(&config) {
        eprintln!("{e}");
        process::exit(1);
    }

    // A panicking worker task must take the whole process down, not just its
    // runtime thread.
    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
        process::exit(1);
    }));

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        code_name = CODE_NAME;
        "Starting Conductor"
    );

    let Some(builder) = balancer::policy_builder(&config.load_balancer) else {
        log::error!(
            loadbalancer = config.load_balancer.as_str();
            "Unknown loadbalancer algorithm"
        );
        process::exit(1);
    };

    log::debug!(
        consul = config.consul_host.as_str(),
        data_center = config.consul_datacenter.as_str(),
        kv_prefix = config.kv_prefix.as_str();
        "Connecting to consul"
    );
    let registry = match ConsulRegistry::new(
        &config.consul_host,
        &config.consul_datacenter,
        &config.kv_prefix,
    ) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            log::error!(
                consul = config.consul_host.as_str(),
                data_center = config.consul_datacenter.as_str(),
                error = e.to_string().as_str(),
                action = "connect";
                "Could not connect to consul!"
            );
            process::exit(1);
        }
    };

    // Claim the listen port up front so a busy port is a clean startup
    // failure instead of an abort inside the server runtime.
    let listen_addr = format!("0.0.0.0:{}", config.port);
    if let Err(e) = TcpListener::bind(&listen_addr) {
        log::error!(
            address = listen_addr.as_str(),
            error = e.to_string().as_str();
            "Could not bind HTTP listen port"
        );
        process::exit(1);
    }

    let mounts = Arc::new(MountTable::default());
    let sync = background_service(
        "registry sync",
        RegistrySync::new(registry, mounts.clone(), builder),
    );

    let mut server = Server::new_with_opt_and_conf(None::<Opt>, ServerConf::default());
    server.bootstrap();

    let mut http_service = http_proxy_service_with_name(
        &server.configuration,
        HttpService::new(mounts),
        "conductor",
    );
    http_service.add_tcp(&listen_addr);

    server.add_service(http_service);
    server.add_service(sync);

    log::info!(port = config.port; "Starting HTTP server");
    server.run_forever();
}
