//! Authoritative and recursive DNS server with per-record load balancing.
//!
//! Try queries such as:
//!
//!   dig @127.0.0.1 -p 15353 A www.example.com
//!   dig @127.0.0.1 -p 15353 MX example.com
//!   dig @127.0.0.1 -p 15353 +tcp A www.example.com
//!
//! Zone transfers run over TCP with the `axfr.` TSIG key:
//!
//!   dig @127.0.0.1 -p 15353 AXFR example.com

use core::future::pending;
use core::time::Duration;

use std::process::exit;
use std::sync::Arc;

use domain::net::server::buf::VecBufSource;
use domain::net::server::dgram::DgramServer;
use domain::net::server::middleware::mandatory::MandatoryMiddlewareSvc;
use domain::net::server::stream::StreamServer;
use tokio::net::{TcpListener, UdpSocket};

use crate::channels::ChannelManager;
use crate::forwarder::Forwarder;
use crate::limiter::Limiter;
use crate::master::Master;
use crate::service::middleware::{AxfrKeyStore, MetricsMiddlewareSvc, Stats, TsigMiddlewareSvc};

#[macro_use]
mod error;

mod cache;
mod channels;
mod config;
mod forwarder;
mod limiter;
mod logger;
mod master;
mod message;
mod service;

#[tokio::main]
async fn main() {
    // Fetch the configuration
    let config_path = std::env::var("DNSLB_CONFIG").unwrap_or(config::BASE_CONFIG_FILE.into());
    let bytes = match std::fs::read(&config_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read config file at path {}: {}", config_path, e);
            exit(1);
        }
    };
    let config = match config::Config::try_from(&bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to parse config file at path {}: {}", config_path, e);
            exit(1);
        }
    };

    // Initialize the custom logger
    logger::Logger::new()
        .with_level(config.log.level)
        .with_metrics(config.log.enable_metrics)
        .init()
        .expect("Failed to initialize custom logger");

    let config = Arc::new(config);

    // Bring up the three record subsystems and the channel feed
    let master = match Master::from_config(&config.master) {
        Ok(master) => Arc::new(master),
        Err(e) => {
            log::error!(target: "master", "failed to load dnssec keys: {}", e);
            exit(1);
        }
    };
    let forwarder = Forwarder::new(config.forwarder.clone());
    forwarder.start();
    let limiter = Limiter::start(config.limiter);
    let _channels = ChannelManager::start(master.clone());

    let keystore = match AxfrKeyStore::from_secret(&config.axfer_password) {
        Ok(keystore) => keystore,
        Err(e) => {
            log::error!(target: "tsig", "failed to build the transfer key: {}", e);
            exit(1);
        }
    };

    // Create the dispatcher service and its middleware stack
    let report_master = master.clone();
    let report_forwarder = forwarder.clone();
    let dnslb = service::Dnslb {
        config: config.clone(),
        master,
        forwarder,
        limiter,
    };
    let stats = Stats::new_shared();

    let dnslb_svc = MandatoryMiddlewareSvc::new(dnslb);
    let dnslb_svc = TsigMiddlewareSvc::new(keystore, dnslb_svc);
    let dnslb_svc = MetricsMiddlewareSvc::new(dnslb_svc, stats.clone());

    let addr = config.addr.clone();

    // Start the UDP and TCP servers
    let sock = match UdpSocket::bind(&addr).await {
        Ok(sock) => sock,
        Err(e) => {
            log::error!(target: "server", "failed to bind udp listener on {}: {}", addr, e);
            exit(1);
        }
    };
    let sock = Arc::new(sock);
    let num_cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    for _i in 0..num_cores {
        let udp_srv = DgramServer::new(sock.clone(), VecBufSource, dnslb_svc.clone());
        tokio::spawn(async move { udp_srv.run().await });
    }

    let sock = match TcpListener::bind(&addr).await {
        Ok(sock) => sock,
        Err(e) => {
            log::error!(target: "server", "failed to bind tcp listener on {}: {}", addr, e);
            exit(1);
        }
    };
    let tcp_srv = StreamServer::new(sock, VecBufSource, dnslb_svc.clone());
    tokio::spawn(async move { tcp_srv.run().await });

    log::info!(target: "server", "listening on {} (udp x{}, tcp)", addr, num_cores);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            log::info!(target: "metrics", "metrics report: {}", stats.read().unwrap());
            if log::log_enabled!(target: "metrics", log::Level::Trace) {
                log::trace!(target: "metrics", "master records: {}",
                    report_master.records_json());
                log::trace!(target: "metrics", "forwarder records: {}",
                    report_forwarder.records_json());
            }
        }
    });

    pending::<()>().await;
}
