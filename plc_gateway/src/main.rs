use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use plc_gateway::api::rest::{create_api_routes, AppState};
use plc_gateway::config::settings::Settings;
use plc_gateway::drivers::compactlogix::CompactLogixDriver;
use plc_gateway::drivers::mock::MockDriver;
use plc_gateway::drivers::slc500::Slc500Driver;
use plc_gateway::drivers::traits::{DriverConfig, PlcDriver, RawValue};
use plc_gateway::health::HealthRegistry;
use plc_gateway::logging::init_logging;
use plc_gateway::opcua::run_opcua_server;
use plc_gateway::poll::{PollObserver, Poller};
use plc_gateway::tags::store::TagStore;
use plc_gateway::tags::structures::{Datatype, PlcName, TagRecord, Value};

#[tokio::main]
async fn main() {
    init_logging();
    info!("PLC gateway starting");

    // --- Load & validate configuration ---
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        error!(error = %e, "invalid configuration");
        exit(1);
    }

    if let Some(port) = settings.metrics_port() {
        plc_gateway::metrics::install_exporter(port);
    }

    // --- Core collaborators ---
    let plcs = settings.plcs();
    let health = Arc::new(HealthRegistry::new(settings.ready_file_path()));
    let store = TagStore::new(plcs.iter().map(|(p, _)| *p).collect::<HashSet<_>>());
    let shutdown = CancellationToken::new();

    // Shared so a running process (or test harness) can clear it.
    let mock_fail = Arc::new(AtomicBool::new(settings.mock_fail_reconnect()));

    // --- Pollers, one per controller ---
    let mut writers = HashMap::new();
    let mut poller_tasks = Vec::new();
    for (plc, endpoint) in &plcs {
        health.register(*plc, endpoint.clone());
        let driver_config = DriverConfig {
            plc: *plc,
            endpoint: endpoint.clone(),
            socket_timeout: settings.socket_timeout(),
        };
        let driver: Box<dyn PlcDriver> = if settings.mock_plc() {
            let mut mock = MockDriver::new(driver_config, Arc::clone(&mock_fail));
            seed_mock(&mut mock, *plc);
            Box::new(mock)
        } else {
            match plc {
                PlcName::CompactLogix => Box::new(CompactLogixDriver::new(driver_config)),
                PlcName::Slc500 => Box::new(Slc500Driver::new(driver_config)),
                PlcName::Mock => Box::new(MockDriver::new(driver_config, Arc::clone(&mock_fail))),
            }
        };
        let observer: Arc<dyn PollObserver> = health.clone();
        let (poller, handle) = Poller::new(
            driver,
            store.clone(),
            observer,
            settings.poll_settings(),
            shutdown.clone(),
        );
        writers.insert(*plc, handle);
        poller_tasks.push(tokio::spawn(poller.run()));
    }
    info!(count = plcs.len(), mock = settings.mock_plc(), "pollers started");

    prepopulate(&store, &settings);
    health.set_prepopulated();

    let writers = Arc::new(writers);

    // --- OPC UA server (optional capability) ---
    tokio::spawn(run_opcua_server(
        settings.opcua_port,
        store.clone(),
        Arc::clone(&writers),
        settings.poll_settings().poll_period,
        shutdown.clone(),
    ));

    // --- Signal handling ---
    {
        let health = Arc::clone(&health);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                health.set_stopping();
                shutdown.cancel();
            }
        });
    }

    // --- REST API server ---
    let state = AppState {
        store: store.clone(),
        health: Arc::clone(&health),
        writers,
        shutdown: shutdown.clone(),
    };
    let app = create_api_routes().with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind REST listener");
            exit(2);
        }
    };
    info!(%addr, "REST API listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });
    if let Err(e) = serve.await {
        error!(error = %e, "REST server error");
    }

    // --- Drain ---
    health.set_stopping();
    shutdown.cancel();
    let drain = async {
        for task in poller_tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        warn!("pollers did not stop within the drain deadline");
    }

    info!("gateway stopped");
    exit(0);
}

/// Pre-load the mock register banks so the demo tag set reads Good from the
/// first cycle.
fn seed_mock(mock: &mut MockDriver, plc: PlcName) {
    match plc {
        PlcName::CompactLogix => {
            mock.seed("Main.Temp", RawValue::Int(215));
            mock.seed("Main.Count", RawValue::Int(7));
        }
        PlcName::Slc500 => {
            mock.seed("N7:0", RawValue::Int(1200));
            mock.seed("F8:1", RawValue::Real(3.75));
        }
        PlcName::Mock => {}
    }
}

/// Startup tag set. Mock mode seeds a small demo table; real mode starts
/// empty and tags arrive over `POST /api/v1/tags`.
fn prepopulate(store: &TagStore, settings: &Settings) {
    if !settings.mock_plc() {
        return;
    }
    let demo: [(&str, PlcName, &str, Datatype, u32); 4] = [
        ("clx_temp", PlcName::CompactLogix, "Main.Temp", Datatype::Decimal, 1),
        ("clx_count", PlcName::CompactLogix, "Main.Count", Datatype::Int, 0),
        ("slc_speed", PlcName::Slc500, "N7:0", Datatype::Int, 0),
        ("slc_flow", PlcName::Slc500, "F8:1", Datatype::Real, 0),
    ];
    for (id, plc, address, datatype, scale) in demo {
        match TagRecord::new(id, plc, address, datatype, Value::Null, true, scale) {
            Ok(record) => {
                if let Err(e) = store.insert(record) {
                    warn!(tag = id, error = %e, "prepopulation insert failed");
                }
            }
            Err(e) => warn!(tag = id, error = %e, "prepopulation failed"),
        }
    }
    info!(count = store.len(), "prepopulated demo tags");
}
