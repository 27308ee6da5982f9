use axum::serve;
use clap::Parser;
use fleetmond::config::Config;
use fleetmond::db::Pool;
use fleetmond::metrics::Metrics;
use fleetmond::probe::Probe;
use fleetmond::scanner::Scanner;
use fleetmond::scheduler::Scheduler;
use fleetmond::{http, model};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./fleetmond.toml")]
    config: String,
    /// Directory holding the database file.
    #[arg(long, default_value = ".")]
    data_dir: String,
    /// Register a network (CIDR) before starting, e.g. 192.168.0.0/24.
    #[arg(long)]
    add_network: Option<String>,
    /// Description stored with --add-network.
    #[arg(long, default_value = "", requires = "add_network")]
    network_desc: String,
    /// Checkpoint, vacuum, reindex and analyze the database, then exit.
    #[arg(long)]
    maintenance: bool,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_toml());
        return;
    }

    let cfg = match Config::load_or_create(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("не удалось загрузить конфигурацию: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg);

    info!(
        config = %cli.config,
        port = cfg.web.port,
        workers = cfg.scanner.workers,
        "запуск fleetmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let db_path = Path::new(&cli.data_dir).join("fleetmond.db");
    let pool = match Pool::new(&db_path, cfg.global.pool_size, metrics.clone()) {
        Ok(pool) => pool,
        Err(err) => {
            error!(path = %db_path.display(), error = %err, "не удалось открыть базу данных");
            std::process::exit(1);
        }
    };

    if cli.maintenance {
        match pool.borrow().await {
            Ok(mut store) => {
                if let Err(err) = store.perform_maintenance() {
                    error!(error = %err, "обслуживание базы данных не удалось");
                    std::process::exit(1);
                }
                info!("обслуживание базы данных завершено");
                return;
            }
            Err(err) => {
                error!(error = %err, "не удалось получить дескриптор базы данных");
                std::process::exit(1);
            }
        }
    }

    if let Some(addr) = &cli.add_network {
        if let Err(err) = register_network(&pool, addr, &cli.network_desc).await {
            error!(%addr, error = %err, "не удалось добавить сеть");
            std::process::exit(1);
        }
    }

    let probe = match Probe::new(&cfg) {
        Ok(p) => Arc::new(p),
        Err(err) => {
            error!(error = %err, "не удалось создать пробу");
            std::process::exit(1);
        }
    };

    let scanner = match Scanner::new(pool.clone(), &cfg, metrics.clone()) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            error!(error = %err, "не удалось создать сканер");
            std::process::exit(1);
        }
    };
    scanner.start();

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let scanner_task = tokio::spawn(Arc::clone(&scanner).run(cmd_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        Arc::clone(&probe),
        cmd_tx.clone(),
        &cfg,
        metrics.clone(),
    ));
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));

    let http_task = {
        let metrics = metrics.clone();
        let pool = pool.clone();
        let scanner = Arc::clone(&scanner);
        let port = cfg.web.port;
        let live_timeout = cfg.live_timeout().as_secs() as i64;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, pool, scanner, live_timeout);
            let addr = SocketAddr::from(([0, 0, 0, 0], port));

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, %addr, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    scheduler.stop();
    scanner.stop();

    let _ = scheduler_task.await;
    drop(scheduler);
    drop(cmd_tx);
    let _ = scanner_task.await;
    let _ = http_task.await;
}

async fn register_network(pool: &Pool, addr: &str, desc: &str) -> Result<(), String> {
    let mut net = model::Network::new(addr, desc).map_err(|e| e.to_string())?;
    let mut store = pool.borrow().await.map_err(|e| e.to_string())?;

    if let Some(existing) = store
        .network_get_by_addr(&net.addr)
        .map_err(|e| e.to_string())?
    {
        info!(network = %existing.addr, id = existing.id, "сеть уже зарегистрирована");
        return Ok(());
    }

    store.network_add(&mut net).map_err(|e| e.to_string())?;
    info!(network = %net.addr, id = net.id, "сеть зарегистрирована");
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let level = if cfg.global.debug {
        "debug"
    } else {
        cfg.global.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
