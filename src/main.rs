use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credrotate::cli::Cli;
use credrotate::config;
use credrotate::configfile::SqlConf;
use credrotate::db::MySqlAdmin;
use credrotate::health::HealthValidator;
use credrotate::reconcile::DriftReconciler;
use credrotate::refresh::EcsRefresher;
use credrotate::rotate::{RotateOptions, Rotator};
use credrotate::secrets::aws::SecretsManagerStore;
use credrotate::secrets::SecretStore;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.log_json);

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let conf = SqlConf::new(cfg.sqlconf_path(), cfg.file_uid, cfg.file_gid);

    // Permission repair needs no collaborators beyond the mount.
    if args.fix_permissions {
        return match conf.fix_permissions() {
            Ok(()) => {
                println!(
                    "config file permissions repaired: {}",
                    conf.path().display()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("permission fix failed: {e}");
                ExitCode::from(e.exit_code())
            }
        };
    }

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = cfg.aws_region.clone() {
        loader = loader.region(aws_config::Region::new(region));
    }
    let sdk = loader.load().await;

    let store = SecretsManagerStore::new(&sdk, &cfg.slot_secret_id, &cfg.admin_secret_id);

    // The cluster endpoint lives in the slot secret, not the environment.
    let seed = match store.get_slot_secret().await {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("cannot read slot secret: {e}");
            return ExitCode::from(e.exit_code());
        }
    };
    let db = match MySqlAdmin::for_endpoint(seed.slot(seed.active_slot)) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if args.sync_db_users {
        let reconciler = DriftReconciler::new(&store, &db, &conf, args.dry_run);
        return match reconciler.sync_users().await {
            Ok(r) => {
                println!(
                    "DB users in sync with secret ({} repair{})",
                    r.repairs.len(),
                    if r.repairs.len() == 1 { "" } else { "s" }
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("user sync failed: {e}");
                ExitCode::from(e.exit_code())
            }
        };
    }

    let refresher = EcsRefresher::new(&sdk, &cfg.ecs_cluster, &cfg.ecs_service);
    let health = HealthValidator::new(cfg.healthcheck_url.clone());
    let shutdown = spawn_signal_listener();

    let rotator = Rotator::new(
        &store,
        &db,
        &conf,
        &refresher,
        &health,
        RotateOptions {
            dry_run: args.dry_run,
            deploy_timeout: cfg.deploy_timeout,
        },
        shutdown,
    );
    let outcome = rotator.run().await;

    println!("{}", outcome.status_line());
    ExitCode::from(outcome.exit_code())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "credrotate=info".into()),
    );
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// SIGTERM/SIGINT set a flag the rotator checks at step boundaries; no
/// step is interrupted mid-flight.
fn spawn_signal_listener() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let listener_flag = flag.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut term), Ok(mut int)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            tracing::error!("could not install signal handlers");
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tracing::warn!("termination signal received, finishing current step");
        listener_flag.store(true, Ordering::Relaxed);
    });
    flag
}
