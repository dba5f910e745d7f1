//! omni service runner
//!
//! ```text
//! omni_core --service users|wallets|transactions|fraud|all [--env dev] [--port 8080]
//! ```
//!
//! `--service` also takes a comma list (`users,wallets`). `--port` and the
//! `PORT` variable only apply when a single service is hosted.

use omni_core::bootstrap::{parse_services, run};
use omni_core::config::AppConfig;

// ============================================================
// ARGUMENTS
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    get_arg(&["--port"]).and_then(|p| p.parse().ok())
}

fn get_services() -> String {
    get_arg(&["--service", "-s"])
        .or_else(|| std::env::var("SERVICE").ok())
        .unwrap_or_else(|| "all".to_string())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let services = parse_services(&get_services())?;
    let single = if services.len() == 1 {
        Some(services[0])
    } else {
        None
    };

    let mut app_config = AppConfig::load(&env).unwrap_or_else(|e| {
        eprintln!("{:#}; falling back to defaults", e);
        AppConfig::default()
    });
    app_config.apply_env(single);
    if let (Some(service), Some(port)) = (single, get_port_override()) {
        app_config.services.set_port(service, port);
    }

    let _log_guard = omni_core::logging::init_logging(&app_config, single);
    tracing::info!("Starting omni in {} mode", env);

    run(app_config, services).await
}
