//! Bridge a wasm network engine to a kernel TAP device
//!
//! ```text
//! sudo cargo run --example tap_bridge --features wasm,host-tap -- engine.wasm tap0 10.0.0.2/24 10.0.0.254/24
//! ```
//!
//! The engine gets `10.0.0.2`, the host side of `tap0` gets `10.0.0.254`.
//! Set `TAP_BRIDGE_CONFIG` to a TOML file to override queue depths.

use std::env;
use std::process::ExitCode;

use tap_bridge::{
    HostTap, InterfaceOptions, Ipv4Cidr, StackConfig, TapError, TapStack, WasmEngine,
};
use tokio::task::LocalSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<StackConfig, TapError> {
    match env::var("TAP_BRIDGE_CONFIG") {
        Ok(path) => StackConfig::from_toml_str(&std::fs::read_to_string(path)?),
        Err(_) => Ok(StackConfig::default()),
    }
}

async fn run(args: &[String]) -> Result<(), TapError> {
    let [engine_path, tap_name, engine_cidr, host_cidr] = args else {
        return Err(TapError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "usage: tap_bridge <engine.wasm> <tap-name> <engine-cidr> <host-cidr>",
        )));
    };

    let config = load_config()?;
    let engine = WasmEngine::from_file(engine_path)?;
    let stack = TapStack::spawn_local(engine, config.clone());

    let iface = stack.create(&InterfaceOptions::new().ip(engine_cidr.as_str()))?;
    iface.enable()?;
    info!(
        handle = %iface.handle(),
        mac = %iface.mac_address()?,
        cidr = %engine_cidr,
        "engine interface up"
    );

    let host = HostTap::open(tap_name)?;
    host.configure(&host_cidr.parse::<Ipv4Cidr>()?)?;
    host.bridge(&iface, config.frame_queue_depth).await?;

    let stats = iface.stats();
    info!(?stats, "bridge finished");
    stack.remove(&iface)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match LocalSet::new().block_on(&runtime, run(&args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "tap bridge failed");
            ExitCode::FAILURE
        }
    }
}
