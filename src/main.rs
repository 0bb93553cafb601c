use std::io::{self, BufRead, Write};

use hce_core::{
    config::Config,
    service::{EmulationRuntime, HceService},
    tag::DeactivationReason,
    telemetry,
};
use tokio::runtime::Handle;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    let runtime = EmulationRuntime::start(&config, Handle::current());

    let (_, mut events) = runtime.events().subscribe_channel();
    let resolver = runtime.resolver().clone();
    tokio::spawn(async move {
        while let Some(handle) = events.recv().await {
            match serde_json::to_string(&handle) {
                Ok(event) => {
                    let records = resolver
                        .record_channel(&handle)
                        .map(|channel| channel.records().records().len());
                    info!(%event, ?records, "Tag connected");
                }
                Err(e) => warn!(error = %e, "Couldn't serialize connection event"),
            }
        }
    });

    let service = runtime.create_service();
    // The host calls in synchronously, so stdin is driven from a blocking thread
    let service = tokio::task::spawn_blocking(move || host_loop(service)).await??;

    service.on_destroy();
    runtime.shutdown().await;
    Ok(())
}

/// Feeds hex APDUs from stdin to the service and prints the responses.
/// `deactivate <reason>` reports link loss, `quit` ends the session.
fn host_loop(mut service: HceService) -> io::Result<HceService> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Some(reason) = line.strip_prefix("deactivate") {
            match reason.trim().parse::<i32>() {
                Ok(code) => service.on_deactivated(DeactivationReason(code)),
                Err(e) => warn!(error = %e, "Deactivation reason must be an integer"),
            }
            continue;
        }

        match hex::decode(line.replace(' ', "")) {
            Ok(apdu) => {
                let response = service.process_command_apdu(&apdu);
                writeln!(stdout, "{}", hex::encode_upper(response))?;
                stdout.flush()?;
            }
            Err(e) => warn!(error = %e, "Input is not a hex APDU"),
        }
    }
    Ok(service)
}
