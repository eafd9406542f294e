use backend::handle;
use backend::inference::torch::TorchModelProvider;
use shared::{InferenceResponse, status};
use std::io::{self, BufRead, Write};

/// Reads one JSON event per line from stdin and writes one response envelope
/// per line to stdout.
fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let models = TorchModelProvider::global().map_err(|e| {
        log::error!("Invalid handler configuration: {}", e);
        io::Error::other(format!("Configuration failed: {}", e))
    })?;
    log::info!(
        "Model directory: {}",
        models.config().models.dir.display()
    );
    if let Err(e) = models.preload() {
        log::error!("Failed to preload models at startup: {}", e);
        return Err(io::Error::other(format!("Model loading failed: {}", e)));
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(event) => handle(&event),
            Err(e) => {
                log::error!("Malformed event: {}", e);
                InferenceResponse::error(status::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        serde_json::to_writer(&mut stdout, &response)?;
        writeln!(stdout)?;
        stdout.flush()?;
    }
    Ok(())
}
