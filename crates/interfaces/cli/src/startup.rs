use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{error, info};

use bounce_config::AppConfig;
use bounce_exec::{NotificationSink, ScriptConverter, build_destination, build_notifier};
use bounce_runtime::{Collaborators, count_audio_folders, initial_roots};

const ERROR_TITLE: &str = "Bounce Watcher Error";

async fn fail(notifier: &Arc<dyn NotificationSink>, message: String) -> anyhow::Error {
    error!("{message}");
    notifier.notify(ERROR_TITLE, &message, None).await;
    anyhow::anyhow!(message)
}

/// Build the collaborators from config, refusing to start when the
/// destination is unreachable or the conversion script is missing.
pub(crate) async fn prepare_collaborators(config: &AppConfig, no_notify: bool) -> Result<Collaborators> {
    let notifier = build_notifier(!no_notify);

    if let Err(err) = config.validate() {
        return Err(fail(&notifier, format!("Invalid configuration: {err}")).await);
    }

    let destination = build_destination(&config.destination);
    if let Err(err) = destination.probe().await {
        return Err(fail(&notifier, format!("Failed to initialize destination: {err}")).await);
    }
    info!(mode = destination.label(), path = %config.destination.active_path().display(), "destination ready");

    let converter = match ScriptConverter::from_config(&config.conversion) {
        Ok(converter) => converter,
        Err(err) => return Err(fail(&notifier, format!("Failed to initialize converter: {err}")).await),
    };
    info!(script = %converter.script().display(), "converter ready");

    Ok(Collaborators {
        converter: Arc::new(converter),
        destination,
        notifier,
    })
}

/// `bounce-watcher check`: report on everything startup depends on.
pub(crate) async fn run_check(config: &AppConfig) -> Result<()> {
    let mut problems = 0;

    match config.validate() {
        Ok(()) => println!("[ok]   configuration is valid"),
        Err(err) => {
            println!("[fail] {err}");
            problems += 1;
        }
    }

    let destination = build_destination(&config.destination);
    match destination.probe().await {
        Ok(()) => println!(
            "[ok]   destination ({}) {}",
            destination.label(),
            config.destination.active_path().display()
        ),
        Err(err) => {
            println!("[fail] destination ({}): {err}", destination.label());
            problems += 1;
        }
    }

    match ScriptConverter::from_config(&config.conversion) {
        Ok(converter) => println!("[ok]   conversion script {}", converter.script().display()),
        Err(err) => {
            println!("[fail] {err}");
            problems += 1;
        }
    }

    let roots = initial_roots(&config.source)?;
    if roots.is_empty() {
        println!("[fail] No valid watch paths found");
        problems += 1;
    } else {
        println!("[ok]   {} watch root(s):", roots.len());
        for root in &roots {
            let found = count_audio_folders(root, &config.source.audio_files_folder);
            println!(
                "         {} ({found} '{}' folder(s))",
                root.display(),
                config.source.audio_files_folder
            );
        }
    }

    if problems > 0 {
        bail!("{problems} problem(s) found");
    }
    println!("everything looks good");
    Ok(())
}
