use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Console logging plus, when `log_dir` is given, a daily-rolling file.
/// `RUST_LOG` controls the filter; the default is `info`. Call once from
/// the binary; the library only emits events.
pub fn init_logging(log_dir: Option<&str>) -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (non_blocking_stdout, stdout_guard) = non_blocking(std::io::stdout());
    let console_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(false);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = rolling::daily(dir, "labdock.log");
            let (non_blocking_file, file_guard) = non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            registry.with(file_layer).init();

            // Guards live for the whole process so buffered lines flush
            std::mem::forget(file_guard);
            info!("logging to console and {}/labdock.log", dir);
        }
        None => {
            registry.init();
        }
    }
    std::mem::forget(stdout_guard);

    Ok(())
}
