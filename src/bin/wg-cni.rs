use anyhow::Result;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wg_cni::commands::{run_cni, Outcome};

fn main() -> Result<()> {
    // Set up tracing; stdout belongs to the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // Run the CNI plugin
    match run_cni() {
        Ok(Outcome::Printed(json)) => println!("{}", json),
        Ok(Outcome::Silent) => {}
        Err(failure) => {
            error!("CNI plugin error: {}", failure.error);

            // Output error in CNI format
            failure.result().print()?;
            std::process::exit(1);
        }
    }

    Ok(())
}
