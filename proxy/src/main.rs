use std::path::PathBuf;

use clap::Parser;
use proxy::app;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "./config/config.json";

#[derive(Parser, Debug)]
#[command(name = "proxy", about = "Reverse proxy data plane", disable_version_flag = true)]
struct Args {
	/// Path to the config document. Falls back to `PROXY_CONFIG_PATH`, then
	/// `./config/config.json`.
	#[arg(short = 'c', long = "config", value_name = "PATH", env = "PROXY_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
	config: PathBuf,

	/// Parse and validate the config document, then exit without starting any listener.
	#[arg(long)]
	validate_only: bool,

	/// Print the version and exit.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if args.version {
		println!("proxy {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if args.validate_only {
				return match app::validate_only(args.config).await {
					Ok(()) => {
						println!("Configuration is valid!");
						Ok(())
					},
					Err(e) => {
						eprintln!("Configuration is invalid: {e}");
						std::process::exit(1);
					},
				};
			}

			let bound = app::run(args.config).await?;
			info!("proxy {} ready", env!("CARGO_PKG_VERSION"));
			bound.wait_termination().await
		})
}
