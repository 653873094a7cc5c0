use std::io::Write;

use lampada_sync::{config::LampConfig, dashboard::Dashboard, error::SyncError, sync, view::DashboardView};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), SyncError> {
	env_logger::init();
	let config = match LampConfig::from_env() {
		Ok(config) => config,
		Err(SyncError::ConfigurationMissing(missing)) => {
			print!("{}", DashboardView::missing_configuration(missing));
			return Ok(());
		}
		Err(e) => return Err(e),
	};

	info!("using the {:?} transport", config.transport());
	let mut dashboard = Dashboard::new(sync::from_config(&config)?);
	print!("{}", dashboard.view());
	dashboard.mount().await?;

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			updated = dashboard.next_update() => {
				if !updated {
					break;
				}
				print!("{}", dashboard.view());
			}
			line = lines.next_line() => match line {
				Ok(Some(line)) => {
					if !handle_input(&dashboard, line.trim()).await {
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					error!("reading stdin: {}", e);
					break;
				}
			}
		}
		let _ = std::io::stdout().flush();
	}
	dashboard.unmount();
	Ok(())
}

/// Runs one line of user input. Returns `false` when the user asked to quit.
async fn handle_input(dashboard: &Dashboard, input: &str) -> bool {
	let mut words = input.split_whitespace();
	let result = match (words.next(), words.next()) {
		(Some("q"), _) => return false,
		(Some("t"), _) => dashboard.toggle().await,
		(Some("s"), Some(value)) => match value.parse::<i64>() {
			Ok(value) => dashboard.slide(value).await,
			Err(_) => {
				println!("not a number: {value}");
				return true;
			}
		},
		(None, _) => {
			print!("{}", dashboard.view());
			return true;
		}
		_ => {
			println!("t = toggle, s <0-4095> = color, q = quit");
			return true;
		}
	};
	match result {
		Ok(()) => {}
		Err(SyncError::CommandWithoutSession) => println!("Not connected, command not sent."),
		Err(e) => {
			warn!("command failed: {}", e);
			println!("Command failed: {e}");
		}
	}
	true
}
