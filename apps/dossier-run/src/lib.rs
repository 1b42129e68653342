use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use color_eyre::eyre;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use dossier_domain::{Identifier, IdentifierKind};
use dossier_service::{Engine, Registry, lookups};
use dossier_storage::InvestigationSnapshot;

#[derive(Debug, Parser)]
#[command(
	version = dossier_cli::VERSION,
	rename_all = "kebab",
	styles = dossier_cli::styles(),
	group(
		ArgGroup::new("subject")
			.required(true)
			.multiple(true)
			.args(["name", "email", "domain", "phone", "username", "resume"]),
	),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, value_name = "NAME")]
	pub name: Vec<String>,
	#[arg(long, value_name = "EMAIL")]
	pub email: Vec<String>,
	#[arg(long, value_name = "DOMAIN")]
	pub domain: Vec<String>,
	#[arg(long, value_name = "PHONE")]
	pub phone: Vec<String>,
	#[arg(long, value_name = "USERNAME")]
	pub username: Vec<String>,
	/// Continue a halted investigation instead of seeding a new one.
	#[arg(
		long,
		value_name = "FILE",
		conflicts_with_all = ["name", "email", "domain", "phone", "username"],
	)]
	pub resume: Option<PathBuf>,
	/// Where to write the investigation snapshot once the run stops.
	#[arg(long, short = 'o', value_name = "FILE")]
	pub out: Option<PathBuf>,
}
impl Args {
	pub fn seeds(&self) -> Vec<Identifier> {
		[
			(IdentifierKind::Name, &self.name),
			(IdentifierKind::Email, &self.email),
			(IdentifierKind::Domain, &self.domain),
			(IdentifierKind::Phone, &self.phone),
			(IdentifierKind::Username, &self.username),
		]
		.into_iter()
		.flat_map(|(kind, values)| values.iter().map(move |value| Identifier::new(kind, value)))
		.collect()
	}
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = dossier_config::load(&args.config)?;

	init_tracing(&config);

	let registry = Registry::from_catalog(&config, lookups::builtin_catalog(&config)?)?;

	tracing::info!(modules = registry.len(), "Module registry loaded.");

	let mut engine = match &args.resume {
		Some(path) => {
			let snapshot = InvestigationSnapshot::read(path)?;

			tracing::info!(path = %path.display(), "Resuming investigation.");

			Engine::resume(config, registry, snapshot)?
		},
		None => {
			let seeds = args.seeds();

			if seeds.is_empty() {
				return Err(eyre::eyre!("At least one seed identifier is required."));
			}

			Engine::from_seeds(config, registry, &seeds, OffsetDateTime::now_utc())?
		},
	};
	let cancel = engine.cancel_token();
	let interrupt = tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::warn!("Interrupted; cancelling the investigation.");

			cancel.cancel();
		}
	});
	let summary = engine.run().await;

	interrupt.abort();

	if let Some(path) = &args.out {
		engine.snapshot().write(path)?;

		tracing::info!(path = %path.display(), "Snapshot written.");
	}

	let summary = summary?;

	println!("{}", serde_json::to_string_pretty(&summary)?);

	Ok(())
}

fn init_tracing(config: &dossier_config::Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seeds_are_collected_in_kind_order() {
		let args = Args::try_parse_from([
			"dossier-run",
			"-c",
			"dossier.toml",
			"--domain",
			"Example.COM",
			"--name",
			"Jane Doe",
		])
		.expect("Arguments must parse.");
		let seeds = args.seeds();

		assert_eq!(seeds.len(), 2);
		assert_eq!(seeds[0].kind, IdentifierKind::Name);
		assert_eq!(seeds[1].kind, IdentifierKind::Domain);
	}

	#[test]
	fn a_subject_or_snapshot_is_required() {
		assert!(Args::try_parse_from(["dossier-run", "-c", "dossier.toml"]).is_err());
		assert!(
			Args::try_parse_from([
				"dossier-run",
				"-c",
				"dossier.toml",
				"--resume",
				"run.json",
				"--name",
				"Jane Doe",
			])
			.is_err()
		);
		assert!(
			Args::try_parse_from(["dossier-run", "-c", "dossier.toml", "--resume", "run.json"])
				.is_ok()
		);
	}
}
