use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = dossier_run::Args::parse();

	dossier_run::run(args).await
}
