use clap::Parser;
use fixtures::{blob_store::BlobFixture, run_server, FixtureArgs};

/// Blob service fixture for local development
#[derive(Parser, Debug)]
#[clap(name = "blob-store-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Require this bearer key on every request
    #[arg(long, env = "BLOB_STORE_API_KEY")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fixture = match cli.api_key {
        Some(key) => BlobFixture::new().with_api_key(key),
        None => BlobFixture::new(),
    };

    run_server(cli.common, move |addr| fixture.router(addr)).await
}
