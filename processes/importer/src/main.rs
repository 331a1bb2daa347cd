//! 'main' for the mirror node importer process

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use mirror_common::messages::Message;
use std::sync::Arc;
use tracing::info;

use caryatid_module_spy::Spy;
use mirror_module_block_stream_downloader::BlockStreamDownloader;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, EnvFilter, Registry};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["importer.toml".to_string()])]
    config: Vec<String>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fjall=warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let fmt_layer = fmt::layer().with_filter(env_filter());

    // Span tracing only when OTEL_* variables are set
    if std::env::vars().any(|(name, _)| name.starts_with("OTEL_")) {
        let otel_exporter = SpanExporter::builder().with_tonic().build()?;
        let otel_tracer = SdkTracerProvider::builder()
            .with_batch_exporter(otel_exporter)
            .build()
            .tracer("mirror-importer");
        let otel_layer = OpenTelemetryLayer::new(otel_tracer)
            .with_filter(env_filter().add_directive(filter::LevelFilter::INFO.into()))
            .with_filter(filter::filter_fn(|meta| meta.is_span()));
        Registry::default().with(fmt_layer).with(otel_layer).init();
    } else {
        Registry::default().with(fmt_layer).init();
    }

    info!("Mirror node importer process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("MIRROR")).build()?);

    let mut process = Process::<Message>::create(config).await;

    BlockStreamDownloader::register(&mut process);
    Spy::<Message>::register(&mut process);

    process.run().await?;

    info!("Exiting");
    Ok(())
}
