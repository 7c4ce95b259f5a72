#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use clap::Parser;
use kyverno_artifact_operator::k8s::{CustomResourceExt, KyvernoArtifact};
use kyverno_artifact_operator::runtime::gc::GcArgs;
use kyverno_artifact_operator::runtime::{controller, gc, watcher, Mode, ProcessEnv};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--print-crd") {
        println!("{}", serde_yaml::to_string(&KyvernoArtifact::crd())?);
        return Ok(());
    }

    match Mode::detect(&args) {
        Mode::Watcher => watcher::run(&ProcessEnv).await,
        Mode::GarbageCollector => {
            // The mode token is not a flag; strip it before parsing.
            let rest = args
                .iter()
                .filter(|arg| arg.as_str() != "gc" && arg.as_str() != "--garbage-collect")
                .cloned();
            let gc_args = GcArgs::parse_from(std::iter::once("gc".to_string()).chain(rest));
            gc::run(gc_args).await
        }
        Mode::Controller => controller::run(&ProcessEnv).await,
    }
}
