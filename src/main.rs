//! Repartir CLI: distributed transformer inference over TCP
//!
//! Run a root (`inference`, `chat`, `perplexity`) or join a cluster as a
//! `worker`.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use repartir::app::{
    handle_chat, handle_inference, handle_perplexity, run_inference_app, run_worker_app,
};
use repartir::cli::{AppArgs, Mode};
use repartir::error::Result;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(args: &AppArgs) -> Result<()> {
    match args.mode {
        Mode::Inference => run_inference_app(args, handle_inference),
        Mode::Chat => run_inference_app(args, handle_chat),
        Mode::Perplexity => run_inference_app(args, handle_perplexity),
        Mode::Worker => run_worker_app(args),
    }
}

fn main() {
    init_tracing();
    let args = AppArgs::parse();
    if let Err(e) = run(&args) {
        println!("Critical error: {e}");
        std::process::exit(1);
    }
}
