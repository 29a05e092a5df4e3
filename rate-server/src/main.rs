//! Точка входа `rate-server`.
//!
//! Жизненный цикл:
//! - парсинг CLI и загрузка начальных значений (они же задают список топиков)
//! - запуск потока рассылки котировок
//! - HTTP-лента котировок в отдельном потоке
//! - accept-цикл TCP: рукопожатие, подписки, отписки
//! - корректная остановка по `Ctrl+C`

mod broadcast;
mod cli;
mod config;
mod generator;
mod http;
mod registry;
mod tcp;

use std::sync::{Arc, atomic::AtomicBool, atomic::AtomicU64, atomic::Ordering};
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use crate::generator::{GeneratorConfig, RateGenerator};
use crate::registry::SubscriberRegistry;

fn main() -> anyhow::Result<()> {
    // Логи через RUST_LOG=info/debug
    env_logger::init();

    let shutdown = Arc::new(AtomicBool::new(false));

    // Ctrl+C => ставим shutdown=true
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
            info!("shutting down...");
        })?;
    }

    let args = cli::Args::parse();

    let seeds = config::load_server_seeds(args.seeds_file.clone()).context("load seeds")?;
    info!(
        "Starting rate-server: tcp={}, topics={}",
        args.tcp_bind,
        seeds.keys().cloned().collect::<Vec<_>>().join(",")
    );

    let registry = Arc::new(SubscriberRegistry::new(seeds.keys().cloned()));
    let generator = RateGenerator::new(&seeds, GeneratorConfig::default());

    let broadcaster = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let cfg = args.broadcast_config();
        thread::spawn(move || broadcast::run_broadcaster(registry, generator, cfg, shutdown))
    };

    let http_seeds =
        config::load_http_seeds(args.http_seeds_file.clone()).context("load http seeds")?;
    let feed = Arc::new(http::RateFeed::new(
        &http_seeds,
        GeneratorConfig::http_feed(),
        args.feed_config(),
    ));
    let http_listener = http::bind_http(args.http_bind)?;
    let http_server = {
        let shutdown = shutdown.clone();
        thread::spawn(move || http::run_http_server(http_listener, feed, shutdown))
    };

    let curr_client_id = Arc::new(AtomicU64::new(1));
    let res = tcp::run_tcp_listener(args.tcp_bind, registry, curr_client_id, shutdown.clone());

    shutdown.store(true, Ordering::Relaxed);
    if broadcaster.join().is_err() {
        warn!("broadcaster thread panicked");
    }
    match http_server.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("http server failed: {e:#}"),
        Err(_) => warn!("http server thread panicked"),
    }

    res
}
