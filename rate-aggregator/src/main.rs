//! Точка входа `rate-aggregator`.
//!
//! Жизненный цикл:
//! - парсинг CLI, загрузка списка платформ и выбор калькулятора
//! - создание fetcher'ов и подключение; подписка по событию подключения
//! - цикл событий: кэширование, фильтр аномалий, публикация
//! - периодический расчёт кросс-курсов на общем таймере
//! - корректная остановка по `Ctrl+C`

mod cache;
mod calculator;
mod cli;
mod config;
mod coordinator;
mod error;
mod events;
mod fetcher;
mod publisher;
mod scheduler;

use std::sync::{Arc, atomic::AtomicBool, atomic::Ordering};

use anyhow::Context;
use clap::Parser;
use log::info;

use crate::cache::RateCaches;
use crate::calculator::CurrencyService;
use crate::coordinator::Coordinator;
use crate::events::EventSink;
use crate::fetcher::FetcherRegistry;
use crate::publisher::StdoutPublisher;
use crate::scheduler::Scheduler;

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
    args.validate()?;

    let configs = config::load_fetchers(args.fetchers.clone()).context("load fetchers")?;
    // неизвестный калькулятор: фатально
    let currency = CurrencyService::from_name(&args.calculator)?;

    info!(
        "Starting rate-aggregator: platforms={}, calculator={}, warmup={:?}, period={:?}",
        configs
            .iter()
            .map(|f| format!("{}({})", f.platform_name, f.kind))
            .collect::<Vec<_>>()
            .join(","),
        args.calculator,
        args.warmup(),
        args.period()
    );

    let scheduler = Arc::new(Scheduler::start().context("start scheduler")?);
    let coordinator = Arc::new(Coordinator::new(
        RateCaches::in_memory(args.cache_ttl()),
        Box::new(StdoutPublisher::new(args.topic.clone())),
        currency,
        scheduler.clone(),
    ));

    let (events, rx) = EventSink::channel();
    coordinator.start_calculation_job(args.warmup(), args.period());

    let connected = coordinator.start(&configs, &FetcherRegistry::with_defaults(), &events);
    info!("{connected}/{} platform(s) connected", configs.len());

    // дальше отправители только у fetcher'ов
    drop(events);
    coordinator::run_event_loop(&coordinator, &rx, &shutdown);

    coordinator.shutdown();
    scheduler.shutdown();

    Ok(())
}
