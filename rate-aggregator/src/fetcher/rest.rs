//! REST fetcher: токен по basic auth, затем периодический опрос каждой пары.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use rate_core::{Rate, RateFields};

use super::{FetcherContext, PlatformDataFetcher, lock};
use crate::error::FetcherError;
use crate::events::EventSink;
use crate::scheduler::TaskHandle;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Расписание опроса одной пары
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollTiming {
    pub(crate) initial: Duration,
    pub(crate) period: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(6),
            period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    port: Option<u16>,
}

impl Endpoint {
    fn url(&self, path: &str) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid base url {:?}", self.base_url))?;
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|_| anyhow::anyhow!("base url {} can't have a port", self.base_url))?;
        }
        let joined = format!("{}/{}", url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).with_context(|| format!("invalid url {joined:?}"))
    }
}

#[derive(Debug, Clone)]
struct Session {
    platform: String,
    token: String,
}

type Subscriptions = Arc<Mutex<HashMap<String, TaskHandle>>>;

pub(crate) struct RestFetcher {
    ctx: FetcherContext,
    timing: PollTiming,
    client: Client,
    endpoint: Mutex<Endpoint>,
    session: Mutex<Option<Session>>,
    /// имя пары -> задача опроса
    subscriptions: Subscriptions,
}

impl RestFetcher {
    pub(crate) fn new(ctx: FetcherContext, timing: PollTiming) -> Result<Self, FetcherError> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            ctx,
            timing,
            client,
            endpoint: Mutex::new(Endpoint {
                base_url: DEFAULT_BASE_URL.to_string(),
                port: None,
            }),
            session: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub(crate) fn create(ctx: FetcherContext) -> Result<Arc<dyn PlatformDataFetcher>, FetcherError> {
        Ok(Arc::new(Self::new(ctx, PollTiming::default())?))
    }

    #[cfg(test)]
    fn is_subscribed(&self, rate_name: &str) -> bool {
        lock(&self.subscriptions).contains_key(rate_name)
    }

    fn fetch_token(&self, user_id: &str, password: &str) -> anyhow::Result<String> {
        let url = lock(&self.endpoint).url("token")?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(user_id, Some(password))
            .send()
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("POST {url}: {status}");
        }

        let token = resp.text().context("read token")?.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("POST {url}: empty token");
        }
        Ok(token)
    }
}

impl PlatformDataFetcher for RestFetcher {
    fn configure(&self, port: Option<u16>, base_url: Option<&str>) {
        let mut ep = lock(&self.endpoint);
        if let Some(url) = base_url.map(str::trim).filter(|u| !u.is_empty()) {
            ep.base_url = url.to_string();
        }
        if port.is_some() {
            ep.port = port;
        }
        debug!("rest fetcher configured for {} (port {:?})", ep.base_url, ep.port);
    }

    fn connect(&self, platform: &str, user_id: &str, password: &str) -> Result<(), FetcherError> {
        match self.fetch_token(user_id, password) {
            Ok(token) => {
                *lock(&self.session) = Some(Session {
                    platform: platform.to_string(),
                    token,
                });
                info!("{platform}: token received");
                self.ctx.events.on_connect(platform, true);
                Ok(())
            }
            Err(e) => {
                warn!("{platform}: connect failed: {e:#}");
                self.ctx.events.on_connect(platform, false);
                Err(FetcherError::connection(platform, format!("{e:#}")))
            }
        }
    }

    fn disconnect(&self, platform: &str, _user_id: &str, _password: &str) {
        let polls: Vec<(String, TaskHandle)> = lock(&self.subscriptions).drain().collect();
        for (rate_name, h) in polls {
            h.cancel();
            info!("{platform}: unsubscribed from {rate_name}");
        }

        match lock(&self.session).take() {
            Some(s) => {
                info!("{}: disconnected", s.platform);
                self.ctx.events.on_disconnect(&s.platform, true);
            }
            None => debug!("{platform}: already disconnected"),
        }
    }

    fn subscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError> {
        let Some(session) = lock(&self.session).clone() else {
            return Err(FetcherError::not_connected(platform));
        };

        let url = lock(&self.endpoint)
            .url(&format!("api/rates/{}", rate_core::protocol::topic(platform, rate_name)))
            .map_err(|e| FetcherError::connection(platform, format!("{e:#}")))?;

        let mut subs = lock(&self.subscriptions);
        if subs.contains_key(rate_name) {
            debug!("{platform}: already subscribed to {rate_name}");
            return Ok(());
        }

        let mut job = PollJob {
            platform: platform.to_string(),
            rate_name: rate_name.to_string(),
            url,
            token: session.token,
            client: self.client.clone(),
            events: self.ctx.events.clone(),
            subscriptions: self.subscriptions.clone(),
            first: true,
        };
        let handle = self.ctx.scheduler.schedule_at_fixed_rate(
            &format!("poll {platform}_{rate_name}"),
            self.timing.initial,
            self.timing.period,
            move || job.run(),
        );
        subs.insert(rate_name.to_string(), handle);
        info!("{platform}: subscribing to {rate_name}");
        Ok(())
    }

    fn unsubscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError> {
        cancel_poll(&self.subscriptions, platform, rate_name);
        Ok(())
    }
}

fn cancel_poll(subscriptions: &Mutex<HashMap<String, TaskHandle>>, platform: &str, rate_name: &str) {
    match lock(subscriptions).remove(rate_name) {
        Some(h) => {
            h.cancel();
            info!("{platform}: unsubscribed from {rate_name}");
        }
        None => debug!("{platform}: no active subscription for {rate_name}"),
    }
}

/// Один опрос одной пары; живёт внутри периодической задачи
struct PollJob {
    platform: String,
    rate_name: String,
    url: Url,
    token: String,
    client: Client,
    events: EventSink,
    subscriptions: Subscriptions,
    /// первый удачный ответ уходит как "available"
    first: bool,
}

impl PollJob {
    fn run(&mut self) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.token)
            .send()
            .with_context(|| format!("GET {}", self.url))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            warn!("{}: rate {} not found; unsubscribing", self.platform, self.rate_name);
            self.unsubscribe();
            return Ok(());
        }
        if !status.is_success() {
            warn!("{}: GET {} -> {status}", self.platform, self.url);
            return Ok(());
        }

        let body = resp.text().context("read rate body")?;
        let body = body.trim();
        if body.is_empty() || body == "null" {
            warn!("{}: no data for {}; unsubscribing", self.platform, self.rate_name);
            self.unsubscribe();
            return Ok(());
        }

        let mut rate: Rate = serde_json::from_str(body)
            .with_context(|| format!("parse rate for {}", self.rate_name))?;
        if let Some(name) = rate.name.strip_prefix(&format!("{}_", self.platform)) {
            rate.name = name.to_string();
        }

        if self.first {
            self.first = false;
            self.events.on_rate_available(&self.platform, &self.rate_name, rate);
        } else {
            self.events
                .on_rate_update(&self.platform, &self.rate_name, RateFields::from(rate));
        }
        Ok(())
    }

    fn unsubscribe(&self) {
        cancel_poll(&self.subscriptions, &self.platform, &self.rate_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PlatformEvent;
    use crate::scheduler::Scheduler;
    use crossbeam_channel::Receiver;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(3);

    type Route = fn(&str, &str, Option<&str>) -> (u16, String);

    /// Минимальный HTTP/1.1 сервер: одна строка ответа на соединение
    fn stub_server(route: Route) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let path = parts.next().unwrap_or("").to_string();

                let mut auth = None;
                loop {
                    let mut h = String::new();
                    if reader.read_line(&mut h).unwrap() == 0 || h.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = h.split_once(':') {
                        if name.eq_ignore_ascii_case("authorization") {
                            auth = Some(value.trim().to_string());
                        }
                    }
                }

                counter.fetch_add(1, Ordering::SeqCst);
                let (code, body) = route(&method, &path, auth.as_deref());
                let resp = format!(
                    "HTTP/1.1 {code} X\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(resp.as_bytes()).ok();
            }
        });

        (base, hits)
    }

    fn fetcher(base: &str) -> (RestFetcher, Receiver<PlatformEvent>) {
        let (events, rx) = EventSink::channel();
        let ctx = FetcherContext {
            events,
            scheduler: Arc::new(Scheduler::start().unwrap()),
        };
        let timing = PollTiming {
            initial: Duration::ZERO,
            period: Duration::from_millis(20),
        };
        let f = RestFetcher::new(ctx, timing).unwrap();
        f.configure(None, Some(base));
        (f, rx)
    }

    fn producer(method: &str, path: &str, auth: Option<&str>) -> (u16, String) {
        match (method, path) {
            ("POST", "/token") if auth.is_some_and(|a| a.starts_with("Basic ")) => {
                (200, "tok".to_string())
            }
            ("POST", "/token") => (401, String::new()),
            (_, _) if auth != Some("Bearer tok") => (401, String::new()),
            ("GET", "/api/rates/PF2_USDTRY") => (
                200,
                r#"{"rateName":"PF2_USDTRY","bid":35.1,"ask":36.1,"timestamp":"2024-12-16T10:15:30.123"}"#
                    .to_string(),
            ),
            ("GET", "/api/rates/PF2_EURUSD") => (200, "null".to_string()),
            ("GET", "/api/rates/PF2_GBPUSD") => (500, "boom".to_string()),
            _ => (404, "Unknown rate".to_string()),
        }
    }

    fn connected(base: &str) -> (RestFetcher, Receiver<PlatformEvent>) {
        let (f, rx) = fetcher(base);
        f.connect("PF2", "admin", "admin").unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::Connected {
                platform: "PF2".into(),
                success: true
            }
        );
        (f, rx)
    }

    #[test]
    fn first_poll_is_available_then_updates_with_canonical_name() {
        let (base, _) = stub_server(producer);
        let (f, rx) = connected(&base);

        f.subscribe("PF2", "USDTRY").unwrap();
        f.subscribe("PF2", "USDTRY").unwrap();

        match rx.recv_timeout(WAIT).unwrap() {
            PlatformEvent::RateAvailable { platform, rate_name, rate } => {
                assert_eq!(platform, "PF2");
                assert_eq!(rate_name, "USDTRY");
                assert_eq!(rate.name, "USDTRY");
                assert_eq!(rate.bid, 35.1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::RateUpdate { ref fields, .. } if fields.name == "USDTRY"
        ));

        f.disconnect("PF2", "admin", "admin");
        assert!(!f.is_subscribed("USDTRY"));
    }

    #[test]
    fn not_found_and_null_body_unsubscribe() {
        let (base, _) = stub_server(producer);
        let (f, rx) = connected(&base);

        f.subscribe("PF2", "XAUUSD").unwrap();
        f.subscribe("PF2", "EURUSD").unwrap();

        let deadline = std::time::Instant::now() + WAIT;
        while (f.is_subscribed("XAUUSD") || f.is_subscribed("EURUSD"))
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!f.is_subscribed("XAUUSD"));
        assert!(!f.is_subscribed("EURUSD"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn server_errors_keep_polling() {
        let (base, hits) = stub_server(producer);
        let (f, _rx) = connected(&base);
        let after_connect = hits.load(Ordering::SeqCst);

        f.subscribe("PF2", "GBPUSD").unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert!(f.is_subscribed("GBPUSD"));
        assert!(hits.load(Ordering::SeqCst) - after_connect >= 2);

        f.unsubscribe("PF2", "GBPUSD").unwrap();
        f.unsubscribe("PF2", "GBPUSD").unwrap();
        assert!(!f.is_subscribed("GBPUSD"));
    }

    #[test]
    fn rejected_token_is_connect_failure() {
        fn deny(_: &str, _: &str, _: Option<&str>) -> (u16, String) {
            (401, String::new())
        }
        let (base, _) = stub_server(deny);
        let (f, rx) = fetcher(&base);

        assert!(f.connect("PF2", "admin", "wrong").is_err());
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::Connected { success: false, .. }
        ));
        assert!(matches!(
            f.subscribe("PF2", "USDTRY"),
            Err(FetcherError::Connection { .. })
        ));
    }

    #[test]
    fn port_override_is_applied_to_base_url() {
        let ep = Endpoint {
            base_url: "http://localhost:8080/".into(),
            port: Some(9090),
        };
        assert_eq!(
            ep.url("api/rates/PF2_USDTRY").unwrap().as_str(),
            "http://localhost:9090/api/rates/PF2_USDTRY"
        );
    }
}
