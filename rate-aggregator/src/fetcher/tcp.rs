//! TCP fetcher: логин построчно, затем поток кадров котировок.
//!
//! На каждое соединение один поток-читатель. Первые два кадра соединения
//! считаются "available", все последующие считаются "update".

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use rate_core::protocol::{parse_rate_frame, topic};
use rate_core::{AUTH_OK, Command, HANDSHAKE_TIMEOUT, ProtocolError, RateFields};

use super::{FetcherContext, PlatformDataFetcher, lock};
use crate::error::FetcherError;
use crate::events::EventSink;
use crate::scheduler::TaskHandle;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8081;

/// Столько кадров соединения уходят как "available"
const AVAILABLE_FRAMES: u64 = 2;

/// Дольше unsubscribe не ждёт отправки
const UNSUBSCRIBE_WAIT: Duration = Duration::from_secs(1);

/// subscribe уходит через таймер с минимальной задержкой
const SUBSCRIBE_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
}

struct Connection {
    platform: String,
    writer: Arc<Mutex<TcpStream>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct TcpFetcher {
    ctx: FetcherContext,
    endpoint: Mutex<Endpoint>,
    conn: Mutex<Option<Connection>>,
    /// топик -> отложенная отправка subscribe
    subscriptions: Mutex<HashMap<String, TaskHandle>>,
}

impl TcpFetcher {
    pub(crate) fn new(ctx: FetcherContext) -> Self {
        Self {
            ctx,
            endpoint: Mutex::new(Endpoint {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            }),
            conn: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn create(ctx: FetcherContext) -> Result<Arc<dyn PlatformDataFetcher>, FetcherError> {
        Ok(Arc::new(Self::new(ctx)))
    }

    fn is_connected(&self) -> bool {
        lock(&self.conn)
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::Relaxed))
    }

    fn writer(&self) -> Option<Arc<Mutex<TcpStream>>> {
        lock(&self.conn)
            .as_ref()
            .filter(|c| c.connected.load(Ordering::Relaxed))
            .map(|c| c.writer.clone())
    }
}

impl PlatformDataFetcher for TcpFetcher {
    fn configure(&self, port: Option<u16>, base_url: Option<&str>) {
        let mut ep = lock(&self.endpoint);
        if let Some(port) = port {
            ep.port = port;
        }
        if let Some(host) = base_url.map(str::trim).filter(|h| !h.is_empty()) {
            ep.host = host.to_string();
        }
        debug!("tcp fetcher configured for {}:{}", ep.host, ep.port);
    }

    fn connect(&self, platform: &str, user_id: &str, password: &str) -> Result<(), FetcherError> {
        if self.is_connected() {
            debug!("{platform}: already connected");
            return Ok(());
        }

        let ep = lock(&self.endpoint).clone();
        let (stream, reader) = match login(&ep, user_id, password) {
            Ok(v) => v,
            Err(e) => {
                warn!("{platform}: connect to {}:{} failed: {e:#}", ep.host, ep.port);
                self.ctx.events.on_connect(platform, false);
                return Err(FetcherError::connection(platform, format!("{e:#}")));
            }
        };

        // дальше читатель блокируется без таймаута, до закрытия сокета
        stream.set_read_timeout(None).ok();
        let connected = Arc::new(AtomicBool::new(true));

        let mut conn = lock(&self.conn);
        *conn = Some(Connection {
            platform: platform.to_string(),
            writer: Arc::new(Mutex::new(stream)),
            connected: connected.clone(),
            reader: None,
        });
        info!("{platform}: connected to {}:{}", ep.host, ep.port);
        self.ctx.events.on_connect(platform, true);

        let events = self.ctx.events.clone();
        let pf = platform.to_string();
        let spawned = thread::Builder::new()
            .name(format!("reader-{platform}"))
            .spawn(move || run_reader(reader, &pf, &events, &connected));

        match spawned {
            Ok(h) => {
                if let Some(c) = conn.as_mut() {
                    c.reader = Some(h);
                }
                Ok(())
            }
            Err(e) => {
                drop(conn);
                self.disconnect(platform, user_id, password);
                Err(FetcherError::connection(
                    platform,
                    format!("spawn reader thread: {e}"),
                ))
            }
        }
    }

    fn disconnect(&self, platform: &str, _user_id: &str, _password: &str) {
        let topics: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        for t in &topics {
            let (_, rate_name) = rate_core::protocol::split_topic(t);
            if let Err(e) = self.unsubscribe(platform, rate_name) {
                debug!("{platform}: unsubscribe {t} on disconnect: {e}");
            }
        }

        let Some(mut conn) = lock(&self.conn).take() else {
            debug!("{platform}: not connected; nothing to disconnect");
            return;
        };

        {
            let mut w = lock(&conn.writer);
            if let Err(e) = send_line(&mut w, &Command::Exit.to_line()) {
                debug!("{platform}: exit not sent: {e}");
            }
            w.shutdown(Shutdown::Both).ok();
        }

        // читатель тоже может заметить закрытие; событие уходит один раз
        if conn.connected.swap(false, Ordering::Relaxed) {
            self.ctx.events.on_disconnect(&conn.platform, true);
        }

        if let Some(h) = conn.reader.take() {
            if h.join().is_err() {
                warn!("{platform}: reader thread panicked");
            }
        }
        info!("{platform}: disconnected");
    }

    fn subscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError> {
        let Some(writer) = self.writer() else {
            return Err(FetcherError::not_connected(platform));
        };

        let t = topic(platform, rate_name);
        let mut subs = lock(&self.subscriptions);
        if subs.contains_key(&t) {
            debug!("{platform}: already subscribed to {rate_name}");
            return Ok(());
        }

        let line = Command::Subscribe { topic: t.clone() }.to_line();
        let handle = self.ctx.scheduler.schedule_once(
            &format!("subscribe {t}"),
            SUBSCRIBE_DELAY,
            move || {
                let mut w = lock(&writer);
                send_line(&mut w, &line).with_context(|| format!("send {line:?}"))
            },
        );
        subs.insert(t, handle);
        info!("{platform}: subscribing to {rate_name}");
        Ok(())
    }

    fn unsubscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError> {
        let t = topic(platform, rate_name);
        let Some(handle) = lock(&self.subscriptions).remove(&t) else {
            debug!("{platform}: no subscription for {rate_name}");
            return Ok(());
        };
        handle.cancel();

        let Some(writer) = self.writer() else {
            return Err(FetcherError::not_connected(platform));
        };

        let line = Command::Unsubscribe { topic: t }.to_line();
        let mut w = lock(&writer);
        send_line(&mut w, &line)
            .map_err(|e| FetcherError::connection(platform, format!("send {line:?}: {e}")))?;
        info!("{platform}: unsubscribed from {rate_name}");
        Ok(())
    }
}

// Подключение и логин; возвращает сокет для записи и буферизованного читателя
fn login(ep: &Endpoint, user_id: &str, password: &str) -> anyhow::Result<(TcpStream, BufReader<TcpStream>)> {
    let addr = (ep.host.as_str(), ep.port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", ep.host, ep.port))?
        .next()
        .with_context(|| format!("no address for {}", ep.host))?;

    let mut stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)
        .with_context(|| format!("connect {addr}"))?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    stream.set_write_timeout(Some(UNSUBSCRIBE_WAIT)).ok();

    send_line(&mut stream, user_id).context("send user id")?;
    send_line(&mut stream, password).context("send password")?;

    let mut reader = BufReader::new(stream.try_clone().context("clone stream")?);
    let mut last = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).context("read handshake")?;
        if n == 0 {
            anyhow::bail!("server closed connection during login (last line: {last:?})");
        }

        let line = line.trim();
        debug!("handshake <- {line}");
        if line.eq_ignore_ascii_case(AUTH_OK) {
            return Ok((stream, reader));
        }
        last = line.to_string();
    }
}

fn send_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

fn run_reader(
    mut reader: BufReader<TcpStream>,
    platform: &str,
    events: &EventSink,
    connected: &AtomicBool,
) {
    let mut frames: u64 = 0;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if handle_line(&line, platform, frames, events) {
                    frames += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if connected.load(Ordering::Relaxed) {
                    warn!("{platform}: read error: {e}");
                }
                break;
            }
        }
    }

    // сервер закрыл соединение сам
    if connected.swap(false, Ordering::Relaxed) {
        info!("{platform}: server closed the connection");
        events.on_disconnect(platform, true);
    }
}

// true, если строка оказалась кадром котировки этой платформы
fn handle_line(line: &str, platform: &str, seen: u64, events: &EventSink) -> bool {
    let frame = match parse_rate_frame(line) {
        Ok(f) => f,
        Err(ProtocolError::TokenCount(_)) => {
            info!("{platform} <- {}", line.trim_end());
            return false;
        }
        Err(e) => {
            warn!("{platform}: dropping malformed frame {:?}: {e}", line.trim_end());
            return false;
        }
    };

    // чужое имя платформы только логируется: соединение принадлежит `platform`
    if frame.platform != platform {
        warn!(
            "{platform}: frame names platform {}, accepting it as {platform}",
            frame.platform
        );
    }

    let rate_name = frame.rate.name.clone();
    if seen < AVAILABLE_FRAMES {
        events.on_rate_available(platform, &rate_name, frame.rate);
    } else {
        events.on_rate_update(platform, &rate_name, RateFields::from(frame.rate));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PlatformEvent;
    use crate::scheduler::Scheduler;
    use crossbeam_channel::Receiver;
    use rate_core::protocol::format_rate_frame;
    use std::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    fn fetcher() -> (TcpFetcher, Receiver<PlatformEvent>) {
        let (events, rx) = EventSink::channel();
        let ctx = FetcherContext {
            events,
            scheduler: Arc::new(Scheduler::start().unwrap()),
        };
        (TcpFetcher::new(ctx), rx)
    }

    /// Сервер на одного клиента: проверяет логин и отдаёт сокет тесту
    fn fake_server(accept: bool) -> (u16, thread::JoinHandle<Option<(BufReader<TcpStream>, TcpStream)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let h = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut r = BufReader::new(s.try_clone().unwrap());
            writeln!(s, "Connecting To Server").unwrap();
            writeln!(s, "Enter username").unwrap();
            let mut user = String::new();
            r.read_line(&mut user).unwrap();
            writeln!(s, "Enter password").unwrap();
            let mut pass = String::new();
            r.read_line(&mut pass).unwrap();

            if accept && user.trim() == "admin" && pass.trim() == "admin" {
                writeln!(s, "OK").unwrap();
                writeln!(s, "To Exit : \"exit\"").unwrap();
                Some((r, s))
            } else {
                writeln!(s, "Invalid username or password").unwrap();
                None
            }
        });
        (port, h)
    }

    fn read_cmd(r: &mut BufReader<TcpStream>) -> String {
        let mut l = String::new();
        r.read_line(&mut l).unwrap();
        l.trim_end().to_string()
    }

    #[test]
    fn rejected_login_reports_failure_event() {
        let (f, rx) = fetcher();
        let (port, srv) = fake_server(false);
        f.configure(Some(port), Some("127.0.0.1"));

        let err = f.connect("PF1", "admin", "admin").unwrap_err();
        assert!(matches!(err, FetcherError::Connection { .. }));
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::Connected {
                platform: "PF1".into(),
                success: false
            }
        );
        assert!(srv.join().unwrap().is_none());
        assert!(f.subscribe("PF1", "USDTRY").is_err());
    }

    #[test]
    fn frames_become_available_then_update_and_close_is_reported_once() {
        let (f, rx) = fetcher();
        let (port, srv) = fake_server(true);
        f.configure(Some(port), Some("127.0.0.1"));

        f.connect("PF1", "admin", "admin").unwrap();
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::Connected { success: true, .. }
        ));

        let (mut r, mut s) = srv.join().unwrap().unwrap();
        f.subscribe("PF1", "USDTRY").unwrap();
        f.subscribe("PF1", "USDTRY").unwrap();
        assert_eq!(read_cmd(&mut r), "subscribe|PF1_USDTRY");
        // повторный subscribe на сервер не уходит
        r.get_ref()
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut extra = String::new();
        assert!(r.read_line(&mut extra).is_err(), "unexpected line {extra:?}");

        writeln!(s, "Subscribed to PF1_USDTRY").unwrap();
        writeln!(s, "garbage|22:number:x|25:number:1|5:timestamp:t").unwrap();
        for bid in [35.0, 35.1, 35.2] {
            let frame = format_rate_frame("PF1_USDTRY", bid, bid + 1.0, "2024-12-16T10:15:30.123");
            writeln!(s, "{frame}").unwrap();
        }
        s.shutdown(Shutdown::Both).unwrap();

        let got: Vec<PlatformEvent> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert!(matches!(&got[0], PlatformEvent::RateAvailable { rate, .. } if rate.bid == 35.0));
        assert!(matches!(&got[1], PlatformEvent::RateAvailable { rate, .. } if rate.bid == 35.1));
        assert!(matches!(
            &got[2],
            PlatformEvent::RateUpdate { rate_name, fields, .. }
                if rate_name == "USDTRY" && fields.bid == 35.2
        ));
        assert_eq!(
            got[3],
            PlatformEvent::Disconnected {
                platform: "PF1".into(),
                success: true
            }
        );

        // повторного события о разрыве нет
        f.disconnect("PF1", "admin", "admin");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn disconnect_unsubscribes_and_sends_exit() {
        let (f, rx) = fetcher();
        let (port, srv) = fake_server(true);
        f.configure(Some(port), Some("127.0.0.1"));
        f.connect("PF1", "admin", "admin").unwrap();
        let (mut r, _s) = srv.join().unwrap().unwrap();

        f.subscribe("PF1", "EURUSD").unwrap();
        assert_eq!(read_cmd(&mut r), "subscribe|PF1_EURUSD");

        // отписка без подписки ничего не шлёт
        f.unsubscribe("PF1", "GBPUSD").unwrap();

        f.disconnect("PF1", "admin", "admin");
        assert_eq!(read_cmd(&mut r), "unsubscribe|PF1_EURUSD");
        assert_eq!(read_cmd(&mut r), "exit");

        let evs: Vec<PlatformEvent> = rx.try_iter().collect();
        assert_eq!(
            evs.iter()
                .filter(|e| matches!(e, PlatformEvent::Disconnected { .. }))
                .count(),
            1
        );

        f.disconnect("PF1", "admin", "admin");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn frame_naming_another_platform_is_counted_for_this_connection() {
        let (events, rx) = EventSink::channel();
        let frame = format_rate_frame("PF9_EURUSD", 1.08, 1.29, "2024-12-16T10:15:30.123");

        assert!(handle_line(&frame, "PF1", 0, &events));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlatformEvent::RateAvailable { ref platform, ref rate_name, .. }
                if platform == "PF1" && rate_name == "EURUSD"
        ));

        assert!(handle_line(&frame, "PF1", AVAILABLE_FRAMES, &events));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlatformEvent::RateUpdate { ref platform, .. } if platform == "PF1"
        ));
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (f, rx) = fetcher();
        f.configure(Some(port), Some("127.0.0.1"));

        assert!(f.connect("PF9", "admin", "admin").is_err());
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            PlatformEvent::Connected { success: false, .. }
        ));
    }
}
