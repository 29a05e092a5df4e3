use crate::config::{ClientId, SHUTDOWN_TICK};
use crate::registry::{Outbox, SubscriberRegistry};
use anyhow::Context;
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use rate_core::protocol::{INVALID_REQUEST_REPLY, parse_command};
use rate_core::{AUTH_OK, Command, SERVER_PASSWORD, SERVER_USER};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, atomic::AtomicBool, atomic::AtomicU64, atomic::Ordering};
use std::thread;
use std::time::Duration;

const TCP_WRITE_TIMEOUT_S: u64 = 5;

/// Сколько строк может накопиться у медленного клиента
const OUTBOX_CAPACITY: usize = 256;

// accept loop, по потоку на клиента
pub(crate) fn run_tcp_listener(
    tcp_addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    curr_client_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener =
        TcpListener::bind(tcp_addr).with_context(|| format!("bind TCP listener {}", tcp_addr))?;
    listener
        .set_nonblocking(true)
        .context("listener.set_nonblocking(true)")?;
    info!("TCP server listens on {tcp_addr}");

    let mut session_handles = Vec::new();

    loop {
        reap_finished_sessions(&mut session_handles);

        if shutdown.load(Ordering::Relaxed) {
            info!("shutting down tcp listener");
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                stream
                    .set_nonblocking(false)
                    .context("stream.set_nonblocking(false)")?;

                let cid = curr_client_id.fetch_add(1, Ordering::Relaxed);
                info!("client {cid} connected from {addr}");

                let registry = registry.clone();
                let shutdown = shutdown.clone();

                let h = thread::spawn(move || {
                    if let Err(e) = handle_conn(stream, registry, cid, shutdown) {
                        warn!("handle_conn error for client {cid}: {e}");
                    }
                });
                session_handles.push(h);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // нет новых соединений прямо сейчас
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("accept error: {e}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    for h in session_handles {
        if let Err(panic) = h.join() {
            warn!("session thread panicked: {:?}", panic);
        }
    }

    Ok(())
}

fn reap_finished_sessions(handles: &mut Vec<thread::JoinHandle<()>>) {
    let mut i = 0;
    while i < handles.len() {
        if handles[i].is_finished() {
            let h = handles.swap_remove(i);
            if let Err(panic) = h.join() {
                warn!("session thread panicked: {:?}", panic);
            }
        } else {
            i += 1;
        }
    }
}

/// Одна клиентская сессия: рукопожатие, затем цикл команд.
///
/// Всё исходящее (подсказки, ответы, котировки) идёт через outbox и
/// пишется отдельным потоком, поэтому порядок строк сохраняется.
pub(crate) fn handle_conn(
    stream: TcpStream,
    registry: Arc<SubscriberRegistry>,
    cid: ClientId,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(SHUTDOWN_TICK)).ok();
    stream
        .set_write_timeout(Some(Duration::from_secs(TCP_WRITE_TIMEOUT_S)))
        .ok();

    let (tx, rx) = crossbeam_channel::bounded::<Arc<str>>(OUTBOX_CAPACITY);
    let writer_stream = stream.try_clone().context("clone client stream")?;
    let writer = thread::spawn(move || run_writer(writer_stream, rx, cid));

    let res = serve_client(&stream, &tx, &registry, cid, &shutdown);

    let dropped = registry.remove_client(cid);
    if dropped > 0 {
        debug!("client {cid}: released {dropped} topic(s)");
    }

    // writer допишет очередь и завершится, когда отпустим последний sender
    drop(tx);
    if let Err(panic) = writer.join() {
        warn!("writer thread panicked: {:?}", panic);
    }
    stream.shutdown(std::net::Shutdown::Both).ok();
    info!("client {cid} disconnected");

    res
}

fn serve_client(
    stream: &TcpStream,
    tx: &Outbox,
    registry: &SubscriberRegistry,
    cid: ClientId,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);

    reply(tx, "Connecting To Server")?;
    reply(tx, "Enter username")?;
    let Some(username) = read_line(&mut reader, shutdown)? else {
        return Ok(());
    };
    reply(tx, "Enter password")?;
    let Some(password) = read_line(&mut reader, shutdown)? else {
        return Ok(());
    };

    if username != SERVER_USER || password != SERVER_PASSWORD {
        warn!("client {cid}: invalid credentials for user {username:?}");
        reply(tx, "Invalid username or password")?;
        return Ok(());
    }

    info!("client {cid} authorized");
    reply(tx, AUTH_OK)?;
    reply(tx, "To Exit : \"exit\"")?;

    while let Some(line) = read_line(&mut reader, shutdown)? {
        debug!("client {cid} -> {line}");

        match parse_command(&line) {
            Ok(Command::Subscribe { topic }) => {
                match registry.subscribe(&topic, cid, tx.clone()) {
                    Ok(()) => {
                        info!("client {cid} subscribed to {topic}");
                        reply(tx, &format!("Subscribed to {topic}"))?;
                    }
                    Err(e) => reply(tx, &e.reply())?,
                }
            }
            Ok(Command::Unsubscribe { topic }) => match registry.unsubscribe(&topic) {
                Ok(()) => {
                    info!("client {cid} unsubscribed from {topic}");
                    reply(tx, &format!("Unsubscribed from {topic}"))?;
                }
                Err(e) => reply(tx, &e.reply())?,
            },
            Ok(Command::Exit) => {
                info!("client {cid} requested exit");
                break;
            }
            Err(e) => {
                debug!("client {cid}: bad command: {e}");
                reply(tx, INVALID_REQUEST_REPLY)?;
            }
        }
    }

    Ok(())
}

fn reply(tx: &Outbox, line: &str) -> anyhow::Result<()> {
    tx.send(Arc::from(line))
        .map_err(|_| anyhow::anyhow!("client writer is gone"))
}

/// Читает строку, просыпаясь по таймауту чтения, чтобы проверить shutdown.
/// `None`: клиент закрыл соединение или сервер останавливается.
/// Байты не из UTF-8 заменяются, такая строка уходит в разбор как есть.
fn read_line(
    reader: &mut BufReader<&TcpStream>,
    shutdown: &AtomicBool,
) -> io::Result<Option<String>> {
    let mut buf = Vec::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(None);
        }

        // при таймауте уже прочитанная часть строки остаётся в `buf`
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) if buf.is_empty() => return Ok(None),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

fn run_writer(mut stream: TcpStream, rx: Receiver<Arc<str>>, cid: ClientId) {
    for msg in rx.iter() {
        let res = stream
            .write_all(msg.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .and_then(|_| stream.flush());

        if let Err(e) = res {
            warn!("client {cid}: write failed: {e}");
            // receiver уходит -> broadcast увидит Disconnected и уберёт клиента
            return;
        }
    }
}
