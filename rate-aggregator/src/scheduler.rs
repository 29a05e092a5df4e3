//! Общий таймер на один поток.
//!
//! Сюда попадают все отложенные и периодические задачи агрегатора:
//! опросы REST-платформ, отправка `subscribe|...` по TCP и расчёт кросс-курсов.
//! Задача не может уронить поток: ошибки и паники логируются.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

type Job = Box<dyn FnMut() -> anyhow::Result<()> + Send + 'static>;

/// Ручка запланированной задачи. Клонируется свободно.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Задача больше не запустится. Уже идущий запуск доработает.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    period: Option<Duration>,
    name: String,
    job: Job,
    handle: TaskHandle,
}

// BinaryHeap это max-heap, поэтому сравнение перевёрнуто: раньше срок => "больше"
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

enum Msg {
    Add(Entry),
    Shutdown,
}

pub(crate) struct Scheduler {
    tx: Sender<Msg>,
    seq: AtomicU64,
    thread_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn start() -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || run_timer(rx))?;

        Ok(Self {
            tx,
            seq: AtomicU64::new(0),
            thread_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Один запуск через `delay`
    pub(crate) fn schedule_once<F>(&self, name: &str, delay: Duration, job: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut job = Some(job);
        self.add(name, delay, None, move || match job.take() {
            Some(f) => f(),
            None => Ok(()),
        })
    }

    /// Первый запуск через `initial`, далее каждые `period`
    pub(crate) fn schedule_at_fixed_rate<F>(
        &self,
        name: &str,
        initial: Duration,
        period: Duration,
        job: F,
    ) -> TaskHandle
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.add(name, initial, Some(period), job)
    }

    fn add<F>(&self, name: &str, delay: Duration, period: Option<Duration>, job: F) -> TaskHandle
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let handle = TaskHandle::default();
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            period,
            name: name.to_string(),
            job: Box::new(job),
            handle: handle.clone(),
        };

        if self.tx.send(Msg::Add(entry)).is_err() {
            warn!("scheduler is stopped; task {name} rejected");
            handle.cancel();
        }
        handle
    }

    /// Останавливает поток таймера; задачи в очереди выбрасываются.
    /// Из самой задачи вызывать можно: join тогда пропускается.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);

        if thread::current().id() == self.thread_id {
            return;
        }

        let worker = match self.worker.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = worker {
            if h.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(rx: Receiver<Msg>) {
    let mut queue: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        while queue.peek().is_some_and(|e| e.handle.is_cancelled()) {
            if let Some(e) = queue.pop() {
                debug!("task {} cancelled", e.name);
            }
        }

        let wait = queue
            .peek()
            .map(|e| e.due.saturating_duration_since(Instant::now()));

        let msg = match wait {
            Some(d) if d.is_zero() => None,
            Some(d) => match rx.recv_timeout(d) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(m) => Some(m),
                Err(_) => break,
            },
        };

        match msg {
            Some(Msg::Add(e)) => {
                queue.push(e);
                continue;
            }
            Some(Msg::Shutdown) => break,
            None => {}
        }

        let Some(mut entry) = queue.pop() else {
            continue;
        };
        if entry.due > Instant::now() {
            queue.push(entry);
            continue;
        }

        run_entry(&mut entry);

        if let Some(period) = entry.period {
            if entry.handle.is_cancelled() {
                continue;
            }
            let now = Instant::now();
            entry.due += period;
            // отстали: не догоняем пачкой, а сдвигаем расписание
            if entry.due < now {
                entry.due = now + period;
            }
            queue.push(entry);
        }
    }

    info!("scheduler stopped; {} task(s) dropped", queue.len());
}

fn run_entry(entry: &mut Entry) {
    match catch_unwind(AssertUnwindSafe(|| (entry.job)())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("task {} failed: {e:#}", entry.name),
        Err(_) => warn!("task {} panicked", entry.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn once_runs_after_delay() {
        let sched = Scheduler::start().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let started = Instant::now();
        sched.schedule_once("once", Duration::from_millis(30), move || {
            tx.send(Instant::now())?;
            Ok(())
        });

        let fired = rx.recv_timeout(WAIT).unwrap();
        assert!(fired.duration_since(started) >= Duration::from_millis(30));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn tasks_fire_in_due_order() {
        let sched = Scheduler::start().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        for (name, ms) in [("late", 60u64), ("early", 10), ("mid", 30)] {
            let tx = tx.clone();
            sched.schedule_once(name, Duration::from_millis(ms), move || {
                tx.send(name)?;
                Ok(())
            });
        }

        let got: Vec<&str> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(got, vec!["early", "mid", "late"]);
    }

    #[test]
    fn fixed_rate_repeats_until_cancelled() {
        let sched = Scheduler::start().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let h = sched.schedule_at_fixed_rate(
            "tick",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                tx.send(())?;
                Ok(())
            },
        );

        for _ in 0..3 {
            rx.recv_timeout(WAIT).unwrap();
        }
        h.cancel();
        assert!(h.is_cancelled());

        // максимум один запуск мог уже стоять в работе
        std::thread::sleep(Duration::from_millis(50));
        let _ = rx.try_iter().count();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn failing_and_panicking_jobs_keep_the_timer_alive() {
        let sched = Scheduler::start().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        sched.schedule_once("fails", Duration::ZERO, || anyhow::bail!("boom"));
        sched.schedule_once("panics", Duration::from_millis(5), || panic!("boom"));

        let mut runs = 0;
        let tx2 = tx.clone();
        sched.schedule_at_fixed_rate(
            "flaky",
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                runs += 1;
                if runs == 1 {
                    anyhow::bail!("first run fails");
                }
                tx2.send(runs)?;
                Ok(())
            },
        );

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
        drop(tx);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let sched = Scheduler::start().unwrap();
        sched.shutdown();

        let h = sched.schedule_once("late", Duration::ZERO, || Ok(()));
        assert!(h.is_cancelled());
    }

    #[test]
    fn shutdown_from_inside_a_task_does_not_deadlock() {
        let sched = Arc::new(Scheduler::start().unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();

        let s = sched.clone();
        sched.schedule_once("stopper", Duration::ZERO, move || {
            s.shutdown();
            tx.send(())?;
            Ok(())
        });

        rx.recv_timeout(WAIT).unwrap();
        sched.shutdown();
    }
}
