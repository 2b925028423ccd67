use crate::domain::models::EventBus;
use crate::infrastructure::ipc::socket_name;
use anyhow::{Context, Result};
use interprocess::local_socket::{traits::ListenerExt, ListenerOptions};
use std::io::Write;
use std::sync::mpsc::{self as std_mpsc, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Lines queued per subscriber before it counts as too slow.
pub const SUBSCRIBER_QUEUE: usize = 1024;

/// Unix time in seconds, as carried in every broadcast message.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// One connected subscriber: a bounded queue drained by its own writer thread.
///
/// Socket I/O only ever happens on that thread, so a subscriber that stops
/// reading fills its queue and gets dropped without stalling anyone else.
pub struct Subscriber {
    id: u64,
    lines: SyncSender<String>,
}

impl Subscriber {
    pub fn spawn<W: Write + Send + 'static>(id: u64, mut writer: W, capacity: usize) -> Result<Self> {
        let (lines, rx) = std_mpsc::sync_channel::<String>(capacity);
        std::thread::Builder::new()
            .name(format!("subscriber-{}", id))
            .spawn(move || {
                for line in rx {
                    let sent = writer
                        .write_all(line.as_bytes())
                        .and_then(|_| writer.write_all(b"\n"))
                        .and_then(|_| writer.flush());
                    if let Err(e) = sent {
                        debug!("Subscriber {} write failed: {}", id, e);
                        break;
                    }
                }
                debug!("Subscriber {} writer stopped", id);
            })?;
        Ok(Self { id, lines })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Queue one line for every subscriber, dropping the full and closed ones.
///
/// Never blocks. Returns how many subscribers took the line.
pub fn fan_out(subscribers: &mut Vec<Subscriber>, line: &str) -> usize {
    subscribers.retain(|s| match s.lines.try_send(line.to_string()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Subscriber {} is not keeping up, dropping it", s.id);
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            info!("Subscriber {} disconnected", s.id);
            false
        }
    });
    subscribers.len()
}

/// Start the broadcast endpoint.
///
/// One thread accepts subscribers, another forwards every [`EventBus`] event
/// as a topic-prefixed JSON line.
pub fn spawn_publisher(socket: &str, bus: &EventBus) -> Result<()> {
    let listener = ListenerOptions::new()
        .name(socket_name(socket)?)
        .create_sync()
        .with_context(|| format!("Failed to bind publish socket '{}'", socket))?;
    info!("Publishing events on '{}'", socket);

    let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));

    let accepted = Arc::clone(&subscribers);
    std::thread::Builder::new()
        .name("publish-accept".to_string())
        .spawn(move || {
            let mut next_id = 0u64;
            for conn in listener.incoming().filter_map(|x| x.ok()) {
                next_id += 1;
                match Subscriber::spawn(next_id, conn, SUBSCRIBER_QUEUE) {
                    Ok(subscriber) => {
                        info!("Subscriber {} connected", next_id);
                        accepted
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(subscriber);
                    }
                    Err(e) => warn!("Could not start subscriber writer: {}", e),
                }
            }
        })?;

    let mut rx = bus.subscribe();
    std::thread::Builder::new()
        .name("publish-forward".to_string())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(event) => {
                    let line = event.to_wire(unix_timestamp());
                    let mut subs = subscribers
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if !subs.is_empty() {
                        fan_out(&mut subs, &line);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Publisher lagged, {} event(s) skipped", n),
                Err(RecvError::Closed) => {
                    info!("Event bus closed, publisher stopping");
                    break;
                }
            }
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::{Duration, Instant};

    /// Collects everything written to it.
    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<u8>>>);

    impl Collector {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Collector {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A peer that never reads: every write blocks forever.
    struct Stalled(std_mpsc::Receiver<()>);

    impl Write for Stalled {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_stalled_subscriber_is_dropped() {
        let (_hold, never) = std_mpsc::channel();
        let healthy = Collector::default();
        let mut subs = vec![
            Subscriber::spawn(1, Stalled(never), 8).unwrap(),
            Subscriber::spawn(2, healthy.clone(), 1024).unwrap(),
        ];

        for i in 0..200 {
            fan_out(&mut subs, &format!("IMU {}", i));
        }
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id(), 2);

        // A subscriber joining after the stall still gets new events.
        let late = Collector::default();
        subs.push(Subscriber::spawn(3, late.clone(), 1024).unwrap());
        assert_eq!(fan_out(&mut subs, "GUI hello"), 2);

        assert!(wait_for(|| late.text() == "GUI hello\n"));
        assert!(wait_for(|| healthy.text().lines().count() == 201));
        assert!(healthy.text().starts_with("IMU 0\nIMU 1\n"));
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let mut subs = vec![Subscriber::spawn(1, Broken, 8).unwrap()];
        fan_out(&mut subs, "GUI first");
        // The writer thread exits on the failed write, closing its queue.
        assert!(wait_for(|| fan_out(&mut subs, "GUI again") == 0));
        assert!(subs.is_empty());
    }

    #[test]
    fn test_timestamp_is_unix_seconds() {
        let t = unix_timestamp();
        assert!(t > 1_600_000_000.0);
    }
}
