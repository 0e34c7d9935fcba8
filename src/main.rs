// src/main.rs
//
// Ping-pong demo: an echo task and a pinger task trade fixed 8-byte frames
// over a non-blocking socketpair while a reporter drains a channel of
// round-trip results. Everything runs on one scheduler; the pinger ends the
// session by dropping its socket (the echo side reads EOF) and jumping a
// shutdown signal to the front of the report channel.

use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::time::{Duration, Instant};

use cosched::{
    with_runtime, Channel, Cx, DelayUntil, Drive, Progress, ReadDriver, TaskBody, TracingTracer,
    WriteDriver,
};

#[derive(Default)]
struct Metrics {
    pongs: u32,
}

enum Report {
    Pong(u32),
    Shutdown,
}

// ----------------------------- echo side -----------------------------

struct EchoTask {
    sock: UnixStream,
    rd: ReadDriver,
    wr: WriteDriver,
    buf: [u8; 8],
    writing: bool,
}

impl EchoTask {
    fn new(sock: UnixStream) -> Self {
        Self {
            sock,
            rd: ReadDriver::new(8),
            wr: WriteDriver::new(),
            buf: [0u8; 8],
            writing: false,
        }
    }
}

impl<'env> TaskBody<'env, Metrics> for EchoTask {
    fn resume(mut self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, Metrics>) -> Progress {
        if cx.killed() {
            return Progress::Done;
        }
        let this = &mut *self;
        loop {
            if !this.writing {
                match this.rd.drive(cx, &mut this.sock, &mut this.buf) {
                    Drive::Pending => return Progress::Yield,
                    Drive::Done(_) => {
                        this.writing = true;
                        this.wr.reset();
                    }
                    Drive::Closed(_) => return Progress::Done,
                    Drive::Fatal(e) => {
                        tracing::warn!(error = %e, "echo read failed");
                        return Progress::Done;
                    }
                }
            } else {
                let frame = this.buf;
                match this.wr.drive(cx, &mut this.sock, &frame) {
                    Drive::Pending => return Progress::Yield,
                    Drive::Done(_) => {
                        this.writing = false;
                        this.rd.reset(8);
                    }
                    Drive::Closed(_) | Drive::Fatal(_) => return Progress::Done,
                }
            }
        }
    }
}

// ----------------------------- ping side -----------------------------

#[derive(Clone, Copy)]
enum PingState {
    Send,
    Recv,
    Pause(Instant),
}

struct PingTask {
    sock: UnixStream,
    reports: Channel<Report>,
    rounds: u32,
    seq: u32,
    state: PingState,
    rd: ReadDriver,
    wr: WriteDriver,
    buf: [u8; 8],
}

impl PingTask {
    fn new(sock: UnixStream, reports: Channel<Report>, rounds: u32) -> Self {
        Self {
            sock,
            reports,
            rounds,
            seq: 0,
            state: PingState::Send,
            rd: ReadDriver::new(8),
            wr: WriteDriver::new(),
            buf: [0u8; 8],
        }
    }
}

impl<'env> TaskBody<'env, Metrics> for PingTask {
    fn resume(mut self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, Metrics>) -> Progress {
        if cx.killed() {
            self.reports.put_front(Report::Shutdown);
            return Progress::Done;
        }
        let this = &mut *self;
        loop {
            match this.state {
                PingState::Send => {
                    let frame = (this.seq as u64).to_be_bytes();
                    match this.wr.drive(cx, &mut this.sock, &frame) {
                        Drive::Pending => return Progress::Yield,
                        Drive::Done(_) => {
                            this.rd.reset(8);
                            this.state = PingState::Recv;
                        }
                        Drive::Closed(_) | Drive::Fatal(_) => {
                            this.reports.put_front(Report::Shutdown);
                            return Progress::Done;
                        }
                    }
                }
                PingState::Recv => match this.rd.drive(cx, &mut this.sock, &mut this.buf) {
                    Drive::Pending => return Progress::Yield,
                    Drive::Done(_) => {
                        this.seq += 1;
                        cx.resources.pongs += 1;
                        this.reports.put(Report::Pong(this.seq));
                        if this.seq == this.rounds {
                            // Control signal ahead of any still-buffered data.
                            this.reports.put_front(Report::Shutdown);
                            return Progress::Done;
                        }
                        this.state = PingState::Pause(Instant::now() + Duration::from_millis(20));
                    }
                    Drive::Closed(_) | Drive::Fatal(_) => {
                        this.reports.put_front(Report::Shutdown);
                        return Progress::Done;
                    }
                },
                PingState::Pause(when) => {
                    if Instant::now() >= when {
                        this.wr.reset();
                        this.state = PingState::Send;
                    } else {
                        cx.sleep_until(when);
                        return Progress::Yield;
                    }
                }
            }
        }
    }
}

// ----------------------------- reporter -----------------------------

struct ReportTask {
    reports: Channel<Report>,
}

impl<'env> TaskBody<'env, Metrics> for ReportTask {
    fn resume(self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, Metrics>) -> Progress {
        if cx.killed() {
            self.reports.forget_waiter(cx.id());
            return Progress::Done;
        }
        loop {
            match self.reports.recv(cx) {
                Some(Report::Pong(n)) => tracing::info!(n, "pong"),
                Some(Report::Shutdown) => return Progress::Done,
                None => return Progress::Yield,
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let (ping_sock, echo_sock) = UnixStream::pair()?;
    ping_sock.set_nonblocking(true)?;
    echo_sock.set_nonblocking(true)?;

    let mut metrics = Metrics::default();
    let exit = with_runtime(&mut metrics, |s| {
        s.set_tracer(Box::new(TracingTracer));

        let reports = s.channel::<Report>();
        s.spawn("echo", EchoTask::new(echo_sock));
        s.spawn("ping", PingTask::new(ping_sock, reports.clone(), 5));
        s.spawn("report", ReportTask { reports });
        // A watchdog nobody waits for; it just shows timers interleaving.
        s.spawn("watchdog", DelayUntil::after(Duration::from_millis(500)));

        let exit = s.run(|| false)?;
        tracing::info!(stats = ?s.stats(), "runtime drained");
        Ok::<_, cosched::RunError>(exit)
    })?;

    tracing::info!(?exit, pongs = metrics.pongs, "done");
    Ok(())
}
