//! Reload continuity against real worker processes.
//!
//! Workers are this test binary re-run with only `worker_entry` selected; in
//! a worker that test serves the inherited listener, elsewhere it is a no-op.

use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use lumen::supervisor::{
    State, Supervisor, SupervisorConfig, WorkerCommand, inherited_listener, is_worker,
};

#[test]
fn worker_entry() {
    if !is_worker() {
        return;
    }
    let listener = inherited_listener().expect("inherited listener");
    listener.set_nonblocking(false).expect("blocking");
    loop {
        match listener.accept() {
            Ok((mut stream, _)) => {
                let _ = writeln!(stream, "{}", std::process::id());
            }
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
}

fn ask_pid(addr: SocketAddr) -> Result<u32> {
    let stream = TcpStream::connect(addr).context("connect")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    line.trim().parse().with_context(|| format!("bad reply {line:?}"))
}

fn ask_pid_retrying(addr: SocketAddr) -> Result<u32> {
    let mut last = None;
    for _ in 0..50 {
        match ask_pid(addr) {
            Ok(pid) => return Ok(pid),
            Err(err) => last = Some(err),
        }
        thread::sleep(Duration::from_millis(20));
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("no reply")))
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_keeps_the_listener_served() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let command = WorkerCommand {
        program: std::env::current_exe()?,
        args: ["worker_entry", "--exact", "--test-threads=1"]
            .into_iter()
            .map(OsString::from)
            .collect(),
        working_dir: std::env::current_dir()?,
    };
    let mut config = SupervisorConfig::new(command);
    config.settle = Duration::from_millis(300);
    config.drain_timeout = Duration::from_secs(2);
    let mut supervisor = Supervisor::new(config, listener);

    supervisor.start().await?;
    let first = tokio::task::spawn_blocking(move || ask_pid_retrying(addr)).await??;
    assert_eq!(Some(first), supervisor.worker_pid().and_then(|p| p.try_into().ok()));

    // clients keep connecting for the whole handoff
    let running = Arc::new(AtomicBool::new(true));
    let served = Arc::new(AtomicUsize::new(0));
    let client = {
        let (running, served) = (running.clone(), served.clone());
        thread::spawn(move || -> Result<()> {
            while running.load(Ordering::Acquire) {
                ask_pid_retrying(addr)?;
                served.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        })
    };

    supervisor.reload().await?;
    assert_eq!(supervisor.state(), State::Supervising);
    let second = tokio::task::spawn_blocking(move || ask_pid_retrying(addr)).await??;
    assert_ne!(first, second);

    running.store(false, Ordering::Release);
    client.join().expect("client thread")?;
    assert!(served.load(Ordering::Acquire) > 0);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), State::Stopped);
    Ok(())
}
