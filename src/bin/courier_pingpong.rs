use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use courier::core::NodeConfig;
use courier::{Error, LocalNode, Result};
use log::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    Ping,
    Pong,
}

#[derive(Parser, Debug)]
#[command(about = "Two-rank round-trip latency over courier shared-memory queues")]
struct Args {
    /// Job directory holding the segment files (tmpfs recommended).
    #[arg(long, default_value = "/dev/shm/courier-pingpong")]
    dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Role::Ping)]
    role: Role,
    #[arg(long, default_value_t = 100_000)]
    iterations: u64,
    #[arg(long, default_value_t = 64)]
    size: usize,
    /// Optional JSON node config.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Spawn the pong side as a child process.
    #[arg(long)]
    spawn: bool,
}

const PING_RANK: u32 = 0;
const PONG_RANK: u32 = 1;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::default(),
    };

    let child = if args.spawn && args.role == Role::Ping {
        Some(spawn_pong(&args)?)
    } else {
        None
    };

    let (rank, peer) = match args.role {
        Role::Ping => (PING_RANK, PONG_RANK),
        Role::Pong => (PONG_RANK, PING_RANK),
    };
    let mut node = LocalNode::create(&args.dir, rank, config)?;
    attach_with_retry(&mut node, peer)?;

    match args.role {
        Role::Ping => run_ping(&mut node, peer, &args)?,
        Role::Pong => run_pong(&mut node, peer, args.iterations)?,
    }

    if let Some(mut child) = child {
        let status = child.wait()?;
        info!("pong exited with {status}");
    }
    Ok(())
}

fn spawn_pong(args: &Args) -> Result<Child> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--dir")
        .arg(&args.dir)
        .args(["--role", "pong"])
        .args(["--iterations", &args.iterations.to_string()])
        .args(["--size", &args.size.to_string()]);
    if let Some(config) = &args.config {
        cmd.arg("--config").arg(config);
    }
    Ok(cmd.spawn()?)
}

fn attach_with_retry(node: &mut LocalNode, peer: u32) -> Result<()> {
    let deadline = quanta::Instant::now() + ATTACH_TIMEOUT;
    loop {
        match node.attach_peer(peer) {
            Ok(()) => return Ok(()),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                if quanta::Instant::now() >= deadline {
                    return Err(Error::Io(err));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_ping(node: &mut LocalNode, peer: u32, args: &Args) -> Result<()> {
    let payload = vec![0xA5u8; args.size];
    let mut rtts = Vec::with_capacity(args.iterations as usize);
    let start = quanta::Instant::now();
    for _ in 0..args.iterations {
        let sent = quanta::Instant::now();
        node.send(peer, &payload)?;
        let reply = node
            .recv_timeout(RECV_TIMEOUT)?
            .ok_or(Error::Unsupported("pong did not answer"))?;
        rtts.push(quanta::Instant::now().duration_since(sent).as_nanos() as u64);
        node.release(reply)?;
    }
    let elapsed = quanta::Instant::now().duration_since(start);
    rtts.sort_unstable();
    let pct = |p: f64| rtts[((rtts.len() as f64 - 1.0) * p) as usize];
    info!(
        "{} round trips of {} bytes in {:?} ({:.0} rt/s)",
        args.iterations,
        args.size,
        elapsed,
        args.iterations as f64 / elapsed.as_secs_f64()
    );
    if !rtts.is_empty() {
        println!(
            "rtt ns: p50={} p99={} p99.9={} max={}",
            pct(0.5),
            pct(0.99),
            pct(0.999),
            rtts[rtts.len() - 1]
        );
    }
    Ok(())
}

fn run_pong(node: &mut LocalNode, peer: u32, iterations: u64) -> Result<()> {
    for _ in 0..iterations {
        let msg = node
            .recv_timeout(RECV_TIMEOUT)?
            .ok_or(Error::Unsupported("ping went quiet"))?;
        let echo = msg.payload().to_vec();
        node.release(msg)?;
        node.send(peer, &echo)?;
    }
    // Drain our fragments coming back before the segment goes away.
    while let Some(msg) = node.recv_timeout(Duration::from_millis(50))? {
        node.release(msg)?;
    }
    Ok(())
}
