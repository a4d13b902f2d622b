use anyhow::Result;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use gridnav_lattice::costmap::CostmapBuffer;
use gridnav_lattice::{normalize_angle, Pose};
use gridnav_nav::config::NavConfig;
use gridnav_nav::io::{AlwaysLocalized, NavIo, NoBezier, NoRotateHardware, PoseSource, QuietProtector};
use gridnav_nav::status::{Goal, NavStatus, Twist};
use gridnav_nav::supervisor::build_stack;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Drives a simulated robot across a synthetic costmap and prints the status
/// stream of the navigation supervisor.
#[derive(Debug, Parser)]
#[command(name = "simnav", rename_all = "kebab-case")]
struct Opt {
    /// Start pose "x,y,yaw" in meters/radians.
    #[arg(long, default_value = "1.0,3.0,0.0")]
    start: String,

    /// Goal pose "x,y,yaw" in meters/radians.
    #[arg(long, default_value = "6.0,3.0,0.0")]
    goal: String,

    /// Stamp a lethal block halfway to the goal before starting.
    #[arg(long)]
    obstacle: bool,

    /// Logging level to use: one of "error", "warn", "info", "debug", "trace"
    #[arg(short, long, default_value = "info")]
    log_level: tracing::Level,
}

fn parse_pose(s: &str) -> Result<Pose> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()?;
    anyhow::ensure!(parts.len() == 3, "expected \"x,y,yaw\", got {s:?}");
    Ok(Pose::new(parts[0], parts[1], parts[2]))
}

struct SimRobot {
    state: Mutex<(Pose, Twist)>,
}

impl PoseSource for SimRobot {
    fn current_pose(&self) -> Option<Pose> {
        Some(self.state.lock().unwrap().0)
    }

    fn current_velocity(&self) -> Twist {
        self.state.lock().unwrap().1
    }
}

fn main() -> Result<()> {
    // Terminate the process if a thread panics.
    // take_hook() returns the default hook in case when a custom one is not set
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        std::process::exit(1);
    }));

    let opt = Opt::parse();

    // set up logger
    let subscriber = tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::Uptime::from(Instant::now()))
        .with_thread_ids(true)
        .with_max_level(opt.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let start = parse_pose(&opt.start)?;
    let goal = parse_pose(&opt.goal)?;

    let mut buf = CostmapBuffer::new(200, 200, 0.05, 0.0, 0.0);
    // bound the world with walls and pre-inflate them
    for i in 0..200 {
        for (x, y) in [(i, 0), (i, 199), (0, i), (199, i)] {
            buf.set_static_cost(x, y, 254);
        }
    }
    if opt.obstacle {
        let mx = (start.x + goal.x) / 2.0;
        let my = (start.y + goal.y) / 2.0;
        buf.stamp_rect(mx - 0.25, my - 0.25, mx + 0.25, my + 0.25, 254);
        tracing::info!(x = mx, y = my, "stamped a lethal block on the route");
    }
    buf.reinflate(0.2, 0.4);
    let costmap = buf.shared();

    let robot = Arc::new(SimRobot {
        state: Mutex::new((start, Twist::ZERO)),
    });
    let io = NavIo {
        pose: robot.clone(),
        localization: Arc::new(AlwaysLocalized),
        protector: Arc::new(QuietProtector),
        rotate: Arc::new(NoRotateHardware),
        bezier: Arc::new(NoBezier),
    };

    let mut cfg = NavConfig::default();
    cfg.lattice.map_size = 200;
    let period = 1.0 / cfg.supervisor.controller_frequency;
    cfg.controller.control_period = period;

    let mut stack = build_stack(cfg, costmap, io)?;
    anyhow::ensure!(
        stack.supervisor.set_goal(Goal::normal(goal)),
        "goal rejected: target footprint is in collision"
    );

    // integrate published commands as robot motion
    let vel_rx = stack.vel_rx.clone();
    let sim = robot.clone();
    let pump = thread::spawn(move || {
        while let Ok(cmd) = vel_rx.recv_timeout(Duration::from_secs(5)) {
            let mut st = sim.state.lock().unwrap();
            let (ref mut pose, ref mut vel) = *st;
            pose.x += cmd.vx * pose.th.cos() * period;
            pose.y += cmd.vx * pose.th.sin() * period;
            pose.th = normalize_angle(pose.th + cmd.wz * period);
            *vel = cmd;
        }
    });

    let supervisor = thread::spawn(move || {
        stack.supervisor.run();
        stack.supervisor.result()
    });

    let mut last = None;
    loop {
        match stack.status_rx.recv_timeout(Duration::from_secs(30)) {
            Ok(status) => {
                if last != Some(status) {
                    let pose = robot.current_pose().unwrap_or(start);
                    println!("[{:7.2} {:7.2} {:7.2}] {:?}", pose.x, pose.y, pose.th, status);
                    last = Some(status);
                }
                if matches!(
                    status,
                    NavStatus::GoalReached
                        | NavStatus::GoalUnreached
                        | NavStatus::GoalUnreachable
                        | NavStatus::LocationInvalid
                ) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => anyhow::bail!("no status for 30 s, giving up"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let result = supervisor.join().expect("supervisor thread panicked");
    tracing::info!(?result, "navigation finished");

    stack.cell.shutdown();
    stack.worker.join().expect("worker thread panicked");
    drop(stack.vel_rx);
    let _ = pump.join();
    Ok(())
}
