//! Shared test doubles: a scripted command runner that simulates just enough
//! of the gluster CLI and mount tooling for the control loop to converge
//! against, plus scriptable child handles for the supervisor.
#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use gluster_entry::runner::{ChildHandle, Cmd, CommandResult, CommandRunner};

fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        elapsed: Duration::ZERO,
    }
}

fn fail(code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        elapsed: Duration::ZERO,
    }
}

#[derive(Default)]
struct FakeState {
    volumes: BTreeSet<String>,
    started: BTreeSet<String>,
    mounted: BTreeSet<String>,
}

/// Plan for the next spawned child.
pub enum SpawnPlan {
    /// Child stays alive until terminated.
    Alive,
    /// Child exits with this code before the grace window elapses.
    ExitsImmediately(i32),
    /// Child answers the first `n` liveness checks, then reports this exit
    /// code: lets tests kill the daemon at a deterministic point.
    ExitsAfterChecks(u32, i32),
    /// Child stays alive and ignores SIGTERM; only SIGKILL stops it.
    IgnoresTerm,
}

pub struct FakeRunner {
    state: Mutex<FakeState>,
    /// Display strings of every run() invocation, in order.
    pub calls: Mutex<Vec<String>>,
    /// Display strings of every spawn() invocation, in order.
    pub spawned: Mutex<Vec<String>>,
    /// Forced responses checked before the simulated CLI: first matching
    /// substring wins.
    pub overrides: Mutex<Vec<(String, CommandResult)>>,
    plans: Mutex<VecDeque<SpawnPlan>>,
    /// Handles to children spawned so far (shared flags, not the handles the
    /// code under test owns).
    pub children: Mutex<Vec<Arc<FakeChildFlags>>>,
    /// Help text served for `<binary> --help`.
    pub help_text: Mutex<String>,
}

pub struct FakeChildFlags {
    pub terminated: AtomicBool,
    pub killed: AtomicBool,
}

impl Default for FakeRunner {
    fn default() -> Self {
        FakeRunner {
            state: Mutex::default(),
            calls: Mutex::default(),
            spawned: Mutex::default(),
            overrides: Mutex::default(),
            plans: Mutex::default(),
            children: Mutex::default(),
            help_text: Mutex::new(
                "Usage: glusterd [OPTION...]\n  -N, --no-daemon  run in foreground".to_string(),
            ),
        }
    }
}

#[allow(dead_code)]
impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volume(self, name: &str, started: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.volumes.insert(name.to_string());
            if started {
                state.started.insert(name.to_string());
            }
        }
        self
    }

    pub fn with_mounted(self, target: &str) -> Self {
        self.state.lock().unwrap().mounted.insert(target.to_string());
        self
    }

    pub fn with_override(self, needle: &str, result: CommandResult) -> Self {
        self.overrides
            .lock()
            .unwrap()
            .push((needle.to_string(), result));
        self
    }

    pub fn with_client_help(self) -> Self {
        *self.help_text.lock().unwrap() =
            "Usage: glusterfs [OPTION...] --volfile-server=SERVER MOUNT-POINT".to_string();
        self
    }

    pub fn plan_spawn(&self, plan: SpawnPlan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.state.lock().unwrap().mounted.contains(target)
    }

    fn simulate(&self, cmd: &Cmd) -> CommandResult {
        let argv: Vec<&str> = cmd.argv().iter().map(String::as_str).collect();
        match cmd.program() {
            _ if argv == ["--help"] => ok(&self.help_text.lock().unwrap()),
            "gluster" => self.simulate_gluster(&argv),
            "mountpoint" => {
                let target = argv.last().copied().unwrap_or_default();
                if self.state.lock().unwrap().mounted.contains(target) {
                    ok("")
                } else {
                    fail(32, "not a mountpoint")
                }
            }
            "mount" => {
                let target = argv.last().copied().unwrap_or_default();
                self.state.lock().unwrap().mounted.insert(target.to_string());
                ok("")
            }
            "umount" => {
                let target = argv.last().copied().unwrap_or_default();
                self.state.lock().unwrap().mounted.remove(target);
                ok("")
            }
            "hostname" => ok("10.0.0.5 172.17.0.2\n"),
            "dpkg" => ok("glusterfs-server: /usr/sbin/glusterd\n"),
            _ => ok(""),
        }
    }

    fn simulate_gluster(&self, argv: &[&str]) -> CommandResult {
        let args: Vec<&str> = argv
            .iter()
            .copied()
            .filter(|a| *a != "--mode=script")
            .collect();
        let mut state = self.state.lock().unwrap();
        match args.as_slice() {
            ["volume", "list"] => ok(&state.volumes.iter().cloned().collect::<Vec<_>>().join("\n")),
            ["peer", ..] => ok(""),
            ["volume", "info", name] => {
                if state.volumes.contains(*name) {
                    ok(&format!("Volume Name: {name}\nType: Replicate\n"))
                } else {
                    fail(1, &format!("Volume {name} does not exist"))
                }
            }
            ["volume", "status", name] => {
                if state.started.contains(*name) {
                    ok(&format!("Status of volume: {name}\n"))
                } else {
                    fail(1, &format!("Volume {name} is not started"))
                }
            }
            ["volume", "create", name, ..] => {
                state.volumes.insert(name.to_string());
                ok(&format!("volume create: {name}: success"))
            }
            ["volume", "start", name] => {
                if state.started.insert(name.to_string()) {
                    ok(&format!("volume start: {name}: success"))
                } else {
                    fail(1, &format!("Volume {name} already started"))
                }
            }
            ["volume", "set", ..] | ["volume", "reset", ..] | ["volume", "quota", ..] => ok(""),
            _ => ok(""),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        let display = cmd.display();
        self.calls.lock().unwrap().push(display.clone());
        if let Some((_, result)) = self
            .overrides
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| display.contains(needle))
        {
            return Ok(result.clone());
        }
        Ok(self.simulate(cmd))
    }

    fn run_timeout(&self, cmd: &Cmd, _timeout: Duration) -> Result<CommandResult> {
        self.run(cmd)
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ChildHandle>> {
        self.spawned.lock().unwrap().push(cmd.display());
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SpawnPlan::Alive);
        let flags = Arc::new(FakeChildFlags {
            terminated: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        });
        self.children.lock().unwrap().push(Arc::clone(&flags));
        Ok(Box::new(FakeChild {
            plan,
            flags,
            checks: 0,
        }))
    }
}

pub struct FakeChild {
    plan: SpawnPlan,
    flags: Arc<FakeChildFlags>,
    checks: u32,
}

impl ChildHandle for FakeChild {
    fn id(&self) -> u32 {
        4242
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        self.checks += 1;
        match self.plan {
            SpawnPlan::ExitsImmediately(rc) => Ok(Some(rc)),
            SpawnPlan::ExitsAfterChecks(n, rc) => {
                if self.checks > n {
                    Ok(Some(rc))
                } else {
                    Ok(None)
                }
            }
            SpawnPlan::Alive => {
                if self.flags.terminated.load(Ordering::SeqCst)
                    || self.flags.killed.load(Ordering::SeqCst)
                {
                    Ok(Some(0))
                } else {
                    Ok(None)
                }
            }
            SpawnPlan::IgnoresTerm => {
                if self.flags.killed.load(Ordering::SeqCst) {
                    Ok(Some(137))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.flags.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.flags.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
