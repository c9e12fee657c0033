//! One sandbox worker: a listener on a leased port plus the learner's program
//! running as a child process in a private temp directory.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tutoria_settings::SandboxSettings;

use crate::error::SandboxError;
use crate::events::WorkerEvent;
use crate::listener;
use crate::ports::PortAllocator;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const LISTENER_SHUTDOWN: Duration = Duration::from_secs(1);
const EVENT_QUEUE: usize = 512;

/// How worker programs are launched.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_host: IpAddr,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub program_extension: String,
}

impl WorkerConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self, SandboxError> {
        let bind_host = settings
            .bind_host
            .parse()
            .map_err(|_| SandboxError::Config(format!("bind host {:?}", settings.bind_host)))?;
        Ok(Self {
            bind_host,
            interpreter: settings.interpreter.clone(),
            interpreter_args: settings.interpreter_args.clone(),
            program_extension: settings.program_extension.clone(),
        })
    }
}

/// Start a worker task. Its first terminal-or-open event is either
/// [`WorkerEvent::Opened`] or [`WorkerEvent::Failed`]. The task exits when
/// `cancel` fires or its listener dies, and releases the port on the way out.
pub fn launch(
    config: Arc<WorkerConfig>,
    ports: Arc<PortAllocator>,
    code: String,
    source: String,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<WorkerEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let task = tokio::spawn(run(config, ports, code, source, cancel, tx));
    (task, rx)
}

async fn run(
    config: Arc<WorkerConfig>,
    ports: Arc<PortAllocator>,
    code: String,
    source: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<WorkerEvent>,
) {
    let failed = |reason: String| WorkerEvent::Failed { reason };

    let (lease, tcp) = match ports.acquire().await {
        Ok(bound) => bound,
        Err(e) => {
            let _ = tx.send(failed(e.to_string())).await;
            return;
        }
    };
    let addr = match tcp.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = tx.send(failed(format!("listener address: {e}"))).await;
            return;
        }
    };

    let workdir = match tempfile::Builder::new().prefix("tutoria-sandbox-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            let _ = tx.send(failed(format!("workdir: {e}"))).await;
            return;
        }
    };
    let program = workdir
        .path()
        .join(format!("program.{}", config.program_extension));
    if let Err(e) = tokio::fs::write(&program, source.as_bytes()).await {
        let _ = tx.send(failed(format!("write program: {e}"))).await;
        return;
    }

    let mut child = match spawn_program(&config, &program, workdir.path(), &code, addr) {
        Ok(child) => child,
        Err(e) => {
            let _ = tx.send(failed(format!("spawn {}: {e}", config.interpreter))).await;
            return;
        }
    };
    let mut group = ProcessGroup::of(&child);
    let readers = [
        child
            .stdout
            .take()
            .map(|out| forward_lines(out, tx.clone(), WorkerEvent::Log)),
        child
            .stderr
            .take()
            .map(|err| forward_lines(err, tx.clone(), WorkerEvent::Error)),
    ];

    let router = listener::router(tx.clone());
    let shutdown = cancel.child_token();
    let mut server = tokio::spawn(async move {
        axum::serve(tcp, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    });

    info!(code = %code, %addr, pid = ?child.id(), "sandbox worker opened");
    let _ = tx.send(WorkerEvent::Opened { addr }).await;

    let mut program_running = true;
    let mut server_done = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            status = child.wait(), if program_running => {
                program_running = false;
                let event = match status {
                    Ok(s) if s.success() => WorkerEvent::Info("program finished".into()),
                    Ok(s) => WorkerEvent::Error(format!("program exited with {s}")),
                    Err(e) => WorkerEvent::Error(format!("program wait failed: {e}")),
                };
                debug!(code = %code, ?event, "program ended");
                let _ = tx.send(event).await;
            }
            res = &mut server => {
                server_done = true;
                let reason = match res {
                    Ok(Ok(())) => "listener stopped".to_string(),
                    Ok(Err(e)) => format!("listener error: {e}"),
                    Err(e) => format!("listener task failed: {e}"),
                };
                warn!(code = %code, %reason, "sandbox listener closed");
                let _ = tx.send(WorkerEvent::ListenerClosed { reason }).await;
                break;
            }
        }
    }

    // Background jobs of the program share its group and may still hold the
    // output pipes after the program itself has exited.
    group.kill();
    if program_running {
        if let Err(e) = child.kill().await {
            warn!(code = %code, error = %e, "failed to kill sandbox program");
        }
    }
    if !server_done {
        cancel.cancel();
        if tokio::time::timeout(LISTENER_SHUTDOWN, &mut server).await.is_err() {
            server.abort();
        }
    }
    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(LISTENER_SHUTDOWN, reader).await.is_err() {
            debug!(code = %code, "output reader did not drain in time");
        }
    }

    drop(workdir);
    drop(lease);
    info!(code = %code, %addr, "sandbox worker closed");
}

fn spawn_program(
    config: &WorkerConfig,
    program: &Path,
    workdir: &Path,
    code: &str,
    addr: SocketAddr,
) -> std::io::Result<Child> {
    let path = std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());
    let mut command = Command::new(&config.interpreter);
    #[cfg(unix)]
    command.process_group(0);
    command
        .args(&config.interpreter_args)
        .arg(program)
        .current_dir(workdir)
        .env_clear()
        .env("PATH", path)
        .env("HOME", workdir)
        .env("TMPDIR", workdir)
        .env("LANG", "C.UTF-8")
        .env("SANDBOX_HOST", addr.ip().to_string())
        .env("SANDBOX_PORT", addr.port().to_string())
        .env("SESSION_CODE", code)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// The process group a worker program leads. Everything the program starts
/// is killed with it, once, either explicitly or on drop.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pgid: i32) {
    // SAFETY: killpg only sends a signal; no memory is shared with the callee.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

fn forward_lines<R>(
    pipe: R,
    tx: mpsc::Sender<WorkerEvent>,
    wrap: fn(String) -> WorkerEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(line)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn shell() -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            interpreter: "sh".into(),
            interpreter_args: Vec::new(),
            program_extension: "sh".into(),
        })
    }

    fn ports(start: u16) -> Arc<PortAllocator> {
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), start..=start + 99, 20)
    }

    async fn next_opened(rx: &mut mpsc::Receiver<WorkerEvent>) -> SocketAddr {
        loop {
            match rx.recv().await {
                Some(WorkerEvent::Opened { addr }) => return addr,
                Some(WorkerEvent::Failed { reason }) => panic!("worker failed: {reason}"),
                Some(_) => continue,
                None => panic!("worker ended before opening"),
            }
        }
    }

    #[tokio::test]
    async fn runs_program_and_forwards_output() {
        let cancel = CancellationToken::new();
        let (task, mut rx) = launch(
            shell(),
            ports(47400),
            "ABCD".into(),
            "echo \"hello from $SESSION_CODE\"\necho oops >&2\n".into(),
            cancel.clone(),
        );
        let addr = next_opened(&mut rx).await;
        assert!((47400..=47499).contains(&addr.port()));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match rx.recv().await {
                Some(event) => seen.push(event),
                None => break,
            }
        }
        assert!(seen.contains(&WorkerEvent::Log("hello from ABCD".into())));
        assert!(seen.contains(&WorkerEvent::Error("oops".into())));
        assert!(seen.contains(&WorkerEvent::Info("program finished".into())));

        // listener stays up after the program exits
        let body = reqwest::get(format!("http://{addr}/test")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "Hello, World!");

        cancel.cancel();
        task.await.unwrap();
        assert!(reqwest::get(format!("http://{addr}/test")).await.is_err());
    }

    #[tokio::test]
    async fn program_fault_is_reported_not_fatal() {
        let cancel = CancellationToken::new();
        let allocator = ports(47500);
        let (task, mut rx) = launch(shell(), allocator.clone(), "ABCD".into(), "exit 3\n".into(), cancel.clone());
        let _addr = next_opened(&mut rx).await;
        loop {
            match rx.recv().await {
                Some(WorkerEvent::Error(line)) => {
                    assert!(line.contains("exit"), "got: {line}");
                    break;
                }
                Some(_) => continue,
                None => panic!("worker ended"),
            }
        }
        assert!(!task.is_finished());
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn cancel_kills_long_running_program() {
        let cancel = CancellationToken::new();
        let allocator = ports(47600);
        let (task, mut rx) = launch(shell(), allocator.clone(), "ABCD".into(), "sleep 30\n".into(), cancel.clone());
        next_opened(&mut rx).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should stop promptly")
            .unwrap();
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[cfg(target_os = "linux")]
    fn alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_kills_background_jobs_of_exited_program() {
        let cancel = CancellationToken::new();
        let allocator = ports(47800);
        let (task, mut rx) = launch(
            shell(),
            allocator.clone(),
            "ABCD".into(),
            "sleep 986 &\necho $!\n".into(),
            cancel.clone(),
        );
        next_opened(&mut rx).await;
        let pid: u32 = loop {
            match rx.recv().await {
                Some(WorkerEvent::Log(line)) => break line.trim().parse().unwrap(),
                Some(_) => continue,
                None => panic!("worker ended"),
            }
        };
        assert!(alive(pid));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("worker should stop promptly")
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while alive(pid) {
            assert!(tokio::time::Instant::now() < deadline, "background job {pid} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn missing_interpreter_fails_start() {
        let config = Arc::new(WorkerConfig {
            interpreter: "/nonexistent/interpreter".into(),
            ..(*shell()).clone()
        });
        let allocator = ports(47700);
        let (task, mut rx) = launch(config, allocator.clone(), "ABCD".into(), "x".into(), CancellationToken::new());
        match rx.recv().await {
            Some(WorkerEvent::Failed { reason }) => assert!(reason.contains("spawn")),
            other => panic!("expected failure, got {other:?}"),
        }
        task.await.unwrap();
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn config_rejects_bad_host() {
        let settings = SandboxSettings {
            bind_host: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(matches!(
            WorkerConfig::from_settings(&settings),
            Err(SandboxError::Config(_))
        ));
    }
}
