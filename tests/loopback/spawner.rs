use std::future::Future;
use std::io;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio::sync::oneshot;
use tsumugi::{
    ExitSignal, ExitStatus, SessionCommand, SessionControl, SessionSpawner, SpawnRequest, SpawnedProcess,
};

/// Spawns fake processes that run as tokio tasks.
///
/// - `cat` (also the `echo` subsystem) copies stdin to stdout,
/// - `fail` writes to stderr and exits with code 3,
/// - `kill` exits with signal KILL,
/// - `env` prints the environment,
/// - `wait-signal` exits with the first signal that it receives,
/// - `agent` connects to `SSH_AUTH_SOCK` and prints what it reads,
/// - the shell prints the name of the user.
pub struct TestSpawner;

impl SessionSpawner for TestSpawner {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedProcess> {
        let command = match &request.command {
            SessionCommand::Exec(command) => String::from_utf8_lossy(command).into_owned(),
            SessionCommand::Subsystem(name) if name == "echo" => "cat".into(),
            SessionCommand::Subsystem(_) => return Err(io::Error::new(io::ErrorKind::NotFound, "no subsystem")),
            SessionCommand::Shell => {
                let output = format!("{}\n", request.username);
                return Ok(spawn_process(|_, mut stdout, _| async move {
                    stdout.write_all(output.as_bytes()).await?;
                    Ok(ExitStatus::Code(0))
                }))
            },
        };

        match command.as_str() {
            "cat" => Ok(spawn_process(|mut stdin, mut stdout, _| async move {
                tokio::io::copy(&mut stdin, &mut stdout).await?;
                Ok(ExitStatus::Code(0))
            })),
            "fail" => Ok(spawn_process(|_, _, mut stderr| async move {
                stderr.write_all(b"oops\n").await?;
                Ok(ExitStatus::Code(3))
            })),
            "kill" => Ok(spawn_process(|_, _, _| async move {
                Ok(ExitStatus::Signal(signal("KILL")))
            })),
            "env" => {
                let output = request.env.iter()
                    .map(|(name, value)| format!("{}={}\n", name, value))
                    .collect::<String>();
                Ok(spawn_process(|_, mut stdout, _| async move {
                    stdout.write_all(output.as_bytes()).await?;
                    Ok(ExitStatus::Code(0))
                }))
            },
            "wait-signal" => {
                let (signal_tx, signal_rx) = oneshot::channel::<String>();
                let mut process = spawn_process(|_, _, _| async move {
                    let signal_name = signal_rx.await.unwrap_or_else(|_| "HUP".into());
                    Ok(ExitStatus::Signal(signal(&signal_name)))
                });
                process.control = Some(Box::new(SignalControl { signal_tx: Some(signal_tx) }));
                Ok(process)
            },
            "agent" => {
                let agent_sock = request.env.iter()
                    .find(|(name, _)| name == "SSH_AUTH_SOCK")
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no SSH_AUTH_SOCK"))?;
                Ok(spawn_process(|_, mut stdout, _| async move {
                    let mut agent = connect_agent(&agent_sock).await?;
                    let mut reply = Vec::new();
                    agent.read_to_end(&mut reply).await?;
                    stdout.write_all(&reply).await?;
                    Ok(ExitStatus::Code(0))
                }))
            },
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "unknown command")),
        }
    }
}

#[cfg(unix)]
async fn connect_agent(path: &str) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(not(unix))]
async fn connect_agent(_path: &str) -> io::Result<DuplexStream> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no unix sockets"))
}

fn signal(signal_name: &str) -> ExitSignal {
    ExitSignal {
        signal_name: signal_name.into(),
        core_dumped: false,
        message: "".into(),
        message_lang: "".into(),
    }
}

struct SignalControl {
    signal_tx: Option<oneshot::Sender<String>>,
}

impl SessionControl for SignalControl {
    fn signal(&mut self, signal_name: &str) {
        if let Some(signal_tx) = self.signal_tx.take() {
            let _ = signal_tx.send(signal_name.into());
        }
    }
}

/// Runs `body` with the process ends of stdin, stdout and stderr.
///
/// The streams are dropped when the body returns, so the channel sees end of file before the
/// exit status.
fn spawn_process<F, Fut>(body: F) -> SpawnedProcess
    where F: FnOnce(DuplexStream, DuplexStream, DuplexStream) -> Fut,
          Fut: Future<Output = io::Result<ExitStatus>> + Send + 'static,
{
    let (stdin, proc_stdin) = tokio::io::duplex(4096);
    let (proc_stdout, stdout) = tokio::io::duplex(4096);
    let (proc_stderr, stderr) = tokio::io::duplex(4096);
    let task = tokio::spawn(body(proc_stdin, proc_stdout, proc_stderr));
    let exit = async move {
        match task.await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                log::debug!("test process failed: {}", err);
                ExitStatus::Code(255)
            },
            Err(_) => ExitStatus::Code(255),
        }
    };

    SpawnedProcess {
        stdin: Box::pin(stdin),
        stdout: Box::pin(stdout),
        stderr: Some(Box::pin(stderr)),
        exit: Box::pin(exit),
        control: None,
    }
}
