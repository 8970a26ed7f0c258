//! In-memory container runtime for tests.
//!
//! Each sandbox is a tokio task wired up with duplex pipes: stdin is read
//! until the client shuts its write half, then a small "program" turns the
//! source file and stdin into output frames, which are written in the
//! multiplexed wire format and read back through [`FrameReader`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::sandbox::stream::{Frame, FrameReader, FrameStream, StdinChannel, StreamTag};
use crate::sandbox::{ContainerRuntime, SandboxHandle, SandboxSpec, SandboxSummary};

/// Encode one frame in the multiplexed wire format
pub(crate) fn encode_frame(stream: StreamTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.push(stream.as_byte());
    out.extend([0, 0, 0]);
    out.extend((payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// What the sandboxed process sees
pub(crate) struct ProgramInput {
    pub source: String,
    pub stdin: Vec<u8>,
}

type Program = Arc<dyn Fn(ProgramInput) -> Vec<Frame> + Send + Sync>;

/// Stage at which the fake runtime should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Create,
    AttachStdin,
    AttachOutput,
    Start,
}

struct Container {
    spec: SandboxSpec,
    stdin_client: Option<DuplexStream>,
    stdin_process: Option<DuplexStream>,
    output_reader: Option<DuplexStream>,
    output_writer: Option<DuplexStream>,
    kill_tx: Option<oneshot::Sender<()>>,
    kill_rx: Option<oneshot::Receiver<()>>,
    running: bool,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, Container>,
    next_id: u64,
    created: Vec<SandboxSpec>,
    removed: Vec<String>,
    stdin_received: Vec<Vec<u8>>,
}

#[derive(Clone)]
pub(crate) struct FakeRuntime {
    state: Arc<Mutex<State>>,
    program: Program,
    pings: Arc<AtomicU32>,
    failing_pings: u32,
    missing_images: Vec<String>,
    fail_at: Option<FailAt>,
    hang: bool,
    streaming: bool,
}

impl FakeRuntime {
    pub fn new(program: impl Fn(ProgramInput) -> Vec<Frame> + Send + Sync + 'static) -> Self {
        FakeRuntime {
            state: Arc::new(Mutex::new(State::default())),
            program: Arc::new(program),
            pings: Arc::new(AtomicU32::new(0)),
            failing_pings: 0,
            missing_images: Vec::new(),
            fail_at: None,
            hang: false,
            streaming: false,
        }
    }

    /// Copies stdin to stdout
    pub fn echo() -> Self {
        Self::new(|input| vec![Frame::new(StreamTag::Stdout, input.stdin)])
    }

    /// Understands three statements, one per line:
    /// `print('text')`, `print(input())` and `error('text')`.
    pub fn interpreter() -> Self {
        Self::new(|input| {
            let stdin = String::from_utf8_lossy(&input.stdin).into_owned();
            let mut lines = stdin.lines();
            let mut frames = Vec::new();
            for stmt in input.source.lines().map(str::trim) {
                if stmt == "print(input())" {
                    let line = lines.next().unwrap_or_default();
                    frames.push(Frame::new(StreamTag::Stdout, format!("{}\n", line)));
                } else if let Some(text) = literal_arg(stmt, "print") {
                    frames.push(Frame::new(StreamTag::Stdout, format!("{}\n", text)));
                } else if let Some(text) = literal_arg(stmt, "error") {
                    frames.push(Frame::new(StreamTag::Stderr, format!("{}\n", text)));
                }
            }
            frames
        })
    }

    /// Echoes stdin back chunk by chunk while still reading it, like `cat`
    pub fn cat() -> Self {
        let mut runtime = Self::echo();
        runtime.streaming = true;
        runtime
    }

    pub fn with_failing_pings(mut self, n: u32) -> Self {
        self.failing_pings = n;
        self
    }

    pub fn with_missing_image(mut self, image: &str) -> Self {
        self.missing_images.push(image.to_string());
        self
    }

    pub fn failing_at(mut self, stage: FailAt) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Processes write their output, then never exit on their own
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<SandboxSpec> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn stdin_received(&self) -> Vec<Vec<u8>> {
        self.lock().stdin_received.clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().containers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn fail(&self, stage: FailAt) -> Result<()> {
        if self.fail_at == Some(stage) {
            return Err(Error::Container(format!(
                "injected {:?} failure at /var/run/docker.sock",
                stage
            )));
        }
        Ok(())
    }

    fn with_container<T>(&self, id: &str, f: impl FnOnce(&mut Container) -> T) -> Result<T> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::Container(format!("No such container: {}", id)))?;
        Ok(f(container))
    }
}

fn literal_arg<'a>(stmt: &'a str, func: &str) -> Option<&'a str> {
    stmt.strip_prefix(func)?
        .strip_prefix("('")?
        .strip_suffix("')")
}

fn source_path(spec: &SandboxSpec) -> Option<PathBuf> {
    spec.command.last().map(|file| spec.mount.source.join(file))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn ping(&self) -> Result<String> {
        let n = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failing_pings {
            return Err(Error::Container("connection refused".to_string()));
        }
        Ok("fake-1.0".to_string())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.missing_images.iter().any(|m| m == image) {
            return Err(Error::Container(format!("pull access denied for {}", image)));
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        self.fail(FailAt::Create)?;
        let (stdin_client, stdin_process) = tokio::io::duplex(4096);
        let (output_writer, output_reader) = tokio::io::duplex(4096);
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            Container {
                spec: spec.clone(),
                stdin_client: Some(stdin_client),
                stdin_process: Some(stdin_process),
                output_reader: Some(output_reader),
                output_writer: Some(output_writer),
                kill_tx: Some(kill_tx),
                kill_rx: Some(kill_rx),
                running: false,
            },
        );
        Ok(SandboxHandle::new(id))
    }

    async fn attach_stdin(&self, id: &str) -> Result<StdinChannel> {
        self.fail(FailAt::AttachStdin)?;
        let writer = self
            .with_container(id, |c| c.stdin_client.take())?
            .ok_or_else(|| Error::Container("stdin already attached".to_string()))?;
        Ok(StdinChannel::new(writer))
    }

    async fn attach_output(&self, id: &str) -> Result<FrameStream> {
        self.fail(FailAt::AttachOutput)?;
        let reader = self
            .with_container(id, |c| c.output_reader.take())?
            .ok_or_else(|| Error::Container("output already attached".to_string()))?;
        Ok(FrameReader::new(reader).into_stream())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.fail(FailAt::Start)?;
        let (spec, stdin, output, kill) = self.with_container(id, |c| {
            c.running = true;
            (
                c.spec.clone(),
                c.stdin_process.take(),
                c.output_writer.take(),
                c.kill_rx.take(),
            )
        })?;
        let (Some(mut stdin), Some(mut output), Some(kill)) = (stdin, output, kill) else {
            return Err(Error::Container("container already started".to_string()));
        };

        let program = self.program.clone();
        let state = self.state.clone();
        let hang = self.hang;
        let streaming = self.streaming;
        let id = id.to_string();

        tokio::spawn(async move {
            let run = async {
                let mut input = Vec::new();
                if streaming {
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = stdin.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        input.extend_from_slice(&buf[..n]);
                        output
                            .write_all(&encode_frame(StreamTag::Stdout, &buf[..n]))
                            .await?;
                    }
                    state.lock().unwrap().stdin_received.push(input);
                    return output.shutdown().await;
                }

                stdin.read_to_end(&mut input).await?;
                state.lock().unwrap().stdin_received.push(input.clone());

                let source = match source_path(&spec) {
                    Some(path) => tokio::fs::read_to_string(path).await.unwrap_or_default(),
                    None => String::new(),
                };
                for frame in program(ProgramInput {
                    source,
                    stdin: input,
                }) {
                    output
                        .write_all(&encode_frame(frame.stream, &frame.payload))
                        .await?;
                }
                if hang {
                    std::future::pending::<()>().await;
                }
                output.shutdown().await
            };

            tokio::select! {
                _ = run => {}
                _ = kill => {}
            }
            // auto-remove on exit
            state.lock().unwrap().containers.remove(&id);
        });
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let container = state
            .containers
            .remove(id)
            .ok_or_else(|| Error::Container(format!("No such container: {}", id)))?;
        if let Some(kill) = container.kill_tx {
            let _ = kill.send(());
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>> {
        let state = self.lock();
        let mut summaries: Vec<_> = state
            .containers
            .iter()
            .map(|(id, c)| SandboxSummary {
                id: id.clone(),
                names: vec![format!("/fake-{}", &id[id.len() - 4..])],
                image: c.spec.image.clone(),
                state: if c.running { "running" } else { "created" }.to_string(),
                status: String::new(),
                created: 0,
                labels: c.spec.labels.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}
