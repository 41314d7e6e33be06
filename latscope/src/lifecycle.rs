//! # Lifecycle Controller
//!
//! Runs one measurement session from symbol lookup to teardown.
//!
//! ```text
//! Init ──▶ Attaching ──▶ Running ──▶ Draining ──▶ Closed
//!   │          │                                    ▲
//!   └──────────┴──────── failure (after rollback) ──┘
//! ```
//!
//! - **Init**: resolve the exit plan, open the target process handle
//! - **Attaching**: load the probes, open the channel, attach all-or-nothing
//! - **Running**: the consumer reads; one listener task waits for shutdown
//! - **Draining**: the consumer has returned; probes are detached
//! - **Closed**: process handle released
//!
//! Shutdown is an explicit future handed to [`LifecycleController::new`]. The
//! listener's only action is closing the event channel, once; the blocked
//! read returns and teardown follows in fixed order: consumer stops, probes
//! detach, process handle closes.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::consumer::{self, ConsumerReport, EventChannel, LatencySink};
use crate::domain::{InspectError, Pid};
use crate::inspect;
use crate::probes::{self, ExitPlan, ProbeBackend};

/// Boxed future that resolves when the session should end
pub type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Controller states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Attaching,
    Running,
    Draining,
    Closed,
}

/// How the function's exits are instrumented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExitMode {
    /// Uprobe on every return instruction found by scanning the function body
    #[default]
    Scan,
    /// A single uretprobe on the function
    ReturnProbe,
}

/// What to measure
#[derive(Debug, Clone)]
pub struct Request {
    /// Binary holding the symbol (the executable, or a library it maps)
    pub binary: PathBuf,
    /// Raw or demangled function name
    pub symbol: String,
    pub pid: Pid,
    pub exit_mode: ExitMode,
}

/// Kernel- and OS-facing collaborators of the controller
pub trait Platform {
    /// Exclusively owned handle on the target; released by drop
    type Process;
    type Backend: ProbeBackend;
    type Channel: EventChannel;

    /// Open the running target process
    ///
    /// # Errors
    /// The process does not exist or cannot be opened
    fn open_process(&mut self, pid: Pid) -> Result<Self::Process>;

    /// Load the instrumentation programs and open the event channel
    ///
    /// # Errors
    /// Missing privilege, verifier rejection, or missing maps
    fn instrument(
        &mut self,
        process: &Self::Process,
        plan: &ExitPlan,
    ) -> Result<(Self::Backend, Self::Channel)>;

    /// Future resolving when the target exits, if the platform can tell
    fn process_exit(&self, _process: &Self::Process) -> Option<ShutdownFuture> {
        None
    }
}

/// Outcome of a completed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub consumer: ConsumerReport,
    /// Probes held while running (entry included)
    pub probes: usize,
}

/// Drives one session through [`State`]
pub struct LifecycleController {
    state: State,
    shutdown: Option<ShutdownFuture>,
}

impl LifecycleController {
    pub fn new(shutdown: impl Future<Output = ()> + Send + 'static) -> Self {
        Self { state: State::Init, shutdown: Some(Box::pin(shutdown)) }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Run the session to completion; ends in [`State::Closed`] whatever the
    /// outcome
    ///
    /// # Errors
    /// Startup failures (symbol lookup, privilege, attach) and a permanently
    /// unreadable channel. Nothing stays attached after an error.
    pub async fn run<P, S>(
        &mut self,
        platform: &mut P,
        request: &Request,
        sink: &mut S,
    ) -> Result<RunReport>
    where
        P: Platform,
        S: LatencySink + ?Sized,
    {
        if self.state != State::Init {
            bail!("session already ran (state {:?})", self.state);
        }
        let result = self.run_session(platform, request, sink).await;
        self.transition(State::Closed);
        result
    }

    async fn run_session<P, S>(
        &mut self,
        platform: &mut P,
        request: &Request,
        sink: &mut S,
    ) -> Result<RunReport>
    where
        P: Platform,
        S: LatencySink + ?Sized,
    {
        let (symbol, plan) = plan_exits(request)?;
        let process = platform.open_process(request.pid)?;

        self.transition(State::Attaching);
        let (mut backend, mut channel) = platform.instrument(&process, &plan)?;
        let mut attachments = probes::attach(&mut backend, &symbol, &plan)
            .with_context(|| format!("instrumenting {symbol} in {}", request.pid))?;

        self.transition(State::Running);
        info!(
            "Measuring {symbol} in {}: {} probe(s); each call pays the probe overhead",
            request.pid,
            attachments.len()
        );

        let shutdown = self.shutdown.take().context("shutdown future already consumed")?;
        let exited = platform.process_exit(&process);
        let closer = channel.closer();
        let listener = tokio::spawn(async move {
            let reason = match exited {
                Some(exited) => tokio::select! {
                    () = shutdown => "shutdown requested",
                    () = exited => "target process exited",
                },
                None => {
                    shutdown.await;
                    "shutdown requested"
                }
            };
            if closer.close() {
                info!("{reason}, closing event channel");
            }
        });

        let consumed = consumer::run(&mut channel, sink).await;

        self.transition(State::Draining);
        listener.abort();
        drop(channel);
        let probes = attachments.len();
        attachments.detach(&mut backend);
        drop(backend);
        drop(process);

        let consumer = consumed?;
        Ok(RunReport { consumer, probes })
    }

    fn transition(&mut self, next: State) {
        debug!("lifecycle: {:?} → {:?}", self.state, next);
        self.state = next;
    }
}

/// Resolve the raw symbol name and the exit plan for `request`
fn plan_exits(request: &Request) -> Result<(String, ExitPlan)> {
    match request.exit_mode {
        ExitMode::Scan => {
            let (range, exits) = inspect::inspect_exits(&request.binary, &request.symbol)?;
            if exits.is_empty() {
                return Err(InspectError::NoExits { symbol: request.symbol.clone() }.into());
            }
            Ok((range.name, ExitPlan::Offsets(exits)))
        }
        ExitMode::ReturnProbe => {
            let range = inspect::resolve_symbol(&request.binary, &request.symbol)?;
            Ok((range.name, ExitPlan::ReturnProbe))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Batch;
    use crate::domain::ProbePoint;
    use crate::testing::{
        encode_record, write_elf_fixture, EventLog, RecordingSink, ScriptedChannel,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct LoggedProcess(EventLog);

    impl Drop for LoggedProcess {
        fn drop(&mut self) {
            self.0.lock().unwrap().push("process closed".to_string());
        }
    }

    struct LoggedBackend {
        log: EventLog,
        fail_exit: bool,
    }

    impl ProbeBackend for LoggedBackend {
        type Token = ProbePoint;
        type Error = String;

        fn attach(&mut self, _symbol: &str, point: ProbePoint) -> Result<ProbePoint, String> {
            if self.fail_exit && matches!(point, ProbePoint::Exit { .. }) {
                return Err("no such offset".to_string());
            }
            self.log.lock().unwrap().push(format!("attach {point}"));
            Ok(point)
        }

        fn detach(&mut self, point: ProbePoint, _token: ProbePoint) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("detach {point}"));
            Ok(())
        }
    }

    struct FakePlatform {
        log: EventLog,
        batches: Vec<Batch>,
        fail_exit: bool,
    }

    impl Platform for FakePlatform {
        type Process = LoggedProcess;
        type Backend = LoggedBackend;
        type Channel = ScriptedChannel;

        fn open_process(&mut self, _pid: Pid) -> Result<LoggedProcess> {
            Ok(LoggedProcess(self.log.clone()))
        }

        fn instrument(
            &mut self,
            _process: &LoggedProcess,
            _plan: &ExitPlan,
        ) -> Result<(LoggedBackend, ScriptedChannel)> {
            let script = self.batches.drain(..).map(Ok).collect();
            let channel = ScriptedChannel::new(script).with_log(self.log.clone());
            Ok((LoggedBackend { log: self.log.clone(), fail_exit: self.fail_exit }, channel))
        }
    }

    fn request(dir: &tempfile::TempDir, exit_mode: ExitMode) -> Request {
        // xor eax, eax; test edi, edi; je +1; ret; inc eax; ret
        let code = [0x31, 0xc0, 0x85, 0xff, 0x74, 0x01, 0xc3, 0xff, 0xc0, 0xc3];
        Request {
            binary: write_elf_fixture(dir.path(), "handle_request", &code),
            symbol: "handle_request".to_string(),
            pid: Pid(4242),
            exit_mode,
        }
    }

    fn platform(log: &EventLog, batches: Vec<Batch>) -> FakePlatform {
        FakePlatform { log: log.clone(), batches, fail_exit: false }
    }

    #[tokio::test]
    async fn test_teardown_order() {
        let dir = tempfile::tempdir().unwrap();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let batch = Batch { records: vec![encode_record(4242, 1, 2_000_000)], lost: 0 };
        let mut platform = platform(&log, vec![batch]);
        let mut sink = RecordingSink::default();

        let mut controller = LifecycleController::new(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        let report =
            controller.run(&mut platform, &request(&dir, ExitMode::Scan), &mut sink).await.unwrap();

        assert_eq!(controller.state(), State::Closed);
        assert_eq!(report.probes, 3);
        assert_eq!(report.consumer.samples, 1);
        assert_eq!(sink.samples[0].pid, 4242);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "attach entry probe at +0x0",
                "attach exit probe at +0x6",
                "attach exit probe at +0x9",
                "consumer stopped",
                "detach exit probe at +0x9",
                "detach exit probe at +0x6",
                "detach entry probe at +0x0",
                "process closed",
            ]
        );
    }

    #[tokio::test]
    async fn test_attach_failure_closes_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut platform = FakePlatform { log: log.clone(), batches: vec![], fail_exit: true };
        let mut sink = RecordingSink::default();

        let mut controller = LifecycleController::new(std::future::pending());
        let err = controller
            .run(&mut platform, &request(&dir, ExitMode::Scan), &mut sink)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("exit probe at +0x6"));
        assert_eq!(controller.state(), State::Closed);
        assert!(!sink.finished, "consumer must not run");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["attach entry probe at +0x0", "detach entry probe at +0x0", "process closed"]
        );
    }

    #[tokio::test]
    async fn test_missing_symbol_fails_in_init() {
        let dir = tempfile::tempdir().unwrap();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut platform = platform(&log, vec![]);
        let mut request = request(&dir, ExitMode::Scan);
        request.symbol = "no_such_fn".to_string();

        let mut controller = LifecycleController::new(std::future::pending());
        let err =
            controller.run(&mut platform, &request, &mut RecordingSink::default()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<InspectError>(),
            Some(InspectError::SymbolNotFound { .. })
        ));
        assert_eq!(controller.state(), State::Closed);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_return_probe_mode() {
        let dir = tempfile::tempdir().unwrap();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut platform = platform(&log, vec![]);

        let mut controller = LifecycleController::new(async {});
        let report = controller
            .run(&mut platform, &request(&dir, ExitMode::ReturnProbe), &mut RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(report.probes, 2);
        assert!(log.lock().unwrap().contains(&"attach return probe".to_string()));
    }

    #[tokio::test]
    async fn test_controller_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let request = request(&dir, ExitMode::Scan);
        let mut controller = LifecycleController::new(async {});

        controller.run(&mut platform(&log, vec![]), &request, &mut RecordingSink::default()).await.unwrap();
        let second =
            controller.run(&mut platform(&log, vec![]), &request, &mut RecordingSink::default()).await;

        assert!(second.is_err());
        assert_eq!(controller.state(), State::Closed);
    }
}
