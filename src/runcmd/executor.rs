use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::azure::{ComputeClient, PollStatus, RunCommandInput, RunCommandResponse};
use crate::error::{Result, VmssError};
use crate::interrupt::InterruptWatch;
use crate::progress::Spinner;
use crate::vmss::MachineCoordinate;

use super::{
    parse_run_command_message, OutputTruncate, RunCommandResult, BYTES_LIMIT,
    DEFAULT_TIMEOUT_SECS, SUCCESS_CODE,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Quote `s` for a POSIX shell as a single-quoted word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap a user command in the remote time guard, capping its output to the
/// first [`BYTES_LIMIT`] bytes when the tail is to be truncated.
pub fn wrap_script(command: &str, timeout_secs: u64, truncate: OutputTruncate) -> String {
    let inner = match truncate {
        OutputTruncate::Tail => format!("{command} | head -c {BYTES_LIMIT}"),
        OutputTruncate::Head => command.to_string(),
    };
    format!("timeout {timeout_secs} sh -c {}", shell_quote(&inner))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommandRequest {
    pub coordinate: MachineCoordinate,
    pub command: String,
    pub timeout_secs: u64,
    pub truncate: OutputTruncate,
}

impl RunCommandRequest {
    pub fn new(coordinate: MachineCoordinate, command: impl Into<String>) -> Self {
        Self {
            coordinate,
            command: command.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            truncate: OutputTruncate::default(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_truncate(mut self, truncate: OutputTruncate) -> Self {
        self.truncate = truncate;
        self
    }

    /// The script actually submitted.
    pub fn script(&self) -> String {
        wrap_script(&self.command, self.timeout_secs, self.truncate)
    }
}

/// Submits a runCommand operation and waits for it.
///
/// Polling stops when the operation reaches a terminal state or the
/// cancellation token fires. There is no local deadline: the `timeout` guard
/// in the submitted script bounds the run.
pub struct RemoteCommandExecutor<'a> {
    client: &'a dyn ComputeClient,
    poll_interval: Duration,
    verbose: bool,
    watch_interrupts: bool,
    cancel: CancellationToken,
}

impl<'a> RemoteCommandExecutor<'a> {
    pub fn new(client: &'a dyn ComputeClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
            watch_interrupts: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Dump the request and the raw response to stderr.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Install the SIGINT/SIGTERM policy of [`InterruptWatch`] while polling.
    pub fn watch_interrupts(mut self, watch: bool) -> Self {
        self.watch_interrupts = watch;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn run(&self, request: &RunCommandRequest) -> Result<RunCommandResult> {
        let script = request.script();
        let input = RunCommandInput::shell_script(script.as_str());

        if self.verbose {
            eprintln!(
                "Command: {script}\nVirtual Machine Scale Set VM:\n{}\n",
                serde_json::to_string_pretty(&request.coordinate)?
            );
        }

        tracing::info!(
            vm = %request.coordinate,
            timeout_secs = request.timeout_secs,
            "Submitting run command"
        );

        let response = {
            let _watch = if self.watch_interrupts {
                Some(InterruptWatch::install()?)
            } else {
                None
            };
            let _spinner = Spinner::start("Running...");
            self.submit_and_wait(&request.coordinate, &input).await?
        };

        let pretty = serde_json::to_string_pretty(&response)?;
        if self.verbose {
            eprintln!("\nResponse:\n{pretty}");
        }

        let status = response.value.first().ok_or_else(|| {
            VmssError::UnparseableResponse("no response received after command execution".to_string())
        })?;
        if status.code.as_deref() != Some(SUCCESS_CODE) {
            return Err(VmssError::RemoteCommandFailed(pretty));
        }

        let mut result = parse_run_command_message(status.message.as_deref().unwrap_or_default())?;
        if request.truncate == OutputTruncate::Tail && result.mark_truncated() {
            tracing::debug!("output reached the size limit, marked as truncated");
        }

        tracing::info!(
            vm = %request.coordinate,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Run command completed"
        );
        Ok(result)
    }

    async fn submit_and_wait(
        &self,
        vm: &MachineCoordinate,
        input: &RunCommandInput,
    ) -> Result<RunCommandResponse> {
        let mut poller = self
            .client
            .begin_run_command(vm, input)
            .await
            .map_err(|e| match e {
                VmssError::SubmissionFailed(_) => e,
                other => VmssError::SubmissionFailed(other.to_string()),
            })?;

        loop {
            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(VmssError::Canceled),
                status = poller.poll() => status.map_err(|e| match e {
                    VmssError::PollingFailed(_) => e,
                    other => VmssError::PollingFailed(other.to_string()),
                })?,
            };

            if let PollStatus::Done(response) = status {
                return Ok(response);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(VmssError::Canceled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
