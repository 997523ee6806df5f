//! Image builder invocation.
//!
//! [`PackerBuilder`] writes a [`BuildRequest`] to disk, runs the external
//! builder in machine-readable mode and turns its output into an
//! [`ArtifactHandle`]. Output is streamed line by line into tracing and a
//! per-image log file while the process runs.
//!
//! On cancellation or timeout the builder receives SIGINT so it can clean up
//! cloud resources, and is killed if it does not exit within the grace period.

pub mod machine;
mod types;
pub mod userdata;

use std::future::Future;
use std::process::Stdio;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use machine::{MachineLine, MachineMessage, MachineOutput, parse_line};
pub use types::{BuildError, ExecutorConfig};
pub use userdata::write_user_data;

use crate::artifacts::ArtifactHandle;
use crate::template::BuildRequest;

/// Something that turns a build request into an image.
pub trait ImageBuilder: Send + Sync + 'static {
  fn build(
    &self,
    request: &BuildRequest,
    cancel: &CancellationToken,
  ) -> impl Future<Output = Result<ArtifactHandle, BuildError>> + Send;
}

/// Runs a Packer-compatible CLI.
#[derive(Debug, Clone)]
pub struct PackerBuilder {
  config: ExecutorConfig,
}

enum Outcome {
  Exited(std::process::ExitStatus),
  Interrupted(BuildError),
}

impl PackerBuilder {
  pub fn new(config: ExecutorConfig) -> Self {
    Self { config }
  }

  async fn execute(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<ArtifactHandle, BuildError> {
    let Some((program, leading)) = self.config.command.split_first() else {
      return Err(BuildError::Spawn {
        program: String::new(),
        message: "empty builder command".to_string(),
      });
    };

    tokio::fs::create_dir_all(&self.config.work_dir).await?;
    tokio::fs::create_dir_all(&self.config.log_dir).await?;

    let stem = format!("{}_{}", request.node, request.version);
    let request_path = self.config.work_dir.join(format!("{stem}.json"));
    let document = request.to_json().map_err(|e| BuildError::Io(e.to_string()))?;
    tokio::fs::write(&request_path, document).await?;

    let log_path = self.config.log_dir.join(format!("{stem}.log"));
    let log = File::create(&log_path).await?;

    info!(node = %request.node, version = %request.version, log = %log_path.display(), "starting builder");
    debug!(program = %program, request = %request_path.display(), "spawning builder");

    let mut child = Command::new(program)
      .args(leading)
      .arg("build")
      .arg("-machine-readable")
      .arg(&request_path)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| BuildError::Spawn {
        program: program.clone(),
        message: e.to_string(),
      })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
      return Err(BuildError::Io("builder output pipes unavailable".to_string()));
    };
    let stop_pump = CancellationToken::new();
    let mut pump = tokio::spawn(pump_output(
      request.node.clone(),
      stdout,
      stderr,
      log,
      stop_pump.clone(),
    ));

    let timeout = self.config.timeout;
    let deadline = async move {
      match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
      }
    };
    tokio::pin!(deadline);
    let timed_out = || BuildError::BuilderTimeout {
      after: timeout.unwrap_or_default(),
    };

    let outcome = tokio::select! {
      status = child.wait() => Outcome::Exited(status?),
      _ = cancel.cancelled() => Outcome::Interrupted(BuildError::Cancelled),
      _ = &mut deadline => Outcome::Interrupted(timed_out()),
    };

    let status = match outcome {
      Outcome::Exited(status) => status,
      Outcome::Interrupted(err) => {
        warn!(node = %request.node, reason = %err, "stopping builder");
        self.terminate(&mut child, &request.node).await;
        pump.abort();
        return Err(err);
      }
    };

    // A descendant that inherited the pipes can keep them open after exit.
    let joined = tokio::select! {
      joined = &mut pump => joined,
      _ = cancel.cancelled() => {
        pump.abort();
        return Err(BuildError::Cancelled);
      }
      _ = &mut deadline => {
        pump.abort();
        return Err(timed_out());
      }
      _ = tokio::time::sleep(self.config.kill_grace) => {
        warn!(node = %request.node, grace = ?self.config.kill_grace, "builder output still open after exit, closing it");
        stop_pump.cancel();
        pump.await
      }
    };
    let output = joined.map_err(|e| BuildError::Io(format!("output reader failed: {e}")))??;

    if !status.success() {
      error!(node = %request.node, code = ?status.code(), "builder failed");
      return Err(BuildError::BuilderFailure {
        code: status.code(),
        errors: output.errors,
      });
    }

    let artifact = output.artifact(&request.node).ok_or(BuildError::BuilderOutputUnparseable)?;
    info!(node = %request.node, artifact = %artifact, "builder finished");
    Ok(artifact)
  }

  /// Interrupt the builder, then kill it if it outlives the grace period.
  async fn terminate(&self, child: &mut Child, node: &str) {
    interrupt(child);
    match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
      Ok(Ok(status)) => debug!(node = %node, code = ?status.code(), "builder exited after interrupt"),
      Ok(Err(e)) => warn!(node = %node, error = %e, "failed waiting for builder"),
      Err(_) => {
        warn!(node = %node, grace = ?self.config.kill_grace, "builder ignored interrupt, killing");
        if let Err(e) = child.kill().await {
          warn!(node = %node, error = %e, "failed to kill builder");
        }
      }
    }
  }
}

impl ImageBuilder for PackerBuilder {
  fn build(
    &self,
    request: &BuildRequest,
    cancel: &CancellationToken,
  ) -> impl Future<Output = Result<ArtifactHandle, BuildError>> + Send {
    self.execute(request, cancel)
  }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
  use rustix::process::{Pid, Signal, kill_process};

  let pid = child.id().and_then(|id| i32::try_from(id).ok()).and_then(Pid::from_raw);
  if let Some(pid) = pid
    && let Err(e) = kill_process(pid, Signal::INT)
  {
    debug!(error = %e, "failed to interrupt builder");
  }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
  if let Err(e) = child.start_kill() {
    debug!(error = %e, "failed to stop builder");
  }
}

/// Read both output streams until they close or `stop` fires.
///
/// Machine-readable stdout lines are collected into a [`MachineOutput`];
/// their human-readable text goes to tracing and the log file. Stderr is
/// logged as-is.
async fn pump_output(
  node: String,
  stdout: ChildStdout,
  stderr: ChildStderr,
  log: File,
  stop: CancellationToken,
) -> Result<MachineOutput, BuildError> {
  let mut log = BufWriter::new(log);
  let mut output = MachineOutput::default();
  let mut out_lines = BufReader::new(stdout).lines();
  let mut err_lines = BufReader::new(stderr).lines();
  let (mut out_open, mut err_open) = (true, true);

  while out_open || err_open {
    tokio::select! {
      line = out_lines.next_line(), if out_open => match line? {
        Some(line) => {
          let text = handle_stdout(&node, &line, &mut output);
          if let Some(text) = text {
            log.write_all(text.as_bytes()).await?;
            log.write_all(b"\n").await?;
          }
        }
        None => out_open = false,
      },
      line = err_lines.next_line(), if err_open => match line? {
        Some(line) => {
          warn!(node = %node, "{line}");
          log.write_all(format!("stderr: {line}\n").as_bytes()).await?;
        }
        None => err_open = false,
      },
      _ = stop.cancelled() => break,
    }
  }

  log.flush().await?;
  Ok(output)
}

/// Record one stdout line and return the text to log for it.
fn handle_stdout(node: &str, line: &str, output: &mut MachineOutput) -> Option<String> {
  let Some(parsed) = parse_line(line) else {
    info!(node = %node, "{line}");
    return Some(line.to_string());
  };
  output.record(&parsed);

  match &parsed.message {
    MachineMessage::Ui { level, text } if level == "error" => {
      error!(node = %node, "{text}");
      Some(format!("error: {text}"))
    }
    MachineMessage::Ui { text, .. } => {
      info!(node = %node, "{text}");
      Some(text.clone())
    }
    MachineMessage::Error(text) => {
      error!(node = %node, "{text}");
      Some(format!("error: {text}"))
    }
    MachineMessage::Artifact { index, key, values } => {
      debug!(node = %node, index, key = %key, value = %values.join(","), "artifact");
      None
    }
    MachineMessage::Other { kind, .. } => {
      debug!(node = %node, kind = %kind, "builder message");
      None
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::path::Path;
  use std::time::{Duration, Instant};

  use serde_json::json;
  use tempfile::TempDir;

  use super::*;
  use crate::util::testutil::fake_builder;

  fn request() -> BuildRequest {
    BuildRequest {
      node: "zeppelin".to_string(),
      version: "0.7.3".to_string(),
      artifact_name: "zeppelin-v0.7.3".to_string(),
      document: json!({"builders": [{"type": "amazon-ebs", "source_ami": "ami-base"}]}),
    }
  }

  fn builder(dir: &Path, script: &Path) -> PackerBuilder {
    PackerBuilder::new(ExecutorConfig {
      command: vec![script.display().to_string()],
      work_dir: dir.join("tmp"),
      log_dir: dir.join("log"),
      timeout: None,
      kill_grace: Duration::from_secs(5),
    })
  }

  // ===========================================================================
  // Success path
  // ===========================================================================

  #[tokio::test]
  async fn artifact_id_parsed_from_output() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(
      temp.path(),
      "packer",
      r#"echo "1700000000,,ui,say,==> Building%!(PACKER_COMMA) please wait"
echo "not machine readable"
echo "warning on stderr" >&2
echo "1700000001,amazon-ebs,artifact,0,id,us-east-1:ami-0abc""#,
    );

    let handle = builder(temp.path(), &script)
      .build(&request(), &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(handle.node, "zeppelin");
    assert_eq!(handle.id, "ami-0abc");
    assert_eq!(handle.region.as_deref(), Some("us-east-1"));

    let log = std::fs::read_to_string(temp.path().join("log/zeppelin_0.7.3.log")).unwrap();
    assert!(log.contains("==> Building, please wait"), "{log}");
    assert!(log.contains("not machine readable"), "{log}");
    assert!(log.contains("stderr: warning on stderr"), "{log}");
  }

  #[tokio::test]
  async fn receives_request_document() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(
      temp.path(),
      "packer",
      r#"[ "$1" = build ] && [ "$2" = -machine-readable ] || exit 9
grep -q ami-base "$3" || exit 8
echo "1,amazon-ebs,artifact,0,id,eu-west-1:ami-child""#,
    );

    let handle = builder(temp.path(), &script)
      .build(&request(), &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(handle.id, "ami-child");

    let written = std::fs::read_to_string(temp.path().join("tmp/zeppelin_0.7.3.json")).unwrap();
    let document: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(document, request().document);
  }

  // ===========================================================================
  // Failures
  // ===========================================================================

  #[tokio::test]
  async fn nonzero_exit_collects_errors() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(
      temp.path(),
      "packer",
      r#"echo "1,,ui,error,Build 'amazon-ebs' errored: no such ami"
echo "2,,error,1 error(s) occurred"
exit 3"#,
    );

    let err = builder(temp.path(), &script)
      .build(&request(), &CancellationToken::new())
      .await
      .unwrap_err();

    assert_eq!(
      err,
      BuildError::BuilderFailure {
        code: Some(3),
        errors: vec![
          "Build 'amazon-ebs' errored: no such ami".to_string(),
          "1 error(s) occurred".to_string(),
        ],
      }
    );
  }

  #[tokio::test]
  async fn success_without_artifact_is_unparseable() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(temp.path(), "packer", r#"echo "1,,ui,say,done""#);

    let err = builder(temp.path(), &script)
      .build(&request(), &CancellationToken::new())
      .await
      .unwrap_err();
    assert_eq!(err, BuildError::BuilderOutputUnparseable);
  }

  #[tokio::test]
  async fn missing_program_fails_to_spawn() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("no-such-builder");

    let err = builder(temp.path(), &missing)
      .build(&request(), &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::Spawn { .. }), "{err:?}");
  }

  #[tokio::test]
  async fn empty_command_rejected() {
    let temp = TempDir::new().unwrap();
    let builder = PackerBuilder::new(ExecutorConfig {
      command: vec![],
      work_dir: temp.path().to_path_buf(),
      log_dir: temp.path().to_path_buf(),
      ..Default::default()
    });

    let err = builder.build(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BuildError::Spawn { .. }), "{err:?}");
  }

  // ===========================================================================
  // Timeout and cancellation
  // ===========================================================================

  #[tokio::test]
  async fn timeout_interrupts_builder() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(temp.path(), "packer", "exec sleep 30");
    let mut builder = builder(temp.path(), &script);
    builder.config.timeout = Some(Duration::from_millis(200));

    let started = Instant::now();
    let err = builder.build(&request(), &CancellationToken::new()).await.unwrap_err();

    assert_eq!(
      err,
      BuildError::BuilderTimeout {
        after: Duration::from_millis(200)
      }
    );
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn cancellation_interrupts_builder() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(temp.path(), "packer", "exec sleep 30");
    let builder = builder(temp.path(), &script);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let err = builder.build(&request(), &cancel).await.unwrap_err();
    assert_eq!(err, BuildError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn lingering_output_pipe_does_not_block_result() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(
      temp.path(),
      "packer",
      r#"sleep 30 &
echo "1,amazon-ebs,artifact,0,id,us-east-1:ami-0abc""#,
    );
    let mut builder = builder(temp.path(), &script);
    builder.config.kill_grace = Duration::from_millis(200);

    let started = Instant::now();
    let handle = builder.build(&request(), &CancellationToken::new()).await.unwrap();

    assert_eq!(handle.id, "ami-0abc");
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn builder_ignoring_interrupt_is_killed() {
    let temp = TempDir::new().unwrap();
    let script = fake_builder(temp.path(), "packer", "trap '' INT\nexec sleep 30");
    let mut builder = builder(temp.path(), &script);
    builder.config.timeout = Some(Duration::from_millis(100));
    builder.config.kill_grace = Duration::from_millis(300);

    let started = Instant::now();
    let err = builder.build(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BuildError::BuilderTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
