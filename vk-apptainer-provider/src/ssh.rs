//! Apptainer instances driven over SSH
//!
//! Every operation is a single `ssh` invocation running a short POSIX shell
//! script on the login node. One pod maps to one Apptainer instance named
//! `vk-<namespace>-<name>`; the container process runs inside it in the
//! background and leaves its exit code in a state directory so later
//! status polls can tell a finished workload from a live one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use k8s_openapi::api::core::v1::{Container, Pod};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use vk_apptainer_common::{ExitInfo, PodIdentity, RemoteHandle, RemoteStatus};

use crate::executor::{ExecIo, ExecutorError, LogOptions, LogStream, RemoteExecutor};
use crate::record::identity_of;

const GPU_RESOURCE: &str = "nvidia.com/gpu";
const SSH_UNREACHABLE: i32 = 255;
const EXIT_START_FAILED: i32 = 3;
const EXIT_STILL_RUNNING: i32 = 4;

/// Backend messages that no retry will fix
const PERMANENT_MARKERS: &[&str] = &[
    "manifest unknown",
    "unauthorized",
    "no such file or directory",
    "could not open image",
    "command not found",
];

/// Where and how to reach the login node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn user_at_host(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Options and destination, ready to be followed by a remote command
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(self.user_at_host());
        args
    }
}

/// Quote a word for a POSIX shell.
///
/// Safe words are returned bare; anything else is single-quoted with
/// embedded quotes written as `'\''`.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> String {
    words
        .into_iter()
        .map(shell_escape)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apptainer instance name for a pod
pub fn instance_name(identity: &PodIdentity) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!(
        "vk-{}-{}",
        sanitize(&identity.namespace),
        sanitize(&identity.name)
    )
}

/// Registry images default to docker://, local paths and explicit URIs pass through
pub fn image_ref(image: &str) -> String {
    if image.contains("://") || image.starts_with('/') {
        image.to_string()
    } else {
        format!("docker://{}", image)
    }
}

/// What `start` needs to know about the single container of a pod
#[derive(Debug, Clone, PartialEq, Eq)]
struct LaunchPlan {
    instance: String,
    image: String,
    command: Vec<String>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
    gpu: bool,
}

impl LaunchPlan {
    fn from_pod(pod: &Pod) -> Result<Self, ExecutorError> {
        let identity = identity_of(pod).map_err(|e| ExecutorError::Permanent(e.to_string()))?;
        let container = single_container(pod)?;
        let image = container
            .image
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| ExecutorError::Permanent(format!("container {} has no image", container.name)))?;

        let env = container
            .env
            .iter()
            .flatten()
            .filter_map(|var| match &var.value {
                Some(value) => Some((var.name.clone(), value.clone())),
                None => {
                    debug!("Skipping env {} of {}: only literal values are passed", var.name, identity);
                    None
                }
            })
            .collect();

        let gpu = container.resources.as_ref().is_some_and(|r| {
            r.limits.as_ref().is_some_and(|l| l.contains_key(GPU_RESOURCE))
                || r.requests.as_ref().is_some_and(|l| l.contains_key(GPU_RESOURCE))
        });

        Ok(Self {
            instance: instance_name(&identity),
            image: image_ref(image),
            command: container.command.clone().unwrap_or_default(),
            args: container.args.clone().unwrap_or_default(),
            env,
            working_dir: container.working_dir.clone(),
            gpu,
        })
    }
}

fn single_container(pod: &Pod) -> Result<&Container, ExecutorError> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);
    match containers {
        [container] => Ok(container),
        [] => Err(ExecutorError::Permanent("pod has no containers".to_string())),
        many => Err(ExecutorError::Permanent(format!(
            "pod has {} containers, only single-container pods are supported",
            many.len()
        ))),
    }
}

/// Parse the output of the status script
fn parse_status(stdout: &str) -> Result<RemoteStatus, ExecutorError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();

    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("running"), None) => Ok(RemoteStatus::Running),
        (Some("exited"), Some(code)) => match code.parse::<i32>() {
            Ok(code) => Ok(RemoteStatus::Exited(ExitInfo::with_code(code))),
            Err(_) => Ok(RemoteStatus::Exited(ExitInfo::lost("Unknown"))),
        },
        (Some("missing"), None) => Ok(RemoteStatus::Exited(ExitInfo::lost("InstanceLost"))),
        _ => Err(ExecutorError::Transient(format!(
            "unexpected status output: {:?}",
            line
        ))),
    }
}

/// Map the exit of an ssh invocation to the executor taxonomy
fn classify(code: Option<i32>, stderr: &str) -> Result<(), ExecutorError> {
    let detail = stderr.trim().to_string();
    match code {
        Some(0) => Ok(()),
        Some(SSH_UNREACHABLE) => Err(ExecutorError::Unreachable(detail)),
        None => Err(ExecutorError::Transient(format!("ssh killed by signal: {}", detail))),
        Some(code) => {
            let lower = detail.to_ascii_lowercase();
            if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
                Err(ExecutorError::Permanent(detail))
            } else {
                Err(ExecutorError::Transient(format!("exit status {}: {}", code, detail)))
            }
        }
    }
}

/// Executor running Apptainer instances on a remote host
#[derive(Debug, Clone)]
pub struct ApptainerSshExecutor {
    target: SshTarget,
    ssh_bin: String,
    apptainer_bin: String,
    state_dir: String,
}

impl ApptainerSshExecutor {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            ssh_bin: "ssh".to_string(),
            apptainer_bin: "apptainer".to_string(),
            state_dir: ".vk-apptainer".to_string(),
        }
    }

    pub fn with_ssh_bin(mut self, bin: impl Into<String>) -> Self {
        self.ssh_bin = bin.into();
        self
    }

    pub fn with_apptainer_bin(mut self, bin: impl Into<String>) -> Self {
        self.apptainer_bin = bin.into();
        self
    }

    /// Remote directory for logs and exit codes, relative to the login home
    pub fn with_state_dir(mut self, dir: impl Into<String>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn log_path(&self, instance: &str) -> String {
        format!("{}/{}.log", self.state_dir, instance)
    }

    fn exit_path(&self, instance: &str) -> String {
        format!("{}/{}.exit", self.state_dir, instance)
    }

    /// Shell condition true while the instance is listed
    fn instance_listed(&self, instance: &str) -> String {
        format!(
            "{} instance list 2>/dev/null | awk 'NR>1 {{print $1}}' | grep -qx {}",
            shell_escape(&self.apptainer_bin),
            shell_escape(instance)
        )
    }

    fn start_script(&self, plan: &LaunchPlan) -> String {
        let appt = shell_escape(&self.apptainer_bin);
        let name = shell_escape(&plan.instance);
        let log = shell_escape(&self.log_path(&plan.instance));
        let exit = shell_escape(&self.exit_path(&plan.instance));

        let mut start_flags = Vec::new();
        if plan.gpu {
            start_flags.push("--nv".to_string());
        }
        let mut env_flags = Vec::new();
        for (key, value) in &plan.env {
            env_flags.push("--env".to_string());
            env_flags.push(format!("{}={}", key, value));
        }
        start_flags.extend(env_flags.iter().cloned());

        let mut workload = vec![self.apptainer_bin.clone()];
        workload.push(if plan.command.is_empty() { "run" } else { "exec" }.to_string());
        if let Some(dir) = &plan.working_dir {
            workload.push("--pwd".to_string());
            workload.push(dir.clone());
        }
        workload.extend(env_flags);
        workload.push(format!("instance://{}", plan.instance));
        workload.extend(plan.command.iter().cloned());
        workload.extend(plan.args.iter().cloned());

        let inner = format!(
            "{} > {} 2>&1; echo $? > {}",
            shell_join(workload.iter().map(String::as_str)),
            log,
            exit
        );

        [
            format!("mkdir -p {}", shell_escape(&self.state_dir)),
            format!("if {}; then echo adopted; exit 0; fi", self.instance_listed(&plan.instance)),
            format!("rm -f {} {}", log, exit),
            format!(
                "{} instance start {} {} {} >/dev/null || exit {}",
                appt,
                shell_join(start_flags.iter().map(String::as_str)),
                shell_escape(&plan.image),
                name,
                EXIT_START_FAILED
            ),
            format!("nohup sh -c {} >/dev/null 2>&1 &", shell_escape(&inner)),
            "echo started".to_string(),
        ]
        .join("\n")
    }

    fn status_script(&self, instance: &str) -> String {
        let exit = shell_escape(&self.exit_path(instance));
        format!(
            "if [ -s {exit} ]; then echo \"exited $(cat {exit})\"; \
             elif {listed}; then echo running; \
             else echo missing; fi",
            exit = exit,
            listed = self.instance_listed(instance)
        )
    }

    fn stop_script(&self, instance: &str) -> String {
        let appt = shell_escape(&self.apptainer_bin);
        let name = shell_escape(instance);
        let listed = self.instance_listed(instance);
        [
            format!("if {}; then {} instance stop {} >/dev/null 2>&1; fi", listed, appt, name),
            format!(
                "if {}; then {} instance stop --force {} >/dev/null 2>&1; fi",
                listed, appt, name
            ),
            format!("if {}; then exit {}; fi", listed, EXIT_STILL_RUNNING),
            format!("rm -f {}", shell_escape(&self.exit_path(instance))),
        ]
        .join("\n")
    }

    fn logs_script(&self, instance: &str, opts: &LogOptions) -> String {
        let log = shell_escape(&self.log_path(instance));
        let mut script = match (opts.tail_lines, opts.follow) {
            (Some(n), true) => format!("tail -n {} -f {}", n, log),
            (None, true) => format!("tail -n +1 -f {}", log),
            (Some(n), false) => format!("tail -n {} {}", n, log),
            (None, false) => format!("cat {}", log),
        };
        if let Some(limit) = opts.limit_bytes {
            script.push_str(&format!(" | head -c {}", limit));
        }
        script
    }

    fn command(&self, script: &str, tty: bool) -> Command {
        let mut cmd = Command::new(&self.ssh_bin);
        if tty {
            cmd.arg("-tt");
        }
        cmd.args(self.target.ssh_args());
        cmd.arg(format!("sh -c {}", shell_escape(script)));
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> ExecutorError {
        ExecutorError::Unreachable(format!("failed to run {}: {}", self.ssh_bin, e))
    }

    /// Run a script to completion and return its stdout
    async fn run(&self, script: &str) -> Result<String, ExecutorError> {
        let output = self
            .command(script, false)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        classify(output.status.code(), &String::from_utf8_lossy(&output.stderr))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteExecutor for ApptainerSshExecutor {
    fn validate(&self, pod: &Pod) -> Result<(), ExecutorError> {
        LaunchPlan::from_pod(pod).map(|_| ())
    }

    async fn start(&self, pod: &Pod) -> Result<RemoteHandle, ExecutorError> {
        let plan = LaunchPlan::from_pod(pod)?;
        let out = self.run(&self.start_script(&plan)).await?;
        if out.lines().any(|l| l.trim() == "adopted") {
            info!("Adopted existing instance {}", plan.instance);
        } else {
            info!("Started instance {} from {}", plan.instance, plan.image);
        }
        Ok(RemoteHandle::new(plan.instance))
    }

    async fn stop(&self, handle: &RemoteHandle) -> Result<(), ExecutorError> {
        self.run(&self.stop_script(handle.as_str())).await?;
        debug!("Stopped instance {}", handle);
        Ok(())
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ExecutorError> {
        let out = self.run(&self.status_script(handle.as_str())).await?;
        parse_status(&out)
    }

    async fn logs(&self, handle: &RemoteHandle, opts: &LogOptions) -> Result<LogStream, ExecutorError> {
        let mut child = self
            .command(&self.logs_script(handle.as_str(), opts), false)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Transient("log stream has no stdout".to_string()))?;

        Ok(Box::pin(ChildStream {
            _child: child,
            reader: ReaderStream::new(stdout),
        }))
    }

    async fn exec(
        &self,
        handle: &RemoteHandle,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecutorError> {
        let mut words = vec![
            self.apptainer_bin.as_str(),
            "exec",
        ];
        let target = format!("instance://{}", handle);
        words.push(&target);
        words.extend(command.iter().map(String::as_str));
        let script = shell_join(words);

        let mut child = self
            .command(&script, io.tty)
            .stdin(if io.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdin_pump = match (io.stdin, child.stdin.take()) {
            (Some(mut src), Some(mut dst)) => Some(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut src, &mut dst).await;
                let _ = dst.shutdown().await;
            })),
            _ => None,
        };

        let (out, err) = tokio::join!(
            pump(child.stdout.take(), io.stdout),
            pump(child.stderr.take(), io.stderr)
        );
        let status = child.wait().await;

        if let Some(task) = stdin_pump {
            task.abort();
        }
        out.map_err(|e| ExecutorError::Transient(format!("exec stdout: {}", e)))?;
        err.map_err(|e| ExecutorError::Transient(format!("exec stderr: {}", e)))?;

        let status = status.map_err(|e| ExecutorError::Transient(format!("exec wait: {}", e)))?;
        match status.code() {
            Some(0) => Ok(()),
            Some(SSH_UNREACHABLE) => Err(ExecutorError::Unreachable(format!(
                "lost connection to {}",
                self.target.host
            ))),
            code => Err(ExecutorError::Permanent(format!(
                "command exited with status {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            ))),
        }
    }
}

async fn pump<R>(src: Option<R>, dst: Option<Box<dyn AsyncWrite + Send + Unpin>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match (src, dst) {
        (Some(mut src), Some(mut dst)) => {
            tokio::io::copy(&mut src, &mut dst).await?;
            dst.flush().await
        }
        (Some(mut src), None) => tokio::io::copy(&mut src, &mut tokio::io::sink()).await.map(|_| ()),
        _ => Ok(()),
    }
}

/// Output of a child process; the process is killed when the stream drops
struct ChildStream {
    _child: Child,
    reader: ReaderStream<ChildStdout>,
}

impl Stream for ChildStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().reader).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("train".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container(image: &str) -> Container {
        Container {
            name: "main".to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn executor() -> ApptainerSshExecutor {
        let mut target = SshTarget::new("login.hpc.example");
        target.user = Some("svc".to_string());
        ApptainerSshExecutor::new(target)
    }

    #[test]
    fn test_ssh_args_without_key() {
        let args = SshTarget::new("10.0.0.1").ssh_args();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"22".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn test_ssh_args_with_key_and_user() {
        let mut target = SshTarget::new("10.0.0.1");
        target.user = Some("ubuntu".to_string());
        target.port = 2222;
        target.identity_file = Some(PathBuf::from("/keys/hpc"));
        let args = target.ssh_args();
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/keys/hpc".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ubuntu@10.0.0.1"));
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("plain-word_1.0"), "plain-word_1.0");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("two words"), "'two words'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_instance_name_is_sanitized() {
        let id = PodIdentity::new("team a", "job/1");
        assert_eq!(instance_name(&id), "vk-team-a-job-1");
        assert_eq!(instance_name(&PodIdentity::new("ml", "train")), "vk-ml-train");
    }

    #[test]
    fn test_image_ref() {
        assert_eq!(image_ref("alpine:3.19"), "docker://alpine:3.19");
        assert_eq!(image_ref("oras://ghcr.io/x/y:1"), "oras://ghcr.io/x/y:1");
        assert_eq!(image_ref("/shared/images/solver.sif"), "/shared/images/solver.sif");
    }

    #[test]
    fn test_validate_requires_single_container_with_image() {
        let exec = executor();
        assert!(exec.validate(&pod(vec![container("alpine")])).is_ok());
        assert!(matches!(
            exec.validate(&pod(vec![])),
            Err(ExecutorError::Permanent(_))
        ));
        assert!(matches!(
            exec.validate(&pod(vec![container("a"), container("b")])),
            Err(ExecutorError::Permanent(_))
        ));
        let mut no_image = container("");
        no_image.image = None;
        assert!(matches!(
            exec.validate(&pod(vec![no_image])),
            Err(ExecutorError::Permanent(_))
        ));
    }

    #[test]
    fn test_launch_plan() {
        let mut c = container("pytorch:2.3");
        c.command = Some(vec!["python".to_string()]);
        c.args = Some(vec!["train.py".to_string(), "--epochs=3".to_string()]);
        c.working_dir = Some("/work".to_string());
        c.env = Some(vec![
            EnvVar {
                name: "MODE".to_string(),
                value: Some("fast".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "FROM_SECRET".to_string(),
                ..Default::default()
            },
        ]);
        c.resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                GPU_RESOURCE.to_string(),
                Quantity("1".to_string()),
            )])),
            ..Default::default()
        });

        let plan = LaunchPlan::from_pod(&pod(vec![c])).expect("plan");

        assert_eq!(plan.instance, "vk-ml-train");
        assert_eq!(plan.image, "docker://pytorch:2.3");
        assert_eq!(plan.env, vec![("MODE".to_string(), "fast".to_string())]);
        assert!(plan.gpu);

        let script = executor().start_script(&plan);
        assert!(script.contains("instance start --nv --env MODE=fast docker://pytorch:2.3 vk-ml-train"));
        assert!(script.contains("exec --pwd /work --env MODE=fast instance://vk-ml-train python train.py --epochs=3"));
        assert!(script.contains("echo adopted"));
        assert!(script.contains(".vk-apptainer/vk-ml-train.exit"));
    }

    #[test]
    fn test_start_script_uses_run_without_command() {
        let plan = LaunchPlan::from_pod(&pod(vec![container("alpine")])).expect("plan");
        let script = executor().start_script(&plan);
        assert!(script.contains("run instance://vk-ml-train"));
        assert!(!script.contains("--nv"));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("running\n").expect("status"), RemoteStatus::Running);
        assert_eq!(
            parse_status("exited 0").expect("status"),
            RemoteStatus::Exited(ExitInfo::with_code(0))
        );
        assert_eq!(
            parse_status("motd banner\nexited 137\n").expect("status"),
            RemoteStatus::Exited(ExitInfo::with_code(137))
        );
        assert_eq!(
            parse_status("missing").expect("status"),
            RemoteStatus::Exited(ExitInfo::lost("InstanceLost"))
        );
        assert!(matches!(parse_status(""), Err(ExecutorError::Transient(_))));
    }

    #[test]
    fn test_classify() {
        assert!(classify(Some(0), "").is_ok());
        assert!(matches!(
            classify(Some(255), "ssh: connect to host x port 22: Connection refused"),
            Err(ExecutorError::Unreachable(_))
        ));
        assert!(matches!(
            classify(Some(3), "FATAL: Unable to get image: manifest unknown"),
            Err(ExecutorError::Permanent(_))
        ));
        assert!(matches!(
            classify(Some(1), "resource temporarily unavailable"),
            Err(ExecutorError::Transient(_))
        ));
        assert!(matches!(classify(None, ""), Err(ExecutorError::Transient(_))));
    }

    #[test]
    fn test_logs_script() {
        let exec = executor();
        let opts = LogOptions {
            tail_lines: Some(50),
            limit_bytes: Some(1024),
            follow: false,
        };
        assert_eq!(
            exec.logs_script("vk-ml-train", &opts),
            "tail -n 50 .vk-apptainer/vk-ml-train.log | head -c 1024"
        );
        let follow = LogOptions {
            follow: true,
            ..Default::default()
        };
        assert_eq!(
            exec.logs_script("vk-ml-train", &follow),
            "tail -n +1 -f .vk-apptainer/vk-ml-train.log"
        );
    }

    #[test]
    fn test_stop_script_verifies_instance_is_gone() {
        let script = executor().stop_script("vk-ml-train");
        assert!(script.contains("instance stop vk-ml-train"));
        assert!(script.contains("instance stop --force vk-ml-train"));
        assert!(script.contains(&format!("exit {}", EXIT_STILL_RUNNING)));
    }
}
