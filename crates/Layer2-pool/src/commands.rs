//! Command serializers
//!
//! Thin builders that turn pool operations into `CommandSpec`s for docker,
//! ssh-agent/ssh-add and basic process tools. They hold no state besides the
//! binary names and the timeout.

use dockhand_foundation::{AgentSettings, CommandSpec, DockhandConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::labels::{LABEL_MANAGED, LABEL_NODE, MANAGED_VALUE};

/// Go template for `docker ps` used by discovery: id, state, labels
pub const PS_FORMAT: &str = "{{.ID}}\t{{.State}}\t{{.Labels}}";

/// Socket file name prefix inside a node's agent directory
pub const AGENT_SOCKET_PREFIX: &str = "agent.";

/// Socket file name suffix
pub const AGENT_SOCKET_SUFFIX: &str = ".sock";

/// Volume mount for `docker run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// docker CLI commands
#[derive(Debug, Clone)]
pub struct DockerCommands {
    binary: String,
    timeout: Duration,
}

impl DockerCommands {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DockhandConfig) -> Self {
        Self::new(&config.docker.binary, config.command_timeout())
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.binary).timeout(self.timeout)
    }

    /// `docker run -d` with a long sleep so the container outlives any exec
    pub fn run_detached(
        &self,
        image: &str,
        labels: &BTreeMap<String, String>,
        mounts: &[BindMount],
        env: &BTreeMap<String, String>,
        extra_args: &[String],
    ) -> CommandSpec {
        let mut spec = self.command().args(["run", "-d", "--init"]);
        for (key, value) in labels {
            spec = spec.arg("--label").arg(format!("{}={}", key, value));
        }
        for mount in mounts {
            let ro = if mount.read_only { ":ro" } else { "" };
            spec = spec
                .arg("-v")
                .arg(format!("{}:{}{}", mount.host_path, mount.container_path, ro));
        }
        for (key, value) in env {
            spec = spec.arg("-e").arg(format!("{}={}", key, value));
        }
        spec.args(extra_args.iter().cloned())
            .arg(image)
            .args(["sleep", "infinity"])
    }

    pub fn inspect_running(&self, id: &str) -> CommandSpec {
        self.command()
            .args(["inspect", "-f", "{{.State.Running}}"])
            .arg(id)
    }

    pub fn remove(&self, id: &str) -> CommandSpec {
        self.command().args(["rm", "-f"]).arg(id)
    }

    /// `docker exec` with optional principal, working directory and env.
    /// `-i` is only passed when stdin is fed.
    pub fn exec(
        &self,
        id: &str,
        command: &[String],
        user: Option<&str>,
        workdir: Option<&str>,
        env: &BTreeMap<String, String>,
        interactive: bool,
    ) -> CommandSpec {
        let mut spec = self.command().arg("exec");
        if interactive {
            spec = spec.arg("-i");
        }
        if let Some(user) = user {
            spec = spec.arg("-u").arg(user);
        }
        if let Some(dir) = workdir {
            spec = spec.arg("-w").arg(dir);
        }
        for (key, value) in env {
            spec = spec.arg("-e").arg(format!("{}={}", key, value));
        }
        spec.arg(id).args(command.iter().cloned())
    }

    /// All managed containers of one node, running or not
    pub fn list_managed(&self, node: &str) -> CommandSpec {
        self.command()
            .args(["ps", "-a", "--no-trunc"])
            .arg("--filter")
            .arg(format!("label={}={}", LABEL_MANAGED, MANAGED_VALUE))
            .arg("--filter")
            .arg(format!("label={}={}", LABEL_NODE, node))
            .arg("--format")
            .arg(PS_FORMAT)
    }
}

/// ssh-agent / ssh-add commands
#[derive(Debug, Clone)]
pub struct AgentCommands {
    agent_binary: String,
    add_binary: String,
    key_lifetime: Duration,
    timeout: Duration,
}

impl AgentCommands {
    pub fn new(settings: &AgentSettings, timeout: Duration) -> Self {
        Self {
            agent_binary: settings.agent_binary.clone(),
            add_binary: settings.add_binary.clone(),
            key_lifetime: settings.key_lifetime(),
            timeout,
        }
    }

    pub fn agent_binary(&self) -> &str {
        &self.agent_binary
    }

    /// Start an agent bound to `socket`; it forks and prints its env
    pub fn start(&self, socket: &Path) -> CommandSpec {
        CommandSpec::new(&self.agent_binary)
            .arg("-s")
            .arg("-a")
            .arg(socket.to_string_lossy())
            .timeout(self.timeout)
    }

    fn add(&self, socket: &Path) -> CommandSpec {
        CommandSpec::new(&self.add_binary)
            .env("SSH_AUTH_SOCK", socket.to_string_lossy())
            .timeout(self.timeout)
    }

    /// `ssh-add -l`: exit 0 with keys, 1 when empty, 2 when unreachable
    pub fn list_keys(&self, socket: &Path) -> CommandSpec {
        self.add(socket).arg("-l")
    }

    /// Inject one key read from stdin, with a finite agent-side lifetime
    pub fn add_key_from_stdin(&self, socket: &Path, key: &[u8]) -> CommandSpec {
        let mut material = key.to_vec();
        if !material.ends_with(b"\n") {
            material.push(b'\n');
        }
        self.add(socket)
            .arg("-t")
            .arg(self.key_lifetime.as_secs().max(1).to_string())
            .arg("-")
            .stdin(material)
    }

    pub fn remove_all_keys(&self, socket: &Path) -> CommandSpec {
        self.add(socket).arg("-D")
    }
}

/// Basic process and filesystem commands on a node
#[derive(Debug, Clone)]
pub struct ProcessCommands {
    timeout: Duration,
}

impl ProcessCommands {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn is_alive(&self, pid: u32) -> CommandSpec {
        CommandSpec::new("kill")
            .args(["-0".to_string(), pid.to_string()])
            .timeout(self.timeout)
    }

    pub fn terminate(&self, pid: u32) -> CommandSpec {
        CommandSpec::new("kill")
            .arg(pid.to_string())
            .timeout(self.timeout)
    }

    pub fn socket_exists(&self, path: &Path) -> CommandSpec {
        CommandSpec::new("test")
            .arg("-S")
            .arg(path.to_string_lossy())
            .timeout(self.timeout)
    }

    pub fn remove_file(&self, path: &Path) -> CommandSpec {
        CommandSpec::new("rm")
            .arg("-f")
            .arg(path.to_string_lossy())
            .timeout(self.timeout)
    }

    pub fn make_private_dir(&self, path: &Path) -> CommandSpec {
        CommandSpec::new("mkdir")
            .args(["-p", "-m", "700"])
            .arg(path.to_string_lossy())
            .timeout(self.timeout)
    }

    /// `pid stat args` for every process, without a header
    pub fn list_processes(&self) -> CommandSpec {
        CommandSpec::new("ps")
            .args(["-eo", "pid=,stat=,args="])
            .timeout(self.timeout)
    }

    pub fn list_sockets(&self, dir: &Path) -> CommandSpec {
        CommandSpec::new("find")
            .arg(dir.to_string_lossy())
            .args(["-maxdepth", "1", "-type", "s", "-name"])
            .arg(format!("{}*{}", AGENT_SOCKET_PREFIX, AGENT_SOCKET_SUFFIX))
            .timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn docker() -> DockerCommands {
        DockerCommands::new("docker", Duration::from_secs(30))
    }

    #[test]
    fn test_run_detached_carries_labels_and_sleeps() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        let spec = docker().run_detached(
            "ubuntu:22.04",
            &labels,
            &[BindMount::new("/tmp/agents/node1", "/tmp/agents/node1")],
            &BTreeMap::new(),
            &[],
        );

        let argv = spec.argv();
        assert_eq!(&argv[..3], &["docker", "run", "-d"]);
        assert!(argv.contains(&"io.dockhand.managed=true"));
        assert!(argv.contains(&"/tmp/agents/node1:/tmp/agents/node1"));
        assert_eq!(&argv[argv.len() - 3..], &["ubuntu:22.04", "sleep", "infinity"]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_exec_flags_precede_container_id() {
        let mut env = BTreeMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), "/tmp/a.sock".to_string());
        let spec = docker().exec(
            "abc",
            &["ansible-playbook".to_string(), "site.yml".to_string()],
            Some("jenkins"),
            Some("/work"),
            &env,
            false,
        );
        assert_eq!(
            spec.argv(),
            vec![
                "docker",
                "exec",
                "-u",
                "jenkins",
                "-w",
                "/work",
                "-e",
                "SSH_AUTH_SOCK=/tmp/a.sock",
                "abc",
                "ansible-playbook",
                "site.yml"
            ]
        );
    }

    #[test]
    fn test_add_key_uses_stdin_not_argv() {
        let settings = AgentSettings::default();
        let commands = AgentCommands::new(&settings, Duration::from_secs(10));
        let socket = PathBuf::from("/tmp/agents/node1/agent.x.sock");
        let spec = commands.add_key_from_stdin(&socket, b"PRIVATE");

        assert!(!spec.display().contains("PRIVATE"));
        assert_eq!(spec.stdin.as_deref(), Some(&b"PRIVATE\n"[..]));
        assert_eq!(spec.args, vec!["-t", "3600", "-"]);
        assert_eq!(
            spec.env.get("SSH_AUTH_SOCK").map(String::as_str),
            Some("/tmp/agents/node1/agent.x.sock")
        );
    }

    #[test]
    fn test_list_managed_filters_by_node() {
        let spec = docker().list_managed("node1");
        assert!(spec.args.contains(&"label=io.dockhand.node=node1".to_string()));
        assert!(spec.args.contains(&PS_FORMAT.to_string()));
    }
}
