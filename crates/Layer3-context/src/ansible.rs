//! Ansible step
//!
//! Thin argv serializers for `ansible-playbook`, `ansible` and
//! `ansible-galaxy`, plus the `ansible.cfg` written into every working tree.

use dockhand_foundation::{CommandOutput, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Config file name inside the working directory
pub const ANSIBLE_CONFIG_FILE: &str = "ansible.cfg";

/// One Ansible invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AnsibleCommand {
    /// `ansible-playbook`
    #[serde(rename_all = "camelCase")]
    Playbook {
        playbook: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
        #[serde(default)]
        check: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extra_args: Vec<String>,
    },

    /// `ansible <pattern> -m <module>`
    #[serde(rename_all = "camelCase")]
    AdHoc {
        pattern: String,
        module: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extra_args: Vec<String>,
    },

    /// `ansible-galaxy install -r <requirements>`
    #[serde(rename_all = "camelCase")]
    GalaxyInstall { requirements: String },
}

/// Environment-specific values added to every invocation
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub inventory: &'a str,
    pub vault_files: &'a [String],
    pub extra_vars: &'a BTreeMap<String, String>,
    pub remote_user: Option<&'a str>,
}

impl AnsibleCommand {
    pub fn playbook(playbook: impl Into<String>) -> Self {
        Self::Playbook {
            playbook: playbook.into(),
            limit: None,
            tags: Vec::new(),
            check: false,
            extra_args: Vec::new(),
        }
    }

    pub fn ad_hoc(pattern: impl Into<String>, module: impl Into<String>) -> Self {
        Self::AdHoc {
            pattern: pattern.into(),
            module: module.into(),
            args: None,
            extra_args: Vec::new(),
        }
    }

    pub fn galaxy_install(requirements: impl Into<String>) -> Self {
        Self::GalaxyInstall {
            requirements: requirements.into(),
        }
    }

    /// Executable name
    pub fn program(&self) -> &'static str {
        match self {
            Self::Playbook { .. } => "ansible-playbook",
            Self::AdHoc { .. } => "ansible",
            Self::GalaxyInstall { .. } => "ansible-galaxy",
        }
    }

    /// Full command vector
    pub fn argv(&self, invocation: &Invocation<'_>) -> Result<Vec<String>> {
        let mut argv = vec![self.program().to_string()];
        match self {
            Self::Playbook {
                playbook,
                limit,
                tags,
                check,
                extra_args,
            } => {
                push_common(&mut argv, invocation)?;
                if let Some(limit) = limit {
                    argv.extend(["--limit".to_string(), limit.clone()]);
                }
                if !tags.is_empty() {
                    argv.extend(["--tags".to_string(), tags.join(",")]);
                }
                if *check {
                    argv.push("--check".to_string());
                }
                argv.extend(extra_args.iter().cloned());
                argv.push(playbook.clone());
            }
            Self::AdHoc {
                pattern,
                module,
                args,
                extra_args,
            } => {
                argv.push(pattern.clone());
                push_common(&mut argv, invocation)?;
                argv.extend(["-m".to_string(), module.clone()]);
                if let Some(args) = args {
                    argv.extend(["-a".to_string(), args.clone()]);
                }
                argv.extend(extra_args.iter().cloned());
            }
            Self::GalaxyInstall { requirements } => {
                argv.extend(["install", "-r"].map(str::to_string));
                argv.push(requirements.clone());
            }
        }
        Ok(argv)
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Self::Playbook { playbook, .. } => format!("playbook {}", playbook),
            Self::AdHoc { pattern, module, .. } => format!("{} on {}", module, pattern),
            Self::GalaxyInstall { requirements } => format!("galaxy install {}", requirements),
        }
    }
}

fn push_common(argv: &mut Vec<String>, invocation: &Invocation<'_>) -> Result<()> {
    argv.extend(["-i".to_string(), invocation.inventory.to_string()]);
    for file in invocation.vault_files {
        argv.extend(["--vault-password-file".to_string(), file.clone()]);
    }
    // JSON keeps values with spaces or '=' intact
    if !invocation.extra_vars.is_empty() {
        argv.extend(["-e".to_string(), serde_json::to_string(invocation.extra_vars)?]);
    }
    if let Some(user) = invocation.remote_user {
        argv.extend(["-u".to_string(), user.to_string()]);
    }
    Ok(())
}

/// Result of one step. A non-zero exit code is not an error here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn new(command: &AnsibleCommand, output: CommandOutput) -> Self {
        Self {
            command: command.describe(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration.as_millis() as u64,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// `ansible.cfg` contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleConfig {
    /// Default inventory, relative to the checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles_path: Option<String>,

    #[serde(default)]
    pub host_key_checking: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forks: Option<u32>,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            inventory: None,
            roles_path: None,
            host_key_checking: false,
            forks: None,
        }
    }
}

impl AnsibleConfig {
    pub fn render(&self) -> String {
        let mut out = String::from("[defaults]\n");
        if let Some(inventory) = &self.inventory {
            out.push_str(&format!("inventory = {}\n", inventory));
        }
        if let Some(roles_path) = &self.roles_path {
            out.push_str(&format!("roles_path = {}\n", roles_path));
        }
        if let Some(forks) = self.forks {
            out.push_str(&format!("forks = {}\n", forks));
        }
        out.push_str(&format!(
            "host_key_checking = {}\n",
            if self.host_key_checking { "True" } else { "False" }
        ));
        out.push_str("retry_files_enabled = False\n");
        out.push_str("\n[ssh_connection]\npipelining = True\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation<'a>(vault: &'a [String], vars: &'a BTreeMap<String, String>) -> Invocation<'a> {
        Invocation {
            inventory: "inventories/prod",
            vault_files: vault,
            extra_vars: vars,
            remote_user: Some("deploy"),
        }
    }

    #[test]
    fn test_playbook_argv() {
        let vault = vec!["/ws/.dockhand-secrets/x/prod.vault".to_string()];
        let mut vars = BTreeMap::new();
        vars.insert("release".to_string(), "1.2 rc".to_string());

        let command = AnsibleCommand::Playbook {
            playbook: "site.yml".into(),
            limit: Some("web".into()),
            tags: vec!["deploy".into(), "config".into()],
            check: true,
            extra_args: vec!["--diff".into()],
        };
        let argv = command.argv(&invocation(&vault, &vars)).unwrap();

        assert_eq!(
            argv,
            vec![
                "ansible-playbook",
                "-i",
                "inventories/prod",
                "--vault-password-file",
                "/ws/.dockhand-secrets/x/prod.vault",
                "-e",
                r#"{"release":"1.2 rc"}"#,
                "-u",
                "deploy",
                "--limit",
                "web",
                "--tags",
                "deploy,config",
                "--check",
                "--diff",
                "site.yml",
            ]
        );
    }

    #[test]
    fn test_ad_hoc_and_galaxy_argv() {
        let vars = BTreeMap::new();
        let inv = Invocation {
            inventory: "hosts",
            vault_files: &[],
            extra_vars: &vars,
            remote_user: None,
        };

        let ping = AnsibleCommand::AdHoc {
            pattern: "all".into(),
            module: "shell".into(),
            args: Some("uptime".into()),
            extra_args: Vec::new(),
        };
        assert_eq!(
            ping.argv(&inv).unwrap(),
            vec!["ansible", "all", "-i", "hosts", "-m", "shell", "-a", "uptime"]
        );

        assert_eq!(
            AnsibleCommand::galaxy_install("requirements.yml").argv(&inv).unwrap(),
            vec!["ansible-galaxy", "install", "-r", "requirements.yml"]
        );
    }

    #[test]
    fn test_command_serde_shape() {
        let json = r#"{"kind":"playbook","playbook":"site.yml","tags":["a"]}"#;
        let command: AnsibleCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            command,
            AnsibleCommand::Playbook {
                playbook: "site.yml".into(),
                limit: None,
                tags: vec!["a".into()],
                check: false,
                extra_args: Vec::new(),
            }
        );
    }

    #[test]
    fn test_render_config() {
        let config = AnsibleConfig {
            inventory: Some("inventories/prod".into()),
            roles_path: Some("roles".into()),
            ..Default::default()
        };
        let rendered = config.render();
        assert!(rendered.starts_with("[defaults]\ninventory = inventories/prod\nroles_path = roles\n"));
        assert!(rendered.contains("host_key_checking = False\n"));
        assert!(rendered.contains("retry_files_enabled = False\n"));
        assert!(rendered.ends_with("[ssh_connection]\npipelining = True\n"));
    }
}
