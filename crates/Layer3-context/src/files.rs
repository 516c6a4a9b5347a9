//! File operations inside a container
//!
//! Content always travels through `docker exec -i` stdin. Private files are
//! created under `umask 077` and chmod'ed to 600 in the same shell.

use dockhand_foundation::{CommandOutput, Error, Result};
use dockhand_pool::{Container, ExecOptions, Lease};

const WRITE_PRIVATE: &str = r#"umask 077 && cat > "$1" && chmod 600 "$1""#;
const WRITE_PLAIN: &str = r#"cat > "$1""#;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn check(program: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(Error::command(program, output.failure_message()))
    }
}

/// Write `content` to `path`
pub async fn write_file(container: &Lease<Container>, path: &str, content: &[u8], private: bool) -> Result<()> {
    let script = if private { WRITE_PRIVATE } else { WRITE_PLAIN };
    let output = container
        .execute_with_input(&argv(&["sh", "-c", script, "sh", path]), &ExecOptions::new(), content)
        .await?;
    check("sh", output).map(|_| ())
}

/// `mkdir -p`, mode 700 when `private`
pub async fn make_dir(container: &Lease<Container>, path: &str, private: bool) -> Result<()> {
    let command = if private {
        argv(&["mkdir", "-p", "-m", "700", path])
    } else {
        argv(&["mkdir", "-p", path])
    };
    let output = container.execute_capture(&command, &ExecOptions::new()).await?;
    check("mkdir", output).map(|_| ())
}

/// `rm -rf`
pub async fn remove_path(container: &Lease<Container>, path: &str) -> Result<()> {
    let output = container
        .execute_capture(&argv(&["rm", "-rf", path]), &ExecOptions::new())
        .await?;
    check("rm", output).map(|_| ())
}

/// Parent of a `/`-separated container path
pub fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}
