// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Root entrypoint script generation for workspace-mounted containers.
//!
//! The container starts as root, runs this script, and only then does the
//! unprivileged sandbox user take over:
//!
//! 1. FUSE-mount the bucket and bind-mount the session prefix on /workspace
//! 2. optionally pip-install declared dependencies into /opt/sandbox-venv
//! 3. drop privileges to 1000:1000 and exec the executor daemon
//!
//! SYS_ADMIN and /dev/fuse are needed during step 1 only; user code never
//! runs before the setpriv drop. An install failure exits with a distinct
//! code so the control plane can fail the session with the captured logs.

use crate::runtime::ContainerConfig;

/// Exit code the script uses when dependency installation fails.
pub const INSTALL_FAILED_EXIT: i32 = 13;

/// Fixed, container-local install target; never shared between sessions.
pub const VENV_DIR: &str = "/opt/sandbox-venv";

/// Where the executor daemon lives inside every template image.
pub const EXECUTOR_BIN: &str = "/usr/local/bin/noxrun-executor";

/// Split "s3://bucket/key/prefix/" into (bucket, key prefix).
pub fn split_workspace_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("s3://")?;
    let (bucket, prefix) = rest.split_once('/')?;
    if bucket.is_empty() {
        return None;
    }
    Some((bucket, prefix))
}

/// Build the entrypoint for a workspace-mounted container.
///
/// Callers must have validated `dependencies` with
/// [`crate::security::validate_package_name`]; the quoting here assumes the
/// requirement charset that validation guarantees.
pub fn build_script(config: &ContainerConfig, pip_index_url: &str) -> Option<String> {
    let (bucket, prefix) = split_workspace_url(&config.workspace_url)?;
    let (uid, gid) = split_user(&config.user);

    let mut script = String::from("#!/bin/sh\nset -eu\n\n");

    // Object-store credentials arrive via NOXRUN_S3_* env injected by the
    // control plane; s3fs reads them from a root-only passwd file.
    script.push_str("mkdir -p /mnt/noxrun-store /workspace\n");
    script.push_str(
        "printf '%s:%s' \"$NOXRUN_S3_ACCESS_KEY\" \"$NOXRUN_S3_SECRET_KEY\" > /etc/passwd-s3fs\n",
    );
    script.push_str("chmod 600 /etc/passwd-s3fs\n");
    script.push_str(&format!(
        "s3fs {} /mnt/noxrun-store -o passwd_file=/etc/passwd-s3fs -o uid={},gid={},mp_umask=022 \
         ${{NOXRUN_S3_ENDPOINT:+-o url=\"$NOXRUN_S3_ENDPOINT\" -o use_path_request_style}}\n",
        bucket, uid, gid
    ));
    script.push_str(&format!(
        "mkdir -p \"/mnt/noxrun-store/{}\"\nmount --bind \"/mnt/noxrun-store/{}\" /workspace\n\n",
        prefix.trim_end_matches('/'),
        prefix.trim_end_matches('/')
    ));

    if !config.dependencies.is_empty() {
        script.push_str(&format!("mkdir -p {0}\nchown {1}:{2} {0}\n", VENV_DIR, uid, gid));
        let requirements = config
            .dependencies
            .iter()
            .map(|d| format!("'{}'", d))
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!(
            "pip install --isolated --no-cache-dir --index-url '{}' --target {} {} || exit {}\n",
            pip_index_url, VENV_DIR, requirements, INSTALL_FAILED_EXIT
        ));
        script.push_str(&format!("export PYTHONPATH={}:${{PYTHONPATH:-}}\n\n", VENV_DIR));
    }

    // Credentials must not survive into the sandbox.
    script.push_str("rm -f /etc/passwd-s3fs\n");
    script.push_str("unset NOXRUN_S3_ACCESS_KEY NOXRUN_S3_SECRET_KEY\n\n");

    script.push_str(&format!(
        "exec setpriv --reuid={} --regid={} --clear-groups {} --port {}\n",
        uid, gid, EXECUTOR_BIN, config.executor_port
    ));

    Some(script)
}

fn split_user(user: &str) -> (&str, &str) {
    user.split_once(':').unwrap_or(("1000", "1000"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(deps: Vec<String>) -> ContainerConfig {
        ContainerConfig {
            session_id: "sess_abcdefgh12345678".into(),
            image: "python:3.12-slim".into(),
            cpu_millis: 1000,
            memory_mb: 512,
            disk_gb: 1,
            env: HashMap::new(),
            labels: HashMap::new(),
            workspace_url: "s3://workspaces/sessions/sess_abcdefgh12345678/".into(),
            network_mode: "bridge".into(),
            user: "1000:1000".into(),
            mount_workspace: true,
            dependencies: deps,
            executor_port: 8000,
        }
    }

    #[test]
    fn test_split_workspace_url() {
        assert_eq!(
            split_workspace_url("s3://bucket/sessions/sess_x/"),
            Some(("bucket", "sessions/sess_x/"))
        );
        assert_eq!(split_workspace_url("http://bucket/x"), None);
        assert_eq!(split_workspace_url("s3:///x"), None);
    }

    #[test]
    fn test_script_mounts_and_drops_privileges() {
        let script = build_script(&config(vec![]), "https://pypi.org/simple").unwrap();
        assert!(script.contains("s3fs workspaces /mnt/noxrun-store"));
        assert!(script.contains("mount --bind \"/mnt/noxrun-store/sessions/sess_abcdefgh12345678\" /workspace"));
        assert!(script.contains("setpriv --reuid=1000 --regid=1000"));
        // The exec must be the last line so the executor becomes PID 1's child.
        assert!(script.trim_end().ends_with("--port 8000"));
        // No install stanza without dependencies.
        assert!(!script.contains("pip install"));
    }

    #[test]
    fn test_script_installs_dependencies_into_fixed_target() {
        let script = build_script(
            &config(vec!["pandas==2.1.0".into(), "numpy".into()]),
            "https://pypi.org/simple",
        )
        .unwrap();
        assert!(script.contains("--target /opt/sandbox-venv"));
        assert!(script.contains("--isolated"));
        assert!(script.contains("--index-url 'https://pypi.org/simple'"));
        assert!(script.contains("'pandas==2.1.0' 'numpy'"));
        assert!(script.contains(&format!("exit {}", INSTALL_FAILED_EXIT)));
        assert!(script.contains("chown 1000:1000 /opt/sandbox-venv"));
    }

    #[test]
    fn test_script_scrubs_credentials_before_exec() {
        let script = build_script(&config(vec![]), "https://pypi.org/simple").unwrap();
        let scrub = script.find("rm -f /etc/passwd-s3fs").unwrap();
        let exec = script.find("exec setpriv").unwrap();
        assert!(scrub < exec);
        assert!(script.contains("unset NOXRUN_S3_ACCESS_KEY NOXRUN_S3_SECRET_KEY"));
    }
}
