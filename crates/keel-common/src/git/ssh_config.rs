use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    config::PipedGit,
    error::{KeelError, KeelResult},
    util::template::Template,
};

const DEFAULT_HOST: &str = "github.com";
const DEFAULT_HOST_NAME: &str = "github.com";

const SSH_CONFIG_TEMPLATE: &str = "
Host {{ .Host }}
    Hostname {{ .HostName }}
    User git
    IdentityFile {{ .IdentityFile }}
    UserKnownHostsFile /dev/null
    StrictHostKeyChecking no
";

pub fn render_ssh_config(host: &str, host_name: &str, identity_file: &str) -> KeelResult<String> {
    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let host_name = if host_name.is_empty() {
        DEFAULT_HOST_NAME
    } else {
        host_name
    };
    let values = HashMap::from([
        ("Host", host.to_string()),
        ("HostName", host_name.to_string()),
        ("IdentityFile", identity_file.to_string()),
    ]);
    Template::parse(SSH_CONFIG_TEMPLATE)?.execute(&values)
}

/// Writes the SSH key and appends a host entry to the SSH config file.
///
/// The config path is `sshConfigFilePath` or `$HOME/.ssh/config`. Returns the
/// path of the written config.
pub fn add_ssh_config(git: &PipedGit) -> KeelResult<PathBuf> {
    let config_path = if git.ssh_config_file_path.is_empty() {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| KeelError::InvalidConfig("HOME is not set".into()))?;
        Path::new(&home).join(".ssh").join("config")
    } else {
        PathBuf::from(&git.ssh_config_file_path)
    };
    let ssh_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&ssh_dir)?;

    let key = git.load_ssh_key()?;
    let key_file = ssh_dir.join(format!("keel-ssh-key-{}", std::process::id()));
    fs::write(&key_file, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_file, fs::Permissions::from_mode(0o600))?;
    }

    let rendered = render_ssh_config(&git.host, &git.host_name, &key_file.to_string_lossy())?;
    let mut existing = fs::read_to_string(&config_path).unwrap_or_default();
    existing.push_str(&rendered);
    fs::write(&config_path, existing)?;
    tracing::info!(path = %config_path.display(), "configured ssh config for git");
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ssh_config() {
        let got = render_ssh_config("gh", "github.com", "/etc/key").unwrap();
        assert_eq!(
            got,
            "\nHost gh\n    Hostname github.com\n    User git\n    IdentityFile /etc/key\n    UserKnownHostsFile /dev/null\n    StrictHostKeyChecking no\n"
        );
        assert!(render_ssh_config("", "", "/k").unwrap().contains("Host github.com\n"));
    }

    #[test]
    fn writes_key_and_config() {
        use base64::Engine;
        let dir = tempfile::tempdir().unwrap();
        let git = PipedGit {
            ssh_config_file_path: dir.path().join("ssh/config").to_string_lossy().into_owned(),
            ssh_key_data: base64::engine::general_purpose::STANDARD.encode("PRIVATE KEY"),
            host: "example".into(),
            host_name: "git.example.com".into(),
            ..Default::default()
        };
        let path = add_ssh_config(&git).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("Hostname git.example.com"));
        let key_line = content
            .lines()
            .find(|l| l.trim_start().starts_with("IdentityFile"))
            .unwrap();
        let key_path = key_line.trim().trim_start_matches("IdentityFile ").to_string();
        assert_eq!(fs::read_to_string(key_path).unwrap(), "PRIVATE KEY");
    }
}
