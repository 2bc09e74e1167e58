use std::path::PathBuf;

use clap::{Args, Parser};
use keel_common::config::PipedSpec;
use keel_piped::{admin::DEFAULT_ADMIN_PORT, Piped, PipedOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{KeelCliError, KeelCliResult};

#[derive(Parser, Debug, Clone)]
pub struct PipedArgs {
    #[command(flatten)]
    pub source: ConfigSource,

    /// Connect to the control plane without TLS
    #[arg(long, default_value_t = false)]
    pub insecure: bool,

    /// Port of the admin server exposing health and metrics
    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT)]
    pub admin_port: u16,

    /// Directory holding the working copies; a temporary one when unset
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Directory of the external tools used by the executors
    #[arg(long)]
    pub tools_dir: Option<PathBuf>,
}

/// Where the piped configuration is read from. Exactly one is allowed.
#[derive(Args, Debug, Clone)]
#[group(multiple = false)]
pub struct ConfigSource {
    /// Path to the piped configuration file
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Base64 encoded piped configuration
    #[arg(long)]
    pub config_data: Option<String>,

    /// Name of a GCP secret holding the configuration
    #[arg(long)]
    pub config_gcp_secret: Option<String>,

    /// Name of an AWS secret holding the configuration
    #[arg(long)]
    pub config_aws_secret: Option<String>,

    /// Name of an AWS SSM parameter holding the configuration
    #[arg(long)]
    pub config_aws_ssm_parameter: Option<String>,
}

impl ConfigSource {
    pub fn load(&self) -> KeelCliResult<PipedSpec> {
        if let Some(path) = &self.config_file {
            return Ok(PipedSpec::load_file(path)?);
        }
        if let Some(data) = &self.config_data {
            return Ok(PipedSpec::load_base64(data)?);
        }
        let source = if self.config_gcp_secret.is_some() {
            "--config-gcp-secret"
        } else if self.config_aws_secret.is_some() {
            "--config-aws-secret"
        } else if self.config_aws_ssm_parameter.is_some() {
            "--config-aws-ssm-parameter"
        } else {
            return Err(KeelCliError::InitConfig(
                "one of the config sources must be set".to_string(),
            ));
        };
        Err(KeelCliError::ParseConfig(format!(
            "{} is not supported in this build",
            source
        )))
    }
}

pub async fn run(args: PipedArgs, token: CancellationToken) -> KeelCliResult {
    let spec = args.source.load()?;
    info!(project_id = %spec.project_id, piped_id = %spec.piped_id, "starting piped");
    let piped = Piped::new(PipedOptions {
        spec,
        insecure: args.insecure,
        admin_port: args.admin_port,
        workspace: args.workspace,
        tools_dir: args.tools_dir,
    });
    piped.run(token).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const CONFIG: &str = "apiVersion: keel.dev/v1beta1
kind: Piped
spec:
  projectID: p1
  pipedID: piped-1
  pipedKeyData: a2V5
  apiAddress: localhost:9080
";

    fn source() -> ConfigSource {
        ConfigSource {
            config_file: None,
            config_data: None,
            config_gcp_secret: None,
            config_aws_secret: None,
            config_aws_ssm_parameter: None,
        }
    }

    #[test]
    fn loads_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piped.yaml");
        fs::write(&path, CONFIG).unwrap();
        let spec = ConfigSource {
            config_file: Some(path),
            ..source()
        }
        .load()
        .unwrap();
        assert_eq!(spec.piped_id, "piped-1");
    }

    #[test]
    fn a_config_source_is_required() {
        let err = source().load().unwrap_err();
        assert!(err.to_string().contains("one of the config sources must be set"));
    }

    #[test]
    fn cloud_sources_are_rejected() {
        let err = ConfigSource {
            config_aws_secret: Some("piped".to_string()),
            ..source()
        }
        .load()
        .unwrap_err();
        assert!(err.to_string().contains("--config-aws-secret is not supported"));
    }
}
