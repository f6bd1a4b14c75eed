//! Remote-binary provider over SSH: copies the input to a remote host with
//! `scp`, runs the whisper binary there over `ssh`, parses its stdout, and
//! removes the remote copy. Suits a GPU machine reachable only by shell.

use crate::config::ProviderConfig;
use crate::error::{ErrorCode, TranscriptionError};
use crate::models::{
    AudioFormat, ProviderFeatures, ProviderInfo, ProviderRequirements, ProviderType,
    TranscriptionRequest, TranscriptionResponse,
};
use crate::providers::local_whisper::parse_output;
use crate::providers::{check_input_file, require_text, Provider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const PROVIDER_TYPE: &str = "ssh-whisper";

#[derive(Debug, Clone)]
struct Settings {
    host: String,
    user: String,
    port: u16,
    remote_binary: String,
    remote_model: String,
    remote_temp_dir: String,
    ssh_binary: String,
    scp_binary: String,
}

impl Settings {
    fn from_map(map: &HashMap<String, serde_json::Value>) -> Self {
        let get = |key: &str| {
            map.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            host: get("host"),
            user: get("user"),
            port: map.get("port").and_then(|v| v.as_u64()).unwrap_or(22) as u16,
            remote_binary: get("remote_binary"),
            remote_model: get("remote_model"),
            remote_temp_dir: {
                let dir = get("remote_temp_dir");
                if dir.is_empty() {
                    "/tmp".to_string()
                } else {
                    dir
                }
            },
            ssh_binary: {
                let bin = get("ssh_binary");
                if bin.is_empty() {
                    "ssh".to_string()
                } else {
                    bin
                }
            },
            scp_binary: {
                let bin = get("scp_binary");
                if bin.is_empty() {
                    "scp".to_string()
                } else {
                    bin
                }
            },
        }
    }

    fn target(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

pub struct SshWhisperProvider {
    name: String,
    settings: Settings,
    timeout: Duration,
}

impl SshWhisperProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            settings: Settings::from_map(&config.settings),
            timeout: config.timeout(),
        }
    }

    fn remote_path(&self, local: &Path) -> String {
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        format!(
            "{}/voxflow-{}-{}",
            self.settings.remote_temp_dir.trim_end_matches('/'),
            chrono::Utc::now().timestamp_millis(),
            file_name
        )
    }

    async fn run(
        &self,
        binary: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output, TranscriptionError> {
        let child = Command::new(binary)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TranscriptionError::new(
                    ErrorCode::TranscriptionFailed,
                    &self.name,
                    format!("failed to spawn {binary}: {e}"),
                )
            })?;

        tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TranscriptionError::network(
                    &self.name,
                    format!("{binary} timed out after {}s", timeout.as_secs()),
                )
            })?
            .map_err(|e| {
                TranscriptionError::new(
                    ErrorCode::TranscriptionFailed,
                    &self.name,
                    format!("failed to collect {binary} output: {e}"),
                )
            })
    }

    fn ssh_base_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ]
    }
}

pub fn from_config(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>, TranscriptionError> {
    let provider = SshWhisperProvider::new(name, config);
    provider.validate_configuration()?;
    Ok(Arc::new(provider))
}

pub fn type_info() -> ProviderInfo {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "host".to_string(),
        crate::models::ConfigField::new("string", "Remote host name or address", true),
    );
    config_schema.insert(
        "user".to_string(),
        crate::models::ConfigField::new("string", "SSH user", false),
    );
    config_schema.insert(
        "port".to_string(),
        crate::models::ConfigField::new("int", "SSH port", false)
            .with_default(serde_json::json!(22)),
    );
    config_schema.insert(
        "remote_binary".to_string(),
        crate::models::ConfigField::new("string", "Whisper binary path on the remote host", true),
    );
    config_schema.insert(
        "remote_model".to_string(),
        crate::models::ConfigField::new("string", "Model path on the remote host", true),
    );
    config_schema.insert(
        "remote_temp_dir".to_string(),
        crate::models::ConfigField::new("string", "Staging directory on the remote host", false)
            .with_default(serde_json::json!("/tmp")),
    );

    ProviderInfo {
        name: PROVIDER_TYPE.to_string(),
        display_name: "Remote Whisper over SSH".to_string(),
        provider_type: ProviderType::Hybrid,
        version: "1.0.0".to_string(),
        supported_formats: AudioFormat::all(),
        supported_languages: Vec::new(),
        max_file_size_mb: 0,
        max_duration_secs: 0,
        features: ProviderFeatures {
            timestamps: true,
            word_level: false,
            confidence: false,
            language_detection: true,
            streaming: false,
        },
        requirements: ProviderRequirements {
            internet: true,
            api_key: false,
            binary: true,
        },
        default_model: "remote".to_string(),
        available_models: Vec::new(),
        latency_hint_ms: 20_000,
        cost_hint: "free (own hardware)".to_string(),
        config_schema,
    }
}

/// ssh exits with 255 on connection-level failures; anything else came from
/// the remote command itself.
fn classify_ssh_failure(
    provider: &str,
    status: std::process::ExitStatus,
    stderr: &str,
) -> TranscriptionError {
    let detail = stderr.trim().lines().last().unwrap_or("no stderr output");
    if status.code() == Some(255) {
        TranscriptionError::network(provider, format!("ssh connection failed: {detail}"))
    } else {
        TranscriptionError::new(
            ErrorCode::TranscriptionFailed,
            provider,
            format!("remote command exited with {status}: {detail}"),
        )
    }
}

#[async_trait::async_trait]
impl Provider for SshWhisperProvider {
    fn info(&self) -> ProviderInfo {
        let mut info = type_info();
        info.name = self.name.clone();
        info
    }

    fn validate_configuration(&self) -> Result<(), TranscriptionError> {
        for (field, value) in [
            ("host", &self.settings.host),
            ("remote_binary", &self.settings.remote_binary),
            ("remote_model", &self.settings.remote_model),
        ] {
            if value.is_empty() {
                return Err(TranscriptionError::invalid_input(
                    &self.name,
                    format!("{field} is required"),
                ));
            }
        }
        Ok(())
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse, TranscriptionError> {
        let info = self.info();
        check_input_file(&self.name, &request.file_path, &info)?;

        let timeout = request.timeout.unwrap_or(self.timeout);
        let target = self.settings.target();
        let remote_path = self.remote_path(&request.file_path);
        let started = Instant::now();

        // Stage the input on the remote host
        let scp_args = vec![
            "-P".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            request.file_path.to_string_lossy().into_owned(),
            format!("{target}:{remote_path}"),
        ];
        let upload = self
            .run(&self.settings.scp_binary, &scp_args, timeout)
            .await?;
        if !upload.status.success() {
            let stderr = String::from_utf8_lossy(&upload.stderr);
            return Err(TranscriptionError::new(
                ErrorCode::FileTransferFailed,
                &self.name,
                format!(
                    "scp failed: {}",
                    stderr.trim().lines().last().unwrap_or("no stderr output")
                ),
            ));
        }

        // Run the remote binary
        let mut remote_command = format!(
            "{} -m {} -f {}",
            self.settings.remote_binary, self.settings.remote_model, remote_path
        );
        if let Some(language) = &request.language {
            remote_command.push_str(&format!(" -l {language}"));
        }
        if let Some(temperature) = request.clamped_temperature() {
            remote_command.push_str(&format!(" --temperature {temperature}"));
        }

        let mut exec_args = self.ssh_base_args();
        exec_args.push(target.clone());
        exec_args.push(remote_command);
        let result = self.run(&self.settings.ssh_binary, &exec_args, timeout).await;

        // Always try to remove the staged file, even when the run failed
        let mut cleanup_args = self.ssh_base_args();
        cleanup_args.push(target);
        cleanup_args.push(format!("rm -f {remote_path}"));
        if let Err(e) = self
            .run(&self.settings.ssh_binary, &cleanup_args, Duration::from_secs(30))
            .await
        {
            tracing::warn!(provider = %self.name, error = %e, "remote cleanup failed");
        }

        let output = result?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ssh_failure(&self.name, output.status, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (text, segments) = parse_output(&stdout);
        let text = require_text(&self.name, text)?;

        let mut response = TranscriptionResponse::new(
            text,
            request.model.clone().unwrap_or_else(|| "remote".to_string()),
        );
        response.language = request.language.clone();
        response.duration_secs = segments.last().map(|s| s.end);
        response.segments = (!segments.is_empty()).then_some(segments);
        response.processing_time = started.elapsed();
        Ok(response)
    }

    async fn health_check(&self) -> Result<(), TranscriptionError> {
        self.validate_configuration()?;
        let mut args = self.ssh_base_args();
        args.push(self.settings.target());
        args.push(format!("test -x {}", self.settings.remote_binary));
        let output = self
            .run(&self.settings.ssh_binary, &args, Duration::from_secs(15))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_ssh_failure(&self.name, output.status, &stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("host".to_string(), serde_json::json!("gpu-box")),
            ("user".to_string(), serde_json::json!("worker")),
            ("remote_binary".to_string(), serde_json::json!("/opt/whisper")),
            (
                "remote_model".to_string(),
                serde_json::json!("/opt/models/base.bin"),
            ),
        ])
    }

    #[test]
    fn test_target_formatting() {
        let settings = Settings::from_map(&base_settings());
        assert_eq!(settings.target(), "worker@gpu-box");

        let mut no_user = base_settings();
        no_user.remove("user");
        assert_eq!(Settings::from_map(&no_user).target(), "gpu-box");
    }

    #[test]
    fn test_validate_requires_core_fields() {
        for missing in ["host", "remote_binary", "remote_model"] {
            let mut settings = base_settings();
            settings.remove(missing);
            let mut config = ProviderConfig::new(PROVIDER_TYPE);
            config.settings = settings;
            let provider = SshWhisperProvider::new("ssh", &config);
            assert!(
                provider.validate_configuration().is_err(),
                "expected failure without {missing}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_ssh_failure() {
        use std::os::unix::process::ExitStatusExt;
        let conn = std::process::ExitStatus::from_raw(255 << 8);
        let err = classify_ssh_failure("ssh", conn, "Connection refused");
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.retryable);

        let remote = std::process::ExitStatus::from_raw(1 << 8);
        let err = classify_ssh_failure("ssh", remote, "segfault");
        assert_eq!(err.code, ErrorCode::TranscriptionFailed);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_transcribe_with_stub_commands() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        // Stub scp: succeed silently. Stub ssh: print a transcript for the
        // exec call, succeed silently for cleanup.
        let scp = dir.path().join("scp");
        let ssh = dir.path().join("ssh");
        std::fs::write(&scp, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(
            &ssh,
            "#!/bin/sh\nfor arg in \"$@\"; do case \"$arg\" in *rm\\ -f*) exit 0;; esac; done\necho '[00:00:00.000 --> 00:00:01.000]  hello from remote'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for bin in [&scp, &ssh] {
                std::fs::set_permissions(bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }

        let mut settings = base_settings();
        settings.insert(
            "ssh_binary".to_string(),
            serde_json::json!(ssh.to_str().unwrap()),
        );
        settings.insert(
            "scp_binary".to_string(),
            serde_json::json!(scp.to_str().unwrap()),
        );
        let mut config = ProviderConfig::new(PROVIDER_TYPE);
        config.settings = settings;
        let provider = SshWhisperProvider::new("ssh", &config);

        let response = provider
            .transcribe(&TranscriptionRequest::new(&input))
            .await
            .unwrap();
        assert_eq!(response.text, "hello from remote");
        assert_eq!(response.duration_secs, Some(1.0));
    }

    #[tokio::test]
    async fn test_failed_upload_is_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let scp = dir.path().join("scp");
        std::fs::write(&scp, "#!/bin/sh\necho 'lost connection' >&2\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&scp, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut settings = base_settings();
        settings.insert(
            "scp_binary".to_string(),
            serde_json::json!(scp.to_str().unwrap()),
        );
        let mut config = ProviderConfig::new(PROVIDER_TYPE);
        config.settings = settings;
        let provider = SshWhisperProvider::new("ssh", &config);

        let err = provider
            .transcribe(&TranscriptionRequest::new(&input))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTransferFailed);
        assert!(err.retryable);
    }
}
