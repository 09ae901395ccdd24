//! Command-line and config-file settings
//!
//! Settings come from an optional YAML file, `IAPTUNNEL_*` environment
//! variables and command-line flags. Flags and environment variables take
//! precedence over the file.

use anyhow::{Context, Result};
use clap::Args;
use iaptunnel_connection::{RelayConfig, RelayCredential};
use iaptunnel_transport::ClientCertificate;
use iaptunnel_transport_tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Relay endpoint and credential flags shared by all commands
#[derive(Args, Debug, Default, Clone)]
pub struct RelayArgs {
    /// Relay endpoint (e.g., tunnel.example.com:443)
    #[arg(long, global = true, env = "IAPTUNNEL_RELAY")]
    pub relay: Option<String>,

    /// Bearer token presented to the relay
    #[arg(long, global = true, env = "IAPTUNNEL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Client certificate chain (PEM) for mutual TLS
    #[arg(long, global = true, env = "IAPTUNNEL_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// Private key (PEM) for the client certificate
    #[arg(long, global = true, env = "IAPTUNNEL_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,

    /// CA certificate (PEM) to trust instead of the web PKI roots
    #[arg(long, global = true)]
    pub ca_cert: Option<PathBuf>,

    /// TLS server name, if different from the relay host
    #[arg(long, global = true)]
    pub server_name: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long, global = true)]
    pub insecure: bool,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub tunnel: TunnelSection,

    /// Protocol engine tuning
    #[serde(default)]
    pub connection: RelayConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay endpoint address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    /// Bearer token (prefer auth_token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Default relay policy for `start`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

/// Fully resolved settings
#[derive(Debug)]
pub struct Settings {
    pub tls: TlsConfig,
    pub credential: RelayCredential,
    pub relay_config: RelayConfig,
    pub default_policy: Option<String>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn resolve_settings(args: RelayArgs, file: ConfigFile) -> Result<Settings> {
    let relay = file.relay;

    let address = args
        .relay
        .or(relay.address)
        .context("Relay address is required (use --relay or config file)")?;

    let token = match args.token {
        Some(token) => token,
        None => match (&relay.auth_token_env, relay.auth_token) {
            (Some(env_var), _) => std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
            (None, Some(token)) => token,
            (None, None) => anyhow::bail!(
                "Bearer token is required (use --token, IAPTUNNEL_TOKEN or config file)"
            ),
        },
    };
    if token.is_empty() {
        anyhow::bail!("Bearer token must not be empty");
    }

    let mut credential = RelayCredential::bearer(token);

    let client_cert = args.client_cert.or(relay.client_cert);
    let client_key = args.client_key.or(relay.client_key);
    match (client_cert, client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(&cert_path).with_context(|| {
                format!("Failed to read client certificate: {}", cert_path.display())
            })?;
            let key = fs::read(&key_path).with_context(|| {
                format!("Failed to read client key: {}", key_path.display())
            })?;
            info!("Using client certificate {}", cert_path.display());
            credential = credential.with_client_certificate(ClientCertificate::from_pem(cert, key));
        }
        (None, None) => {}
        _ => anyhow::bail!("--client-cert and --client-key must be given together"),
    }

    let mut tls = TlsConfig::from_address(&address)
        .with_context(|| format!("Invalid relay address: {}", address))?;

    if let Some(server_name) = args.server_name.or(relay.server_name) {
        tls = tls.with_server_name(&server_name);
    }

    if let Some(ca_path) = args.ca_cert.or(relay.ca_cert) {
        tls = tls.with_root_certs(load_ca_certs(&ca_path)?);
    }

    if args.insecure || relay.insecure {
        warn!("Certificate verification disabled (insecure mode)");
        tls = tls.with_insecure_skip_verify();
    }

    let relay_config = file.connection;
    tls = tls.with_connect_timeout(relay_config.connect_timeout);
    relay_config
        .validate()
        .context("Invalid connection settings")?;

    Ok(Settings {
        tls,
        credential,
        relay_config,
        default_policy: file.tunnel.policy,
    })
}

/// DER-encoded certificates from a PEM file
fn load_ca_certs(path: &Path) -> Result<Vec<Vec<u8>>> {
    let pem = fs::read(path)
        .with_context(|| format!("Failed to read CA certificate: {}", path.display()))?;

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse CA certificate: {}", path.display()))?;

    if certs.is_empty() {
        anyhow::bail!("No certificate found in {}", path.display());
    }

    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "iaptunnel.yaml",
            r#"
relay:
  address: tunnel.example.com:443
  auth_token: file-token
tunnel:
  policy: current-user
connection:
  connect_timeout_ms: 3000
  reconnect:
    max_attempts: 10
"#,
        );

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.relay.address.as_deref(), Some("tunnel.example.com:443"));
        assert_eq!(file.tunnel.policy.as_deref(), Some("current-user"));
        assert_eq!(file.connection.connect_timeout, Duration::from_secs(3));
        assert_eq!(file.connection.reconnect.max_attempts, Some(10));
        // Unset fields keep their defaults
        assert_eq!(
            file.connection.ack_interval,
            RelayConfig::default().ack_interval
        );
    }

    #[test]
    fn test_load_config_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_file(&dir.path().join("missing.yaml")).is_err());

        let path = write_file(&dir, "bad.yaml", "relay: [not, a, map]");
        assert!(load_config_file(&path).is_err());
    }

    #[test]
    fn test_cli_takes_precedence() {
        let file = ConfigFile {
            relay: RelaySection {
                address: Some("file.example.com:443".to_string()),
                auth_token: Some("file-token".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let args = RelayArgs {
            relay: Some("cli.example.com:8443".to_string()),
            token: Some("cli-token".to_string()),
            ..Default::default()
        };

        let settings = resolve_settings(args, file).unwrap();
        assert_eq!(settings.tls.relay_host, "cli.example.com");
        assert_eq!(settings.tls.relay_port, 8443);
        assert_eq!(settings.credential.token.as_str(), "cli-token");
        assert!(settings.credential.client_certificate.is_none());
    }

    #[test]
    fn test_file_fills_missing_args() {
        let file = ConfigFile {
            relay: RelaySection {
                address: Some("file.example.com".to_string()),
                auth_token: Some("file-token".to_string()),
                server_name: Some("relay.internal".to_string()),
                ..Default::default()
            },
            tunnel: TunnelSection {
                policy: Some("any-local-user".to_string()),
            },
            ..Default::default()
        };

        let settings = resolve_settings(RelayArgs::default(), file).unwrap();
        assert_eq!(settings.tls.relay_port, 443);
        assert_eq!(settings.tls.effective_server_name(), "relay.internal");
        assert_eq!(settings.credential.token.as_str(), "file-token");
        assert_eq!(settings.default_policy.as_deref(), Some("any-local-user"));
    }

    #[test]
    fn test_token_from_named_env_var() {
        std::env::set_var("IAPTUNNEL_TEST_TOKEN_FROM_ENV", "env-token");
        let file = ConfigFile {
            relay: RelaySection {
                address: Some("relay:443".to_string()),
                auth_token_env: Some("IAPTUNNEL_TEST_TOKEN_FROM_ENV".to_string()),
                auth_token: Some("ignored".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let settings = resolve_settings(RelayArgs::default(), file).unwrap();
        assert_eq!(settings.credential.token.as_str(), "env-token");
    }

    #[test]
    fn test_missing_required_settings() {
        let no_relay = RelayArgs {
            token: Some("token".to_string()),
            ..Default::default()
        };
        assert!(resolve_settings(no_relay, ConfigFile::default()).is_err());

        let no_token = RelayArgs {
            relay: Some("relay:443".to_string()),
            ..Default::default()
        };
        assert!(resolve_settings(no_token, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_client_certificate_needs_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_file(&dir, "client.pem", "cert");
        let key = write_file(&dir, "client.key", "key");

        let half = RelayArgs {
            relay: Some("relay:443".to_string()),
            token: Some("token".to_string()),
            client_cert: Some(cert.clone()),
            ..Default::default()
        };
        assert!(resolve_settings(half, ConfigFile::default()).is_err());

        let both = RelayArgs {
            relay: Some("relay:443".to_string()),
            token: Some("token".to_string()),
            client_cert: Some(cert),
            client_key: Some(key),
            ..Default::default()
        };
        let settings = resolve_settings(both, ConfigFile::default()).unwrap();
        let certificate = settings.credential.client_certificate.unwrap();
        assert_eq!(certificate.cert_chain, b"cert");
        assert_eq!(certificate.private_key, b"key");
    }

    #[test]
    fn test_invalid_connection_settings() {
        let mut file = ConfigFile::default();
        file.connection.ack_threshold = 0;

        let args = RelayArgs {
            relay: Some("relay:443".to_string()),
            token: Some("token".to_string()),
            ..Default::default()
        };
        assert!(resolve_settings(args, file).is_err());
    }
}
