//! Command-line and environment configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::env_file::EnvFile;

/// Command-line arguments.
///
/// The flag form is preferred; the bare positional form `model [port]` is
/// accepted for compatibility with older launch scripts.
#[derive(Debug, Parser)]
#[command(name = "jota-gateway", about = "WebSocket gateway for a local language-model runtime")]
pub struct Args {
    /// Path to the GGUF model file.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Layers to offload to the GPU; -1 picks a count from free VRAM.
    #[arg(long = "gpu-layers", default_value_t = -1, allow_negative_numbers = true)]
    pub gpu_layers: i32,

    /// Context window size for each session.
    #[arg(long = "ctx-size", default_value_t = default_ctx_size())]
    pub ctx_size: u32,

    /// Run one local generation to stdout before serving.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Positional model path (alternative to --model).
    #[arg(value_name = "MODEL")]
    pub model_pos: Option<PathBuf>,

    /// Positional port (alternative to --port).
    #[arg(value_name = "PORT")]
    pub port_pos: Option<u16>,
}

/// Resolved launch settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model_path: PathBuf,
    pub port: u16,
    pub gpu_layers: i32,
    pub ctx_size: u32,
    pub prompt: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No model given: pass --model PATH or a positional model path")]
    MissingModel,
}

impl Settings {
    /// Merge flag and positional forms; flags win when both are present.
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let model_path = args
            .model
            .or(args.model_pos)
            .ok_or(ConfigError::MissingModel)?;
        let port = args.port.or(args.port_pos).unwrap_or_else(default_port);

        Ok(Self {
            model_path,
            port,
            gpu_layers: args.gpu_layers,
            ctx_size: args.ctx_size,
            prompt: args.prompt,
        })
    }
}

/// Identity and endpoint of the JotaDB credential service.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub base_url: String,
    pub service_user: String,
    pub service_key: String,
}

impl AuthSettings {
    pub fn from_env(env: &EnvFile) -> Self {
        let base_url = env
            .lookup_or("JOTA_DB_URL", default_auth_base_url())
            .trim_end_matches('/')
            .to_string();
        let service_user = env.lookup_or("JOTA_DB_USR", "");
        let service_key = env.lookup_or("JOTA_DB_SK", "");

        tracing::info!("JotaDB URL configured: {}", base_url);
        if service_user.is_empty() || service_key.is_empty() {
            tracing::warn!(
                "JOTA_DB_USR or JOTA_DB_SK is not set; JotaDB authentication requests may fail"
            );
        }

        Self {
            base_url,
            service_user,
            service_key,
        }
    }
}

// Defaults
fn default_port() -> u16 {
    3000
}
fn default_ctx_size() -> u32 {
    512
}
fn default_auth_base_url() -> &'static str {
    "https://green-house.local/api/db"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_form() {
        let args = Args::try_parse_from([
            "jota-gateway",
            "--model",
            "/models/llama.gguf",
            "--port",
            "4000",
            "--ctx-size",
            "1024",
        ])
        .unwrap();
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.model_path, PathBuf::from("/models/llama.gguf"));
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.ctx_size, 1024);
        assert_eq!(settings.gpu_layers, -1);
    }

    #[test]
    fn test_positional_form() {
        let args = Args::try_parse_from(["jota-gateway", "/models/llama.gguf", "4100"]).unwrap();
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.model_path, PathBuf::from("/models/llama.gguf"));
        assert_eq!(settings.port, 4100);
    }

    #[test]
    fn test_flag_wins_over_positional() {
        let args = Args::try_parse_from([
            "jota-gateway",
            "--model",
            "/flag.gguf",
            "/positional.gguf",
        ])
        .unwrap();
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.model_path, PathBuf::from("/flag.gguf"));
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let args = Args::try_parse_from(["jota-gateway"]).unwrap();
        assert!(matches!(
            Settings::resolve(args),
            Err(ConfigError::MissingModel)
        ));
    }

    #[test]
    fn test_default_port() {
        let args = Args::try_parse_from(["jota-gateway", "--model", "m.gguf"]).unwrap();
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.ctx_size, 512);
    }

    #[test]
    fn test_negative_gpu_layers_flag() {
        let args =
            Args::try_parse_from(["jota-gateway", "--model", "m.gguf", "--gpu-layers", "-1"])
                .unwrap();
        assert_eq!(args.gpu_layers, -1);
    }

    #[test]
    fn test_auth_settings_from_env() {
        let env = crate::env_file::EnvFile::default();
        std::env::set_var("JOTA_DB_URL", "https://db.example.com/api/");
        std::env::set_var("JOTA_DB_USR", "gateway-1");
        std::env::set_var("JOTA_DB_SK", "sk_test");

        let auth = AuthSettings::from_env(&env);
        assert_eq!(auth.base_url, "https://db.example.com/api");
        assert_eq!(auth.service_user, "gateway-1");
        assert_eq!(auth.service_key, "sk_test");

        std::env::remove_var("JOTA_DB_URL");
        std::env::remove_var("JOTA_DB_USR");
        std::env::remove_var("JOTA_DB_SK");
    }
}
