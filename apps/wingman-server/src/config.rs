use std::path::PathBuf;
use std::time::Duration;

/// Queue poll period shared by the downloader and the supervisor.
pub const QUEUE_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Sentinel + monitor poll period.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum spacing between progress frames for one transfer.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(250);

/// Cancellation loop poll period.
pub const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(300);

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Effective runtime settings. Compiled defaults, overridden by `WINGMAN_*`
/// environment variables, overridden by CLI flags.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address for the control listener.
    pub bind: String,
    /// Control listener port (request/response + live channel).
    pub websocket_port: u16,
    /// Default port handed to the model runtime when a start request does
    /// not name one.
    pub inference_port: u16,
    /// Default GPU layer count for start requests that do not name one.
    pub gpu_layers: i64,
    /// Managed home directory (store, models/, data/, logs/, sentinels).
    pub home: PathBuf,
    /// Model runtime executable.
    pub runtime_bin: String,
    /// Delay after stopping a runtime child before the next may start.
    pub post_stop_delay: Duration,
    /// How long a stop/restart request waits for the active item.
    pub inference_stop_timeout: Duration,
    /// Grace window before forced task teardown at shutdown.
    pub force_shutdown_wait: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let home = std::env::var("WINGMAN_HOME").map(PathBuf::from).unwrap_or_else(|_| {
            let base = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
            base.join(".wingman")
        });
        Self {
            bind: std::env::var("WINGMAN_BIND").unwrap_or_else(|_| "127.0.0.1".into()),
            websocket_port: env_u16("WINGMAN_WEBSOCKET_PORT").unwrap_or(6568),
            inference_port: env_u16("WINGMAN_PORT").unwrap_or(6567),
            gpu_layers: std::env::var("WINGMAN_GPU_LAYERS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(-1),
            home,
            runtime_bin: std::env::var("WINGMAN_RUNTIME_BIN")
                .unwrap_or_else(|_| "wingman-runtime".into()),
            post_stop_delay: Duration::from_millis(
                env_u64("WINGMAN_POST_STOP_DELAY_MS").unwrap_or(2000),
            ),
            inference_stop_timeout: Duration::from_millis(
                env_u64("WINGMAN_STOP_TIMEOUT_MS").unwrap_or(30_000),
            ),
            force_shutdown_wait: Duration::from_millis(
                env_u64("WINGMAN_FORCE_SHUTDOWN_WAIT_MS").unwrap_or(15_000),
            ),
        }
    }
}

/// Applies `--port`, `--websocket-port`, and `--gpu-layers` (plus the
/// llama-style spellings) on top of the env-derived settings.
pub fn apply_cli_args<I>(settings: &mut Settings, args: I) -> Result<(), String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("invalid parameter for argument: {flag}"))
        };
        match arg.as_str() {
            "--port" => {
                settings.inference_port = value_for("--port")?
                    .parse()
                    .map_err(|_| "invalid parameter for argument: --port".to_string())?;
            }
            "--websocket-port" => {
                settings.websocket_port = value_for("--websocket-port")?
                    .parse()
                    .map_err(|_| "invalid parameter for argument: --websocket-port".to_string())?;
            }
            "--gpu-layers" | "-ngl" | "--n-gpu-layers" => {
                settings.gpu_layers = value_for(&arg)?
                    .parse()
                    .map_err(|_| format!("invalid parameter for argument: {arg}"))?;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{env, sync::Mutex};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn defaults_without_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("WINGMAN_WEBSOCKET_PORT");
        env::remove_var("WINGMAN_PORT");
        env::remove_var("WINGMAN_POST_STOP_DELAY_MS");
        let s = Settings::from_env();
        assert_eq!(s.websocket_port, 6568);
        assert_eq!(s.inference_port, 6567);
        assert_eq!(s.gpu_layers, -1);
        assert_eq!(s.post_stop_delay, Duration::from_millis(2000));
        assert_eq!(s.force_shutdown_wait, Duration::from_millis(15_000));
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_flags_override_settings() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut s = Settings::from_env();
        apply_cli_args(
            &mut s,
            args(&["--port", "7100", "--websocket-port", "7101", "-ngl", "33"]),
        )
        .unwrap();
        assert_eq!(s.inference_port, 7100);
        assert_eq!(s.websocket_port, 7101);
        assert_eq!(s.gpu_layers, 33);
    }

    #[test]
    fn cli_rejects_unknown_and_dangling_arguments() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut s = Settings::from_env();
        assert!(apply_cli_args(&mut s, args(&["--frobnicate"])).is_err());
        assert!(apply_cli_args(&mut s, args(&["--port"])).is_err());
        assert!(apply_cli_args(&mut s, args(&["--port", "not-a-number"])).is_err());
    }

    #[test]
    fn env_overrides_win() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WINGMAN_WEBSOCKET_PORT", "7001");
        env::set_var("WINGMAN_POST_STOP_DELAY_MS", "10");
        let s = Settings::from_env();
        assert_eq!(s.websocket_port, 7001);
        assert_eq!(s.post_stop_delay, Duration::from_millis(10));
        env::remove_var("WINGMAN_WEBSOCKET_PORT");
        env::remove_var("WINGMAN_POST_STOP_DELAY_MS");
    }
}
