use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::sleep;
use std::time::{Duration, Instant};

use subprocess::{Popen, PopenConfig, PopenError, Redirection};

use crate::config::{Backend, ResolvedModel};

#[derive(Debug)]
pub(crate) enum ServerStatus {
    Ready,
    Failed(String),
}

/// Build the argv that starts an embedding server for `model`.
pub(crate) fn server_command(model: &ResolvedModel, host: &str) -> Vec<String> {
    let mut argv = match model.backend {
        Backend::Vllm => vec![
            "vllm".to_string(),
            "serve".to_string(),
            model.model_id.clone(),
            "--task".to_string(),
            "embed".to_string(),
        ],
        Backend::Sglang => vec![
            "python3".to_string(),
            "-m".to_string(),
            "sglang.launch_server".to_string(),
            "--model-path".to_string(),
            model.model_id.clone(),
            "--is-embedding".to_string(),
        ],
    };

    argv.push("--host".to_string());
    argv.push(host.to_string());
    argv.push("--port".to_string());
    argv.push(model.port.to_string());

    if let Some(max_model_len) = model.max_model_len {
        match model.backend {
            Backend::Vllm => argv.push("--max-model-len".to_string()),
            Backend::Sglang => argv.push("--context-length".to_string()),
        }
        argv.push(max_model_len.to_string());
    }

    argv.extend(model.extra_args.iter().cloned());
    argv
}

/// Environment for the server child: current env plus HF download tuning.
pub(crate) fn server_env() -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = env::vars_os().collect();

    // Enable hf transfer for insane download speeds
    let enable_hf_transfer = env::var("HF_HUB_ENABLE_HF_TRANSFER").unwrap_or("1".to_string());
    env.push((
        "HF_HUB_ENABLE_HF_TRANSFER".into(),
        enable_hf_transfer.into(),
    ));

    // Parse Inference API token
    if let Ok(api_token) = env::var("HF_API_TOKEN") {
        env.push(("HUGGING_FACE_HUB_TOKEN".into(), api_token.into()))
    };

    env
}

/// Supervise one embedding server: spawn it, forward its stdout, poll its
/// health endpoint until ready, then watch for crashes or shutdown.
#[allow(clippy::too_many_arguments)]
pub(crate) fn server_manager(
    model: ResolvedModel,
    host: String,
    startup_timeout: Duration,
    server_log: Option<PathBuf>,
    status_sender: mpsc::Sender<ServerStatus>,
    shutdown: Arc<Mutex<bool>>,
    _shutdown_sender: mpsc::Sender<()>,
) {
    let argv = server_command(&model, &host);
    tracing::info!("Starting {} server for {}", model.backend, model.model_id);

    let mut p = match Popen::create(
        &argv,
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Pipe,
            // Needed for the shutdown procedure
            setpgid: true,
            env: Some(server_env()),
            ..Default::default()
        },
    ) {
        Ok(p) => p,
        Err(err) => {
            if let PopenError::IoError(ref err) = err {
                if err.kind() == std::io::ErrorKind::NotFound {
                    tracing::error!("{} not found in PATH", argv[0]);
                    tracing::error!("Please install the {} backend first", model.backend);
                }
            }
            status_sender
                .send(ServerStatus::Failed(err.to_string()))
                .unwrap_or(());
            return;
        }
    };

    // Redirect STDOUT to the console, and into server.log when requested
    let server_stdout = p.stdout.take().unwrap();
    let model_id = model.model_id.clone();
    thread::spawn(move || {
        let stdout = BufReader::new(server_stdout);
        let mut log_file = server_log.and_then(|path| File::create(path).ok());
        let _span =
            tracing::span!(tracing::Level::INFO, "server", model = model_id.as_str()).entered();
        for line in stdout.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if let Some(file) = log_file.as_mut() {
                let _ = writeln!(file, "{line}");
            }
            tracing::info!("{line}");
        }
    });

    let health_url = format!("http://{host}:{}/health", model.port);
    let health = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            status_sender
                .send(ServerStatus::Failed(err.to_string()))
                .unwrap_or(());
            let _ = p.terminate();
            return;
        }
    };

    let mut ready = false;
    let start_time = Instant::now();
    let mut last_probe: Option<Instant> = None;
    let mut wait_time = Instant::now();
    loop {
        // Server exited
        if p.poll().is_some() {
            let mut err = String::new();
            if let Some(mut stderr) = p.stderr.take() {
                let _ = stderr.read_to_string(&mut err);
            }
            status_sender
                .send(ServerStatus::Failed(stderr_tail(&err)))
                .unwrap_or(());
            return;
        }

        // We received a shutdown signal
        if *shutdown.lock().unwrap() {
            let _ = p.terminate();
            let _ = p.wait_timeout(Duration::from_secs(90));
            tracing::info!("Server for {} terminated", model.model_id);
            return;
        }

        // Probe /health once per second until the server answers
        if !ready && last_probe.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
            last_probe = Some(Instant::now());
            let healthy = health
                .get(&health_url)
                .send()
                .map(|response| response.status().is_success())
                .unwrap_or(false);
            if healthy {
                tracing::info!(
                    "Server for {} ready in {:?}",
                    model.model_id,
                    start_time.elapsed()
                );
                status_sender.send(ServerStatus::Ready).unwrap_or(());
                ready = true;
            } else if start_time.elapsed() > startup_timeout {
                status_sender
                    .send(ServerStatus::Failed(format!(
                        "server did not become healthy within {startup_timeout:?}"
                    )))
                    .unwrap_or(());
                let _ = p.terminate();
                let _ = p.wait_timeout(Duration::from_secs(90));
                return;
            } else if wait_time.elapsed() > Duration::from_secs(10) {
                tracing::info!("Waiting for {} to be ready...", model.model_id);
                wait_time = Instant::now();
            }
        }
        sleep(Duration::from_millis(100));
    }
}

pub(crate) fn shutdown_server(shutdown: Arc<Mutex<bool>>, shutdown_receiver: &mpsc::Receiver<()>) {
    tracing::info!("Shutting down server");
    // Picked up by the server manager loop
    {
        let mut shutdown = shutdown.lock().unwrap();
        *shutdown = true;
    }

    // Blocks until all shutdown_sender clones are dropped
    let _ = shutdown_receiver.recv();
}

pub(crate) fn port_in_use(host: &str, port: u16) -> bool {
    let address = match format!("{host}:{port}").to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(address) => address,
            None => return false,
        },
        Err(_) => return false,
    };
    TcpStream::connect_timeout(&address, Duration::from_millis(500)).is_ok()
}

/// Wait for the server's port to close after teardown so the next model does
/// not race a dying process for it.
pub(crate) fn wait_port_released(host: &str, port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !port_in_use(host, port) {
            return true;
        }
        sleep(Duration::from_millis(250));
    }
    false
}

/// Last few lines of the child's stderr, enough context without megabytes of
/// python traceback.
fn stderr_tail(err: &str) -> String {
    let lines: Vec<&str> = err.lines().collect();
    let start = lines.len().saturating_sub(20);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(backend: Backend) -> ResolvedModel {
        ResolvedModel {
            model_id: "BAAI/bge-large-en-v1.5".to_string(),
            backend,
            port: 8000,
            max_model_len: Some(512),
            extra_args: vec!["--dtype".to_string(), "float16".to_string()],
            chunk_sizes: vec![512],
        }
    }

    #[test]
    fn vllm_command_shape() {
        let argv = server_command(&model(Backend::Vllm), "127.0.0.1");
        assert_eq!(
            argv,
            vec![
                "vllm",
                "serve",
                "BAAI/bge-large-en-v1.5",
                "--task",
                "embed",
                "--host",
                "127.0.0.1",
                "--port",
                "8000",
                "--max-model-len",
                "512",
                "--dtype",
                "float16",
            ]
        );
    }

    #[test]
    fn sglang_command_shape() {
        let argv = server_command(&model(Backend::Sglang), "0.0.0.0");
        assert_eq!(argv[0..3], ["python3", "-m", "sglang.launch_server"]);
        assert!(argv.contains(&"--is-embedding".to_string()));
        assert!(argv.contains(&"--context-length".to_string()));
        assert!(!argv.contains(&"--max-model-len".to_string()));
    }

    #[test]
    fn stderr_tail_truncates() {
        let long: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&long);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.ends_with("line 99"));
    }
}
